// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # valkit: Validator Operator Toolkit
//!
//! The engines behind the `valkit` binary. valkit never joins consensus and
//! owns no chain state: the node binary does the real work, and this crate
//! orchestrates everything around it. Configure from a live network, fast-start
//! from a compressed snapshot, keep our own binary current, and watch the node
//! through a terminal dashboard.
//!
//! ## Architecture
//!
//! - **error**: Coded errors with a fixed process exit-code mapping.
//! - **config**: Every constant and default in one place, plus the home layout.
//! - **integrity**: SHA-256 of files and checksum manifest parsing.
//! - **archive**: Safe `tar.lz4` extraction. Refuses to write outside the destination.
//! - **snapshot**: Content-addressed cache, resumable download, install with
//!   `priv_validator_state.json` preservation.
//! - **rpc**: Typed client for the node's HTTP JSON-RPC.
//! - **trust**: Light-client trust parameters from a remote RPC.
//! - **node_config**: Line-oriented rewriter for the node's `config.toml`.
//! - **peers**: Peer address model, discovery and the periodic refresher.
//! - **bootstrap**: One-shot initialization pipeline.
//! - **process**: Subprocess runner and node supervisor capabilities.
//! - **validator**: Staking queries and transactions via the node CLI.
//! - **metrics**: Unified system/chain/node snapshot with background CPU sampling.
//! - **ringbuf** / **tailer**: Bounded log buffer and a rotation-tolerant tailer.
//! - **dashboard**: Message-loop runtime, layout engine and panels.
//! - **update**: Self-update with checksum verification and atomic swap.
//!
//! The crate targets Unix hosts: file modes, symlinks and signals are part of
//! the contract with the node.

pub mod archive;
pub mod bootstrap;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod integrity;
pub mod metrics;
pub mod node_config;
pub mod peers;
pub mod process;
pub mod ringbuf;
pub mod rpc;
pub mod snapshot;
pub mod tailer;
pub mod trust;
pub mod update;
pub mod validator;

mod fsutil;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{code_for_error, Error, ErrorCode, Result};
pub use fsutil::{available_space, format_bytes};
