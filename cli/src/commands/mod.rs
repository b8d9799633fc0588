//! Command handlers. Each returns `anyhow::Result`; errors from the core keep
//! their code through the context chain so `main` can map the exit status.

pub mod dashboard;
pub mod doctor;
pub mod init;
pub mod node;
pub mod peers;
pub mod snapshot;
pub mod status;
pub mod update;
pub mod validator;

use std::sync::Arc;

use anyhow::{Context as _, Result};

use valkit_core::config::{expand_home, HomeLayout, TOOL_NAME, TOOL_VERSION};
use valkit_core::process::{ProcessRunner, SystemRunner};
use valkit_core::rpc::RpcClient;
use valkit_core::validator::NodeCliValidator;

use crate::cli::{GlobalArgs, TxArgs};

/// What every command needs: where the node lives and how to reach it.
pub struct Context {
    pub layout: HomeLayout,
    pub node_bin: String,
    pub rpc: String,
    pub runner: Arc<dyn ProcessRunner>,
}

impl Context {
    pub fn from_args(global: &GlobalArgs) -> Self {
        Self {
            layout: HomeLayout::new(expand_home(&global.home)),
            node_bin: global.node_bin.clone(),
            rpc: global.rpc.clone(),
            runner: Arc::new(SystemRunner::new()),
        }
    }

    pub fn home(&self) -> &std::path::Path {
        self.layout.root()
    }

    pub fn local_rpc(&self) -> Result<RpcClient> {
        RpcClient::new(&self.rpc).with_context(|| format!("invalid RPC endpoint {}", self.rpc))
    }

    /// Node CLI transactor for `tx`. Without an explicit chain id the local
    /// node is asked for its network.
    pub async fn validator(&self, tx: &TxArgs) -> Result<NodeCliValidator> {
        let chain_id = match &tx.chain_id {
            Some(id) => id.clone(),
            None => {
                let status = self
                    .local_rpc()?
                    .status()
                    .await
                    .map_err(valkit_core::Error::from)
                    .context("chain id not given and the local node did not report one")?;
                status.network
            }
        };
        let mut validator = NodeCliValidator::new(
            Arc::clone(&self.runner),
            &self.node_bin,
            self.home(),
            &tx.key,
            &chain_id,
        )
        .with_node(&self.rpc)
        .with_keyring_backend(&tx.keyring_backend);
        if let Some(fees) = &tx.fees {
            validator = validator.with_fees(fees);
        }
        Ok(validator)
    }
}

pub fn version() {
    println!("{TOOL_NAME} {TOOL_VERSION}");
    let (os, arch) = valkit_core::update::platform();
    println!("platform {os}/{arch}");
}

/// Cancelled on SIGINT or SIGTERM, whichever comes first.
pub fn shutdown_token() -> tokio_util::sync::CancellationToken {
    let token = tokio_util::sync::CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        tracing::info!("shutdown signal received");
        trigger.cancel();
    });
    token
}
