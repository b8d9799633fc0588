//! # CLI Interface
//!
//! The `valkit` command tree, defined with `clap` derive. Options shared by
//! every command are global and read `VALKIT_*` environment variables.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::LogFormat;

/// Operator toolkit for a validator node.
///
/// Bootstraps the node from a live network, installs snapshots, keeps the
/// node and this binary running and current, and shows a live dashboard.
#[derive(Parser, Debug)]
#[command(name = "valkit", about = "Validator node operator toolkit", version, propagate_version = true)]
pub struct ValkitCli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Node home directory.
    #[arg(long, global = true, env = "VALKIT_HOME", default_value = "~/.valkit")]
    pub home: PathBuf,

    /// Node binary, resolved on PATH.
    #[arg(long, global = true, env = "VALKIT_NODE_BIN", default_value = valkit_core::config::DEFAULT_NODE_BINARY)]
    pub node_bin: String,

    /// Local node RPC endpoint.
    #[arg(long, global = true, env = "VALKIT_RPC", default_value = valkit_core::config::DEFAULT_LOCAL_RPC)]
    pub rpc: String,

    /// Log output format.
    #[arg(long, global = true, env = "VALKIT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configure a fresh node home from a live network.
    Init(InitArgs),
    /// Manage the local snapshot cache.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Live terminal dashboard.
    Dashboard(DashboardArgs),
    /// Print one metrics snapshot.
    Status(StatusArgs),
    /// Start the node in the background.
    Start,
    /// Stop the node.
    Stop(StopArgs),
    /// Stop, then start the node.
    Restart(StopArgs),
    /// Update this binary to the latest release.
    Update(UpdateArgs),
    /// Inspect or refresh persistent peers.
    Peers(PeersArgs),
    /// Create the validator from the local key.
    RegisterValidator(RegisterArgs),
    /// Delegate tokens to a validator.
    Delegate(DelegateArgs),
    /// Withdraw staking rewards and commission.
    WithdrawRewards(WithdrawArgs),
    /// Unjail the local validator.
    Unjail(TxArgs),
    /// Vote on a governance proposal.
    Vote(VoteArgs),
    /// Check the node home, binary, RPC and disk.
    Doctor,
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Chain id to initialize for.
    #[arg(long, env = "VALKIT_CHAIN_ID")]
    pub chain_id: String,

    /// Domain or URL of an RPC serving genesis and peers.
    #[arg(long, env = "VALKIT_GENESIS_DOMAIN")]
    pub genesis_domain: String,

    #[arg(long, default_value = valkit_core::config::DEFAULT_MONIKER)]
    pub moniker: String,

    #[arg(long, default_value = valkit_core::config::DEFAULT_DENOM)]
    pub denom: String,

    /// State-sync RPC witnesses, primary first.
    #[arg(long = "snapshot-rpc", env = "VALKIT_SNAPSHOT_RPC", value_delimiter = ',')]
    pub snapshot_rpcs: Vec<String>,

    /// Install this snapshot after configuring.
    #[arg(long, env = "VALKIT_SNAPSHOT_URL")]
    pub snapshot_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCommand {
    /// Download (or resume) the snapshot into the cache.
    Download(SnapshotDownloadArgs),
    /// Replace the node data directory with the cached snapshot.
    Extract(SnapshotExtractArgs),
    /// Show cache state, optionally against the remote.
    Status(SnapshotStatusArgs),
}

#[derive(Args, Debug)]
pub struct SnapshotDownloadArgs {
    /// Snapshot host base URL.
    #[arg(long, env = "VALKIT_SNAPSHOT_URL")]
    pub url: String,

    /// Download even when the cache is current.
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Args, Debug)]
pub struct SnapshotExtractArgs {
    /// Target directory. Defaults to `<home>/data`.
    #[arg(long)]
    pub target: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SnapshotStatusArgs {
    /// Compare the cache against this snapshot host.
    #[arg(long, env = "VALKIT_SNAPSHOT_URL")]
    pub url: Option<String>,
}

#[derive(Args, Debug)]
pub struct DashboardArgs {
    /// Remote RPC for network height and latency.
    #[arg(long, env = "VALKIT_REMOTE_RPC")]
    pub remote_rpc: Option<String>,

    /// Show validators through the node CLI.
    #[arg(long)]
    pub validators: bool,

    #[command(flatten)]
    pub tx: TxArgs,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print JSON.
    #[arg(long, conflicts_with = "prometheus")]
    pub json: bool,

    /// Print Prometheus text exposition.
    #[arg(long)]
    pub prometheus: bool,

    /// Remote RPC for network height and latency.
    #[arg(long, env = "VALKIT_REMOTE_RPC")]
    pub remote_rpc: Option<String>,

    /// Exit 42 if the node is catching up and its height does not move
    /// within this many seconds.
    #[arg(long, value_name = "SECS")]
    pub stuck_after: Option<u64>,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Seconds to wait after SIGTERM before SIGKILL.
    #[arg(long, default_value_t = 30)]
    pub grace: u64,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Only report whether an update exists.
    #[arg(long, conflicts_with = "rollback")]
    pub check: bool,

    /// Restore the binary saved by the last update.
    #[arg(long)]
    pub rollback: bool,

    /// Ignore the cached check.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct PeersArgs {
    #[command(subcommand)]
    pub command: Option<PeersCommand>,
}

#[derive(Subcommand, Debug)]
pub enum PeersCommand {
    /// Show connected and configured peers.
    List,
    /// Top up persistent peers once if below the minimum.
    Refresh(PeerRefreshArgs),
    /// Keep topping up persistent peers until interrupted.
    Watch(PeerWatchArgs),
}

#[derive(Args, Debug)]
pub struct PeerRefreshArgs {
    /// RPC to discover peers from.
    #[arg(long, env = "VALKIT_GENESIS_DOMAIN")]
    pub genesis_domain: String,

    #[arg(long, default_value_t = valkit_core::config::PEER_REFRESH_MIN_PEERS)]
    pub min_peers: usize,

    #[arg(long, default_value_t = valkit_core::config::PEER_REFRESH_MAX_PEERS)]
    pub max_peers: usize,
}

#[derive(Args, Debug)]
pub struct PeerWatchArgs {
    #[command(flatten)]
    pub refresh: PeerRefreshArgs,

    /// Seconds between checks, clamped to one minute .. one hour.
    #[arg(long, default_value_t = 300)]
    pub interval: u64,
}

/// Key and chain options for node CLI transactions.
#[derive(Args, Debug, Clone)]
pub struct TxArgs {
    /// Keyring key that signs.
    #[arg(long, env = "VALKIT_KEY", default_value = "validator")]
    pub key: String,

    /// Chain id. Read from the local node when omitted.
    #[arg(long, env = "VALKIT_CHAIN_ID")]
    pub chain_id: Option<String>,

    #[arg(long, default_value = "test")]
    pub keyring_backend: String,

    /// Fees, e.g. `5000uval`.
    #[arg(long)]
    pub fees: Option<String>,
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    #[arg(long, default_value = valkit_core::config::DEFAULT_MONIKER)]
    pub moniker: String,

    /// Self-delegation in base denomination.
    #[arg(long)]
    pub amount: u128,

    #[arg(long, default_value = "0.10")]
    pub commission_rate: String,

    #[arg(long)]
    pub details: Option<String>,

    #[arg(long)]
    pub website: Option<String>,

    #[command(flatten)]
    pub tx: TxArgs,
}

#[derive(Args, Debug)]
pub struct DelegateArgs {
    /// Validator operator address.
    pub operator: String,

    /// Amount in base denomination.
    pub amount: u128,

    #[command(flatten)]
    pub tx: TxArgs,
}

#[derive(Args, Debug)]
pub struct WithdrawArgs {
    /// Validator operator address. Defaults to our own validator.
    #[arg(long)]
    pub operator: Option<String>,

    #[command(flatten)]
    pub tx: TxArgs,
}

#[derive(Args, Debug)]
pub struct VoteArgs {
    pub proposal_id: u64,

    /// yes, no, abstain or no_with_veto.
    pub option: String,

    #[command(flatten)]
    pub tx: TxArgs,
}
