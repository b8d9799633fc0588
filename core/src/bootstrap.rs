//! # Bootstrap Pipeline
//!
//! One-shot initialization of a node home from a live network. Every step is
//! either idempotent or guarded, so a failed run can simply be repeated.
//!
//! | # | Step | On failure |
//! |---|------|------------|
//! | 1 | create `config/` and `logs/` | fatal |
//! | 2 | `<bin> init` when `config.toml` is missing | fatal |
//! | 3 | fetch genesis into `config/genesis.json` | fatal |
//! | 4 | discover peers from the genesis RPC | falls back to seeds |
//! | 5 | add the snapshot RPC nodes as peers | skipped per RPC |
//! | 6 | commit `persistent_peers` | fatal |
//! | 7 | ensure `data/priv_validator_state.json` | fatal |
//! | 8 | trust parameters from the snapshot RPC | fatal |
//! | 9 | pick two state-sync witnesses | fatal when none answers |
//! | 10 | back up config, enable state sync | backup best-effort |
//! | 11 | `<bin> tendermint unsafe-reset-all` | best-effort |
//! | 12 | write `.initial_state_sync` | best-effort |
//!
//! With a snapshot URL the pipeline continues: download and install the
//! snapshot into `data/`, then turn state sync off again since state is
//! already present.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    base_url, HomeLayout, DEFAULT_DENOM, DEFAULT_MONIKER, DEFAULT_NODE_BINARY, FALLBACK_RPC_SERVER,
    PROBE_ATTEMPTS, PROBE_RETRY_DELAY, PROBE_TIMEOUT, RPC_TIMEOUT, TRUST_PERIOD,
};
use crate::error::{Error, ErrorCode, Result};
use crate::fsutil::{create_dir_all_mode, write_atomic, write_with_mode};
use crate::node_config::{NodeConfig, StateSyncParams};
use crate::peers::{dedup_preserving_order, rpc_host_peer, PeerDiscovery};
use crate::process::ProcessRunner;
use crate::rpc::RpcClient;
use crate::snapshot::{DownloadOptions, SnapshotService};
use crate::trust::{TrustOptions, TrustParams, TrustProvider};

/// Fresh signing state for a validator that has never signed.
pub const EMPTY_SIGNING_STATE: &str = "{\n  \"height\": \"0\",\n  \"round\": 0,\n  \"step\": 0\n}\n";

/// Progress callback: `(step, total_steps, description)`.
pub type BootstrapProgress = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

#[derive(Clone)]
pub struct BootstrapOptions {
    pub home: PathBuf,
    pub chain_id: String,
    pub moniker: String,
    pub denom: String,
    /// Domain or URL of an RPC serving `/genesis` and `/net_info`.
    pub genesis_domain: String,
    pub node_binary: String,
    /// Primary then secondary RPC used for trust parameters and as
    /// state-sync witnesses. Empty means the genesis RPC.
    pub snapshot_rpcs: Vec<String>,
    /// Witness appended when only one candidate answers the probe.
    pub fallback_rpc_server: String,
    /// Install this snapshot after configuring.
    pub snapshot_url: Option<String>,
    pub rpc_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_attempts: u32,
    pub probe_retry_delay: Duration,
    pub trust: TrustOptions,
    pub trust_period: Duration,
    pub progress: Option<BootstrapProgress>,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            home: PathBuf::new(),
            chain_id: String::new(),
            moniker: DEFAULT_MONIKER.to_string(),
            denom: DEFAULT_DENOM.to_string(),
            genesis_domain: String::new(),
            node_binary: DEFAULT_NODE_BINARY.to_string(),
            snapshot_rpcs: Vec::new(),
            fallback_rpc_server: FALLBACK_RPC_SERVER.to_string(),
            snapshot_url: None,
            rpc_timeout: RPC_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
            probe_attempts: PROBE_ATTEMPTS,
            probe_retry_delay: PROBE_RETRY_DELAY,
            trust: TrustOptions::default(),
            trust_period: TRUST_PERIOD,
            progress: None,
        }
    }
}

impl std::fmt::Debug for BootstrapOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapOptions")
            .field("home", &self.home)
            .field("chain_id", &self.chain_id)
            .field("moniker", &self.moniker)
            .field("genesis_domain", &self.genesis_domain)
            .field("snapshot_rpcs", &self.snapshot_rpcs)
            .field("snapshot_url", &self.snapshot_url)
            .finish_non_exhaustive()
    }
}

impl BootstrapOptions {
    /// Checks required inputs and fills blank defaults.
    pub fn validated(mut self) -> Result<Self> {
        if self.home.as_os_str().is_empty() {
            return Err(Error::invalid_args("home directory is required"));
        }
        if self.chain_id.trim().is_empty() {
            return Err(Error::invalid_args("chain id is required"));
        }
        if self.genesis_domain.trim().is_empty() {
            return Err(Error::invalid_args("genesis RPC domain is required"));
        }
        if self.moniker.trim().is_empty() {
            self.moniker = DEFAULT_MONIKER.to_string();
        }
        if self.denom.trim().is_empty() {
            self.denom = DEFAULT_DENOM.to_string();
        }
        if self.node_binary.trim().is_empty() {
            self.node_binary = DEFAULT_NODE_BINARY.to_string();
        }
        Ok(self)
    }
}

/// What a bootstrap run committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub peers: Vec<String>,
    pub trust: TrustParams,
    pub rpc_servers: Vec<String>,
    pub config_backup: Option<PathBuf>,
    pub snapshot_installed: bool,
}

pub struct Bootstrapper {
    runner: Arc<dyn ProcessRunner>,
    options: BootstrapOptions,
    layout: HomeLayout,
}

impl Bootstrapper {
    pub fn new(runner: Arc<dyn ProcessRunner>, options: BootstrapOptions) -> Result<Self> {
        let options = options.validated()?;
        let layout = HomeLayout::new(&options.home);
        Ok(Self {
            runner,
            options,
            layout,
        })
    }

    fn total_steps(&self) -> usize {
        if self.options.snapshot_url.is_some() {
            13
        } else {
            12
        }
    }

    fn step(&self, n: usize, description: &str) {
        info!(step = n, total = self.total_steps(), "{description}");
        if let Some(progress) = &self.options.progress {
            progress(n, self.total_steps(), description);
        }
    }

    fn rpc(&self, base: &str) -> Result<RpcClient> {
        RpcClient::with_timeout(&base_url(base), self.options.rpc_timeout)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<BootstrapReport> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled("bootstrap")),
            r = self.run_steps(cancel) => r,
        }
    }

    async fn run_steps(&self, cancel: &CancellationToken) -> Result<BootstrapReport> {
        let opts = &self.options;
        let home_arg = opts.home.display().to_string();
        let config = NodeConfig::new(self.layout.config_file());
        let genesis_rpc = self.rpc(&opts.genesis_domain)?;
        let snapshot_rpcs: Vec<RpcClient> = if opts.snapshot_rpcs.is_empty() {
            vec![genesis_rpc.clone()]
        } else {
            opts.snapshot_rpcs
                .iter()
                .map(|url| self.rpc(url))
                .collect::<Result<_>>()?
        };

        self.step(1, "creating home directories");
        for dir in [self.layout.config_dir(), self.layout.logs_dir()] {
            create_dir_all_mode(&dir, 0o755)
                .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
        }

        self.step(2, "initializing node configuration");
        if !config.exists() {
            let args = vec![
                "init".to_string(),
                opts.moniker.clone(),
                format!("--chain-id={}", opts.chain_id),
                format!("--default-denom={}", opts.denom),
                format!("--home={home_arg}"),
                "--overwrite".to_string(),
            ];
            self.runner.run(&opts.node_binary, &args).await?;
            if !config.exists() {
                debug!("node init left no config.toml, creating an empty one");
                write_atomic(config.path(), b"", 0o644)
                    .map_err(|e| Error::io("create config.toml", e))?;
            }
        }

        self.step(3, "fetching genesis");
        let genesis = genesis_rpc.genesis().await?;
        let rendered = serde_json::to_vec_pretty(&genesis)
            .map_err(|e| Error::wrap(ErrorCode::GeneralError, "encode genesis", e))?;
        write_atomic(&self.layout.genesis_file(), &rendered, 0o644)
            .map_err(|e| Error::io("write genesis.json", e))?;

        self.step(4, "discovering peers");
        let discovered = PeerDiscovery::new(genesis_rpc.clone()).discover().await;

        self.step(5, "adding snapshot RPC nodes as peers");
        let mut candidates: Vec<String> = discovered.iter().map(ToString::to_string).collect();
        for rpc in &snapshot_rpcs {
            match rpc_host_peer(rpc).await {
                Some(peer) => candidates.push(peer.to_string()),
                None => warn!(rpc = %rpc.base(), "could not resolve snapshot RPC node id"),
            }
        }
        let peers = dedup_preserving_order(candidates);

        self.step(6, "writing persistent peers");
        config.set_persistent_peers(&peers)?;

        self.step(7, "ensuring validator signing state");
        self.ensure_signing_state()?;

        self.step(8, "computing trust parameters");
        let trust = TrustProvider::new(snapshot_rpcs.clone(), opts.trust.clone())
            .fetch(cancel)
            .await?;

        self.step(9, "selecting state sync RPC servers");
        let rpc_servers = self.select_witnesses(&snapshot_rpcs).await?;

        self.step(10, "enabling state sync");
        let config_backup = match config.backup() {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e.chain_string(), "config backup failed, continuing");
                None
            }
        };
        config.enable_state_sync(&StateSyncParams {
            trust_height: trust.height,
            trust_hash: trust.hash.clone(),
            rpc_servers: rpc_servers.clone(),
            trust_period: opts.trust_period,
        })?;

        self.step(11, "resetting node data");
        let reset = vec![
            "tendermint".to_string(),
            "unsafe-reset-all".to_string(),
            "--home".to_string(),
            home_arg.clone(),
            "--keep-addr-book".to_string(),
        ];
        if let Err(e) = self.runner.run(&opts.node_binary, &reset).await {
            warn!(error = %e.chain_string(), "unsafe-reset-all failed, continuing");
        }

        self.step(12, "recording initial state sync");
        let stamp = chrono::Utc::now().to_rfc3339();
        if let Err(e) = write_atomic(&self.layout.initial_state_sync_marker(), stamp.as_bytes(), 0o644) {
            warn!(error = %e, "could not write state sync marker");
        }

        let mut snapshot_installed = false;
        if let Some(url) = &opts.snapshot_url {
            self.step(13, "installing snapshot");
            let service = SnapshotService::new()?;
            service
                .download(url, &opts.home, &DownloadOptions::default(), cancel)
                .await?;
            service
                .extract(&opts.home, &self.layout.data_dir(), None)
                .await?;
            config.disable_state_sync()?;
            snapshot_installed = true;
        }

        info!(peers = peers.len(), trust_height = trust.height, "bootstrap complete");
        Ok(BootstrapReport {
            peers,
            trust,
            rpc_servers,
            config_backup,
            snapshot_installed,
        })
    }

    fn ensure_signing_state(&self) -> Result<()> {
        let path = self.layout.priv_validator_state();
        if path.exists() {
            return Ok(());
        }
        create_dir_all_mode(&self.layout.data_dir(), 0o700)
            .map_err(|e| Error::io("create data directory", e))?;
        write_with_mode(&path, EMPTY_SIGNING_STATE.as_bytes(), 0o600)
            .map_err(|e| Error::io(format!("write {}", path.display()), e))
    }

    /// Probes every candidate and returns at least two witnesses.
    async fn select_witnesses(&self, candidates: &[RpcClient]) -> Result<Vec<String>> {
        let mut alive = Vec::new();
        for rpc in candidates {
            if self.probe(rpc).await {
                alive.push(rpc.base().to_string());
            }
        }
        let mut alive = dedup_preserving_order(alive);
        match alive.len() {
            0 => Err(Error::network("no state sync RPC server answered the probe")),
            1 => {
                debug!(fallback = %self.options.fallback_rpc_server, "adding fallback witness");
                alive.push(self.options.fallback_rpc_server.clone());
                Ok(alive)
            }
            _ => Ok(alive),
        }
    }

    async fn probe(&self, rpc: &RpcClient) -> bool {
        let attempts = self.options.probe_attempts.max(1);
        for attempt in 1..=attempts {
            match rpc.probe(self.options.probe_timeout).await {
                Ok(()) => return true,
                Err(e) => debug!(rpc = %rpc.base(), attempt, error = %e, "probe failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.probe_retry_delay).await;
            }
        }
        false
    }
}
