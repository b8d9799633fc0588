//! # Constants, Defaults & Home Layout
//!
//! Every tunable number valkit relies on lives here. Subsystems take typed
//! options structs whose `Default` impls read from these constants, so the
//! values below are what an operator gets unless a flag says otherwise.

use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Tool Identity
// ---------------------------------------------------------------------------

/// Binary name, also the prefix of release asset names.
pub const TOOL_NAME: &str = "valkit";

/// Version baked in at compile time.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default node binary name, resolved through `PATH`.
pub const DEFAULT_NODE_BINARY: &str = "valkitd";

/// Default moniker passed to `<bin> init` when none is given.
pub const DEFAULT_MONIKER: &str = "valkit-node";

/// Default staking denomination.
pub const DEFAULT_DENOM: &str = "uval";

// ---------------------------------------------------------------------------
// Node Endpoints
// ---------------------------------------------------------------------------

/// Local node RPC endpoint.
pub const DEFAULT_LOCAL_RPC: &str = "http://127.0.0.1:26657";

/// Default P2P port used when composing `id@host:port` for RPC hosts.
pub const DEFAULT_P2P_PORT: u16 = 26656;

/// Per-call RPC timeout.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Peers announced through `net_info` with this host are unreachable.
pub const UNSPECIFIED_HOST: &str = "0.0.0.0";

/// Maximum peers taken from one `net_info` discovery pass.
pub const MAX_DISCOVERED_PEERS: usize = 4;

/// Seeds used when neither `net_info` nor `status` yield a peer.
pub const FALLBACK_SEEDS: [&str; 2] = [
    "3f2c1e8a9b7d6c5e4f3a2b1c0d9e8f7a6b5c4d3e@seed-1.valkit.network:26656",
    "8e7d6c5b4a3f2e1d0c9b8a7f6e5d4c3b2a1f0e9d@seed-2.valkit.network:26656",
];

/// Second light-client witness appended when only one RPC server answers.
pub const FALLBACK_RPC_SERVER: &str = "https://rpc-2.valkit.network:443";

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Snapshots are produced every this many blocks.
pub const SNAPSHOT_INTERVAL: i64 = 1_000;

/// Trust candidates step this many intervals back from the tip before probing.
pub const TRUST_LAG_INTERVALS: i64 = 9;

/// Number of candidate heights probed by the trust provider.
pub const TRUST_CANDIDATES: i64 = 5;

/// Inner retries for a single trust RPC, with linear backoff.
pub const TRUST_RPC_ATTEMPTS: u32 = 3;
pub const TRUST_RPC_BACKOFF_STEP: Duration = Duration::from_millis(100);

/// Trust period written to `[statesync]`: two weeks.
pub const TRUST_PERIOD: Duration = Duration::from_secs(336 * 3600);

/// Download attempts: the initial one plus three retries.
pub const DOWNLOAD_ATTEMPTS: u32 = 4;
pub const DOWNLOAD_INITIAL_BACKOFF: Duration = Duration::from_secs(2);
pub const DOWNLOAD_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// lz4-compressed chain data expands roughly this much on disk.
pub const EXTRACT_SPACE_FACTOR: u64 = 4;

pub const SNAPSHOT_TARBALL: &str = "latest.tar.lz4";
pub const SNAPSHOT_CHECKSUM: &str = "latest.tar.lz4.sha256";

/// Light-client reachability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(6);
pub const PROBE_ATTEMPTS: u32 = 2;
pub const PROBE_RETRY_DELAY: Duration = Duration::from_millis(300);

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

/// Tick interval while the node is catching up.
pub const REFRESH_CATCHING_UP: Duration = Duration::from_secs(1);

/// Tick interval once the node is in sync.
pub const REFRESH_IN_SYNC: Duration = Duration::from_secs(5);

/// A snapshot older than this is flagged stale after a failed fetch.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

/// Node version string cache lifetime.
pub const VERSION_TTL: Duration = Duration::from_secs(300);

/// Validator list and own-validator cache lifetime.
pub const VALIDATOR_TTL: Duration = Duration::from_secs(30);

/// Per-validator reward fetch timeout.
pub const REWARD_TIMEOUT: Duration = Duration::from_secs(15);

/// Validators shown per page.
pub const VALIDATOR_PAGE_SIZE: usize = 10;

/// Spinner redraw cadence while waiting for the first snapshot.
pub const SPINNER_INTERVAL: Duration = Duration::from_millis(100);

/// Log viewer ring-buffer capacity and initial backlog.
pub const LOG_BUFFER_LINES: usize = 500;
pub const LOG_BACKLOG_LINES: usize = 100;

/// Longest log line kept before truncation.
pub const LOG_MAX_LINE_BYTES: usize = 512 * 1024;

/// CPU sampling resolution for the metrics collector.
pub const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// `doctor` warns below this much free space under the node home.
pub const DOCTOR_MIN_FREE_BYTES: u64 = 20 * 1024 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Peer Refresh
// ---------------------------------------------------------------------------

pub const PEER_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
pub const PEER_REFRESH_MIN_INTERVAL: Duration = Duration::from_secs(60);
pub const PEER_REFRESH_MAX_INTERVAL: Duration = Duration::from_secs(3600);
pub const PEER_REFRESH_MIN_PEERS: usize = 3;
pub const PEER_REFRESH_MAX_PEERS: usize = 10;

// ---------------------------------------------------------------------------
// Self-Update
// ---------------------------------------------------------------------------

/// Release index consulted by `valkit update`.
pub const RELEASE_INDEX_URL: &str =
    "https://api.github.com/repos/alissonlinneker/valkit/releases/latest";

/// Name of the checksum manifest attached to each release.
pub const RELEASE_CHECKSUMS: &str = "checksums.txt";

/// How long a cached update check stays fresh.
pub const UPDATE_CHECK_TTL: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Home Layout
// ---------------------------------------------------------------------------

/// Paths below the home directory. The tool owns `snapshot-cache/`,
/// `.update-check` and `.initial_state_sync`; the node owns the rest at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeLayout {
    root: PathBuf,
}

impl HomeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    pub fn genesis_file(&self) -> PathBuf {
        self.config_dir().join("genesis.json")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn priv_validator_state(&self) -> PathBuf {
        self.data_dir().join("priv_validator_state.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn node_log(&self) -> PathBuf {
        self.logs_dir().join("node.log")
    }

    pub fn tool_log(&self) -> PathBuf {
        self.logs_dir().join("valkit.log")
    }

    pub fn snapshot_cache_dir(&self) -> PathBuf {
        self.root.join("snapshot-cache")
    }

    pub fn update_check_file(&self) -> PathBuf {
        self.root.join(".update-check")
    }

    pub fn initial_state_sync_marker(&self) -> PathBuf {
        self.root.join(".initial_state_sync")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("node.pid")
    }
}

/// Expands a leading `~` to `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Accepts a bare domain or a full URL and returns a base URL without a
/// trailing slash. Bare domains default to HTTPS.
pub fn base_url(domain_or_url: &str) -> String {
    let trimmed = domain_or_url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}
