//! # Peers
//!
//! Peer addresses, discovery over JSON-RPC, and the periodic refresher that
//! keeps `persistent_peers` populated while the node runs.
//!
//! Discovery order for a fresh node:
//!
//! 1. `/net_info` on the genesis RPC, filtered (no `0.0.0.0` listeners, no
//!    empty ids or IPs) and capped.
//! 2. If nothing survives, the queried RPC host itself via `/status`.
//! 3. Failing that, the built-in seed hosts.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_P2P_PORT, FALLBACK_SEEDS, MAX_DISCOVERED_PEERS, PEER_REFRESH_INTERVAL,
    PEER_REFRESH_MAX_INTERVAL, PEER_REFRESH_MAX_PEERS, PEER_REFRESH_MIN_INTERVAL,
    PEER_REFRESH_MIN_PEERS, UNSPECIFIED_HOST,
};
use crate::error::{Error, Result};
use crate::node_config::NodeConfig;
use crate::rpc::{NetPeer, RpcClient};

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// `node-id@ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub id: String,
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.ip, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::invalid_args(format!("invalid peer address {s:?} (want id@host:port)"));
        let (id, rest) = s.trim().split_once('@').ok_or_else(invalid)?;
        let (ip, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse().map_err(|_| invalid())?;
        if id.is_empty() || ip.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            id: id.to_string(),
            ip: ip.to_string(),
            port,
        })
    }
}

/// Port of a `tcp://host:port` listen address.
fn listen_port(listen_addr: &str) -> Option<u16> {
    let without_scheme = listen_addr.rsplit("://").next().unwrap_or(listen_addr);
    without_scheme.rsplit_once(':')?.1.parse().ok()
}

/// Converts a `/net_info` entry, rejecting unroutable or incomplete peers.
pub fn peer_from_net_info(peer: &NetPeer) -> Option<PeerAddress> {
    if peer.listen_addr.contains(UNSPECIFIED_HOST) {
        return None;
    }
    let id = peer.id.trim();
    let ip = peer.remote_ip.trim();
    if id.is_empty() || ip.is_empty() || ip == UNSPECIFIED_HOST {
        return None;
    }
    Some(PeerAddress {
        id: id.to_string(),
        ip: ip.to_string(),
        port: listen_port(&peer.listen_addr).unwrap_or(DEFAULT_P2P_PORT),
    })
}

/// Applies [`peer_from_net_info`] and keeps at most `cap` peers.
pub fn filter_peers(peers: &[NetPeer], cap: usize) -> Vec<PeerAddress> {
    peers.iter().filter_map(peer_from_net_info).take(cap).collect()
}

/// Removes repeats, keeping the first occurrence of each entry.
pub fn dedup_preserving_order<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// The built-in seed peers.
pub fn fallback_seeds() -> Vec<PeerAddress> {
    FALLBACK_SEEDS.iter().filter_map(|s| s.parse().ok()).collect()
}

fn host_of(base: &str) -> Option<String> {
    Url::parse(base).ok()?.host_str().map(str::to_string)
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Finds peers through a remote RPC endpoint.
#[derive(Debug, Clone)]
pub struct PeerDiscovery {
    rpc: RpcClient,
    cap: usize,
}

impl PeerDiscovery {
    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            cap: MAX_DISCOVERED_PEERS,
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    /// Never fails: the seed list is the last resort.
    pub async fn discover(&self) -> Vec<PeerAddress> {
        match self.rpc.net_info().await {
            Ok(peers) => {
                let accepted = filter_peers(&peers, self.cap);
                debug!(offered = peers.len(), accepted = accepted.len(), "peers from net_info");
                if !accepted.is_empty() {
                    return accepted;
                }
            }
            Err(e) => warn!(rpc = %self.rpc.base(), error = %e, "net_info failed"),
        }

        if let Some(peer) = rpc_host_peer(&self.rpc).await {
            info!(peer = %peer, "using the RPC host itself as a peer");
            return vec![peer];
        }

        warn!("no peers discovered, falling back to built-in seeds");
        fallback_seeds()
    }
}

/// The RPC server's own node as a peer: its node id from `/status`, the host
/// from its URL and the default p2p port.
pub async fn rpc_host_peer(rpc: &RpcClient) -> Option<PeerAddress> {
    let status = match rpc.status().await {
        Ok(status) => status,
        Err(e) => {
            debug!(rpc = %rpc.base(), error = %e, "status failed");
            return None;
        }
    };
    let host = host_of(rpc.base())?;
    if status.node_id.trim().is_empty() {
        return None;
    }
    Some(PeerAddress {
        id: status.node_id,
        ip: host,
        port: DEFAULT_P2P_PORT,
    })
}

// ---------------------------------------------------------------------------
// Refresher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRefreshOptions {
    pub interval: Duration,
    /// Refresh when fewer peers than this are connected.
    pub min_peers: usize,
    /// Upper bound on the committed `persistent_peers` list.
    pub max_peers: usize,
}

impl Default for PeerRefreshOptions {
    fn default() -> Self {
        Self {
            interval: PEER_REFRESH_INTERVAL,
            min_peers: PEER_REFRESH_MIN_PEERS,
            max_peers: PEER_REFRESH_MAX_PEERS,
        }
    }
}

impl PeerRefreshOptions {
    /// Clamps the interval to `[1 min, 1 h]` and keeps `max_peers >= min_peers >= 1`.
    pub fn clamped(mut self) -> Self {
        self.interval = self
            .interval
            .clamp(PEER_REFRESH_MIN_INTERVAL, PEER_REFRESH_MAX_INTERVAL);
        self.min_peers = self.min_peers.max(1);
        self.max_peers = self.max_peers.max(self.min_peers);
        self
    }
}

/// What one refresh pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Healthy { connected: usize },
    Updated { connected: usize, peers: Vec<String> },
    Unchanged { connected: usize },
}

/// Periodically tops up `persistent_peers` when the node is short of peers.
#[derive(Debug, Clone)]
pub struct PeerRefresher {
    local: RpcClient,
    discovery: PeerDiscovery,
    config: NodeConfig,
    options: PeerRefreshOptions,
    running: Arc<AtomicBool>,
}

impl PeerRefresher {
    pub fn new(
        local: RpcClient,
        discovery: PeerDiscovery,
        config: NodeConfig,
        options: PeerRefreshOptions,
    ) -> Self {
        Self {
            local,
            discovery,
            config,
            options: options.clamped(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn options(&self) -> &PeerRefreshOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn refresh_once(&self) -> Result<RefreshOutcome> {
        let connected = match self.local.net_info().await {
            Ok(peers) => peers.len(),
            Err(e) => {
                warn!(error = %e, "local net_info failed, assuming no peers");
                0
            }
        };
        if connected >= self.options.min_peers {
            debug!(connected, "peer count healthy");
            return Ok(RefreshOutcome::Healthy { connected });
        }

        let existing = self.config.persistent_peers()?;
        let discovered = self.discovery.discover().await;
        let merged: Vec<String> = dedup_preserving_order(
            existing
                .iter()
                .cloned()
                .chain(discovered.iter().map(PeerAddress::to_string)),
        )
        .into_iter()
        .take(self.options.max_peers)
        .collect();

        if merged == existing {
            return Ok(RefreshOutcome::Unchanged { connected });
        }
        self.config.set_persistent_peers(&merged)?;
        info!(connected, committed = merged.len(), "persistent peers refreshed");
        Ok(RefreshOutcome::Updated {
            connected,
            peers: merged,
        })
    }

    /// Spawns the periodic loop. Fails if a loop from this refresher is
    /// already running.
    pub fn start(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::precondition("peer refresher is already running"));
        }
        let this = self.clone();
        Ok(tokio::spawn(async move {
            let _guard = RunningGuard(this.running.clone());
            let mut ticker = tokio::time::interval(this.options.interval);
            info!(interval = ?this.options.interval, "peer refresher started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.refresh_once().await {
                            warn!(error = %e.chain_string(), "peer refresh failed");
                        }
                    }
                }
            }
            info!("peer refresher stopped");
        }))
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
