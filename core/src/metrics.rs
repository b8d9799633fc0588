//! # Metrics Collector
//!
//! One [`MetricsSnapshot`] bundles everything the dashboard, the `status`
//! command and the Prometheus exporter report:
//!
//! | Section | Source |
//! |---------|--------|
//! | system  | background CPU sampler, `sysinfo` memory and root disk |
//! | network | local `/net_info` peer count, remote `/status` round trip |
//! | chain   | local and remote `/status` heights, `catching_up` |
//! | node    | local `/status` identity, `rpc_listening` |
//!
//! CPU usage needs two readings some time apart, so [`CpuSampler`] refreshes
//! it in the background and foreground reads only take a lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Disks, System};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::CPU_SAMPLE_INTERVAL;
use crate::rpc::{NetPeer, NodeStatus, RpcClient};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
}

impl SystemMetrics {
    pub fn memory_percent(&self) -> f64 {
        percent(self.memory_used, self.memory_total)
    }

    pub fn disk_percent(&self) -> f64 {
        percent(self.disk_used, self.disk_total)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkMetrics {
    pub peers: usize,
    /// Last remote `/status` round trip.
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainMetrics {
    pub local_height: i64,
    pub remote_height: Option<i64>,
    pub catching_up: bool,
}

impl ChainMetrics {
    /// Blocks behind the remote, when both heights are known.
    pub fn blocks_behind(&self) -> Option<i64> {
        self.remote_height
            .filter(|_| self.local_height > 0)
            .map(|remote| (remote - self.local_height).max(0))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeMetrics {
    pub chain_id: String,
    pub node_id: String,
    pub moniker: String,
    pub rpc_listening: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub network: NetworkMetrics,
    pub chain: ChainMetrics,
    pub node: NodeMetrics,
    pub collected_at: DateTime<Utc>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            system: SystemMetrics::default(),
            network: NetworkMetrics::default(),
            chain: ChainMetrics::default(),
            node: NodeMetrics::default(),
            collected_at: Utc::now(),
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}

// ---------------------------------------------------------------------------
// CPU Sampler
// ---------------------------------------------------------------------------

/// Background CPU sampler with explicit start/stop. Never runs twice.
#[derive(Debug)]
pub struct CpuSampler {
    interval: Duration,
    value: Arc<Mutex<f64>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new(CPU_SAMPLE_INTERVAL)
    }
}

impl CpuSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            value: Arc::new(Mutex::new(0.0)),
            stop: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns the sampling task on the current runtime. Returns `false` if it
    /// is already running.
    pub fn start(&self) -> bool {
        let mut stop = self.stop.lock();
        if stop.is_some() {
            return false;
        }
        let (tx, mut rx) = oneshot::channel();
        *stop = Some(tx);

        let value = Arc::clone(&self.value);
        let interval = self.interval;
        tokio::spawn(async move {
            let mut system = System::new();
            system.refresh_cpu();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        system.refresh_cpu();
                        let usage = f64::from(system.global_cpu_info().cpu_usage());
                        trace!(usage, "cpu sample");
                        *value.lock() = usage.clamp(0.0, 100.0);
                    }
                }
            }
            debug!("cpu sampler stopped");
        });
        true
    }

    /// Signals the task to exit. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match self.stop.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }

    /// Last sampled usage in percent.
    pub fn current(&self) -> f64 {
        *self.value.lock()
    }
}

impl Drop for CpuSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

pub struct MetricsCollector {
    local: RpcClient,
    remote: Option<RpcClient>,
    cpu: Arc<CpuSampler>,
    disk_path: PathBuf,
    system: Mutex<System>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("local", &self.local.base())
            .field("remote", &self.remote.as_ref().map(RpcClient::base))
            .field("disk_path", &self.disk_path)
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    pub fn new(local: RpcClient) -> Self {
        Self {
            local,
            remote: None,
            cpu: Arc::new(CpuSampler::default()),
            disk_path: PathBuf::from("/"),
            system: Mutex::new(System::new()),
        }
    }

    /// Remote RPC used for the reference height and latency.
    pub fn with_remote(mut self, remote: RpcClient) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_cpu_sampler(mut self, cpu: Arc<CpuSampler>) -> Self {
        self.cpu = cpu;
        self
    }

    /// Disk usage is reported for the filesystem mounted closest to `path`.
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    pub fn cpu(&self) -> &Arc<CpuSampler> {
        &self.cpu
    }

    pub fn local(&self) -> &RpcClient {
        &self.local
    }

    /// Never fails: unreachable endpoints leave their fields at defaults.
    pub async fn collect(&self) -> MetricsSnapshot {
        self.collect_with_peers().await.0
    }

    /// [`collect`](Self::collect) plus the local peer list it counted.
    pub async fn collect_with_peers(&self) -> (MetricsSnapshot, Vec<NetPeer>) {
        let local = self.local.status();
        let peers = self.local.net_info();
        let remote = async {
            match &self.remote {
                Some(rpc) => rpc.latency().await.ok(),
                None => None,
            }
        };
        let (local, peers, remote) = tokio::join!(local, peers, remote);

        let local = match local {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(rpc = %self.local.base(), error = %e, "local status unavailable");
                None
            }
        };
        let peers = peers.unwrap_or_default();
        let snapshot = snapshot_from(self.system_metrics(), local, peers.len(), remote);
        (snapshot, peers)
    }

    /// For short-lived callers: runs the sampler for one interval if it is not
    /// already running, collects, and stops it again.
    pub async fn collect_once(&self) -> MetricsSnapshot {
        let started = self.cpu.start();
        if started {
            tokio::time::sleep(self.cpu.interval() + Duration::from_millis(50)).await;
        }
        let snapshot = self.collect().await;
        if started {
            self.cpu.stop();
        }
        snapshot
    }

    fn system_metrics(&self) -> SystemMetrics {
        let (memory_used, memory_total) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            (system.used_memory(), system.total_memory())
        };
        let (disk_used, disk_total) = disk_usage(&self.disk_path);
        SystemMetrics {
            cpu_percent: self.cpu.current(),
            memory_used,
            memory_total,
            disk_used,
            disk_total,
        }
    }
}

/// `(used, total)` bytes for the disk with the longest mount point that
/// prefixes `path`.
fn disk_usage(path: &Path) -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| (d.total_space().saturating_sub(d.available_space()), d.total_space()))
        .unwrap_or((0, 0))
}

fn snapshot_from(
    system: SystemMetrics,
    local: Option<NodeStatus>,
    peers: usize,
    remote: Option<(Duration, NodeStatus)>,
) -> MetricsSnapshot {
    let (latency_ms, remote_height) = match &remote {
        Some((rtt, status)) => (
            Some(rtt.as_millis() as u64),
            Some(status.latest_block_height).filter(|h| *h > 0),
        ),
        None => (None, None),
    };
    let rpc_listening = local.is_some();
    let local = local.unwrap_or_default();
    MetricsSnapshot {
        system,
        network: NetworkMetrics { peers, latency_ms },
        chain: ChainMetrics {
            local_height: local.latest_block_height,
            remote_height,
            catching_up: local.catching_up,
        },
        node: NodeMetrics {
            chain_id: local.network,
            node_id: local.node_id,
            moniker: local.moniker,
            rpc_listening,
        },
        collected_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn node(height: &'static str, catching_up: bool) -> Router {
        Router::new()
            .route(
                "/status",
                get(move || async move {
                    Json(json!({"result": {
                        "node_info": {"id": "abc", "moniker": "val-1", "network": "C-1"},
                        "sync_info": {"latest_block_height": height, "catching_up": catching_up}
                    }}))
                }),
            )
            .route(
                "/net_info",
                get(|| async {
                    Json(json!({"result": {"peers": [
                        {"node_info": {"id": "p1"}, "remote_ip": "1.1.1.1"},
                        {"node_info": {"id": "p2"}, "remote_ip": "2.2.2.2"}
                    ]}}))
                }),
            )
    }

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn sampler_never_double_starts() {
        let sampler = CpuSampler::new(Duration::from_millis(20));
        assert!(!sampler.is_running());
        assert!(sampler.start());
        assert!(!sampler.start());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let cpu = sampler.current();
        assert!((0.0..=100.0).contains(&cpu));
        assert!(sampler.stop());
        assert!(!sampler.stop());
        assert!(sampler.start(), "restart after stop");
        assert!(sampler.stop());
    }

    #[tokio::test]
    async fn collects_local_and_remote() {
        let local = RpcClient::new(&serve(node("100", true)).await).unwrap();
        let remote = RpcClient::new(&serve(node("250", false)).await).unwrap();
        let collector = MetricsCollector::new(local).with_remote(remote);

        let snap = collector.collect().await;
        assert!(snap.node.rpc_listening);
        assert_eq!(snap.node.chain_id, "C-1");
        assert_eq!(snap.node.moniker, "val-1");
        assert_eq!(snap.network.peers, 2);
        assert!(snap.network.latency_ms.is_some());
        assert_eq!(snap.chain.local_height, 100);
        assert_eq!(snap.chain.remote_height, Some(250));
        assert!(snap.chain.catching_up);
        assert_eq!(snap.chain.blocks_behind(), Some(150));
        assert!(snap.system.memory_total > 0);
    }

    #[tokio::test]
    async fn unreachable_node_is_not_listening() {
        let collector = MetricsCollector::new(RpcClient::new(&closed_port().await).unwrap());
        let snap = collector.collect().await;
        assert!(!snap.node.rpc_listening);
        assert_eq!(snap.network.peers, 0);
        assert_eq!(snap.network.latency_ms, None);
        assert_eq!(snap.chain.blocks_behind(), None);
    }

    #[tokio::test]
    async fn collect_once_leaves_sampler_stopped() {
        let collector = MetricsCollector::new(RpcClient::new(&closed_port().await).unwrap())
            .with_cpu_sampler(Arc::new(CpuSampler::new(Duration::from_millis(10))));
        collector.collect_once().await;
        assert!(!collector.cpu().is_running());
    }

    #[test]
    fn percentages_handle_zero_totals() {
        let sys = SystemMetrics {
            memory_used: 50,
            memory_total: 200,
            ..SystemMetrics::default()
        };
        assert_eq!(sys.memory_percent(), 25.0);
        assert_eq!(sys.disk_percent(), 0.0);
    }
}
