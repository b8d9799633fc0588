//! Dashboard data: the per-refresh snapshot and the source that produces it.
//!
//! [`NodeDataSource`] caches the two expensive lookups. The node version
//! shells out to `<bin> version` and is kept for five minutes or until the
//! PID changes. Validator queries go through the node CLI and are kept for
//! thirty seconds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{VALIDATOR_TTL, VERSION_TTL};
use crate::error::{Error, Result};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::process::{ProcessRunner, ProcessSupervisor};
use crate::rpc::NetPeer;
use crate::validator::{ValidatorInfo, ValidatorOps};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub version: Option<String>,
}

/// Everything one refresh produced. Panels only read it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardSnapshot {
    pub metrics: MetricsSnapshot,
    pub process: ProcessInfo,
    pub my_validator: Option<ValidatorInfo>,
    pub validators: Vec<ValidatorInfo>,
    pub peers: Vec<NetPeer>,
    /// Partial failure worth showing next to otherwise good data.
    pub error: Option<String>,
}

impl DashboardSnapshot {
    /// Synced means the local RPC answered and is not catching up.
    pub fn in_sync(&self) -> bool {
        self.metrics.node.rpc_listening && !self.metrics.chain.catching_up
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self) -> Result<DashboardSnapshot>;

    /// Outstanding rewards of one validator, already formatted.
    async fn rewards(&self, operator: &str) -> Result<String>;
}

struct Cached<T> {
    value: T,
    at: Instant,
    pid: Option<u32>,
}

type ValidatorViews = (Vec<ValidatorInfo>, Option<ValidatorInfo>);

pub struct NodeDataSource {
    collector: MetricsCollector,
    supervisor: Arc<dyn ProcessSupervisor>,
    runner: Arc<dyn ProcessRunner>,
    binary: String,
    validator: Option<Arc<dyn ValidatorOps>>,
    version_ttl: Duration,
    validator_ttl: Duration,
    version: Mutex<Option<Cached<String>>>,
    validators: Mutex<Option<Cached<ValidatorViews>>>,
}

impl NodeDataSource {
    pub fn new(
        collector: MetricsCollector,
        supervisor: Arc<dyn ProcessSupervisor>,
        runner: Arc<dyn ProcessRunner>,
        binary: &str,
    ) -> Self {
        Self {
            collector,
            supervisor,
            runner,
            binary: binary.to_string(),
            validator: None,
            version_ttl: VERSION_TTL,
            validator_ttl: VALIDATOR_TTL,
            version: Mutex::new(None),
            validators: Mutex::new(None),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ValidatorOps>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_ttls(mut self, version: Duration, validators: Duration) -> Self {
        self.version_ttl = version;
        self.validator_ttl = validators;
        self
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    async fn node_version(&self, pid: Option<u32>) -> Option<String> {
        if let Some(cached) = self.version.lock().as_ref() {
            if cached.pid == pid && cached.at.elapsed() < self.version_ttl {
                return Some(cached.value.clone());
            }
        }
        match self.runner.output(&self.binary, &["version".to_string()]).await {
            Ok(out) => {
                let version = out.lines().next().unwrap_or_default().trim().to_string();
                *self.version.lock() = Some(Cached {
                    value: version.clone(),
                    at: Instant::now(),
                    pid,
                });
                Some(version)
            }
            Err(e) => {
                debug!(binary = %self.binary, error = %e, "node version unavailable");
                None
            }
        }
    }

    async fn validator_views(&self, validator: &dyn ValidatorOps) -> Result<ValidatorViews> {
        if let Some(cached) = self.validators.lock().as_ref() {
            if cached.at.elapsed() < self.validator_ttl {
                return Ok(cached.value.clone());
            }
        }
        let (list, mine) = tokio::join!(validator.validators(), validator.my_validator());
        let views = (list?, mine.unwrap_or_else(|e| {
            debug!(error = %e, "own validator unavailable");
            None
        }));
        *self.validators.lock() = Some(Cached {
            value: views.clone(),
            at: Instant::now(),
            pid: None,
        });
        Ok(views)
    }
}

#[async_trait]
impl SnapshotSource for NodeDataSource {
    async fn fetch(&self) -> Result<DashboardSnapshot> {
        let (metrics, peers) = self.collector.collect_with_peers().await;

        let running = self.supervisor.is_running();
        let pid = self.supervisor.pid();
        let version = if running { self.node_version(pid).await } else { None };
        let process = ProcessInfo {
            running,
            pid,
            uptime: self.supervisor.uptime(),
            version,
        };

        let mut errors = Vec::new();
        if !metrics.node.rpc_listening {
            errors.push(format!("RPC not reachable at {}", self.collector.local().base()));
        }
        let (validators, my_validator) = match &self.validator {
            Some(validator) => match self.validator_views(validator.as_ref()).await {
                Ok(views) => views,
                Err(e) => {
                    warn!(error = %e, "validator query failed");
                    errors.push(format!("validators: {}", e.message()));
                    (Vec::new(), None)
                }
            },
            None => (Vec::new(), None),
        };

        Ok(DashboardSnapshot {
            metrics,
            process,
            my_validator,
            validators,
            peers,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        })
    }

    async fn rewards(&self, operator: &str) -> Result<String> {
        match &self.validator {
            Some(validator) => validator.rewards(operator).await,
            None => Err(Error::precondition("no validator capability configured")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcClient;
    use crate::testutil::{serve, RecordingRunner};
    use crate::validator::{RegisterRequest, TxReceipt, VoteOption};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSupervisor(Option<u32>);

    impl ProcessSupervisor for FixedSupervisor {
        fn is_running(&self) -> bool {
            self.0.is_some()
        }
        fn pid(&self) -> Option<u32> {
            self.0
        }
        fn uptime(&self) -> Option<Duration> {
            self.0.map(|_| Duration::from_secs(90))
        }
    }

    #[derive(Default)]
    struct CountingValidator {
        list_calls: AtomicUsize,
    }

    #[async_trait]
    impl ValidatorOps for CountingValidator {
        async fn validators(&self) -> Result<Vec<ValidatorInfo>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ValidatorInfo {
                operator_address: "valoper1a".into(),
                moniker: "alpha".into(),
                tokens: "1000".into(),
                ..ValidatorInfo::default()
            }])
        }
        async fn my_validator(&self) -> Result<Option<ValidatorInfo>> {
            Err(Error::process("key not found"))
        }
        async fn evm_address(&self) -> Result<String> {
            unimplemented!()
        }
        async fn rewards(&self, operator: &str) -> Result<String> {
            Ok(format!("{operator}:12uval"))
        }
        async fn register(&self, _: &RegisterRequest) -> Result<TxReceipt> {
            unimplemented!()
        }
        async fn delegate(&self, _: &str, _: u128) -> Result<TxReceipt> {
            unimplemented!()
        }
        async fn withdraw_rewards(&self, _: Option<&str>) -> Result<TxReceipt> {
            unimplemented!()
        }
        async fn unjail(&self) -> Result<TxReceipt> {
            unimplemented!()
        }
        async fn vote(&self, _: u64, _: VoteOption) -> Result<TxReceipt> {
            unimplemented!()
        }
    }

    async fn node() -> RpcClient {
        let router = Router::new()
            .route(
                "/status",
                get(|| async {
                    Json(json!({"result": {"node_info": {"id": "n1", "network": "C-1"},
                        "sync_info": {"latest_block_height": "10", "catching_up": false}}}))
                }),
            )
            .route(
                "/net_info",
                get(|| async { Json(json!({"result": {"peers": [{"node_info": {"id": "p"}, "remote_ip": "9.9.9.9"}]}})) }),
            );
        RpcClient::new(&serve(router).await).unwrap()
    }

    #[tokio::test]
    async fn fetch_assembles_snapshot_and_caches_lookups() {
        let runner = Arc::new(RecordingRunner::with_stdout("v2.1.0\ncommit abc\n"));
        let validator = Arc::new(CountingValidator::default());
        let source = NodeDataSource::new(
            MetricsCollector::new(node().await),
            Arc::new(FixedSupervisor(Some(42))),
            runner.clone(),
            "valkitd",
        )
        .with_validator(validator.clone());

        let snap = source.fetch().await.unwrap();
        assert!(snap.in_sync());
        assert_eq!(snap.peers.len(), 1);
        assert_eq!(snap.process.pid, Some(42));
        assert_eq!(snap.process.version.as_deref(), Some("v2.1.0"));
        assert_eq!(snap.validators[0].moniker, "alpha");
        assert_eq!(snap.my_validator, None);
        assert_eq!(snap.error, None);

        source.fetch().await.unwrap();
        assert_eq!(runner.invocations_of("version").len(), 1);
        assert_eq!(validator.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.rewards("valoper1a").await.unwrap(), "valoper1a:12uval");
    }

    #[tokio::test]
    async fn stopped_node_skips_version_and_reports_rpc() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let runner = Arc::new(RecordingRunner::default());
        let source = NodeDataSource::new(
            MetricsCollector::new(RpcClient::new(&url).unwrap()),
            Arc::new(FixedSupervisor(None)),
            runner.clone(),
            "valkitd",
        );

        let snap = source.fetch().await.unwrap();
        assert!(!snap.process.running);
        assert!(runner.invocations_of("version").is_empty());
        assert!(snap.error.unwrap().contains("RPC not reachable"));
        assert!(source.rewards("x").await.is_err());
    }
}
