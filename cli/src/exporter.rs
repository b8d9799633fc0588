//! # Prometheus Exporter
//!
//! Renders a [`MetricsSnapshot`] in the Prometheus text exposition format for
//! `valkit status --prometheus`. The output suits node_exporter's textfile
//! collector: write it to a `.prom` file from cron.
//!
//! Metrics live in a dedicated registry with the `valkit` prefix so they
//! never collide with the default global registry.

use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use valkit_core::metrics::MetricsSnapshot;

pub struct StatusExporter {
    registry: Registry,
    pub cpu_percent: Gauge,
    pub memory_percent: Gauge,
    pub disk_percent: Gauge,
    pub peers: IntGauge,
    /// Remote `/status` round trip; absent when no remote was reachable.
    pub rpc_latency_ms: IntGauge,
    pub local_height: IntGauge,
    pub remote_height: IntGauge,
    pub blocks_behind: IntGauge,
    pub catching_up: IntGauge,
    pub rpc_listening: IntGauge,
    /// Constant 1 carrying identity labels.
    pub node_info: IntGaugeVec,
}

fn register<M>(registry: &Registry, metric: M) -> Result<M, prometheus::Error>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl StatusExporter {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("valkit".into()), None)?;
        let r = &registry;
        Ok(Self {
            cpu_percent: register(r, Gauge::new("cpu_percent", "Host CPU usage in percent")?)?,
            memory_percent: register(r, Gauge::new("memory_percent", "Host memory usage in percent")?)?,
            disk_percent: register(r, Gauge::new("disk_percent", "Usage of the disk holding the node home")?)?,
            peers: register(r, IntGauge::new("peers", "Peers connected to the local node")?)?,
            rpc_latency_ms: register(r, IntGauge::new("rpc_latency_ms", "Remote RPC status round trip in ms")?)?,
            local_height: register(r, IntGauge::new("local_height", "Latest block height of the local node")?)?,
            remote_height: register(r, IntGauge::new("remote_height", "Latest block height of the remote RPC")?)?,
            blocks_behind: register(r, IntGauge::new("blocks_behind", "Blocks the local node trails the remote")?)?,
            catching_up: register(r, IntGauge::new("catching_up", "1 while the local node is catching up")?)?,
            rpc_listening: register(r, IntGauge::new("rpc_listening", "1 when the local RPC answered")?)?,
            node_info: register(
                r,
                IntGaugeVec::new(
                    Opts::new("node_info", "Identity of the local node"),
                    &["chain_id", "node_id", "moniker"],
                )?,
            )?,
            registry,
        })
    }

    /// Sets every gauge from `snapshot`. Gauges for unknown values are not
    /// exported.
    pub fn observe(&self, snapshot: &MetricsSnapshot) {
        self.cpu_percent.set(snapshot.system.cpu_percent);
        self.memory_percent.set(snapshot.system.memory_percent());
        self.disk_percent.set(snapshot.system.disk_percent());
        self.peers.set(snapshot.network.peers as i64);
        self.local_height.set(snapshot.chain.local_height);
        self.catching_up.set(i64::from(snapshot.chain.catching_up));
        self.rpc_listening.set(i64::from(snapshot.node.rpc_listening));
        if let Some(ms) = snapshot.network.latency_ms {
            self.rpc_latency_ms.set(ms as i64);
        }
        if let Some(height) = snapshot.chain.remote_height {
            self.remote_height.set(height);
        }
        if let Some(behind) = snapshot.chain.blocks_behind() {
            self.blocks_behind.set(behind);
        }
        let node = &snapshot.node;
        if node.rpc_listening {
            self.node_info
                .with_label_values(&[&node.chain_id, &node.node_id, &node.moniker])
                .set(1);
        }
    }

    /// Encodes all registered metrics into the text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn render(snapshot: &MetricsSnapshot) -> Result<String, prometheus::Error> {
        let exporter = Self::new()?;
        exporter.observe(snapshot);
        exporter.encode()
    }
}
