use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use valkit_core::config::{base_url, RPC_TIMEOUT};
use valkit_core::metrics::{CpuSampler, MetricsCollector, MetricsSnapshot};
use valkit_core::rpc::RpcClient;
use valkit_core::{format_bytes, Error, ErrorCode};

use super::Context;
use crate::cli::StatusArgs;
use crate::exporter::StatusExporter;

pub async fn run(ctx: &Context, args: StatusArgs) -> Result<()> {
    let mut collector = MetricsCollector::new(RpcClient::with_timeout(&ctx.rpc, RPC_TIMEOUT)?)
        .with_cpu_sampler(Arc::new(CpuSampler::default()))
        .with_disk_path(ctx.home());
    if let Some(remote) = &args.remote_rpc {
        collector = collector.with_remote(RpcClient::with_timeout(&base_url(remote), RPC_TIMEOUT)?);
    }

    let snapshot = collector.collect_once().await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot).context("encode status")?);
    } else if args.prometheus {
        print!("{}", StatusExporter::render(&snapshot).context("encode metrics")?);
    } else {
        print_text(&snapshot);
    }

    if let Some(secs) = args.stuck_after {
        check_progress(&collector, &snapshot, Duration::from_secs(secs)).await?;
    }
    Ok(())
}

fn print_text(s: &MetricsSnapshot) {
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    println!("Node");
    println!("  rpc listening : {}", yes_no(s.node.rpc_listening));
    if s.node.rpc_listening {
        println!("  chain id      : {}", s.node.chain_id);
        println!("  moniker       : {}", s.node.moniker);
        println!("  node id       : {}", s.node.node_id);
    }
    println!("Chain");
    println!("  local height  : {}", s.chain.local_height);
    if let Some(remote) = s.chain.remote_height {
        println!("  remote height : {remote}");
    }
    if let Some(behind) = s.chain.blocks_behind() {
        println!("  blocks behind : {behind}");
    }
    println!("  catching up   : {}", yes_no(s.chain.catching_up));
    println!("Network");
    println!("  peers         : {}", s.network.peers);
    if let Some(ms) = s.network.latency_ms {
        println!("  rpc latency   : {ms} ms");
    }
    println!("System");
    println!("  cpu           : {:.1}%", s.system.cpu_percent);
    println!(
        "  memory        : {:.1}% of {}",
        s.system.memory_percent(),
        format_bytes(s.system.memory_total)
    );
    println!(
        "  disk          : {:.1}% of {}",
        s.system.disk_percent(),
        format_bytes(s.system.disk_total)
    );
}

/// Samples the height again after `window` and fails with `SyncStuck` when a
/// catching-up node made no progress.
async fn check_progress(collector: &MetricsCollector, first: &MetricsSnapshot, window: Duration) -> Result<()> {
    if !first.node.rpc_listening {
        return Err(Error::network(format!("RPC not reachable at {}", collector.local().base())).into());
    }
    let cancel = super::shutdown_token();
    tokio::select! {
        _ = cancel.cancelled() => return Err(Error::cancelled("sync progress check").into()),
        _ = tokio::time::sleep(window) => {}
    }
    let second = collector.collect().await;
    let (before, after) = (first.chain.local_height, second.chain.local_height);
    if second.chain.catching_up && after <= before {
        warn!(height = after, window = ?window, "node is catching up but not advancing");
        return Err(Error::new(
            ErrorCode::SyncStuck,
            format!("height stuck at {after} for {}s while catching up", window.as_secs()),
        )
        .into());
    }
    info!(before, after, "sync progressing");
    Ok(())
}
