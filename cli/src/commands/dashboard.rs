use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;

use valkit_core::config::{LOG_BUFFER_LINES, RPC_TIMEOUT};
use valkit_core::dashboard::{App, DashboardOptions, NodeDataSource, Program};
use valkit_core::metrics::{CpuSampler, MetricsCollector};
use valkit_core::process::PidFileSupervisor;
use valkit_core::ringbuf::SharedRingBuffer;
use valkit_core::rpc::RpcClient;
use valkit_core::tailer::LogTailer;

use super::Context;
use crate::cli::DashboardArgs;
use crate::tui::{spawn_input, CrosstermTerminal};

/// Runs the dashboard until `q`, Ctrl-C or SIGTERM. Logging must already go
/// to a file.
pub async fn run(ctx: &Context, args: DashboardArgs) -> Result<()> {
    let cpu = Arc::new(CpuSampler::default());
    let mut collector = MetricsCollector::new(RpcClient::with_timeout(&ctx.rpc, RPC_TIMEOUT)?)
        .with_cpu_sampler(Arc::clone(&cpu))
        .with_disk_path(ctx.home());
    if let Some(remote) = &args.remote_rpc {
        let remote = valkit_core::config::base_url(remote);
        collector = collector.with_remote(RpcClient::with_timeout(&remote, RPC_TIMEOUT)?);
    }

    let supervisor = Arc::new(PidFileSupervisor::new(ctx.home(), &ctx.node_bin));
    let mut source = NodeDataSource::new(collector, supervisor, Arc::clone(&ctx.runner), &ctx.node_bin);
    if args.validators {
        source = source.with_validator(Arc::new(ctx.validator(&args.tx).await?));
    }

    let cancel = super::shutdown_token();
    let logs = SharedRingBuffer::new(LOG_BUFFER_LINES);
    let tailer = LogTailer::new(ctx.layout.node_log(), logs.clone()).spawn(cancel.child_token());
    cpu.start();

    crate::logging::log_panics();
    let terminal = CrosstermTerminal::enter().context("enter terminal")?;
    let app = App::new(DashboardOptions::default(), logs);
    let program = Program::new(app, Arc::new(source), terminal);
    let input = spawn_input(program.sender(), cancel.child_token());

    info!(rpc = %ctx.rpc, "dashboard started");
    let result = program.run(cancel.clone()).await;

    cancel.cancel();
    cpu.stop();
    let _ = tokio::join!(tailer, input);
    info!("dashboard stopped");
    result.map(|_| ()).context("dashboard failed")
}
