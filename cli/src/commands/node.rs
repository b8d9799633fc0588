use std::time::Duration;

use anyhow::Result;

use valkit_core::process::{PidFileSupervisor, ProcessSupervisor};

use super::Context;
use crate::cli::StopArgs;

fn supervisor(ctx: &Context) -> PidFileSupervisor {
    PidFileSupervisor::new(ctx.home(), &ctx.node_bin)
}

pub fn start(ctx: &Context) -> Result<()> {
    let pid = supervisor(ctx).start()?;
    println!("Node started (pid {pid}), logging to {}", ctx.layout.node_log().display());
    Ok(())
}

pub async fn stop(ctx: &Context, args: StopArgs) -> Result<()> {
    if supervisor(ctx).stop(Duration::from_secs(args.grace)).await? {
        println!("Node stopped");
    } else {
        println!("Node was not running");
    }
    Ok(())
}

pub async fn restart(ctx: &Context, args: StopArgs) -> Result<()> {
    let supervisor = supervisor(ctx);
    let previous = supervisor.pid();
    let pid = supervisor.restart(Duration::from_secs(args.grace)).await?;
    match previous {
        Some(old) => println!("Node restarted (pid {old} -> {pid})"),
        None => println!("Node started (pid {pid})"),
    }
    Ok(())
}
