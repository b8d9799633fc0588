use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;

use valkit_core::bootstrap::{BootstrapOptions, Bootstrapper};

use super::Context;
use crate::cli::InitArgs;

pub async fn run(ctx: &Context, args: InitArgs) -> Result<()> {
    let options = BootstrapOptions {
        home: ctx.home().to_path_buf(),
        chain_id: args.chain_id,
        moniker: args.moniker,
        denom: args.denom,
        genesis_domain: args.genesis_domain,
        node_binary: ctx.node_bin.clone(),
        snapshot_rpcs: args.snapshot_rpcs,
        snapshot_url: args.snapshot_url,
        progress: Some(Arc::new(|step: usize, total: usize, what: &str| {
            eprintln!("[{step}/{total}] {what}");
        })),
        ..BootstrapOptions::default()
    };

    let bootstrapper = Bootstrapper::new(Arc::clone(&ctx.runner), options)?;
    let cancel = super::shutdown_token();
    let report = bootstrapper.run(&cancel).await.context("bootstrap failed")?;

    info!(peers = report.peers.len(), trust_height = report.trust.height, "node home configured");
    println!("Node initialized at {}", ctx.home().display());
    println!("  Trust height : {}", report.trust.height);
    println!("  Trust hash   : {}", report.trust.hash);
    println!("  RPC servers  : {}", report.rpc_servers.join(","));
    println!("  Peers        : {}", report.peers.len());
    if let Some(backup) = &report.config_backup {
        println!("  Config backup: {}", backup.display());
    }
    if report.snapshot_installed {
        println!("  Snapshot     : installed, state sync disabled");
    }
    Ok(())
}
