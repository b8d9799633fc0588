use std::time::Duration;

use anyhow::{Context as _, Result};

use valkit_core::config::base_url;
use valkit_core::node_config::NodeConfig;
use valkit_core::peers::{peer_from_net_info, PeerDiscovery, PeerRefreshOptions, PeerRefresher, RefreshOutcome};
use valkit_core::rpc::RpcClient;

use super::Context;
use crate::cli::{PeerRefreshArgs, PeerWatchArgs, PeersCommand};

pub async fn run(ctx: &Context, command: Option<PeersCommand>) -> Result<()> {
    match command.unwrap_or(PeersCommand::List) {
        PeersCommand::List => list(ctx).await,
        PeersCommand::Refresh(args) => refresh(ctx, args).await,
        PeersCommand::Watch(args) => watch(ctx, args).await,
    }
}

async fn list(ctx: &Context) -> Result<()> {
    let config = NodeConfig::for_home(ctx.home());
    let configured = if config.exists() { config.persistent_peers()? } else { Vec::new() };

    match ctx.local_rpc()?.net_info().await {
        Ok(peers) => {
            println!("Connected peers: {}", peers.len());
            for peer in &peers {
                match peer_from_net_info(peer) {
                    Some(addr) => println!("  {addr}  {}", peer.moniker),
                    None => println!("  {}  {}", peer.id, peer.moniker),
                }
            }
        }
        Err(e) => println!("Connected peers: unavailable ({e})"),
    }
    println!("Persistent peers: {}", configured.len());
    for peer in &configured {
        println!("  {peer}");
    }
    Ok(())
}

fn refresher(ctx: &Context, args: &PeerRefreshArgs, interval: Duration) -> Result<PeerRefresher> {
    let config = NodeConfig::for_home(ctx.home());
    if !config.exists() {
        return Err(valkit_core::Error::precondition(format!(
            "{} not found; run `valkit init` first",
            config.path().display()
        ))
        .into());
    }
    let genesis = RpcClient::new(&base_url(&args.genesis_domain))?;
    let options = PeerRefreshOptions {
        interval,
        min_peers: args.min_peers,
        max_peers: args.max_peers,
    };
    Ok(PeerRefresher::new(ctx.local_rpc()?, PeerDiscovery::new(genesis), config, options))
}

async fn refresh(ctx: &Context, args: PeerRefreshArgs) -> Result<()> {
    let refresher = refresher(ctx, &args, PeerRefreshOptions::default().interval)?;
    match refresher.refresh_once().await.context("peer refresh failed")? {
        RefreshOutcome::Healthy { connected } => println!("{connected} peers connected, nothing to do"),
        RefreshOutcome::Unchanged { connected } => {
            println!("{connected} peers connected, no new peers discovered")
        }
        RefreshOutcome::Updated { connected, peers } => {
            println!("{connected} peers connected, persistent_peers now lists {}", peers.len());
            println!("Restart the node to apply: valkit restart");
        }
    }
    Ok(())
}

async fn watch(ctx: &Context, args: PeerWatchArgs) -> Result<()> {
    let refresher = refresher(ctx, &args.refresh, Duration::from_secs(args.interval))?;
    let cancel = super::shutdown_token();
    eprintln!(
        "Checking peers every {}s; logging to {}",
        refresher.options().interval.as_secs(),
        ctx.layout.tool_log().display()
    );
    refresher.start(cancel)?.await.context("peer refresher task failed")?;
    Ok(())
}
