//! `valkit doctor`: preflight checks for a node home.

use anyhow::Result;

use valkit_core::config::{HomeLayout, DOCTOR_MIN_FREE_BYTES, RPC_TIMEOUT};
use valkit_core::process::ProcessRunner;
use valkit_core::rpc::RpcClient;
use valkit_core::{available_space, format_bytes, Error};

use super::Context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl Check {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self { name, ok: true, detail: detail.into() }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self { name, ok: false, detail: detail.into() }
    }
}

fn file_check(name: &'static str, path: &std::path::Path) -> Check {
    if path.is_file() {
        Check::pass(name, path.display().to_string())
    } else {
        Check::fail(name, format!("missing {}", path.display()))
    }
}

pub async fn checks(layout: &HomeLayout, runner: &dyn ProcessRunner, node_bin: &str, rpc: &str) -> Vec<Check> {
    let mut out = Vec::new();

    out.push(if layout.root().is_dir() {
        Check::pass("home", layout.root().display().to_string())
    } else {
        Check::fail("home", format!("{} does not exist", layout.root().display()))
    });
    out.push(file_check("config", &layout.config_file()));
    out.push(file_check("genesis", &layout.genesis_file()));
    out.push(file_check("signing state", &layout.priv_validator_state()));

    out.push(match runner.output(node_bin, &["version".to_string()]).await {
        Ok(version) => Check::pass("node binary", format!("{node_bin} {}", version.lines().next().unwrap_or("").trim())),
        Err(e) => Check::fail("node binary", e.message().to_string()),
    });

    out.push(match RpcClient::with_timeout(rpc, RPC_TIMEOUT) {
        Ok(client) => match client.status().await {
            Ok(status) => Check::pass(
                "rpc",
                format!(
                    "{} at height {}{}",
                    status.network,
                    status.latest_block_height,
                    if status.catching_up { " (catching up)" } else { "" }
                ),
            ),
            Err(e) => Check::fail("rpc", format!("{rpc}: {e}")),
        },
        Err(e) => Check::fail("rpc", e.message().to_string()),
    });

    out.push(match available_space(layout.root()) {
        Ok(free) if free >= DOCTOR_MIN_FREE_BYTES => Check::pass("disk", format!("{} free", format_bytes(free))),
        Ok(free) => Check::fail(
            "disk",
            format!("{} free, want at least {}", format_bytes(free), format_bytes(DOCTOR_MIN_FREE_BYTES)),
        ),
        Err(e) => Check::fail("disk", e.to_string()),
    });

    out
}

pub async fn run(ctx: &Context) -> Result<()> {
    let results = checks(&ctx.layout, ctx.runner.as_ref(), &ctx.node_bin, &ctx.rpc).await;
    for check in &results {
        let mark = if check.ok { "ok  " } else { "FAIL" };
        println!("[{mark}] {:<14} {}", check.name, check.detail);
    }
    let failed = results.iter().filter(|c| !c.ok).count();
    if failed > 0 {
        return Err(Error::precondition(format!("{failed} of {} checks failed", results.len())).into());
    }
    println!("All checks passed");
    Ok(())
}
