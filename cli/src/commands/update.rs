use std::sync::Arc;

use anyhow::{Context as _, Result};

use valkit_core::format_bytes;
use valkit_core::update::{rollback, UpdateOptions, UpdateOutcome, Updater};

use super::Context;
use crate::cli::UpdateArgs;

pub async fn run(ctx: &Context, args: UpdateArgs) -> Result<()> {
    let exe = std::env::current_exe().context("locate running binary")?;
    if args.rollback {
        rollback(&exe)?;
        println!("Restored previous binary at {}", exe.display());
        return Ok(());
    }

    let options = UpdateOptions {
        check_file: Some(ctx.layout.update_check_file()),
        progress: Some(Arc::new(|current: i64, total: i64| {
            if total > 0 && current == total {
                eprintln!("downloaded {}", format_bytes(total as u64));
            }
        })),
        ..UpdateOptions::default()
    };
    let updater = Updater::new(options)?;

    if args.check {
        let status = updater.check(args.force).await?;
        let source = if status.cached { " (cached)" } else { "" };
        if status.update_available {
            println!("Update available: {} -> {}{source}", status.current, status.latest);
        } else {
            println!("Up to date ({}){source}", status.current);
        }
        return Ok(());
    }

    let cancel = super::shutdown_token();
    match updater.update(&exe, &cancel).await.context("update failed")? {
        UpdateOutcome::UpToDate { version } => println!("Already up to date ({version})"),
        UpdateOutcome::Updated { from, to, backup } => {
            println!("Updated {from} -> {to}");
            println!("  previous binary kept at {}", backup.display());
            println!("  run `valkit update --rollback` to restore it");
        }
    }
    Ok(())
}
