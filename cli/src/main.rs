// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # valkit
//!
//! Entry point for the `valkit` binary. Parses arguments, installs logging,
//! dispatches to a command handler and turns the outcome into a process exit
//! code:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0    | success |
//! | 1    | general error |
//! | 2    | invalid arguments |
//! | 3    | precondition failed |
//! | 4    | network error |
//! | 5    | process error |
//! | 6    | validation error |
//! | 42   | sync stuck |

mod cli;
mod commands;
mod exporter;
mod logging;
mod tui;

use anyhow::Result;
use clap::Parser;

use valkit_core::{code_for_error, ErrorCode};

use cli::{Commands, PeersCommand, ValkitCli};
use commands::Context;
use logging::LogSink;

#[tokio::main]
async fn main() {
    let cli = ValkitCli::parse();
    let code = match run(cli).await {
        Ok(()) => ErrorCode::Success,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code(&e)
        }
    };
    std::process::exit(code.exit_code());
}

/// First coded error anywhere in the chain, else `GeneralError`.
fn exit_code(err: &anyhow::Error) -> ErrorCode {
    let root: &(dyn std::error::Error + 'static) = err.as_ref();
    code_for_error(Some(root))
}

/// Full-screen and long-running commands log to the tool log file.
fn log_sink(ctx: &Context, command: &Commands) -> LogSink {
    match command {
        Commands::Dashboard(_) => LogSink::File(ctx.layout.tool_log()),
        Commands::Peers(args) if matches!(args.command, Some(PeersCommand::Watch(_))) => {
            LogSink::File(ctx.layout.tool_log())
        }
        _ => LogSink::Stderr,
    }
}

async fn run(cli: ValkitCli) -> Result<()> {
    let ctx = Context::from_args(&cli.global);
    if matches!(cli.command, Commands::Version) {
        commands::version();
        return Ok(());
    }
    logging::init_logging(&cli.global.log_level, cli.global.log_format, &log_sink(&ctx, &cli.command))?;
    tracing::debug!(home = %ctx.home().display(), rpc = %ctx.rpc, "valkit starting");

    match cli.command {
        Commands::Init(args) => commands::init::run(&ctx, args).await,
        Commands::Snapshot(command) => commands::snapshot::run(&ctx, command).await,
        Commands::Dashboard(args) => commands::dashboard::run(&ctx, args).await,
        Commands::Status(args) => commands::status::run(&ctx, args).await,
        Commands::Start => commands::node::start(&ctx),
        Commands::Stop(args) => commands::node::stop(&ctx, args).await,
        Commands::Restart(args) => commands::node::restart(&ctx, args).await,
        Commands::Update(args) => commands::update::run(&ctx, args).await,
        Commands::Peers(args) => commands::peers::run(&ctx, args.command).await,
        Commands::RegisterValidator(args) => commands::validator::register(&ctx, args).await,
        Commands::Delegate(args) => commands::validator::delegate(&ctx, args).await,
        Commands::WithdrawRewards(args) => commands::validator::withdraw(&ctx, args).await,
        Commands::Unjail(args) => commands::validator::unjail(&ctx, args).await,
        Commands::Vote(args) => commands::validator::vote(&ctx, args).await,
        Commands::Doctor => commands::doctor::run(&ctx).await,
        Commands::Version => Ok(()),
    }
}
