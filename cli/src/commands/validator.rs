//! Staking transactions through the node CLI.

use anyhow::{Context as _, Result};
use tracing::info;

use valkit_core::validator::{RegisterRequest, TxReceipt, ValidatorOps, VoteOption};

use super::Context;
use crate::cli::{DelegateArgs, RegisterArgs, TxArgs, VoteArgs, WithdrawArgs};

fn report(what: &str, receipt: &TxReceipt) {
    info!(txhash = %receipt.txhash, "{what} broadcast");
    println!("{what} submitted");
    println!("  txhash: {}", receipt.txhash);
}

pub async fn register(ctx: &Context, args: RegisterArgs) -> Result<()> {
    let validator = ctx.validator(&args.tx).await?;
    if let Some(existing) = validator.my_validator().await? {
        return Err(valkit_core::Error::precondition(format!(
            "key {} already operates validator {} ({})",
            args.tx.key, existing.moniker, existing.operator_address
        ))
        .into());
    }
    let request = RegisterRequest {
        commission_rate: args.commission_rate,
        details: args.details,
        website: args.website,
        ..RegisterRequest::new(&args.moniker, args.amount)
    };
    let receipt = validator.register(&request).await.context("create-validator failed")?;
    report("Validator registration", &receipt);
    if let Ok(evm) = validator.evm_address().await {
        println!("  EVM address: {evm}");
    }
    Ok(())
}

pub async fn delegate(ctx: &Context, args: DelegateArgs) -> Result<()> {
    let validator = ctx.validator(&args.tx).await?;
    let receipt = validator
        .delegate(&args.operator, args.amount)
        .await
        .context("delegation failed")?;
    report("Delegation", &receipt);
    Ok(())
}

pub async fn withdraw(ctx: &Context, args: WithdrawArgs) -> Result<()> {
    let validator = ctx.validator(&args.tx).await?;
    let receipt = validator
        .withdraw_rewards(args.operator.as_deref())
        .await
        .context("reward withdrawal failed")?;
    report("Reward withdrawal", &receipt);
    Ok(())
}

pub async fn unjail(ctx: &Context, args: TxArgs) -> Result<()> {
    let validator = ctx.validator(&args).await?;
    match validator.my_validator().await? {
        Some(v) if !v.jailed => {
            return Err(valkit_core::Error::precondition(format!("validator {} is not jailed", v.moniker)).into());
        }
        None => return Err(valkit_core::Error::precondition("no validator registered for this key").into()),
        Some(_) => {}
    }
    let receipt = validator.unjail().await.context("unjail failed")?;
    report("Unjail", &receipt);
    Ok(())
}

pub async fn vote(ctx: &Context, args: VoteArgs) -> Result<()> {
    let option: VoteOption = args.option.parse()?;
    let validator = ctx.validator(&args.tx).await?;
    let receipt = validator
        .vote(args.proposal_id, option)
        .await
        .with_context(|| format!("vote on proposal {} failed", args.proposal_id))?;
    report("Vote", &receipt);
    Ok(())
}
