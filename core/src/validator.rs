//! # Validator Operations
//!
//! Staking queries and transactions. valkit never signs anything itself: the
//! node binary's CLI owns the keyring, and [`NodeCliValidator`] drives it
//! with `--output json` and parses what comes back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{DEFAULT_DENOM, DEFAULT_LOCAL_RPC};
use crate::error::{Error, ErrorCode, Result};
use crate::fsutil::write_with_mode;
use crate::process::ProcessRunner;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidatorInfo {
    pub operator_address: String,
    pub moniker: String,
    /// Bonded tokens in base denomination, as printed by the chain.
    pub tokens: String,
    pub commission_rate: String,
    pub status: String,
    pub jailed: bool,
}

impl ValidatorInfo {
    pub fn is_bonded(&self) -> bool {
        self.status == "BOND_STATUS_BONDED"
    }

    /// Tokens as an integer for sorting. Unparseable amounts sort last.
    pub fn token_amount(&self) -> u128 {
        self.tokens.parse().unwrap_or(0)
    }
}

/// Receipt of a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub txhash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOption {
    Yes,
    No,
    Abstain,
    NoWithVeto,
}

impl VoteOption {
    pub fn as_cli_arg(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::Abstain => "abstain",
            Self::NoWithVeto => "no_with_veto",
        }
    }
}

impl std::str::FromStr for VoteOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            "abstain" => Ok(Self::Abstain),
            "no_with_veto" | "veto" => Ok(Self::NoWithVeto),
            other => Err(Error::invalid_args(format!(
                "invalid vote option {other:?} (yes, no, abstain, no_with_veto)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub moniker: String,
    /// Self-delegation in base denomination.
    pub amount: u128,
    pub commission_rate: String,
    pub commission_max_rate: String,
    pub commission_max_change_rate: String,
    pub min_self_delegation: String,
    pub details: Option<String>,
    pub website: Option<String>,
}

impl RegisterRequest {
    pub fn new(moniker: &str, amount: u128) -> Self {
        Self {
            moniker: moniker.to_string(),
            amount,
            commission_rate: "0.10".into(),
            commission_max_rate: "0.20".into(),
            commission_max_change_rate: "0.01".into(),
            min_self_delegation: "1".into(),
            details: None,
            website: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ValidatorOps: Send + Sync {
    async fn validators(&self) -> Result<Vec<ValidatorInfo>>;
    /// The validator operated by the local key, if registered.
    async fn my_validator(&self) -> Result<Option<ValidatorInfo>>;
    async fn evm_address(&self) -> Result<String>;
    /// Outstanding rewards of `operator`, formatted `<amount><denom>`.
    async fn rewards(&self, operator: &str) -> Result<String>;

    async fn register(&self, request: &RegisterRequest) -> Result<TxReceipt>;
    async fn delegate(&self, operator: &str, amount: u128) -> Result<TxReceipt>;
    /// Withdraws rewards (and commission) of `operator`, or of our own
    /// validator when `None`.
    async fn withdraw_rewards(&self, operator: Option<&str>) -> Result<TxReceipt>;
    async fn unjail(&self) -> Result<TxReceipt>;
    async fn vote(&self, proposal_id: u64, option: VoteOption) -> Result<TxReceipt>;
}

/// Converts a bech32 account address to `0x`-prefixed hex.
pub fn bech32_to_hex(address: &str) -> Result<String> {
    let (_, data) = bech32::decode(address.trim()).map_err(|e| {
        Error::wrap(ErrorCode::ValidationError, format!("invalid bech32 address {address:?}"), e)
    })?;
    Ok(format!("0x{}", hex::encode(data)))
}

// ---------------------------------------------------------------------------
// Node CLI implementation
// ---------------------------------------------------------------------------

/// Drives `<bin> query|tx|keys ...`.
#[derive(Clone)]
pub struct NodeCliValidator {
    runner: Arc<dyn ProcessRunner>,
    binary: String,
    home: PathBuf,
    key_name: String,
    chain_id: String,
    node: String,
    keyring_backend: String,
    denom: String,
    fees: Option<String>,
}

impl std::fmt::Debug for NodeCliValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCliValidator")
            .field("binary", &self.binary)
            .field("home", &self.home)
            .field("key_name", &self.key_name)
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl NodeCliValidator {
    pub fn new(runner: Arc<dyn ProcessRunner>, binary: &str, home: &Path, key_name: &str, chain_id: &str) -> Self {
        Self {
            runner,
            binary: binary.to_string(),
            home: home.to_path_buf(),
            key_name: key_name.to_string(),
            chain_id: chain_id.to_string(),
            node: DEFAULT_LOCAL_RPC.to_string(),
            keyring_backend: "test".to_string(),
            denom: DEFAULT_DENOM.to_string(),
            fees: None,
        }
    }

    pub fn with_node(mut self, node: &str) -> Self {
        self.node = node.to_string();
        self
    }

    pub fn with_keyring_backend(mut self, backend: &str) -> Self {
        self.keyring_backend = backend.to_string();
        self
    }

    pub fn with_fees(mut self, fees: &str) -> Self {
        self.fees = Some(fees.to_string());
        self
    }

    fn home_arg(&self) -> String {
        self.home.display().to_string()
    }

    async fn query(&self, args: &[&str]) -> Result<Value> {
        let mut full: Vec<String> = vec!["query".into()];
        full.extend(args.iter().map(|a| a.to_string()));
        full.extend(["--node".into(), self.node.clone(), "--output".into(), "json".into()]);
        let stdout = self.runner.output(&self.binary, &full).await?;
        serde_json::from_str(&stdout).map_err(|e| {
            Error::wrap(ErrorCode::ValidationError, format!("unexpected output from {} query", self.binary), e)
        })
    }

    async fn key_address(&self, bech: &str) -> Result<String> {
        let args: Vec<String> = vec![
            "keys".into(),
            "show".into(),
            self.key_name.clone(),
            "--bech".into(),
            bech.into(),
            "-a".into(),
            "--keyring-backend".into(),
            self.keyring_backend.clone(),
            "--home".into(),
            self.home_arg(),
        ];
        let out = self.runner.output(&self.binary, &args).await?;
        let address = out.trim().to_string();
        if address.is_empty() {
            return Err(Error::validation(format!("key {:?} has no address", self.key_name)));
        }
        Ok(address)
    }

    async fn tx(&self, args: Vec<String>) -> Result<TxReceipt> {
        let mut full: Vec<String> = vec!["tx".into()];
        full.extend(args);
        full.extend([
            "--from".into(),
            self.key_name.clone(),
            "--chain-id".into(),
            self.chain_id.clone(),
            "--keyring-backend".into(),
            self.keyring_backend.clone(),
            "--home".into(),
            self.home_arg(),
            "--node".into(),
            self.node.clone(),
            "--gas".into(),
            "auto".into(),
            "--gas-adjustment".into(),
            "1.5".into(),
            "--yes".into(),
            "--output".into(),
            "json".into(),
        ]);
        if let Some(fees) = &self.fees {
            full.extend(["--fees".into(), fees.clone()]);
        }
        let stdout = self.runner.output(&self.binary, &full).await?;
        let receipt = parse_tx_response(&stdout)?;
        info!(txhash = %receipt.txhash, "transaction broadcast");
        Ok(receipt)
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn parse_validator(value: &Value) -> ValidatorInfo {
    ValidatorInfo {
        operator_address: str_at(value, "/operator_address").to_string(),
        moniker: str_at(value, "/description/moniker").to_string(),
        tokens: str_at(value, "/tokens").to_string(),
        commission_rate: str_at(value, "/commission/commission_rates/rate").to_string(),
        status: str_at(value, "/status").to_string(),
        jailed: value.pointer("/jailed").and_then(Value::as_bool).unwrap_or(false),
    }
}

/// Parses the broadcast result. A non-zero `code` means the chain rejected it.
pub fn parse_tx_response(stdout: &str) -> Result<TxReceipt> {
    // Some CLIs print "gas estimate: N" before the JSON body.
    let json_start = stdout.find('{').unwrap_or(0);
    let value: Value = serde_json::from_str(stdout[json_start..].trim()).map_err(|e| {
        Error::wrap(ErrorCode::ValidationError, "unexpected transaction output", e)
    })?;
    let code = value.get("code").and_then(Value::as_u64).unwrap_or(0);
    if code != 0 {
        return Err(Error::process(format!(
            "transaction rejected (code {code}): {}",
            str_at(&value, "/raw_log")
        )));
    }
    let txhash = str_at(&value, "/txhash");
    if txhash.is_empty() {
        return Err(Error::validation("transaction output has no txhash"));
    }
    Ok(TxReceipt {
        txhash: txhash.to_string(),
    })
}

fn sum_rewards(value: &Value, denom: &str) -> String {
    // Older SDKs nest the coin list one level deeper.
    let coins = value
        .pointer("/rewards/rewards")
        .or_else(|| value.get("rewards"))
        .and_then(Value::as_array);
    let total: f64 = coins
        .into_iter()
        .flatten()
        .filter(|c| str_at(c, "/denom") == denom)
        .filter_map(|c| str_at(c, "/amount").parse::<f64>().ok())
        .sum();
    format!("{}{denom}", total.floor() as u128)
}

#[async_trait]
impl ValidatorOps for NodeCliValidator {
    async fn validators(&self) -> Result<Vec<ValidatorInfo>> {
        let value = self
            .query(&["staking", "validators", "--limit", "1000"])
            .await?;
        let mut validators: Vec<ValidatorInfo> = value
            .get("validators")
            .and_then(Value::as_array)
            .map(|list| list.iter().map(parse_validator).collect())
            .unwrap_or_default();
        validators.sort_by(|a, b| b.token_amount().cmp(&a.token_amount()));
        Ok(validators)
    }

    async fn my_validator(&self) -> Result<Option<ValidatorInfo>> {
        let operator = self.key_address("val").await?;
        match self.query(&["staking", "validator", &operator]).await {
            Ok(value) => {
                let inner = value.get("validator").unwrap_or(&value);
                Ok(Some(parse_validator(inner)))
            }
            Err(e) if e.code() == ErrorCode::ProcessError => {
                debug!(%operator, error = %e, "validator not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn evm_address(&self) -> Result<String> {
        bech32_to_hex(&self.key_address("acc").await?)
    }

    async fn rewards(&self, operator: &str) -> Result<String> {
        let value = self
            .query(&["distribution", "validator-outstanding-rewards", operator])
            .await?;
        Ok(sum_rewards(&value, &self.denom))
    }

    async fn register(&self, request: &RegisterRequest) -> Result<TxReceipt> {
        let pubkey_raw = self
            .runner
            .output(
                &self.binary,
                &["tendermint".into(), "show-validator".into(), "--home".into(), self.home_arg()],
            )
            .await?;
        let pubkey: Value = serde_json::from_str(pubkey_raw.trim()).map_err(|e| {
            Error::wrap(ErrorCode::ValidationError, "unexpected show-validator output", e)
        })?;

        let body = serde_json::json!({
            "pubkey": pubkey,
            "amount": format!("{}{}", request.amount, self.denom),
            "moniker": request.moniker,
            "details": request.details.clone().unwrap_or_default(),
            "website": request.website.clone().unwrap_or_default(),
            "commission-rate": request.commission_rate,
            "commission-max-rate": request.commission_max_rate,
            "commission-max-change-rate": request.commission_max_change_rate,
            "min-self-delegation": request.min_self_delegation,
        });
        let file = tempfile::Builder::new()
            .prefix("validator-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| Error::io("create validator definition", e))?;
        let rendered = serde_json::to_vec_pretty(&body)
            .map_err(|e| Error::wrap(ErrorCode::GeneralError, "encode validator definition", e))?;
        write_with_mode(file.path(), &rendered, 0o600)
            .map_err(|e| Error::io("write validator definition", e))?;

        self.tx(vec![
            "staking".into(),
            "create-validator".into(),
            file.path().display().to_string(),
        ])
        .await
    }

    async fn delegate(&self, operator: &str, amount: u128) -> Result<TxReceipt> {
        if amount == 0 {
            return Err(Error::invalid_args("delegation amount must be positive"));
        }
        self.tx(vec![
            "staking".into(),
            "delegate".into(),
            operator.to_string(),
            format!("{amount}{}", self.denom),
        ])
        .await
    }

    async fn withdraw_rewards(&self, operator: Option<&str>) -> Result<TxReceipt> {
        let operator = match operator {
            Some(op) => op.to_string(),
            None => self.key_address("val").await?,
        };
        self.tx(vec![
            "distribution".into(),
            "withdraw-rewards".into(),
            operator,
            "--commission".into(),
        ])
        .await
    }

    async fn unjail(&self) -> Result<TxReceipt> {
        self.tx(vec!["slashing".into(), "unjail".into()]).await
    }

    async fn vote(&self, proposal_id: u64, option: VoteOption) -> Result<TxReceipt> {
        self.tx(vec![
            "gov".into(),
            "vote".into(),
            proposal_id.to_string(),
            option.as_cli_arg().into(),
        ])
        .await
    }
}
