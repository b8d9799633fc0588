//! # Trust Parameters
//!
//! State sync needs a verified anchor: a block height and the hash of that
//! block. The height must be aligned to the snapshot interval so peers can
//! serve a snapshot there, recent enough that the remote still stores it, and
//! old enough to sit inside the trust period.
//!
//! Candidates are walked newest first:
//!
//! ```text
//! h(k) = max(1000, (latest / 1000 - lag - k) * 1000)   for k in 1..=5
//! ```
//!
//! For each candidate the block hash comes from `/block?height=h`, falling
//! back to `/commit?height=h`. The first endpoint that yields a hash wins.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    SNAPSHOT_INTERVAL, TRUST_CANDIDATES, TRUST_LAG_INTERVALS, TRUST_RPC_ATTEMPTS,
    TRUST_RPC_BACKOFF_STEP,
};
use crate::error::{Error, ErrorCode, Result};
use crate::rpc::{RpcClient, RpcError};
use crate::snapshot::download::cancellable_sleep;

/// Tuning for the candidate walk and the inner per-call retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustOptions {
    pub interval: i64,
    /// Whole intervals skipped below the latest before the first candidate.
    pub lag_intervals: i64,
    pub candidates: i64,
    /// Attempts per RPC call on non-200 replies.
    pub attempts: u32,
    /// Linear backoff unit: waits are `step`, `2*step`, ...
    pub backoff_step: Duration,
}

impl Default for TrustOptions {
    fn default() -> Self {
        Self {
            interval: SNAPSHOT_INTERVAL,
            lag_intervals: TRUST_LAG_INTERVALS,
            candidates: TRUST_CANDIDATES,
            attempts: TRUST_RPC_ATTEMPTS,
            backoff_step: TRUST_RPC_BACKOFF_STEP,
        }
    }
}

/// Verified anchor for state sync. `hash` is always upper-case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustParams {
    pub height: i64,
    pub hash: String,
}

/// Candidate heights for `latest`, newest first, without duplicates.
pub fn candidate_heights(latest: i64, options: &TrustOptions) -> Vec<i64> {
    let interval = options.interval.max(1);
    let base = latest.max(2) / interval;
    let mut out: Vec<i64> = Vec::new();
    for k in 1..=options.candidates.max(1) {
        let h = ((base - options.lag_intervals - k) * interval).max(interval);
        if out.last() != Some(&h) {
            out.push(h);
        }
    }
    out
}

/// Derives [`TrustParams`] from one or more remote RPC endpoints.
#[derive(Debug, Clone)]
pub struct TrustProvider {
    endpoints: Vec<RpcClient>,
    options: TrustOptions,
}

impl TrustProvider {
    pub fn new(endpoints: Vec<RpcClient>, options: TrustOptions) -> Self {
        Self { endpoints, options }
    }

    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<TrustParams> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled("trust parameter lookup")),
            r = self.fetch_inner(cancel) => r,
        }
    }

    async fn fetch_inner(&self, cancel: &CancellationToken) -> Result<TrustParams> {
        let mut last_error: Option<Error> = None;
        for rpc in &self.endpoints {
            match self.fetch_from(rpc, cancel).await {
                Ok(params) => {
                    info!(rpc = %rpc.base(), height = params.height, hash = %params.hash, "trust parameters selected");
                    return Ok(params);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(rpc = %rpc.base(), error = %e.chain_string(), "no trust hash from endpoint");
                    last_error = Some(e);
                }
            }
        }
        let message = "could not determine trust hash from RPC";
        Err(match last_error {
            Some(cause) => Error::wrap(ErrorCode::NetworkError, message, cause),
            None => Error::network(message),
        })
    }

    async fn fetch_from(&self, rpc: &RpcClient, cancel: &CancellationToken) -> Result<TrustParams> {
        let latest = self.latest_height(rpc, cancel).await?;
        for height in candidate_heights(latest, &self.options) {
            match self.retrying(cancel, || rpc.block(Some(height))).await {
                Ok(block) => {
                    if let Some(hash) = block.hash {
                        return Ok(TrustParams {
                            height,
                            hash: hash.to_uppercase(),
                        });
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => debug!(height, error = %e, "block lookup failed, trying commit"),
            }
            match self.retrying(cancel, || rpc.commit(height)).await {
                Ok(Some(hash)) => {
                    return Ok(TrustParams {
                        height,
                        hash: hash.to_uppercase(),
                    })
                }
                Ok(None) => debug!(height, "commit has no block id"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => debug!(height, error = %e, "commit lookup failed"),
            }
        }
        Err(Error::network(format!(
            "no candidate height near {latest} has a block hash on {}",
            rpc.base()
        )))
    }

    /// Latest height via `/status`, falling back to the latest `/block`.
    async fn latest_height(&self, rpc: &RpcClient, cancel: &CancellationToken) -> Result<i64> {
        let latest = match self.retrying(cancel, || rpc.status()).await {
            Ok(status) if status.latest_block_height > 0 => status.latest_block_height,
            Err(e) if e.is_cancelled() => return Err(e),
            _ => self.retrying(cancel, || rpc.block(None)).await?.height,
        };
        Ok(latest.max(2))
    }

    /// Runs `call` up to `attempts` times while it fails with a non-200 reply.
    /// The backoff between attempts stops early when `cancel` fires.
    async fn retrying<T, F, Fut>(&self, cancel: &CancellationToken, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut attempt = 1u32;
        loop {
            match call().await {
                Err(e) if e.status().is_some() && attempt < self.options.attempts => {
                    debug!(attempt, error = %e, "trust RPC call failed, retrying");
                    cancellable_sleep(self.options.backoff_step * attempt, cancel, "trust parameter lookup").await?;
                    attempt += 1;
                }
                other => return other.map_err(Error::from),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    fn fast() -> TrustOptions {
        TrustOptions {
            backoff_step: Duration::from_millis(1),
            ..TrustOptions::default()
        }
    }

    #[test]
    fn candidates_are_aligned_and_floored() {
        let opts = TrustOptions::default();
        assert_eq!(candidate_heights(35_000, &opts), vec![25_000, 24_000, 23_000, 22_000, 21_000]);
        assert_eq!(candidate_heights(35_999, &opts)[0], 25_000);
        assert_eq!(candidate_heights(2, &opts), vec![1_000]);

        let literal = TrustOptions {
            lag_intervals: 0,
            ..TrustOptions::default()
        };
        assert_eq!(candidate_heights(35_000, &literal)[0], 34_000);

        for latest in [0, 999, 12_345, 1_000_000] {
            for h in candidate_heights(latest, &opts) {
                assert_eq!(h % 1_000, 0);
                assert!(h >= 1_000);
            }
        }
    }

    fn status_router(latest: i64) -> Router {
        Router::new().route(
            "/status",
            get(move || async move {
                Json(json!({"result": {"node_info": {"id": "r"}, "sync_info": {"latest_block_height": latest.to_string()}}}))
            }),
        )
    }

    #[tokio::test]
    async fn falls_back_to_commit_and_uppercases() {
        let router = status_router(35_000)
            .route(
                "/block",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    match q.get("height").map(String::as_str) {
                        Some("25000") => StatusCode::NOT_FOUND.into_response(),
                        _ => "{not json".into_response(),
                    }
                }),
            )
            .route(
                "/commit",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    match q.get("height").map(String::as_str) {
                        Some("24000") => Json(json!({"result": {"signed_header": {"commit": {"block_id": {"hash": "def456"}}}}}))
                            .into_response(),
                        _ => StatusCode::NOT_FOUND.into_response(),
                    }
                }),
            );
        let rpc = RpcClient::new(&serve(router).await).unwrap();

        let params = TrustProvider::new(vec![rpc], fast())
            .fetch(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(params, TrustParams { height: 24_000, hash: "DEF456".into() });
    }

    #[tokio::test]
    async fn second_endpoint_used_when_first_is_down() {
        let dead = RpcClient::new(&serve(Router::new()).await).unwrap();
        let live = status_router(10_500).route(
            "/block",
            get(|| async { Json(json!({"result": {"block_id": {"hash": "aa11"}, "block": {"header": {"height": "0"}}}})) }),
        );
        let live = RpcClient::new(&serve(live).await).unwrap();

        let params = TrustProvider::new(vec![dead, live], fast())
            .fetch(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(params.height, 1_000);
        assert_eq!(params.hash, "AA11");
    }

    #[tokio::test]
    async fn exhausted_candidates_are_network_error() {
        let router = status_router(35_000)
            .route("/block", get(|| async { StatusCode::NOT_FOUND }))
            .route("/commit", get(|| async { StatusCode::NOT_FOUND }));
        let rpc = RpcClient::new(&serve(router).await).unwrap();

        let err = TrustProvider::new(vec![rpc], fast())
            .fetch(&CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NetworkError);
        assert_eq!(err.message(), "could not determine trust hash from RPC");
    }

    #[tokio::test]
    async fn non_200_is_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = status_router(3_000).route(
            "/block",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        Json(json!({"result": {"block_id": {"hash": "beef"}}})).into_response()
                    }
                }
            }),
        );
        let rpc = RpcClient::new(&serve(router).await).unwrap();

        let params: TrustParams = TrustProvider::new(vec![rpc], fast())
            .fetch(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(params.hash, "BEEF");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backoff_stops_when_cancelled() {
        let router = Router::new().route("/status", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let rpc = RpcClient::new(&serve(router).await).unwrap();
        let provider = TrustProvider::new(
            vec![rpc],
            TrustOptions {
                backoff_step: Duration::from_secs(3600),
                ..TrustOptions::default()
            },
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), provider.fetch_inner(&cancel))
            .await
            .expect("inner lookup should stop on cancellation")
            .unwrap_err();
        assert!(err.is_cancelled(), "{}", err.chain_string());
    }
}
