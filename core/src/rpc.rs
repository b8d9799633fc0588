//! # Node RPC Client
//!
//! Typed wrapper over the handful of CometBFT-style HTTP JSON-RPC endpoints
//! valkit consumes:
//!
//! | Call | Endpoint | Used by |
//! |------|----------|---------|
//! | [`RpcClient::status`] | `GET /status` | bootstrap, dashboard, metrics, peers |
//! | [`RpcClient::net_info`] | `GET /net_info` | bootstrap, dashboard, peer refresh |
//! | [`RpcClient::block`] | `GET /block[?height=H]` | trust provider |
//! | [`RpcClient::commit`] | `GET /commit?height=H` | trust provider |
//! | [`RpcClient::genesis`] | `GET /genesis` | bootstrap |
//! | [`RpcClient::probe`] | `POST /` (`status`) | state-sync witness selection |
//!
//! Every response is wrapped in a `{"result": ...}` envelope. Heights arrive
//! as decimal strings on most nodes and as numbers on some; both are accepted.
//! A non-200 reply or an undecodable body is an error.

use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use tracing::trace;

use crate::config::{RPC_TIMEOUT, TOOL_NAME, TOOL_VERSION};
use crate::error::{Error, ErrorCode};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("response from {url} is missing {field}")]
    Missing { url: String, field: &'static str },
}

impl RpcError {
    /// HTTP status for `Status` errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        let code = match err {
            RpcError::Missing { .. } => ErrorCode::ValidationError,
            _ => ErrorCode::NetworkError,
        };
        let message = err.to_string();
        Error::wrap(code, message, err)
    }
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// `/status` reduced to what valkit reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: String,
    pub moniker: String,
    /// Chain id.
    pub network: String,
    pub listen_addr: String,
    pub version: String,
    pub latest_block_height: i64,
    pub latest_block_time: Option<String>,
    pub catching_up: bool,
}

/// One entry of `/net_info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetPeer {
    pub id: String,
    pub moniker: String,
    pub listen_addr: String,
    pub remote_ip: String,
}

/// `/block` reduced to its id hash and header height.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: Option<String>,
    pub height: i64,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct StatusResult {
    #[serde(default)]
    node_info: NodeInfoRaw,
    #[serde(default)]
    sync_info: SyncInfoRaw,
}

#[derive(Deserialize, Default)]
struct NodeInfoRaw {
    #[serde(default)]
    id: String,
    #[serde(default)]
    moniker: String,
    #[serde(default)]
    network: String,
    #[serde(default)]
    listen_addr: String,
    #[serde(default)]
    version: String,
}

#[derive(Deserialize, Default)]
struct SyncInfoRaw {
    #[serde(default, deserialize_with = "de_height")]
    latest_block_height: i64,
    #[serde(default)]
    latest_block_time: Option<String>,
    #[serde(default)]
    catching_up: bool,
}

#[derive(Deserialize)]
struct NetInfoResult {
    #[serde(default)]
    peers: Vec<NetPeerRaw>,
}

#[derive(Deserialize)]
struct NetPeerRaw {
    #[serde(default)]
    node_info: NodeInfoRaw,
    #[serde(default)]
    remote_ip: String,
}

#[derive(Deserialize, Default)]
struct BlockId {
    #[serde(default)]
    hash: String,
}

#[derive(Deserialize, Default)]
struct Header {
    #[serde(default, deserialize_with = "de_height")]
    height: i64,
}

#[derive(Deserialize)]
struct BlockResult {
    #[serde(default)]
    block_id: BlockId,
    #[serde(default)]
    block: Option<BlockBody>,
}

#[derive(Deserialize)]
struct BlockBody {
    #[serde(default)]
    header: Header,
}

#[derive(Deserialize)]
struct CommitResult {
    signed_header: SignedHeader,
}

#[derive(Deserialize)]
struct SignedHeader {
    #[serde(default)]
    commit: Option<Commit>,
}

#[derive(Deserialize)]
struct Commit {
    #[serde(default)]
    block_id: BlockId,
}

#[derive(Deserialize)]
struct GenesisResult {
    #[serde(default)]
    genesis: Option<serde_json::Value>,
}

/// Accepts `"123"`, `123` or `null`.
fn de_height<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
        Null(()),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) if s.trim().is_empty() => Ok(0),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Raw::Null(()) => Ok(0),
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client bound to one RPC base URL. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: Client,
    base: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(base: &str) -> Result<Self, Error> {
        Self::with_timeout(base, RPC_TIMEOUT)
    }

    pub fn with_timeout(base: &str, timeout: Duration) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(format!("{TOOL_NAME}/{TOOL_VERSION}"))
            .build()
            .map_err(|e| Error::wrap(ErrorCode::GeneralError, "build HTTP client", e))?;
        Ok(Self::from_client(http, base, timeout))
    }

    /// Shares an existing connection pool.
    pub fn from_client(http: Client, base: &str, timeout: Duration) -> Self {
        Self {
            http,
            base: base.trim().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Same pool and timeout, different endpoint.
    pub fn at(&self, base: &str) -> Self {
        Self::from_client(self.http.clone(), base, self.timeout)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<(String, T), RpcError> {
        let url = format!("{}{path_and_query}", self.base);
        trace!(%url, "rpc request");
        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| RpcError::Transport {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(RpcError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(|source| RpcError::Transport {
            url: url.clone(),
            source,
        })?;
        let envelope: Envelope<T> =
            serde_json::from_slice(&body).map_err(|source| RpcError::Decode {
                url: url.clone(),
                source,
            })?;
        Ok((url, envelope.result))
    }

    pub async fn status(&self) -> Result<NodeStatus, RpcError> {
        let (_, result): (_, StatusResult) = self.get("/status").await?;
        Ok(NodeStatus {
            node_id: result.node_info.id,
            moniker: result.node_info.moniker,
            network: result.node_info.network,
            listen_addr: result.node_info.listen_addr,
            version: result.node_info.version,
            latest_block_height: result.sync_info.latest_block_height,
            latest_block_time: result.sync_info.latest_block_time,
            catching_up: result.sync_info.catching_up,
        })
    }

    pub async fn net_info(&self) -> Result<Vec<NetPeer>, RpcError> {
        let (_, result): (_, NetInfoResult) = self.get("/net_info").await?;
        Ok(result
            .peers
            .into_iter()
            .map(|p| NetPeer {
                id: p.node_info.id,
                moniker: p.node_info.moniker,
                listen_addr: p.node_info.listen_addr,
                remote_ip: p.remote_ip,
            })
            .collect())
    }

    /// Block at `height`, or the latest block when `None`.
    pub async fn block(&self, height: Option<i64>) -> Result<BlockInfo, RpcError> {
        let path = match height {
            Some(h) => format!("/block?height={h}"),
            None => "/block".to_string(),
        };
        let (_, result): (_, BlockResult) = self.get(&path).await?;
        Ok(BlockInfo {
            hash: non_empty(result.block_id.hash),
            height: result.block.map(|b| b.header.height).unwrap_or(0),
        })
    }

    /// Hash of the commit at `height`, if the node reports one.
    pub async fn commit(&self, height: i64) -> Result<Option<String>, RpcError> {
        let (_, result): (_, CommitResult) = self.get(&format!("/commit?height={height}")).await?;
        Ok(result
            .signed_header
            .commit
            .and_then(|c| non_empty(c.block_id.hash)))
    }

    /// The `result.genesis` document.
    pub async fn genesis(&self) -> Result<serde_json::Value, RpcError> {
        let (url, result): (_, GenesisResult) = self.get("/genesis").await?;
        match result.genesis {
            Some(doc) if !doc.is_null() && doc.as_object().map_or(true, |o| !o.is_empty()) => Ok(doc),
            _ => Err(RpcError::Missing {
                url,
                field: "result.genesis",
            }),
        }
    }

    /// Light-client reachability probe: JSON-RPC `status` over POST.
    pub async fn probe(&self, timeout: Duration) -> Result<(), RpcError> {
        let url = self.base.clone();
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&serde_json::json!({"jsonrpc": "2.0", "method": "status", "id": 1}))
            .send()
            .await
            .map_err(|source| RpcError::Transport {
                url: url.clone(),
                source,
            })?;
        if response.status() != StatusCode::OK {
            return Err(RpcError::Status {
                url,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Wall time of one `/status` round trip.
    pub async fn latency(&self) -> Result<(Duration, NodeStatus), RpcError> {
        let started = Instant::now();
        let status = self.status().await?;
        Ok((started.elapsed(), status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::extract::Query;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    async fn client_for(router: Router) -> RpcClient {
        RpcClient::new(&serve(router).await).unwrap()
    }

    #[tokio::test]
    async fn status_accepts_string_heights() {
        let client = client_for(Router::new().route(
            "/status",
            get(|| async {
                Json(json!({"result": {
                    "node_info": {"id": "abc", "moniker": "m", "network": "C-1", "listen_addr": "tcp://0.0.0.0:26656"},
                    "sync_info": {"latest_block_height": "4521", "catching_up": true}
                }}))
            }),
        ))
        .await;

        let status = client.status().await.unwrap();
        assert_eq!(status.node_id, "abc");
        assert_eq!(status.network, "C-1");
        assert_eq!(status.latest_block_height, 4521);
        assert!(status.catching_up);
    }

    #[tokio::test]
    async fn status_accepts_numeric_heights() {
        let client = client_for(Router::new().route(
            "/status",
            get(|| async {
                Json(json!({"result": {"node_info": {"id": "x"}, "sync_info": {"latest_block_height": 77}}}))
            }),
        ))
        .await;
        assert_eq!(client.status().await.unwrap().latest_block_height, 77);
    }

    #[tokio::test]
    async fn net_info_flattens_peers() {
        let client = client_for(Router::new().route(
            "/net_info",
            get(|| async {
                Json(json!({"result": {"peers": [
                    {"node_info": {"id": "p1", "listen_addr": "tcp://1.2.3.4:26656"}, "remote_ip": "1.2.3.4"}
                ]}}))
            }),
        ))
        .await;
        let peers = client.net_info().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, "p1");
        assert_eq!(peers[0].remote_ip, "1.2.3.4");
    }

    #[tokio::test]
    async fn block_and_commit_by_height() {
        let router = Router::new()
            .route(
                "/block",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let height = q.get("height").cloned().unwrap_or_else(|| "9000".into());
                    Json(json!({"result": {
                        "block_id": {"hash": format!("hash{height}")},
                        "block": {"header": {"height": height}}
                    }}))
                }),
            )
            .route(
                "/commit",
                get(|| async {
                    Json(json!({"result": {"signed_header": {"commit": {"block_id": {"hash": "c0ffee"}}}}}))
                }),
            );
        let client = client_for(router).await;

        let latest = client.block(None).await.unwrap();
        assert_eq!(latest.height, 9000);
        let block = client.block(Some(3000)).await.unwrap();
        assert_eq!(block.hash.as_deref(), Some("hash3000"));
        assert_eq!(client.commit(3000).await.unwrap().as_deref(), Some("c0ffee"));
    }

    #[tokio::test]
    async fn non_200_and_garbage_are_errors() {
        let router = Router::new()
            .route("/status", get(|| async { AxumStatus::NOT_FOUND }))
            .route("/net_info", get(|| async { "not json" }));
        let client = client_for(router).await;

        let err = client.status().await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(matches!(client.net_info().await.unwrap_err(), RpcError::Decode { .. }));

        let coded: Error = err.into();
        assert_eq!(coded.code(), ErrorCode::NetworkError);
    }

    #[tokio::test]
    async fn empty_genesis_is_missing_field() {
        let client = client_for(Router::new().route(
            "/genesis",
            get(|| async { Json(json!({"result": {"genesis": {}}})) }),
        ))
        .await;
        let err: Error = client.genesis().await.unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn probe_posts_jsonrpc_status() {
        let router = Router::new().route(
            "/",
            post(|Json(body): Json<serde_json::Value>| async move {
                if body["method"] == "status" && body["jsonrpc"] == "2.0" {
                    AxumStatus::OK
                } else {
                    AxumStatus::BAD_REQUEST
                }
            }),
        );
        let client = client_for(router).await;
        client.probe(Duration::from_secs(2)).await.unwrap();
    }
}
