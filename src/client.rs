use anyhow::Context;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::config::Config;
use crate::types::{ChannelInfo, ForwardEvent, HiveProfileWire, NodeInfo, PeerSummary, RebalanceResult};

/// Tag under which fee settings are wrested from the auto-manager.
pub const UNMANAGE_TAG_FEE: &str = "lnfee";

/// One fee observation reported back to the fleet-intelligence service.
#[derive(Debug, Clone, Serialize)]
pub struct FeeObservationReport {
    pub peer_id: String,
    pub our_fee_ppm: u32,
    pub their_fee_ppm: Option<u32>,
    pub volume_msat: u64,
    pub forward_count: u64,
    pub period_hours: f64,
}

/// Everything the daemon asks of the host node and its co-plugins: the
/// node RPC surface, the auto-manager, the rebalance executor, and the
/// hive service all hang off the same RPC endpoint.
///
/// Abstracted as a trait so orchestration tests can run against a mock.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_node_info(&self) -> anyhow::Result<NodeInfo>;
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelInfo>>;
    async fn list_peers(&self) -> anyhow::Result<Vec<PeerSummary>>;
    /// Forwards resolved at or after `since`, oldest first.
    async fn list_forwards(&self, since: f64) -> anyhow::Result<Vec<ForwardEvent>>;
    async fn list_plugins(&self) -> anyhow::Result<Vec<String>>;
    async fn set_channel_fee(&self, scid: &str, fee_ppm: u32) -> anyhow::Result<()>;
    /// Peers currently managed by the auto-manager for the given tag.
    async fn clboss_managed_peers(&self, tag: &str) -> anyhow::Result<Vec<String>>;
    async fn clboss_unmanage(&self, peer_id: &str, tag: &str) -> anyhow::Result<()>;
    async fn clboss_remanage(&self, peer_id: &str, tag: Option<&str>) -> anyhow::Result<()>;
    async fn clboss_status(&self) -> anyhow::Result<Value>;
    async fn rebalance(
        &self,
        from_scid: &str,
        to_scid: &str,
        amount_sats: u64,
        max_fee_sats: u64,
    ) -> anyhow::Result<RebalanceResult>;
    async fn hive_fee_intel(&self, peer_id: &str) -> anyhow::Result<HiveProfileWire>;
    async fn hive_report_observation(&self, report: &FeeObservationReport) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: &'a Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;
const RATE_LIMIT_DELAY_MS: u64 = 100;

/// Rate-limited, retrying JSON-RPC client against the host daemon.
pub struct RpcHttpClient {
    http: reqwest::Client,
    base_url: String,
    /// Semaphore for rate limiting (1 concurrent request)
    rate_limiter: Arc<Semaphore>,
    id: std::sync::atomic::AtomicU64,
}

impl RpcHttpClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.node.rpc_timeout_secs));
        if !config.node.api_token.is_empty() {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {}", config.node.api_token);
            headers.insert(
                reqwest::header::AUTHORIZATION,
                value.parse().context("api_token is not a valid header value")?,
            );
            builder = builder.default_headers(headers);
        }
        let http = builder.build().context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: config.node.base_url.clone(),
            rate_limiter: Arc::new(Semaphore::new(1)),
            id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    async fn rate_limit(&self) -> anyhow::Result<()> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;
        sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
        Ok(())
    }

    async fn call_once(&self, method: &str, params: &Value) -> anyhow::Result<Value> {
        let id = self.id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let resp = self
            .http
            .post(&self.base_url)
            .json(&RpcRequest { method, params, id })
            .send()
            .await?;
        let body: RpcResponse = resp.json().await?;
        if let Some(err) = body.error {
            anyhow::bail!("rpc error {}: {}", err.code, err.message);
        }
        body.result
            .ok_or_else(|| anyhow::anyhow!("rpc response missing result"))
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> anyhow::Result<T> {
        for attempt in 0..MAX_RETRIES {
            self.rate_limit().await?;
            match self.call_once(method, &params).await {
                Ok(value) => {
                    debug!("{}: success", method);
                    return serde_json::from_value(value)
                        .with_context(|| format!("{}: malformed response", method));
                }
                Err(e) if attempt < MAX_RETRIES - 1 => {
                    let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                    warn!(
                        "{}: attempt {} failed ({}), retrying in {}ms",
                        method,
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "{}: all {} attempts failed: {}",
                        method,
                        MAX_RETRIES,
                        e
                    ));
                }
            }
        }
        unreachable!()
    }
}

#[derive(Deserialize)]
struct ChannelsWrapper {
    #[serde(default)]
    channels: Vec<ChannelInfo>,
}

#[derive(Deserialize)]
struct PeersWrapper {
    #[serde(default)]
    peers: Vec<PeerSummary>,
}

#[derive(Deserialize)]
struct ForwardsWrapper {
    #[serde(default)]
    forwards: Vec<ForwardEvent>,
}

#[derive(Deserialize)]
struct PluginEntry {
    name: String,
}

#[derive(Deserialize)]
struct PluginsWrapper {
    #[serde(default)]
    plugins: Vec<PluginEntry>,
}

#[derive(Deserialize)]
struct ManagedWrapper {
    #[serde(default)]
    peers: Vec<String>,
}

#[async_trait::async_trait]
impl NodeClient for RpcHttpClient {
    async fn get_node_info(&self) -> anyhow::Result<NodeInfo> {
        self.call("getinfo", json!({})).await
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelInfo>> {
        let wrapper: ChannelsWrapper = self.call("listpeerchannels", json!({})).await?;
        Ok(wrapper.channels)
    }

    async fn list_peers(&self) -> anyhow::Result<Vec<PeerSummary>> {
        let wrapper: PeersWrapper = self.call("listpeers", json!({})).await?;
        Ok(wrapper.peers)
    }

    async fn list_forwards(&self, since: f64) -> anyhow::Result<Vec<ForwardEvent>> {
        let wrapper: ForwardsWrapper = self
            .call("listforwards", json!({ "since": since }))
            .await?;
        Ok(wrapper.forwards)
    }

    async fn list_plugins(&self) -> anyhow::Result<Vec<String>> {
        let wrapper: PluginsWrapper = self.call("plugin", json!({ "subcommand": "list" })).await?;
        Ok(wrapper.plugins.into_iter().map(|p| p.name).collect())
    }

    async fn set_channel_fee(&self, scid: &str, fee_ppm: u32) -> anyhow::Result<()> {
        let _: Value = self
            .call("setchannelfee", json!({ "id": scid, "ppm": fee_ppm }))
            .await?;
        Ok(())
    }

    async fn clboss_managed_peers(&self, tag: &str) -> anyhow::Result<Vec<String>> {
        let wrapper: ManagedWrapper = self
            .call("clboss-managed", json!({ "tag": tag }))
            .await?;
        Ok(wrapper.peers)
    }

    async fn clboss_unmanage(&self, peer_id: &str, tag: &str) -> anyhow::Result<()> {
        let _: Value = self
            .call("clboss-unmanage", json!({ "peer": peer_id, "tag": tag }))
            .await?;
        Ok(())
    }

    async fn clboss_remanage(&self, peer_id: &str, tag: Option<&str>) -> anyhow::Result<()> {
        let params = match tag {
            Some(tag) => json!({ "peer": peer_id, "tag": tag }),
            None => json!({ "peer": peer_id }),
        };
        let _: Value = self.call("clboss-remanage", params).await?;
        Ok(())
    }

    async fn clboss_status(&self) -> anyhow::Result<Value> {
        self.call("clboss-status", json!({})).await
    }

    async fn rebalance(
        &self,
        from_scid: &str,
        to_scid: &str,
        amount_sats: u64,
        max_fee_sats: u64,
    ) -> anyhow::Result<RebalanceResult> {
        self.call(
            "rebalance",
            json!({
                "from": from_scid,
                "to": to_scid,
                "amount_sats": amount_sats,
                "max_fee_sats": max_fee_sats,
            }),
        )
        .await
    }

    async fn hive_fee_intel(&self, peer_id: &str) -> anyhow::Result<HiveProfileWire> {
        self.call(
            "hive-fee-intel-query",
            json!({ "peer_id": peer_id, "action": "query" }),
        )
        .await
    }

    async fn hive_report_observation(&self, report: &FeeObservationReport) -> anyhow::Result<()> {
        let _: Value = self
            .call(
                "hive-report-fee-observation",
                serde_json::to_value(report)?,
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock client for orchestration testing
// ---------------------------------------------------------------------------
