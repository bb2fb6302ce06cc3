use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Normalize a short channel id to the `BLOCKxTXxOUTPUT` form.
///
/// Some host daemon versions report SCIDs with `:` separators; everything
/// downstream (store keys, algo state, fee broadcasts) uses the `x` form.
pub fn normalize_scid(scid: &str) -> String {
    scid.replace(':', "x")
}

/// Accept a millisatoshi amount as either a bare integer or a `"1234msat"`
/// string. Host daemons disagree on which form forward events carry; all
/// downstream code sees a plain u64.
pub fn de_msat<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct MsatVisitor;

    impl<'de> Visitor<'de> for MsatVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an integer or \"<amount>msat\" string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom("negative msat amount"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.trim_end_matches("msat")
                .parse()
                .map_err(|_| E::custom(format!("bad msat string: {}", v)))
        }
    }

    deserializer.deserialize_any(MsatVisitor)
}

/// Terminal status of a forwarded HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStatus {
    Settled,
    LocalFailed,
    Failed,
}

impl ForwardStatus {
    /// Parse a host status string. Non-terminal statuses (e.g. `offered`)
    /// return None and are dropped at the ingestion boundary.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "settled" => Some(Self::Settled),
            "local_failed" => Some(Self::LocalFailed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settled => "settled",
            Self::LocalFailed => "local_failed",
            Self::Failed => "failed",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled)
    }
}

/// One forwarded HTLC as reported by the host daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardEvent {
    pub status: String,
    #[serde(default)]
    pub in_channel: String,
    #[serde(default)]
    pub out_channel: String,
    #[serde(default, deserialize_with = "de_msat")]
    pub in_msatoshi: u64,
    #[serde(default, deserialize_with = "de_msat")]
    pub out_msatoshi: u64,
    #[serde(default, deserialize_with = "de_msat")]
    pub fee_msatoshi: u64,
    #[serde(default)]
    pub received_time: f64,
    #[serde(default)]
    pub resolved_time: f64,
}

impl ForwardEvent {
    pub fn in_scid(&self) -> String {
        normalize_scid(&self.in_channel)
    }

    pub fn out_scid(&self) -> String {
        normalize_scid(&self.out_channel)
    }

    /// Resolution latency in seconds; zero when the host omitted timestamps.
    pub fn latency_secs(&self) -> f64 {
        if self.resolved_time > self.received_time {
            self.resolved_time - self.received_time
        } else {
            0.0
        }
    }
}

/// One channel as reported by the host daemon.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub short_channel_id: String,
    pub peer_id: String,
    #[serde(default, deserialize_with = "de_msat")]
    pub to_us_msat: u64,
    #[serde(default, deserialize_with = "de_msat")]
    pub total_msat: u64,
    #[serde(default)]
    pub fee_proportional_millionths: u32,
    #[serde(default)]
    pub fee_base_msat: u32,
    #[serde(default)]
    pub pending_htlcs: u32,
    #[serde(default = "default_max_htlcs")]
    pub max_accepted_htlcs: u32,
    #[serde(default)]
    pub peer_connected: bool,
    #[serde(default)]
    pub state: String,
}

fn default_max_htlcs() -> u32 {
    483
}

impl ChannelInfo {
    pub fn scid(&self) -> String {
        normalize_scid(&self.short_channel_id)
    }

    pub fn remote_msat(&self) -> u64 {
        self.total_msat.saturating_sub(self.to_us_msat)
    }

    pub fn capacity_sats(&self) -> u64 {
        self.total_msat / 1000
    }

    /// Our share of the channel in [0, 1].
    pub fn local_ratio(&self) -> f64 {
        if self.total_msat == 0 {
            return 0.0;
        }
        self.to_us_msat as f64 / self.total_msat as f64
    }

    pub fn is_usable(&self) -> bool {
        self.peer_connected && self.state == "CHANNELD_NORMAL"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub blockheight: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RebalanceResult {
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "de_msat")]
    pub fee_paid_msat: u64,
}

impl RebalanceResult {
    pub fn succeeded(&self) -> bool {
        self.status == "complete" || self.status == "success"
    }
}

/// Fleet-threat advisory attached to a hive profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatInfo {
    #[serde(default)]
    pub is_threat: bool,
    #[serde(default)]
    pub threat_type: String,
    #[serde(default)]
    pub severity: f64,
    #[serde(default = "default_defensive_multiplier")]
    pub defensive_multiplier: f64,
    #[serde(default)]
    pub expires_at: f64,
}

fn default_defensive_multiplier() -> f64 {
    1.0
}

/// Raw fee-intel profile as returned by the hive service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HiveProfileWire {
    #[serde(default)]
    pub optimal_fee_estimate: f64,
    #[serde(default)]
    pub avg_fee_charged: f64,
    #[serde(default)]
    pub min_fee: f64,
    #[serde(default)]
    pub max_fee: f64,
    #[serde(default)]
    pub fee_volatility: f64,
    #[serde(default)]
    pub estimated_elasticity: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub hive_reporters: u32,
    #[serde(default)]
    pub last_updated: f64,
    #[serde(default)]
    pub threat: Option<ThreatInfo>,
}
