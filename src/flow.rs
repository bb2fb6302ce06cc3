use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::client::NodeClient;
use crate::config::Config;
use crate::store::Database;
use crate::types::{ChannelInfo, ForwardStatus};

/// Net-flow share of total volume beyond which a channel counts as
/// directional rather than balanced.
const REGIME_RATIO: f64 = 0.3;
/// Hour-of-day volume vs. mean thresholds for time bucketing.
const PEAK_FACTOR: f64 = 1.5;
const LOW_FACTOR: f64 = 0.5;

const CURSOR_KEY: &str = "forwards_cursor";
const CONNECTED_KEY: &str = "connected_peers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRegime {
    Balanced,
    Drain,
    Sink,
}

impl FlowRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Drain => "drain",
            Self::Sink => "sink",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Low,
    #[default]
    Normal,
    Peak,
}

impl TimeBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::Peak => "peak",
        }
    }

    /// Similarity between two buckets: same 1.0, adjacent 0.5, opposite 0.2.
    pub fn similarity(self, other: TimeBucket) -> f64 {
        use TimeBucket::*;
        match (self, other) {
            (a, b) if a == b => 1.0,
            (Low, Peak) | (Peak, Low) => 0.2,
            _ => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CorridorRole {
    #[default]
    #[serde(rename = "P")]
    Primary,
    #[serde(rename = "S")]
    Secondary,
}

impl CorridorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "P",
            Self::Secondary => "S",
        }
    }

    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::Secondary)
    }
}

/// Rolling per-channel demand state derived from committed forwards.
/// Recomputed from scratch each flow cycle; safe to re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelState {
    pub scid: String,
    pub peer_id: String,
    pub capacity_msat: u64,
    pub local_msat: u64,
    pub remote_msat: u64,
    pub current_fee_ppm: u32,
    pub peer_connected: bool,
    pub inbound_volume_msat: u64,
    pub outbound_volume_msat: u64,
    pub net_flow_msat: i64,
    pub imbalance: f64,
    pub flow_regime: FlowRegime,
    pub htlc_congestion: f64,
    pub congested: bool,
    pub time_bucket: TimeBucket,
    pub corridor_role: CorridorRole,
    pub pheromone_level: f64,
    pub failure_rate: f64,
    pub forward_count: u64,
    pub age_days: f64,
}

impl ChannelState {
    pub fn local_ratio(&self) -> f64 {
        if self.capacity_msat == 0 {
            return 0.0;
        }
        self.local_msat as f64 / self.capacity_msat as f64
    }
}

/// Shared snapshot published by the flow loop and read by the fee and
/// rebalance loops.
pub type ChannelStateMap = HashMap<String, ChannelState>;

fn classify_regime(inbound: u64, outbound: u64) -> FlowRegime {
    let total = inbound + outbound;
    if total == 0 {
        return FlowRegime::Balanced;
    }
    let ratio = (outbound as f64 - inbound as f64) / total as f64;
    if ratio >= REGIME_RATIO {
        FlowRegime::Drain
    } else if ratio <= -REGIME_RATIO {
        FlowRegime::Sink
    } else {
        FlowRegime::Balanced
    }
}

fn classify_time_bucket(settled: &[(f64, u64)], now: f64) -> TimeBucket {
    if settled.is_empty() {
        return TimeBucket::Normal;
    }
    let mut by_hour = [0u64; 24];
    for (ts, msat) in settled {
        let hour = ((*ts as i64).rem_euclid(86400) / 3600) as usize;
        by_hour[hour] += msat;
    }
    let total: u64 = by_hour.iter().sum();
    if total == 0 {
        return TimeBucket::Normal;
    }
    let mean = total as f64 / 24.0;
    let current_hour = ((now as i64).rem_euclid(86400) / 3600) as usize;
    let current = by_hour[current_hour] as f64;
    if current >= PEAK_FACTOR * mean {
        TimeBucket::Peak
    } else if current <= LOW_FACTOR * mean {
        TimeBucket::Low
    } else {
        TimeBucket::Normal
    }
}

/// Median of the positive outbound volumes; channels at or above it are
/// primary corridors.
fn corridor_cutoff(volumes: &[u64]) -> Option<u64> {
    let mut positive: Vec<u64> = volumes.iter().copied().filter(|v| *v > 0).collect();
    if positive.is_empty() {
        return None;
    }
    positive.sort_unstable();
    Some(positive[positive.len() / 2])
}

/// Derive a fresh `ChannelState` for every listed channel.
pub fn analyze(
    db: &Database,
    channels: &[ChannelInfo],
    config: &Config,
    now: f64,
) -> anyhow::Result<ChannelStateMap> {
    let since = now - config.flow.flow_window_days as f64 * 86400.0;
    let days = config.flow.flow_window_days as f64;

    let mut volumes = Vec::with_capacity(channels.len());
    for ch in channels {
        let (_, outbound) = db.channel_volumes(&ch.scid(), since)?;
        volumes.push(outbound);
    }
    let cutoff = corridor_cutoff(&volumes);

    let mut map = HashMap::new();
    for (ch, outbound_volume) in channels.iter().zip(volumes) {
        let scid = ch.scid();
        if scid.is_empty() {
            continue;
        }
        let (inbound_volume, _) = db.channel_volumes(&scid, since)?;
        let (settled_count, failed_count) = db.forward_counts(&scid, since)?;
        let settled = db.settled_forwards(&scid, since)?;
        let attempts = settled_count + failed_count;

        let imbalance = if ch.total_msat == 0 {
            0.0
        } else {
            (ch.to_us_msat as f64 - ch.remote_msat() as f64) / ch.total_msat as f64
        };

        let congestion = if ch.max_accepted_htlcs == 0 {
            0.0
        } else {
            (ch.pending_htlcs as f64 / ch.max_accepted_htlcs as f64).clamp(0.0, 1.0)
        };

        let corridor_role = match cutoff {
            Some(cut) if outbound_volume >= cut && outbound_volume > 0 => CorridorRole::Primary,
            _ => CorridorRole::Secondary,
        };

        let age_days = db.channel_age_days(&scid, now)?.unwrap_or(0.0);

        map.insert(
            scid.clone(),
            ChannelState {
                scid,
                peer_id: ch.peer_id.clone(),
                capacity_msat: ch.total_msat,
                local_msat: ch.to_us_msat,
                remote_msat: ch.remote_msat(),
                current_fee_ppm: ch.fee_proportional_millionths,
                peer_connected: ch.peer_connected,
                inbound_volume_msat: inbound_volume,
                outbound_volume_msat: outbound_volume,
                net_flow_msat: outbound_volume as i64 - inbound_volume as i64,
                imbalance,
                flow_regime: classify_regime(inbound_volume, outbound_volume),
                htlc_congestion: congestion,
                congested: congestion > config.flow.htlc_congestion_threshold,
                time_bucket: classify_time_bucket(&settled, now),
                corridor_role,
                pheromone_level: settled_count as f64 / days,
                failure_rate: if attempts == 0 {
                    0.0
                } else {
                    failed_count as f64 / attempts as f64
                },
                forward_count: settled_count,
                age_days,
            },
        );
    }
    Ok(map)
}

/// Pull forwards resolved since the stored cursor and append them to the
/// store, updating peer reputation as a side effect.
pub async fn ingest_forwards(
    db: &Database,
    client: &(impl NodeClient + Sync),
    config: &Config,
) -> anyhow::Result<u64> {
    let since: f64 = db
        .get_sync(CURSOR_KEY)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0);

    let forwards = client.list_forwards(since).await?;
    let mut cursor = since;
    let mut ingested = 0u64;

    for ev in &forwards {
        let status = match ForwardStatus::parse(&ev.status) {
            Some(s) => s,
            None => continue,
        };
        let out_scid = ev.out_scid();
        if out_scid.is_empty() {
            debug!("Forward with no outbound channel dropped");
            continue;
        }
        db.record_forward(
            &ev.in_scid(),
            &out_scid,
            ev.in_msatoshi,
            ev.out_msatoshi,
            ev.fee_msatoshi,
            ev.latency_secs(),
            status,
            ev.resolved_time,
        )?;
        ingested += 1;
        if ev.resolved_time > cursor {
            cursor = ev.resolved_time;
        }

        if config.reputation.enable_reputation {
            if let Some(peer) = db.peer_for_scid(&out_scid)? {
                db.update_peer_reputation(&peer, status.is_settled())?;
            }
        }
    }

    if cursor > since {
        // Strictly-after cursor so the last batch is not re-ingested
        db.set_sync(CURSOR_KEY, &format!("{}", cursor + 1e-6))?;
    }

    if ingested > 0 {
        info!("Flow: ingested {} forwards", ingested);
    } else {
        debug!("Flow: no new forwards");
    }
    Ok(ingested)
}

/// Diff the connected-peer set against the previous cycle and record
/// connect/disconnect events.
pub async fn record_connection_events(
    db: &Database,
    client: &(impl NodeClient + Sync),
    now: f64,
) -> anyhow::Result<()> {
    let peers = client.list_peers().await?;
    let connected: Vec<String> = peers
        .iter()
        .filter(|p| p.connected)
        .map(|p| p.id.clone())
        .collect();

    if let Some(prev_json) = db.get_sync(CONNECTED_KEY)? {
        let previous: Vec<String> = serde_json::from_str(&prev_json).unwrap_or_default();
        for peer in &connected {
            if !previous.contains(peer) {
                db.record_connection_event(peer, "connect", now)?;
            }
        }
        for peer in &previous {
            if !connected.contains(peer) {
                db.record_connection_event(peer, "disconnect", now)?;
            }
        }
    }
    db.set_sync(CONNECTED_KEY, &serde_json::to_string(&connected)?)?;
    Ok(())
}

/// One flow cycle: refresh channel lifecycle, ingest forwards, decay
/// reputation, rebuild the state snapshot, and age out old rows.
pub async fn run_cycle(
    config: &Config,
    client: &(impl NodeClient + Sync),
    db: &Database,
    snapshot: &std::sync::RwLock<ChannelStateMap>,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp() as f64;
    let channels = client.list_channels().await?;

    let mut open = Vec::with_capacity(channels.len());
    for ch in &channels {
        let scid = ch.scid();
        if scid.is_empty() {
            continue;
        }
        db.upsert_channel(&scid, &ch.peer_id, ch.capacity_sats(), now)?;
        open.push(scid);
    }
    let closed = db.mark_closed_except(&open, now)?;
    for scid in &closed {
        info!("Channel closed: {}", scid);
    }

    ingest_forwards(db, client, config).await?;

    if let Err(e) = record_connection_events(db, client, now).await {
        warn!("Flow: connection event tracking failed: {:#}", e);
    }

    if config.reputation.enable_reputation {
        db.decay_reputation(config.reputation.reputation_decay)?;
    }

    let states = analyze(db, &channels, config, now)?;
    debug!("Flow: {} channel states derived", states.len());
    for (scid, state) in &states {
        db.save_channel_state(scid, &serde_json::to_string(state)?, now)?;
    }
    *snapshot.write().expect("snapshot lock poisoned") = states;

    let retention_days = std::cmp::max(8, config.flow.flow_window_days + 1);
    db.cleanup_old_data(retention_days, now)?;

    Ok(())
}
