use log::{debug, info, warn};
use std::collections::HashMap;

use crate::client::{FeeObservationReport, NodeClient};
use crate::types::{HiveProfileWire, ThreatInfo};

const CIRCUIT_FAILURES_THRESHOLD: u32 = 3;
const CIRCUIT_RESET_TIMEOUT_SECS: f64 = 60.0;
const CACHE_FRESH_TTL_SECS: f64 = 1800.0;
const CACHE_STALE_TTL_SECS: f64 = 86_400.0;
const AVAILABILITY_TTL_SECS: f64 = 60.0;
const AVAILABILITY_NEGATIVE_TTL_SECS: f64 = 15.0;

/// Plugin name the availability probe looks for.
const HIVE_PLUGIN: &str = "cl-hive";

/// Per-peer fee intel after cache/staleness handling.
#[derive(Debug, Clone)]
pub struct HiveProfile {
    pub optimal_fee_estimate: f64,
    pub avg_fee_charged: f64,
    pub min_fee: f64,
    pub max_fee: f64,
    pub fee_volatility: f64,
    pub estimated_elasticity: f64,
    pub confidence: f64,
    pub hive_reporters: u32,
    pub last_updated: f64,
    pub stale: bool,
    pub age_hours: f64,
    pub threat: Option<ThreatInfo>,
}

impl HiveProfile {
    fn from_wire(wire: &HiveProfileWire, fetched_at: f64, now: f64) -> Self {
        let age_hours = ((now - fetched_at) / 3600.0).max(0.0);
        Self {
            optimal_fee_estimate: wire.optimal_fee_estimate,
            avg_fee_charged: wire.avg_fee_charged,
            min_fee: wire.min_fee,
            max_fee: wire.max_fee,
            fee_volatility: wire.fee_volatility,
            estimated_elasticity: wire.estimated_elasticity,
            confidence: wire.confidence,
            hive_reporters: wire.hive_reporters,
            last_updated: wire.last_updated,
            stale: false,
            age_hours,
            threat: wire.threat.clone(),
        }
    }

    /// Mark stale and degrade confidence by cache age.
    fn degraded(mut self) -> Self {
        self.stale = true;
        self.confidence *= (1.0 - self.age_hours / 24.0).max(0.1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CachedProfile {
    wire: HiveProfileWire,
    fetched_at: f64,
}

/// Cached, circuit-broken client for the optional fleet-intelligence RPC.
///
/// Owned by the fee loop; single-threaded by construction. Callers never
/// see the cache or circuit state directly.
pub struct HiveBridge {
    enabled: bool,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: f64,
    cache: HashMap<String, CachedProfile>,
    availability: Option<(bool, f64)>,
    report_failures: u64,
}

impl HiveBridge {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: 0.0,
            cache: HashMap::new(),
            availability: None,
            report_failures: 0,
        }
    }

    /// Whether the hive plugin is loaded on the host. Positive answers are
    /// cached for 60s, negative for a shorter window.
    pub async fn is_available(
        &mut self,
        client: &(impl NodeClient + Sync),
        now: f64,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some((available, checked_at)) = self.availability {
            let ttl = if available {
                AVAILABILITY_TTL_SECS
            } else {
                AVAILABILITY_NEGATIVE_TTL_SECS
            };
            if now - checked_at < ttl {
                return available;
            }
        }
        let available = match client.list_plugins().await {
            Ok(plugins) => plugins.iter().any(|p| p == HIVE_PLUGIN),
            Err(e) => {
                debug!("Hive availability probe failed: {:#}", e);
                false
            }
        };
        self.availability = Some((available, now));
        available
    }

    /// Fetch fee intel for a peer. Fresh cache hits bypass the RPC; on
    /// circuit-open or RPC failure the stale cache is returned with
    /// degraded confidence.
    pub async fn get_profile(
        &mut self,
        client: &(impl NodeClient + Sync),
        peer_id: &str,
        now: f64,
    ) -> Option<HiveProfile> {
        if !self.enabled {
            return None;
        }

        if let Some(cached) = self.cache.get(peer_id) {
            if now - cached.fetched_at < CACHE_FRESH_TTL_SECS {
                return Some(HiveProfile::from_wire(&cached.wire, cached.fetched_at, now));
            }
        }

        // OPEN fails fast until the reset timeout, then permits one probe.
        if self.state == CircuitState::Open {
            if now - self.opened_at < CIRCUIT_RESET_TIMEOUT_SECS {
                return self.stale_profile(peer_id, now);
            }
            self.state = CircuitState::HalfOpen;
            debug!("Hive circuit half-open, probing");
        }

        match client.hive_fee_intel(peer_id).await {
            Ok(wire) => {
                if self.state != CircuitState::Closed {
                    info!("Hive circuit closed");
                }
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                let profile = HiveProfile::from_wire(&wire, now, now);
                self.cache.insert(
                    peer_id.to_string(),
                    CachedProfile {
                        wire,
                        fetched_at: now,
                    },
                );
                Some(profile)
            }
            Err(e) => {
                warn!("Hive query failed for {}: {:#}", peer_id, e);
                self.record_failure(now);
                self.stale_profile(peer_id, now)
            }
        }
    }

    fn record_failure(&mut self, now: f64) {
        self.consecutive_failures += 1;
        if self.state == CircuitState::HalfOpen
            || self.consecutive_failures >= CIRCUIT_FAILURES_THRESHOLD
        {
            if self.state != CircuitState::Open {
                warn!(
                    "Hive circuit open after {} consecutive failures",
                    self.consecutive_failures
                );
            }
            self.state = CircuitState::Open;
            self.opened_at = now;
        }
    }

    fn stale_profile(&self, peer_id: &str, now: f64) -> Option<HiveProfile> {
        let cached = self.cache.get(peer_id)?;
        if now - cached.fetched_at >= CACHE_STALE_TTL_SECS {
            return None;
        }
        Some(HiveProfile::from_wire(&cached.wire, cached.fetched_at, now).degraded())
    }

    /// Fire-and-forget fee observation report. Failures are counted but do
    /// not trip the breaker on their own.
    pub async fn report_observation(
        &mut self,
        client: &(impl NodeClient + Sync),
        report: FeeObservationReport,
    ) {
        if !self.enabled {
            return;
        }
        if let Err(e) = client.hive_report_observation(&report).await {
            self.report_failures += 1;
            debug!(
                "Hive observation report failed ({} total): {:#}",
                self.report_failures, e
            );
        }
    }

    pub fn report_failure_count(&self) -> u64 {
        self.report_failures
    }

    #[cfg(test)]
    fn circuit_is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}
