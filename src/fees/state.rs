use log::error;
use serde::{Deserialize, Serialize};

use crate::fees::aimd::AimdDefense;
use crate::fees::thompson::GaussianThompson;
use crate::store::AlgoEnvelope;

pub const ALGO_VERSION: &str = "thompson_aimd_v2";
const LEGACY_VERSION: &str = "thompson_aimd_v1";

/// EMA smoothing for the revenue-rate signal.
pub const REVENUE_EMA_ALPHA: f64 = 0.3;

/// Consecutive unchanged decisions before a channel goes to sleep.
pub const SLEEP_AFTER_STABLE_CYCLES: u32 = 12;

/// The complete persistent brain for one channel: Thompson posterior,
/// AIMD defense, and the decision envelope.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ThompsonAimdState {
    pub thompson: GaussianThompson,
    pub aimd: AimdDefense,
    pub last_revenue_rate: f64,
    pub last_fee_ppm: u32,
    pub last_broadcast_fee_ppm: u32,
    pub last_update: f64,
    pub is_sleeping: bool,
    pub stable_cycles: u32,
    pub algorithm_version: String,
}

impl ThompsonAimdState {
    pub fn new() -> Self {
        Self {
            thompson: GaussianThompson::new(),
            aimd: AimdDefense::new(),
            algorithm_version: ALGO_VERSION.to_string(),
            ..Default::default()
        }
    }

    /// Fresh state hydrated from the legacy envelope columns.
    pub fn from_envelope(env: &AlgoEnvelope) -> Self {
        let mut state = Self::new();
        state.hydrate(env);
        state
    }

    fn hydrate(&mut self, env: &AlgoEnvelope) {
        self.last_fee_ppm = env.last_fee_ppm;
        self.last_broadcast_fee_ppm = env.last_broadcast_fee_ppm;
        self.last_revenue_rate = env.last_revenue_rate;
        self.last_update = env.last_update;
        self.is_sleeping = env.is_sleeping;
        self.stable_cycles = env.stable_cycles;
    }

    /// Decode a stored blob, migrating or discarding as needed. A v2 blob
    /// with an empty body and a corrupt blob both fall back to a fresh
    /// state carrying the envelope fields.
    pub fn from_blob(blob: &str, version: &str, env: &AlgoEnvelope) -> Self {
        match version {
            ALGO_VERSION | LEGACY_VERSION => match serde_json::from_str::<Self>(blob) {
                Ok(mut state) => {
                    state.algorithm_version = ALGO_VERSION.to_string();
                    if state.last_update == 0.0 {
                        state.hydrate(env);
                    }
                    state
                }
                Err(e) => {
                    error!("Corrupt algorithm blob discarded: {}", e);
                    Self::from_envelope(env)
                }
            },
            other => {
                error!("Unknown algorithm version {:?}, reinitializing", other);
                Self::from_envelope(env)
            }
        }
    }

    pub fn to_blob(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn envelope(&self) -> AlgoEnvelope {
        AlgoEnvelope {
            last_fee_ppm: self.last_fee_ppm,
            last_broadcast_fee_ppm: self.last_broadcast_fee_ppm,
            last_revenue_rate: self.last_revenue_rate,
            last_update: self.last_update,
            is_sleeping: self.is_sleeping,
            stable_cycles: self.stable_cycles,
        }
    }

    /// EMA over per-cycle revenue rates; the first observation initializes.
    pub fn update_ema_revenue_rate(&mut self, rate: f64) -> f64 {
        if self.last_revenue_rate == 0.0 {
            self.last_revenue_rate = rate;
        } else {
            self.last_revenue_rate =
                REVENUE_EMA_ALPHA * rate + (1.0 - REVENUE_EMA_ALPHA) * self.last_revenue_rate;
        }
        self.last_revenue_rate
    }

    /// Track a decision cycle that left the fee unchanged. Enough of them
    /// in a row puts the channel to sleep.
    pub fn note_stable_cycle(&mut self) {
        self.stable_cycles += 1;
        if self.stable_cycles >= SLEEP_AFTER_STABLE_CYCLES {
            self.is_sleeping = true;
        }
    }

    /// A change (or fresh traffic) wakes the channel.
    pub fn wake(&mut self) {
        self.stable_cycles = 0;
        self.is_sleeping = false;
    }
}
