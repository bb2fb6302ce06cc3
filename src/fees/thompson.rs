use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;

use crate::flow::{CorridorRole, TimeBucket};
use crate::hive::HiveProfile;

/// Cap on the observation ring.
pub const MAX_OBSERVATIONS: usize = 200;

const DEFAULT_PRIOR_MEAN: f64 = 200.0;
const DEFAULT_PRIOR_STD: f64 = 100.0;
const SIGMA_MIN: f64 = 10.0;

/// Below this many observations sampling widens further.
pub const COLD_START_OBSERVATIONS: usize = 5;
const COLD_START_FACTOR: f64 = 1.5;

/// Exploration modifier contract bounds.
const EXPLORE_MIN: f64 = 0.3;
const EXPLORE_MAX: f64 = 2.5;
const PHEROMONE_EXPLOIT: f64 = 10.0;
const PHEROMONE_EXPLORE: f64 = 1.0;

/// Fleet prior gate.
const HIVE_MIN_CONFIDENCE: f64 = 0.3;
const HIVE_MIN_REPORTERS: u32 = 2;

/// Contextual posterior tuning. Secondary corridors start wider and step
/// harder, so they learn faster.
const CONTEXT_MIN_SAMPLES: u32 = 3;
const CONTEXT_BASE_STEP: f64 = 0.2;
const SECONDARY_STD_FACTOR: f64 = 1.5;
const SECONDARY_STEP_FACTOR: f64 = 1.5;
const REVENUE_NORM: f64 = 50.0;

/// Discovery gates.
const DISCOVERY_MIN_OBS: usize = 5;
const DISCOVERY_OPTIMAL_MIN_OBS: usize = 10;
const DISCOVERY_REVENUE_FACTOR: f64 = 1.8;
pub const DEFAULT_MIN_REVENUE_RATE: f64 = 25.0;

/// One weighted observation of (fee, revenue rate) under a time bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub fee_ppm: f64,
    pub revenue_rate: f64,
    pub weight: f64,
    pub ts: f64,
    pub time_bucket: TimeBucket,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextPosterior {
    pub mean: f64,
    pub std: f64,
    pub count: u32,
}

/// A revenue configuration worth telling the fleet about.
#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub discovery_type: &'static str,
    pub fee_ppm: u32,
    pub revenue_rate: f64,
}

/// Gaussian posterior over the revenue-maximizing fee for one channel.
///
/// Observations are weighted by hours observed and by how similar their
/// time bucket is to the current one; fleet hints reshape the prior and
/// stigmergic context modulates how wide sampling is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianThompson {
    pub prior_mean_fee: f64,
    pub prior_std_fee: f64,
    pub posterior_mean: f64,
    pub posterior_std: f64,
    pub observations: VecDeque<Observation>,
    pub contextual_posteriors: HashMap<String, ContextPosterior>,
    // Fleet hints, kept for diagnostics once the gate passes
    pub fleet_optimal: Option<f64>,
    pub fleet_avg: f64,
    pub fleet_min: f64,
    pub fleet_max: f64,
    pub fleet_volatility: f64,
    pub fleet_confidence: f64,
    pub fleet_reporters: u32,
    // Stigmergic context
    pub pheromone_level: f64,
    pub corridor_role: CorridorRole,
    pub time_bucket: TimeBucket,
    #[serde(skip)]
    current_context_key: Option<String>,
}

impl Default for GaussianThompson {
    fn default() -> Self {
        Self {
            prior_mean_fee: DEFAULT_PRIOR_MEAN,
            prior_std_fee: DEFAULT_PRIOR_STD,
            posterior_mean: DEFAULT_PRIOR_MEAN,
            posterior_std: DEFAULT_PRIOR_STD,
            observations: VecDeque::new(),
            contextual_posteriors: HashMap::new(),
            fleet_optimal: None,
            fleet_avg: 0.0,
            fleet_min: 0.0,
            fleet_max: 0.0,
            fleet_volatility: 0.0,
            fleet_confidence: 0.0,
            fleet_reporters: 0,
            pheromone_level: 5.0,
            corridor_role: CorridorRole::Primary,
            time_bucket: TimeBucket::Normal,
            current_context_key: None,
        }
    }
}

impl GaussianThompson {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reshape the prior from a fleet profile. Profiles below the
    /// confidence/reporter gate are ignored entirely.
    pub fn apply_hive_profile(&mut self, profile: &HiveProfile) {
        if profile.confidence < HIVE_MIN_CONFIDENCE || profile.hive_reporters < HIVE_MIN_REPORTERS
        {
            return;
        }
        let w = profile.confidence;
        self.prior_mean_fee =
            (1.0 - w) * self.prior_mean_fee + w * profile.optimal_fee_estimate;
        self.prior_std_fee = (self.prior_std_fee * (1.0 + profile.fee_volatility)
            / (profile.hive_reporters as f64).sqrt())
        .max(SIGMA_MIN);

        self.fleet_optimal = Some(profile.optimal_fee_estimate);
        self.fleet_avg = profile.avg_fee_charged;
        self.fleet_min = profile.min_fee;
        self.fleet_max = profile.max_fee;
        self.fleet_volatility = profile.fee_volatility;
        self.fleet_confidence = profile.confidence;
        self.fleet_reporters = profile.hive_reporters;

        if self.observations.is_empty() {
            self.posterior_mean = self.prior_mean_fee;
            self.posterior_std = self.prior_std_fee;
        }
    }

    /// Set the stigmergic context for subsequent sampling.
    pub fn set_context_modulation(
        &mut self,
        pheromone_level: f64,
        corridor_role: CorridorRole,
        time_bucket: TimeBucket,
    ) {
        self.pheromone_level = pheromone_level;
        self.corridor_role = corridor_role;
        self.time_bucket = time_bucket;
    }

    /// Select which contextual posterior sampling may draw from.
    pub fn set_context_key(&mut self, key: String) {
        self.current_context_key = Some(key);
    }

    pub(crate) fn exploration_modifier(&self) -> f64 {
        let mut m = 1.0;
        if self.pheromone_level >= PHEROMONE_EXPLOIT {
            m *= 0.5;
        } else if self.pheromone_level <= PHEROMONE_EXPLORE {
            m *= 1.5;
        }
        if self.corridor_role.is_secondary() {
            m *= 1.3;
        }
        if self.observations.len() < COLD_START_OBSERVATIONS {
            m *= COLD_START_FACTOR;
        }
        m.clamp(EXPLORE_MIN, EXPLORE_MAX)
    }

    fn observation_weight(&self, hours: f64, bucket: TimeBucket) -> f64 {
        let hours_weight = (hours / 24.0).clamp(0.05, 1.0);
        hours_weight * bucket.similarity(self.time_bucket)
    }

    /// Ingest one (fee, revenue rate) observation and recompute the
    /// posterior. High-revenue observations pull the mean toward their fee.
    pub fn update_posterior(&mut self, fee: f64, revenue_rate: f64, hours: f64, bucket: TimeBucket) {
        let weight = self.observation_weight(hours, bucket);
        self.observations.push_back(Observation {
            fee_ppm: fee,
            revenue_rate,
            weight,
            ts: 0.0,
            time_bucket: bucket,
        });
        while self.observations.len() > MAX_OBSERVATIONS {
            self.observations.pop_front();
        }
        self.recompute();
    }

    /// Same as `update_posterior` but stamps the observation.
    pub fn update_posterior_at(
        &mut self,
        fee: f64,
        revenue_rate: f64,
        hours: f64,
        bucket: TimeBucket,
        ts: f64,
    ) {
        self.update_posterior(fee, revenue_rate, hours, bucket);
        if let Some(last) = self.observations.back_mut() {
            last.ts = ts;
        }
    }

    fn recompute(&mut self) {
        let weighted_revenue: f64 = self
            .observations
            .iter()
            .map(|o| o.weight * o.revenue_rate)
            .sum();
        self.posterior_mean = if weighted_revenue > 0.0 {
            self.observations
                .iter()
                .map(|o| o.weight * o.revenue_rate * o.fee_ppm)
                .sum::<f64>()
                / weighted_revenue
        } else {
            self.prior_mean_fee
        };
        let n_eff: f64 = self.observations.iter().map(|o| o.weight).sum();
        let variance = (self.prior_std_fee * self.prior_std_fee / (1.0 + n_eff))
            .max(SIGMA_MIN * SIGMA_MIN);
        self.posterior_std = variance.sqrt();
    }

    /// Update one contextual posterior. Secondary-corridor contexts start
    /// wider and step harder. The step scales with revenue and with the
    /// observation's time-bucket similarity to the context's own bucket.
    pub fn update_contextual(
        &mut self,
        key: &str,
        fee: f64,
        revenue_rate: f64,
        observed_bucket: Option<TimeBucket>,
    ) {
        let secondary = key.ends_with(":S");
        let key_bucket = parse_key_bucket(key);
        let entry = self
            .contextual_posteriors
            .entry(key.to_string())
            .or_insert(ContextPosterior {
                mean: self.posterior_mean,
                std: if secondary {
                    self.posterior_std * SECONDARY_STD_FACTOR
                } else {
                    self.posterior_std
                },
                count: 0,
            });

        let mut step = CONTEXT_BASE_STEP * (revenue_rate / REVENUE_NORM).min(1.0);
        if secondary {
            step *= SECONDARY_STEP_FACTOR;
        }
        if let (Some(obs), Some(ctx)) = (observed_bucket, key_bucket) {
            step *= obs.similarity(ctx);
        }

        entry.mean += step * (fee - entry.mean);
        entry.std = (entry.std * (1.0 - step / 2.0)).max(SIGMA_MIN);
        entry.count += 1;
    }

    /// Draw a fee. Uses the current contextual posterior once it has
    /// enough samples, the global posterior otherwise.
    pub fn sample_fee(&self, floor: u32, ceiling: u32) -> u32 {
        let (mean, std) = self
            .current_context_key
            .as_ref()
            .and_then(|k| self.contextual_posteriors.get(k))
            .filter(|c| c.count >= CONTEXT_MIN_SAMPLES)
            .map(|c| (c.mean, c.std))
            .unwrap_or((self.posterior_mean, self.posterior_std));

        let sigma = std * self.exploration_modifier();
        let sample = match Normal::new(mean, sigma) {
            Ok(dist) => dist.sample(&mut rand::thread_rng()),
            Err(_) => mean,
        };
        sample.round().clamp(floor as f64, ceiling as f64) as u32
    }

    /// Whether the current (fee, revenue) point is worth broadcasting.
    pub fn check_for_discovery(
        &self,
        fee: u32,
        revenue_rate: f64,
        min_revenue_rate: f64,
    ) -> Option<Discovery> {
        let n = self.observations.len();
        if n < DISCOVERY_MIN_OBS || revenue_rate < min_revenue_rate {
            return None;
        }
        let mut rates: Vec<f64> = self.observations.iter().map(|o| o.revenue_rate).collect();
        rates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = rates[rates.len() / 2];
        if revenue_rate > DISCOVERY_REVENUE_FACTOR * median {
            return Some(Discovery {
                discovery_type: "high_revenue",
                fee_ppm: fee,
                revenue_rate,
            });
        }
        if n >= DISCOVERY_OPTIMAL_MIN_OBS
            && (fee as f64 - self.posterior_mean).abs() <= self.posterior_std
        {
            return Some(Discovery {
                discovery_type: "optimal_fee",
                fee_ppm: fee,
                revenue_rate,
            });
        }
        None
    }

    /// Deterministic draw for callers that need reproducibility.
    #[cfg(test)]
    pub fn sample_fee_with<R: rand::Rng>(&self, floor: u32, ceiling: u32, rng: &mut R) -> u32 {
        let sigma = self.posterior_std * self.exploration_modifier();
        let sample = match Normal::new(self.posterior_mean, sigma) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.posterior_mean,
        };
        sample.round().clamp(floor as f64, ceiling as f64) as u32
    }
}

fn parse_key_bucket(key: &str) -> Option<TimeBucket> {
    match key.split(':').nth(2) {
        Some("low") => Some(TimeBucket::Low),
        Some("normal") => Some(TimeBucket::Normal),
        Some("peak") => Some(TimeBucket::Peak),
        _ => None,
    }
}

/// Composite context key: flow regime, reputation bucket, time bucket,
/// corridor role.
pub fn context_key(
    regime: crate::flow::FlowRegime,
    reputation_bucket: &str,
    bucket: TimeBucket,
    role: CorridorRole,
) -> String {
    format!(
        "{}:{}:{}:{}",
        regime.as_str(),
        reputation_bucket,
        bucket.as_str(),
        role.as_str()
    )
}

/// Reputation score to context bucket.
pub fn reputation_bucket(score: f64) -> &'static str {
    if score >= 2.0 {
        "strong"
    } else if score >= 0.75 {
        "medium"
    } else {
        "weak"
    }
}
