use serde::{Deserialize, Serialize};
use serde_json::json;

pub const YOUNG_CHANNEL_AGE_DAYS: f64 = 30.0;
pub const YOUNG_CHANNEL_MAX_STEP: i64 = 25;
pub const HIGH_VOLATILITY_THRESHOLD: f64 = 0.5;
pub const VOLATILITY_STEP_REDUCTION: f64 = 0.5;
pub const HIGH_FAILURE_RATE_THRESHOLD: f64 = 0.3;
pub const FAILURE_CONSERVATIVE_BIAS: f64 = 0.8;
pub const SCARCITY_OUTBOUND_RATIO: f64 = 0.2;

/// Per-decision record of which safety heuristics fired and what they did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeuristicModifiers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub young_channel: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_volatility: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_failure: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scarcity: Option<serde_json::Value>,
}

impl HeuristicModifiers {
    pub fn has_modifiers(&self) -> bool {
        self.young_channel.is_some()
            || self.high_volatility.is_some()
            || self.high_failure.is_some()
            || self.congestion.is_some()
            || self.scarcity.is_some()
    }

    pub fn modifier_codes(&self) -> Vec<&'static str> {
        let mut codes = Vec::new();
        if self.young_channel.is_some() {
            codes.push("young_channel_cap");
        }
        if self.high_volatility.is_some() {
            codes.push("high_volatility_reduce");
        }
        if self.high_failure.is_some() {
            codes.push("high_failure_conservative");
        }
        if self.congestion.is_some() {
            codes.push("congestion");
        }
        if self.scarcity.is_some() {
            codes.push("scarcity");
        }
        codes
    }

    /// Empty modifiers serialize to the empty string so the store column
    /// stays NULL-ish for the common case.
    pub fn to_json(&self) -> String {
        if !self.has_modifiers() {
            return String::new();
        }
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Lenient decode: empty or invalid input is an empty set.
    pub fn from_json(s: &str) -> Self {
        if s.is_empty() {
            return Self::default();
        }
        serde_json::from_str(s).unwrap_or_default()
    }
}

/// Channel facts the heuristics consult.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicInputs {
    pub age_days: f64,
    pub volatility: f64,
    pub failure_rate: f64,
    pub congested: bool,
    pub outbound_ratio: f64,
}

/// Shape the step from `current_fee` to `candidate_fee` and apply the
/// additive congestion/scarcity bumps. Returns the shaped fee and the
/// record of what fired.
pub fn apply(
    candidate_fee: u32,
    current_fee: u32,
    inputs: &HeuristicInputs,
    congestion_step_ppm: u32,
    scarcity_step_ppm: u32,
    floor: u32,
    ceiling: u32,
) -> (u32, HeuristicModifiers) {
    let mut mods = HeuristicModifiers::default();
    let original_step = candidate_fee as i64 - current_fee as i64;
    let mut step = original_step as f64;

    if inputs.age_days < YOUNG_CHANNEL_AGE_DAYS && step.abs() > YOUNG_CHANNEL_MAX_STEP as f64 {
        let capped = step.signum() * YOUNG_CHANNEL_MAX_STEP as f64;
        mods.young_channel = Some(json!({
            "age_days": inputs.age_days,
            "original_step": original_step,
            "capped_step": capped as i64,
        }));
        step = capped;
    }

    if inputs.volatility > HIGH_VOLATILITY_THRESHOLD && step != 0.0 {
        step *= VOLATILITY_STEP_REDUCTION;
        mods.high_volatility = Some(json!({
            "volatility": inputs.volatility,
            "reduction_factor": VOLATILITY_STEP_REDUCTION,
        }));
    }

    if inputs.failure_rate > HIGH_FAILURE_RATE_THRESHOLD && step != 0.0 {
        // Scale down, then floor the step: rounding toward negative
        // infinity biases the result toward a lower fee.
        step = (step * FAILURE_CONSERVATIVE_BIAS).floor();
        mods.high_failure = Some(json!({
            "failure_rate": inputs.failure_rate,
            "reduction_factor": FAILURE_CONSERVATIVE_BIAS,
        }));
    }

    let mut fee = current_fee as i64 + step.round() as i64;

    if inputs.congested {
        fee += congestion_step_ppm as i64;
        mods.congestion = Some(json!({ "step_ppm": congestion_step_ppm }));
    }

    if inputs.outbound_ratio < SCARCITY_OUTBOUND_RATIO {
        fee += scarcity_step_ppm as i64;
        mods.scarcity = Some(json!({
            "outbound_ratio": inputs.outbound_ratio,
            "step_ppm": scarcity_step_ppm,
        }));
    }

    let fee = fee.clamp(floor as i64, ceiling as i64) as u32;
    (fee, mods)
}
