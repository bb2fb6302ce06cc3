use serde::{Deserialize, Serialize};

use crate::types::ThreatInfo;

pub const FAILURE_THRESHOLD: u32 = 3;
pub const SUCCESS_THRESHOLD: u32 = 5;
pub const MULTIPLICATIVE_DECREASE: f64 = 0.8;
pub const ADDITIVE_INCREASE: f64 = 0.05;
pub const MODIFIER_FLOOR: f64 = 0.4;

/// Additive-increase / multiplicative-decrease modulator over the Thompson
/// fee. Failure streaks cut the modifier, success streaks walk it back up.
/// A cached fleet threat multiplies on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AimdDefense {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub aimd_modifier: f64,
    pub is_active: bool,
    pub total_decreases: u64,
    // Fleet threat fields
    pub threat_active: bool,
    pub threat_type: Option<String>,
    pub threat_severity: f64,
    pub defensive_multiplier: f64,
    pub threat_expires_at: f64,
}

impl Default for AimdDefense {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            aimd_modifier: 1.0,
            is_active: false,
            total_decreases: 0,
            threat_active: false,
            threat_type: None,
            threat_severity: 0.0,
            defensive_multiplier: 1.0,
            threat_expires_at: 0.0,
        }
    }
}

impl AimdDefense {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one forward outcome attributed to this channel.
    pub fn record_outcome(&mut self, was_success: bool) {
        if was_success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if self.consecutive_successes >= SUCCESS_THRESHOLD {
                self.aimd_modifier = (self.aimd_modifier + ADDITIVE_INCREASE).min(1.0);
                self.consecutive_successes = 0;
                if self.aimd_modifier >= 1.0 {
                    self.is_active = false;
                }
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.consecutive_failures >= FAILURE_THRESHOLD {
                self.aimd_modifier =
                    (self.aimd_modifier * MULTIPLICATIVE_DECREASE).max(MODIFIER_FLOOR);
                self.is_active = true;
                self.consecutive_failures = 0;
                self.total_decreases += 1;
            }
        }
    }

    /// Cache or clear a fleet threat advisory. A severe drain threat also
    /// activates the local defense.
    pub fn update_fleet_threat(&mut self, threat: Option<&ThreatInfo>, now: f64) {
        match threat {
            Some(t) if t.is_threat && t.expires_at > now => {
                self.threat_active = true;
                self.threat_type = Some(t.threat_type.clone());
                self.threat_severity = t.severity;
                self.defensive_multiplier = t.defensive_multiplier;
                self.threat_expires_at = t.expires_at;
                if t.threat_type == "drain" && t.severity >= 0.6 {
                    self.is_active = true;
                }
            }
            _ => self.clear_threat(),
        }
    }

    fn clear_threat(&mut self) {
        self.threat_active = false;
        self.threat_type = None;
        self.threat_severity = 0.0;
        self.defensive_multiplier = 1.0;
        self.threat_expires_at = 0.0;
    }

    fn threat_in_effect(&self, now: f64) -> bool {
        self.threat_active && now < self.threat_expires_at
    }

    /// Combined modifier: local AIMD times the fleet multiplier while a
    /// threat is cached.
    pub fn effective_modifier(&self, now: f64) -> f64 {
        let threat = if self.threat_in_effect(now) {
            self.defensive_multiplier
        } else {
            1.0
        };
        self.aimd_modifier * threat
    }

    /// Apply the defense to a Thompson fee. When both the local defense
    /// and the fleet threat are neutral this is an exact clamp pass-through.
    pub fn apply_to_fee(&self, fee: u32, floor: u32, ceiling: u32, now: f64) -> u32 {
        if !self.is_active && !self.threat_in_effect(now) {
            return fee.clamp(floor, ceiling);
        }
        let adjusted = (fee as f64 * self.effective_modifier(now)).round();
        adjusted.clamp(floor as f64, ceiling as f64) as u32
    }

    pub fn is_neutral(&self, now: f64) -> bool {
        !self.is_active && !self.threat_in_effect(now)
    }

    /// Restore defaults, dropping counters, modifier, and threat cache.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
