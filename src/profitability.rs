use serde::Serialize;
use serde_json::json;

use crate::store::Database;

/// Net-loss threshold (sats) separating minor from severe sustained bleeding.
const SEVERE_LOSS_SATS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BleederClass {
    None,
    Soft,
    Hard,
}

impl BleederClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Monitor,
    ReduceRebalance,
    DisableRebalance,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::ReduceRebalance => "reduce_rebalance",
            Self::DisableRebalance => "disable_rebalance",
        }
    }
}

/// Rolling P&L summary for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct BleederClassification {
    pub channel_id: String,
    pub peer_id: String,
    pub class: BleederClass,
    pub reason: String,
    pub revenue_1d: i64,
    pub revenue_7d: i64,
    pub revenue_30d: i64,
    pub rebalance_cost_30d: i64,
    pub net_30d: i64,
    pub net_7d: i64,
    pub recommended_action: RecommendedAction,
}

impl BleederClassification {
    pub fn is_hard_bleeder(&self) -> bool {
        self.class == BleederClass::Hard
    }

    pub fn is_soft_bleeder(&self) -> bool {
        self.class == BleederClass::Soft
    }

    pub fn is_bleeder(&self) -> bool {
        self.class != BleederClass::None
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "channel_id": self.channel_id,
            "peer_id": self.peer_id,
            "classification": self.class.as_str(),
            "reason": self.reason,
            "revenue_30d": self.revenue_30d,
            "rebalance_cost_30d": self.rebalance_cost_30d,
            "net_profit_30d": self.net_30d,
            "net_profit_7d": self.net_7d,
            "recommended_action": self.recommended_action.as_str(),
        })
    }
}

/// Classification rules, evaluated in order; first match wins.
/// All amounts in sats.
fn classify(
    revenue_30d: i64,
    cost_30d: i64,
    net_30d: i64,
    net_7d: i64,
) -> (BleederClass, RecommendedAction, String) {
    // A channel that never paid for a rebalance cannot be bleeding.
    if cost_30d == 0 {
        return (
            BleederClass::None,
            RecommendedAction::Monitor,
            "no rebalance spend".to_string(),
        );
    }
    if cost_30d > 2 * revenue_30d && net_30d < -SEVERE_LOSS_SATS {
        return (
            BleederClass::Hard,
            RecommendedAction::DisableRebalance,
            format!(
                "rebalance cost {} sats exceeds 2x revenue {} sats, net {} sats over 30d",
                cost_30d, revenue_30d, net_30d
            ),
        );
    }
    if net_30d < 0 && net_7d < 0 && net_30d.abs() > SEVERE_LOSS_SATS {
        return (
            BleederClass::Hard,
            RecommendedAction::DisableRebalance,
            format!("sustained severe loss: {} sats over 30d", net_30d),
        );
    }
    if net_30d < 0 && net_7d < 0 {
        return (
            BleederClass::Soft,
            RecommendedAction::ReduceRebalance,
            format!("sustained minor loss: {} sats over 30d", net_30d),
        );
    }
    if net_7d < 0 && net_30d > 0 {
        return (
            BleederClass::Soft,
            RecommendedAction::ReduceRebalance,
            format!("recent loss {} sats against 30d gain {} sats", net_7d, net_30d),
        );
    }
    (
        BleederClass::None,
        RecommendedAction::Monitor,
        "profitable or break-even".to_string(),
    )
}

fn msat_to_sats(msat: u64) -> i64 {
    (msat / 1000) as i64
}

/// Classify one channel over the rolling 1d/7d/30d windows.
pub fn analyze_channel(
    db: &Database,
    scid: &str,
    now: f64,
) -> anyhow::Result<BleederClassification> {
    let day = 86400.0;
    let revenue_1d = msat_to_sats(db.revenue_msat(scid, now - day)?);
    let revenue_7d = msat_to_sats(db.revenue_msat(scid, now - 7.0 * day)?);
    let revenue_30d = msat_to_sats(db.revenue_msat(scid, now - 30.0 * day)?);
    let cost_7d = msat_to_sats(db.rebalance_cost_msat(scid, now - 7.0 * day)?);
    let cost_30d = msat_to_sats(db.rebalance_cost_msat(scid, now - 30.0 * day)?);

    let net_30d = revenue_30d - cost_30d;
    let net_7d = revenue_7d - cost_7d;

    let (class, recommended_action, reason) = classify(revenue_30d, cost_30d, net_30d, net_7d);
    let peer_id = db.peer_for_scid(scid)?.unwrap_or_default();

    Ok(BleederClassification {
        channel_id: scid.to_string(),
        peer_id,
        class,
        reason,
        revenue_1d,
        revenue_7d,
        revenue_30d,
        rebalance_cost_30d: cost_30d,
        net_30d,
        net_7d,
        recommended_action,
    })
}

/// Classify every channel that saw a forward or rebalance in the last 30 days.
pub fn analyze_all(db: &Database, now: f64) -> anyhow::Result<Vec<BleederClassification>> {
    let mut scids = db.active_scids(now - 30.0 * 86400.0)?;
    scids.sort();
    scids.dedup();
    scids
        .iter()
        .map(|scid| analyze_channel(db, scid, now))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RebalanceRecord;
    use crate::types::ForwardStatus;

    fn seed_revenue(db: &Database, scid: &str, fee_msat: u64, ts: f64) {
        db.record_forward("in", scid, fee_msat, 0, fee_msat, 0.0, ForwardStatus::Settled, ts)
            .unwrap();
    }

    fn seed_cost(db: &Database, scid: &str, fee_msat: u64, ts: f64) {
        db.record_rebalance(&RebalanceRecord {
            from_scid: "src".to_string(),
            to_scid: scid.to_string(),
            amount_msat: fee_msat * 100,
            fee_msat,
            status: "complete".to_string(),
            reason_code: "ev_positive".to_string(),
            ts,
        })
        .unwrap();
    }

    #[test]
    fn test_hard_bleeder_rule() {
        // cost=5000 > 2*revenue=2000, net_30d=-3000 < -1000
        let (class, action, _) = classify(2000, 5000, -3000, -1000);
        assert_eq!(class, BleederClass::Hard);
        assert_eq!(action, RecommendedAction::DisableRebalance);
    }

    #[test]
    fn test_not_hard_when_cost_below_double() {
        let (class, _, _) = classify(2000, 3000, -1500, -100);
        // Falls through to sustained severe instead
        assert_eq!(class, BleederClass::Hard);

        // Net above threshold: no rule fires
        let (class, _, _) = classify(2000, 3000, -500, -100);
        assert_eq!(class, BleederClass::Soft); // sustained minor
    }

    #[test]
    fn test_sustained_severe_is_hard() {
        let (class, action, _) = classify(1000, 3000, -2000, -500);
        assert_eq!(class, BleederClass::Hard);
        assert_eq!(action, RecommendedAction::DisableRebalance);
    }

    #[test]
    fn test_sustained_minor_is_soft() {
        let (class, action, _) = classify(1000, 1400, -400, -100);
        assert_eq!(class, BleederClass::Soft);
        assert_eq!(action, RecommendedAction::ReduceRebalance);
    }

    #[test]
    fn test_soft_bleeder_rule() {
        // 7d negative, 30d positive
        let (class, action, _) = classify(1500, 1000, 500, -200);
        assert_eq!(class, BleederClass::Soft);
        assert_eq!(action, RecommendedAction::ReduceRebalance);
    }

    #[test]
    fn test_zero_rebalance_cost_never_bleeds() {
        let (class, action, _) = classify(100, 0, -500, -500);
        assert_eq!(class, BleederClass::None);
        assert_eq!(action, RecommendedAction::Monitor);
    }

    #[test]
    fn test_break_even_is_none() {
        let (class, _, _) = classify(1000, 1000, 0, 0);
        assert_eq!(class, BleederClass::None);
    }

    #[test]
    fn test_healthy_channel_is_none() {
        let (class, action, _) = classify(2000, 500, 1500, 400);
        assert_eq!(class, BleederClass::None);
        assert_eq!(action, RecommendedAction::Monitor);
    }

    #[test]
    fn test_analyze_channel_hard_bleeder_scenario() {
        let db = Database::open_in_memory().unwrap();
        let now = 60.0 * 86400.0;
        db.upsert_channel("1x2x3", "02aa", 1_000_000, 0.0).unwrap();

        // 30d window: revenue 2000 sats, cost 5000 sats
        seed_revenue(&db, "1x2x3", 2_000_000, now - 20.0 * 86400.0);
        seed_cost(&db, "1x2x3", 4_000_000, now - 20.0 * 86400.0);
        // 7d window: cost 1000 sats, no revenue
        seed_cost(&db, "1x2x3", 1_000_000, now - 2.0 * 86400.0);

        let report = analyze_channel(&db, "1x2x3", now).unwrap();
        assert_eq!(report.revenue_30d, 2000);
        assert_eq!(report.rebalance_cost_30d, 5000);
        assert_eq!(report.net_30d, -3000);
        assert_eq!(report.net_7d, -1000);
        assert_eq!(report.class, BleederClass::Hard);
        assert_eq!(report.recommended_action, RecommendedAction::DisableRebalance);
        assert_eq!(report.peer_id, "02aa");
        assert!(report.is_hard_bleeder());
    }

    #[test]
    fn test_analyze_channel_soft_bleeder_scenario() {
        let db = Database::open_in_memory().unwrap();
        let now = 60.0 * 86400.0;

        // 30d: revenue 1500, cost 1000 => net +500
        seed_revenue(&db, "1x2x3", 1_500_000, now - 20.0 * 86400.0);
        seed_cost(&db, "1x2x3", 800_000, now - 20.0 * 86400.0);
        // 7d: cost 200, no revenue => net -200
        seed_cost(&db, "1x2x3", 200_000, now - 2.0 * 86400.0);

        let report = analyze_channel(&db, "1x2x3", now).unwrap();
        assert_eq!(report.net_30d, 500);
        assert_eq!(report.net_7d, -200);
        assert_eq!(report.class, BleederClass::Soft);
        assert_eq!(report.recommended_action, RecommendedAction::ReduceRebalance);
    }

    #[test]
    fn test_analyze_channel_break_even() {
        let db = Database::open_in_memory().unwrap();
        let now = 60.0 * 86400.0;

        seed_revenue(&db, "1x2x3", 1_000_000, now - 10.0 * 86400.0);
        seed_cost(&db, "1x2x3", 1_000_000, now - 10.0 * 86400.0);

        let report = analyze_channel(&db, "1x2x3", now).unwrap();
        assert_eq!(report.net_30d, 0);
        assert_eq!(report.class, BleederClass::None);
        assert!(!report.is_bleeder());
    }

    #[test]
    fn test_analyze_all_covers_active_channels() {
        let db = Database::open_in_memory().unwrap();
        let now = 60.0 * 86400.0;
        seed_revenue(&db, "a", 1_000, now - 100.0);
        seed_revenue(&db, "b", 1_000, now - 100.0);
        // Outside the 30d window: not reported
        seed_revenue(&db, "old", 1_000, now - 40.0 * 86400.0);

        let reports = analyze_all(&db, now).unwrap();
        let ids: Vec<&str> = reports.iter().map(|r| r.channel_id.as_str()).collect();
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"b"));
        assert!(!ids.contains(&"old"));
    }
}
