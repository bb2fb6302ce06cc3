use crate::store::Database;

/// Fixed reason codes for rebalance decisions.
pub mod codes {
    pub const EV_POSITIVE: &str = "ev_positive";
    pub const SKIP_HARD_BLEEDER: &str = "skip_hard_bleeder";
    pub const SKIP_SOFT_BLEEDER: &str = "skip_soft_bleeder";
    pub const SKIP_NO_SOURCE: &str = "skip_no_source";
    pub const SKIP_EV_NEGATIVE: &str = "skip_ev_negative";
    pub const SKIP_COOLDOWN: &str = "skip_cooldown";
    pub const SKIP_POLICY_DISABLED: &str = "skip_policy_disabled";
    pub const SKIP_FUTILITY_BREAKER: &str = "skip_futility_breaker";
    pub const SKIP_ZOMBIE: &str = "skip_zombie";
    pub const SKIP_UNDERWATER: &str = "skip_underwater";
}

/// EMA smoothing for the forward-probability signal.
const P_FORWARD_ALPHA: f64 = 0.3;
/// Prior used before any forwards have been observed.
const P_FORWARD_PRIOR: f64 = 0.5;

/// Expected revenue from refilled outbound liquidity: the target's fee on
/// the moved amount, discounted by its forward probability.
pub fn expected_revenue_msat(amount_msat: u64, dst_fee_ppm: u32, p_forward: f64) -> f64 {
    amount_msat as f64 * dst_fee_ppm as f64 / 1_000_000.0 * p_forward
}

/// Expected cost of the circular payment: corridor price plus slippage on
/// the moved amount, plus a fixed overhead.
pub fn expected_cost_msat(
    amount_msat: u64,
    src_fee_ppm: u32,
    slippage_ppm: u32,
    overhead_msat: u64,
) -> f64 {
    amount_msat as f64 * (src_fee_ppm as f64 + slippage_ppm as f64) / 1_000_000.0
        + overhead_msat as f64
}

/// A target fee below the corridor price can never produce positive EV,
/// whatever the amount.
pub fn is_underwater(dst_fee_ppm: u32, src_fee_ppm: u32, slippage_ppm: u32) -> bool {
    dst_fee_ppm as u64 <= src_fee_ppm as u64 + slippage_ppm as u64
}

/// EMA-smoothed probability that a forward attempted through the channel
/// settles, carried across cycles in the sync store.
pub fn p_forward_ema(
    db: &Database,
    scid: &str,
    window_secs: f64,
    now: f64,
) -> anyhow::Result<f64> {
    let key = format!("pfwd:{}", scid);
    let previous: Option<f64> = db.get_sync(&key)?.and_then(|v| v.parse().ok());

    let (settled, failed) = db.forward_counts(scid, now - window_secs)?;
    let total = settled + failed;
    let observed = if total == 0 {
        None
    } else {
        Some(settled as f64 / total as f64)
    };

    let p = match (previous, observed) {
        (Some(prev), Some(obs)) => P_FORWARD_ALPHA * obs + (1.0 - P_FORWARD_ALPHA) * prev,
        (None, Some(obs)) => obs,
        (Some(prev), None) => prev,
        (None, None) => P_FORWARD_PRIOR,
    };
    let p = p.clamp(0.0, 1.0);
    db.set_sync(&key, &format!("{}", p))?;
    Ok(p)
}
