use serde_json::{json, Value};

use crate::config::Config;
use crate::fees::state::ThompsonAimdState;
use crate::profitability;
use crate::store::Database;

/// Overall node revenue summary. Always returns; sections that fail are
/// labeled unavailable rather than erroring the whole report.
pub fn status(db: &Database, config: &Config, now: f64) -> Value {
    let channels = section(|| {
        let open = db.open_channels()?;
        let capacity: u64 = open.iter().map(|(_, _, cap)| cap).sum();
        Ok(json!({
            "open": open.len(),
            "total_capacity_sats": capacity,
        }))
    });

    let forwards = section(|| {
        let day = now - 86400.0;
        let week = now - 7.0 * 86400.0;
        let mut revenue_24h = 0u64;
        let mut revenue_7d = 0u64;
        for (scid, _, _) in db.open_channels()? {
            revenue_24h += db.revenue_msat(&scid, day)?;
            revenue_7d += db.revenue_msat(&scid, week)?;
        }
        Ok(json!({
            "revenue_24h_msat": revenue_24h,
            "revenue_7d_msat": revenue_7d,
        }))
    });

    let fees = section(|| {
        let changes = db.get_recent_fee_changes(200)?;
        let week = now - 7.0 * 86400.0;
        let recent = changes.iter().filter(|c| c.ts >= week).count();
        Ok(json!({
            "changes_7d": recent,
            "last_change_ts": changes.first().map(|c| c.ts),
        }))
    });

    let rebalances = section(|| {
        let spend = db.rebalance_spend_today_msat(now)?;
        Ok(json!({
            "spend_today_sats": spend / 1000,
            "daily_budget_sats": config.rebalancer.daily_budget_sats,
        }))
    });

    let reputation = section(|| {
        let reps = db.get_all_peer_reputations()?;
        Ok(json!({ "peers_tracked": reps.len() }))
    });

    json!({
        "dry_run": config.general.dry_run,
        "channels": channels,
        "forwards": forwards,
        "fees": fees,
        "rebalances": rebalances,
        "reputation": reputation,
    })
}

fn section(f: impl FnOnce() -> anyhow::Result<Value>) -> Value {
    f().unwrap_or_else(|_| json!("unavailable"))
}

/// Per-channel algorithm and flow diagnostics.
pub fn analyze(db: &Database, scid: Option<&str>, now: f64) -> anyhow::Result<Value> {
    let channels = match scid {
        Some(scid) => {
            let peer = db.peer_for_scid(scid)?.unwrap_or_default();
            let cap = db
                .open_channels()?
                .into_iter()
                .find(|(s, _, _)| s == scid)
                .map(|(_, _, c)| c)
                .unwrap_or(0);
            vec![(scid.to_string(), peer, cap)]
        }
        None => db.open_channels()?,
    };
    if channels.is_empty() {
        return Ok(json!({ "error": "unknown_channel" }));
    }

    let week = now - 7.0 * 86400.0;
    let mut out = Vec::new();
    for (scid, peer_id, capacity_sats) in channels {
        let (inbound, outbound) = db.channel_volumes(&scid, week)?;
        let (settled, failed) = db.forward_counts(&scid, week)?;
        let algo = db.load_algo_state(&scid)?.map(|(blob, version, env)| {
            let state = ThompsonAimdState::from_blob(&blob, &version, &env);
            json!({
                "algorithm_version": state.algorithm_version,
                "posterior_mean": state.thompson.posterior_mean,
                "posterior_std": state.thompson.posterior_std,
                "observations": state.thompson.observations.len(),
                "contexts": state.thompson.contextual_posteriors.len(),
                "aimd_modifier": state.aimd.aimd_modifier,
                "aimd_active": state.aimd.is_active,
                "threat_active": state.aimd.threat_active,
                "last_fee_ppm": state.last_fee_ppm,
                "last_revenue_rate": state.last_revenue_rate,
                "is_sleeping": state.is_sleeping,
            })
        });
        out.push(json!({
            "channel_id": scid,
            "peer_id": peer_id,
            "capacity_sats": capacity_sats,
            "inbound_7d_msat": inbound,
            "outbound_7d_msat": outbound,
            "forwards_7d": settled + failed,
            "failure_rate_7d": if settled + failed > 0 {
                failed as f64 / (settled + failed) as f64
            } else {
                0.0
            },
            "revenue_7d_msat": db.revenue_msat(&scid, week)?,
            "algorithm": algo.unwrap_or(Value::Null),
        }));
    }
    Ok(json!({ "channels": out }))
}

/// Capacity utilization report across all open channels, judged against
/// the configured daily flow target.
pub fn capacity_report(db: &Database, config: &Config, now: f64) -> anyhow::Result<Value> {
    let week = now - 7.0 * 86400.0;
    let mut out = Vec::new();
    let mut total_daily_sats = 0.0;
    for (scid, peer_id, capacity_sats) in db.open_channels()? {
        let (inbound, outbound) = db.channel_volumes(&scid, week)?;
        let daily_sats = (inbound + outbound) as f64 / 1000.0 / 7.0;
        total_daily_sats += daily_sats;
        let turnover = if capacity_sats > 0 {
            (inbound + outbound) as f64 / 1000.0 / capacity_sats as f64
        } else {
            0.0
        };
        let assessment = if turnover < 0.1 {
            "underutilized"
        } else if turnover > 2.0 {
            "constrained"
        } else {
            "healthy"
        };
        out.push(json!({
            "channel_id": scid,
            "peer_id": peer_id,
            "capacity_sats": capacity_sats,
            "daily_flow_sats": daily_sats,
            "turnover_7d": turnover,
            "assessment": assessment,
        }));
    }
    Ok(json!({
        "target_flow_sats_per_day": config.flow.target_flow,
        "actual_flow_sats_per_day": total_daily_sats,
        "target_attainment": total_daily_sats / config.flow.target_flow.max(1) as f64,
        "channels": out,
    }))
}

/// Bleeder classifications, one channel or all.
pub fn profitability_report(
    db: &Database,
    scid: Option<&str>,
    now: f64,
) -> anyhow::Result<Value> {
    match scid {
        Some(scid) => Ok(profitability::analyze_channel(db, scid, now)?.to_json()),
        None => {
            let reports = profitability::analyze_all(db, now)?;
            Ok(json!({
                "channels": reports.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
            }))
        }
    }
}

/// Recent fee changes and rebalances.
pub fn history(db: &Database) -> anyhow::Result<Value> {
    let changes: Vec<Value> = db
        .get_recent_fee_changes(50)?
        .into_iter()
        .map(|c| {
            json!({
                "channel_id": c.channel_id,
                "peer_id": c.peer_id,
                "old_fee_ppm": c.old_fee_ppm,
                "new_fee_ppm": c.new_fee_ppm,
                "reason": c.reason,
                "reason_code": c.reason_code,
                "heuristic_modifiers": c.heuristic_modifiers,
                "ts": c.ts,
            })
        })
        .collect();
    let rebalances: Vec<Value> = db
        .get_recent_rebalances(50)?
        .into_iter()
        .map(|r| {
            json!({
                "from": r.from_scid,
                "to": r.to_scid,
                "amount_msat": r.amount_msat,
                "fee_msat": r.fee_msat,
                "status": r.status,
                "reason_code": r.reason_code,
                "ts": r.ts,
            })
        })
        .collect();
    Ok(json!({
        "fee_changes": changes,
        "rebalances": rebalances,
    }))
}
