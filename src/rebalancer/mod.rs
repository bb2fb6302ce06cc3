pub mod ev;

use log::{debug, info, warn};

use crate::client::NodeClient;
use crate::config::Config;
use crate::flow::{ChannelState, ChannelStateMap, FlowRegime};
use crate::profitability::{self, RecommendedAction};
use crate::store::{Database, RebalanceRecord};
use ev::codes;

/// Local-balance ratio below which a channel wants outbound refill.
const TARGET_RATIO: f64 = 0.25;
/// Local-balance ratio above which a channel can give liquidity away.
const SOURCE_RATIO: f64 = 0.6;
/// Refill targets up to this share of capacity.
const REFILL_TO_RATIO: f64 = 0.5;
/// Consecutive failed attempts toward a target before backing off.
const FUTILITY_THRESHOLD: u32 = 3;
/// Window over which futility is judged.
const FUTILITY_WINDOW_SECS: f64 = 86_400.0;
/// At most this many submissions per cycle.
const MAX_ATTEMPTS_PER_CYCLE: usize = 2;

/// One per-target decision from a rebalance pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceDecision {
    pub from_scid: Option<String>,
    pub to_scid: String,
    pub amount_sats: u64,
    pub reason_code: &'static str,
}

fn decision(to: &str, code: &'static str) -> RebalanceDecision {
    RebalanceDecision {
        from_scid: None,
        to_scid: to.to_string(),
        amount_sats: 0,
        reason_code: code,
    }
}

/// A source must stay above half its capacity and above the wallet
/// reserve after giving liquidity away.
fn source_spare_msat(cs: &ChannelState, reserve_msat: u64) -> u64 {
    let keep = std::cmp::max(cs.capacity_msat / 2, reserve_msat);
    cs.local_msat.saturating_sub(keep)
}

fn target_deficit_msat(cs: &ChannelState) -> u64 {
    let want = (cs.capacity_msat as f64 * REFILL_TO_RATIO) as u64;
    want.saturating_sub(cs.local_msat)
}

/// One rebalance pass: pick drained targets, match them against flush
/// sources, admit on expected value, and hand execution to the plugin.
pub async fn run(
    config: &Config,
    client: &(impl NodeClient + Sync),
    db: &Database,
    states: &ChannelStateMap,
    now: f64,
) -> anyhow::Result<Vec<RebalanceDecision>> {
    if !config.rebalancer.enabled {
        debug!("Rebalancer disabled by policy");
        return Ok(Vec::new());
    }

    match client.list_plugins().await {
        Ok(plugins) if plugins.contains(&config.rebalancer.rebalancer_plugin) => {}
        Ok(_) => {
            debug!(
                "Rebalancer plugin {:?} not loaded, skipping cycle",
                config.rebalancer.rebalancer_plugin
            );
            return Ok(Vec::new());
        }
        Err(e) => {
            warn!("Plugin listing failed, skipping rebalance cycle: {:#}", e);
            return Ok(Vec::new());
        }
    }

    // Targets: outbound-drained channels, busiest corridors first.
    let mut targets: Vec<&ChannelState> = states
        .values()
        .filter(|cs| {
            cs.capacity_msat > 0
                && (cs.flow_regime == FlowRegime::Drain || cs.local_ratio() < TARGET_RATIO)
                && target_deficit_msat(cs) > 0
        })
        .collect();
    targets.sort_by(|a, b| b.outbound_volume_msat.cmp(&a.outbound_volume_msat));

    // Sources: flush channels with spare liquidity above the reserve.
    let reserve_msat = config.rebalancer.min_wallet_reserve * 1000;
    let mut sources: Vec<&ChannelState> = states
        .values()
        .filter(|cs| {
            cs.capacity_msat > 0
                && cs.peer_connected
                && (cs.flow_regime == FlowRegime::Sink || cs.local_ratio() > SOURCE_RATIO)
                && source_spare_msat(cs, reserve_msat) > 0
        })
        .collect();
    sources.sort_by(|a, b| {
        source_spare_msat(b, reserve_msat).cmp(&source_spare_msat(a, reserve_msat))
    });

    let budget_msat = config.rebalancer.daily_budget_sats * 1000;
    let mut spent_msat = db.rebalance_spend_today_msat(now)?;
    let min_profit_msat = config.rebalancer.rebalance_min_profit * 1000;

    let mut decisions = Vec::new();
    let mut attempts = 0usize;

    for target in targets {
        if attempts >= MAX_ATTEMPTS_PER_CYCLE {
            break;
        }
        let to = &target.scid;

        if !target.peer_connected {
            decisions.push(decision(to, codes::SKIP_ZOMBIE));
            continue;
        }

        let profit_report = profitability::analyze_channel(db, to, now)?;
        if profit_report.recommended_action == RecommendedAction::DisableRebalance {
            info!("Rebalancer: {} is a hard bleeder, skipping", to);
            decisions.push(decision(to, codes::SKIP_HARD_BLEEDER));
            continue;
        }

        if db.consecutive_failed_rebalances(to, now - FUTILITY_WINDOW_SECS)? >= FUTILITY_THRESHOLD
        {
            decisions.push(decision(to, codes::SKIP_FUTILITY_BREAKER));
            continue;
        }

        // Pick the flushest source not on cooldown against this target.
        let mut source = None;
        let mut any_candidate = false;
        for src in &sources {
            if src.scid == target.scid || src.peer_id == target.peer_id {
                continue;
            }
            any_candidate = true;
            let cooled = match db.last_rebalance_attempt(&src.scid, to)? {
                Some(ts) => now - ts >= config.rebalancer.cooldown_secs as f64,
                None => true,
            };
            if cooled {
                source = Some(*src);
                break;
            }
        }
        let src = match source {
            Some(src) => src,
            None => {
                decisions.push(decision(
                    to,
                    if any_candidate {
                        codes::SKIP_COOLDOWN
                    } else {
                        codes::SKIP_NO_SOURCE
                    },
                ));
                continue;
            }
        };

        let mut amount_msat =
            std::cmp::min(target_deficit_msat(target), source_spare_msat(src, reserve_msat));
        let soft_bleeder = profit_report.recommended_action == RecommendedAction::ReduceRebalance;
        if soft_bleeder {
            amount_msat /= 2;
        }
        if config.rebalancer.enable_kelly {
            amount_msat = (amount_msat as f64 * config.rebalancer.kelly_fraction) as u64;
        }
        if amount_msat < 1000 {
            decisions.push(decision(
                to,
                if soft_bleeder {
                    codes::SKIP_SOFT_BLEEDER
                } else {
                    codes::SKIP_NO_SOURCE
                },
            ));
            continue;
        }

        if ev::is_underwater(
            target.current_fee_ppm,
            src.current_fee_ppm,
            config.rebalancer.slippage_ppm,
        ) {
            decisions.push(decision(to, codes::SKIP_UNDERWATER));
            continue;
        }

        let window_secs = config.flow.flow_window_days as f64 * 86400.0;
        let p_forward = ev::p_forward_ema(db, to, window_secs, now)?;
        let er = ev::expected_revenue_msat(amount_msat, target.current_fee_ppm, p_forward);
        let ec = ev::expected_cost_msat(
            amount_msat,
            src.current_fee_ppm,
            config.rebalancer.slippage_ppm,
            config.rebalancer.fixed_overhead_sats * 1000,
        );

        if er - ec < min_profit_msat as f64 {
            debug!(
                "Rebalancer: {} -> {} EV {:.0} - {:.0} below minimum",
                src.scid, to, er, ec
            );
            decisions.push(decision(to, codes::SKIP_EV_NEGATIVE));
            continue;
        }

        // Daily spend cap: budget policy forbids going further today.
        let remaining_msat = budget_msat.saturating_sub(spent_msat);
        if ec > remaining_msat as f64 {
            info!(
                "Rebalancer: daily budget exhausted ({} of {} msat spent)",
                spent_msat, budget_msat
            );
            decisions.push(decision(to, codes::SKIP_POLICY_DISABLED));
            break;
        }

        let max_fee_msat = std::cmp::min(
            (er - min_profit_msat as f64).max(0.0) as u64,
            remaining_msat,
        );
        let amount_sats = amount_msat / 1000;
        let max_fee_sats = std::cmp::max(max_fee_msat / 1000, 1);

        info!(
            "Rebalancer: {} -> {} {} sats (max fee {} sats, p={:.2})",
            src.scid, to, amount_sats, max_fee_sats, p_forward
        );
        attempts += 1;

        if config.general.dry_run {
            info!("  (dry-run: not executing)");
            db.record_rebalance(&RebalanceRecord {
                from_scid: src.scid.clone(),
                to_scid: to.clone(),
                amount_msat,
                fee_msat: 0,
                status: "dry_run".to_string(),
                reason_code: codes::EV_POSITIVE.to_string(),
                ts: now,
            })?;
            decisions.push(RebalanceDecision {
                from_scid: Some(src.scid.clone()),
                to_scid: to.clone(),
                amount_sats,
                reason_code: codes::EV_POSITIVE,
            });
            continue;
        }

        let outcome = client
            .rebalance(&src.scid, to, amount_sats, max_fee_sats)
            .await;
        let (status, fee_msat) = match outcome {
            Ok(res) if res.succeeded() => {
                // The plugin may not report the exact routing fee; fall
                // back to the cap, which overstates cost conservatively.
                let fee = if res.fee_paid_msat > 0 {
                    res.fee_paid_msat
                } else {
                    max_fee_msat
                };
                spent_msat += fee;
                ("complete", fee)
            }
            Ok(_) => ("failed", 0),
            Err(e) => {
                warn!("Rebalancer: {} -> {} failed: {:#}", src.scid, to, e);
                ("failed", 0)
            }
        };
        db.record_rebalance(&RebalanceRecord {
            from_scid: src.scid.clone(),
            to_scid: to.clone(),
            amount_msat,
            fee_msat,
            status: status.to_string(),
            reason_code: codes::EV_POSITIVE.to_string(),
            ts: now,
        })?;
        decisions.push(RebalanceDecision {
            from_scid: Some(src.scid.clone()),
            to_scid: to.clone(),
            amount_sats,
            reason_code: codes::EV_POSITIVE,
        });
    }

    Ok(decisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNodeClient;
    use crate::flow::{CorridorRole, TimeBucket};
    use crate::types::ForwardStatus;

    fn channel(scid: &str, peer: &str, capacity_msat: u64, local_msat: u64, fee_ppm: u32) -> ChannelState {
        let regime = if local_msat * 5 < capacity_msat {
            FlowRegime::Drain
        } else if local_msat * 2 > capacity_msat {
            FlowRegime::Sink
        } else {
            FlowRegime::Balanced
        };
        ChannelState {
            scid: scid.to_string(),
            peer_id: peer.to_string(),
            capacity_msat,
            local_msat,
            remote_msat: capacity_msat - local_msat,
            current_fee_ppm: fee_ppm,
            peer_connected: true,
            inbound_volume_msat: 0,
            outbound_volume_msat: 1_000_000,
            net_flow_msat: 0,
            imbalance: 0.0,
            flow_regime: regime,
            htlc_congestion: 0.0,
            congested: false,
            time_bucket: TimeBucket::Normal,
            corridor_role: CorridorRole::Primary,
            pheromone_level: 5.0,
            failure_rate: 0.0,
            forward_count: 0,
            age_days: 365.0,
        }
    }

    /// Drained target at 10% local with a 1000 ppm fee, flush source at
    /// 80% local with a 100 ppm fee.
    fn happy_pair() -> ChannelStateMap {
        let mut map = ChannelStateMap::new();
        map.insert(
            "1x1x1".to_string(),
            channel("1x1x1", "peer_t", 1_000_000_000, 100_000_000, 1000),
        );
        map.insert(
            "2x2x2".to_string(),
            channel("2x2x2", "peer_s", 1_000_000_000, 800_000_000, 100),
        );
        map
    }

    fn ev_decisions(decisions: &[RebalanceDecision]) -> Vec<&RebalanceDecision> {
        decisions
            .iter()
            .filter(|d| d.reason_code == codes::EV_POSITIVE)
            .collect()
    }

    #[tokio::test]
    async fn test_admits_positive_ev_pair() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();

        let decisions = run(&config, &mock, &db, &happy_pair(), 10_000.0)
            .await
            .unwrap();
        let admitted = ev_decisions(&decisions);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].from_scid.as_deref(), Some("2x2x2"));
        assert_eq!(admitted[0].to_scid, "1x1x1");
        // deficit to 50% is 400M msat, source spare is 300M msat
        assert_eq!(admitted[0].amount_sats, 300_000);

        let calls = mock.rebalance_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "2x2x2");
        assert_eq!(calls[0].1, "1x1x1");

        let recorded = db.get_recent_rebalances(10).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, "complete");
        assert_eq!(recorded[0].reason_code, "ev_positive");
    }

    #[tokio::test]
    async fn test_skip_hard_bleeder() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();
        let now = 60.0 * 86400.0;

        // Target bleeds hard: 30d revenue 2000 sats, rebalance cost 5000
        db.record_forward("x", "1x1x1", 2_000_000, 0, 2_000_000, 0.0, ForwardStatus::Settled, now - 20.0 * 86400.0)
            .unwrap();
        db.record_rebalance(&RebalanceRecord {
            from_scid: "z".to_string(),
            to_scid: "1x1x1".to_string(),
            amount_msat: 1,
            fee_msat: 5_000_000,
            status: "complete".to_string(),
            reason_code: "ev_positive".to_string(),
            ts: now - 20.0 * 86400.0,
        })
        .unwrap();

        let decisions = run(&config, &mock, &db, &happy_pair(), now).await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.to_scid == "1x1x1" && d.reason_code == codes::SKIP_HARD_BLEEDER));
        assert!(mock.rebalance_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_soft_bleeder_halves_amount() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();
        let now = 60.0 * 86400.0;

        // 30d net +500 sats, 7d net -200 sats: soft bleeder
        db.record_forward("x", "1x1x1", 1_500_000, 0, 1_500_000, 0.0, ForwardStatus::Settled, now - 20.0 * 86400.0)
            .unwrap();
        db.record_rebalance(&RebalanceRecord {
            from_scid: "z".to_string(),
            to_scid: "1x1x1".to_string(),
            amount_msat: 1,
            fee_msat: 800_000,
            status: "complete".to_string(),
            reason_code: "ev_positive".to_string(),
            ts: now - 20.0 * 86400.0,
        })
        .unwrap();
        db.record_rebalance(&RebalanceRecord {
            from_scid: "z".to_string(),
            to_scid: "1x1x1".to_string(),
            amount_msat: 1,
            fee_msat: 200_000,
            status: "complete".to_string(),
            reason_code: "ev_positive".to_string(),
            ts: now - 2.0 * 86400.0,
        })
        .unwrap();

        let decisions = run(&config, &mock, &db, &happy_pair(), now).await.unwrap();
        let admitted = ev_decisions(&decisions);
        assert_eq!(admitted.len(), 1);
        // Half of the 300k sat amount
        assert_eq!(admitted[0].amount_sats, 150_000);
    }

    #[tokio::test]
    async fn test_skip_cooldown() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();
        let now = 10_000.0;

        db.record_rebalance(&RebalanceRecord {
            from_scid: "2x2x2".to_string(),
            to_scid: "1x1x1".to_string(),
            amount_msat: 1,
            fee_msat: 0,
            status: "failed".to_string(),
            reason_code: "ev_positive".to_string(),
            ts: now - 100.0,
        })
        .unwrap();

        let decisions = run(&config, &mock, &db, &happy_pair(), now).await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.reason_code == codes::SKIP_COOLDOWN));
        assert!(mock.rebalance_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_futility_breaker() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.rebalancer.cooldown_secs = 60;
        let mock = MockNodeClient::new();
        let now = 100_000.0;

        for i in 0..3 {
            db.record_rebalance(&RebalanceRecord {
                from_scid: "9x9x9".to_string(),
                to_scid: "1x1x1".to_string(),
                amount_msat: 1,
                fee_msat: 0,
                status: "failed".to_string(),
                reason_code: "ev_positive".to_string(),
                ts: now - 10_000.0 + i as f64,
            })
            .unwrap();
        }

        let decisions = run(&config, &mock, &db, &happy_pair(), now).await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.reason_code == codes::SKIP_FUTILITY_BREAKER));
    }

    #[tokio::test]
    async fn test_skip_zombie_target() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();

        let mut states = happy_pair();
        states.get_mut("1x1x1").unwrap().peer_connected = false;

        let decisions = run(&config, &mock, &db, &states, 10_000.0).await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.to_scid == "1x1x1" && d.reason_code == codes::SKIP_ZOMBIE));
    }

    #[tokio::test]
    async fn test_skip_underwater_target() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();

        let mut states = happy_pair();
        // Target fee cannot cover source price + slippage
        states.get_mut("1x1x1").unwrap().current_fee_ppm = 120;

        let decisions = run(&config, &mock, &db, &states, 10_000.0).await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.reason_code == codes::SKIP_UNDERWATER));
        assert!(mock.rebalance_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_ev_negative() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.rebalancer.rebalance_min_profit = 1_000_000;
        let mock = MockNodeClient::new();

        let decisions = run(&config, &mock, &db, &happy_pair(), 10_000.0)
            .await
            .unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.reason_code == codes::SKIP_EV_NEGATIVE));
    }

    #[tokio::test]
    async fn test_daily_budget_blocks_spend() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();
        let now = 10_000.0;

        // Today's budget already burned
        db.record_rebalance(&RebalanceRecord {
            from_scid: "a".to_string(),
            to_scid: "b".to_string(),
            amount_msat: 1,
            fee_msat: config.rebalancer.daily_budget_sats * 1000,
            status: "complete".to_string(),
            reason_code: "ev_positive".to_string(),
            ts: now - 100.0,
        })
        .unwrap();

        let decisions = run(&config, &mock, &db, &happy_pair(), now).await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.reason_code == codes::SKIP_POLICY_DISABLED));
        assert!(mock.rebalance_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_source_available() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();

        let mut states = ChannelStateMap::new();
        states.insert(
            "1x1x1".to_string(),
            channel("1x1x1", "peer_t", 1_000_000_000, 100_000_000, 1000),
        );

        let decisions = run(&config, &mock, &db, &states, 10_000.0).await.unwrap();
        assert!(decisions
            .iter()
            .any(|d| d.reason_code == codes::SKIP_NO_SOURCE));
    }

    #[tokio::test]
    async fn test_kelly_scales_amount() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.rebalancer.enable_kelly = true;
        config.rebalancer.kelly_fraction = 0.5;
        let mock = MockNodeClient::new();

        let decisions = run(&config, &mock, &db, &happy_pair(), 10_000.0)
            .await
            .unwrap();
        let admitted = ev_decisions(&decisions);
        assert_eq!(admitted[0].amount_sats, 150_000);
    }

    #[tokio::test]
    async fn test_dry_run_records_without_executing() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.general.dry_run = true;
        let mock = MockNodeClient::new();

        let decisions = run(&config, &mock, &db, &happy_pair(), 10_000.0)
            .await
            .unwrap();
        assert_eq!(ev_decisions(&decisions).len(), 1);
        assert!(mock.rebalance_calls.lock().unwrap().is_empty());

        let recorded = db.get_recent_rebalances(10).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, "dry_run");
        // Dry-run spend never counts against the budget
        assert_eq!(db.rebalance_spend_today_msat(10_000.0).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_plugin_missing_suppresses_cycle() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mut mock = MockNodeClient::new();
        mock.plugins = vec!["some-other-plugin".to_string()];

        let decisions = run(&config, &mock, &db, &happy_pair(), 10_000.0)
            .await
            .unwrap();
        assert!(decisions.is_empty());
        assert!(mock.rebalance_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_rebalancer_does_nothing() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.rebalancer.enabled = false;
        let mock = MockNodeClient::new();

        let decisions = run(&config, &mock, &db, &happy_pair(), 10_000.0)
            .await
            .unwrap();
        assert!(decisions.is_empty());
    }

    #[tokio::test]
    async fn test_failed_execution_recorded_as_failed() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mut mock = MockNodeClient::new();
        mock.rebalance_result = crate::types::RebalanceResult {
            status: "failed".to_string(),
            fee_paid_msat: 0,
        };

        run(&config, &mock, &db, &happy_pair(), 10_000.0)
            .await
            .unwrap();
        let recorded = db.get_recent_rebalances(10).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, "failed");
        assert_eq!(recorded[0].fee_msat, 0);
    }
}
