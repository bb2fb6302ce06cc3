pub mod aimd;
pub mod heuristics;
pub mod state;
pub mod thompson;

use log::{debug, info, warn};
use std::collections::HashSet;

use crate::client::{NodeClient, UNMANAGE_TAG_FEE};
use crate::config::Config;
use crate::flow::{ChannelState, ChannelStateMap};
use crate::hive::HiveBridge;
use crate::store::{Database, FeeAdjustment};
use heuristics::HeuristicInputs;
use state::{ThompsonAimdState, ALGO_VERSION};
use thompson::{context_key, reputation_bucket, COLD_START_OBSERVATIONS, DEFAULT_MIN_REVENUE_RATE};

/// Decision reason codes, recorded with every adjustment and logged with
/// every skip.
pub mod reason {
    pub const THOMPSON_SAMPLE: &str = "thompson_sample";
    pub const THOMPSON_COLD_START: &str = "thompson_cold_start";
    pub const THOMPSON_AIMD_DEFENSE: &str = "thompson_aimd_defense";
    pub const CONGESTION: &str = "congestion";
    pub const SCARCITY: &str = "scarcity";
    pub const POLICY_PASSIVE: &str = "policy_passive";
    pub const POLICY_STATIC: &str = "policy_static";
    pub const POLICY_HIVE: &str = "policy_hive";
    pub const SKIP_SLEEPING: &str = "skip_sleeping";
    pub const SKIP_WAITING_TIME: &str = "skip_waiting_time";
    pub const SKIP_WAITING_FORWARDS: &str = "skip_waiting_forwards";
    pub const SKIP_FEE_UNCHANGED: &str = "skip_fee_unchanged";
    pub const SKIP_BROADCAST_FAILED: &str = "skip_broadcast_failed";
}

/// Outcome of one channel's fee pass.
#[derive(Debug, Clone, PartialEq)]
pub enum FeeDecision {
    Skipped(&'static str),
    Applied {
        old_fee_ppm: u32,
        new_fee_ppm: u32,
        reason_code: &'static str,
    },
}

/// One fee pass over every channel in the snapshot. Per-channel decisions
/// are strictly serial; the algo-state write is the linearization point.
pub async fn run(
    config: &Config,
    client: &(impl NodeClient + Sync),
    db: &Database,
    states: &ChannelStateMap,
    hive: &mut HiveBridge,
    now: f64,
) -> anyhow::Result<Vec<(String, FeeDecision)>> {
    let managed: HashSet<String> = if config.fees.clboss_enabled {
        match client.clboss_managed_peers(UNMANAGE_TAG_FEE).await {
            Ok(peers) => peers.into_iter().collect(),
            Err(e) => {
                warn!("Auto-manager listing failed, assuming unmanaged: {:#}", e);
                HashSet::new()
            }
        }
    } else {
        HashSet::new()
    };

    let hive_on = config.hive.enabled && hive.is_available(client, now).await;

    let mut scids: Vec<&String> = states.keys().collect();
    scids.sort();

    let mut results = Vec::with_capacity(scids.len());
    for scid in scids {
        let cs = &states[scid];
        if cs.capacity_msat == 0 {
            continue;
        }
        let decision =
            decide_channel(config, client, db, cs, hive, hive_on, &managed, now).await?;
        match &decision {
            FeeDecision::Skipped(code) => {
                debug!("Fee pass: {} skipped ({})", scid, code)
            }
            FeeDecision::Applied {
                old_fee_ppm,
                new_fee_ppm,
                reason_code,
            } => info!(
                "Fee pass: {} {} -> {} ppm ({})",
                scid, old_fee_ppm, new_fee_ppm, reason_code
            ),
        }
        results.push((scid.clone(), decision));
    }
    Ok(results)
}

#[allow(clippy::too_many_arguments)]
async fn decide_channel(
    config: &Config,
    client: &(impl NodeClient + Sync),
    db: &Database,
    cs: &ChannelState,
    hive: &mut HiveBridge,
    hive_on: bool,
    managed: &HashSet<String>,
    now: f64,
) -> anyhow::Result<FeeDecision> {
    let scid = &cs.scid;
    let floor = config.fees.min_fee_ppm;
    let ceiling = config.fees.max_fee_ppm;

    let (blob, version, envelope) = db
        .load_algo_state(scid)?
        .unwrap_or_else(|| (String::new(), ALGO_VERSION.to_string(), Default::default()));
    let mut algo = if blob.is_empty() {
        ThompsonAimdState::from_envelope(&envelope)
    } else {
        ThompsonAimdState::from_blob(&blob, &version, &envelope)
    };

    // Pre-gates. A channel with no decision history passes straight through.
    if let Some(last_change) = db.last_fee_change_ts(scid)? {
        let forwards_since = db.forwards_since(scid, last_change)?;
        if algo.is_sleeping {
            if forwards_since < config.fees.min_forwards_for_update as u64 {
                return Ok(FeeDecision::Skipped(reason::SKIP_SLEEPING));
            }
            algo.wake();
        }
        if now - last_change < config.fees.fee_cooldown_secs as f64 {
            return Ok(FeeDecision::Skipped(reason::SKIP_WAITING_TIME));
        }
        if forwards_since < config.fees.min_forwards_for_update as u64 {
            return Ok(FeeDecision::Skipped(reason::SKIP_WAITING_FORWARDS));
        }
    }

    // Policy overrides bypass the learner and force the policy value.
    let (policy, override_fee) = config.policy_for(scid);
    match policy {
        "passive" => return Ok(FeeDecision::Skipped(reason::POLICY_PASSIVE)),
        "static" => {
            let target = override_fee
                .unwrap_or(config.fees.static_fee_ppm)
                .clamp(floor, ceiling);
            return broadcast(
                config,
                client,
                db,
                cs,
                &mut algo,
                managed,
                target,
                reason::POLICY_STATIC,
                format!("static policy fee {} ppm", target),
                None,
                now,
            )
            .await;
        }
        "hive" => {
            let profile = if hive_on {
                hive.get_profile(client, &cs.peer_id, now).await
            } else {
                None
            };
            let target = match profile {
                Some(p) if p.optimal_fee_estimate > 0.0 => {
                    (p.optimal_fee_estimate.round() as u32).clamp(floor, ceiling)
                }
                _ => return Ok(FeeDecision::Skipped(reason::POLICY_HIVE)),
            };
            return broadcast(
                config,
                client,
                db,
                cs,
                &mut algo,
                managed,
                target,
                reason::POLICY_HIVE,
                format!("mirroring hive optimal {} ppm", target),
                None,
                now,
            )
            .await;
        }
        _ => {}
    }

    // Feed routing outcomes since the last decision into the defense.
    let outcome_since = if algo.last_update > 0.0 {
        algo.last_update
    } else {
        now - config.fees.fee_interval as f64
    };
    for (_, settled) in db.forward_outcomes(scid, outcome_since)? {
        algo.aimd.record_outcome(settled);
    }

    // Fleet intel reshapes the prior; a fresh profile also refreshes the
    // threat cache. A dark hive keeps the cached threat until expiry.
    let profile = if hive_on {
        hive.get_profile(client, &cs.peer_id, now).await
    } else {
        None
    };
    if let Some(p) = &profile {
        algo.thompson.apply_hive_profile(p);
        algo.aimd.update_fleet_threat(p.threat.as_ref(), now);
    }

    // Stigmergic context
    let mut pheromone = cs.pheromone_level;
    if let Some(p) = &profile {
        if !p.stale {
            pheromone += p.hive_reporters as f64;
        }
    }
    algo.thompson
        .set_context_modulation(pheromone, cs.corridor_role, cs.time_bucket);
    let rep_score = db
        .get_peer_reputation(&cs.peer_id)?
        .map(|r| r.score)
        .unwrap_or(1.0);
    let key = context_key(
        cs.flow_regime,
        reputation_bucket(rep_score),
        cs.time_bucket,
        cs.corridor_role,
    );
    algo.thompson.set_context_key(key.clone());

    // Observe the revenue rate earned at the current fee.
    let since = if algo.last_update > 0.0 {
        algo.last_update
    } else {
        now - config.fees.fee_interval as f64
    };
    let hours = ((now - since) / 3600.0).clamp(0.1, 168.0);
    let revenue_rate = db.revenue_msat(scid, since)? as f64 / hours;
    algo.thompson.update_posterior_at(
        cs.current_fee_ppm as f64,
        revenue_rate,
        hours,
        cs.time_bucket,
        now,
    );
    algo.thompson
        .update_contextual(&key, cs.current_fee_ppm as f64, revenue_rate, Some(cs.time_bucket));
    algo.update_ema_revenue_rate(revenue_rate);

    if let Some(discovery) = algo.thompson.check_for_discovery(
        cs.current_fee_ppm,
        revenue_rate,
        DEFAULT_MIN_REVENUE_RATE,
    ) {
        info!(
            "Discovery on {}: {} at {} ppm ({:.1} msat/h)",
            scid, discovery.discovery_type, discovery.fee_ppm, discovery.revenue_rate
        );
        if hive_on {
            hive.report_observation(
                client,
                crate::client::FeeObservationReport {
                    peer_id: cs.peer_id.clone(),
                    our_fee_ppm: cs.current_fee_ppm,
                    their_fee_ppm: profile.as_ref().map(|p| p.avg_fee_charged.round() as u32),
                    volume_msat: cs.outbound_volume_msat,
                    forward_count: cs.forward_count,
                    period_hours: config.flow.flow_window_days as f64 * 24.0,
                },
            )
            .await;
        }
    }

    // Thompson, then AIMD, then the safety heuristics.
    let thompson_fee = algo.thompson.sample_fee(floor, ceiling);
    let aimd_fee = algo.aimd.apply_to_fee(thompson_fee, floor, ceiling, now);

    let inputs = HeuristicInputs {
        age_days: cs.age_days,
        volatility: revenue_volatility(&algo.thompson),
        failure_rate: cs.failure_rate,
        congested: cs.congested,
        outbound_ratio: cs.local_ratio(),
    };
    let (final_fee, mods) = heuristics::apply(
        aimd_fee,
        cs.current_fee_ppm,
        &inputs,
        config.fees.congestion_step_ppm,
        config.fees.scarcity_step_ppm,
        floor,
        ceiling,
    );

    if final_fee == cs.current_fee_ppm {
        algo.note_stable_cycle();
        algo.last_update = now;
        db.save_algo_state(scid, &algo.to_blob()?, ALGO_VERSION, &algo.envelope(), now)?;
        return Ok(FeeDecision::Skipped(reason::SKIP_FEE_UNCHANGED));
    }

    let reason_code = if !algo.aimd.is_neutral(now) && aimd_fee != thompson_fee {
        reason::THOMPSON_AIMD_DEFENSE
    } else if algo.thompson.observations.len() < COLD_START_OBSERVATIONS {
        reason::THOMPSON_COLD_START
    } else {
        reason::THOMPSON_SAMPLE
    };
    let reason_text = format!(
        "thompson {} ppm, after defense {} ppm, after heuristics {} ppm",
        thompson_fee, aimd_fee, final_fee
    );

    broadcast(
        config,
        client,
        db,
        cs,
        &mut algo,
        managed,
        final_fee,
        reason_code,
        reason_text,
        Some(mods),
        now,
    )
    .await
}

/// Unmanage, broadcast, and persist one decision. On any host failure the
/// broadcast fields stay untouched so the next cycle retries.
#[allow(clippy::too_many_arguments)]
async fn broadcast(
    config: &Config,
    client: &(impl NodeClient + Sync),
    db: &Database,
    cs: &ChannelState,
    algo: &mut ThompsonAimdState,
    managed: &HashSet<String>,
    new_fee: u32,
    reason_code: &'static str,
    reason_text: String,
    mods: Option<heuristics::HeuristicModifiers>,
    now: f64,
) -> anyhow::Result<FeeDecision> {
    let scid = &cs.scid;
    let old_fee = cs.current_fee_ppm;

    if new_fee == old_fee {
        algo.note_stable_cycle();
        algo.last_update = now;
        db.save_algo_state(scid, &algo.to_blob()?, ALGO_VERSION, &algo.envelope(), now)?;
        return Ok(FeeDecision::Skipped(reason::SKIP_FEE_UNCHANGED));
    }

    if !config.general.dry_run {
        // The auto-manager must release the fee tag before we write, or it
        // reverts the change behind our back.
        if config.fees.clboss_enabled && managed.contains(&cs.peer_id) {
            if let Err(e) = client.clboss_unmanage(&cs.peer_id, UNMANAGE_TAG_FEE).await {
                warn!("Unmanage failed for {}, deferring fee change: {:#}", scid, e);
                algo.last_update = now;
                db.save_algo_state(scid, &algo.to_blob()?, ALGO_VERSION, &algo.envelope(), now)?;
                return Ok(FeeDecision::Skipped(reason::SKIP_BROADCAST_FAILED));
            }
        }
        if let Err(e) = client.set_channel_fee(scid, new_fee).await {
            warn!("Fee broadcast failed for {}: {:#}", scid, e);
            algo.last_update = now;
            db.save_algo_state(scid, &algo.to_blob()?, ALGO_VERSION, &algo.envelope(), now)?;
            return Ok(FeeDecision::Skipped(reason::SKIP_BROADCAST_FAILED));
        }
    } else {
        info!("(dry-run) {} fee {} -> {} ppm", scid, old_fee, new_fee);
    }

    algo.last_fee_ppm = new_fee;
    algo.last_broadcast_fee_ppm = new_fee;
    algo.last_update = now;
    algo.wake();

    let modifiers_json = mods.map(|m| m.to_json()).filter(|s| !s.is_empty());
    let adjustment = FeeAdjustment {
        channel_id: scid.clone(),
        peer_id: cs.peer_id.clone(),
        old_fee_ppm: old_fee,
        new_fee_ppm: new_fee,
        reason: reason_text,
        reason_code: reason_code.to_string(),
        heuristic_modifiers: modifiers_json,
        hill_climb: None,
        ts: now,
    };
    db.record_fee_decision(&adjustment, &algo.to_blob()?, ALGO_VERSION, &algo.envelope())?;

    Ok(FeeDecision::Applied {
        old_fee_ppm: old_fee,
        new_fee_ppm: new_fee,
        reason_code,
    })
}

/// Coefficient of variation of the recent observed revenue rates.
fn revenue_volatility(t: &thompson::GaussianThompson) -> f64 {
    let rates: Vec<f64> = t
        .observations
        .iter()
        .rev()
        .take(20)
        .map(|o| o.revenue_rate)
        .collect();
    if rates.len() < 2 {
        return 0.0;
    }
    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance =
        rates.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / rates.len() as f64;
    variance.sqrt() / mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNodeClient;
    use crate::flow::{CorridorRole, FlowRegime, TimeBucket};
    use crate::types::ForwardStatus;

    fn channel_state(scid: &str, peer: &str, fee_ppm: u32) -> ChannelState {
        ChannelState {
            scid: scid.to_string(),
            peer_id: peer.to_string(),
            capacity_msat: 1_000_000_000,
            local_msat: 500_000_000,
            remote_msat: 500_000_000,
            current_fee_ppm: fee_ppm,
            peer_connected: true,
            inbound_volume_msat: 10_000_000,
            outbound_volume_msat: 10_000_000,
            net_flow_msat: 0,
            imbalance: 0.0,
            flow_regime: FlowRegime::Balanced,
            htlc_congestion: 0.0,
            congested: false,
            time_bucket: TimeBucket::Normal,
            corridor_role: CorridorRole::Primary,
            pheromone_level: 5.0,
            failure_rate: 0.0,
            forward_count: 10,
            age_days: 365.0,
        }
    }

    fn states_of(cs: ChannelState) -> ChannelStateMap {
        let mut map = ChannelStateMap::new();
        map.insert(cs.scid.clone(), cs);
        map
    }

    /// Algo state with a tight posterior far from the current fee, so a
    /// pass will decide a change with overwhelming probability.
    fn trained_state(target_fee: f64) -> ThompsonAimdState {
        let mut algo = ThompsonAimdState::new();
        for _ in 0..50 {
            algo.thompson
                .update_posterior(target_fee, 100.0, 24.0, TimeBucket::Normal);
        }
        algo
    }

    fn persist(db: &Database, scid: &str, algo: &ThompsonAimdState) {
        db.save_algo_state(scid, &algo.to_blob().unwrap(), ALGO_VERSION, &algo.envelope(), 0.0)
            .unwrap();
    }

    #[tokio::test]
    async fn test_fee_pass_applies_and_clamps() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();
        let mut hive = HiveBridge::new(false);
        let now = 10_000.0;

        persist(&db, "1x1x1", &trained_state(800.0));
        let states = states_of(channel_state("1x1x1", "peer_a", 100));

        let results = run(&config, &mock, &db, &states, &mut hive, now)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        match &results[0].1 {
            FeeDecision::Applied { new_fee_ppm, .. } => {
                assert!(*new_fee_ppm >= config.fees.min_fee_ppm);
                assert!(*new_fee_ppm <= config.fees.max_fee_ppm);
                assert_ne!(*new_fee_ppm, 100);
            }
            other => panic!("expected an applied decision, got {:?}", other),
        }

        // Broadcast went out and the decision row obeys the clamp invariant
        let calls = mock.set_fee_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let changes = db.get_recent_fee_changes(10).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].new_fee_ppm >= config.fees.min_fee_ppm);
        assert!(changes[0].new_fee_ppm <= config.fees.max_fee_ppm);
    }

    #[tokio::test]
    async fn test_idempotent_second_pass_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();
        let mut hive = HiveBridge::new(false);
        let now = 10_000.0;

        persist(&db, "1x1x1", &trained_state(800.0));
        let states = states_of(channel_state("1x1x1", "peer_a", 100));

        run(&config, &mock, &db, &states, &mut hive, now).await.unwrap();
        let rows_after_first = db.get_recent_fee_changes(100).unwrap().len();

        // No new forwards since the change: the second pass skips
        let results = run(&config, &mock, &db, &states, &mut hive, now + 10.0)
            .await
            .unwrap();
        for (_, decision) in &results {
            match decision {
                FeeDecision::Skipped(code) => assert!(
                    *code == reason::SKIP_WAITING_TIME
                        || *code == reason::SKIP_WAITING_FORWARDS
                        || *code == reason::SKIP_FEE_UNCHANGED,
                    "unexpected skip code {}",
                    code
                ),
                other => panic!("second pass should skip, got {:?}", other),
            }
        }
        assert_eq!(db.get_recent_fee_changes(100).unwrap().len(), rows_after_first);
    }

    #[tokio::test]
    async fn test_unmanage_precedes_broadcast_for_managed_peer() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mut mock = MockNodeClient::new();
        mock.managed_peers = vec!["peer_a".to_string()];
        let mut hive = HiveBridge::new(false);

        persist(&db, "1x1x1", &trained_state(800.0));
        let states = states_of(channel_state("1x1x1", "peer_a", 100));

        run(&config, &mock, &db, &states, &mut hive, 10_000.0)
            .await
            .unwrap();

        let unmanage = mock.unmanage_calls.lock().unwrap();
        assert_eq!(unmanage.len(), 1);
        assert_eq!(unmanage[0], ("peer_a".to_string(), "lnfee".to_string()));
        assert_eq!(mock.set_fee_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmanaged_peer_skips_unmanage_call() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();
        let mut hive = HiveBridge::new(false);

        persist(&db, "1x1x1", &trained_state(800.0));
        let states = states_of(channel_state("1x1x1", "peer_a", 100));

        run(&config, &mock, &db, &states, &mut hive, 10_000.0)
            .await
            .unwrap();
        assert!(mock.unmanage_calls.lock().unwrap().is_empty());
        assert_eq!(mock.set_fee_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_suppresses_host_writes() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.general.dry_run = true;
        let mut mock = MockNodeClient::new();
        mock.managed_peers = vec!["peer_a".to_string()];
        let mut hive = HiveBridge::new(false);

        persist(&db, "1x1x1", &trained_state(800.0));
        let states = states_of(channel_state("1x1x1", "peer_a", 100));

        let results = run(&config, &mock, &db, &states, &mut hive, 10_000.0)
            .await
            .unwrap();

        assert!(mock.set_fee_calls.lock().unwrap().is_empty());
        assert!(mock.unmanage_calls.lock().unwrap().is_empty());
        // Internal state evolved as if the decision executed
        assert!(matches!(results[0].1, FeeDecision::Applied { .. }));
        assert_eq!(db.get_recent_fee_changes(10).unwrap().len(), 1);
        let (_, _, env) = db.load_algo_state("1x1x1").unwrap().unwrap();
        assert_ne!(env.last_broadcast_fee_ppm, 0);
    }

    #[tokio::test]
    async fn test_broadcast_failure_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mut mock = MockNodeClient::new();
        mock.set_fee_fails = true;
        let mut hive = HiveBridge::new(false);

        persist(&db, "1x1x1", &trained_state(800.0));
        let states = states_of(channel_state("1x1x1", "peer_a", 100));

        let results = run(&config, &mock, &db, &states, &mut hive, 10_000.0)
            .await
            .unwrap();

        assert_eq!(
            results[0].1,
            FeeDecision::Skipped(reason::SKIP_BROADCAST_FAILED)
        );
        // No decision row, broadcast fields untouched
        assert!(db.get_recent_fee_changes(10).unwrap().is_empty());
        let (_, _, env) = db.load_algo_state("1x1x1").unwrap().unwrap();
        assert_eq!(env.last_broadcast_fee_ppm, 0);
        // The posterior still learned from the cycle
        let (blob, version, env2) = db.load_algo_state("1x1x1").unwrap().unwrap();
        let algo = ThompsonAimdState::from_blob(&blob, &version, &env2);
        assert!(algo.thompson.observations.len() > 50);
    }

    #[tokio::test]
    async fn test_policy_passive_skips() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.fees.channel_policy.push(crate::config::ChannelPolicy {
            channel: "1x1x1".to_string(),
            policy: "passive".to_string(),
            fee_ppm: None,
        });
        let mock = MockNodeClient::new();
        let mut hive = HiveBridge::new(false);

        let states = states_of(channel_state("1x1x1", "peer_a", 100));
        let results = run(&config, &mock, &db, &states, &mut hive, 10_000.0)
            .await
            .unwrap();

        assert_eq!(results[0].1, FeeDecision::Skipped(reason::POLICY_PASSIVE));
        assert!(mock.set_fee_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_policy_static_forces_configured_fee() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.fees.channel_policy.push(crate::config::ChannelPolicy {
            channel: "1x1x1".to_string(),
            policy: "static".to_string(),
            fee_ppm: Some(150),
        });
        let mock = MockNodeClient::new();
        let mut hive = HiveBridge::new(false);

        let states = states_of(channel_state("1x1x1", "peer_a", 100));
        let results = run(&config, &mock, &db, &states, &mut hive, 10_000.0)
            .await
            .unwrap();

        assert_eq!(
            results[0].1,
            FeeDecision::Applied {
                old_fee_ppm: 100,
                new_fee_ppm: 150,
                reason_code: reason::POLICY_STATIC
            }
        );
        assert_eq!(
            mock.set_fee_calls.lock().unwrap()[0],
            ("1x1x1".to_string(), 150)
        );
        let changes = db.get_recent_fee_changes(10).unwrap();
        assert_eq!(changes[0].reason_code, "policy_static");
    }

    #[tokio::test]
    async fn test_skip_waiting_forwards() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.fees.fee_cooldown_secs = 60;
        let mock = MockNodeClient::new();
        let mut hive = HiveBridge::new(false);
        let now = 10_000.0;

        // A past change, cooldown elapsed, but only one forward since
        db.record_fee_change(&FeeAdjustment {
            channel_id: "1x1x1".to_string(),
            peer_id: "peer_a".to_string(),
            old_fee_ppm: 90,
            new_fee_ppm: 100,
            reason: "test".to_string(),
            reason_code: "thompson_sample".to_string(),
            heuristic_modifiers: None,
            hill_climb: None,
            ts: now - 120.0,
        })
        .unwrap();
        db.record_forward("x", "1x1x1", 1000, 990, 10, 0.1, ForwardStatus::Settled, now - 50.0)
            .unwrap();

        let states = states_of(channel_state("1x1x1", "peer_a", 100));
        let results = run(&config, &mock, &db, &states, &mut hive, now)
            .await
            .unwrap();
        assert_eq!(
            results[0].1,
            FeeDecision::Skipped(reason::SKIP_WAITING_FORWARDS)
        );
    }

    #[tokio::test]
    async fn test_sleeping_channel_skips_until_traffic() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.fees.fee_cooldown_secs = 60;
        let mock = MockNodeClient::new();
        let mut hive = HiveBridge::new(false);
        let now = 10_000.0;

        let mut algo = trained_state(800.0);
        algo.is_sleeping = true;
        algo.stable_cycles = 12;
        persist(&db, "1x1x1", &algo);
        db.record_fee_change(&FeeAdjustment {
            channel_id: "1x1x1".to_string(),
            peer_id: "peer_a".to_string(),
            old_fee_ppm: 90,
            new_fee_ppm: 100,
            reason: "test".to_string(),
            reason_code: "thompson_sample".to_string(),
            heuristic_modifiers: None,
            hill_climb: None,
            ts: now - 500.0,
        })
        .unwrap();

        let states = states_of(channel_state("1x1x1", "peer_a", 100));
        let results = run(&config, &mock, &db, &states, &mut hive, now)
            .await
            .unwrap();
        assert_eq!(results[0].1, FeeDecision::Skipped(reason::SKIP_SLEEPING));

        // Fresh traffic wakes the channel
        for i in 0..3 {
            db.record_forward(
                "x",
                "1x1x1",
                1000,
                990,
                10,
                0.1,
                ForwardStatus::Settled,
                now - 100.0 + i as f64,
            )
            .unwrap();
        }
        let results = run(&config, &mock, &db, &states, &mut hive, now + 1.0)
            .await
            .unwrap();
        assert_ne!(
            results[0].1,
            FeeDecision::Skipped(reason::SKIP_SLEEPING),
            "woken channel should proceed"
        );
    }

    #[tokio::test]
    async fn test_aimd_defense_reason_code() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();
        let mut hive = HiveBridge::new(false);
        let now = 10_000.0;

        let mut algo = trained_state(800.0);
        // Failure streak already tripped the defense
        for _ in 0..3 {
            algo.aimd.record_outcome(false);
        }
        assert!(algo.aimd.is_active);
        persist(&db, "1x1x1", &algo);

        let states = states_of(channel_state("1x1x1", "peer_a", 100));
        let results = run(&config, &mock, &db, &states, &mut hive, now)
            .await
            .unwrap();
        match &results[0].1 {
            FeeDecision::Applied { reason_code, .. } => {
                assert_eq!(*reason_code, reason::THOMPSON_AIMD_DEFENSE);
            }
            other => panic!("expected applied decision, got {:?}", other),
        }
    }

    #[test]
    fn test_revenue_volatility() {
        let mut algo = ThompsonAimdState::new();
        for _ in 0..10 {
            algo.thompson
                .update_posterior(200.0, 50.0, 1.0, TimeBucket::Normal);
        }
        // Constant rates: zero volatility
        assert_eq!(revenue_volatility(&algo.thompson), 0.0);

        for i in 0..10 {
            algo.thompson.update_posterior(
                200.0,
                if i % 2 == 0 { 10.0 } else { 300.0 },
                1.0,
                TimeBucket::Normal,
            );
        }
        assert!(revenue_volatility(&algo.thompson) > 0.5);
    }
}
