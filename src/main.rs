#![allow(dead_code)]

mod admin;
mod client;
mod config;
mod fees;
mod flow;
mod hive;
mod profitability;
mod rebalancer;
mod scheduler;
mod store;
mod types;

use clap::{Parser, Subcommand};
use config::Config;
use log::{error, info, warn};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::signal;
use tokio::sync::watch;

use crate::client::{NodeClient, RpcHttpClient, UNMANAGE_TAG_FEE};
use crate::flow::ChannelStateMap;
use crate::hive::HiveBridge;
use crate::store::Database;

#[derive(Parser)]
#[command(
    name = "revenue-ops",
    about = "Revenue operations daemon for a Lightning routing node"
)]
struct Cli {
    /// Path to revenue-ops.toml config file
    #[arg(short, long, default_value = "revenue-ops.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a background daemon (default)
    Daemon,
    /// Revenue summary across all channels
    Status,
    /// Per-channel flow and algorithm diagnostics
    Analyze { channel_id: Option<String> },
    /// Capacity utilization report
    CapacityReport,
    /// Manually set a channel's proportional fee
    SetFee { channel_id: String, fee_ppm: u32 },
    /// Manually trigger a circular rebalance
    Rebalance {
        from: String,
        to: String,
        amount_sats: u64,
        max_fee_sats: Option<u64>,
    },
    /// Bleeder classification, one channel or all
    Profitability { channel_id: Option<String> },
    /// Recent fee changes and rebalances
    History,
    /// Hand a peer back to the auto-manager
    Remanage {
        peer_id: String,
        tag: Option<String>,
    },
    /// Raw auto-manager status
    ClbossStatus,
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp() as f64
}

fn print_json(result: anyhow::Result<serde_json::Value>) {
    let value = result.unwrap_or_else(|e| json!({ "error": e.to_string() }));
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    env_logger::Builder::new()
        .filter_level(
            config
                .general
                .log_level
                .parse()
                .unwrap_or(log::LevelFilter::Info),
        )
        .format_timestamp_secs()
        .init();

    info!("revenue-ops v{} starting", env!("CARGO_PKG_VERSION"));

    if config.general.dry_run {
        warn!("DRY-RUN MODE: no fees, unmanages, or rebalances will be written");
    }
    if !config.general.enabled {
        warn!("Master switch is OFF -- exiting");
        return Ok(());
    }
    if config.metrics.enable_prometheus {
        info!(
            "Prometheus knobs set (port {}); the exporter runs as its own plugin",
            config.metrics.prometheus_port
        );
    }

    let config = Arc::new(config);
    let db = Arc::new(Database::open(&config.general.db_path)?);

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let client = Arc::new(RpcHttpClient::new(&config)?);
            run_daemon(config, client, db).await
        }
        Commands::Status => {
            print_json(Ok(admin::status(&db, &config, now_ts())));
            Ok(())
        }
        Commands::Analyze { channel_id } => {
            print_json(admin::analyze(&db, channel_id.as_deref(), now_ts()));
            Ok(())
        }
        Commands::CapacityReport => {
            print_json(admin::capacity_report(&db, &config, now_ts()));
            Ok(())
        }
        Commands::Profitability { channel_id } => {
            print_json(admin::profitability_report(&db, channel_id.as_deref(), now_ts()));
            Ok(())
        }
        Commands::History => {
            print_json(admin::history(&db));
            Ok(())
        }
        Commands::SetFee { channel_id, fee_ppm } => {
            let client = RpcHttpClient::new(&config)?;
            print_json(set_fee_manual(&config, &client, &db, &channel_id, fee_ppm).await);
            Ok(())
        }
        Commands::Rebalance {
            from,
            to,
            amount_sats,
            max_fee_sats,
        } => {
            let client = RpcHttpClient::new(&config)?;
            print_json(
                rebalance_manual(&config, &client, &db, &from, &to, amount_sats, max_fee_sats)
                    .await,
            );
            Ok(())
        }
        Commands::Remanage { peer_id, tag } => {
            let client = RpcHttpClient::new(&config)?;
            let result = match client.clboss_remanage(&peer_id, tag.as_deref()).await {
                Ok(()) => Ok(json!({ "result": "ok", "peer_id": peer_id, "tag": tag })),
                Err(e) => Err(e),
            };
            print_json(result);
            Ok(())
        }
        Commands::ClbossStatus => {
            let client = RpcHttpClient::new(&config)?;
            print_json(client.clboss_status().await);
            Ok(())
        }
    }
}

async fn run_daemon(
    config: Arc<Config>,
    client: Arc<RpcHttpClient>,
    db: Arc<Database>,
) -> anyhow::Result<()> {
    info!("Verifying host daemon connectivity...");
    match client.get_node_info().await {
        Ok(node) => info!("Connected to node {} ({})", node.alias, node.id),
        Err(e) => {
            error!("Cannot reach host daemon: {:#}. Aborting.", e);
            return Err(e);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal, stopping loops...");
        let _ = shutdown_tx.send(true);
    });

    let snapshot: Arc<RwLock<ChannelStateMap>> = Arc::new(RwLock::new(ChannelStateMap::new()));
    let mut handles = Vec::new();

    // Flow analysis loop
    {
        let (config, client, db, snapshot) =
            (config.clone(), client.clone(), db.clone(), snapshot.clone());
        let rx = shutdown_rx.clone();
        let period = config.flow.flow_interval;
        handles.push(tokio::spawn(scheduler::run_loop(
            "flow",
            period,
            scheduler::FLOW_STARTUP_DELAY_SECS,
            rx,
            move || {
                let (config, client, db, snapshot) =
                    (config.clone(), client.clone(), db.clone(), snapshot.clone());
                async move { flow::run_cycle(&config, &*client, &db, &snapshot).await }
            },
        )));
    }

    // Fee adjustment loop; owns the hive bridge
    {
        let (config, client, db, snapshot) =
            (config.clone(), client.clone(), db.clone(), snapshot.clone());
        let rx = shutdown_rx.clone();
        let period = config.fees.fee_interval;
        let hive = Arc::new(tokio::sync::Mutex::new(HiveBridge::new(config.hive.enabled)));
        handles.push(tokio::spawn(scheduler::run_loop(
            "fee",
            period,
            scheduler::FEE_STARTUP_DELAY_SECS,
            rx,
            move || {
                let (config, client, db, snapshot, hive) = (
                    config.clone(),
                    client.clone(),
                    db.clone(),
                    snapshot.clone(),
                    hive.clone(),
                );
                async move {
                    let states = snapshot.read().expect("snapshot lock poisoned").clone();
                    if states.is_empty() {
                        return Ok(());
                    }
                    let mut hive = hive.lock().await;
                    fees::run(&config, &*client, &db, &states, &mut hive, now_ts()).await?;
                    Ok(())
                }
            },
        )));
    }

    // Rebalance check loop
    {
        let (config, client, db, snapshot) =
            (config.clone(), client.clone(), db.clone(), snapshot.clone());
        let rx = shutdown_rx.clone();
        let period = config.rebalancer.rebalance_interval;
        handles.push(tokio::spawn(scheduler::run_loop(
            "rebalance",
            period,
            scheduler::REBALANCE_STARTUP_DELAY_SECS,
            rx,
            move || {
                let (config, client, db, snapshot) =
                    (config.clone(), client.clone(), db.clone(), snapshot.clone());
                async move {
                    let states = snapshot.read().expect("snapshot lock poisoned").clone();
                    if states.is_empty() {
                        return Ok(());
                    }
                    rebalancer::run(&config, &*client, &db, &states, now_ts()).await?;
                    Ok(())
                }
            },
        )));
    }

    // One-shot startup snapshot, delayed past the host's block replay
    {
        let (client, db) = (client.clone(), db.clone());
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(scheduler::run_once_after(
            "startup snapshot",
            scheduler::SNAPSHOT_DELAY_SECS,
            rx,
            move || async move {
                let channels = client.list_channels().await?;
                let now = now_ts();
                for ch in &channels {
                    let scid = ch.scid();
                    if !scid.is_empty() {
                        db.upsert_channel(&scid, &ch.peer_id, ch.capacity_sats(), now)?;
                    }
                }
                info!("Startup snapshot: {} channels seeded", channels.len());
                Ok(())
            },
        )));
    }

    info!(
        "Loops scheduled (flow {}s, fee {}s, rebalance {}s)",
        config.flow.flow_interval, config.fees.fee_interval, config.rebalancer.rebalance_interval
    );

    for handle in handles {
        let _ = handle.await;
    }
    info!("All loops stopped, goodbye");
    Ok(())
}

/// Manual fee override via admin RPC: same unmanage-before-write rule and
/// clamp invariant as the automatic path.
async fn set_fee_manual(
    config: &Config,
    client: &(impl NodeClient + Sync),
    db: &Database,
    channel_id: &str,
    fee_ppm: u32,
) -> anyhow::Result<serde_json::Value> {
    if fee_ppm < config.fees.min_fee_ppm || fee_ppm > config.fees.max_fee_ppm {
        return Ok(json!({ "error": "fee_out_of_bounds" }));
    }
    if config.general.dry_run {
        return Ok(json!({ "error": "dry_run_active" }));
    }
    let scid = types::normalize_scid(channel_id);
    let peer_id = db.peer_for_scid(&scid)?.unwrap_or_default();

    if config.fees.clboss_enabled && !peer_id.is_empty() {
        let managed = client.clboss_managed_peers(UNMANAGE_TAG_FEE).await?;
        if managed.contains(&peer_id) {
            client.clboss_unmanage(&peer_id, UNMANAGE_TAG_FEE).await?;
        }
    }
    client.set_channel_fee(&scid, fee_ppm).await?;
    db.record_fee_change(&store::FeeAdjustment {
        channel_id: scid.clone(),
        peer_id,
        old_fee_ppm: 0,
        new_fee_ppm: fee_ppm,
        reason: "manual override".to_string(),
        reason_code: "manual".to_string(),
        heuristic_modifiers: None,
        hill_climb: None,
        ts: now_ts(),
    })?;
    Ok(json!({ "result": "ok", "channel_id": scid, "fee_ppm": fee_ppm }))
}

/// Manual rebalance via admin RPC.
async fn rebalance_manual(
    config: &Config,
    client: &(impl NodeClient + Sync),
    db: &Database,
    from: &str,
    to: &str,
    amount_sats: u64,
    max_fee_sats: Option<u64>,
) -> anyhow::Result<serde_json::Value> {
    if config.general.dry_run {
        return Ok(json!({ "error": "dry_run_active" }));
    }
    let from = types::normalize_scid(from);
    let to = types::normalize_scid(to);
    let max_fee = max_fee_sats.unwrap_or_else(|| (amount_sats / 100).max(1));

    let result = client.rebalance(&from, &to, amount_sats, max_fee).await?;
    let status = if result.succeeded() { "complete" } else { "failed" };
    db.record_rebalance(&store::RebalanceRecord {
        from_scid: from.clone(),
        to_scid: to.clone(),
        amount_msat: amount_sats * 1000,
        fee_msat: result.fee_paid_msat,
        status: status.to_string(),
        reason_code: "manual".to_string(),
        ts: now_ts(),
    })?;
    Ok(json!({
        "result": status,
        "from": from,
        "to": to,
        "amount_sats": amount_sats,
        "fee_paid_msat": result.fee_paid_msat,
    }))
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::client::mock::MockNodeClient;
    use crate::types::{ChannelInfo, ForwardEvent};

    fn make_channel(scid: &str, peer: &str, total_msat: u64, to_us: u64, fee_ppm: u32) -> ChannelInfo {
        ChannelInfo {
            short_channel_id: scid.to_string(),
            peer_id: peer.to_string(),
            to_us_msat: to_us,
            total_msat,
            fee_proportional_millionths: fee_ppm,
            peer_connected: true,
            state: "CHANNELD_NORMAL".to_string(),
            ..Default::default()
        }
    }

    fn make_forward(out: &str, out_msat: u64, fee: u64, ts: f64) -> ForwardEvent {
        ForwardEvent {
            status: "settled".to_string(),
            in_channel: "9x9x9".to_string(),
            out_channel: out.to_string(),
            in_msatoshi: out_msat + fee,
            out_msatoshi: out_msat,
            fee_msatoshi: fee,
            received_time: ts - 1.0,
            resolved_time: ts,
        }
    }

    // -----------------------------------------------------------------------
    // Full pipeline: flow cycle feeds the snapshot, fee pass decides
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_pipeline_flow_then_fees() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mut mock = MockNodeClient::new();

        let now = chrono::Utc::now().timestamp() as f64;
        mock.channels.lock().unwrap().extend(vec![
            make_channel("1x1x1", "peer_a", 1_000_000_000, 500_000_000, 100),
            make_channel("2x2x2", "peer_b", 1_000_000_000, 500_000_000, 100),
        ]);
        for i in 0..5 {
            mock.forwards
                .push(make_forward("1x1x1", 1_000_000, 1000, now - 3600.0 + i as f64));
        }

        let snapshot = RwLock::new(ChannelStateMap::new());
        flow::run_cycle(&config, &mock, &db, &snapshot).await.unwrap();
        let states = snapshot.read().unwrap().clone();
        assert_eq!(states.len(), 2);
        assert_eq!(db.forwards_since("1x1x1", 0.0).unwrap(), 5);

        let mut hive = HiveBridge::new(false);
        let results = fees::run(&config, &mock, &db, &states, &mut hive, now)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);

        // Every broadcast that went out obeys the clamp invariant
        for (scid, ppm) in mock.set_fee_calls.lock().unwrap().iter() {
            assert!(
                *ppm >= config.fees.min_fee_ppm && *ppm <= config.fees.max_fee_ppm,
                "fee {} on {} escaped bounds",
                ppm,
                scid
            );
        }
        // And every recorded adjustment does too
        for change in db.get_recent_fee_changes(100).unwrap() {
            assert!(change.new_fee_ppm >= config.fees.min_fee_ppm);
            assert!(change.new_fee_ppm <= config.fees.max_fee_ppm);
        }
    }

    // -----------------------------------------------------------------------
    // Dry-run: the whole pipeline runs, nothing reaches the host
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_pipeline_dry_run_no_host_writes() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.general.dry_run = true;
        let mut mock = MockNodeClient::new();
        mock.managed_peers = vec!["peer_a".to_string()];

        let now = chrono::Utc::now().timestamp() as f64;
        mock.channels.lock().unwrap().extend(vec![
            // Heavily drained channel: rebalance target
            make_channel("1x1x1", "peer_a", 1_000_000_000, 100_000_000, 1000),
            // Flush channel: rebalance source
            make_channel("2x2x2", "peer_b", 1_000_000_000, 800_000_000, 100),
        ]);
        for i in 0..5 {
            mock.forwards
                .push(make_forward("1x1x1", 1_000_000, 1000, now - 3600.0 + i as f64));
        }

        let snapshot = RwLock::new(ChannelStateMap::new());
        flow::run_cycle(&config, &mock, &db, &snapshot).await.unwrap();
        let states = snapshot.read().unwrap().clone();

        let mut hive = HiveBridge::new(false);
        fees::run(&config, &mock, &db, &states, &mut hive, now)
            .await
            .unwrap();
        rebalancer::run(&config, &mock, &db, &states, now).await.unwrap();

        assert!(mock.set_fee_calls.lock().unwrap().is_empty());
        assert!(mock.unmanage_calls.lock().unwrap().is_empty());
        assert!(mock.rebalance_calls.lock().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Manual admin operations
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_set_fee_manual_bounds_and_unmanage() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mut mock = MockNodeClient::new();
        mock.managed_peers = vec!["peer_a".to_string()];
        db.upsert_channel("1x1x1", "peer_a", 1_000_000, 0.0).unwrap();

        // Out of bounds is a structured error, not an RPC call
        let v = set_fee_manual(&config, &mock, &db, "1x1x1", 999_999)
            .await
            .unwrap();
        assert_eq!(v["error"], "fee_out_of_bounds");
        assert!(mock.set_fee_calls.lock().unwrap().is_empty());

        // SCIDs are normalized, unmanage precedes the write
        let v = set_fee_manual(&config, &mock, &db, "1:1:1", 250).await.unwrap();
        assert_eq!(v["result"], "ok");
        assert_eq!(mock.unmanage_calls.lock().unwrap().len(), 1);
        assert_eq!(
            mock.set_fee_calls.lock().unwrap()[0],
            ("1x1x1".to_string(), 250)
        );
        let changes = db.get_recent_fee_changes(10).unwrap();
        assert_eq!(changes[0].reason_code, "manual");
    }

    #[tokio::test]
    async fn test_rebalance_manual_records_event() {
        let db = Database::open_in_memory().unwrap();
        let config = Config::test_default();
        let mock = MockNodeClient::new();

        let v = rebalance_manual(&config, &mock, &db, "1x1x1", "2x2x2", 100_000, Some(50))
            .await
            .unwrap();
        assert_eq!(v["result"], "complete");
        assert_eq!(mock.rebalance_calls.lock().unwrap().len(), 1);
        let recorded = db.get_recent_rebalances(10).unwrap();
        assert_eq!(recorded[0].reason_code, "manual");
    }

    #[tokio::test]
    async fn test_manual_ops_respect_dry_run() {
        let db = Database::open_in_memory().unwrap();
        let mut config = Config::test_default();
        config.general.dry_run = true;
        let mock = MockNodeClient::new();

        let v = set_fee_manual(&config, &mock, &db, "1x1x1", 250).await.unwrap();
        assert_eq!(v["error"], "dry_run_active");
        let v = rebalance_manual(&config, &mock, &db, "a", "b", 1000, None)
            .await
            .unwrap();
        assert_eq!(v["error"], "dry_run_active");
        assert!(mock.set_fee_calls.lock().unwrap().is_empty());
        assert!(mock.rebalance_calls.lock().unwrap().is_empty());
    }
}
