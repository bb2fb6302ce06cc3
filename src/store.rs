use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::types::ForwardStatus;

/// Reputation update constants: score_new = score * ALPHA + (success ? SUCCESS : -FAILURE),
/// clamped to [0, SCORE_MAX]. Decay is applied separately once per flow cycle.
const SCORE_ALPHA: f64 = 1.0;
const SCORE_SUCCESS: f64 = 0.1;
const SCORE_FAILURE: f64 = 0.3;
const SCORE_MAX: f64 = 10.0;

/// Day bucket: start-of-day Unix timestamp (UTC) for a given time.
pub fn day_bucket(timestamp_secs: f64) -> i64 {
    let secs = timestamp_secs as i64;
    secs - (secs % 86400)
}

/// A single writeable fee decision.
#[derive(Debug, Clone)]
pub struct FeeAdjustment {
    pub channel_id: String,
    pub peer_id: String,
    pub old_fee_ppm: u32,
    pub new_fee_ppm: u32,
    pub reason: String,
    pub reason_code: String,
    pub heuristic_modifiers: Option<String>,
    /// Legacy telemetry column carried from the hill-climb era.
    pub hill_climb: Option<String>,
    pub ts: f64,
}

#[derive(Debug, Clone)]
pub struct RebalanceRecord {
    pub from_scid: String,
    pub to_scid: String,
    pub amount_msat: u64,
    pub fee_msat: u64,
    pub status: String,
    pub reason_code: String,
    pub ts: f64,
}

#[derive(Debug, Clone)]
pub struct PeerReputation {
    pub peer_id: String,
    pub successes: u64,
    pub failures: u64,
    pub score: f64,
}

/// Envelope columns stored beside the algorithm blob. A blob that fails to
/// parse is rebuilt from these.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlgoEnvelope {
    pub last_fee_ppm: u32,
    pub last_broadcast_fee_ppm: u32,
    pub last_revenue_rate: f64,
    pub last_update: f64,
    pub is_sleeping: bool,
    pub stable_cycles: u32,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // WAL for crash safety
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Lock the underlying connection. Never held across an await point.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // -- forwards ----------------------------------------------------------

    /// Append one forward record. Rows are never updated, only aged out.
    pub fn record_forward(
        &self,
        in_scid: &str,
        out_scid: &str,
        in_msat: u64,
        out_msat: u64,
        fee_msat: u64,
        latency_secs: f64,
        status: ForwardStatus,
        ts: f64,
    ) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT INTO forwards \
             (in_scid, out_scid, in_msat, out_msat, fee_msat, latency_secs, status, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                in_scid,
                out_scid,
                in_msat as i64,
                out_msat as i64,
                fee_msat as i64,
                latency_secs,
                status.as_str(),
                ts
            ],
        )?;
        Ok(())
    }

    /// Settled (inbound, outbound) volume for a channel since `since`.
    pub fn channel_volumes(&self, scid: &str, since: f64) -> anyhow::Result<(u64, u64)> {
        let conn = self.conn();
        let inbound: i64 = conn.query_row(
            "SELECT COALESCE(SUM(in_msat), 0) FROM forwards \
             WHERE in_scid = ?1 AND status = 'settled' AND ts >= ?2",
            rusqlite::params![scid, since],
            |r| r.get(0),
        )?;
        let outbound: i64 = conn.query_row(
            "SELECT COALESCE(SUM(out_msat), 0) FROM forwards \
             WHERE out_scid = ?1 AND status = 'settled' AND ts >= ?2",
            rusqlite::params![scid, since],
            |r| r.get(0),
        )?;
        Ok((inbound as u64, outbound as u64))
    }

    /// Fee revenue (msat) earned by a channel's outbound forwards since `since`.
    pub fn revenue_msat(&self, scid: &str, since: f64) -> anyhow::Result<u64> {
        let v: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(fee_msat), 0) FROM forwards \
             WHERE out_scid = ?1 AND status = 'settled' AND ts >= ?2",
            rusqlite::params![scid, since],
            |r| r.get(0),
        )?;
        Ok(v as u64)
    }

    /// (settled, failed) outbound forward attempt counts since `since`.
    pub fn forward_counts(&self, scid: &str, since: f64) -> anyhow::Result<(u64, u64)> {
        let conn = self.conn();
        let settled: i64 = conn.query_row(
            "SELECT COUNT(*) FROM forwards \
             WHERE out_scid = ?1 AND status = 'settled' AND ts >= ?2",
            rusqlite::params![scid, since],
            |r| r.get(0),
        )?;
        let failed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM forwards \
             WHERE out_scid = ?1 AND status != 'settled' AND ts >= ?2",
            rusqlite::params![scid, since],
            |r| r.get(0),
        )?;
        Ok((settled as u64, failed as u64))
    }

    /// Timestamps and amounts of settled outbound forwards, oldest first.
    pub fn settled_forwards(&self, scid: &str, since: f64) -> anyhow::Result<Vec<(f64, u64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ts, out_msat FROM forwards \
             WHERE out_scid = ?1 AND status = 'settled' AND ts >= ?2 ORDER BY ts ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![scid, since], |r| {
                Ok((r.get::<_, f64>(0)?, r.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Outcome sequence (ts, settled?) for a channel's outbound forwards since `since`.
    pub fn forward_outcomes(&self, scid: &str, since: f64) -> anyhow::Result<Vec<(f64, bool)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ts, status FROM forwards \
             WHERE out_scid = ?1 AND ts >= ?2 ORDER BY ts ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![scid, since], |r| {
                let ts: f64 = r.get(0)?;
                let status: String = r.get(1)?;
                Ok((ts, status == "settled"))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// SCIDs that appear on either side of any forward since `since`.
    pub fn active_scids(&self, since: f64) -> anyhow::Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT out_scid FROM forwards WHERE ts >= ?1 \
             UNION SELECT DISTINCT in_scid FROM forwards WHERE ts >= ?1",
        )?;
        let rows = stmt
            .query_map([since], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- reputation --------------------------------------------------------

    /// Atomic read-modify-write of one peer's reputation.
    pub fn update_peer_reputation(&self, peer_id: &str, is_success: bool) -> anyhow::Result<f64> {
        let conn = self.conn();
        let existing: Option<(u64, u64, f64)> = conn
            .query_row(
                "SELECT successes, failures, score FROM peer_reputation WHERE peer_id = ?1",
                [peer_id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)? as u64,
                        r.get::<_, i64>(1)? as u64,
                        r.get::<_, f64>(2)?,
                    ))
                },
            )
            .optional()?;

        let (successes, failures, score) = existing.unwrap_or((0, 0, 1.0));
        let delta = if is_success { SCORE_SUCCESS } else { -SCORE_FAILURE };
        let new_score = (score * SCORE_ALPHA + delta).clamp(0.0, SCORE_MAX);
        let (successes, failures) = if is_success {
            (successes + 1, failures)
        } else {
            (successes, failures + 1)
        };

        conn.execute(
            "INSERT OR REPLACE INTO peer_reputation (peer_id, successes, failures, score) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![peer_id, successes as i64, failures as i64, new_score],
        )?;
        Ok(new_score)
    }

    /// Multiplicative decay applied to every peer's score.
    pub fn decay_reputation(&self, factor: f64) -> anyhow::Result<()> {
        self.conn().execute(
            "UPDATE peer_reputation SET score = score * ?1",
            [factor],
        )?;
        Ok(())
    }

    pub fn get_peer_reputation(&self, peer_id: &str) -> anyhow::Result<Option<PeerReputation>> {
        let rep = self
            .conn()
            .query_row(
                "SELECT peer_id, successes, failures, score FROM peer_reputation \
                 WHERE peer_id = ?1",
                [peer_id],
                |r| {
                    Ok(PeerReputation {
                        peer_id: r.get(0)?,
                        successes: r.get::<_, i64>(1)? as u64,
                        failures: r.get::<_, i64>(2)? as u64,
                        score: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(rep)
    }

    pub fn get_all_peer_reputations(&self) -> anyhow::Result<Vec<PeerReputation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT peer_id, successes, failures, score FROM peer_reputation ORDER BY peer_id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(PeerReputation {
                    peer_id: r.get(0)?,
                    successes: r.get::<_, i64>(1)? as u64,
                    failures: r.get::<_, i64>(2)? as u64,
                    score: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- fee changes -------------------------------------------------------

    pub fn record_fee_change(&self, adj: &FeeAdjustment) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT INTO fee_changes \
             (channel_id, peer_id, old_fee_ppm, new_fee_ppm, reason, reason_code, \
              heuristic_modifiers, hill_climb, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                adj.channel_id,
                adj.peer_id,
                adj.old_fee_ppm,
                adj.new_fee_ppm,
                adj.reason,
                adj.reason_code,
                adj.heuristic_modifiers,
                adj.hill_climb,
                adj.ts
            ],
        )?;
        Ok(())
    }

    /// Record a fee decision and its updated algorithm state in one
    /// transaction, so a decision row never exists without its state blob.
    pub fn record_fee_decision(
        &self,
        adj: &FeeAdjustment,
        blob: &str,
        version: &str,
        envelope: &AlgoEnvelope,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO fee_changes \
             (channel_id, peer_id, old_fee_ppm, new_fee_ppm, reason, reason_code, \
              heuristic_modifiers, hill_climb, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                adj.channel_id,
                adj.peer_id,
                adj.old_fee_ppm,
                adj.new_fee_ppm,
                adj.reason,
                adj.reason_code,
                adj.heuristic_modifiers,
                adj.hill_climb,
                adj.ts
            ],
        )?;
        upsert_algo_state(&tx, &adj.channel_id, blob, version, envelope, adj.ts)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_recent_fee_changes(&self, limit: u32) -> anyhow::Result<Vec<FeeAdjustment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT channel_id, peer_id, old_fee_ppm, new_fee_ppm, reason, reason_code, \
                    heuristic_modifiers, hill_climb, ts \
             FROM fee_changes ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |r| {
                Ok(FeeAdjustment {
                    channel_id: r.get(0)?,
                    peer_id: r.get(1)?,
                    old_fee_ppm: r.get(2)?,
                    new_fee_ppm: r.get(3)?,
                    reason: r.get(4)?,
                    reason_code: r.get(5)?,
                    heuristic_modifiers: r.get(6)?,
                    hill_climb: r.get(7)?,
                    ts: r.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Timestamp of the most recent fee change on a channel.
    pub fn last_fee_change_ts(&self, scid: &str) -> anyhow::Result<Option<f64>> {
        let ts = self
            .conn()
            .query_row(
                "SELECT MAX(ts) FROM fee_changes WHERE channel_id = ?1",
                [scid],
                |r| r.get::<_, Option<f64>>(0),
            )
            .optional()?
            .flatten();
        Ok(ts)
    }

    /// Outbound forward attempts on a channel since `since`.
    pub fn forwards_since(&self, scid: &str, since: f64) -> anyhow::Result<u64> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM forwards WHERE out_scid = ?1 AND ts >= ?2",
            rusqlite::params![scid, since],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    // -- rebalances --------------------------------------------------------

    pub fn record_rebalance(&self, rec: &RebalanceRecord) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT INTO rebalances \
             (from_scid, to_scid, amount_msat, fee_msat, status, reason_code, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                rec.from_scid,
                rec.to_scid,
                rec.amount_msat as i64,
                rec.fee_msat as i64,
                rec.status,
                rec.reason_code,
                rec.ts
            ],
        )?;
        Ok(())
    }

    pub fn get_recent_rebalances(&self, limit: u32) -> anyhow::Result<Vec<RebalanceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT from_scid, to_scid, amount_msat, fee_msat, status, reason_code, ts \
             FROM rebalances ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |r| {
                Ok(RebalanceRecord {
                    from_scid: r.get(0)?,
                    to_scid: r.get(1)?,
                    amount_msat: r.get::<_, i64>(2)? as u64,
                    fee_msat: r.get::<_, i64>(3)? as u64,
                    status: r.get(4)?,
                    reason_code: r.get(5)?,
                    ts: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rebalance fees (msat) paid into a channel since `since`.
    pub fn rebalance_cost_msat(&self, scid: &str, since: f64) -> anyhow::Result<u64> {
        let v: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(fee_msat), 0) FROM rebalances \
             WHERE to_scid = ?1 AND status = 'complete' AND ts >= ?2",
            rusqlite::params![scid, since],
            |r| r.get(0),
        )?;
        Ok(v as u64)
    }

    /// Total rebalance fees (msat) spent in the current UTC day.
    pub fn rebalance_spend_today_msat(&self, now: f64) -> anyhow::Result<u64> {
        let bucket = day_bucket(now) as f64;
        let v: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(fee_msat), 0) FROM rebalances \
             WHERE status = 'complete' AND ts >= ?1",
            [bucket],
            |r| r.get(0),
        )?;
        Ok(v as u64)
    }

    /// Most recent attempt timestamp for a (source, target) pair.
    pub fn last_rebalance_attempt(&self, from: &str, to: &str) -> anyhow::Result<Option<f64>> {
        let ts = self
            .conn()
            .query_row(
                "SELECT MAX(ts) FROM rebalances WHERE from_scid = ?1 AND to_scid = ?2",
                rusqlite::params![from, to],
                |r| r.get::<_, Option<f64>>(0),
            )
            .optional()?
            .flatten();
        Ok(ts)
    }

    /// Leading run of failed attempts toward a target (most recent first).
    pub fn consecutive_failed_rebalances(&self, to: &str, since: f64) -> anyhow::Result<u32> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT status FROM rebalances WHERE to_scid = ?1 AND ts >= ?2 ORDER BY ts DESC",
        )?;
        let statuses = stmt
            .query_map(rusqlite::params![to, since], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut n = 0;
        for s in statuses {
            if s == "complete" {
                break;
            }
            n += 1;
        }
        Ok(n)
    }

    // -- connection events -------------------------------------------------

    pub fn record_connection_event(&self, peer_id: &str, kind: &str, ts: f64) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT INTO connection_events (peer_id, kind, ts) VALUES (?1, ?2, ?3)",
            rusqlite::params![peer_id, kind, ts],
        )?;
        Ok(())
    }

    // -- channel lifecycle -------------------------------------------------

    pub fn upsert_channel(
        &self,
        scid: &str,
        peer_id: &str,
        capacity_sats: u64,
        now: f64,
    ) -> anyhow::Result<()> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE channels SET last_seen_at = ?1, is_open = 1 WHERE scid = ?2",
            rusqlite::params![now, scid],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO channels (scid, peer_id, capacity_sats, first_seen_at, last_seen_at, is_open) \
                 VALUES (?1, ?2, ?3, ?4, ?4, 1)",
                rusqlite::params![scid, peer_id, capacity_sats as i64, now],
            )?;
        }
        Ok(())
    }

    /// Mark every open channel not in `open_scids` as closed.
    pub fn mark_closed_except(&self, open_scids: &[String], now: f64) -> anyhow::Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT scid FROM channels WHERE is_open = 1")?;
        let known = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut closed = Vec::new();
        for scid in known {
            if !open_scids.contains(&scid) {
                conn.execute(
                    "UPDATE channels SET is_open = 0, closed_at = ?1, last_seen_at = ?1 \
                     WHERE scid = ?2",
                    rusqlite::params![now, scid],
                )?;
                closed.push(scid);
            }
        }
        Ok(closed)
    }

    /// Open channels as (scid, peer_id, capacity_sats).
    pub fn open_channels(&self) -> anyhow::Result<Vec<(String, String, u64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT scid, peer_id, capacity_sats FROM channels WHERE is_open = 1 ORDER BY scid",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn channel_age_days(&self, scid: &str, now: f64) -> anyhow::Result<Option<f64>> {
        let age = self
            .conn()
            .query_row(
                "SELECT first_seen_at FROM channels WHERE scid = ?1",
                [scid],
                |r| r.get::<_, f64>(0),
            )
            .optional()?
            .map(|first_seen| (now - first_seen) / 86400.0);
        Ok(age)
    }

    /// Lazy monotonic SCID -> peer mapping; peer identities never change
    /// for a given SCID, so stale rows are fine.
    pub fn peer_for_scid(&self, scid: &str) -> anyhow::Result<Option<String>> {
        let peer = self
            .conn()
            .query_row(
                "SELECT peer_id FROM channels WHERE scid = ?1",
                [scid],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(peer)
    }

    // -- derived channel state ---------------------------------------------

    /// Persist one derived `ChannelState` (serialized) for readers that
    /// want committed rather than in-memory snapshots.
    pub fn save_channel_state(&self, scid: &str, state_json: &str, now: f64) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO channel_states (scid, state, updated_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![scid, state_json, now],
        )?;
        Ok(())
    }

    pub fn get_channel_state(&self, scid: &str) -> anyhow::Result<Option<String>> {
        let v = self
            .conn()
            .query_row(
                "SELECT state FROM channel_states WHERE scid = ?1",
                [scid],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(v)
    }

    pub fn get_all_channel_states(&self) -> anyhow::Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT scid, state FROM channel_states ORDER BY scid")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- algorithm state ---------------------------------------------------

    pub fn load_algo_state(
        &self,
        scid: &str,
    ) -> anyhow::Result<Option<(String, String, AlgoEnvelope)>> {
        let row = self
            .conn()
            .query_row(
                "SELECT blob, version, last_fee_ppm, last_broadcast_fee_ppm, \
                        last_revenue_rate, last_update, is_sleeping, stable_cycles \
                 FROM channel_algo_state WHERE scid = ?1",
                [scid],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        AlgoEnvelope {
                            last_fee_ppm: r.get(2)?,
                            last_broadcast_fee_ppm: r.get(3)?,
                            last_revenue_rate: r.get(4)?,
                            last_update: r.get(5)?,
                            is_sleeping: r.get::<_, i64>(6)? != 0,
                            stable_cycles: r.get(7)?,
                        },
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn save_algo_state(
        &self,
        scid: &str,
        blob: &str,
        version: &str,
        envelope: &AlgoEnvelope,
        now: f64,
    ) -> anyhow::Result<()> {
        let conn = self.conn();
        upsert_algo_state(&conn, scid, blob, version, envelope, now)
    }

    pub fn delete_algo_state(&self, scid: &str) -> anyhow::Result<()> {
        self.conn()
            .execute("DELETE FROM channel_algo_state WHERE scid = ?1", [scid])?;
        Ok(())
    }

    // -- sync cursors ------------------------------------------------------

    pub fn get_sync(&self, key: &str) -> anyhow::Result<Option<String>> {
        let v = self
            .conn()
            .query_row("SELECT value FROM sync_state WHERE key = ?1", [key], |r| {
                r.get::<_, String>(0)
            })
            .optional()?;
        Ok(v)
    }

    pub fn set_sync(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    // -- retention ---------------------------------------------------------

    /// Drop event rows older than `days_to_keep` days and algorithm state
    /// for channels closed longer ago than that.
    pub fn cleanup_old_data(&self, days_to_keep: u32, now: f64) -> anyhow::Result<()> {
        let cutoff = now - days_to_keep as f64 * 86400.0;
        let conn = self.conn();
        conn.execute("DELETE FROM forwards WHERE ts < ?1", [cutoff])?;
        conn.execute("DELETE FROM fee_changes WHERE ts < ?1", [cutoff])?;
        conn.execute("DELETE FROM rebalances WHERE ts < ?1", [cutoff])?;
        conn.execute("DELETE FROM connection_events WHERE ts < ?1", [cutoff])?;
        conn.execute(
            "DELETE FROM channel_algo_state WHERE scid IN \
             (SELECT scid FROM channels WHERE is_open = 0 AND closed_at < ?1)",
            [cutoff],
        )?;
        Ok(())
    }
}

fn upsert_algo_state(
    conn: &Connection,
    scid: &str,
    blob: &str,
    version: &str,
    envelope: &AlgoEnvelope,
    now: f64,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO channel_algo_state \
         (scid, blob, version, last_fee_ppm, last_broadcast_fee_ppm, last_revenue_rate, \
          last_update, is_sleeping, stable_cycles, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            scid,
            blob,
            version,
            envelope.last_fee_ppm,
            envelope.last_broadcast_fee_ppm,
            envelope.last_revenue_rate,
            envelope.last_update,
            envelope.is_sleeping as i64,
            envelope.stable_cycles,
            now
        ],
    )?;
    Ok(())
}

const SCHEMA: &str = r#"
-- Forwarded HTLCs, append-only
CREATE TABLE IF NOT EXISTS forwards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    in_scid TEXT NOT NULL,
    out_scid TEXT NOT NULL,
    in_msat INTEGER NOT NULL,
    out_msat INTEGER NOT NULL,
    fee_msat INTEGER NOT NULL,
    latency_secs REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL CHECK (status IN ('settled', 'local_failed', 'failed')),
    ts REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_forwards_out_ts ON forwards(out_scid, ts);
CREATE INDEX IF NOT EXISTS idx_forwards_in_ts ON forwards(in_scid, ts);
CREATE INDEX IF NOT EXISTS idx_forwards_ts ON forwards(ts);

-- Broadcast fee decisions
CREATE TABLE IF NOT EXISTS fee_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    old_fee_ppm INTEGER NOT NULL,
    new_fee_ppm INTEGER NOT NULL,
    reason TEXT NOT NULL,
    reason_code TEXT NOT NULL,
    heuristic_modifiers TEXT,
    hill_climb TEXT,
    ts REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fee_changes_chan_ts ON fee_changes(channel_id, ts);

-- Rebalance attempts and resolutions
CREATE TABLE IF NOT EXISTS rebalances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_scid TEXT NOT NULL,
    to_scid TEXT NOT NULL,
    amount_msat INTEGER NOT NULL,
    fee_msat INTEGER NOT NULL,
    status TEXT NOT NULL,
    reason_code TEXT NOT NULL,
    ts REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rebalances_to_ts ON rebalances(to_scid, ts);
CREATE INDEX IF NOT EXISTS idx_rebalances_pair ON rebalances(from_scid, to_scid, ts);

-- Rolling per-peer forwarding reputation
CREATE TABLE IF NOT EXISTS peer_reputation (
    peer_id TEXT PRIMARY KEY,
    successes INTEGER NOT NULL DEFAULT 0,
    failures INTEGER NOT NULL DEFAULT 0,
    score REAL NOT NULL DEFAULT 1.0
);

-- Latest derived per-channel flow state, rewritten each flow cycle
CREATE TABLE IF NOT EXISTS channel_states (
    scid TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    updated_at REAL NOT NULL
);

-- Versioned opaque per-channel algorithm state plus legacy envelope columns
CREATE TABLE IF NOT EXISTS channel_algo_state (
    scid TEXT PRIMARY KEY,
    blob TEXT NOT NULL,
    version TEXT NOT NULL,
    last_fee_ppm INTEGER NOT NULL DEFAULT 0,
    last_broadcast_fee_ppm INTEGER NOT NULL DEFAULT 0,
    last_revenue_rate REAL NOT NULL DEFAULT 0,
    last_update REAL NOT NULL DEFAULT 0,
    is_sleeping INTEGER NOT NULL DEFAULT 0,
    stable_cycles INTEGER NOT NULL DEFAULT 0,
    updated_at REAL NOT NULL
);

-- Peer connect/disconnect observations
CREATE TABLE IF NOT EXISTS connection_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('connect', 'disconnect')),
    ts REAL NOT NULL
);

-- Channel lifecycle; doubles as the SCID -> peer cache
CREATE TABLE IF NOT EXISTS channels (
    scid TEXT PRIMARY KEY,
    peer_id TEXT NOT NULL,
    capacity_sats INTEGER NOT NULL,
    first_seen_at REAL NOT NULL,
    last_seen_at REAL NOT NULL,
    is_open INTEGER NOT NULL DEFAULT 1,
    closed_at REAL
);
CREATE INDEX IF NOT EXISTS idx_channels_peer ON channels(peer_id);

-- Ingestion cursors and other sync state
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
