//! Sharded realization: every agent owns one `agent_<id>.db` shard holding
//! its presence, inbox, outbox, and a status-result slot.
//!
//! Writers never cross shards except the Leader's reconciler, which moves
//! outbox rows into recipient inboxes. Identity claims ride on
//! filesystem-level atomicity: the shard path is reserved with an
//! exclusive create before any schema runs.

mod reconciler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::backend::{Backend, Envelope, PeerSnapshot, PublishOutcome, ReconcileStats};
use crate::clock::{fmt_clock, now_ts};
use crate::config::{BusConfig, shard_db_path};
use crate::error::{BusError, BusResult};
use crate::probe::{Liveness, PidProbe};
use crate::render::render_roster;
use crate::session::{HostIdentity, Session};
use crate::store;

pub(crate) const SCHEMA_SQL: &str = include_str!("schema.sql");

const MIN_ID: u32 = 1;
const MAX_ID: u32 = 999;

/// Attempts at the full claim scan before giving up on create races.
const CLAIM_SCAN_RETRIES: u32 = 3;

/// Busy timeout when peeking into shards owned by other agents. Short:
/// a locked shard is skipped and revisited next pass.
const PEEK_BUSY_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a status caller waits for the Leader before scanning locally.
const STATUS_WAIT: Duration = Duration::from_secs(3);

/// Freshness window for an acceptable status result.
const STATUS_FRESH_SECS: f64 = 3.0;

/// The per-agent sharded backend.
pub struct ShardedBackend {
    config: Arc<BusConfig>,
}

impl ShardedBackend {
    #[must_use]
    pub fn new(config: Arc<BusConfig>) -> Self {
        Self { config }
    }

    pub(crate) fn shard_path(&self, id: &str) -> PathBuf {
        shard_db_path(&self.config.root, id)
    }

    /// Opens an existing shard without touching its schema.
    pub(crate) fn open_shard(&self, id: &str) -> BusResult<Connection> {
        store::open_with_pragmas(&self.shard_path(id), self.config.busy_timeout)
    }

    /// Opens a shard owned by another agent, with a short busy timeout.
    /// Never creates the file: the shard may be mid-removal.
    pub(crate) fn peek_shard(&self, id: &str) -> BusResult<Connection> {
        store::open_existing(&self.shard_path(id), PEEK_BUSY_TIMEOUT)
    }

    /// Creates (or repairs) this session's shard and installs its
    /// self-state row.
    fn init_shard(&self, session: &Session) -> BusResult<()> {
        let now = now_ts();
        let install = |conn: &Connection| -> Result<(), rusqlite::Error> {
            conn.execute_batch(SCHEMA_SQL)?;
            conn.execute(
                "INSERT OR REPLACE INTO self_state
                     (key, last_heartbeat, pid, hostname, cwd, mode, mode_since, active_last_touch)
                 VALUES ('main', ?1, ?2, ?3, ?4, 'working', ?1, ?1)",
                params![
                    now,
                    i64::from(session.pid()),
                    session.hostname(),
                    session.cwd()
                ],
            )?;
            Ok(())
        };

        match self.open_shard(session.id()) {
            Ok(conn) => match install(&conn) {
                Ok(()) => Ok(()),
                Err(e) if store::is_corrupt(&e) => {
                    warn!(id = %session.id(), error = %e, "corrupt shard, recreating");
                    drop(conn);
                    store::remove_db(&self.shard_path(session.id()))?;
                    let conn = self.open_shard(session.id())?;
                    install(&conn).map_err(BusError::from)
                }
                Err(e) => Err(e.into()),
            },
            Err(BusError::Db(e)) if store::is_corrupt(&e) => {
                warn!(id = %session.id(), error = %e, "unreadable shard, recreating");
                store::remove_db(&self.shard_path(session.id()))?;
                let conn = self.open_shard(session.id())?;
                install(&conn).map_err(BusError::from)
            }
            Err(e) => Err(e),
        }
    }

    /// Reserves `id` by creating its shard file exclusively.
    fn reserve(&self, id: &str) -> BusResult<bool> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.shard_path(id))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(BusError::io(format!("reserving shard for id {id}"), e)),
        }
    }

    /// Lists every shard id present on disk, sorted.
    pub(crate) fn shard_ids(&self) -> BusResult<Vec<String>> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.config.root)
            .map_err(|e| BusError::io("scanning pool root", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BusError::io("scanning pool root", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix("agent_")
                .and_then(|rest| rest.strip_suffix(".db"))
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Reads one shard's heartbeat stamp, if the shard is readable.
    pub(crate) fn shard_heartbeat(&self, id: &str) -> Option<f64> {
        let conn = self.peek_shard(id).ok()?;
        conn.query_row(
            "SELECT last_heartbeat FROM self_state WHERE key = 'main'",
            [],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }

    /// Ids whose heartbeat stamp is within the TTL, sorted ascending.
    pub(crate) fn online_ids(&self, now: f64) -> BusResult<Vec<String>> {
        let ttl = self.config.heartbeat_ttl_secs();
        let mut online = Vec::new();
        for id in self.shard_ids()? {
            if let Some(hb) = self.shard_heartbeat(&id) {
                if now - hb < ttl {
                    online.push(id);
                }
            }
        }
        Ok(online)
    }

    /// Full presence snapshot of one shard.
    pub(crate) fn shard_snapshot(&self, id: &str, now: f64) -> Option<PeerSnapshot> {
        let conn = self.peek_shard(id).ok()?;
        let snapshot = conn
            .query_row(
                "SELECT last_heartbeat, cwd, hostname, mode, mode_since, recv_started,
                        recv_wait_seconds, active_last_touch
                 FROM self_state WHERE key = 'main'",
                [],
                |row| {
                    Ok(PeerSnapshot {
                        id: id.to_string(),
                        last_seen: row.get::<_, Option<f64>>(0)?.unwrap_or(0.0),
                        cwd: row.get(1)?,
                        hostname: row.get(2)?,
                        mode: row.get(3)?,
                        mode_since: row.get(4)?,
                        recv_started: row.get(5)?,
                        recv_wait_seconds: row.get(6)?,
                        active_last_touch: row.get(7)?,
                    })
                },
            )
            .optional()
            .ok()
            .flatten()?;
        if now - snapshot.last_seen < self.config.heartbeat_ttl_secs() {
            Some(snapshot)
        } else {
            None
        }
    }

    fn outstanding_outbox(&self, session: &Session, msg_ids: &[String]) -> BusResult<usize> {
        if msg_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.open_shard(session.id())?;
        let placeholders = vec!["?"; msg_ids.len()].join(",");
        let sql = format!("SELECT COUNT(*) FROM outbox WHERE msg_id IN ({placeholders})");
        let count: i64 = conn.query_row(
            &sql,
            rusqlite::params_from_iter(msg_ids.iter()),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn local_sweep(&self, session: &Session, probe: &dyn PidProbe) {
        let Ok(ids) = self.shard_ids() else { return };
        for id in ids {
            if id == session.id() {
                continue;
            }
            let Ok(conn) = self.peek_shard(&id) else {
                continue;
            };
            let row: Option<(Option<i64>, Option<String>)> = conn
                .query_row(
                    "SELECT pid, hostname FROM self_state WHERE key = 'main'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .unwrap_or(None);
            drop(conn);
            let Some((Some(pid), Some(hostname))) = row else {
                continue;
            };
            if hostname == session.hostname() && probe.probe(pid as u32) == Liveness::Dead {
                if let Err(e) = store::remove_db(&self.shard_path(&id)) {
                    warn!(peer = %id, error = %e, "failed to remove dead peer shard");
                } else {
                    info!(peer = %id, pid, "evicted dead peer shard");
                }
            }
        }
    }

    fn remote_sweep(&self, session: &Session, now: f64) {
        let ttl = self.config.heartbeat_ttl_secs();
        let Ok(ids) = self.shard_ids() else { return };
        for id in ids {
            if id == session.id() {
                continue;
            }
            match self.shard_heartbeat(&id) {
                Some(hb) if now - hb > ttl => {
                    if let Err(e) = store::remove_db(&self.shard_path(&id)) {
                        warn!(peer = %id, error = %e, "failed to expire stale shard");
                    } else {
                        info!(peer = %id, "expired stale peer shard");
                    }
                }
                _ => {}
            }
        }

        // Aged rows in our own shard; other agents truncate their own.
        let result = self.open_shard(session.id()).and_then(|conn| {
            let cutoff = now - self.config.msg_ttl_secs();
            conn.execute("DELETE FROM inbox WHERE ts < ?1", params![cutoff])?;
            conn.execute("DELETE FROM outbox WHERE ts < ?1", params![cutoff])?;
            Ok(())
        });
        if let Err(e) = result {
            warn!(error = %e, "message truncation failed");
        }
    }
}

impl Backend for ShardedBackend {
    fn claim_identity(&self, identity: &HostIdentity, _probe: &dyn PidProbe) -> BusResult<String> {
        for _ in 0..CLAIM_SCAN_RETRIES {
            // Primary path: the first id with no shard file is free.
            let taken = self.shard_ids()?;
            let mut candidate = None;
            for n in MIN_ID..=MAX_ID {
                let cid = format!("{n:03}");
                if !taken.contains(&cid) {
                    candidate = Some(cid);
                    break;
                }
            }
            if let Some(cid) = candidate {
                if self.reserve(&cid)? {
                    return Ok(cid);
                }
                // Lost the create race; rescan.
                continue;
            }

            // Every id has a file: reclaim the oldest expired heartbeat,
            // or any shard that cannot be read at all.
            let now = now_ts();
            let ttl = self.config.heartbeat_ttl_secs();
            let mut oldest: Option<(String, f64)> = None;
            for id in &taken {
                match self.shard_heartbeat(id) {
                    Some(hb) if now - hb > ttl => {
                        if oldest.as_ref().map_or(true, |(_, best)| hb < *best) {
                            oldest = Some((id.clone(), hb));
                        }
                    }
                    Some(_) => {}
                    None => {
                        oldest = Some((id.clone(), f64::NEG_INFINITY));
                        break;
                    }
                }
            }
            let Some((id, _)) = oldest else {
                return Err(BusError::PoolExhausted {
                    min: MIN_ID,
                    max: MAX_ID,
                });
            };
            store::remove_db(&self.shard_path(&id))?;
            if self.reserve(&id)? {
                return Ok(id);
            }
        }
        Err(BusError::PoolExhausted {
            min: MIN_ID,
            max: MAX_ID,
        })
    }

    fn init_session(&self, session: &Session) -> BusResult<()> {
        self.init_shard(session)
    }

    fn refresh_presence(&self, session: &Session, now: f64) -> BusResult<()> {
        let conn = self.open_shard(session.id())?;
        conn.execute(
            "UPDATE self_state SET last_heartbeat = ?1, cwd = ?2,
                 active_last_touch = COALESCE(?3, active_last_touch)
             WHERE key = 'main'",
            params![now, session.cwd(), session.last_active_ts()],
        )?;
        Ok(())
    }

    fn release_session(&self, session: &Session) {
        match store::remove_db(&self.shard_path(session.id())) {
            Ok(()) => debug!(id = %session.id(), "released shard"),
            Err(e) => warn!(id = %session.id(), error = %e, "shard release failed"),
        }
    }

    fn online_peers(&self, now: f64) -> BusResult<Vec<PeerSnapshot>> {
        let mut peers = Vec::new();
        for id in self.shard_ids()? {
            if let Some(snapshot) = self.shard_snapshot(&id, now) {
                peers.push(snapshot);
            }
        }
        Ok(peers)
    }

    fn publish(
        &self,
        session: &Session,
        recipients: &[String],
        content: &str,
        now: f64,
    ) -> BusResult<PublishOutcome> {
        let ts_str = fmt_clock(now);
        let send_deadline = now + self.config.send_wait.as_secs_f64();
        let mut msg_ids: Vec<String> = Vec::with_capacity(recipients.len());
        let mut short_id = String::new();

        for recipient in recipients {
            let msg_id = uuid::Uuid::new_v4().simple().to_string();
            if short_id.is_empty() {
                short_id = msg_id[..8].to_string();
            }
            let conn = self.open_shard(session.id())?;
            conn.execute(
                "INSERT INTO outbox (msg_id, ts, ts_str, to_id, content, send_deadline, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
                params![msg_id, now, ts_str, recipient, content, send_deadline],
            )?;
            msg_ids.push(msg_id);
        }

        // Wait for the Leader to take the rows. Durability does not depend
        // on this: anything left in the outbox moves on a later pass.
        let deadline = std::time::Instant::now() + self.config.send_wait;
        loop {
            let outstanding = self.outstanding_outbox(session, &msg_ids)?;
            if outstanding == 0 {
                return Ok(PublishOutcome::Sent {
                    delivered: msg_ids.len(),
                    short_id,
                });
            }
            if std::time::Instant::now() >= deadline {
                let delivered = msg_ids.len() - outstanding;
                return Ok(if delivered > 0 {
                    PublishOutcome::Partial {
                        delivered,
                        requested: msg_ids.len(),
                        short_id,
                    }
                } else {
                    PublishOutcome::Timeout {
                        requested: msg_ids.len(),
                    }
                });
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn fetch_batch(&self, session: &Session, _now: f64) -> BusResult<Vec<Envelope>> {
        let mut conn = self.open_shard(session.id())?;
        let tx = conn.transaction()?;
        let drained: Vec<Envelope> = {
            let mut stmt = tx.prepare(
                "SELECT msg_id, ts, ts_str, from_id, content FROM inbox ORDER BY ts",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(Envelope {
                    msg_id: row.get(0)?,
                    ts: row.get(1)?,
                    ts_str: row.get(2)?,
                    from_id: row.get(3)?,
                    content: row.get(4)?,
                    attempt: 1,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for envelope in &drained {
            tx.execute("DELETE FROM inbox WHERE msg_id = ?1", params![envelope.msg_id])?;
        }
        tx.commit()?;
        Ok(drained)
    }

    fn ack_batch(&self, _session: &Session, _msg_ids: &[String]) -> BusResult<()> {
        // Consume-on-read: the drain already removed the rows.
        Ok(())
    }

    fn set_waiting(&self, session: &Session, wait_seconds: i64, now: f64) {
        let result = self.open_shard(session.id()).and_then(|conn| {
            conn.execute(
                "UPDATE self_state SET mode = 'waiting', mode_since = ?1, recv_started = ?1,
                     recv_deadline = ?2, recv_wait_seconds = ?3
                 WHERE key = 'main'",
                params![now, now + wait_seconds as f64, wait_seconds],
            )
            .map_err(BusError::from)
        });
        if let Err(e) = result {
            debug!(error = %e, "set_waiting skipped");
        }
    }

    fn clear_waiting(&self, session: &Session, now: f64) {
        let result = self.open_shard(session.id()).and_then(|conn| {
            conn.execute(
                "UPDATE self_state SET mode = 'working', mode_since = ?1, recv_started = NULL,
                     recv_deadline = NULL, recv_wait_seconds = NULL
                 WHERE key = 'main'",
                params![now],
            )
            .map_err(BusError::from)
        });
        if let Err(e) = result {
            debug!(error = %e, "clear_waiting skipped");
        }
    }

    fn janitor_tick(&self, session: &Session, probe: &dyn PidProbe, tick: u64, now: f64) {
        self.local_sweep(session, probe);
        if tick % 6 == 0 {
            self.remote_sweep(session, now);
        }
        if tick % 30 == 0 {
            let result = self
                .open_shard(session.id())
                .and_then(|conn| store::checkpoint(&conn));
            if let Err(e) = result {
                warn!(error = %e, "shard maintenance failed");
            }
        }
    }

    fn reconcile_cycle(&self, session: &Session, now: f64) -> Option<ReconcileStats> {
        Some(reconciler::run_cycle(self, session, now))
    }

    fn has_reconciler(&self) -> bool {
        true
    }

    fn render_status(&self, session: &Session, now: f64) -> BusResult<String> {
        // Ask the Leader for a roster through our own shard.
        let request = self.open_shard(session.id()).and_then(|conn| {
            conn.execute(
                "UPDATE self_state SET status_request = 1 WHERE key = 'main'",
                [],
            )
            .map_err(BusError::from)
        });
        if let Err(e) = request {
            debug!(error = %e, "status request write failed, scanning locally");
        } else {
            let deadline = std::time::Instant::now() + STATUS_WAIT;
            while std::time::Instant::now() < deadline {
                if let Ok(conn) = self.open_shard(session.id()) {
                    let row: Option<(Option<String>, Option<f64>)> = conn
                        .query_row(
                            "SELECT result, updated_at FROM status_result WHERE key = 'main'",
                            [],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()
                        .unwrap_or(None);
                    if let Some((Some(result), Some(updated_at))) = row {
                        if now_ts() - updated_at < STATUS_FRESH_SECS {
                            return Ok(result);
                        }
                    }
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }

        // Leader unresponsive: degrade to a local scan.
        let peers = self.online_peers(now)?;
        Ok(render_roster(session.id(), &peers, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::NativeProbe;

    fn backend(root: &std::path::Path) -> ShardedBackend {
        ShardedBackend::new(Arc::new(BusConfig::at_root(root)))
    }

    fn identity() -> HostIdentity {
        HostIdentity {
            pid: std::process::id(),
            hostname: "test-host".to_string(),
            cwd: "/tmp/work".to_string(),
        }
    }

    fn open_session(backend: &ShardedBackend) -> Session {
        let id = backend
            .claim_identity(&identity(), &NativeProbe)
            .expect("claim");
        let session = Session::new(id, identity());
        backend.init_session(&session).expect("init");
        session
    }

    #[test]
    fn claim_takes_first_free_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = backend(tmp.path());
        let a = open_session(&backend);
        let b = open_session(&backend);
        assert_eq!(a.id(), "001");
        assert_eq!(b.id(), "002");
        assert!(backend.shard_path("001").exists());
        assert!(backend.shard_path("002").exists());
    }

    #[test]
    fn claim_skips_hole_left_by_release() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = backend(tmp.path());
        let a = open_session(&backend);
        let _b = open_session(&backend);
        backend.release_session(&a);
        let again = open_session(&backend);
        assert_eq!(again.id(), "001", "smallest free id wins");
    }

    #[test]
    fn init_reuses_readable_shard() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = backend(tmp.path());
        let session = open_session(&backend);
        // Re-init must not wipe the inbox.
        let conn = backend.open_shard(session.id()).expect("open");
        conn.execute(
            "INSERT INTO inbox (msg_id, ts, ts_str, from_id, content)
             VALUES ('m1', 1.0, '00:00:01', '999', 'kept')",
            [],
        )
        .expect("seed inbox");
        drop(conn);
        backend.init_session(&session).expect("re-init");
        let batch = backend.fetch_batch(&session, now_ts()).expect("drain");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].content, "kept");
    }

    #[test]
    fn corrupt_shard_is_recreated() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = backend(tmp.path());
        let session = open_session(&backend);
        // Stomp the shard with garbage.
        store::remove_db(&backend.shard_path(session.id())).expect("clear");
        std::fs::write(backend.shard_path(session.id()), b"not a database at all")
            .expect("corrupt");
        backend.init_session(&session).expect("recover");
        let batch = backend.fetch_batch(&session, now_ts()).expect("drain");
        assert!(batch.is_empty());
    }

    #[test]
    fn drain_empties_inbox_atomically() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = backend(tmp.path());
        let session = open_session(&backend);
        let conn = backend.open_shard(session.id()).expect("open");
        for n in 0..3 {
            conn.execute(
                "INSERT INTO inbox (msg_id, ts, ts_str, from_id, content)
                 VALUES (?1, ?2, '00:00:00', '007', ?3)",
                params![format!("m{n}"), f64::from(n), format!("body {n}")],
            )
            .expect("seed");
        }
        drop(conn);
        let batch = backend.fetch_batch(&session, now_ts()).expect("drain");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].content, "body 0");
        let again = backend.fetch_batch(&session, now_ts()).expect("drain 2");
        assert!(again.is_empty());
    }

    #[test]
    fn publish_without_leader_times_out_but_stays_durable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = BusConfig::at_root(tmp.path());
        config.send_wait = Duration::from_millis(150);
        let backend = ShardedBackend::new(Arc::new(config));
        let id = backend
            .claim_identity(&identity(), &NativeProbe)
            .expect("claim");
        let session = Session::new(id, identity());
        backend.init_session(&session).expect("init");

        let outcome = backend
            .publish(&session, &["777".to_string()], "stranded", now_ts())
            .expect("publish");
        assert_eq!(outcome, PublishOutcome::Timeout { requested: 1 });

        let conn = backend.open_shard(session.id()).expect("open");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1, "undelivered row remains for the next pass");
    }

    #[test]
    fn online_ids_excludes_stale_heartbeats() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = BusConfig::at_root(tmp.path());
        config.heartbeat_ttl = Duration::from_millis(20);
        let backend = ShardedBackend::new(Arc::new(config));
        let id = backend
            .claim_identity(&identity(), &NativeProbe)
            .expect("claim");
        let session = Session::new(id, identity());
        backend.init_session(&session).expect("init");

        assert_eq!(backend.online_ids(now_ts()).expect("online"), vec!["001"]);
        std::thread::sleep(Duration::from_millis(40));
        assert!(backend.online_ids(now_ts()).expect("online").is_empty());
    }
}
