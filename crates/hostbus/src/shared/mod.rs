//! Shared-store realization: one `SQLite` database holds the presence
//! registry and the message queue for every agent in the pool.
//!
//! Contention is absorbed by WAL plus the busy timeout; leases are the
//! cross-process delivery mutex. Identity claims run inside a single
//! `IMMEDIATE` transaction so no window exists in which two sessions can
//! commit the same id.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::backend::{Backend, Envelope, PeerSnapshot, PublishOutcome, ReconcileStats};
use crate::clock::{fmt_clock, now_ts};
use crate::config::{BusConfig, shared_db_path};
use crate::error::{BusError, BusResult};
use crate::probe::{Liveness, PidProbe};
use crate::render::render_roster;
use crate::session::{HostIdentity, Session};
use crate::store;

/// Schema embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Lowest and highest ids in the pool.
const MIN_ID: u32 = 1;
const MAX_ID: u32 = 999;

/// Retries for a claim transaction that lost a race.
const CLAIM_RETRIES: u32 = 5;

/// The shared-store backend.
pub struct SharedBackend {
    config: Arc<BusConfig>,
    db_path: PathBuf,
}

impl SharedBackend {
    /// Creates a backend over `bridge_v1.db` under the configured root.
    #[must_use]
    pub fn new(config: Arc<BusConfig>) -> Self {
        let db_path = shared_db_path(&config.root);
        Self { config, db_path }
    }

    fn open(&self) -> BusResult<Connection> {
        let conn = store::open_with_pragmas(&self.db_path, self.config.busy_timeout)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(conn)
    }

    fn try_claim(&self, identity: &HostIdentity, probe: &dyn PidProbe) -> BusResult<String> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_ts();
        let ttl = self.config.heartbeat_ttl_secs();

        for n in MIN_ID..=MAX_ID {
            let cid = format!("{n:03}");
            let row: Option<(i64, String, f64)> = tx
                .query_row(
                    "SELECT pid, hostname, last_seen FROM peers WHERE id = ?1",
                    params![cid],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let reclaimable = match &row {
                None => true,
                Some((pid, hostname, last_seen)) => {
                    let stale = now - last_seen > ttl;
                    let orphaned = hostname == &identity.hostname
                        && probe.probe(*pid as u32) == Liveness::Dead;
                    stale || orphaned
                }
            };
            if !reclaimable {
                continue;
            }

            if row.is_some() {
                tx.execute("DELETE FROM peers WHERE id = ?1", params![cid])?;
            }
            tx.execute(
                "INSERT INTO peers (id, pid, hostname, last_seen, cwd, mode, mode_since, active_last_touch)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'working', ?4, ?4)",
                params![cid, i64::from(identity.pid), identity.hostname, now, identity.cwd],
            )?;
            tx.commit()?;
            return Ok(cid);
        }

        Err(BusError::PoolExhausted {
            min: MIN_ID,
            max: MAX_ID,
        })
    }

    fn local_sweep(&self, session: &Session, probe: &dyn PidProbe) -> BusResult<()> {
        let conn = self.open()?;
        let doomed: Vec<(String, i64)> = {
            let mut stmt = conn.prepare(
                "SELECT id, pid FROM peers WHERE hostname = ?1 AND id != ?2",
            )?;
            let rows = stmt.query_map(params![session.hostname(), session.id()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for (id, pid) in doomed {
            if probe.probe(pid as u32) == Liveness::Dead {
                conn.execute(
                    "DELETE FROM peers WHERE id = ?1 AND pid = ?2",
                    params![id, pid],
                )?;
                info!(peer = %id, pid, "evicted dead peer");
            }
        }
        Ok(())
    }

    fn remote_sweep(&self, now: f64) -> BusResult<()> {
        let conn = self.open()?;
        let expired = conn.execute(
            "DELETE FROM peers WHERE ?1 - last_seen > ?2",
            params![now, self.config.heartbeat_ttl_secs()],
        )?;
        if expired > 0 {
            info!(expired, "expired stale peers");
        }
        let released = conn.execute(
            "UPDATE messages SET state = 'queued', lease_owner = NULL, lease_until = NULL
             WHERE state = 'inflight' AND lease_until < ?1",
            params![now],
        )?;
        if released > 0 {
            info!(released, "released abandoned leases");
        }
        let truncated = conn.execute(
            "DELETE FROM messages WHERE ?1 - ts > ?2",
            params![now, self.config.msg_ttl_secs()],
        )?;
        if truncated > 0 {
            debug!(truncated, "truncated aged messages");
        }
        Ok(())
    }
}

impl Backend for SharedBackend {
    fn claim_identity(&self, identity: &HostIdentity, probe: &dyn PidProbe) -> BusResult<String> {
        let mut attempt = 0;
        loop {
            match self.try_claim(identity, probe) {
                Ok(id) => return Ok(id),
                Err(BusError::Db(e))
                    if attempt < CLAIM_RETRIES
                        && (store::is_busy(&e) || e.sqlite_error_code()
                            == Some(rusqlite::ErrorCode::ConstraintViolation)) =>
                {
                    attempt += 1;
                    debug!(attempt, error = %e, "claim transaction lost a race, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(u64::from(attempt) * 20));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn init_session(&self, session: &Session) -> BusResult<()> {
        let conn = self.open()?;
        let now = now_ts();
        conn.execute(
            "INSERT OR REPLACE INTO peers
                 (id, pid, hostname, last_seen, cwd, mode, mode_since, active_last_touch)
             VALUES (?1, ?2, ?3, ?4, ?5, 'working', ?4, ?4)",
            params![
                session.id(),
                i64::from(session.pid()),
                session.hostname(),
                now,
                session.cwd()
            ],
        )?;
        Ok(())
    }

    fn refresh_presence(&self, session: &Session, now: f64) -> BusResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE peers SET last_seen = ?2, cwd = ?3,
                 active_last_touch = COALESCE(?4, active_last_touch)
             WHERE id = ?1",
            params![session.id(), now, session.cwd(), session.last_active_ts()],
        )?;
        Ok(())
    }

    fn release_session(&self, session: &Session) {
        let outcome = self.open().and_then(|conn| {
            conn.execute(
                "DELETE FROM peers WHERE id = ?1 AND pid = ?2",
                params![session.id(), i64::from(session.pid())],
            )
            .map_err(BusError::from)
        });
        match outcome {
            Ok(deleted) if deleted > 0 => debug!(id = %session.id(), "released presence row"),
            Ok(_) => {}
            Err(e) => warn!(id = %session.id(), error = %e, "presence release failed"),
        }
    }

    fn online_peers(&self, now: f64) -> BusResult<Vec<PeerSnapshot>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, cwd, hostname, mode, mode_since, recv_started, recv_wait_seconds,
                    active_last_touch, last_seen
             FROM peers WHERE ?1 - last_seen < ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![now, self.config.heartbeat_ttl_secs()],
            |row| {
                Ok(PeerSnapshot {
                    id: row.get(0)?,
                    cwd: row.get(1)?,
                    hostname: row.get(2)?,
                    mode: row.get(3)?,
                    mode_since: row.get(4)?,
                    recv_started: row.get(5)?,
                    recv_wait_seconds: row.get(6)?,
                    active_last_touch: row.get(7)?,
                    last_seen: row.get(8)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn publish(
        &self,
        session: &Session,
        recipients: &[String],
        content: &str,
        now: f64,
    ) -> BusResult<PublishOutcome> {
        let ts_str = fmt_clock(now);
        let mut short_id = String::new();
        let mut delivered = 0usize;
        let mut last_err: Option<BusError> = None;

        // One transaction per record: fan-out records do not coordinate.
        for recipient in recipients {
            let msg_id = uuid::Uuid::new_v4().simple().to_string();
            if short_id.is_empty() {
                short_id = msg_id[..8].to_string();
            }
            let result = self.open().and_then(|conn| {
                conn.execute(
                    "INSERT INTO messages (msg_id, ts, ts_str, from_id, to_id, content, state, attempt)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', 0)",
                    params![msg_id, now, ts_str, session.id(), recipient, content],
                )
                .map_err(BusError::from)
            });
            match result {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!(recipient = %recipient, error = %e, "message insert failed");
                    last_err = Some(e);
                }
            }
        }

        if delivered == recipients.len() {
            Ok(PublishOutcome::Sent {
                delivered,
                short_id,
            })
        } else if delivered > 0 {
            Ok(PublishOutcome::Partial {
                delivered,
                requested: recipients.len(),
                short_id,
            })
        } else {
            Err(last_err.unwrap_or(BusError::EmptyRecipients))
        }
    }

    fn fetch_batch(&self, session: &Session, now: f64) -> BusResult<Vec<Envelope>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Abandoned leases for this recipient go back to the queue first,
        // so a restarted holder of the same id picks them straight up.
        tx.execute(
            "UPDATE messages SET state = 'queued', lease_owner = NULL, lease_until = NULL
             WHERE to_id = ?1 AND state = 'inflight' AND lease_until < ?2",
            params![session.id(), now],
        )?;

        let candidates: Vec<Envelope> = {
            let mut stmt = tx.prepare(
                "SELECT msg_id, ts, ts_str, from_id, content, attempt
                 FROM messages WHERE to_id = ?1 AND state = 'queued' ORDER BY ts",
            )?;
            let rows = stmt.query_map(params![session.id()], |row| {
                Ok(Envelope {
                    msg_id: row.get(0)?,
                    ts: row.get(1)?,
                    ts_str: row.get(2)?,
                    from_id: row.get(3)?,
                    content: row.get(4)?,
                    attempt: row.get::<_, i64>(5)? + 1,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        // Bound the batch by cumulative content size, always taking at
        // least one message so an oversized body cannot wedge the queue.
        let mut batch: Vec<Envelope> = Vec::new();
        let mut chars = 0usize;
        for envelope in candidates {
            let len = envelope.content.chars().count();
            if !batch.is_empty() && chars + len > self.config.max_batch_chars {
                break;
            }
            chars += len;
            batch.push(envelope);
        }

        let lease_until = now + self.config.lease_ttl_secs();
        for envelope in &batch {
            tx.execute(
                "UPDATE messages SET state = 'inflight', lease_owner = ?1, lease_until = ?2,
                     attempt = attempt + 1, delivered_at = ?3
                 WHERE msg_id = ?4 AND state = 'queued'",
                params![session.id(), lease_until, now, envelope.msg_id],
            )?;
        }
        tx.commit()?;
        Ok(batch)
    }

    fn ack_batch(&self, session: &Session, msg_ids: &[String]) -> BusResult<()> {
        if msg_ids.is_empty() {
            return Ok(());
        }
        let conn = self.open()?;
        let placeholders = vec!["?"; msg_ids.len()].join(",");
        let sql = format!(
            "DELETE FROM messages
             WHERE lease_owner = ?1 AND state = 'inflight' AND msg_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params_vec: Vec<String> = std::iter::once(session.id().to_string())
            .chain(msg_ids.iter().cloned())
            .collect();
        stmt.execute(rusqlite::params_from_iter(params_vec))?;
        Ok(())
    }

    fn set_waiting(&self, session: &Session, wait_seconds: i64, now: f64) {
        let result = self.open().and_then(|conn| {
            conn.execute(
                "UPDATE peers SET mode = 'waiting', mode_since = ?2, recv_started = ?2,
                     recv_deadline = ?3, recv_wait_seconds = ?4
                 WHERE id = ?1",
                params![session.id(), now, now + wait_seconds as f64, wait_seconds],
            )
            .map_err(BusError::from)
        });
        if let Err(e) = result {
            debug!(error = %e, "set_waiting skipped");
        }
    }

    fn clear_waiting(&self, session: &Session, now: f64) {
        let result = self.open().and_then(|conn| {
            conn.execute(
                "UPDATE peers SET mode = 'working', mode_since = ?2, recv_started = NULL,
                     recv_deadline = NULL, recv_wait_seconds = NULL
                 WHERE id = ?1",
                params![session.id(), now],
            )
            .map_err(BusError::from)
        });
        if let Err(e) = result {
            debug!(error = %e, "clear_waiting skipped");
        }
    }

    fn janitor_tick(&self, session: &Session, probe: &dyn PidProbe, tick: u64, now: f64) {
        if let Err(e) = self.local_sweep(session, probe) {
            warn!(error = %e, "local liveness sweep failed");
        }
        if tick % 6 == 0 {
            if let Err(e) = self.remote_sweep(now) {
                warn!(error = %e, "remote sweep failed");
            }
        }
        if tick % 30 == 0 {
            let result = self.open().and_then(|conn| store::checkpoint(&conn));
            if let Err(e) = result {
                warn!(error = %e, "store maintenance failed");
            }
        }
    }

    fn reconcile_cycle(&self, _session: &Session, _now: f64) -> Option<ReconcileStats> {
        None
    }

    fn render_status(&self, session: &Session, now: f64) -> BusResult<String> {
        let peers = self.online_peers(now)?;
        Ok(render_roster(session.id(), &peers, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::NativeProbe;

    fn test_config(root: &std::path::Path) -> Arc<BusConfig> {
        Arc::new(BusConfig::at_root(root))
    }

    fn identity(pid: u32) -> HostIdentity {
        HostIdentity {
            pid,
            hostname: "test-host".to_string(),
            cwd: "/tmp/work".to_string(),
        }
    }

    fn session(backend: &SharedBackend, pid: u32) -> Session {
        let id = backend
            .claim_identity(&identity(pid), &NativeProbe)
            .expect("claim");
        Session::new(id, identity(pid))
    }

    #[test]
    fn claim_allocates_smallest_free_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = SharedBackend::new(test_config(tmp.path()));
        let a = backend
            .claim_identity(&identity(std::process::id()), &NativeProbe)
            .expect("claim a");
        let b = backend
            .claim_identity(&identity(std::process::id()), &NativeProbe)
            .expect("claim b");
        assert_eq!(a, "001");
        assert_eq!(b, "002");
    }

    #[test]
    fn claim_reclaims_orphaned_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = SharedBackend::new(test_config(tmp.path()));
        // A session whose pid provably does not exist.
        let dead = backend
            .claim_identity(&identity(4_000_000), &NativeProbe)
            .expect("claim dead");
        assert_eq!(dead, "001");
        // The next claim on the same host reuses the orphaned slot.
        let live = backend
            .claim_identity(&identity(std::process::id()), &NativeProbe)
            .expect("claim live");
        assert_eq!(live, "001");
    }

    #[test]
    fn fetch_bounds_batch_by_content_chars() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = BusConfig::at_root(tmp.path());
        config.max_batch_chars = 10;
        let backend = SharedBackend::new(Arc::new(config));
        let sender = session(&backend, std::process::id());
        let receiver = session(&backend, std::process::id());

        backend
            .publish(
                &sender,
                &[receiver.id().to_string()],
                "aaaaaaaa",
                now_ts(),
            )
            .expect("publish 1");
        backend
            .publish(&sender, &[receiver.id().to_string()], "bbbbbbbb", now_ts() + 0.001)
            .expect("publish 2");

        let first = backend.fetch_batch(&receiver, now_ts()).expect("fetch");
        assert_eq!(first.len(), 1, "second message exceeds the char budget");
        backend
            .ack_batch(&receiver, &[first[0].msg_id.clone()])
            .expect("ack");
        let second = backend.fetch_batch(&receiver, now_ts()).expect("fetch 2");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content, "bbbbbbbb");
    }

    #[test]
    fn expired_lease_returns_to_queue_with_attempt_bump() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = BusConfig::at_root(tmp.path());
        config.lease_ttl = std::time::Duration::from_millis(0);
        let backend = SharedBackend::new(Arc::new(config));
        let sender = session(&backend, std::process::id());
        let receiver = session(&backend, std::process::id());

        backend
            .publish(&sender, &[receiver.id().to_string()], "m", now_ts())
            .expect("publish");
        let first = backend.fetch_batch(&receiver, now_ts()).expect("lease");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempt, 1);
        // No ACK: the zero-length lease has already expired.
        let second = backend
            .fetch_batch(&receiver, now_ts() + 0.01)
            .expect("re-lease");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempt, 2);
    }

    #[test]
    fn ack_deletes_only_leased_rows() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = SharedBackend::new(test_config(tmp.path()));
        let sender = session(&backend, std::process::id());
        let receiver = session(&backend, std::process::id());

        backend
            .publish(&sender, &[receiver.id().to_string()], "one", now_ts())
            .expect("publish");
        let batch = backend.fetch_batch(&receiver, now_ts()).expect("fetch");
        backend
            .ack_batch(&receiver, &[batch[0].msg_id.clone()])
            .expect("ack");
        let again = backend
            .fetch_batch(&receiver, now_ts() + 0.01)
            .expect("fetch again");
        assert!(again.is_empty(), "acked message must not reappear");
    }

    #[test]
    fn remote_sweep_expires_stale_peers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = BusConfig::at_root(tmp.path());
        config.heartbeat_ttl = std::time::Duration::from_millis(10);
        let backend = SharedBackend::new(Arc::new(config));
        let sess = session(&backend, std::process::id());
        std::thread::sleep(std::time::Duration::from_millis(30));
        backend.remote_sweep(now_ts()).expect("sweep");
        let peers = backend.online_peers(now_ts()).expect("peers");
        assert!(peers.is_empty(), "stale peer should be swept: {peers:?}");
        let _ = sess;
    }

    #[test]
    fn release_session_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = SharedBackend::new(test_config(tmp.path()));
        let sess = session(&backend, std::process::id());
        backend.release_session(&sess);
        backend.release_session(&sess);
        let peers = backend.online_peers(now_ts()).expect("peers");
        assert!(peers.is_empty());
    }
}
