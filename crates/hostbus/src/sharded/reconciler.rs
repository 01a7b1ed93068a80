//! Leader-driven reconciliation.
//!
//! The peer with the smallest online id runs the reconciler. Each cycle it
//! visits every online shard in id order, moves a bounded batch of outbox
//! rows into recipient inboxes, and services pending status requests. At
//! most one shard transaction is open at any moment: the outbox is
//! snapshot-read, deliveries happen against recipient shards, and only
//! then is the source shard re-opened for cleanup.

use rusqlite::{OptionalExtension, params};
use tracing::{debug, warn};

use crate::backend::{PeerSnapshot, ReconcileStats};
use crate::clock::now_ts;
use crate::render::render_roster;
use crate::session::Session;

use super::ShardedBackend;

/// A pending outbox row, snapshot-read from a source shard.
struct OutboundRow {
    msg_id: String,
    ts: f64,
    ts_str: String,
    to_id: String,
    content: String,
}

/// Runs one reconciliation cycle. Never panics; shards that cannot be
/// read or written this pass are simply revisited on the next one.
pub(super) fn run_cycle(backend: &ShardedBackend, session: &Session, now: f64) -> ReconcileStats {
    let online = match backend.online_ids(now) {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "online scan failed, skipping cycle");
            return ReconcileStats::default();
        }
    };
    let mut stats = ReconcileStats {
        is_leader: false,
        online_count: online.len(),
        moved: 0,
    };
    let leader = online.first().cloned();
    if leader.as_deref() != Some(session.id()) {
        return stats;
    }
    stats.is_leader = true;

    for agent_id in &online {
        stats.moved += process_shard(backend, agent_id, &online);
    }
    stats
}

/// Visits one shard: drains a batch of its outbox and answers its status
/// request. Returns the number of messages moved.
fn process_shard(backend: &ShardedBackend, agent_id: &str, online: &[String]) -> usize {
    // Snapshot read; the shard's own writer is never blocked for long.
    let (rows, status_requested) = match snapshot_shard(backend, agent_id) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            debug!(shard = %agent_id, error = %e, "shard snapshot failed");
            return 0;
        }
    };
    if rows.is_empty() && !status_requested {
        return 0;
    }

    // Deliver outside any source-shard transaction.
    let mut delivered: Vec<String> = Vec::new();
    for row in &rows {
        if deliver(backend, agent_id, row, online) {
            delivered.push(row.msg_id.clone());
        }
    }

    // The roster is rendered before re-opening the source shard so no two
    // shard transactions are ever held together.
    let roster = if status_requested {
        Some(render_for(backend, agent_id, online))
    } else {
        None
    };

    if let Err(e) = cleanup_shard(backend, agent_id, &delivered, roster.as_deref()) {
        debug!(shard = %agent_id, error = %e, "shard cleanup failed, will retry");
        return 0;
    }
    delivered.len()
}

fn snapshot_shard(
    backend: &ShardedBackend,
    agent_id: &str,
) -> crate::error::BusResult<(Vec<OutboundRow>, bool)> {
    let conn = backend.peek_shard(agent_id)?;
    let rows: Vec<OutboundRow> = {
        let mut stmt = conn.prepare(
            "SELECT msg_id, ts, ts_str, to_id, content FROM outbox ORDER BY ts LIMIT ?1",
        )?;
        let mapped = stmt.query_map(params![backend.config.batch_size as i64], |row| {
            Ok(OutboundRow {
                msg_id: row.get(0)?,
                ts: row.get(1)?,
                ts_str: row.get(2)?,
                to_id: row.get(3)?,
                content: row.get(4)?,
            })
        })?;
        mapped.collect::<Result<Vec<_>, _>>()?
    };
    let status_requested: bool = conn
        .query_row(
            "SELECT status_request FROM self_state WHERE key = 'main'",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten()
        .unwrap_or(0)
        == 1;
    Ok((rows, status_requested))
}

/// Fans one outbox row out into recipient inboxes. Returns true only when
/// every resolved target accepted the row; a partially-delivered row stays
/// in the outbox and the `INSERT OR IGNORE` keeps the retry idempotent.
fn deliver(
    backend: &ShardedBackend,
    sender_id: &str,
    row: &OutboundRow,
    online: &[String],
) -> bool {
    let targets: Vec<&String> = if row.to_id == "all" {
        online.iter().filter(|id| id.as_str() != sender_id).collect()
    } else if online.iter().any(|id| id == &row.to_id) {
        online.iter().filter(|id| **id == row.to_id).collect()
    } else {
        // Target offline; leave the row for the sender's send-wait to
        // report and for message truncation to reap.
        return false;
    };
    if targets.is_empty() {
        return false;
    }

    for target in targets {
        let result = backend.peek_shard(target).and_then(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO inbox (msg_id, ts, ts_str, from_id, content)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.msg_id, row.ts, row.ts_str, sender_id, row.content],
            )
            .map_err(crate::error::BusError::from)
        });
        if let Err(e) = result {
            debug!(target = %target, error = %e, "inbox insert failed");
            return false;
        }
    }
    true
}

/// Renders the roster on behalf of `requester_id`, so the `THIS` flag and
/// self-first ordering reflect the asking session.
fn render_for(backend: &ShardedBackend, requester_id: &str, online: &[String]) -> String {
    let now = now_ts();
    let peers: Vec<PeerSnapshot> = online
        .iter()
        .filter_map(|id| backend.shard_snapshot(id, now))
        .collect();
    render_roster(requester_id, &peers, now)
}

fn cleanup_shard(
    backend: &ShardedBackend,
    agent_id: &str,
    delivered: &[String],
    roster: Option<&str>,
) -> crate::error::BusResult<()> {
    let conn = backend.peek_shard(agent_id)?;
    for msg_id in delivered {
        conn.execute("DELETE FROM outbox WHERE msg_id = ?1", params![msg_id])?;
    }
    if let Some(roster) = roster {
        conn.execute(
            "INSERT OR REPLACE INTO status_result (key, result, updated_at)
             VALUES ('main', ?1, ?2)",
            params![roster, now_ts()],
        )?;
        conn.execute(
            "UPDATE self_state SET status_request = 0 WHERE key = 'main'",
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::backend::Backend;
    use crate::config::BusConfig;
    use crate::probe::NativeProbe;
    use crate::session::HostIdentity;

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

    fn sharded(root: &std::path::Path) -> ShardedBackend {
        let mut config = BusConfig::at_root(root);
        config.send_wait = Duration::from_millis(100);
        ShardedBackend::new(Arc::new(config))
    }

    #[test]
    fn smallest_online_id_is_leader() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = sharded(tmp.path());
        let a = open_session(&backend);
        let b = open_session(&backend);

        let stats_a = run_cycle(&backend, &a, now_ts());
        let stats_b = run_cycle(&backend, &b, now_ts());
        assert!(stats_a.is_leader, "001 leads");
        assert!(!stats_b.is_leader, "002 follows");
        assert_eq!(stats_a.online_count, 2);
    }

    #[test]
    fn cycle_moves_outbox_rows_into_target_inbox() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = sharded(tmp.path());
        let a = open_session(&backend);
        let b = open_session(&backend);

        let outcome = backend
            .publish(&b, &[a.id().to_string()], "over the wall", now_ts())
            .expect("publish");
        // No leader ran during the short send wait.
        assert!(matches!(
            outcome,
            crate::backend::PublishOutcome::Timeout { .. }
        ));

        let stats = run_cycle(&backend, &a, now_ts());
        assert!(stats.is_leader);
        assert_eq!(stats.moved, 1);

        let batch = backend.fetch_batch(&a, now_ts()).expect("drain");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].from_id, b.id());
        assert_eq!(batch[0].content, "over the wall");

        // The outbox row is gone from the sender's shard.
        let conn = backend.open_shard(b.id()).expect("open");
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
            .expect("count");
        assert_eq!(left, 0);
    }

    #[test]
    fn broadcast_expands_to_online_snapshot_minus_sender() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = sharded(tmp.path());
        let a = open_session(&backend);
        let b = open_session(&backend);
        let c = open_session(&backend);

        backend
            .publish(&a, &["all".to_string()], "fanout", now_ts())
            .expect("publish");
        run_cycle(&backend, &a, now_ts());

        for receiver in [&b, &c] {
            let batch = backend.fetch_batch(receiver, now_ts()).expect("drain");
            assert_eq!(batch.len(), 1, "{} should receive", receiver.id());
        }
        let own = backend.fetch_batch(&a, now_ts()).expect("drain self");
        assert!(own.is_empty(), "sender excluded from its own broadcast");
    }

    #[test]
    fn status_request_is_serviced_with_requester_first() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = sharded(tmp.path());
        let a = open_session(&backend);
        let b = open_session(&backend);

        let conn = backend.open_shard(b.id()).expect("open");
        conn.execute(
            "UPDATE self_state SET status_request = 1 WHERE key = 'main'",
            [],
        )
        .expect("request");
        drop(conn);

        run_cycle(&backend, &a, now_ts());

        let conn = backend.open_shard(b.id()).expect("open");
        let (result, flag): (String, i64) = conn
            .query_row(
                "SELECT sr.result, ss.status_request
                 FROM status_result sr, self_state ss
                 WHERE sr.key = 'main' AND ss.key = 'main'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("result");
        assert_eq!(flag, 0, "request flag cleared");
        let first_line = result.lines().next().expect("roster line");
        assert!(
            first_line.contains(&format!("Agent {}", b.id())),
            "requester renders first: {result}"
        );
        assert!(first_line.contains("THIS"));
    }

    #[test]
    fn offline_recipient_row_stays_in_outbox() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let backend = sharded(tmp.path());
        let a = open_session(&backend);

        backend
            .publish(&a, &["555".to_string()], "nobody home", now_ts())
            .expect("publish");
        let stats = run_cycle(&backend, &a, now_ts());
        assert_eq!(stats.moved, 0);

        let conn = backend.open_shard(a.id()).expect("open");
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
            .expect("count");
        assert_eq!(left, 1);
    }
}
