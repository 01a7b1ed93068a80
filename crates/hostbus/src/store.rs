//! Store connection discipline.
//!
//! Every store access opens a connection, runs one short transaction, and
//! closes. WAL journaling with `synchronous=NORMAL` lets concurrent
//! processes read while a writer commits; the busy timeout absorbs
//! transient lock contention. No connection ever outlives the operation
//! that opened it — the on-disk store is the sole source of truth.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};

use crate::error::{BusError, BusResult};

/// Opens a connection with the bus pragmas applied, creating the file if
/// it does not exist.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or the pragmas fail.
pub fn open_with_pragmas(path: &Path, busy_timeout: Duration) -> BusResult<Connection> {
    let conn = Connection::open(path)?;
    apply_pragmas(&conn, busy_timeout)?;
    Ok(conn)
}

/// Opens an existing database without creating it. Peeking into another
/// agent's store must never conjure an empty file out of a race with its
/// removal.
///
/// # Errors
///
/// Returns an error if the file is absent, unopenable, or not a database.
pub fn open_existing(path: &Path, busy_timeout: Duration) -> BusResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    apply_pragmas(&conn, busy_timeout)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> BusResult<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;\n         PRAGMA synchronous=NORMAL;",
    )?;
    Ok(())
}

/// Forces a WAL checkpoint and lets the query planner refresh statistics.
/// Best-effort maintenance; failures are the caller's to log.
///
/// # Errors
///
/// Returns an error if the checkpoint statement fails.
pub fn checkpoint(conn: &Connection) -> BusResult<()> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);\n         PRAGMA optimize;")?;
    Ok(())
}

/// Whether an error indicates a file that is not (or no longer) a usable
/// database. Such shards are deleted and recreated with an empty schema.
#[must_use]
pub fn is_corrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::NotADatabase) | Some(rusqlite::ErrorCode::DatabaseCorrupt)
    )
}

/// Whether an error is transient lock contention worth retrying at a
/// higher level (the busy timeout has already retried internally).
#[must_use]
pub fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Removes a database file together with its WAL sidecars.
pub fn remove_db(path: &Path) -> BusResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        let target = Path::new(&target);
        if let Err(e) = std::fs::remove_file(target) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(BusError::io(
                    format!("removing store file {}", target.display()),
                    e,
                ));
            }
        }
    }
    Ok(())
}
