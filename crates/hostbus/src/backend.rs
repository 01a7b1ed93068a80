//! The realization-agnostic storage contract.
//!
//! Two backends implement it: [`crate::shared::SharedBackend`] (one store,
//! leases) and [`crate::sharded::ShardedBackend`] (per-agent shards, a
//! reconciler, drain-on-read). The bus front end only ever talks to this
//! trait.

use crate::error::BusResult;
use crate::probe::PidProbe;
use crate::session::{HostIdentity, Session};

/// A presence snapshot for one online peer, as read from the store.
#[derive(Debug, Clone, Default)]
pub struct PeerSnapshot {
    /// Three-digit peer id.
    pub id: String,
    /// Advisory working directory, if recorded.
    pub cwd: Option<String>,
    /// Logical host the peer reported.
    pub hostname: Option<String>,
    /// `working` or `waiting`.
    pub mode: Option<String>,
    /// When the current mode was entered.
    pub mode_since: Option<f64>,
    /// When a blocking receive began, if one is active.
    pub recv_started: Option<f64>,
    /// The receive's total wait budget in seconds.
    pub recv_wait_seconds: Option<i64>,
    /// Last activity touch while waiting.
    pub active_last_touch: Option<f64>,
    /// Liveness stamp.
    pub last_seen: f64,
}

/// One inbound message handed to the receive path.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Message id (32-hex).
    pub msg_id: String,
    /// Enqueue wall time.
    pub ts: f64,
    /// Preformatted `HH:MM:SS` display stamp.
    pub ts_str: String,
    /// Sender id.
    pub from_id: String,
    /// Message body.
    pub content: String,
    /// Delivery attempt count, starting at 1.
    pub attempt: i64,
}

/// Result of publishing a message to a resolved recipient set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Every record was committed (and, sharded, reconciled in time).
    Sent {
        /// Number of recipients reached.
        delivered: usize,
        /// First eight hex characters of the first message id.
        short_id: String,
    },
    /// Only some records made it.
    Partial {
        /// Number of recipients reached.
        delivered: usize,
        /// Number of recipients requested.
        requested: usize,
        /// First eight hex characters of the first message id.
        short_id: String,
    },
    /// No record was reconciled before the send wait elapsed (sharded).
    /// The records remain durable and move on the next reconciler pass.
    Timeout {
        /// Number of recipients requested.
        requested: usize,
    },
}

/// One reconciler pass's result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileStats {
    /// Whether this session ran the pass as Leader.
    pub is_leader: bool,
    /// Online agents observed by the pass.
    pub online_count: usize,
    /// Messages moved from outboxes into inboxes.
    pub moved: usize,
}

/// Storage realization behind a bus endpoint.
pub trait Backend: Send + Sync {
    /// Atomically claims a free three-digit id for `identity`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::BusError::PoolExhausted`] when all slots belong
    /// to live sessions, or with a store error.
    fn claim_identity(&self, identity: &HostIdentity, probe: &dyn PidProbe) -> BusResult<String>;

    /// Registers the session's presence record. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a store error if registration fails.
    fn init_session(&self, session: &Session) -> BusResult<()>;

    /// Refreshes the session's liveness stamp and advisory fields.
    ///
    /// # Errors
    ///
    /// Returns a store error if the refresh fails.
    fn refresh_presence(&self, session: &Session, now: f64) -> BusResult<()>;

    /// Removes the session's presence record. Must be idempotent and must
    /// never panic; failures are logged and swallowed.
    fn release_session(&self, session: &Session);

    /// Snapshot of every online peer (liveness stamp within the TTL),
    /// including the calling session.
    ///
    /// # Errors
    ///
    /// Returns a store error if the scan fails.
    fn online_peers(&self, now: f64) -> BusResult<Vec<PeerSnapshot>>;

    /// Publishes `content` to each recipient in `recipients` (already
    /// resolved and validated). Materializes one record per recipient.
    ///
    /// # Errors
    ///
    /// Returns a store error only if no record could be committed.
    fn publish(
        &self,
        session: &Session,
        recipients: &[String],
        content: &str,
        now: f64,
    ) -> BusResult<PublishOutcome>;

    /// Takes the next batch of deliverable messages for this session:
    /// lease-and-read (shared) or atomic drain (sharded). An empty vec
    /// means nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    fn fetch_batch(&self, session: &Session, now: f64) -> BusResult<Vec<Envelope>>;

    /// Acknowledges a delivered batch, deleting exactly the leased records.
    /// A no-op for realizations that consume on read.
    ///
    /// # Errors
    ///
    /// Returns a store error if the delete fails; the messages then remain
    /// leased and re-queue on lease expiry.
    fn ack_batch(&self, session: &Session, msg_ids: &[String]) -> BusResult<()>;

    /// Marks the session as blocked in a receive.
    fn set_waiting(&self, session: &Session, wait_seconds: i64, now: f64);

    /// Restores the session to working mode. Runs on every receive exit
    /// path, so it must tolerate repeated calls.
    fn clear_waiting(&self, session: &Session, now: f64);

    /// One janitor pass. `tick` gates the slower sweeps (remote expiry
    /// every 6 ticks, store maintenance every 30). Swallows and logs its
    /// own failures.
    fn janitor_tick(&self, session: &Session, probe: &dyn PidProbe, tick: u64, now: f64);

    /// One reconciler pass, for realizations that have one. Returns `None`
    /// when the realization needs no reconciler.
    fn reconcile_cycle(&self, session: &Session, now: f64) -> Option<ReconcileStats>;

    /// Whether a reconciler thread should run for this realization.
    fn has_reconciler(&self) -> bool {
        false
    }

    /// Renders the online roster for this session.
    ///
    /// # Errors
    ///
    /// Returns a store error if presence cannot be read at all.
    fn render_status(&self, session: &Session, now: f64) -> BusResult<String>;
}
