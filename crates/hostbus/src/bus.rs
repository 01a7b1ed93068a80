//! The bus front end: one value per process tying together configuration,
//! a storage realization, the claimed session, and the background
//! maintenance lifecycle. The three caller-facing operations live here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::backend::{Backend, Envelope, PublishOutcome, ReconcileStats};
use crate::clock::now_ts;
use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::maintenance::{self, StopFlag};
use crate::probe::{NativeProbe, PidProbe};
use crate::render::render_batch;
use crate::session::{HostIdentity, Session};
use crate::shared::SharedBackend;
use crate::sharded::ShardedBackend;

/// Which storage realization a bus endpoint runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// One shared store for the whole pool, leases as delivery mutex.
    Shared,
    /// Per-agent shards with a leader-driven reconciler.
    Sharded,
}

/// Typed result of a blocking receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A rendered message batch.
    Batch(String),
    /// Nothing pending and the caller declined to wait.
    Empty,
    /// The wait budget elapsed.
    Timeout {
        /// The wait budget, in whole seconds.
        waited: i64,
    },
    /// A newer operation by this same session interrupted the wait.
    Cancelled,
}

/// A connected bus endpoint.
///
/// Dropping the bus releases the session: background threads stop, then
/// the presence record is removed. `release()` may also be called
/// explicitly (for example from a signal handler) and is idempotent.
pub struct Bus {
    config: Arc<BusConfig>,
    backend: Arc<dyn Backend>,
    session: Arc<Session>,
    probe: Arc<dyn PidProbe>,
    stop: Arc<StopFlag>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    manual_tick: AtomicU64,
    released: AtomicBool,
}

impl Bus {
    /// Connects to the pool with this process's identity and the default
    /// background lifecycle.
    ///
    /// # Errors
    ///
    /// Fails when the pool root cannot be created, the identity pool is
    /// exhausted, or the store is unusable.
    pub fn connect(config: BusConfig, kind: BackendKind) -> BusResult<Self> {
        Self::connect_with(config, kind, HostIdentity::current(), true)
    }

    /// Connects with an explicit identity, optionally without background
    /// threads (callers then drive `maintenance_tick`/`reconcile_now`).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Bus::connect`].
    pub fn connect_with(
        config: BusConfig,
        kind: BackendKind,
        identity: HostIdentity,
        spawn_background: bool,
    ) -> BusResult<Self> {
        config.ensure_root()?;
        let config = Arc::new(config);
        let backend: Arc<dyn Backend> = match kind {
            BackendKind::Shared => Arc::new(SharedBackend::new(Arc::clone(&config))),
            BackendKind::Sharded => Arc::new(ShardedBackend::new(Arc::clone(&config))),
        };
        let probe: Arc<dyn PidProbe> = Arc::new(NativeProbe);
        let id = backend.claim_identity(&identity, probe.as_ref())?;
        let session = Arc::new(Session::new(id, identity));
        backend.init_session(&session)?;
        info!(id = %session.id(), pid = session.pid(), "bus session started");

        let bus = Self {
            config,
            backend,
            session,
            probe,
            stop: Arc::new(StopFlag::new()),
            threads: Mutex::new(Vec::new()),
            manual_tick: AtomicU64::new(0),
            released: AtomicBool::new(false),
        };
        if spawn_background {
            bus.spawn_background();
        }
        Ok(bus)
    }

    fn spawn_background(&self) {
        let mut threads = self
            .threads
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        {
            let config = Arc::clone(&self.config);
            let backend = Arc::clone(&self.backend);
            let session = Arc::clone(&self.session);
            let probe = Arc::clone(&self.probe);
            let stop = Arc::clone(&self.stop);
            threads.push(std::thread::spawn(move || {
                maintenance::heartbeat_loop(config, backend, session, probe, stop);
            }));
        }

        if self.backend.has_reconciler() {
            let backend = Arc::clone(&self.backend);
            let session = Arc::clone(&self.session);
            let stop = Arc::clone(&self.stop);
            threads.push(std::thread::spawn(move || {
                maintenance::reconciler_loop(backend, session, stop);
            }));
        }
    }

    /// The session's three-digit id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.session.id()
    }

    /// The live session value.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The underlying storage realization.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// The effective configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Operation surface
    // ------------------------------------------------------------------

    /// Renders the online roster.
    #[must_use]
    pub fn get_status(&self) -> String {
        self.session.mark_active();
        match self.backend.render_status(&self.session, now_ts()) {
            Ok(roster) => roster,
            Err(e) => e.to_string(),
        }
    }

    /// Sends `content` to `"all"`, one id, or a comma-separated id list,
    /// returning the caller-facing outcome string.
    #[must_use]
    pub fn send(&self, to: &str, content: &str) -> String {
        match self.try_send(to, content) {
            Ok(PublishOutcome::Sent {
                delivered,
                short_id,
            }) => {
                format!("Sent (to {delivered} agent(s), id={short_id})")
            }
            Ok(PublishOutcome::Partial {
                delivered,
                requested,
                short_id,
            }) => {
                format!("Partially sent (to {delivered}/{requested} agents, id={short_id})")
            }
            Ok(PublishOutcome::Timeout { requested }) => format!(
                "Send timeout after {}s (to {requested} agents)",
                fmt_wait_secs(self.config.send_wait)
            ),
            Err(e) => e.to_string(),
        }
    }

    /// Typed send. Validation happens before any write: self-addressing,
    /// empty input, and offline recipients fail fast.
    ///
    /// # Errors
    ///
    /// See [`BusError`] for the taxonomy.
    pub fn try_send(&self, to: &str, content: &str) -> BusResult<PublishOutcome> {
        self.session.mark_active();
        if content.trim().is_empty() {
            return Err(BusError::EmptyContent);
        }
        let requested: Vec<String> = to
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if requested.is_empty() {
            return Err(BusError::EmptyRecipients);
        }
        if requested.iter().any(|r| r == self.session.id()) {
            return Err(BusError::SelfSend);
        }

        let now = now_ts();
        let online: Vec<String> = self
            .backend
            .online_peers(now)?
            .into_iter()
            .map(|p| p.id)
            .collect();

        let recipients: Vec<String> = if requested.iter().any(|r| r.eq_ignore_ascii_case("all")) {
            let broadcast: Vec<String> = online
                .iter()
                .filter(|id| id.as_str() != self.session.id())
                .cloned()
                .collect();
            if broadcast.is_empty() {
                return Err(BusError::NoPeers);
            }
            broadcast
        } else {
            for recipient in &requested {
                if !online.contains(recipient) {
                    return Err(BusError::RecipientOffline {
                        id: recipient.clone(),
                    });
                }
            }
            requested
        };

        self.backend
            .publish(&self.session, &recipients, content, now)
    }

    /// Blocking receive, returning the caller-facing string.
    #[must_use]
    pub fn recv(&self, wait_seconds: i64) -> String {
        match self.try_recv(wait_seconds) {
            Ok(RecvOutcome::Batch(batch)) => batch,
            Ok(RecvOutcome::Empty) => "No new messages.".to_string(),
            Ok(RecvOutcome::Timeout { waited }) => format!("Timeout ({waited}s)."),
            Ok(RecvOutcome::Cancelled) => "Cancelled by new command.".to_string(),
            Err(e) => e.to_string(),
        }
    }

    /// Typed blocking receive.
    ///
    /// An immediate poll runs before any waiting; afterwards the loop
    /// wakes every `recv_tick` for cancellation and deadline checks and
    /// polls the store every `recv_db_poll_every`. Waiting mode is
    /// restored to working on every exit path.
    ///
    /// # Errors
    ///
    /// Returns a store error if a poll fails irrecoverably.
    pub fn try_recv(&self, wait_seconds: i64) -> BusResult<RecvOutcome> {
        self.session.mark_active();
        let token = self.session.activity_token();
        let start = now_ts();

        let batch = self.backend.fetch_batch(&self.session, start)?;
        if !batch.is_empty() {
            return Ok(self.finish_batch(&batch));
        }
        if wait_seconds <= 0 {
            return Ok(RecvOutcome::Empty);
        }

        self.backend.set_waiting(&self.session, wait_seconds, start);
        let _working_again = WaitingGuard {
            backend: self.backend.as_ref(),
            session: &self.session,
        };

        let deadline = start + wait_seconds as f64;
        let mut last_poll = start;
        loop {
            std::thread::sleep(self.config.recv_tick);
            if self.session.activity_token() != token {
                return Ok(RecvOutcome::Cancelled);
            }
            let now = now_ts();
            if now >= deadline {
                return Ok(RecvOutcome::Timeout {
                    waited: wait_seconds,
                });
            }
            if now - last_poll >= self.config.recv_db_poll_every.as_secs_f64() {
                last_poll = now;
                let batch = self.backend.fetch_batch(&self.session, now)?;
                if !batch.is_empty() {
                    return Ok(self.finish_batch(&batch));
                }
            }
        }
    }

    fn finish_batch(&self, batch: &[Envelope]) -> RecvOutcome {
        let rendered = render_batch(batch);
        let ids: Vec<String> = batch.iter().map(|e| e.msg_id.clone()).collect();
        // ACK after rendering. If the delete fails the rows stay leased
        // and re-queue on lease expiry; duplicates are tolerated.
        if let Err(e) = self.backend.ack_batch(&self.session, &ids) {
            warn!(error = %e, "batch ACK failed, relying on lease expiry");
        }
        RecvOutcome::Batch(rendered)
    }

    // ------------------------------------------------------------------
    // Maintenance lifecycle
    // ------------------------------------------------------------------

    /// Runs one heartbeat/janitor tick inline. Intended for endpoints
    /// created without background threads.
    pub fn maintenance_tick(&self) {
        let tick = self.manual_tick.fetch_add(1, Ordering::SeqCst) + 1;
        if let Err(e) = self.backend.refresh_presence(&self.session, now_ts()) {
            warn!(error = %e, "heartbeat refresh failed");
        }
        self.backend
            .janitor_tick(&self.session, self.probe.as_ref(), tick, now_ts());
    }

    /// Runs one reconciler cycle inline, if this realization has one.
    pub fn reconcile_now(&self) -> Option<ReconcileStats> {
        self.backend.reconcile_cycle(&self.session, now_ts())
    }

    /// Releases the session: stops background threads and removes the
    /// presence record. Idempotent; never panics.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.trigger();
        let threads = std::mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in threads {
            if handle.join().is_err() {
                warn!("background thread panicked before shutdown");
            }
        }
        self.backend.release_session(&self.session);
        info!(id = %self.session.id(), "bus session released");
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.release();
    }
}

/// Restores working mode on every receive exit path.
struct WaitingGuard<'a> {
    backend: &'a dyn Backend,
    session: &'a Session,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.backend.clear_waiting(self.session, now_ts());
    }
}

/// Renders a wait duration for the caller-facing timeout string. A whole
/// number of seconds renders without a fraction; a fractional `send_wait`
/// override is reported as configured rather than truncated.
fn fmt_wait_secs(wait: std::time::Duration) -> String {
    let secs = wait.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{secs}")
    }
}
