//! Background maintenance loops.
//!
//! One heartbeat/janitor loop per session, plus a reconciler loop for the
//! sharded realization. Both swallow and log their own failures: no
//! background error may take down the foreground operation or the process.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::backend::Backend;
use crate::clock::now_ts;
use crate::config::BusConfig;
use crate::probe::PidProbe;
use crate::session::Session;

/// Upper bound of the random jitter added to every sleep, keeping
/// co-hosted agents from ticking in lockstep.
const JITTER_MS: u64 = 50;

/// Pause when a reconciler pass sees no agents online at all.
const IDLE_PAUSE: Duration = Duration::from_secs(1);

/// A settable stop signal that sleeps can wait on, so shutdown never has
/// to ride out a full tick.
pub(crate) struct StopFlag {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopFlag {
    pub(crate) fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn trigger(&self) {
        let mut guard = self
            .stopped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = true;
        self.cv.notify_all();
    }

    /// Sleeps up to `timeout`; returns true when the flag was triggered.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .stopped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *guard {
            return true;
        }
        let (guard, _) = self
            .cv
            .wait_timeout(guard, timeout)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard
    }
}

pub(crate) fn jitter() -> Duration {
    Duration::from_millis(rand::random::<u64>() % (JITTER_MS + 1))
}

/// Heartbeat and janitor: refresh presence every interval, sweep dead and
/// stale peers, and hand the slower cadences to the backend via the tick
/// counter.
pub(crate) fn heartbeat_loop(
    config: Arc<BusConfig>,
    backend: Arc<dyn Backend>,
    session: Arc<Session>,
    probe: Arc<dyn PidProbe>,
    stop: Arc<StopFlag>,
) {
    let mut tick: u64 = 0;
    loop {
        if stop.wait_timeout(config.heartbeat_interval + jitter()) {
            return;
        }
        tick += 1;
        if let Err(e) = backend.refresh_presence(&session, now_ts()) {
            warn!(error = %e, "heartbeat refresh failed");
        }
        backend.janitor_tick(&session, probe.as_ref(), tick, now_ts());
    }
}

/// Reconciler loop: run a cycle, then pace dynamically by the online
/// population so a busy pool is visited more often.
pub(crate) fn reconciler_loop(
    backend: Arc<dyn Backend>,
    session: Arc<Session>,
    stop: Arc<StopFlag>,
) {
    loop {
        let started = Instant::now();
        let stats = backend.reconcile_cycle(&session, now_ts());
        let pause = match stats {
            Some(stats) if stats.online_count > 0 => Duration::from_millis(500)
                .div_f64(stats.online_count as f64)
                .max(Duration::from_millis(100)),
            _ => IDLE_PAUSE,
        };
        let pause = pause.saturating_sub(started.elapsed()) + jitter();
        if stop.wait_timeout(pause) {
            return;
        }
    }
}
