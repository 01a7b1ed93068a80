//! Session identity and the activity sentinel.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::{now_micros, now_ts};

/// The identity a session presents to the pool: process handle, logical
/// host, and advisory working directory.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    /// Opaque process handle for the liveness probe.
    pub pid: u32,
    /// Logical host identifier; liveness probes only act on peers that
    /// share it.
    pub hostname: String,
    /// Advisory working directory, shown in the roster.
    pub cwd: String,
}

impl HostIdentity {
    /// Captures the current process's identity.
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: detect_hostname(),
            cwd: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "UnknownPath".to_string()),
        }
    }
}

/// A live bus session: a claimed three-digit id bound to one process.
///
/// The activity sentinel is process-local by design — a newer operation by
/// the same session bumps it, which is what cancels a blocking receive.
#[derive(Debug)]
pub struct Session {
    id: String,
    identity: HostIdentity,
    start_time: f64,
    last_active_us: AtomicU64,
}

impl Session {
    pub(crate) fn new(id: String, identity: HostIdentity) -> Self {
        Self {
            id,
            identity,
            start_time: now_ts(),
            last_active_us: AtomicU64::new(now_micros()),
        }
    }

    /// The session's three-digit id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.identity.pid
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.identity.hostname
    }

    #[must_use]
    pub fn cwd(&self) -> &str {
        &self.identity.cwd
    }

    /// Wall time at which this session was created.
    #[must_use]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Marks this session active. Any blocking receive observes the bump
    /// and returns `Cancelled by new command.`.
    pub fn mark_active(&self) {
        self.last_active_us.store(now_micros(), Ordering::SeqCst);
    }

    /// Snapshot of the activity sentinel, compared by the receive loop.
    #[must_use]
    pub fn activity_token(&self) -> u64 {
        self.last_active_us.load(Ordering::SeqCst)
    }

    /// The sentinel as fractional epoch seconds, for presence rows.
    #[must_use]
    pub fn last_active_ts(&self) -> f64 {
        self.activity_token() as f64 / 1_000_000.0
    }
}

/// Best-effort hostname detection: environment first, then the `hostname`
/// utility, then a fixed fallback.
#[must_use]
pub fn detect_hostname() -> String {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(name) = std::env::var(var) {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    if let Ok(output) = std::process::Command::new("hostname").output() {
        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    "localhost".to_string()
}
