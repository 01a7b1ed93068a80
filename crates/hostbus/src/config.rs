//! Bus configuration.
//!
//! Every timing knob from the coordination protocol lives here with its
//! default, and each can be overridden through an `HOSTBUS_*` environment
//! variable (seconds, fractional allowed) or set directly on the struct.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// Directory name of the message pool root, shared by every realization.
pub const POOL_DIR_NAME: &str = "mcp_msg_pool";

/// Configuration for a bus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Pool root directory. Defaults to the platform pool location.
    pub root: PathBuf,

    /// Liveness-stamp refresh cadence and local sweep cadence.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Peer offline threshold.
    #[serde(default = "default_heartbeat_ttl")]
    pub heartbeat_ttl: Duration,

    /// Message retention cap.
    #[serde(default = "default_msg_ttl")]
    pub msg_ttl: Duration,

    /// Inflight-to-queued recovery window.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: Duration,

    /// Receive-loop tick; bounds cancellation and deadline responsiveness.
    #[serde(default = "default_recv_tick")]
    pub recv_tick: Duration,

    /// Spacing between store polls inside the receive loop.
    #[serde(default = "default_recv_db_poll_every")]
    pub recv_db_poll_every: Duration,

    /// Output batch bound, in characters of cumulative message content.
    #[serde(default = "default_max_batch_chars")]
    pub max_batch_chars: usize,

    /// How long a publisher waits for reconciliation (sharded realization).
    #[serde(default = "default_send_wait")]
    pub send_wait: Duration,

    /// Outbox rows visited per reconciler pass over one shard.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Store busy timeout for lock contention.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: Duration,
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_heartbeat_ttl() -> Duration {
    Duration::from_secs(300)
}

const fn default_msg_ttl() -> Duration {
    Duration::from_secs(86_400)
}

const fn default_lease_ttl() -> Duration {
    Duration::from_secs(30)
}

const fn default_recv_tick() -> Duration {
    Duration::from_millis(250)
}

const fn default_recv_db_poll_every() -> Duration {
    Duration::from_secs(2)
}

const fn default_max_batch_chars() -> usize {
    5000
}

const fn default_send_wait() -> Duration {
    Duration::from_secs(2)
}

const fn default_batch_size() -> usize {
    50
}

const fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::at_root(default_pool_root())
    }
}

impl BusConfig {
    /// Builds a config rooted at `root`, with all other knobs at defaults.
    #[must_use]
    pub fn at_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_ttl: default_heartbeat_ttl(),
            msg_ttl: default_msg_ttl(),
            lease_ttl: default_lease_ttl(),
            recv_tick: default_recv_tick(),
            recv_db_poll_every: default_recv_db_poll_every(),
            max_batch_chars: default_max_batch_chars(),
            send_wait: default_send_wait(),
            batch_size: default_batch_size(),
            busy_timeout: default_busy_timeout(),
        }
    }

    /// Builds the default config, then applies `HOSTBUS_*` environment
    /// overrides. Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var("HOSTBUS_ROOT")
            .ok()
            .filter(|raw| !raw.is_empty())
            .map_or_else(default_pool_root, PathBuf::from);
        let mut cfg = Self::at_root(root);
        apply_secs(&mut cfg.heartbeat_interval, "HOSTBUS_HEARTBEAT_INTERVAL");
        apply_secs(&mut cfg.heartbeat_ttl, "HOSTBUS_HEARTBEAT_TTL");
        apply_secs(&mut cfg.msg_ttl, "HOSTBUS_MSG_TTL");
        apply_secs(&mut cfg.lease_ttl, "HOSTBUS_LEASE_TTL");
        apply_secs(&mut cfg.recv_tick, "HOSTBUS_RECV_TICK");
        apply_secs(&mut cfg.recv_db_poll_every, "HOSTBUS_RECV_DB_POLL_EVERY");
        apply_secs(&mut cfg.send_wait, "HOSTBUS_SEND_WAIT");
        apply_secs(&mut cfg.busy_timeout, "HOSTBUS_BUSY_TIMEOUT");
        if let Some(v) = read_usize("HOSTBUS_MAX_BATCH_CHARS") {
            cfg.max_batch_chars = v;
        }
        if let Some(v) = read_usize("HOSTBUS_BATCH_SIZE") {
            cfg.batch_size = v;
        }
        cfg
    }

    /// Creates the pool root directory if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_root(&self) -> BusResult<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| BusError::io(format!("creating pool root {}", self.root.display()), e))
    }

    /// TTL knobs as fractional seconds, the unit stored timestamps use.
    #[must_use]
    pub fn heartbeat_ttl_secs(&self) -> f64 {
        self.heartbeat_ttl.as_secs_f64()
    }

    #[must_use]
    pub fn msg_ttl_secs(&self) -> f64 {
        self.msg_ttl.as_secs_f64()
    }

    #[must_use]
    pub fn lease_ttl_secs(&self) -> f64 {
        self.lease_ttl.as_secs_f64()
    }
}

fn apply_secs(slot: &mut Duration, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(secs) = raw.trim().parse::<f64>() {
            if secs.is_finite() && secs >= 0.0 {
                *slot = Duration::from_secs_f64(secs);
            }
        }
    }
}

fn read_usize(var: &str) -> Option<usize> {
    std::env::var(var).ok()?.trim().parse().ok()
}

/// Resolves the platform default pool root.
///
/// An already-present candidate wins outright; otherwise the primary
/// location is tried and the fallback covers hosts where it cannot be
/// created (locked-down home directory, service accounts).
#[must_use]
pub fn default_pool_root() -> PathBuf {
    let candidates = pool_root_candidates();
    if let Some(existing) = candidates.iter().find(|c| c.is_dir()) {
        return existing.clone();
    }
    for candidate in &candidates {
        if std::fs::create_dir_all(candidate).is_ok() {
            return candidate.clone();
        }
    }
    // Unreachable in practice; the last candidate is world-writable.
    candidates
        .last()
        .cloned()
        .unwrap_or_else(|| PathBuf::from(POOL_DIR_NAME))
}

#[cfg(windows)]
fn pool_root_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from(format!("C:\\{POOL_DIR_NAME}")),
        PathBuf::from(format!("C:\\Users\\Public\\{POOL_DIR_NAME}")),
    ]
}

#[cfg(not(windows))]
fn pool_root_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dirs) = directories::BaseDirs::new() {
        candidates.push(dirs.home_dir().join(format!(".{POOL_DIR_NAME}")));
    }
    candidates.push(std::env::temp_dir().join(POOL_DIR_NAME));
    candidates
}

/// Shared-store database file name under the pool root.
#[must_use]
pub fn shared_db_path(root: &Path) -> PathBuf {
    root.join("bridge_v1.db")
}

/// Per-agent shard file name under the pool root.
#[must_use]
pub fn shard_db_path(root: &Path, id: &str) -> PathBuf {
    root.join(format!("agent_{id}.db"))
}
