//! hostbus: a local-first, multi-process message bus.
//!
//! Cooperating agent processes on one host (or a small set of hosts
//! sharing a filesystem) exchange direct messages, multicasts, and
//! broadcasts with at-least-once delivery and consume-on-read semantics.
//! There is no always-on server: the shared medium is `SQLite` state under
//! a pool root directory, and every agent is a short-lived peer.
//!
//! Two storage realizations implement one contract:
//!
//! - [`shared::SharedBackend`] — a single store holding a presence table
//!   and a message queue; leases make delivery crash-safe.
//! - [`sharded::ShardedBackend`] — one shard per agent plus a reconciler
//!   run by the Leader (the smallest online id), which moves outbox rows
//!   into recipient inboxes.
//!
//! ```no_run
//! use hostbus::{BackendKind, Bus, BusConfig};
//!
//! # fn main() -> Result<(), hostbus::BusError> {
//! let bus = Bus::connect(BusConfig::from_env(), BackendKind::Shared)?;
//! println!("{}", bus.get_status());
//! println!("{}", bus.send("all", "anyone there?"));
//! println!("{}", bus.recv(5));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod backend;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
mod maintenance;
pub mod probe;
pub mod render;
pub mod session;
pub mod shared;
pub mod sharded;
pub mod store;

pub use backend::{Backend, Envelope, PeerSnapshot, PublishOutcome, ReconcileStats};
pub use bus::{BackendKind, Bus, RecvOutcome};
pub use config::{BusConfig, default_pool_root};
pub use error::{BusError, BusResult};
pub use probe::{Liveness, NativeProbe, PidProbe};
pub use session::{HostIdentity, Session};
