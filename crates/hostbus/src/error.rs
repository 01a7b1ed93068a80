//! Error taxonomy for bus operations.
//!
//! `Display` strings for the caller-facing variants are exactly the strings
//! returned to external callers; the string surface in [`crate::bus`] leans
//! on that.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced by bus operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// Store error from `SQLite`. Includes busy-timeout exhaustion.
    #[error("DB Error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Filesystem error outside the store proper.
    #[error("I/O error: {context}: {source}")]
    Io {
        /// Human-readable context for the error.
        context: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The sender appeared in its own recipient set.
    #[error("Error: cannot send to self.")]
    SelfSend,

    /// A named recipient is not currently online.
    #[error("Error: Agent '{id}' offline.")]
    RecipientOffline {
        /// The offline recipient id.
        id: String,
    },

    /// A broadcast resolved to an empty recipient set.
    #[error("No other agents online.")]
    NoPeers,

    /// Message content was empty after trimming.
    #[error("Error: empty message content.")]
    EmptyContent,

    /// The recipient specification parsed to nothing.
    #[error("Error: no recipients specified.")]
    EmptyRecipients,

    /// Every identifier in the pool belongs to a live session.
    #[error("identity pool exhausted ({min:03}-{max:03} all in use)")]
    PoolExhausted {
        /// Lowest id in the pool.
        min: u32,
        /// Highest id in the pool.
        max: u32,
    },
}

impl BusError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_caller_contract() {
        assert_eq!(BusError::SelfSend.to_string(), "Error: cannot send to self.");
        assert_eq!(
            BusError::RecipientOffline { id: "999".into() }.to_string(),
            "Error: Agent '999' offline."
        );
        assert_eq!(BusError::NoPeers.to_string(), "No other agents online.");
    }

    #[test]
    fn pool_exhausted_pads_ids() {
        let e = BusError::PoolExhausted { min: 1, max: 999 };
        assert_eq!(
            e.to_string(),
            "identity pool exhausted (001-999 all in use)"
        );
    }
}
