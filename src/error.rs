//! Caller-misuse errors surfaced synchronously by the Phaser.
//!
//! These are programming errors (duplicate phase ids, priming twice, running
//! before priming, looking up an unknown phase id) — never used for
//! phase-signalled outcomes, which are modeled by `PhaseOutcome` instead.

/// Errors the Phaser raises synchronously in response to caller misuse.
#[derive(Debug, thiserror::Error)]
pub enum PhaserError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl PhaserError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        PhaserError::InvalidArgument(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        PhaserError::InvalidState(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        PhaserError::NotFound(msg.into())
    }
}
