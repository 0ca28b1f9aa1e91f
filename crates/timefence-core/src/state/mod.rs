//! Persisted state record and its canonical byte form.
//!
//! The record is the single piece of durable data the daemon owns. It is
//! encoded as JSON before encryption: self-describing, stable field names,
//! and tolerant of unknown fields so an older daemon can read a newer
//! file as long as the six core fields are present.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding a state record.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The bytes do not parse as a state record, or a field is out of
    /// range.
    #[error("malformed state record: {0}")]
    MalformedState(String),

    /// The record could not be serialized.
    #[error("state serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// The persisted block-window record.
///
/// Invariants, maintained by the keeper:
///
/// - `remaining_ms` never goes negative (it is unsigned here, and every
///   debit saturates).
/// - `heartbeat_count` is non-decreasing across persists of the same
///   logical state file.
/// - once `tampered` is set it is never cleared within this file's
///   lifetime.
/// - the clock stamps are refreshed to current readings on every persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Milliseconds still owed on the current block window.
    pub remaining_ms: u64,

    /// Monotonic reading at the last persist, in ticks.
    pub last_mono_ticks: i64,

    /// Wall reading at the last persist, in 100-ns units since the Unix
    /// epoch.
    pub last_wall_ticks: i64,

    /// Ticks per second of the monotonic source at the last persist.
    pub mono_frequency: u64,

    /// Sticky integrity flag. Once true, debits stop and budget changes
    /// are refused until the state file is externally deleted.
    pub tampered: bool,

    /// Count of successful persists of this state file.
    pub heartbeat_count: u64,
}

impl State {
    /// Creates a record for a new block window.
    #[must_use]
    pub const fn fresh(
        remaining_ms: u64,
        last_mono_ticks: i64,
        last_wall_ticks: i64,
        mono_frequency: u64,
    ) -> Self {
        Self {
            remaining_ms,
            last_mono_ticks,
            last_wall_ticks,
            mono_frequency,
            tampered: false,
            heartbeat_count: 0,
        }
    }

    /// Creates a tampered record adopting the caller's fallback budget.
    ///
    /// Used when a prior blob exists but cannot be trusted.
    #[must_use]
    pub const fn locked(
        remaining_ms: u64,
        last_mono_ticks: i64,
        last_wall_ticks: i64,
        mono_frequency: u64,
    ) -> Self {
        Self {
            remaining_ms,
            last_mono_ticks,
            last_wall_ticks,
            mono_frequency,
            tampered: true,
            heartbeat_count: 0,
        }
    }
}

/// Encodes a state record into its canonical byte form.
///
/// # Errors
///
/// Returns [`CodecError::Serialize`] if the record cannot be serialized;
/// this cannot happen for well-formed records and exists to avoid a panic
/// path in the persist pipeline.
pub fn encode_state(state: &State) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(state).map_err(CodecError::Serialize)
}

/// Decodes a state record from its canonical byte form.
///
/// # Errors
///
/// Returns [`CodecError::MalformedState`] if any required field is
/// missing, `remaining_ms` or `heartbeat_count` is negative, or
/// `mono_frequency` is zero.
pub fn decode_state(bytes: &[u8]) -> Result<State, CodecError> {
    let state: State =
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedState(e.to_string()))?;
    if state.mono_frequency == 0 {
        return Err(CodecError::MalformedState(
            "mono_frequency must be positive".to_string(),
        ));
    }
    Ok(state)
}
