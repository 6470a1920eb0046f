//! Error and status types for the NAN multiplexer.
//!
//! Two families live here:
//!
//! - [`NanStatus`] is the reason code carried inside client-visible failure
//!   events.  It is either supplied by the firmware or chosen locally
//!   (timeouts, quota rejections, misuse).
//! - [`ConfigError`] reports a request that failed validation before it
//!   could be turned into a HAL command.
//!
//! All variants are `Copy` so they can travel through events and pending
//! command records without allocation.

use core::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client-visible status codes
// ---------------------------------------------------------------------------

/// Failure reason delivered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NanStatus {
    /// Host-side failure: timeout, quota exhaustion, synchronous HAL reject.
    InternalFailure,
    /// Firmware reported a protocol-level failure, or answered with the wrong shape.
    ProtocolFailure,
    /// The firmware no longer knows the referenced publish/subscribe id.
    InvalidSessionId,
    /// Firmware or an interface-conflict arbiter refused resources.
    NoResourcesAvailable,
    /// Request parameters were rejected.
    InvalidArgs,
    /// The referenced peer is unknown.
    InvalidPeerId,
    /// A follow-up message was never acknowledged over the air.
    NoOtaAck,
    /// The firmware transmit queue is full.
    FollowupTxQueueFull,
    /// The subsystem is disabled or the operation is unsupported.
    NotAllowed,
}

impl fmt::Display for NanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InternalFailure => write!(f, "internal failure"),
            Self::ProtocolFailure => write!(f, "protocol failure"),
            Self::InvalidSessionId => write!(f, "invalid session id"),
            Self::NoResourcesAvailable => write!(f, "no resources available"),
            Self::InvalidArgs => write!(f, "invalid arguments"),
            Self::InvalidPeerId => write!(f, "invalid peer id"),
            Self::NoOtaAck => write!(f, "no over-the-air ack"),
            Self::FollowupTxQueueFull => write!(f, "follow-up transmit queue full"),
            Self::NotAllowed => write!(f, "not allowed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Request validation errors
// ---------------------------------------------------------------------------

/// A request or configuration value failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Master preference values 1 and 255 are reserved.
    ReservedMasterPreference(u8),
    /// Cluster range lower bound exceeds the upper bound.
    ClusterRangeInverted { low: u16, high: u16 },
    /// Discovery window interval outside `1..=5` for the given band index.
    DiscoveryWindowOutOfRange { band: usize, value: u8 },
    /// A bounded field exceeded its capacity.
    FieldTooLong(&'static str),
    /// A manager tunable is out of range.
    Tunable(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedMasterPreference(v) => write!(f, "master preference {v} is reserved"),
            Self::ClusterRangeInverted { low, high } => {
                write!(f, "cluster low {low:#06x} above cluster high {high:#06x}")
            }
            Self::DiscoveryWindowOutOfRange { band, value } => {
                write!(f, "discovery window interval {value} out of range for band {band}")
            }
            Self::FieldTooLong(field) => write!(f, "{field} too long"),
            Self::Tunable(msg) => write!(f, "invalid tunable: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias for validation paths.
pub type Result<T> = core::result::Result<T, ConfigError>;
