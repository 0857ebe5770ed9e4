//! Driver error taxonomy.

use crate::interface::Address;
use newscale_protocol::{ProtocolError, StatusWord};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by transports and single-axis operations.
///
/// `Connection` is fatal to the transport. `Timeout` is retryable by the
/// caller (the driver itself only retries idempotent queries, never
/// motion commands). `Protocol` frames are never re-sent automatically:
/// resending an ambiguous command to hardware mid-motion is unsafe.
/// `CommandFailed` carries the last known status word for diagnosis.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("transport connection failure: {0}")]
    Connection(String),

    #[error("no reply within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("wrong stage answered: expected {expected}, got {got}")]
    WrongAddress { expected: Address, got: Address },

    #[error("command failed; last known status: {status:?}")]
    CommandFailed {
        status: Option<StatusWord>,
        #[source]
        source: Option<Box<StageError>>,
    },
}

/// Errors from the multi-stage coordinator boundary. Per-axis motion
/// failures are not errors at this level; they are reported in the
/// group outcome so one bad axis never hides the others' results.
#[derive(Debug, Clone, Error)]
pub enum GroupError {
    #[error("unknown axis {0:?}")]
    UnknownAxis(String),

    #[error("duplicate axis name {0:?}")]
    DuplicateName(String),

    #[error("axes {first:?} and {second:?} share address {address} on one link")]
    DuplicateAddress {
        first: String,
        second: String,
        address: Address,
    },

    #[error("group move mixes absolute and relative targets")]
    MixedMoveKinds,

    #[error("group contains no axes")]
    EmptyGroup,
}

impl StageError {
    pub(crate) fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    /// Whether this error, or the failure it wraps, was a reply timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::CommandFailed {
                source: Some(inner),
                ..
            } => inner.is_timeout(),
            _ => false,
        }
    }

    /// The device status attached to a failed command, if any.
    pub fn status(&self) -> Option<StatusWord> {
        match self {
            Self::CommandFailed { status, .. } => *status,
            _ => None,
        }
    }
}
