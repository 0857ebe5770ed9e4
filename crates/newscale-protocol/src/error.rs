//! Codec error taxonomy.

use crate::command::StageCmd;
use thiserror::Error;

/// Errors produced while encoding commands or decoding reply frames.
///
/// `Malformed` means the frame failed structural validation before any
/// field was interpreted; a truncated frame never yields a partial value.
/// `IllegalCommand` / `IllegalCommandFormat` are device-reported
/// rejections (opcodes `24` / `23`), distinct from structural faults.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("malformed frame ({reason}): {raw:?}")]
    Malformed { raw: String, reason: &'static str },

    #[error("device rejected the prior command: cannot be issued in this state")]
    IllegalCommand,

    #[error("device rejected the prior command: incorrect format")]
    IllegalCommandFormat,

    #[error("reply opcode {got} does not match issued command {expected}")]
    UnexpectedReply { expected: StageCmd, got: StageCmd },

    #[error("{field} out of range: {value}")]
    ValueOutOfRange { field: &'static str, value: f64 },
}

impl ProtocolError {
    pub(crate) fn malformed(raw: &str, reason: &'static str) -> Self {
        Self::Malformed {
            raw: raw.to_string(),
            reason,
        }
    }
}
