/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Error types for TPM operations

use std::error::Error;
use std::fmt;

use crate::resource_manager::SlotKind;
use crate::tpm_types::{TPM_CC, TPM_RC};

/// Malformed or unexpectedly shaped TPM data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before a field or a declared length could be read
    BufferUnderflow { needed: usize, remaining: usize },

    /// A list count exceeds what the buffer (or the structure) can hold
    InvalidArraySize(usize),

    /// Unknown selector of a tagged union
    InvalidUnion(u32),

    /// Incorrect tag value
    IncorrectTag { expected: u16, actual: u16 },

    /// A size field disagrees with the number of bytes actually present
    SizeMismatch { declared: usize, actual: usize },

    /// Bytes left over after a complete structure was read
    TrailingData(usize),

    /// A fixed-size digest uses an algorithm whose size is unknown
    UnsupportedAlgorithm(u16),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BufferUnderflow { needed, remaining } => write!(
                f,
                "buffer underflow: needed {} bytes, {} remaining",
                needed, remaining
            ),
            Self::InvalidArraySize(count) => write!(f, "invalid array size {}", count),
            Self::InvalidUnion(selector) => write!(f, "unknown union selector 0x{:X}", selector),
            Self::IncorrectTag { expected, actual } => write!(
                f,
                "incorrect tag: expected 0x{:X}, got 0x{:X}",
                expected, actual
            ),
            Self::SizeMismatch { declared, actual } => write!(
                f,
                "declared size {} does not match actual size {}",
                declared, actual
            ),
            Self::TrailingData(count) => write!(f, "{} unexpected trailing bytes", count),
            Self::UnsupportedAlgorithm(alg) => {
                write!(f, "digest size unknown for algorithm 0x{:04X}", alg)
            }
        }
    }
}

/// TPM Error types
#[derive(Debug)]
pub enum TpmError {
    /// Connection level failure reported by the transport
    Transport(String),

    /// I/O error
    IoError(std::io::Error),

    /// The device has not been connected
    NotConnected,

    /// Malformed or unexpected-shape response (protocol version mismatch or corruption)
    Decode(DecodeError),

    /// The TPM returned a non-success response code
    CommandFailed { command: TPM_CC, response_code: TPM_RC },

    /// The response HMAC of an authorization session did not verify
    AuthValidation { command: TPM_CC, session: u32 },

    /// A session that was used without `continueSession` was presented again
    ExpiredSession(u32),

    /// The saved context of a logical handle could not be restored
    ContextLost(u32),

    /// A single command pins more handles than there are physical slots
    Capacity { kind: SlotKind, pinned: usize, slots: usize },

    /// A logical handle that was flushed or never created
    InvalidHandle(u32),

    /// Invalid argument supplied by the caller
    InvalidParameter(String),

    /// Operation not supported by this device or algorithm
    NotSupported(String),
}

impl TpmError {
    /// Response code carried by a command error
    pub fn response_code(&self) -> Option<TPM_RC> {
        match self {
            Self::CommandFailed { response_code, .. } => Some(*response_code),
            _ => None,
        }
    }

    /// True for failures of the connection rather than of the protocol
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::IoError(_) | Self::NotConnected)
    }
}

impl fmt::Display for TpmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {}", msg),
            Self::IoError(err) => write!(f, "I/O error: {}", err),
            Self::NotConnected => write!(f, "TPM device is not connected"),
            Self::Decode(err) => write!(f, "Protocol decode error: {}", err),
            Self::CommandFailed {
                command,
                response_code,
            } => write!(f, "{} failed: {}", command, response_code),
            Self::AuthValidation { command, session } => write!(
                f,
                "Response HMAC of session 0x{:08X} for {} does not verify",
                session, command
            ),
            Self::ExpiredSession(handle) => {
                write!(f, "Session 0x{:08X} was not continued and is no longer usable", handle)
            }
            Self::ContextLost(handle) => {
                write!(f, "Saved context of handle 0x{:08X} is lost", handle)
            }
            Self::Capacity {
                kind,
                pinned,
                slots,
            } => write!(
                f,
                "Command pins {} {:?} handles but only {} slots exist",
                pinned, kind, slots
            ),
            Self::InvalidHandle(handle) => write!(f, "Unknown handle 0x{:08X}", handle),
            Self::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Self::NotSupported(msg) => write!(f, "Not supported: {}", msg),
        }
    }
}

impl Error for TpmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TpmError {
    fn from(error: std::io::Error) -> Self {
        TpmError::IoError(error)
    }
}

impl From<DecodeError> for TpmError {
    fn from(error: DecodeError) -> Self {
        TpmError::Decode(error)
    }
}
