//! Error taxonomy shared by every layer of the crate.
//!
//! Storage and codec errors bubble up unmodified; only the state machine in
//! [`crate::auth`] decides whether to retry, fall back to recovery, or stop.

use thiserror::Error;

use crate::TpmRc;

/// Errors produced by a [`crate::tpm::Transport`] implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Module not responding
    #[error("security module not ready")]
    NotReady,
    /// Command did not complete in time
    #[error("security module timed out")]
    Timeout,
    /// Response larger than the buffer supplied by the caller
    #[error("response of {0} bytes does not fit the response buffer")]
    BufferTooSmall(usize),
    /// Any other channel failure
    #[error("transport I/O failure: {0}")]
    Io(String),
}

/// Crate error type
#[derive(Debug, Error)]
pub enum Error {
    /// Module unreachable
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Well-formed transport exchange but the bytes do not parse
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),

    /// Well-formed non-success response
    #[error("TPM returned {0}")]
    ModuleStatus(TpmRc),

    /// NV index could not be defined (anything but success/already defined)
    #[error("failed to define NV index {index:#010x}: {rc}")]
    DefinitionFailed { index: u32, rc: TpmRc },

    /// Declared NV capacity inconsistent with the record layout
    #[error("NV index {index:#010x} layout mismatch: declared {declared} bytes, record needs {required} (transport limit {limit})")]
    BadLayout {
        index: u32,
        declared: usize,
        required: usize,
        limit: usize,
    },

    /// Argument rejected before any module call
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// Re-read after registration did not return what was written
    #[error("verification of stored {0} failed")]
    VerifyFailed(&'static str),

    /// Recovery attempts exhausted
    #[error("security violation: recovery attempts exhausted")]
    SecurityViolation,

    /// No USB devices enumerated
    #[error("no USB devices found")]
    DeviceNotFound,

    /// Operator console failure
    #[error("console error: {0}")]
    Console(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Raw module response code, if the error carries one
    pub fn response_code(&self) -> Option<TpmRc> {
        match self {
            Error::ModuleStatus(rc) | Error::DefinitionFailed { rc, .. } => Some(*rc),
            _ => None,
        }
    }

    /// Whether the error came from the byte channel rather than the module
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::MalformedResponse(_))
    }
}

/// Result type for this crate
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_extraction() {
        let err = Error::DefinitionFailed {
            index: 0x0151_0000,
            rc: TpmRc::NV_SPACE,
        };
        assert_eq!(err.response_code(), Some(TpmRc::NV_SPACE));
        assert_eq!(Error::DeviceNotFound.response_code(), None);
    }

    #[test]
    fn test_transport_classification() {
        let err: Error = TransportError::Timeout.into();
        assert!(err.is_transport());
        assert!(Error::MalformedResponse("short header").is_transport());
        assert!(!Error::ModuleStatus(TpmRc::FAILURE).is_transport());
    }

    #[test]
    fn test_messages_carry_index() {
        let err = Error::BadLayout {
            index: 0x0151_0001,
            declared: 32,
            required: 65,
            limit: 1024,
        };
        let text = err.to_string();
        assert!(text.contains("0x01510001"));
        assert!(text.contains("65"));
    }
}
