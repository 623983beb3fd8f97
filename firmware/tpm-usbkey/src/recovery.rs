//! Recovery Code Generator
//!
//! Codes are 10 module-random bytes shown as upper case hex in five dash
//! separated groups (`XXXX-XXXX-XXXX-XXXX-XXXX`). Only the digest of the
//! display string is persisted.

use log::debug;

use crate::error::{Error, Result};
use crate::identity;
use crate::tpm::{Tpm, Transport};
use crate::Sha256Digest;

/// Random bytes per code
pub const RECOVERY_RANDOM_BYTES: usize = 10;

/// Display length including separators
pub const RECOVERY_CODE_LEN: usize = RECOVERY_RANDOM_BYTES * 2 + RECOVERY_RANDOM_BYTES / 2 - 1;

/// A freshly generated recovery code
#[derive(Clone, PartialEq, Eq)]
pub struct RecoveryCode {
    display: String,
    raw: [u8; RECOVERY_RANDOM_BYTES],
}

impl RecoveryCode {
    pub fn from_raw(raw: [u8; RECOVERY_RANDOM_BYTES]) -> Self {
        Self {
            display: format_code(&raw),
            raw,
        }
    }

    /// Text shown to the operator
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn raw(&self) -> &[u8; RECOVERY_RANDOM_BYTES] {
        &self.raw
    }
}

// Never leak the secret through logs
impl core::fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("RecoveryCode(<redacted>)")
    }
}

/// Request random bytes from the module and format them
pub fn generate<T: Transport>(tpm: &mut Tpm<T>) -> Result<RecoveryCode> {
    let bytes = tpm.get_random(RECOVERY_RANDOM_BYTES)?;
    let raw: [u8; RECOVERY_RANDOM_BYTES] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::MalformedResponse("GetRandom returned the wrong length"))?;
    debug!("generated recovery code");
    Ok(RecoveryCode::from_raw(raw))
}

/// Upper case hex, dash after every two bytes except the last group
pub fn format_code(raw: &[u8; RECOVERY_RANDOM_BYTES]) -> String {
    let mut out = String::with_capacity(RECOVERY_CODE_LEN);
    for (i, byte) in raw.iter().enumerate() {
        out.push_str(&format!("{:02X}", byte));
        if i % 2 == 1 && i + 1 < raw.len() {
            out.push('-');
        }
    }
    out
}

/// Canonical form of an entered code: trimmed, upper case
pub fn normalize(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

/// Whether `code` has the exact display shape
pub fn is_well_formed(code: &str) -> bool {
    code.len() == RECOVERY_CODE_LEN
        && code.bytes().enumerate().all(|(i, b)| {
            if i % 5 == 4 {
                b == b'-'
            } else {
                b.is_ascii_hexdigit()
            }
        })
}

/// Digest of a code's normalized character bytes
pub fn hash_code<T: Transport>(tpm: &mut Tpm<T>, code: &str) -> Result<Sha256Digest> {
    let normalized = normalize(code);
    if normalized.is_empty() {
        return Err(Error::InvalidInput("recovery code is empty"));
    }
    identity::digest(tpm, normalized.as_bytes())
}
