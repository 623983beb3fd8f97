//! Identity Hasher
//!
//! Device identities and recovery codes are digested on the module through
//! a hash sequence. Inputs are fed in chunks no larger than the driver's
//! transport ceiling, then the sequence is closed with an empty final chunk.
//!
//! Canonical identity encoding:
//!
//! ```text
//! vid (u16 LE) || pid (u16 LE) || serial (narrow ASCII, non-ASCII -> '?')
//! ```
//!
//! The same narrow serial bytes are what the Serial Record stores.

use log::debug;

use crate::codec::TPM2_ALG_SHA256;
use crate::error::{Error, Result};
use crate::tpm::{Tpm, Transport};
use crate::{DeviceFingerprint, Sha256Digest};

/// Serial substituted when a device exposes none
pub const NO_SERIAL: &str = "NoSerial";

/// USB token identity tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vid: u16,
    pub pid: u16,
    serial: String,
}

impl DeviceIdentity {
    /// Build an identity; the serial is narrowed to ASCII
    pub fn new(vid: u16, pid: u16, serial: &str) -> Self {
        Self {
            vid,
            pid,
            serial: narrow(serial),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Narrow serial bytes, as stored and hashed
    pub fn serial_bytes(&self) -> &[u8] {
        self.serial.as_bytes()
    }

    /// Bytes fed to the hash sequence
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.serial.len());
        out.extend_from_slice(&self.vid.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(self.serial.as_bytes());
        out
    }
}

impl core::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "VID:{:04X} PID:{:04X} Serial:{}", self.vid, self.pid, self.serial)
    }
}

/// Replace every non-ASCII character with '?'
pub fn narrow(text: &str) -> String {
    text.chars().map(|c| if c.is_ascii() { c } else { '?' }).collect()
}

/// Digest `data`, splitting at the driver's transport ceiling
pub fn digest<T: Transport>(tpm: &mut Tpm<T>, data: &[u8]) -> Result<Sha256Digest> {
    let chunk_size = tpm.max_buffer();
    digest_chunked(tpm, data, chunk_size)
}

/// Digest `data` in chunks of at most `chunk_size` bytes
pub fn digest_chunked<T: Transport>(tpm: &mut Tpm<T>, data: &[u8], chunk_size: usize) -> Result<Sha256Digest> {
    if chunk_size == 0 || chunk_size > tpm.max_buffer() {
        return Err(Error::InvalidInput("chunk size outside the transport limit"));
    }

    let mut sequence = tpm.hash_sequence_start(TPM2_ALG_SHA256)?;
    for chunk in data.chunks(chunk_size) {
        sequence.update(chunk)?;
    }
    let digest = sequence.complete(&[])?;
    debug!("digest of {} bytes: {:x}", data.len(), digest);
    Ok(digest)
}

/// Fingerprint of a device identity
pub fn fingerprint<T: Transport>(tpm: &mut Tpm<T>, identity: &DeviceIdentity) -> Result<DeviceFingerprint> {
    digest(tpm, &identity.canonical_bytes())
}

/// Fingerprint of a raw (vid, pid, serial) tuple
pub fn digest_device<T: Transport>(tpm: &mut Tpm<T>, vid: u16, pid: u16, serial: &str) -> Result<DeviceFingerprint> {
    fingerprint(tpm, &DeviceIdentity::new(vid, pid, serial))
}

/// Digest of a numeric code as its 8 little-endian bytes
pub fn digest_u64<T: Transport>(tpm: &mut Tpm<T>, code: u64) -> Result<Sha256Digest> {
    digest(tpm, &code.to_le_bytes())
}
