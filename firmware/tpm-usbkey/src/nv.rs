//! # Protected Storage Manager
//!
//! Owns the two NV indices and every read and write to them. The layout
//! (addresses, capacities, attribute bits) is an explicit [`NvLayout`]
//! value handed in at construction; the driver is borrowed per call.
//!
//! ## Record Layouts
//!
//! ```text
//! Serial Record   (128 bytes)
//! +--------------------------------------+------------------+
//! | ASCII serial                         | 0x00 padding     |
//! +--------------------------------------+------------------+
//!
//! Combined Record (65 bytes)
//! +------+---------------------+---------------------+
//! | flag | usb hash (1..=32)   | recovery hash       |
//! | [0]  |                     | (33..=64)           |
//! +------+---------------------+---------------------+
//! ```
//!
//! Capacity mismatches are [`Error::BadLayout`] and are never retried.

use log::{debug, error, info, warn};

use crate::codec::{self, NvPublic};
use crate::error::{Error, Result};
use crate::tpm::{Tpm, Transport};
use crate::{RcKind, Sha256Digest, DIGEST_SIZE};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Serial Record index
pub const SERIAL_NV_INDEX: u32 = 0x0151_0000;
/// Combined Record index
pub const COMBINED_NV_INDEX: u32 = 0x0151_0001;

/// Serial Record size in bytes
pub const SERIAL_RECORD_SIZE: usize = 128;
/// Combined Record size in bytes: flag + two digests
pub const COMBINED_RECORD_SIZE: usize = 1 + 2 * DIGEST_SIZE;

/// Value written to the Serial Record when a binding is cleared
pub const SERIAL_SENTINEL: &[u8] = b"0000000000";

/// Combined Record flag for a bound token
pub const FLAG_BOUND: u8 = 1;
/// Combined Record flag for an unbound platform
pub const FLAG_UNBOUND: u8 = 0;

// ============================================================================
// LAYOUT
// ============================================================================

/// One protected index: address, declared capacity and attribute bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvSlot {
    pub index: u32,
    pub capacity: u16,
    pub attributes: u32,
}

impl NvSlot {
    fn public(&self) -> NvPublic {
        NvPublic::new(self.index, self.capacity, self.attributes)
    }
}

/// Addresses and sizes of both records plus the authorizing hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvLayout {
    pub owner_handle: u32,
    pub serial: NvSlot,
    pub combined: NvSlot,
}

impl Default for NvLayout {
    fn default() -> Self {
        Self {
            owner_handle: codec::TPM2_RH_OWNER,
            serial: NvSlot {
                index: SERIAL_NV_INDEX,
                capacity: SERIAL_RECORD_SIZE as u16,
                attributes: codec::NV_OWNER_READ_WRITE,
            },
            combined: NvSlot {
                index: COMBINED_NV_INDEX,
                capacity: COMBINED_RECORD_SIZE as u16,
                attributes: codec::NV_OWNER_READ_WRITE,
            },
        }
    }
}

impl NvLayout {
    /// Reject layouts that could never hold the records
    pub fn validate(&self) -> Result<()> {
        if self.serial.index == self.combined.index {
            return Err(Error::InvalidInput("serial and combined indices must differ"));
        }
        for (slot, required) in [
            (&self.serial, SERIAL_RECORD_SIZE),
            (&self.combined, COMBINED_RECORD_SIZE),
        ] {
            if (slot.capacity as usize) < required {
                return Err(Error::BadLayout {
                    index: slot.index,
                    declared: slot.capacity as usize,
                    required,
                    limit: usize::from(u16::MAX),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// Serial Record: narrow ASCII serial, zero padded to 128 bytes
#[derive(Clone, PartialEq, Eq)]
pub struct SerialRecord {
    bytes: [u8; SERIAL_RECORD_SIZE],
}

impl SerialRecord {
    /// Build a record; the serial must be non-empty printable-or-space
    /// ASCII without NUL and shorter than the record
    pub fn new(serial: &[u8]) -> Result<Self> {
        if serial.is_empty() {
            return Err(Error::InvalidInput("serial is empty"));
        }
        if serial.len() >= SERIAL_RECORD_SIZE {
            return Err(Error::InvalidInput("serial does not fit the Serial Record"));
        }
        if serial.iter().any(|&b| b == 0 || !b.is_ascii()) {
            return Err(Error::InvalidInput("serial must be non-NUL ASCII"));
        }
        let mut bytes = [0u8; SERIAL_RECORD_SIZE];
        bytes[..serial.len()].copy_from_slice(serial);
        Ok(Self { bytes })
    }

    /// Record holding the cleared-binding sentinel
    pub fn sentinel() -> Self {
        let mut bytes = [0u8; SERIAL_RECORD_SIZE];
        bytes[..SERIAL_SENTINEL.len()].copy_from_slice(SERIAL_SENTINEL);
        Self { bytes }
    }

    /// Decode raw NV contents (first 128 bytes)
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let bytes: [u8; SERIAL_RECORD_SIZE] = raw
            .get(..SERIAL_RECORD_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::MalformedResponse("Serial Record shorter than 128 bytes"))?;
        Ok(Self { bytes })
    }

    /// Serial bytes up to the first NUL
    pub fn serial(&self) -> &[u8] {
        let end = self.bytes.iter().position(|&b| b == 0).unwrap_or(SERIAL_RECORD_SIZE);
        &self.bytes[..end]
    }

    /// Serial as text; non-UTF-8 contents are shown lossily
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.serial())
    }

    pub fn is_sentinel(&self) -> bool {
        self.serial() == SERIAL_SENTINEL
    }

    /// Full padded record
    pub fn as_bytes(&self) -> &[u8; SERIAL_RECORD_SIZE] {
        &self.bytes
    }
}

impl core::fmt::Debug for SerialRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SerialRecord({:?})", self.as_str())
    }
}

/// Combined Record: binding flag plus the device and recovery digests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombinedRecord {
    pub flag: u8,
    pub usb_hash: Sha256Digest,
    pub recovery_hash: Sha256Digest,
}

impl CombinedRecord {
    pub fn bound(usb_hash: Sha256Digest, recovery_hash: Sha256Digest) -> Self {
        Self {
            flag: FLAG_BOUND,
            usb_hash,
            recovery_hash,
        }
    }

    /// Unbound record with both digests zeroed
    pub fn cleared() -> Self {
        Self {
            flag: FLAG_UNBOUND,
            usb_hash: Sha256Digest::zero(),
            recovery_hash: Sha256Digest::zero(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.flag == FLAG_BOUND
    }

    pub fn encode(&self) -> [u8; COMBINED_RECORD_SIZE] {
        let mut out = [0u8; COMBINED_RECORD_SIZE];
        out[0] = self.flag;
        out[1..1 + DIGEST_SIZE].copy_from_slice(&self.usb_hash.bytes);
        out[1 + DIGEST_SIZE..].copy_from_slice(&self.recovery_hash.bytes);
        out
    }

    /// Decode raw NV contents; the flag is taken as stored
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < COMBINED_RECORD_SIZE {
            return Err(Error::MalformedResponse("Combined Record shorter than 65 bytes"));
        }
        let usb_hash = Sha256Digest::from_slice(&raw[1..1 + DIGEST_SIZE])
            .ok_or(Error::MalformedResponse("Combined Record usb hash"))?;
        let recovery_hash = Sha256Digest::from_slice(&raw[1 + DIGEST_SIZE..COMBINED_RECORD_SIZE])
            .ok_or(Error::MalformedResponse("Combined Record recovery hash"))?;
        Ok(Self {
            flag: raw[0],
            usb_hash,
            recovery_hash,
        })
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Typed access to the Serial and Combined records
#[derive(Debug, Clone)]
pub struct NvStore {
    layout: NvLayout,
}

impl NvStore {
    pub fn new(layout: NvLayout) -> Result<Self> {
        layout.validate()?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &NvLayout {
        &self.layout
    }

    /// Check the module answers, then make sure both indices exist
    pub fn provision<T: Transport>(&self, tpm: &mut Tpm<T>) -> Result<()> {
        tpm.test_connection().map_err(|e| {
            error!("TPM connection test failed: {}", e);
            e
        })?;
        self.ensure_serial_slot_defined(tpm)?;
        self.ensure_combined_slot_defined(tpm)?;
        info!("TPM storage initialization completed");
        Ok(())
    }

    pub fn ensure_serial_slot_defined<T: Transport>(&self, tpm: &mut Tpm<T>) -> Result<()> {
        self.ensure_defined(tpm, &self.layout.serial)
    }

    pub fn ensure_combined_slot_defined<T: Transport>(&self, tpm: &mut Tpm<T>) -> Result<()> {
        self.ensure_defined(tpm, &self.layout.combined)
    }

    /// Define an index; "already defined" counts as success
    fn ensure_defined<T: Transport>(&self, tpm: &mut Tpm<T>, slot: &NvSlot) -> Result<()> {
        match tpm.nv_define_space(self.layout.owner_handle, &slot.public()) {
            Ok(()) => {
                info!("defined NV index {:#010x} ({} bytes)", slot.index, slot.capacity);
                Ok(())
            }
            Err(Error::ModuleStatus(rc)) if rc.kind() == RcKind::NvDefined => {
                debug!("NV index {:#010x} already defined", slot.index);
                Ok(())
            }
            Err(Error::ModuleStatus(rc)) => {
                match rc.kind() {
                    RcKind::NvSpace => error!("insufficient space for NV index {:#010x}", slot.index),
                    RcKind::Attributes => {
                        error!("attributes {:#010x} not valid for NV index {:#010x}", slot.attributes, slot.index)
                    }
                    _ => error!("defining NV index {:#010x} failed: {}", slot.index, rc),
                }
                Err(Error::DefinitionFailed { index: slot.index, rc })
            }
            Err(e) => {
                error!("defining NV index {:#010x} failed: {}", slot.index, e);
                Err(e)
            }
        }
    }

    /// Whether an index is currently defined
    pub fn is_defined<T: Transport>(&self, tpm: &mut Tpm<T>, index: u32) -> Result<bool> {
        match tpm.nv_read_public(index) {
            Ok(_) => Ok(true),
            Err(Error::ModuleStatus(rc)) if rc.kind() == RcKind::Handle => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read the declared capacity and check it can carry `required` bytes
    /// in one transfer
    fn checked_capacity<T: Transport>(&self, tpm: &mut Tpm<T>, slot: &NvSlot, required: usize) -> Result<usize> {
        let public = tpm.nv_read_public(slot.index).map_err(|e| {
            error!("failed to read NV public for {:#010x}: {}", slot.index, e);
            e
        })?;
        let declared = public.data_size as usize;
        let limit = tpm.max_buffer();
        if declared == 0 || declared > limit || declared < required {
            error!(
                "NV index {:#010x} declares {} bytes, record needs {} (limit {})",
                slot.index, declared, required, limit
            );
            return Err(Error::BadLayout {
                index: slot.index,
                declared,
                required,
                limit,
            });
        }
        Ok(declared)
    }

    pub fn write_serial<T: Transport>(&self, tpm: &mut Tpm<T>, serial: &[u8]) -> Result<()> {
        let record = SerialRecord::new(serial)?;
        self.write_serial_record(tpm, &record)
    }

    pub fn write_serial_record<T: Transport>(&self, tpm: &mut Tpm<T>, record: &SerialRecord) -> Result<()> {
        let slot = self.layout.serial;
        self.checked_capacity(tpm, &slot, SERIAL_RECORD_SIZE)?;
        tpm.nv_write(self.layout.owner_handle, slot.index, record.as_bytes(), 0)
            .map_err(|e| {
                error!("failed to write serial to TPM: {}", e);
                e
            })?;
        debug!("stored serial {:?} at {:#010x}", record.as_str(), slot.index);
        Ok(())
    }

    pub fn read_serial<T: Transport>(&self, tpm: &mut Tpm<T>) -> Result<SerialRecord> {
        let slot = self.layout.serial;
        self.checked_capacity(tpm, &slot, SERIAL_RECORD_SIZE)?;
        let raw = tpm.nv_read(self.layout.owner_handle, slot.index, SERIAL_RECORD_SIZE as u16, 0)?;
        SerialRecord::from_bytes(&raw)
    }

    /// Persist the Combined Record; the flag must be 0 or 1
    pub fn write_combined<T: Transport>(
        &self,
        tpm: &mut Tpm<T>,
        flag: u8,
        usb_hash: &Sha256Digest,
        recovery_hash: &Sha256Digest,
    ) -> Result<()> {
        if flag > FLAG_BOUND {
            return Err(Error::InvalidInput("combined flag must be 0 or 1"));
        }
        let record = CombinedRecord {
            flag,
            usb_hash: *usb_hash,
            recovery_hash: *recovery_hash,
        };
        let slot = self.layout.combined;
        self.checked_capacity(tpm, &slot, COMBINED_RECORD_SIZE)?;
        tpm.nv_write(self.layout.owner_handle, slot.index, &record.encode(), 0)
            .map_err(|e| {
                error!("failed to write combined data to TPM: {}", e);
                e
            })?;
        debug!("stored combined record flag={} at {:#010x}", flag, slot.index);
        Ok(())
    }

    pub fn read_combined<T: Transport>(&self, tpm: &mut Tpm<T>) -> Result<CombinedRecord> {
        let slot = self.layout.combined;
        self.checked_capacity(tpm, &slot, COMBINED_RECORD_SIZE)?;
        let raw = tpm.nv_read(self.layout.owner_handle, slot.index, COMBINED_RECORD_SIZE as u16, 0)?;
        let record = CombinedRecord::decode(&raw)?;
        if record.flag > FLAG_BOUND {
            warn!("Combined Record carries unexpected flag {}", record.flag);
        }
        Ok(record)
    }

    /// Administrative removal of the Serial index
    pub fn undefine_serial_slot<T: Transport>(&self, tpm: &mut Tpm<T>) -> Result<()> {
        self.undefine(tpm, self.layout.serial.index)
    }

    /// Administrative removal of the Combined index
    pub fn undefine_combined_slot<T: Transport>(&self, tpm: &mut Tpm<T>) -> Result<()> {
        self.undefine(tpm, self.layout.combined.index)
    }

    fn undefine<T: Transport>(&self, tpm: &mut Tpm<T>, index: u32) -> Result<()> {
        tpm.nv_undefine_space(self.layout.owner_handle, index).map_err(|e| {
            error!("undefining NV index {:#010x} failed: {}", index, e);
            e
        })?;
        info!("undefined NV index {:#010x}", index);
        Ok(())
    }
}
