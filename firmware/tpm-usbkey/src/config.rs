//! Runtime configuration.
//!
//! Loaded from TOML. Every field has a default equal to the firmware
//! constants, so an empty file is a valid configuration.
//!
//! ```toml
//! [nv]
//! serial_index = 0x01510000
//! combined_index = 0x01510001
//!
//! [policy]
//! max_recovery_attempts = 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{self, MAX_RESPONSE_SIZE};
use crate::error::{Error, Result};
use crate::nv::{self, NvLayout, NvSlot, COMBINED_RECORD_SIZE, SERIAL_RECORD_SIZE};
use crate::tpm::DEFAULT_MAX_BUFFER;

/// Top level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub nv: NvConfig,
    pub transport: TransportConfig,
    pub policy: Policy,
}

/// Protected index addresses and sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvConfig {
    /// Authorizing hierarchy for define, write and read
    pub owner_handle: u32,
    /// TPMA_NV bits for both indices
    pub attributes: u32,
    pub serial_index: u32,
    pub serial_capacity: u16,
    pub combined_index: u32,
    pub combined_capacity: u16,
}

impl Default for NvConfig {
    fn default() -> Self {
        Self {
            owner_handle: codec::TPM2_RH_OWNER,
            attributes: codec::NV_OWNER_READ_WRITE,
            serial_index: nv::SERIAL_NV_INDEX,
            serial_capacity: SERIAL_RECORD_SIZE as u16,
            combined_index: nv::COMBINED_NV_INDEX,
            combined_capacity: COMBINED_RECORD_SIZE as u16,
        }
    }
}

/// Transport buffer limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest single NV transfer or sequence update
    pub max_buffer: usize,
    /// Response buffer handed to the transport
    pub response_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
            response_capacity: MAX_RESPONSE_SIZE,
        }
    }
}

/// Retry limits and delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub max_hash_mismatches: u32,
    pub max_recovery_attempts: u32,
    /// Registration tries before giving up, 0 retries forever
    pub registration_attempts: u32,
    pub scan_interval_ms: u64,
    pub registration_retry_ms: u64,
    pub descriptor_retry_ms: u64,
    pub mismatch_delay_ms: u64,
    pub shutdown_delay_ms: u64,
    pub reset_delay_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_hash_mismatches: 3,
            max_recovery_attempts: 3,
            registration_attempts: 0,
            scan_interval_ms: 2000,
            registration_retry_ms: 3000,
            descriptor_retry_ms: 1000,
            mismatch_delay_ms: 1000,
            shutdown_delay_ms: 2000,
            reset_delay_ms: 1000,
        }
    }
}

impl Policy {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn registration_retry(&self) -> Duration {
        Duration::from_millis(self.registration_retry_ms)
    }

    pub fn descriptor_retry(&self) -> Duration {
        Duration::from_millis(self.descriptor_retry_ms)
    }

    pub fn mismatch_delay(&self) -> Duration {
        Duration::from_millis(self.mismatch_delay_ms)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }
}

impl Config {
    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.layout().validate().map_err(|e| Error::Config(e.to_string()))?;

        if self.transport.max_buffer == 0 {
            return Err(Error::Config("transport.max_buffer must be non-zero".into()));
        }
        if self.transport.response_capacity < codec::HEADER_SIZE {
            return Err(Error::Config("transport.response_capacity is smaller than a response header".into()));
        }
        if self.policy.max_hash_mismatches == 0 || self.policy.max_recovery_attempts == 0 {
            return Err(Error::Config("attempt limits must be at least 1".into()));
        }
        Ok(())
    }

    /// Storage layout described by the `[nv]` section
    pub fn layout(&self) -> NvLayout {
        NvLayout {
            owner_handle: self.nv.owner_handle,
            serial: NvSlot {
                index: self.nv.serial_index,
                capacity: self.nv.serial_capacity,
                attributes: self.nv.attributes,
            },
            combined: NvSlot {
                index: self.nv.combined_index,
                capacity: self.nv.combined_capacity,
                attributes: self.nv.attributes,
            },
        }
    }
}
