//! # TPM 2.0 Backed USB Token Binding
//!
//! Binds a physical USB token to a platform using the TPM's protected NV
//! storage, authenticates the token on every boot, and unbinds it through a
//! one-time recovery code when the token is lost.
//!
//! ## Protected Storage Layout
//!
//! ```text
//! 0x01510000  Serial Record    128 bytes  ASCII serial, zero padded
//! 0x01510001  Combined Record   65 bytes  [flag][usb hash x32][recovery hash x32]
//! ```
//!
//! Both indices are defined with `OWNERWRITE | OWNERREAD` and are only ever
//! touched through [`nv::NvStore`].
//!
//! ## Boot Flow
//!
//! ```text
//!              read Combined Record
//!                      |
//!        flag != 1     |     flag == 1
//!      +---------------+---------------+
//!      v                               v
//!  Registering                   Authenticating --(3 mismatches)--> Locked
//!      |                          |        |                          |
//!      | warm reset          boot |        +--------(ESC)-------+     |
//!      v                          v                             v     v
//!    Bound                      Bound                      RecoveryPrompt
//!                                                   code ok -> clear + reset
//!                                                   3 fails -> shutdown
//! ```
//!
//! ## External Collaborators
//!
//! The crate owns the byte-level work and the state machine. The TPM byte
//! channel ([`tpm::Transport`]), USB enumeration ([`usb::UsbBus`]), console
//! ([`console::Console`]) and power control ([`platform::Platform`]) are
//! traits supplied by the caller. [`sim`] provides software stand-ins.

pub mod auth;
pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod identity;
pub mod nv;
pub mod platform;
pub mod recovery;
pub mod sim;
pub mod tpm;
pub mod usb;

// Re-exports
pub use auth::{AuthState, Authenticator, Outcome};
pub use config::Config;
pub use error::{Error, Result, TransportError};
pub use nv::{CombinedRecord, NvStore, SerialRecord};
pub use tpm::{Tpm, Transport};

// ============================================================================
// CORE TYPES
// ============================================================================

/// Size of a SHA-256 digest in bytes
pub const DIGEST_SIZE: usize = 32;

/// SHA-256 digest (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Sha256Digest {
    pub bytes: [u8; DIGEST_SIZE],
}

/// Fingerprint of a device identity tuple, produced by [`identity`]
pub type DeviceFingerprint = Sha256Digest;

impl Sha256Digest {
    /// Create a new digest from bytes
    pub const fn new(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self { bytes }
    }

    /// Zero digest (used for the cleared Combined Record)
    pub const fn zero() -> Self {
        Self {
            bytes: [0u8; DIGEST_SIZE],
        }
    }

    /// Check if this is the zero digest
    pub fn is_zero(&self) -> bool {
        self.bytes == [0u8; DIGEST_SIZE]
    }

    /// Build a digest from a slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; DIGEST_SIZE] = bytes.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Compare against another digest without early exit
    pub fn ct_eq(&self, other: &Sha256Digest) -> bool {
        constant_time_compare(self, other)
    }
}

impl core::fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sha256Digest(")?;
        for byte in &self.bytes[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "...")?;
        for byte in &self.bytes[28..] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl core::fmt::LowerHex for Sha256Digest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl core::fmt::UpperHex for Sha256Digest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Constant-time comparison of digests (timing attack resistant)
pub fn constant_time_compare(a: &Sha256Digest, b: &Sha256Digest) -> bool {
    let mut diff: u8 = 0;
    for i in 0..DIGEST_SIZE {
        diff |= a.bytes[i] ^ b.bytes[i];
    }
    diff == 0
}

// ============================================================================
// RESPONSE CODES
// ============================================================================

/// Format-1 response code flag
const RC_FMT1: u32 = 0x080;

/// Raw TPM 2.0 response code.
///
/// The raw value is kept for diagnostics; [`TpmRc::kind`] strips the
/// handle/parameter/session numbers of format-1 codes before classifying.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TpmRc(pub u32);

/// Classified response code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcKind {
    Success,
    Initialize,
    Failure,
    Sequence,
    NvRange,
    NvSize,
    NvLocked,
    NvAuthorization,
    NvUninitialized,
    /// Not enough NV memory for the new index
    NvSpace,
    /// Index already defined (benign during provisioning)
    NvDefined,
    /// Attributes not valid for the index type
    Attributes,
    Hash,
    Value,
    Handle,
    AuthFail,
    Size,
    Testing,
    Retry,
    NvUnavailable,
    Other,
}

impl TpmRc {
    pub const SUCCESS: TpmRc = TpmRc(0x000);
    pub const INITIALIZE: TpmRc = TpmRc(0x100);
    pub const FAILURE: TpmRc = TpmRc(0x101);
    pub const SEQUENCE: TpmRc = TpmRc(0x103);
    pub const NV_RANGE: TpmRc = TpmRc(0x146);
    pub const NV_SIZE: TpmRc = TpmRc(0x147);
    pub const NV_LOCKED: TpmRc = TpmRc(0x148);
    pub const NV_AUTHORIZATION: TpmRc = TpmRc(0x149);
    pub const NV_UNINITIALIZED: TpmRc = TpmRc(0x14A);
    pub const NV_SPACE: TpmRc = TpmRc(0x14B);
    pub const NV_DEFINED: TpmRc = TpmRc(0x14C);
    pub const ATTRIBUTES: TpmRc = TpmRc(0x082);
    pub const HASH: TpmRc = TpmRc(0x083);
    pub const VALUE: TpmRc = TpmRc(0x084);
    pub const HANDLE: TpmRc = TpmRc(0x08B);
    pub const AUTH_FAIL: TpmRc = TpmRc(0x08E);
    pub const SIZE: TpmRc = TpmRc(0x095);
    pub const TESTING: TpmRc = TpmRc(0x90A);
    pub const RETRY: TpmRc = TpmRc(0x922);
    pub const NV_UNAVAILABLE: TpmRc = TpmRc(0x923);

    /// Raw 32-bit code as returned by the module
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Strip format-1 handle/parameter/session numbers
    pub const fn base(self) -> u32 {
        if self.0 & RC_FMT1 != 0 {
            RC_FMT1 | (self.0 & 0x3F)
        } else {
            self.0 & 0xFFF
        }
    }

    pub fn kind(self) -> RcKind {
        match TpmRc(self.base()) {
            TpmRc::SUCCESS => RcKind::Success,
            TpmRc::INITIALIZE => RcKind::Initialize,
            TpmRc::FAILURE => RcKind::Failure,
            TpmRc::SEQUENCE => RcKind::Sequence,
            TpmRc::NV_RANGE => RcKind::NvRange,
            TpmRc::NV_SIZE => RcKind::NvSize,
            TpmRc::NV_LOCKED => RcKind::NvLocked,
            TpmRc::NV_AUTHORIZATION => RcKind::NvAuthorization,
            TpmRc::NV_UNINITIALIZED => RcKind::NvUninitialized,
            TpmRc::NV_SPACE => RcKind::NvSpace,
            TpmRc::NV_DEFINED => RcKind::NvDefined,
            TpmRc::ATTRIBUTES => RcKind::Attributes,
            TpmRc::HASH => RcKind::Hash,
            TpmRc::VALUE => RcKind::Value,
            TpmRc::HANDLE => RcKind::Handle,
            TpmRc::AUTH_FAIL => RcKind::AuthFail,
            TpmRc::SIZE => RcKind::Size,
            TpmRc::TESTING => RcKind::Testing,
            TpmRc::RETRY => RcKind::Retry,
            TpmRc::NV_UNAVAILABLE => RcKind::NvUnavailable,
            _ => RcKind::Other,
        }
    }

    /// Short human readable description
    pub fn description(self) -> &'static str {
        match self.kind() {
            RcKind::Success => "success",
            RcKind::Initialize => "TPM not initialized",
            RcKind::Failure => "TPM in failure mode",
            RcKind::Sequence => "improper use of a sequence handle",
            RcKind::NvRange => "NV offset plus size out of range",
            RcKind::NvSize => "requested NV allocation size too large",
            RcKind::NvLocked => "NV access locked",
            RcKind::NvAuthorization => "NV access authorization failed",
            RcKind::NvUninitialized => "NV index not yet written",
            RcKind::NvSpace => "insufficient NV space",
            RcKind::NvDefined => "NV index already defined",
            RcKind::Attributes => "attributes not valid for the index type",
            RcKind::Hash => "hash algorithm not supported",
            RcKind::Value => "value out of range",
            RcKind::Handle => "handle not correct for the use",
            RcKind::AuthFail => "authorization failure",
            RcKind::Size => "structure size is wrong",
            RcKind::Testing => "TPM is self testing",
            RcKind::Retry => "TPM busy, retry",
            RcKind::NvUnavailable => "NV temporarily unavailable",
            RcKind::Other => "unrecognized response code",
        }
    }
}

impl From<u32> for TpmRc {
    fn from(code: u32) -> Self {
        TpmRc(code)
    }
}

impl core::fmt::Debug for TpmRc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TpmRc({:#05x}, {:?})", self.0, self.kind())
    }
}

impl core::fmt::Display for TpmRc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#05x} ({})", self.0, self.description())
    }
}

// ============================================================================
// TESTS
// ============================================================================
