//! # Software Stand-ins
//!
//! [`SimulatedTpm`] implements the subset of TPM 2.0 this crate issues:
//! NV define/undefine/read/write/read-public, SHA-256 hash sequences,
//! flush, GetRandom and the manufacturer capability. NV contents live in a
//! serializable [`SimState`] so the host tool can persist them between
//! runs. Randomness is deterministic (SHA-256 of seed and counter).
//!
//! [`SimBus`], [`ScriptedConsole`] and [`SimPlatform`] stand in for the USB
//! host controller, the operator console and power control.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::time::Duration;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::{self, Reader, TPM2_ST_NO_SESSIONS};
use crate::console::{Console, Key};
use crate::error::{Error, Result, TransportError};
use crate::platform::Platform;
use crate::tpm::{Transport, DEFAULT_MAX_BUFFER};
use crate::usb::{DeviceDescriptor, UsbBus, UsbHandle, INVALID_ID};
use crate::{Sha256Digest, TpmRc};

/// Software SHA-256
pub fn compute_sha256(data: &[u8]) -> Sha256Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&result);
    Sha256Digest::new(bytes)
}

// ============================================================================
// SIMULATED TPM
// ============================================================================

/// "SIM " in the manufacturer property
pub const SIM_MANUFACTURER: u32 = 0x5349_4D20;

/// Largest NV index the simulator accepts
const MAX_NV_INDEX_SIZE: u16 = 2048;

/// Default NV pool
const DEFAULT_NV_LIMIT: usize = 8192;

/// Concurrent hash sequences
const MAX_SEQUENCES: usize = 3;

/// First transient handle
const TRANSIENT_FIRST: u32 = 0x8000_0000;

const RC_COMMAND_CODE: TpmRc = TpmRc(0x143);
const RC_OBJECT_MEMORY: TpmRc = TpmRc(0x902);
const RC_SIZE_P1: TpmRc = TpmRc(0x1D5);
const RC_ATTRIBUTES_P2: TpmRc = TpmRc(0x2C2);
const RC_HASH_P2: TpmRc = TpmRc(0x2C3);

/// TPM_RC_HANDLE against handle `n`
const fn rc_handle(n: u32) -> TpmRc {
    TpmRc(0x08B | (n << 8))
}

/// One defined NV index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvSpace {
    pub index: u32,
    pub attributes: u32,
    pub data_size: u16,
    pub written: bool,
    pub data: Vec<u8>,
}

/// Persistent part of the simulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimState {
    pub random_seed: u32,
    pub random_counter: u32,
    pub spaces: Vec<NvSpace>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            random_seed: 0x7470_6D32,
            random_counter: 0,
            spaces: Vec::new(),
        }
    }
}

impl SimState {
    pub fn space(&self, index: u32) -> Option<&NvSpace> {
        self.spaces.iter().find(|s| s.index == index)
    }

    fn space_mut(&mut self, index: u32) -> Option<&mut NvSpace> {
        self.spaces.iter_mut().find(|s| s.index == index)
    }

    fn used(&self) -> usize {
        self.spaces.iter().map(|s| s.data_size as usize).sum()
    }
}

type Handled = core::result::Result<(Vec<u32>, Vec<u8>), TpmRc>;

/// In-memory TPM 2.0 subset
pub struct SimulatedTpm {
    state: SimState,
    sequences: HashMap<u32, Sha256>,
    next_handle: u32,
    max_buffer: usize,
    nv_limit: usize,
    faults: VecDeque<(u32, TpmRc)>,
    connected: bool,
    log: Vec<u32>,
}

impl Default for SimulatedTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTpm {
    pub fn new() -> Self {
        Self::from_state(SimState::default())
    }

    pub fn from_state(state: SimState) -> Self {
        Self {
            state,
            sequences: HashMap::new(),
            next_handle: TRANSIENT_FIRST,
            max_buffer: DEFAULT_MAX_BUFFER,
            nv_limit: DEFAULT_NV_LIMIT,
            faults: VecDeque::new(),
            connected: true,
            log: Vec::new(),
        }
    }

    /// Per-command buffer ceiling enforced on writes and sequence updates
    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Total NV bytes available for new indices
    pub fn with_nv_limit(mut self, bytes: usize) -> Self {
        self.nv_limit = bytes;
        self
    }

    pub fn state(&self) -> &SimState {
        &self.state
    }

    pub fn into_state(self) -> SimState {
        self.state
    }

    /// Fail the next command with `code` by returning `rc`
    pub fn fail_next(&mut self, code: u32, rc: TpmRc) {
        self.faults.push_back((code, rc));
    }

    /// While disconnected every submit fails with `NotReady`
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Command codes received so far
    pub fn command_log(&self) -> &[u32] {
        &self.log
    }

    pub fn open_sequences(&self) -> usize {
        self.sequences.len()
    }

    /// Raw contents of a written index
    pub fn nv_contents(&self, index: u32) -> Option<&[u8]> {
        self.state
            .space(index)
            .filter(|s| s.written)
            .map(|s| s.data.as_slice())
    }

    fn execute(&mut self, bytes: &[u8]) -> Vec<u8> {
        let command = match codec::decode_command(bytes) {
            Ok(command) => command,
            Err(_) => return codec::encode_response(TPM2_ST_NO_SESSIONS, TpmRc(0x142), &[], &[]),
        };
        self.log.push(command.code);
        trace!("sim: command {:#06x}, {} byte body", command.code, command.body.len());

        if let Some(pos) = self.faults.iter().position(|(code, _)| *code == command.code) {
            if let Some((_, rc)) = self.faults.remove(pos) {
                debug!("sim: injected {} for {:#06x}", rc, command.code);
                return codec::encode_response(command.tag, rc, &[], &[]);
            }
        }

        let mut body = Reader::new(command.body);
        let handled = match command.code {
            codec::TPM2_CC_NV_DEFINE_SPACE => self.define_space(&mut body),
            codec::TPM2_CC_NV_UNDEFINE_SPACE => self.undefine_space(&mut body),
            codec::TPM2_CC_NV_READ_PUBLIC => self.read_public(&mut body),
            codec::TPM2_CC_NV_WRITE => self.nv_write(&mut body),
            codec::TPM2_CC_NV_READ => self.nv_read(&mut body),
            codec::TPM2_CC_HASH_SEQUENCE_START => self.sequence_start(&mut body),
            codec::TPM2_CC_SEQUENCE_UPDATE => self.sequence_update(&mut body),
            codec::TPM2_CC_SEQUENCE_COMPLETE => self.sequence_complete(&mut body),
            codec::TPM2_CC_FLUSH_CONTEXT => self.flush_context(&mut body),
            codec::TPM2_CC_GET_RANDOM => self.get_random(&mut body),
            codec::TPM2_CC_GET_CAPABILITY => self.get_capability(&mut body),
            _ => Err(RC_COMMAND_CODE),
        };

        match handled {
            Ok((handles, params)) => codec::encode_response(command.tag, TpmRc::SUCCESS, &handles, &params),
            Err(rc) => {
                debug!("sim: command {:#06x} failed with {}", command.code, rc);
                codec::encode_response(command.tag, rc, &[], &[])
            }
        }
    }

    fn check_password_session(body: &mut Reader<'_>) -> core::result::Result<(), TpmRc> {
        let session = body.read_auth_area().map_err(|_| TpmRc::SIZE)?;
        if session.handle != codec::TPM2_RS_PW {
            return Err(TpmRc::AUTH_FAIL);
        }
        Ok(())
    }

    fn check_nv_auth(space: &NvSpace, auth_handle: u32, write: bool) -> core::result::Result<(), TpmRc> {
        let (owner_bit, auth_bit) = if write {
            (codec::TPMA_NV_OWNERWRITE, codec::TPMA_NV_AUTHWRITE)
        } else {
            (codec::TPMA_NV_OWNERREAD, codec::TPMA_NV_AUTHREAD)
        };
        let allowed = (auth_handle == codec::TPM2_RH_OWNER && space.attributes & owner_bit != 0)
            || (auth_handle == space.index && space.attributes & auth_bit != 0);
        if allowed {
            Ok(())
        } else {
            Err(TpmRc::NV_AUTHORIZATION)
        }
    }

    fn define_space(&mut self, body: &mut Reader<'_>) -> Handled {
        let auth_handle = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        Self::check_password_session(body)?;
        let _auth = body.read_tpm2b().map_err(|_| TpmRc::SIZE)?;
        let public = body.read_nv_public().map_err(|_| TpmRc::SIZE)?;

        if auth_handle != codec::TPM2_RH_OWNER {
            return Err(rc_handle(1));
        }
        if public.index >> 24 != 0x01 {
            return Err(TpmRc::HANDLE);
        }
        let can_write = public.attributes & (codec::TPMA_NV_OWNERWRITE | codec::TPMA_NV_AUTHWRITE) != 0;
        let can_read = public.attributes & (codec::TPMA_NV_OWNERREAD | codec::TPMA_NV_AUTHREAD) != 0;
        if !can_write || !can_read {
            return Err(RC_ATTRIBUTES_P2);
        }
        if public.name_alg != codec::TPM2_ALG_SHA256 {
            return Err(RC_HASH_P2);
        }
        if public.data_size > MAX_NV_INDEX_SIZE {
            return Err(TpmRc::NV_SIZE);
        }
        if self.state.space(public.index).is_some() {
            return Err(TpmRc::NV_DEFINED);
        }
        if self.state.used() + public.data_size as usize > self.nv_limit {
            return Err(TpmRc::NV_SPACE);
        }

        self.state.spaces.push(NvSpace {
            index: public.index,
            attributes: public.attributes,
            data_size: public.data_size,
            written: false,
            data: vec![0u8; public.data_size as usize],
        });
        Ok((Vec::new(), Vec::new()))
    }

    fn undefine_space(&mut self, body: &mut Reader<'_>) -> Handled {
        let auth_handle = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        let index = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        Self::check_password_session(body)?;

        if auth_handle != codec::TPM2_RH_OWNER {
            return Err(rc_handle(1));
        }
        let before = self.state.spaces.len();
        self.state.spaces.retain(|s| s.index != index);
        if self.state.spaces.len() == before {
            return Err(rc_handle(2));
        }
        Ok((Vec::new(), Vec::new()))
    }

    fn read_public(&mut self, body: &mut Reader<'_>) -> Handled {
        let index = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        let space = self.state.space(index).ok_or(rc_handle(1))?;

        let mut attributes = space.attributes;
        if space.written {
            attributes |= codec::TPMA_NV_WRITTEN;
        }

        let mut public = Vec::with_capacity(14);
        public.extend_from_slice(&space.index.to_be_bytes());
        public.extend_from_slice(&codec::TPM2_ALG_SHA256.to_be_bytes());
        public.extend_from_slice(&attributes.to_be_bytes());
        public.extend_from_slice(&0u16.to_be_bytes());
        public.extend_from_slice(&space.data_size.to_be_bytes());

        // Name: nameAlg || H(public area)
        let mut name = codec::TPM2_ALG_SHA256.to_be_bytes().to_vec();
        name.extend_from_slice(&compute_sha256(&public).bytes);

        let mut params = Vec::with_capacity(public.len() + name.len() + 4);
        params.extend_from_slice(&(public.len() as u16).to_be_bytes());
        params.extend_from_slice(&public);
        params.extend_from_slice(&(name.len() as u16).to_be_bytes());
        params.extend_from_slice(&name);
        Ok((Vec::new(), params))
    }

    fn nv_write(&mut self, body: &mut Reader<'_>) -> Handled {
        let auth_handle = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        let index = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        Self::check_password_session(body)?;
        let data = body.read_tpm2b().map_err(|_| TpmRc::SIZE)?;
        let offset = body.read_u16().map_err(|_| TpmRc::SIZE)? as usize;

        if data.len() > self.max_buffer {
            return Err(RC_SIZE_P1);
        }
        let space = self.state.space_mut(index).ok_or(rc_handle(2))?;
        Self::check_nv_auth(space, auth_handle, true)?;
        if offset + data.len() > space.data_size as usize {
            return Err(TpmRc::NV_RANGE);
        }
        space.data[offset..offset + data.len()].copy_from_slice(data);
        space.written = true;
        Ok((Vec::new(), Vec::new()))
    }

    fn nv_read(&mut self, body: &mut Reader<'_>) -> Handled {
        let auth_handle = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        let index = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        Self::check_password_session(body)?;
        let size = body.read_u16().map_err(|_| TpmRc::SIZE)? as usize;
        let offset = body.read_u16().map_err(|_| TpmRc::SIZE)? as usize;

        let space = self.state.space(index).ok_or(rc_handle(2))?;
        Self::check_nv_auth(space, auth_handle, false)?;
        if !space.written {
            return Err(TpmRc::NV_UNINITIALIZED);
        }
        if size > self.max_buffer {
            return Err(RC_SIZE_P1);
        }
        if offset + size > space.data_size as usize {
            return Err(TpmRc::NV_RANGE);
        }

        let mut params = Vec::with_capacity(size + 2);
        params.extend_from_slice(&(size as u16).to_be_bytes());
        params.extend_from_slice(&space.data[offset..offset + size]);
        Ok((Vec::new(), params))
    }

    fn sequence_start(&mut self, body: &mut Reader<'_>) -> Handled {
        let _auth = body.read_tpm2b().map_err(|_| TpmRc::SIZE)?;
        let hash_alg = body.read_u16().map_err(|_| TpmRc::SIZE)?;
        if hash_alg != codec::TPM2_ALG_SHA256 {
            return Err(RC_HASH_P2);
        }
        if self.sequences.len() >= MAX_SEQUENCES {
            return Err(RC_OBJECT_MEMORY);
        }
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(TRANSIENT_FIRST);
        self.sequences.insert(handle, Sha256::new());
        Ok((vec![handle], Vec::new()))
    }

    fn sequence_update(&mut self, body: &mut Reader<'_>) -> Handled {
        let handle = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        Self::check_password_session(body)?;
        let chunk = body.read_tpm2b().map_err(|_| TpmRc::SIZE)?;
        if chunk.len() > self.max_buffer {
            return Err(RC_SIZE_P1);
        }
        let hasher = self.sequences.get_mut(&handle).ok_or(rc_handle(1))?;
        hasher.update(chunk);
        Ok((Vec::new(), Vec::new()))
    }

    fn sequence_complete(&mut self, body: &mut Reader<'_>) -> Handled {
        let handle = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        Self::check_password_session(body)?;
        let chunk = body.read_tpm2b().map_err(|_| TpmRc::SIZE)?;
        let hierarchy = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        if chunk.len() > self.max_buffer {
            return Err(RC_SIZE_P1);
        }
        let mut hasher = self.sequences.remove(&handle).ok_or(rc_handle(1))?;
        hasher.update(chunk);
        let digest = hasher.finalize();

        let mut params = Vec::with_capacity(2 + digest.len() + 8);
        params.extend_from_slice(&(digest.len() as u16).to_be_bytes());
        params.extend_from_slice(&digest);
        // TPMT_TK_HASHCHECK with an empty digest
        params.extend_from_slice(&codec::TPM2_ST_HASHCHECK.to_be_bytes());
        params.extend_from_slice(&hierarchy.to_be_bytes());
        params.extend_from_slice(&0u16.to_be_bytes());
        Ok((Vec::new(), params))
    }

    fn flush_context(&mut self, body: &mut Reader<'_>) -> Handled {
        let handle = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        self.sequences.remove(&handle).ok_or(TpmRc::HANDLE)?;
        Ok((Vec::new(), Vec::new()))
    }

    fn get_random(&mut self, body: &mut Reader<'_>) -> Handled {
        let requested = body.read_u16().map_err(|_| TpmRc::SIZE)? as usize;

        let mut block = Vec::with_capacity(8);
        block.extend_from_slice(&self.state.random_seed.to_le_bytes());
        block.extend_from_slice(&self.state.random_counter.to_le_bytes());
        self.state.random_counter = self.state.random_counter.wrapping_add(1);
        let random = compute_sha256(&block);

        let count = requested.min(random.bytes.len());
        let mut params = Vec::with_capacity(count + 2);
        params.extend_from_slice(&(count as u16).to_be_bytes());
        params.extend_from_slice(&random.bytes[..count]);
        Ok((Vec::new(), params))
    }

    fn get_capability(&mut self, body: &mut Reader<'_>) -> Handled {
        let capability = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        let property = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        let _count = body.read_u32().map_err(|_| TpmRc::SIZE)?;
        if capability != codec::TPM2_CAP_TPM_PROPERTIES {
            return Err(TpmRc::VALUE);
        }

        let mut params = Vec::with_capacity(17);
        params.push(0); // moreData
        params.extend_from_slice(&capability.to_be_bytes());
        if property <= codec::TPM2_PT_MANUFACTURER {
            params.extend_from_slice(&1u32.to_be_bytes());
            params.extend_from_slice(&codec::TPM2_PT_MANUFACTURER.to_be_bytes());
            params.extend_from_slice(&SIM_MANUFACTURER.to_be_bytes());
        } else {
            params.extend_from_slice(&0u32.to_be_bytes());
        }
        Ok((Vec::new(), params))
    }
}

impl Transport for SimulatedTpm {
    fn submit(&mut self, command: &[u8], response: &mut [u8]) -> core::result::Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotReady);
        }
        let out = self.execute(command);
        if out.len() > response.len() {
            return Err(TransportError::BufferTooSmall(out.len()));
        }
        response[..out.len()].copy_from_slice(&out);
        Ok(out.len())
    }
}

// ============================================================================
// USB BUS
// ============================================================================

/// One attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub vid: u16,
    pub pid: u16,
    pub serial: Option<String>,
    invalid_reads: u32,
}

impl SimDevice {
    pub fn new(vid: u16, pid: u16, serial: &str) -> Self {
        Self {
            vid,
            pid,
            serial: Some(serial.to_string()),
            invalid_reads: 0,
        }
    }

    /// Device without a serial string descriptor
    pub fn without_serial(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            serial: None,
            invalid_reads: 0,
        }
    }

    /// Report 0xFFFF VID/PID for the first `reads` descriptor reads
    pub fn with_initial_invalid_ids(mut self, reads: u32) -> Self {
        self.invalid_reads = reads;
        self
    }
}

/// `VID:PID[:SERIAL]` with hexadecimal VID and PID
impl FromStr for SimDevice {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut parts = text.splitn(3, ':');
        let vid = parts.next().and_then(|v| u16::from_str_radix(v, 16).ok());
        let pid = parts.next().and_then(|p| u16::from_str_radix(p, 16).ok());
        match (vid, pid, parts.next()) {
            (Some(vid), Some(pid), Some(serial)) => Ok(SimDevice::new(vid, pid, serial)),
            (Some(vid), Some(pid), None) => Ok(SimDevice::without_serial(vid, pid)),
            _ => Err(Error::InvalidInput("device must be VID:PID[:SERIAL] with hex VID and PID")),
        }
    }
}

/// Attached devices, optionally changing from one enumeration to the next
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    devices: Vec<SimDevice>,
    schedule: VecDeque<Vec<SimDevice>>,
}

impl SimBus {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        Self {
            devices,
            schedule: VecDeque::new(),
        }
    }

    /// Each enumeration takes the next device set; the last one stays attached
    pub fn scheduled(scans: Vec<Vec<SimDevice>>) -> Self {
        Self {
            devices: Vec::new(),
            schedule: scans.into(),
        }
    }

    pub fn set_devices(&mut self, devices: Vec<SimDevice>) {
        self.devices = devices;
    }

    fn device(&mut self, handle: UsbHandle) -> Result<&mut SimDevice> {
        self.devices
            .get_mut(handle.0)
            .ok_or(Error::InvalidInput("unknown USB handle"))
    }
}

impl UsbBus for SimBus {
    fn enumerate(&mut self) -> Result<Vec<UsbHandle>> {
        if let Some(next) = self.schedule.pop_front() {
            self.devices = next;
        }
        Ok((0..self.devices.len()).map(UsbHandle).collect())
    }

    fn device_descriptor(&mut self, handle: UsbHandle) -> Result<DeviceDescriptor> {
        let device = self.device(handle)?;
        if device.invalid_reads > 0 {
            device.invalid_reads -= 1;
            return Ok(DeviceDescriptor {
                vendor_id: INVALID_ID,
                product_id: INVALID_ID,
                serial_index: 0,
            });
        }
        Ok(DeviceDescriptor {
            vendor_id: device.vid,
            product_id: device.pid,
            serial_index: if device.serial.is_some() { 3 } else { 0 },
        })
    }

    fn string_descriptor(&mut self, handle: UsbHandle, index: u8, _lang_id: u16) -> Result<String> {
        let device = self.device(handle)?;
        match (&device.serial, index) {
            (Some(serial), 3) => Ok(serial.clone()),
            _ => Err(Error::InvalidInput("no such string descriptor")),
        }
    }
}

// ============================================================================
// CONSOLE
// ============================================================================

/// Console fed from a key script; output is captured
#[derive(Debug, Clone, Default)]
pub struct ScriptedConsole {
    keys: VecDeque<Key>,
    output: String,
    idle_polls: usize,
}

impl ScriptedConsole {
    pub fn new(keys: Vec<Key>) -> Self {
        Self {
            keys: keys.into(),
            output: String::new(),
            idle_polls: 0,
        }
    }

    /// Keys from literal text: `\n` Enter, `\x1b` Escape, `\x08` Backspace
    pub fn from_text(text: &str) -> Self {
        Self::new(text.chars().map(key_for_char).collect())
    }

    /// Keys from an escaped script: `\n` Enter, `\e` Escape, `\b`
    /// Backspace, `\\` backslash
    pub fn from_script(script: &str) -> Self {
        Self::new(parse_key_script(script))
    }

    /// Let `count` polls on an empty script report no key before failing
    pub fn with_idle_polls(mut self, count: usize) -> Self {
        self.idle_polls = count;
        self
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    fn exhausted() -> Error {
        Error::Console("input script exhausted".into())
    }
}

fn key_for_char(c: char) -> Key {
    match c {
        '\n' | '\r' => Key::Enter,
        '\x1b' => Key::Escape,
        '\x08' => Key::Backspace,
        c => Key::Char(c),
    }
}

/// Decode an escaped key script
pub fn parse_key_script(script: &str) -> Vec<Key> {
    let mut keys = Vec::with_capacity(script.len());
    let mut chars = script.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            keys.push(key_for_char(c));
            continue;
        }
        match chars.next() {
            Some('n') => keys.push(Key::Enter),
            Some('e') => keys.push(Key::Escape),
            Some('b') => keys.push(Key::Backspace),
            Some(other) => keys.push(Key::Char(other)),
            None => keys.push(Key::Char('\\')),
        }
    }
    keys
}

impl Console for ScriptedConsole {
    fn print(&mut self, text: &str) -> Result<()> {
        self.output.push_str(text);
        Ok(())
    }

    fn wait_key(&mut self) -> Result<Key> {
        self.keys.pop_front().ok_or_else(Self::exhausted)
    }

    fn poll_key(&mut self) -> Result<Option<Key>> {
        if let Some(key) = self.keys.pop_front() {
            return Ok(Some(key));
        }
        if self.idle_polls > 0 {
            self.idle_polls -= 1;
            return Ok(None);
        }
        Err(Self::exhausted())
    }
}

// ============================================================================
// PLATFORM
// ============================================================================

/// Records delays and power actions instead of performing them
#[derive(Debug, Clone, Default)]
pub struct SimPlatform {
    stalls: Vec<Duration>,
    resets: u32,
    shutdowns: u32,
}

impl SimPlatform {
    pub fn stalls(&self) -> &[Duration] {
        &self.stalls
    }

    pub fn total_stalled(&self) -> Duration {
        self.stalls.iter().sum()
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn shutdowns(&self) -> u32 {
        self.shutdowns
    }
}

impl Platform for SimPlatform {
    fn stall(&mut self, duration: Duration) {
        self.stalls.push(duration);
    }

    fn warm_reset(&mut self) {
        self.resets += 1;
    }

    fn shutdown(&mut self) {
        self.shutdowns += 1;
    }
}
