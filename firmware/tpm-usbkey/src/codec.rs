//! # TPM 2.0 Wire Codec
//!
//! Pure encode/decode functions for the commands this crate issues. No I/O.
//!
//! ## Command Framing
//!
//! ```text
//! +-------+-----------+-------------+---------+------------+------------+
//! | tag:2 | size:4    | command:4   | handles | authSize:4 | params ... |
//! +-------+-----------+-------------+---------+------------+------------+
//!           ^ patched                           ^ patched
//! ```
//!
//! Every size field is a forward reference. [`CommandBuilder`] reserves the
//! field, remembers its offset as a [`SizeField`], and patches it once the
//! covered bytes are known. All integers are big-endian.

use crate::error::{Error, Result};
use crate::{Sha256Digest, TpmRc, DIGEST_SIZE};

// ============================================================================
// TPM 2.0 CONSTANTS
// ============================================================================

// Structure tags
pub const TPM2_ST_NO_SESSIONS: u16 = 0x8001;
pub const TPM2_ST_SESSIONS: u16 = 0x8002;
pub const TPM2_ST_HASHCHECK: u16 = 0x8024;

// Command codes
pub const TPM2_CC_NV_UNDEFINE_SPACE: u32 = 0x0000_0122;
pub const TPM2_CC_NV_DEFINE_SPACE: u32 = 0x0000_012A;
pub const TPM2_CC_NV_WRITE: u32 = 0x0000_0137;
pub const TPM2_CC_SEQUENCE_COMPLETE: u32 = 0x0000_013E;
pub const TPM2_CC_NV_READ: u32 = 0x0000_014E;
pub const TPM2_CC_SEQUENCE_UPDATE: u32 = 0x0000_015C;
pub const TPM2_CC_FLUSH_CONTEXT: u32 = 0x0000_0165;
pub const TPM2_CC_NV_READ_PUBLIC: u32 = 0x0000_0169;
pub const TPM2_CC_GET_CAPABILITY: u32 = 0x0000_017A;
pub const TPM2_CC_GET_RANDOM: u32 = 0x0000_017B;
pub const TPM2_CC_HASH_SEQUENCE_START: u32 = 0x0000_0186;

// Algorithm IDs
pub const TPM2_ALG_SHA256: u16 = 0x000B;
pub const TPM2_ALG_NULL: u16 = 0x0010;

// Permanent handles
pub const TPM2_RH_OWNER: u32 = 0x4000_0001;
pub const TPM2_RH_NULL: u32 = 0x4000_0007;
pub const TPM2_RS_PW: u32 = 0x4000_0009;

// NV index attributes
pub const TPMA_NV_OWNERWRITE: u32 = 1 << 1;
pub const TPMA_NV_AUTHWRITE: u32 = 1 << 2;
pub const TPMA_NV_OWNERREAD: u32 = 1 << 17;
pub const TPMA_NV_AUTHREAD: u32 = 1 << 18;
pub const TPMA_NV_WRITTEN: u32 = 1 << 29;

/// Owner may read and write, no one else
pub const NV_OWNER_READ_WRITE: u32 = TPMA_NV_OWNERWRITE | TPMA_NV_OWNERREAD;

// Capabilities
pub const TPM2_CAP_TPM_PROPERTIES: u32 = 0x0000_0006;
pub const TPM2_PT_MANUFACTURER: u32 = 0x0000_0105;

/// Command and response header size (tag + size + code)
pub const HEADER_SIZE: usize = 10;

/// Largest response the driver accepts
pub const MAX_RESPONSE_SIZE: usize = 4096;

// ============================================================================
// AUTHORIZATION SESSION
// ============================================================================

/// Session attribute bits (TPMA_SESSION)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionAttributes(pub u8);

impl SessionAttributes {
    pub const CONTINUE_SESSION: u8 = 0x01;
    pub const AUDIT_EXCLUSIVE: u8 = 0x02;
    pub const AUDIT_RESET: u8 = 0x04;
    pub const DECRYPT: u8 = 0x20;
    pub const ENCRYPT: u8 = 0x40;
    pub const AUDIT: u8 = 0x80;

    pub const fn none() -> Self {
        Self(0)
    }
}

/// Per-command authorization descriptor (TPMS_AUTH_COMMAND).
///
/// Built fresh for every command; nothing is carried between commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: SessionAttributes,
    pub hmac: Vec<u8>,
}

impl AuthSession {
    /// Password session with empty nonce, no attributes and empty hmac
    pub fn password() -> Self {
        Self {
            handle: TPM2_RS_PW,
            nonce: Vec::new(),
            attributes: SessionAttributes::none(),
            hmac: Vec::new(),
        }
    }
}

// ============================================================================
// NV PUBLIC AREA
// ============================================================================

/// TPMS_NV_PUBLIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPublic {
    pub index: u32,
    pub name_alg: u16,
    pub attributes: u32,
    pub auth_policy: Vec<u8>,
    pub data_size: u16,
}

impl NvPublic {
    /// Public area with SHA-256 name algorithm and no policy
    pub fn new(index: u32, data_size: u16, attributes: u32) -> Self {
        Self {
            index,
            name_alg: TPM2_ALG_SHA256,
            attributes,
            auth_policy: Vec::new(),
            data_size,
        }
    }
}

// ============================================================================
// COMMAND BUILDER
// ============================================================================

/// Offset of a reserved size field awaiting its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeField {
    offset: usize,
    width: usize,
}

/// Growable command buffer with back-patched size fields
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    buf: Vec<u8>,
}

impl CommandBuilder {
    /// Start a command; the header size is patched by [`CommandBuilder::finish`]
    pub fn new(tag: u16, command_code: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&tag.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&command_code.to_be_bytes());
        Self { buf }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Size-prefixed buffer (TPM2B)
    pub fn put_tpm2b(&mut self, data: &[u8]) -> Result<&mut Self> {
        let size = u16::try_from(data.len())
            .map_err(|_| Error::InvalidInput("TPM2B buffer exceeds 65535 bytes"))?;
        self.put_u16(size);
        self.put_bytes(data);
        Ok(self)
    }

    /// Reserve a 16-bit size field covering everything written after it
    pub fn reserve_u16(&mut self) -> SizeField {
        let field = SizeField {
            offset: self.buf.len(),
            width: 2,
        };
        self.buf.extend_from_slice(&[0u8; 2]);
        field
    }

    /// Reserve a 32-bit size field covering everything written after it
    pub fn reserve_u32(&mut self) -> SizeField {
        let field = SizeField {
            offset: self.buf.len(),
            width: 4,
        };
        self.buf.extend_from_slice(&[0u8; 4]);
        field
    }

    /// Patch a reserved field with the number of bytes written since it
    pub fn patch(&mut self, field: SizeField) -> Result<()> {
        let covered = self.buf.len() - (field.offset + field.width);
        match field.width {
            2 => {
                let size = u16::try_from(covered)
                    .map_err(|_| Error::InvalidInput("structure exceeds 16-bit size field"))?;
                self.buf[field.offset..field.offset + 2].copy_from_slice(&size.to_be_bytes());
            }
            _ => {
                let size = u32::try_from(covered)
                    .map_err(|_| Error::InvalidInput("structure exceeds 32-bit size field"))?;
                self.buf[field.offset..field.offset + 4].copy_from_slice(&size.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Authorization area: size-prefixed TPMS_AUTH_COMMAND
    pub fn put_auth_area(&mut self, session: &AuthSession) -> Result<()> {
        let auth_size = self.reserve_u32();
        self.put_u32(session.handle);
        self.put_tpm2b(&session.nonce)?;
        self.put_u8(session.attributes.0);
        self.put_tpm2b(&session.hmac)?;
        self.patch(auth_size)
    }

    /// Patch the header size and hand out the finished command
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let size = u32::try_from(self.buf.len())
            .map_err(|_| Error::InvalidInput("command exceeds 32-bit size"))?;
        self.buf[2..6].copy_from_slice(&size.to_be_bytes());
        Ok(self.buf)
    }
}

// ============================================================================
// COMMAND ENCODERS
// ============================================================================

/// TPM2_NV_DefineSpace with an empty index auth value
pub fn encode_define_space(
    auth_handle: u32,
    public: &NvPublic,
    session: &AuthSession,
) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_SESSIONS, TPM2_CC_NV_DEFINE_SPACE);
    cmd.put_u32(auth_handle);
    cmd.put_auth_area(session)?;

    // TPM2B_AUTH for the new index
    cmd.put_tpm2b(&[])?;

    // TPM2B_NV_PUBLIC
    let public_size = cmd.reserve_u16();
    cmd.put_u32(public.index)
        .put_u16(public.name_alg)
        .put_u32(public.attributes);
    cmd.put_tpm2b(&public.auth_policy)?;
    cmd.put_u16(public.data_size);
    cmd.patch(public_size)?;

    cmd.finish()
}

/// TPM2_NV_UndefineSpace
pub fn encode_undefine_space(auth_handle: u32, index: u32, session: &AuthSession) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_SESSIONS, TPM2_CC_NV_UNDEFINE_SPACE);
    cmd.put_u32(auth_handle).put_u32(index);
    cmd.put_auth_area(session)?;
    cmd.finish()
}

/// TPM2_NV_Write
pub fn encode_nv_write(
    auth_handle: u32,
    index: u32,
    session: &AuthSession,
    data: &[u8],
    offset: u16,
) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_SESSIONS, TPM2_CC_NV_WRITE);
    cmd.put_u32(auth_handle).put_u32(index);
    cmd.put_auth_area(session)?;
    cmd.put_tpm2b(data)?;
    cmd.put_u16(offset);
    cmd.finish()
}

/// TPM2_NV_Read
pub fn encode_nv_read(
    auth_handle: u32,
    index: u32,
    session: &AuthSession,
    size: u16,
    offset: u16,
) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_SESSIONS, TPM2_CC_NV_READ);
    cmd.put_u32(auth_handle).put_u32(index);
    cmd.put_auth_area(session)?;
    cmd.put_u16(size).put_u16(offset);
    cmd.finish()
}

/// TPM2_NV_ReadPublic
pub fn encode_nv_read_public(index: u32) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_NO_SESSIONS, TPM2_CC_NV_READ_PUBLIC);
    cmd.put_u32(index);
    cmd.finish()
}

/// TPM2_HashSequenceStart with an empty sequence auth value
pub fn encode_hash_sequence_start(hash_alg: u16) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_NO_SESSIONS, TPM2_CC_HASH_SEQUENCE_START);
    cmd.put_tpm2b(&[])?;
    cmd.put_u16(hash_alg);
    cmd.finish()
}

/// TPM2_SequenceUpdate
pub fn encode_sequence_update(handle: u32, session: &AuthSession, chunk: &[u8]) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_SESSIONS, TPM2_CC_SEQUENCE_UPDATE);
    cmd.put_u32(handle);
    cmd.put_auth_area(session)?;
    cmd.put_tpm2b(chunk)?;
    cmd.finish()
}

/// TPM2_SequenceComplete
pub fn encode_sequence_complete(
    handle: u32,
    session: &AuthSession,
    chunk: &[u8],
    hierarchy: u32,
) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_SESSIONS, TPM2_CC_SEQUENCE_COMPLETE);
    cmd.put_u32(handle);
    cmd.put_auth_area(session)?;
    cmd.put_tpm2b(chunk)?;
    cmd.put_u32(hierarchy);
    cmd.finish()
}

/// TPM2_FlushContext
pub fn encode_flush_context(handle: u32) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_NO_SESSIONS, TPM2_CC_FLUSH_CONTEXT);
    cmd.put_u32(handle);
    cmd.finish()
}

/// TPM2_GetRandom
pub fn encode_get_random(bytes_requested: u16) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_NO_SESSIONS, TPM2_CC_GET_RANDOM);
    cmd.put_u16(bytes_requested);
    cmd.finish()
}

/// TPM2_GetCapability
pub fn encode_get_capability(capability: u32, property: u32, count: u32) -> Result<Vec<u8>> {
    let mut cmd = CommandBuilder::new(TPM2_ST_NO_SESSIONS, TPM2_CC_GET_CAPABILITY);
    cmd.put_u32(capability).put_u32(property).put_u32(count);
    cmd.finish()
}

// ============================================================================
// BYTE READER
// ============================================================================

/// Bounds-checked big-endian cursor
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::MalformedResponse("truncated structure"));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Size-prefixed buffer (TPM2B)
    pub fn read_tpm2b(&mut self) -> Result<&'a [u8]> {
        let size = self.read_u16()? as usize;
        self.read_bytes(size)
    }

    /// Authorization area as framed by [`CommandBuilder::put_auth_area`]
    pub fn read_auth_area(&mut self) -> Result<AuthSession> {
        let size = self.read_u32()? as usize;
        let mut area = Reader::new(self.read_bytes(size)?);
        let session = AuthSession {
            handle: area.read_u32()?,
            nonce: area.read_tpm2b()?.to_vec(),
            attributes: SessionAttributes(area.read_u8()?),
            hmac: area.read_tpm2b()?.to_vec(),
        };
        if !area.is_empty() {
            return Err(Error::MalformedResponse("trailing bytes in authorization area"));
        }
        Ok(session)
    }

    /// TPM2B_NV_PUBLIC
    pub fn read_nv_public(&mut self) -> Result<NvPublic> {
        let mut area = Reader::new(self.read_tpm2b()?);
        let public = NvPublic {
            index: area.read_u32()?,
            name_alg: area.read_u16()?,
            attributes: area.read_u32()?,
            auth_policy: area.read_tpm2b()?.to_vec(),
            data_size: area.read_u16()?,
        };
        if !area.is_empty() {
            return Err(Error::MalformedResponse("trailing bytes in NV public area"));
        }
        Ok(public)
    }
}

// ============================================================================
// RESPONSE DECODING
// ============================================================================

/// Response with its header split off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response<'a> {
    pub tag: u16,
    pub code: TpmRc,
    pub body: &'a [u8],
}

impl<'a> Response<'a> {
    /// Parameter area; responses tagged with sessions carry a parameterSize
    /// after the handles and a trailing session area.
    pub fn parameters(&self, handle_count: usize) -> Result<Reader<'a>> {
        let mut reader = Reader::new(self.body);
        reader.read_bytes(handle_count * 4)?;
        if self.tag == TPM2_ST_SESSIONS {
            let size = reader.read_u32()? as usize;
            Ok(Reader::new(reader.read_bytes(size)?))
        } else {
            Ok(reader)
        }
    }
}

/// Split a response into header fields and body
pub fn decode_response(bytes: &[u8]) -> Result<Response<'_>> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::MalformedResponse("response shorter than header"));
    }
    let mut header = Reader::new(&bytes[..HEADER_SIZE]);
    let tag = header.read_u16()?;
    let size = header.read_u32()? as usize;
    let code = TpmRc(header.read_u32()?);

    if tag != TPM2_ST_NO_SESSIONS && tag != TPM2_ST_SESSIONS {
        return Err(Error::MalformedResponse("unknown response tag"));
    }
    if size < HEADER_SIZE || size > bytes.len() {
        return Err(Error::MalformedResponse("response size field disagrees with length"));
    }

    Ok(Response {
        tag,
        code,
        body: &bytes[HEADER_SIZE..size],
    })
}

/// NV_ReadPublic response: the public area (the name that follows is ignored)
pub fn parse_nv_read_public(response: &Response<'_>) -> Result<NvPublic> {
    response.parameters(0)?.read_nv_public()
}

/// NV_Read response: the data buffer
pub fn parse_nv_read(response: &Response<'_>) -> Result<Vec<u8>> {
    Ok(response.parameters(0)?.read_tpm2b()?.to_vec())
}

/// HashSequenceStart response: the sequence handle
pub fn parse_hash_sequence_start(response: &Response<'_>) -> Result<u32> {
    Reader::new(response.body).read_u32()
}

/// SequenceComplete response: the digest (the validation ticket is ignored)
pub fn parse_sequence_complete(response: &Response<'_>) -> Result<Sha256Digest> {
    let mut params = response.parameters(0)?;
    let digest = params.read_tpm2b()?;
    if digest.len() != DIGEST_SIZE {
        return Err(Error::MalformedResponse("sequence digest is not 32 bytes"));
    }
    Sha256Digest::from_slice(digest).ok_or(Error::MalformedResponse("sequence digest is not 32 bytes"))
}

/// GetRandom response: the random bytes (possibly fewer than requested)
pub fn parse_get_random(response: &Response<'_>) -> Result<Vec<u8>> {
    Ok(response.parameters(0)?.read_tpm2b()?.to_vec())
}

// ============================================================================
// COMMAND DECODING
// ============================================================================

/// Command with its header split off, as seen by a module implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command<'a> {
    pub tag: u16,
    pub code: u32,
    pub body: &'a [u8],
}

/// Split a command into header fields and body
pub fn decode_command(bytes: &[u8]) -> Result<Command<'_>> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::MalformedResponse("command shorter than header"));
    }
    let mut header = Reader::new(&bytes[..HEADER_SIZE]);
    let tag = header.read_u16()?;
    let size = header.read_u32()? as usize;
    let code = header.read_u32()?;
    if size != bytes.len() {
        return Err(Error::MalformedResponse("command size field disagrees with length"));
    }
    Ok(Command {
        tag,
        code,
        body: &bytes[HEADER_SIZE..],
    })
}

/// Frame a response. Sessions-tagged successes get a parameterSize and an
/// empty password acknowledgement; failures are header-only.
pub fn encode_response(tag: u16, code: TpmRc, handles: &[u32], parameters: &[u8]) -> Vec<u8> {
    if !code.is_success() {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(&TPM2_ST_NO_SESSIONS.to_be_bytes());
        out.extend_from_slice(&(HEADER_SIZE as u32).to_be_bytes());
        out.extend_from_slice(&code.raw().to_be_bytes());
        return out;
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + parameters.len() + 16);
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&code.raw().to_be_bytes());
    for handle in handles {
        out.extend_from_slice(&handle.to_be_bytes());
    }
    if tag == TPM2_ST_SESSIONS {
        out.extend_from_slice(&(parameters.len() as u32).to_be_bytes());
        out.extend_from_slice(parameters);
        // TPMS_AUTH_RESPONSE: empty nonce, no attributes, empty hmac
        out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00]);
    } else {
        out.extend_from_slice(parameters);
    }
    let size = out.len() as u32;
    out[2..6].copy_from_slice(&size.to_be_bytes());
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_define_space_layout() {
        let public = NvPublic::new(0x0151_0000, 128, NV_OWNER_READ_WRITE);
        let cmd = encode_define_space(TPM2_RH_OWNER, &public, &AuthSession::password()).unwrap();

        let expected = hex!(
            "8002 0000002d 0000012a"
            "40000001"
            "00000009 40000009 0000 00 0000"
            "0000"
            "000e 01510000 000b 00020002 0000 0080"
        );
        assert_eq!(cmd, expected.to_vec());
    }

    #[test]
    fn test_undefine_space_layout() {
        let cmd = encode_undefine_space(TPM2_RH_OWNER, 0x0151_0000, &AuthSession::password()).unwrap();

        let expected = hex!(
            "8002 0000001f 00000122"
            "40000001 01510000"
            "00000009 40000009 0000 00 0000"
        );
        assert_eq!(cmd, expected.to_vec());
    }

    #[test]
    fn test_get_random_layout() {
        let cmd = encode_get_random(10).unwrap();
        assert_eq!(cmd, hex!("8001 0000000c 0000017b 000a").to_vec());
    }

    #[test]
    fn test_auth_area_with_nonce_and_hmac() {
        let session = AuthSession {
            handle: TPM2_RS_PW,
            nonce: vec![0xAA, 0xBB],
            attributes: SessionAttributes(SessionAttributes::CONTINUE_SESSION),
            hmac: vec![0xCC],
        };
        let cmd = encode_undefine_space(TPM2_RH_OWNER, 1, &session).unwrap();

        let mut reader = Reader::new(&cmd[HEADER_SIZE + 8..]);
        let decoded = reader.read_auth_area().unwrap();
        assert_eq!(decoded, session);
        assert!(reader.is_empty());
        // handle + nonce(2+2) + attrs + hmac(2+1)
        assert_eq!(&cmd[HEADER_SIZE + 8..HEADER_SIZE + 12], &12u32.to_be_bytes());
    }

    #[test]
    fn test_nv_write_frames_data_and_offset() {
        let cmd = encode_nv_write(TPM2_RH_OWNER, 0x0151_0001, &AuthSession::password(), &[1, 2, 3], 7)
            .unwrap();
        let decoded = decode_command(&cmd).unwrap();
        assert_eq!(decoded.code, TPM2_CC_NV_WRITE);

        let mut body = Reader::new(decoded.body);
        assert_eq!(body.read_u32().unwrap(), TPM2_RH_OWNER);
        assert_eq!(body.read_u32().unwrap(), 0x0151_0001);
        body.read_auth_area().unwrap();
        assert_eq!(body.read_tpm2b().unwrap(), &[1, 2, 3]);
        assert_eq!(body.read_u16().unwrap(), 7);
        assert!(body.is_empty());
    }

    #[test]
    fn test_oversized_tpm2b_rejected() {
        let data = vec![0u8; 70_000];
        let err = encode_sequence_update(0x8000_0000, &AuthSession::password(), &data).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_decode_short_response() {
        assert!(matches!(
            decode_response(&[0x80, 0x01, 0x00]),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_decode_size_mismatch() {
        // Size claims 20 bytes, only 10 present
        let bytes = hex!("8001 00000014 00000000");
        assert!(matches!(decode_response(&bytes), Err(Error::MalformedResponse(_))));
    }

    #[test]
    fn test_decode_error_code() {
        let bytes = hex!("8001 0000000a 0000014c");
        let response = decode_response(&bytes).unwrap();
        assert_eq!(response.code, TpmRc::NV_DEFINED);
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_parse_nv_read_with_sessions() {
        let response_bytes = encode_response(TPM2_ST_SESSIONS, TpmRc::SUCCESS, &[], &hex!("0003 414243"));
        let response = decode_response(&response_bytes).unwrap();
        assert_eq!(parse_nv_read(&response).unwrap(), b"ABC".to_vec());
    }

    #[test]
    fn test_parse_nv_read_public() {
        let mut params = CommandBuilder::new(0, 0);
        let size = params.reserve_u16();
        params.put_u32(0x0151_0001).put_u16(TPM2_ALG_SHA256).put_u32(NV_OWNER_READ_WRITE);
        params.put_tpm2b(&[]).unwrap();
        params.put_u16(65);
        params.patch(size).unwrap();
        params.put_tpm2b(&[0x00, 0x0B]).unwrap();
        let params = params.finish().unwrap();

        let bytes = encode_response(TPM2_ST_NO_SESSIONS, TpmRc::SUCCESS, &[], &params[HEADER_SIZE..]);
        let response = decode_response(&bytes).unwrap();
        let public = parse_nv_read_public(&response).unwrap();
        assert_eq!(public, NvPublic::new(0x0151_0001, 65, NV_OWNER_READ_WRITE));
    }

    #[test]
    fn test_parse_sequence_complete_rejects_short_digest() {
        let bytes = encode_response(TPM2_ST_SESSIONS, TpmRc::SUCCESS, &[], &hex!("0002 abcd"));
        let response = decode_response(&bytes).unwrap();
        assert!(matches!(
            parse_sequence_complete(&response),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_error_response_is_header_only() {
        let bytes = encode_response(TPM2_ST_SESSIONS, TpmRc::NV_SPACE, &[], &[1, 2, 3]);
        assert_eq!(bytes, hex!("8001 0000000a 0000014b").to_vec());
    }
}
