//! # TPM 2.0 Command Driver
//!
//! Typed wrappers over the [`crate::codec`] encoders. The driver owns the
//! response buffer, submits one command at a time over a [`Transport`],
//! decodes the header and turns non-success codes into
//! [`Error::ModuleStatus`].
//!
//! Hash sequences are handed out as a [`HashSequence`] guard that flushes
//! the module-side context if it is dropped before completion.

use log::{debug, warn};

use crate::codec::{self, AuthSession, NvPublic, Reader, Response};
use crate::error::{Error, Result, TransportError};
use crate::Sha256Digest;

/// Default transport ceiling for one buffer (TPM2B_MAX_BUFFER)
pub const DEFAULT_MAX_BUFFER: usize = 1024;

/// Byte channel to the security module
pub trait Transport {
    /// Submit one command and fill `response`, returning the response length.
    ///
    /// The module serializes commands; implementations never pipeline.
    fn submit(&mut self, command: &[u8], response: &mut [u8]) -> core::result::Result<usize, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn submit(&mut self, command: &[u8], response: &mut [u8]) -> core::result::Result<usize, TransportError> {
        (**self).submit(command, response)
    }
}

/// TPM 2.0 command driver
pub struct Tpm<T: Transport> {
    transport: T,
    max_buffer: usize,
    response: Vec<u8>,
}

impl<T: Transport> Tpm<T> {
    /// Create a driver with the default buffer limits
    pub fn new(transport: T) -> Self {
        Self::with_limits(transport, DEFAULT_MAX_BUFFER, codec::MAX_RESPONSE_SIZE)
    }

    /// Create a driver with an explicit single-buffer ceiling and response capacity
    pub fn with_limits(transport: T, max_buffer: usize, response_capacity: usize) -> Self {
        Self {
            transport,
            max_buffer,
            response: vec![0u8; response_capacity.max(codec::HEADER_SIZE)],
        }
    }

    /// Largest payload accepted in one NV write or sequence update
    pub fn max_buffer(&self) -> usize {
        self.max_buffer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Submit a command, decode the header and hand the body to `parse`
    fn transact<R>(
        &mut self,
        command: &[u8],
        parse: impl FnOnce(&Response<'_>) -> Result<R>,
    ) -> Result<R> {
        let len = self.transport.submit(command, &mut self.response).map_err(|e| {
            warn!("transport failure: {}", e);
            Error::from(e)
        })?;
        if len > self.response.len() {
            warn!("transport reported {} bytes for a {} byte buffer", len, self.response.len());
            return Err(TransportError::BufferTooSmall(len).into());
        }

        let response = codec::decode_response(&self.response[..len])?;
        if !response.code.is_success() {
            debug!("command returned {}", response.code);
            return Err(Error::ModuleStatus(response.code));
        }
        parse(&response)
    }

    /// GetCapability(TPM_PROPERTIES, PT_MANUFACTURER), returning the vendor id
    pub fn test_connection(&mut self) -> Result<u32> {
        let cmd = codec::encode_get_capability(
            codec::TPM2_CAP_TPM_PROPERTIES,
            codec::TPM2_PT_MANUFACTURER,
            1,
        )?;
        let manufacturer = self.transact(&cmd, |response| {
            let mut body = Reader::new(response.body);
            let _more_data = body.read_u8()?;
            let _capability = body.read_u32()?;
            let count = body.read_u32()?;
            if count == 0 {
                return Err(Error::MalformedResponse("capability response has no properties"));
            }
            let _property = body.read_u32()?;
            body.read_u32()
        })?;
        debug!("TPM manufacturer {:#010x}", manufacturer);
        Ok(manufacturer)
    }

    pub fn nv_define_space(&mut self, auth_handle: u32, public: &NvPublic) -> Result<()> {
        let cmd = codec::encode_define_space(auth_handle, public, &AuthSession::password())?;
        self.transact(&cmd, |_| Ok(()))
    }

    pub fn nv_undefine_space(&mut self, auth_handle: u32, index: u32) -> Result<()> {
        let cmd = codec::encode_undefine_space(auth_handle, index, &AuthSession::password())?;
        self.transact(&cmd, |_| Ok(()))
    }

    pub fn nv_read_public(&mut self, index: u32) -> Result<NvPublic> {
        let cmd = codec::encode_nv_read_public(index)?;
        self.transact(&cmd, codec::parse_nv_read_public)
    }

    pub fn nv_write(&mut self, auth_handle: u32, index: u32, data: &[u8], offset: u16) -> Result<()> {
        if data.len() > self.max_buffer {
            return Err(Error::InvalidInput("NV write larger than the transport buffer"));
        }
        let cmd = codec::encode_nv_write(auth_handle, index, &AuthSession::password(), data, offset)?;
        self.transact(&cmd, |_| Ok(()))
    }

    /// NV_Read; fails if the module returns fewer bytes than requested
    pub fn nv_read(&mut self, auth_handle: u32, index: u32, size: u16, offset: u16) -> Result<Vec<u8>> {
        if size as usize > self.max_buffer {
            return Err(Error::InvalidInput("NV read larger than the transport buffer"));
        }
        let cmd = codec::encode_nv_read(auth_handle, index, &AuthSession::password(), size, offset)?;
        let data = self.transact(&cmd, codec::parse_nv_read)?;
        if data.len() < size as usize {
            warn!("NV read of {:#010x} returned {} of {} bytes", index, data.len(), size);
            return Err(Error::MalformedResponse("NV read returned fewer bytes than requested"));
        }
        Ok(data)
    }

    /// Open a hash sequence; the returned guard must be completed or dropped
    pub fn hash_sequence_start(&mut self, hash_alg: u16) -> Result<HashSequence<'_, T>> {
        let cmd = codec::encode_hash_sequence_start(hash_alg)?;
        let handle = self.transact(&cmd, codec::parse_hash_sequence_start)?;
        debug!("opened hash sequence {:#010x}", handle);
        Ok(HashSequence {
            tpm: self,
            handle,
            open: true,
        })
    }

    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let cmd = codec::encode_flush_context(handle)?;
        self.transact(&cmd, |_| Ok(()))
    }

    /// Collect exactly `count` random bytes, issuing as many GetRandom
    /// commands as the module needs.
    pub fn get_random(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let wanted = (count - out.len()).min(self.max_buffer).min(u16::MAX as usize) as u16;
            let cmd = codec::encode_get_random(wanted)?;
            let bytes = self.transact(&cmd, codec::parse_get_random)?;
            if bytes.is_empty() {
                return Err(Error::MalformedResponse("GetRandom returned no bytes"));
            }
            let take = bytes.len().min(count - out.len());
            out.extend_from_slice(&bytes[..take]);
        }
        Ok(out)
    }
}

/// Open hash sequence on the module.
///
/// Dropping the guard without calling [`HashSequence::complete`] flushes the
/// sequence context so no module object outlives the operation.
pub struct HashSequence<'a, T: Transport> {
    tpm: &'a mut Tpm<T>,
    handle: u32,
    open: bool,
}

impl<'a, T: Transport> HashSequence<'a, T> {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Feed one chunk; chunks above the transport ceiling are rejected
    pub fn update(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() > self.tpm.max_buffer {
            return Err(Error::InvalidInput("sequence update larger than the transport buffer"));
        }
        let cmd = codec::encode_sequence_update(self.handle, &AuthSession::password(), chunk)?;
        self.tpm.transact(&cmd, |_| Ok(()))
    }

    /// Close the sequence with a final chunk and return the digest
    pub fn complete(mut self, final_chunk: &[u8]) -> Result<Sha256Digest> {
        if final_chunk.len() > self.tpm.max_buffer {
            return Err(Error::InvalidInput("sequence update larger than the transport buffer"));
        }
        let cmd = codec::encode_sequence_complete(
            self.handle,
            &AuthSession::password(),
            final_chunk,
            codec::TPM2_RH_NULL,
        )?;
        let digest = self.tpm.transact(&cmd, codec::parse_sequence_complete)?;
        // The module releases the sequence object on successful completion
        self.open = false;
        Ok(digest)
    }
}

impl<T: Transport> Drop for HashSequence<'_, T> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        debug!("flushing abandoned hash sequence {:#010x}", self.handle);
        if let Err(e) = self.tpm.flush_context(self.handle) {
            warn!("failed to flush hash sequence {:#010x}: {}", self.handle, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_command, encode_response, TPM2_ST_NO_SESSIONS, TPM2_ST_SESSIONS};
    use crate::TpmRc;
    use std::collections::VecDeque;

    /// Replays canned responses and records every command
    struct Scripted {
        responses: VecDeque<Vec<u8>>,
        commands: Vec<Vec<u8>>,
    }

    impl Scripted {
        fn new(responses: Vec<Vec<u8>>) -> Self {
            Self {
                responses: responses.into(),
                commands: Vec::new(),
            }
        }

        fn codes(&self) -> Vec<u32> {
            self.commands
                .iter()
                .map(|c| decode_command(c).unwrap().code)
                .collect()
        }
    }

    impl Transport for Scripted {
        fn submit(&mut self, command: &[u8], response: &mut [u8]) -> core::result::Result<usize, TransportError> {
            self.commands.push(command.to_vec());
            let next = self.responses.pop_front().ok_or(TransportError::NotReady)?;
            if next.len() > response.len() {
                return Err(TransportError::BufferTooSmall(next.len()));
            }
            response[..next.len()].copy_from_slice(&next);
            Ok(next.len())
        }
    }

    fn ok(tag: u16, params: &[u8]) -> Vec<u8> {
        encode_response(tag, TpmRc::SUCCESS, &[], params)
    }

    fn fail(rc: TpmRc) -> Vec<u8> {
        encode_response(TPM2_ST_NO_SESSIONS, rc, &[], &[])
    }

    #[test]
    fn test_status_code_surfaces() {
        let mut tpm = Tpm::new(Scripted::new(vec![fail(TpmRc::NV_SPACE)]));
        let err = tpm.nv_undefine_space(codec::TPM2_RH_OWNER, 1).unwrap_err();
        assert_eq!(err.response_code(), Some(TpmRc::NV_SPACE));
    }

    #[test]
    fn test_transport_error_surfaces() {
        let mut tpm = Tpm::new(Scripted::new(vec![]));
        let err = tpm.get_random(4).unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::NotReady)));
    }

    #[test]
    fn test_nv_read_short_data_rejected() {
        let mut tpm = Tpm::new(Scripted::new(vec![ok(TPM2_ST_SESSIONS, &[0x00, 0x02, 0xAA, 0xBB])]));
        let err = tpm.nv_read(codec::TPM2_RH_OWNER, 1, 4, 0).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn test_get_random_loops_until_filled() {
        let mut tpm = Tpm::new(Scripted::new(vec![
            ok(TPM2_ST_NO_SESSIONS, &[0x00, 0x04, 1, 2, 3, 4]),
            ok(TPM2_ST_NO_SESSIONS, &[0x00, 0x08, 5, 6, 7, 8, 9, 10, 11, 12]),
        ]));
        let bytes = tpm.get_random(10).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(tpm.transport().commands.len(), 2);
    }

    #[test]
    fn test_dropped_sequence_is_flushed() {
        let mut tpm = Tpm::new(Scripted::new(vec![
            ok(TPM2_ST_NO_SESSIONS, &0x8000_0001u32.to_be_bytes()),
            fail(TpmRc::SEQUENCE),
            ok(TPM2_ST_NO_SESSIONS, &[]),
        ]));
        {
            let mut seq = tpm.hash_sequence_start(codec::TPM2_ALG_SHA256).unwrap();
            assert_eq!(seq.handle(), 0x8000_0001);
            assert!(seq.update(b"abc").is_err());
        }
        assert_eq!(
            tpm.transport().codes(),
            vec![
                codec::TPM2_CC_HASH_SEQUENCE_START,
                codec::TPM2_CC_SEQUENCE_UPDATE,
                codec::TPM2_CC_FLUSH_CONTEXT,
            ]
        );
    }

    #[test]
    fn test_completed_sequence_not_flushed() {
        let mut digest_params = vec![0x00, 0x20];
        digest_params.extend_from_slice(&[0x11; 32]);
        let mut tpm = Tpm::new(Scripted::new(vec![
            ok(TPM2_ST_NO_SESSIONS, &0x8000_0002u32.to_be_bytes()),
            ok(TPM2_ST_SESSIONS, &digest_params),
        ]));
        let digest = tpm
            .hash_sequence_start(codec::TPM2_ALG_SHA256)
            .unwrap()
            .complete(&[])
            .unwrap();
        assert_eq!(digest, Sha256Digest::new([0x11; 32]));
        assert_eq!(tpm.transport().commands.len(), 2);
    }

    #[test]
    fn test_oversized_update_rejected_locally() {
        let mut tpm = Tpm::with_limits(
            Scripted::new(vec![
                ok(TPM2_ST_NO_SESSIONS, &0x8000_0003u32.to_be_bytes()),
                ok(TPM2_ST_NO_SESSIONS, &[]),
            ]),
            16,
            256,
        );
        {
            let mut seq = tpm.hash_sequence_start(codec::TPM2_ALG_SHA256).unwrap();
            let err = seq.update(&[0u8; 17]).unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
        }
        // start, then flush from drop; the oversized update never left the driver
        assert_eq!(tpm.transport().commands.len(), 2);
    }
}
