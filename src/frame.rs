// Jackson Coxson
//! Length-prefixed framing used by lockdown and the plist services.
//!
//! Every message is a 4-byte big-endian length followed by that many payload
//! bytes. USB bulk transfers fragment freely, so incoming bytes are collected
//! in a [`FrameReader`] until a whole frame is available.

use bytes::{Buf, Bytes, BytesMut};

use crate::IdeviceError;

/// Size of the length prefix
pub const HEADER_LEN: usize = 4;

/// Largest frame accepted unless configured otherwise
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Prefixes `payload` with its big-endian length
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, IdeviceError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        IdeviceError::InvalidArgument(format!("frame of {} bytes is too large", payload.len()))
    })?;
    let mut res = Vec::with_capacity(HEADER_LEN + payload.len());
    res.extend_from_slice(&len.to_be_bytes());
    res.extend_from_slice(payload);
    Ok(res)
}

/// Reassembles frames from arbitrarily split reads
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    max_len: usize,
}

impl FrameReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_len,
        }
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Appends freshly received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not yet consumed bytes
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pops the next complete frame, if one has fully arrived
    ///
    /// # Errors
    /// `ProtocolError` when the announced length exceeds the configured maximum.
    /// The buffer is left untouched in that case.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, IdeviceError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; HEADER_LEN];
        prefix.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_len {
            return Err(IdeviceError::ProtocolError(format!(
                "frame length {len} exceeds the maximum of {}",
                self.max_len
            )));
        }

        if self.buf.len() < HEADER_LEN + len {
            self.buf.reserve(HEADER_LEN + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Takes up to `max` raw bytes from the front of the buffer
    pub fn take(&mut self, max: usize) -> Bytes {
        let n = max.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
