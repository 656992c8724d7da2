//! Levin wire codec: header layout and message writers.
//!
//! Every frame is a fixed 33-byte little-endian header followed by the
//! payload. Covert traffic uses two special shapes: noise frames (both
//! BEGIN and END set, command 0, zeroed payload) and fragment chains
//! (BEGIN ... END around an inner header + payload, zero padded to the
//! frame boundary).

use crate::bytes::{ByteSlice, ByteStream};
use thiserror::Error;

pub const LEVIN_SIGNATURE: u64 = 0x0101010101012101;
pub const LEVIN_PROTOCOL_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 33;

pub const PACKET_REQUEST: u32 = 0x0000_0001;
pub const PACKET_RESPONSE: u32 = 0x0000_0002;
pub const PACKET_BEGIN: u32 = 0x0000_0004;
pub const PACKET_END: u32 = 0x0000_0008;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("levin signature mismatch")]
    BadSignature,
    #[error("unsupported levin protocol version")]
    BadVersion,
    #[error("invalid codec argument: {0}")]
    InvalidArgument(&'static str),
}

/// Decoded levin header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub payload_len: u64,
    pub return_data: bool,
    pub command: u32,
    pub return_code: i32,
    pub flags: u32,
    pub version: u32,
}

impl Header {
    pub fn new(command: u32, payload_len: u64, flags: u32, return_data: bool) -> Self {
        Self {
            payload_len,
            return_data,
            command,
            return_code: 0,
            flags,
            version: LEVIN_PROTOCOL_VERSION,
        }
    }

    /// Parse a header; `bytes` must hold at least [`HEADER_SIZE`] bytes.
    /// Signature and protocol version must match exactly.
    pub fn parse(bytes: &[u8]) -> Result<Header, CodecError> {
        assert!(bytes.len() >= HEADER_SIZE);
        if u64::from_le_bytes(bytes[0..8].try_into().unwrap()) != LEVIN_SIGNATURE {
            return Err(CodecError::BadSignature);
        }
        let header = Header {
            payload_len: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            return_data: bytes[16] != 0,
            command: u32::from_le_bytes(bytes[17..21].try_into().unwrap()),
            return_code: i32::from_le_bytes(bytes[21..25].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[25..29].try_into().unwrap()),
            version: u32::from_le_bytes(bytes[29..33].try_into().unwrap()),
        };
        if header.version != LEVIN_PROTOCOL_VERSION {
            return Err(CodecError::BadVersion);
        }
        Ok(header)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&LEVIN_SIGNATURE.to_le_bytes());
        out[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out[16] = self.return_data as u8;
        out[17..21].copy_from_slice(&self.command.to_le_bytes());
        out[21..25].copy_from_slice(&self.return_code.to_le_bytes());
        out[25..29].copy_from_slice(&self.flags.to_le_bytes());
        out[29..33].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    pub fn is_request(&self) -> bool {
        self.flags & PACKET_REQUEST != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & PACKET_RESPONSE != 0
    }

    /// Neither request nor response: a noise frame or fragment chain link
    pub fn is_fragment(&self) -> bool {
        self.flags & (PACKET_REQUEST | PACKET_RESPONSE) == 0
    }

    pub fn is_noise(&self) -> bool {
        const BOTH: u32 = PACKET_BEGIN | PACKET_END;
        self.is_fragment() && self.flags & BOTH == BOTH
    }
}

/// Builder for an outgoing message. Header space is reserved up front so
/// finalizing never copies the payload.
pub struct MessageWriter {
    buf: ByteStream,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(payload_capacity: usize) -> Self {
        let mut buf = ByteStream::with_capacity(HEADER_SIZE + payload_capacity);
        buf.put_zeros(HEADER_SIZE);
        Self { buf }
    }

    /// Append payload bytes
    pub fn write(&mut self, data: &[u8]) {
        self.buf.write(data);
    }

    pub fn put_zeros(&mut self, count: usize) {
        self.buf.put_zeros(count);
    }

    /// Total size including the reserved header slot
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == HEADER_SIZE
    }

    fn finalize(mut self, header: Header) -> ByteSlice {
        self.buf.as_mut_bytes()[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        self.buf.into_slice()
    }

    fn payload_len(&self) -> u64 {
        (self.buf.len() - HEADER_SIZE) as u64
    }

    /// Frame as an invoke: expects a response
    pub fn finalize_invoke(self, command: u32) -> ByteSlice {
        let header = Header::new(command, self.payload_len(), PACKET_REQUEST, true);
        self.finalize(header)
    }

    /// Frame as a notify: one-way
    pub fn finalize_notify(self, command: u32) -> ByteSlice {
        let header = Header::new(command, self.payload_len(), PACKET_REQUEST, false);
        self.finalize(header)
    }

    /// Frame as the response to an invoke
    pub fn finalize_response(self, command: u32, return_code: i32) -> ByteSlice {
        let mut header = Header::new(command, self.payload_len(), PACKET_RESPONSE, false);
        header.return_code = return_code;
        self.finalize(header)
    }
}

impl Default for MessageWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// A zero-filled frame of exactly `total_size` bytes that receivers skip.
/// Real covert messages are sliced to the same size, so an observer cannot
/// tell them apart by length.
pub fn make_noise_notify(total_size: usize) -> Result<ByteSlice, CodecError> {
    if total_size < HEADER_SIZE {
        return Err(CodecError::InvalidArgument("noise smaller than levin header"));
    }
    let payload = total_size - HEADER_SIZE;
    let header = Header::new(0, payload as u64, PACKET_BEGIN | PACKET_END, false);
    let mut buf = ByteStream::with_capacity(total_size);
    buf.write(&header.to_bytes());
    buf.put_zeros(payload);
    Ok(buf.into_slice())
}

/// Split `message` into frames of exactly `fragment_size` bytes.
///
/// When the whole message (inner header included) fits one frame it is
/// emitted as a plain notify zero-padded to the frame payload size; the
/// receiver's deserializer tolerates trailing padding. Otherwise each
/// frame carries command 0 with BEGIN on the first, END on the last, and
/// the inner header travels at the start of the reassembled stream.
pub fn make_fragmented_notify(
    fragment_size: usize,
    command: u32,
    mut message: MessageWriter,
) -> Result<ByteSlice, CodecError> {
    if fragment_size < HEADER_SIZE * 2 {
        return Err(CodecError::InvalidArgument("fragment size below two levin headers"));
    }

    if message.len() <= fragment_size {
        message.put_zeros(fragment_size - message.len());
        return Ok(message.finalize_notify(command));
    }

    let inner = message.finalize_notify(command);
    let frame_payload = fragment_size - HEADER_SIZE;
    let frames = inner.len().div_ceil(frame_payload);

    let mut out = ByteStream::with_capacity(frames * fragment_size);
    let inner_bytes = inner.as_bytes();
    for index in 0..frames {
        let mut flags = 0;
        if index == 0 {
            flags |= PACKET_BEGIN;
        }
        if index == frames - 1 {
            flags |= PACKET_END;
        }
        let header = Header::new(0, frame_payload as u64, flags, false);
        out.write(&header.to_bytes());

        let begin = index * frame_payload;
        let end = (begin + frame_payload).min(inner_bytes.len());
        out.write(&inner_bytes[begin..end]);
        out.put_zeros(frame_payload - (end - begin));
    }
    Ok(out.into_slice())
}
