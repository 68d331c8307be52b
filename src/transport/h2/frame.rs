//! HTTP/2 frame serialization (RFC 9113).
//!
//! Hand-rolled because fingerprinting depends on the exact bytes of the
//! connection preamble: SETTINGS parameter order (including GREASE
//! identifiers), the connection WINDOW_UPDATE delta, and any PRIORITY
//! frames must be emitted exactly as the emulated browser would.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Frame header size per RFC 9113 §4.1.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default max frame size until SETTINGS says otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Client connection preface.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> u8 {
        match t {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    /// Same bit as END_STREAM, in SETTINGS/PING context.
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Error codes per RFC 9113 §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(Error::protocol("short frame header"));
        }
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        Ok(Self {
            length,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
        })
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_uint(self.length as u64, 3);
        out.put_u8(self.frame_type.into());
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & 0x7fff_ffff);
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

fn frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    FrameHeader {
        length: payload.len() as u32,
        frame_type,
        flags,
        stream_id,
    }
    .encode(&mut out);
    out.put_slice(payload);
    out.freeze()
}

/// SETTINGS frame preserving parameter order. GREASE identifiers are
/// inserted like any other parameter.
#[derive(Debug, Clone, Default)]
pub struct SettingsFrame {
    pub entries: Vec<(u16, u32)>,
}

impl SettingsFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: u16, value: u32) -> &mut Self {
        self.entries.push((id, value));
        self
    }

    pub fn serialize(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(self.entries.len() * 6);
        for (id, value) in &self.entries {
            payload.put_u16(*id);
            payload.put_u32(*value);
        }
        frame(FrameType::Settings, 0, 0, &payload)
    }

    pub fn serialize_ack() -> Bytes {
        frame(FrameType::Settings, flags::ACK, 0, &[])
    }

    /// Parse a SETTINGS payload into (id, value) pairs.
    pub fn parse_payload(mut payload: &[u8]) -> Result<Vec<(u16, u32)>> {
        if payload.len() % 6 != 0 {
            return Err(Error::protocol("SETTINGS length not a multiple of 6"));
        }
        let mut entries = Vec::with_capacity(payload.len() / 6);
        while payload.remaining() >= 6 {
            entries.push((payload.get_u16(), payload.get_u32()));
        }
        Ok(entries)
    }
}

/// WINDOW_UPDATE frame.
pub fn window_update(stream_id: u32, increment: u32) -> Bytes {
    frame(
        FrameType::WindowUpdate,
        0,
        stream_id,
        &(increment & 0x7fff_ffff).to_be_bytes(),
    )
}

/// PRIORITY frame. `weight` is the wire byte (actual weight minus one).
pub fn priority(stream_id: u32, depends_on: u32, weight: u8, exclusive: bool) -> Bytes {
    let mut payload = [0u8; 5];
    let dep = if exclusive {
        depends_on | 0x8000_0000
    } else {
        depends_on & 0x7fff_ffff
    };
    payload[..4].copy_from_slice(&dep.to_be_bytes());
    payload[4] = weight;
    frame(FrameType::Priority, 0, stream_id, &payload)
}

/// HEADERS frame carrying an already-encoded HPACK block. The caller
/// guarantees the block fits one frame (browser request heads do).
pub fn headers(stream_id: u32, block: &[u8], end_stream: bool) -> Bytes {
    let mut f = flags::END_HEADERS;
    if end_stream {
        f |= flags::END_STREAM;
    }
    frame(FrameType::Headers, f, stream_id, block)
}

/// DATA frame.
pub fn data(stream_id: u32, chunk: &[u8], end_stream: bool) -> Bytes {
    let f = if end_stream { flags::END_STREAM } else { 0 };
    frame(FrameType::Data, f, stream_id, chunk)
}

/// RST_STREAM frame.
pub fn rst_stream(stream_id: u32, code: ErrorCode) -> Bytes {
    frame(FrameType::RstStream, 0, stream_id, &code.0.to_be_bytes())
}

/// PING response.
pub fn ping_ack(payload: [u8; 8]) -> Bytes {
    frame(FrameType::Ping, flags::ACK, 0, &payload)
}

/// GOAWAY frame.
pub fn goaway(last_stream_id: u32, code: ErrorCode) -> Bytes {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
    payload[4..].copy_from_slice(&code.0.to_be_bytes());
    frame(FrameType::GoAway, 0, 0, &payload)
}

/// Parse a GOAWAY payload into (last_stream_id, error code).
pub fn parse_goaway(payload: &[u8]) -> Result<(u32, ErrorCode)> {
    if payload.len() < 8 {
        return Err(Error::protocol("short GOAWAY payload"));
    }
    let last = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
    let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Ok((last, ErrorCode(code)))
}

/// Strip padding from a padded DATA/HEADERS payload.
pub fn strip_padding(header: &FrameHeader, payload: &[u8]) -> Result<Bytes> {
    if !header.has_flag(flags::PADDED) {
        return Ok(Bytes::copy_from_slice(payload));
    }
    let pad_len = *payload
        .first()
        .ok_or_else(|| Error::protocol("padded frame with empty payload"))? as usize;
    if pad_len + 1 > payload.len() {
        return Err(Error::protocol("padding exceeds frame payload"));
    }
    Ok(Bytes::copy_from_slice(
        &payload[1..payload.len() - pad_len],
    ))
}
