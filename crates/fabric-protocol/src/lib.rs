// fabric-protocol: TCP framing and request/response types for the chat fabric.
//
// Every frame on the wire is a fixed 6-byte header followed by the payload:
// a u16 message type and a u32 payload length, both big-endian.  Payloads are
// binary-encoded submessages (see `messages`); the framing layer treats them
// as opaque bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub mod messages;

/// Size of the frame header: u16 message type + u32 payload length.
pub const FRAME_HEADER_LEN: usize = 6;

/// Frames declaring a payload larger than this are rejected and the
/// connection is closed.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Client -> server message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestType {
    Identity = 0,
    JoinGroup = 1,
    DirectMessage = 2,
    LeaveGroup = 3,
    FetchGroups = 4,
    SearchForGroup = 5,
    Disconnect = 6,
    MatchContacts = 7,
}

impl RequestType {
    /// Map a raw header value onto a request type.  Unknown values are a
    /// protocol violation; callers close the connection.
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Identity),
            1 => Some(Self::JoinGroup),
            2 => Some(Self::DirectMessage),
            3 => Some(Self::LeaveGroup),
            4 => Some(Self::FetchGroups),
            5 => Some(Self::SearchForGroup),
            6 => Some(Self::Disconnect),
            7 => Some(Self::MatchContacts),
            _ => None,
        }
    }
}

/// Server -> client message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseType {
    RequestIdentity = 0,
    IdentityRejection = 1,
    IdentityAccepted = 2,
    DisconnectionAccepted = 3,
    ReceiveDirectMessage = 4,
    ContactBatch = 5,
    DeliveryState = 6,
}

impl ResponseType {
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::RequestIdentity),
            1 => Some(Self::IdentityRejection),
            2 => Some(Self::IdentityAccepted),
            3 => Some(Self::DisconnectionAccepted),
            4 => Some(Self::ReceiveDirectMessage),
            5 => Some(Self::ContactBatch),
            6 => Some(Self::DeliveryState),
            _ => None,
        }
    }
}

/// Machine-readable failure codes carried in `Failure.error`.
pub mod error_codes {
    pub const IDENTITY_REJECTED: &str = "IDENTITY-REJECTED";
    pub const DELIVERY_FAILED: &str = "DELIVERY-FAILED";
    pub const BUS_DOWN: &str = "BUS-DOWN";
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One header + payload unit on the wire.
///
/// `kind` is the raw u16 from the header; the connection layer maps it onto
/// [`RequestType`] (inbound) while the server writes [`ResponseType`] values
/// (outbound).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: u16, payload: impl Into<Bytes>) -> Self {
        Frame {
            kind,
            payload: payload.into(),
        }
    }

    pub fn response(response_type: ResponseType, payload: impl Into<Bytes>) -> Self {
        Frame::new(response_type as u16, payload)
    }
}

/// Errors raised by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame declares {declared} bytes, cap is {cap}")]
    Oversized { declared: usize, cap: usize },
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Streaming frame codec.
///
/// Tolerates arbitrary fragmentation: bytes are buffered until both the
/// header and the declared payload are present, and a single read may yield
/// several frames.  A declared length above [`MAX_FRAME_LEN`] is an error;
/// the connection is closed without a response.
#[derive(Debug, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if declared > MAX_FRAME_LEN {
            return Err(FrameError::Oversized {
                declared,
                cap: MAX_FRAME_LEN,
            });
        }
        if src.len() < FRAME_HEADER_LEN + declared {
            src.reserve(FRAME_HEADER_LEN + declared - src.len());
            return Ok(None);
        }
        let kind = src.get_u16();
        src.advance(4);
        let payload = src.split_to(declared).freeze();
        Ok(Some(Frame { kind, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > MAX_FRAME_LEN {
            return Err(FrameError::Oversized {
                declared: frame.payload.len(),
                cap: MAX_FRAME_LEN,
            });
        }
        dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
        dst.put_u16(frame.kind);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Encode a single frame into a standalone buffer (header + payload).
pub fn encode_frame(kind: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u16(kind);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}
