//! One-byte framing for request and response bodies.
//!
//! Request plaintext:  `msg_type (1) || body`
//! Response payload:   `response_code (1) || body` (body empty on error)

use prost::Message;

/// Width of the message type and response code headers.
pub const HEADER_LEN: usize = 1;

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    FinalizePairing = 0x00,
    Connect = 0x01,
    GetAddresses = 0x02,
    Sign = 0x03,
    GetWallets = 0x04,
    GetKvRecords = 0x07,
    AddKvRecords = 0x08,
    RemoveKvRecords = 0x09,
}

impl MsgType {
    /// Whether this message type travels without a secure envelope.
    pub fn is_plain(self) -> bool {
        matches!(self, MsgType::Connect | MsgType::FinalizePairing)
    }
}

impl TryFrom<u8> for MsgType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0x00 => MsgType::FinalizePairing,
            0x01 => MsgType::Connect,
            0x02 => MsgType::GetAddresses,
            0x03 => MsgType::Sign,
            0x04 => MsgType::GetWallets,
            0x07 => MsgType::GetKvRecords,
            0x08 => MsgType::AddKvRecords,
            0x09 => MsgType::RemoveKvRecords,
            other => return Err(FrameError::UnknownMsgType(other)),
        })
    }
}

/// Closed set of response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0x00,
    InvalidMsg = 0x80,
    DeviceBusy = 0x82,
    Timeout = 0x83,
    UserRejected = 0x84,
    PairFailed = 0x85,
    Internal = 0x88,
    DeviceLocked = 0x8b,
    NotFound = 0x8c,
    UnsupportedCurve = 0x8d,
    NotPaired = 0x8e,
    DecryptFail = 0x8f,
    ChecksumMismatch = 0x90,
}

impl TryFrom<u8> for ResponseCode {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0x00 => ResponseCode::Success,
            0x80 => ResponseCode::InvalidMsg,
            0x82 => ResponseCode::DeviceBusy,
            0x83 => ResponseCode::Timeout,
            0x84 => ResponseCode::UserRejected,
            0x85 => ResponseCode::PairFailed,
            0x88 => ResponseCode::Internal,
            0x8b => ResponseCode::DeviceLocked,
            0x8c => ResponseCode::NotFound,
            0x8d => ResponseCode::UnsupportedCurve,
            0x8e => ResponseCode::NotPaired,
            0x8f => ResponseCode::DecryptFail,
            0x90 => ResponseCode::ChecksumMismatch,
            other => return Err(FrameError::UnknownResponseCode(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    Empty,
    UnknownMsgType(u8),
    UnknownResponseCode(u8),
    Decode(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Empty => write!(f, "empty frame"),
            FrameError::UnknownMsgType(t) => write!(f, "unknown message type: 0x{:02x}", t),
            FrameError::UnknownResponseCode(c) => write!(f, "unknown response code: 0x{:02x}", c),
            FrameError::Decode(s) => write!(f, "decode error: {}", s),
        }
    }
}

impl std::error::Error for FrameError {}

pub fn encode_request<M: Message>(msg_type: MsgType, body: &M) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.encoded_len());
    out.push(msg_type as u8);
    out.extend_from_slice(&body.encode_to_vec());
    out
}

/// Split a request plaintext into its type and raw body.
pub fn decode_request(frame: &[u8]) -> Result<(MsgType, &[u8]), FrameError> {
    let (&tag, body) = frame.split_first().ok_or(FrameError::Empty)?;
    Ok((MsgType::try_from(tag)?, body))
}

pub fn encode_response<M: Message>(code: ResponseCode, body: Option<&M>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.map_or(0, |b| b.encoded_len()));
    out.push(code as u8);
    if let Some(body) = body {
        out.extend_from_slice(&body.encode_to_vec());
    }
    out
}

/// Error responses carry no body.
pub fn encode_error(code: ResponseCode) -> Vec<u8> {
    vec![code as u8]
}

pub fn decode_response(frame: &[u8]) -> Result<(ResponseCode, &[u8]), FrameError> {
    let (&tag, body) = frame.split_first().ok_or(FrameError::Empty)?;
    Ok((ResponseCode::try_from(tag)?, body))
}

/// Decode a prost body, mapping failures into [`FrameError::Decode`].
pub fn decode_body<M: Message + Default>(body: &[u8]) -> Result<M, FrameError> {
    M::decode(body).map_err(|e| FrameError::Decode(e.to_string()))
}
