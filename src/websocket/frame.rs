//! RFC 6455 framing: frame codec plus message reassembly.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key, if MASK set  |          Payload Data         |
//! +-------------------------------+ - - - - - - - - - - - - - - - +
//! ```

use crate::error::Error;

use thiserror::Error;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Which end of the connection a codec serves.
///
/// Clients mask every frame they send; servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Close status codes with a defined meaning.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Reported locally when the peer's close frame carried no code.
    pub const NO_STATUS: u16 = 1005;
    /// Reported locally when the connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether `code` may appear in a close frame on the wire.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid opcode 0x{0:X}")]
    InvalidOpcode(u8),

    #[error("reserved bits set without a negotiated extension")]
    ReservedBitsSet,

    #[error("client frames must be masked")]
    UnmaskedClientFrame,

    #[error("server frames must not be masked")]
    MaskedServerFrame,

    #[error("control frames cannot be fragmented")]
    FragmentedControlFrame,

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(usize),

    #[error("message of {size} bytes exceeds the limit of {max}")]
    MessageTooLarge { size: u64, max: usize },

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame before the previous message finished")]
    InterleavedMessage,

    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid close frame payload")]
    InvalidClosePayload,
}

impl FrameError {
    /// The close code answering this violation.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::MessageTooLarge { .. } => close_code::MESSAGE_TOO_BIG,
            FrameError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        Error::protocol(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// A close frame; the reason is truncated to fit a control frame.
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let mut payload = Vec::new();
        if let Some(code) = code {
            payload.extend_from_slice(&code.to_be_bytes());
            let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            payload.extend_from_slice(&reason.as_bytes()[..end]);
        }
        Self::new(Opcode::Close, payload)
    }

    /// Serializes the frame, masking the payload with `mask` if given.
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);

        let fin = if self.fin { 0x80 } else { 0 };
        out.push(fin | self.opcode as u8);

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        if len <= MAX_CONTROL_PAYLOAD {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }
        out
    }
}

pub(crate) fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Incremental frame decoder over a growing byte buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    role: Role,
    max_payload: usize,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self {
            role,
            max_payload,
            buf: Vec::new(),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let buf = &self.buf;
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0x80 != 0;
        if buf[0] & 0x70 != 0 {
            return Err(FrameError::ReservedBitsSet);
        }
        let opcode = Opcode::from_u8(buf[0] & 0x0F)?;
        let masked = buf[1] & 0x80 != 0;

        match self.role {
            Role::Server if !masked => return Err(FrameError::UnmaskedClientFrame),
            Role::Client if masked => return Err(FrameError::MaskedServerFrame),
            _ => {}
        }

        let short_len = (buf[1] & 0x7F) as usize;
        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if short_len > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlFrameTooLarge(short_len));
            }
        }

        let (payload_len, mut offset) = match short_len {
            126 => {
                let Some(bytes) = buf.get(2..4) else {
                    return Ok(None);
                };
                (u64::from(u16::from_be_bytes([bytes[0], bytes[1]])), 4)
            }
            127 => {
                let Some(bytes) = buf.get(2..10) else {
                    return Ok(None);
                };
                let mut be = [0u8; 8];
                be.copy_from_slice(bytes);
                (u64::from_be_bytes(be), 10)
            }
            len => (len as u64, 2),
        };

        if payload_len > self.max_payload as u64 {
            return Err(FrameError::MessageTooLarge {
                size: payload_len,
                max: self.max_payload,
            });
        }
        let payload_len = payload_len as usize;

        let mask = if masked {
            let Some(bytes) = buf.get(offset..offset + 4) else {
                return Ok(None);
            };
            offset += 4;
            Some([bytes[0], bytes[1], bytes[2], bytes[3]])
        } else {
            None
        };

        if buf.len() < offset + payload_len {
            return Ok(None);
        }

        let mut payload: Vec<u8> = self.buf.drain(..offset + payload_len).skip(offset).collect();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

/// A complete message after reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Status code, if present, and reason.
    Close(Option<u16>, String),
}

/// Decodes frames and joins fragmented data messages.
///
/// Control frames may arrive between the fragments of a data message and
/// are returned as soon as they are complete.
#[derive(Debug)]
pub struct MessageReader {
    decoder: FrameDecoder,
    max_message: usize,
    partial: Option<(Opcode, Vec<u8>)>,
}

impl MessageReader {
    pub fn new(role: Role, max_message: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(role, max_message),
            max_message,
            partial: None,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.decoder.extend(data);
    }

    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        while let Some(frame) = self.decoder.next_frame()? {
            match frame.opcode {
                Opcode::Ping => return Ok(Some(Message::Ping(frame.payload))),
                Opcode::Pong => return Ok(Some(Message::Pong(frame.payload))),
                Opcode::Close => return parse_close(&frame.payload).map(Some),
                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        return Err(FrameError::InterleavedMessage);
                    }
                    if frame.fin {
                        return complete(frame.opcode, frame.payload).map(Some);
                    }
                    self.partial = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let Some((opcode, mut data)) = self.partial.take() else {
                        return Err(FrameError::UnexpectedContinuation);
                    };
                    let size = data.len() + frame.payload.len();
                    if size > self.max_message {
                        return Err(FrameError::MessageTooLarge {
                            size: size as u64,
                            max: self.max_message,
                        });
                    }
                    data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return complete(opcode, data).map(Some);
                    }
                    self.partial = Some((opcode, data));
                }
            }
        }
        Ok(None)
    }
}

fn complete(opcode: Opcode, data: Vec<u8>) -> Result<Message, FrameError> {
    if opcode == Opcode::Text {
        String::from_utf8(data)
            .map(Message::Text)
            .map_err(|_| FrameError::InvalidUtf8)
    } else {
        Ok(Message::Binary(data))
    }
}

fn parse_close(payload: &[u8]) -> Result<Message, FrameError> {
    match payload {
        [] => Ok(Message::Close(None, String::new())),
        [_] => Err(FrameError::InvalidClosePayload),
        [hi, lo, reason @ ..] => {
            let code = u16::from_be_bytes([*hi, *lo]);
            if !close_code::is_sendable(code) {
                return Err(FrameError::InvalidClosePayload);
            }
            let reason = std::str::from_utf8(reason).map_err(|_| FrameError::InvalidUtf8)?;
            Ok(Message::Close(Some(code), reason.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn decodes_rfc_masked_hello() {
        // RFC 6455 section 5.7, masked text frame from a client.
        let wire = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        assert_eq!(Frame::new(Opcode::Text, "Hello").encode(Some(KEY)), wire);

        let mut reader = MessageReader::new(Role::Server, 1024);
        reader.extend(&wire[..4]);
        assert_eq!(reader.next_message().unwrap(), None);
        reader.extend(&wire[4..]);
        assert_eq!(reader.next_message().unwrap(), Some(Message::Text("Hello".into())));
    }

    #[test]
    fn uses_extended_lengths() {
        let medium = Frame::new(Opcode::Binary, vec![7u8; 300]).encode(None);
        assert_eq!(&medium[..4], &[0x82, 126, 0x01, 0x2c]);

        let large = Frame::new(Opcode::Binary, vec![1u8; 70_000]).encode(None);
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &70_000u64.to_be_bytes());

        let mut decoder = FrameDecoder::new(Role::Client, 100_000);
        decoder.extend(&large);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn reassembles_fragments_around_control_frames() {
        let mut first = Frame::new(Opcode::Text, "Hel");
        first.fin = false;
        let ping = Frame::new(Opcode::Ping, "p");
        let last = Frame::new(Opcode::Continuation, "lo");

        let mut reader = MessageReader::new(Role::Server, 1024);
        for frame in [&first, &ping, &last] {
            reader.extend(&frame.encode(Some(KEY)));
        }

        assert_eq!(reader.next_message().unwrap(), Some(Message::Ping(b"p".to_vec())));
        assert_eq!(reader.next_message().unwrap(), Some(Message::Text("Hello".into())));
        assert_eq!(reader.next_message().unwrap(), None);
    }

    #[test]
    fn enforces_masking_by_role() {
        let mut server = FrameDecoder::new(Role::Server, 1024);
        server.extend(&Frame::new(Opcode::Text, "x").encode(None));
        assert_eq!(server.next_frame(), Err(FrameError::UnmaskedClientFrame));

        let mut client = FrameDecoder::new(Role::Client, 1024);
        client.extend(&Frame::new(Opcode::Text, "x").encode(Some(KEY)));
        assert_eq!(client.next_frame(), Err(FrameError::MaskedServerFrame));
    }

    #[test]
    fn rejects_oversized_and_fragmented_control_frames() {
        let mut decoder = FrameDecoder::new(Role::Client, 16);
        decoder.extend(&Frame::new(Opcode::Binary, vec![0u8; 17]).encode(None));
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::MessageTooLarge { size: 17, max: 16 })
        ));

        let mut ping = Frame::new(Opcode::Ping, "");
        ping.fin = false;
        let mut decoder = FrameDecoder::new(Role::Client, 16);
        decoder.extend(&ping.encode(None));
        assert_eq!(decoder.next_frame(), Err(FrameError::FragmentedControlFrame));
    }

    #[test]
    fn parses_close_payloads() {
        let mut reader = MessageReader::new(Role::Client, 1024);
        reader.extend(&Frame::close(Some(close_code::GOING_AWAY), "bye").encode(None));
        reader.extend(&Frame::close(None, "ignored").encode(None));
        assert_eq!(
            reader.next_message().unwrap(),
            Some(Message::Close(Some(1001), "bye".into()))
        );
        assert_eq!(reader.next_message().unwrap(), Some(Message::Close(None, String::new())));

        let mut reader = MessageReader::new(Role::Client, 1024);
        reader.extend(&Frame::new(Opcode::Close, 1005u16.to_be_bytes().to_vec()).encode(None));
        assert_eq!(reader.next_message(), Err(FrameError::InvalidClosePayload));
    }

    #[test]
    fn continuation_without_start_is_rejected() {
        let mut reader = MessageReader::new(Role::Client, 1024);
        reader.extend(&Frame::new(Opcode::Continuation, "x").encode(None));
        assert_eq!(reader.next_message(), Err(FrameError::UnexpectedContinuation));
    }
}
