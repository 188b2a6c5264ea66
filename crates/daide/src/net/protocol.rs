use std::fmt;

use crate::message::Message;
use crate::representation::Representation;
use crate::token::Token;

pub const PROTOCOL_VERSION: u16 = 1;
pub const PROTOCOL_MAGIC: u16 = 0xDA10;
pub const DEFAULT_PORT: u16 = 16713;
pub const HEADER_SIZE: usize = 4;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Initial = 0,
    Representation = 1,
    Diplomacy = 2,
    Final = 3,
    Error = 4,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initial),
            1 => Some(Self::Representation),
            2 => Some(Self::Diplomacy),
            3 => Some(Self::Final),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes carried by an Error Message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Timeout = 0x01,
    InitialNotFirst = 0x02,
    WrongEndian = 0x03,
    BadMagic = 0x04,
    UnsupportedVersion = 0x05,
    DuplicateInitial = 0x06,
    ServerInitial = 0x07,
    UnknownMessage = 0x08,
    LengthMismatch = 0x09,
    EarlyDiplomacy = 0x0A,
    RepresentationNotFirst = 0x0B,
    UnexpectedRepresentation = 0x0C,
    ClientRepresentation = 0x0D,
    ReservedToken = 0x0E,
}

impl ErrorCode {
    pub fn from_code(code: u16) -> Option<Self> {
        use ErrorCode::*;
        [
            Timeout,
            InitialNotFirst,
            WrongEndian,
            BadMagic,
            UnsupportedVersion,
            DuplicateInitial,
            ServerInitial,
            UnknownMessage,
            LengthMismatch,
            EarlyDiplomacy,
            RepresentationNotFirst,
            UnexpectedRepresentation,
            ClientRepresentation,
            ReservedToken,
        ]
        .into_iter()
        .find(|e| *e as u16 == code)
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timed out waiting for the first message",
            ErrorCode::InitialNotFirst => "first message was not an Initial Message",
            ErrorCode::WrongEndian => "wrong byte order",
            ErrorCode::BadMagic => "bad magic number",
            ErrorCode::UnsupportedVersion => "unsupported protocol version",
            ErrorCode::DuplicateInitial => "more than one Initial Message",
            ErrorCode::ServerInitial => "Initial Message sent by the server",
            ErrorCode::UnknownMessage => "unknown message type",
            ErrorCode::LengthMismatch => "message length mismatch",
            ErrorCode::EarlyDiplomacy => "Diplomacy Message sent before the representation",
            ErrorCode::RepresentationNotFirst => {
                "first message from the server was not a Representation Message"
            }
            ErrorCode::UnexpectedRepresentation => "unexpected Representation Message",
            ErrorCode::ClientRepresentation => "Representation Message sent by the client",
            ErrorCode::ReservedToken => "reserved token transmitted",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X} ({})", self.code(), self.description())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("protocol violation {0}")]
    Violation(ErrorCode),
    #[error("unknown error code {0:#06X}")]
    UnknownErrorCode(u16),
    #[error("token code {0:#06X} is not in the representation")]
    UnknownToken(u16),
    #[error("payload of {0} bytes does not fit in a frame")]
    TooLarge(usize),
}

impl From<ErrorCode> for FrameError {
    fn from(code: ErrorCode) -> Self {
        FrameError::Violation(code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: MessageType,
    pub length: u16,
}

impl FrameHeader {
    /// Validates a raw header before its payload is awaited.
    pub fn parse(bytes: [u8; HEADER_SIZE]) -> Result<Self, ErrorCode> {
        let kind = MessageType::from_u8(bytes[0]).ok_or(ErrorCode::UnknownMessage)?;
        let length = u16::from_be_bytes([bytes[2], bytes[3]]);
        let fits = match kind {
            MessageType::Initial => length == 4,
            MessageType::Representation => length as usize % 6 == 0,
            MessageType::Diplomacy => length != 0 && length % 2 == 0,
            MessageType::Final => length == 0,
            MessageType::Error => length == 2,
        };
        if !fits {
            if kind == MessageType::Initial && length.swap_bytes() == 4 {
                return Err(ErrorCode::WrongEndian);
            }
            return Err(ErrorCode::LengthMismatch);
        }
        Ok(Self { kind, length })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn initial() -> Self {
        let mut payload = PROTOCOL_VERSION.to_be_bytes().to_vec();
        payload.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        Self {
            kind: MessageType::Initial,
            payload,
        }
    }

    pub fn representation(rep: &Representation, null_rep: bool) -> Self {
        let payload = if null_rep && rep.is_standard() {
            Vec::new()
        } else {
            rep.encode_payload()
        };
        Self {
            kind: MessageType::Representation,
            payload,
        }
    }

    pub fn diplomacy(message: &Message) -> Self {
        let mut payload = Vec::with_capacity(message.len() * 2);
        for token in message {
            payload.extend_from_slice(&token.code().to_be_bytes());
        }
        Self {
            kind: MessageType::Diplomacy,
            payload,
        }
    }

    pub fn final_message() -> Self {
        Self {
            kind: MessageType::Final,
            payload: Vec::new(),
        }
    }

    pub fn error(code: ErrorCode) -> Self {
        Self {
            kind: MessageType::Error,
            payload: code.code().to_be_bytes().to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::TooLarge(self.payload.len()));
        }
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.push(self.kind as u8);
        bytes.push(0);
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Checks the version and magic number of an Initial Message.
    pub fn check_initial(&self) -> Result<(), ErrorCode> {
        let version = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let magic = u16::from_be_bytes([self.payload[2], self.payload[3]]);
        if magic == PROTOCOL_MAGIC.swap_bytes() && version == PROTOCOL_VERSION.swap_bytes() {
            return Err(ErrorCode::WrongEndian);
        }
        if magic != PROTOCOL_MAGIC {
            return Err(ErrorCode::BadMagic);
        }
        if version != PROTOCOL_VERSION {
            return Err(ErrorCode::UnsupportedVersion);
        }
        Ok(())
    }

    pub fn error_code(&self) -> Result<ErrorCode, FrameError> {
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        ErrorCode::from_code(code).ok_or(FrameError::UnknownErrorCode(code))
    }

    pub fn decode_message(&self, rep: &Representation) -> Result<Message, FrameError> {
        let mut tokens: Vec<Token> = Vec::with_capacity(self.payload.len() / 2);
        for pair in self.payload.chunks_exact(2) {
            let code = u16::from_be_bytes([pair[0], pair[1]]);
            if crate::token::Category::of(code) == crate::token::Category::Reserved {
                return Err(ErrorCode::ReservedToken.into());
            }
            tokens.push(rep.lookup_code(code).ok_or(FrameError::UnknownToken(code))?);
        }
        Ok(Message::from(tokens))
    }
}

/// Accumulates bytes from a non-blocking stream and splits them into frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
    header: Option<FrameHeader>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn has_partial(&self) -> bool {
        self.header.is_some() || !self.buffer.is_empty()
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, ErrorCode> {
        if self.header.is_none() {
            if self.buffer.len() < HEADER_SIZE {
                return Ok(None);
            }
            let mut raw = [0u8; HEADER_SIZE];
            raw.copy_from_slice(&self.buffer[..HEADER_SIZE]);
            self.buffer.drain(..HEADER_SIZE);
            self.header = Some(FrameHeader::parse(raw)?);
        }

        let Some(header) = self.header else {
            return Ok(None);
        };
        let length = header.length as usize;
        if self.buffer.len() < length {
            return Ok(None);
        }

        self.header = None;
        let payload: Vec<u8> = self.buffer.drain(..length).collect();
        Ok(Some(Frame {
            kind: header.kind,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{BRA, ENG, HLO, KET};

    fn read_all(bytes: &[u8]) -> Vec<Result<Frame, ErrorCode>> {
        let mut reader = FrameReader::new();
        reader.feed(bytes);
        let mut frames = Vec::new();
        loop {
            match reader.next_frame() {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                Err(code) => {
                    frames.push(Err(code));
                    break;
                }
            }
        }
        frames
    }

    #[test]
    fn test_initial_wire_format() {
        let bytes = Frame::initial().encode().unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 4, 0x00, 0x01, 0xDA, 0x10]);
        assert_eq!(Frame::final_message().encode().unwrap(), vec![3, 0, 0, 0]);
        assert_eq!(
            Frame::error(ErrorCode::Timeout).encode().unwrap(),
            vec![4, 0, 0, 2, 0, 1]
        );
    }

    #[test]
    fn test_initial_checks() {
        let good = Frame::initial();
        assert_eq!(good.check_initial(), Ok(()));

        let swapped = Frame {
            kind: MessageType::Initial,
            payload: vec![0x01, 0x00, 0x10, 0xDA],
        };
        assert_eq!(swapped.check_initial(), Err(ErrorCode::WrongEndian));

        let magic = Frame {
            kind: MessageType::Initial,
            payload: vec![0x00, 0x01, 0xBE, 0xEF],
        };
        assert_eq!(magic.check_initial(), Err(ErrorCode::BadMagic));

        let version = Frame {
            kind: MessageType::Initial,
            payload: vec![0x00, 0x07, 0xDA, 0x10],
        };
        assert_eq!(version.check_initial(), Err(ErrorCode::UnsupportedVersion));
    }

    #[test]
    fn test_header_length_checks() {
        assert_eq!(FrameHeader::parse([0, 0, 4, 0]), Err(ErrorCode::WrongEndian));
        assert_eq!(FrameHeader::parse([0, 0, 0, 6]), Err(ErrorCode::LengthMismatch));
        assert_eq!(FrameHeader::parse([2, 0, 0, 3]), Err(ErrorCode::LengthMismatch));
        assert_eq!(FrameHeader::parse([2, 0, 0, 0]), Err(ErrorCode::LengthMismatch));
        assert_eq!(FrameHeader::parse([3, 0, 0, 2]), Err(ErrorCode::LengthMismatch));
        assert_eq!(FrameHeader::parse([1, 0, 0, 5]), Err(ErrorCode::LengthMismatch));
        assert_eq!(FrameHeader::parse([9, 0, 0, 0]), Err(ErrorCode::UnknownMessage));
        assert!(FrameHeader::parse([1, 0, 0, 0]).is_ok());
    }

    #[test]
    fn test_reader_handles_split_frames() {
        let message = Message::from_tokens([HLO, BRA, ENG, KET]);
        let mut bytes = Frame::diplomacy(&message).encode().unwrap();
        bytes.extend(Frame::final_message().encode().unwrap());

        let mut reader = FrameReader::new();
        for chunk in bytes.chunks(3) {
            reader.feed(chunk);
        }
        let frame = reader.next_frame().unwrap().unwrap();
        assert_eq!(frame.kind, MessageType::Diplomacy);
        assert_eq!(
            frame.decode_message(Representation::standard()).unwrap(),
            message
        );
        assert_eq!(reader.next_frame().unwrap().unwrap().kind, MessageType::Final);
        assert!(!reader.has_partial());

        let mut reader = FrameReader::new();
        reader.feed(&bytes[..5]);
        assert!(reader.next_frame().unwrap().is_none());
        assert!(reader.has_partial());
    }

    #[test]
    fn test_diplomacy_decode_errors() {
        let frames = read_all(&[2, 0, 0, 2, 0x58, 0x00]);
        let frame = frames[0].clone().unwrap();
        assert_eq!(
            frame.decode_message(Representation::standard()),
            Err(FrameError::Violation(ErrorCode::ReservedToken))
        );

        let frames = read_all(&[2, 0, 0, 2, 0x4C, 0x00]);
        let frame = frames[0].clone().unwrap();
        assert_eq!(
            frame.decode_message(Representation::standard()),
            Err(FrameError::UnknownToken(0x4C00))
        );
    }

    #[test]
    fn test_null_representation() {
        let standard = Representation::standard();
        assert!(Frame::representation(standard, true).payload.is_empty());
        assert_eq!(Frame::representation(standard, false).payload.len(), 75 * 6);
    }
}
