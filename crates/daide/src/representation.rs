use std::collections::HashMap;
use std::sync::OnceLock;

use crate::token::{BASE_TOKENS, Category, STANDARD_PROVINCES, Token};

pub const ENTRY_SIZE: usize = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RepresentationError {
    #[error("representation payload length {0} is not a multiple of {ENTRY_SIZE}")]
    Length(usize),
    #[error("token name {0:?} is not three ASCII letters")]
    BadName([u8; 3]),
    #[error("code {code:#06X} is bound to both {first} and {second}")]
    DuplicateCode {
        code: u16,
        first: String,
        second: String,
    },
    #[error("name {name} is bound to both {first:#06X} and {second:#06X}")]
    DuplicateName { name: String, first: u16, second: u16 },
    #[error("code {0:#06X} cannot be redefined by a representation")]
    Literal(u16),
}

/// The name/code dictionary in force on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    by_code: HashMap<u16, Token>,
    by_name: HashMap<[u8; 3], Token>,
    custom: Vec<Token>,
}

impl Representation {
    pub fn base() -> Self {
        Self {
            by_code: BASE_TOKENS.iter().map(|t| (t.code(), *t)).collect(),
            by_name: BASE_TOKENS.iter().map(|t| (t.name_bytes(), *t)).collect(),
            custom: Vec::new(),
        }
    }

    /// The representation an empty Representation Message stands for.
    pub fn standard() -> &'static Representation {
        static STANDARD: OnceLock<Representation> = OnceLock::new();
        STANDARD.get_or_init(|| {
            Self::with_custom(STANDARD_PROVINCES.iter().copied())
                .unwrap_or_else(|_| Self::base())
        })
    }

    pub fn with_custom<I>(tokens: I) -> Result<Self, RepresentationError>
    where
        I: IntoIterator<Item = Token>,
    {
        let mut rep = Self::base();
        let mut seen_codes: HashMap<u16, Token> = HashMap::new();
        let mut seen_names: HashMap<[u8; 3], Token> = HashMap::new();

        for token in tokens {
            let name = token.name_bytes();
            if !name.iter().all(u8::is_ascii_alphanumeric) {
                return Err(RepresentationError::BadName(name));
            }
            if matches!(token.category(), Category::Number | Category::Text) {
                return Err(RepresentationError::Literal(token.code()));
            }
            if let Some(previous) = seen_codes.insert(token.code(), token) {
                return Err(RepresentationError::DuplicateCode {
                    code: token.code(),
                    first: previous.name().to_string(),
                    second: token.name().to_string(),
                });
            }
            if let Some(previous) = seen_names.insert(name, token) {
                return Err(RepresentationError::DuplicateName {
                    name: token.name().to_string(),
                    first: previous.code(),
                    second: token.code(),
                });
            }

            if let Some(shadowed) = rep.by_code.insert(token.code(), token) {
                rep.by_name.remove(&shadowed.name_bytes());
            }
            if let Some(shadowed) = rep.by_name.insert(name, token) {
                if shadowed.code() != token.code() {
                    rep.by_code.remove(&shadowed.code());
                }
            }
            rep.custom.push(token);
        }

        Ok(rep)
    }

    pub fn custom(&self) -> &[Token] {
        &self.custom
    }

    pub fn is_standard(&self) -> bool {
        self == Self::standard()
    }

    pub fn lookup_code(&self, code: u16) -> Option<Token> {
        Token::literal(code).or_else(|| self.by_code.get(&code).copied())
    }

    pub fn lookup_name(&self, name: &str) -> Option<Token> {
        let bytes: [u8; 3] = name.as_bytes().try_into().ok()?;
        self.by_name.get(&bytes.map(|b| b.to_ascii_uppercase())).copied()
    }

    pub fn contains(&self, token: &Token) -> bool {
        self.lookup_code(token.code()) == Some(*token)
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.custom.len() * ENTRY_SIZE);
        for token in &self.custom {
            payload.extend_from_slice(&token.code().to_be_bytes());
            payload.extend_from_slice(&token.name_bytes());
            payload.push(0);
        }
        payload
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, RepresentationError> {
        if payload.is_empty() {
            return Ok(Self::standard().clone());
        }
        if payload.len() % ENTRY_SIZE != 0 {
            return Err(RepresentationError::Length(payload.len()));
        }
        let tokens = payload.chunks_exact(ENTRY_SIZE).map(|entry| {
            let code = u16::from_be_bytes([entry[0], entry[1]]);
            Token::new(code, &[entry[2], entry[3], entry[4]])
        });
        Self::with_custom(tokens)
    }
}

impl Default for Representation {
    fn default() -> Self {
        Self::standard().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{ENG, HLO, LON, STP};

    #[test]
    fn test_standard_lookup() {
        let rep = Representation::standard();
        assert_eq!(rep.lookup_name("HLO"), Some(HLO));
        assert_eq!(rep.lookup_name("lon"), Some(LON));
        assert_eq!(rep.lookup_code(STP.code()), Some(STP));
        assert_eq!(rep.lookup_code(0x0005).and_then(|t| t.value()), Some(5));
        assert!(rep.lookup_name("QQQ").is_none());
        assert!(rep.is_standard());
    }

    #[test]
    fn test_payload_roundtrip() {
        let custom = [
            Token::new(0x5000, b"ABC"),
            Token::new(0x5501, b"DEF"),
            Token::new(0x4107, b"XXX"),
        ];
        let rep = Representation::with_custom(custom).unwrap();
        let payload = rep.encode_payload();
        assert_eq!(payload.len(), 18);
        assert_eq!(&payload[..6], &[0x50, 0x00, b'A', b'B', b'C', 0]);

        let decoded = Representation::decode_payload(&payload).unwrap();
        assert_eq!(decoded, rep);
        for token in custom {
            assert_eq!(decoded.lookup_name(token.name()), Some(token));
            assert_eq!(decoded.lookup_code(token.code()), Some(token));
        }
        assert!(!decoded.is_standard());
    }

    #[test]
    fn test_empty_payload_is_standard() {
        let rep = Representation::decode_payload(&[]).unwrap();
        assert!(rep.is_standard());
        assert_eq!(rep.encode_payload().len(), STANDARD_PROVINCES.len() * ENTRY_SIZE);
    }

    #[test]
    fn test_rejects_non_bijective() {
        let err = Representation::with_custom([
            Token::new(0x5000, b"ABC"),
            Token::new(0x5001, b"ABC"),
        ])
        .unwrap_err();
        assert!(matches!(err, RepresentationError::DuplicateName { .. }));

        let err = Representation::with_custom([
            Token::new(0x5000, b"ABC"),
            Token::new(0x5000, b"DEF"),
        ])
        .unwrap_err();
        assert!(matches!(err, RepresentationError::DuplicateCode { .. }));

        assert_eq!(
            Representation::decode_payload(&[0; 7]).unwrap_err(),
            RepresentationError::Length(7)
        );
    }

    #[test]
    fn test_custom_overrides_base_name() {
        let rep = Representation::with_custom([Token::new(0x4150, b"ENG")]).unwrap();
        assert_eq!(rep.lookup_name("ENG").map(|t| t.code()), Some(0x4150));
        assert!(rep.lookup_code(ENG.code()).is_none());
    }
}
