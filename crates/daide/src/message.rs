use std::fmt;
use std::ops::Index;

use crate::representation::Representation;
use crate::token::{BRA, Category, ERR, KET, Token};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown token {0:?}")]
    UnknownToken(String),
    #[error("number {0} is out of range")]
    NumberRange(String),
    #[error("unterminated text literal")]
    UnterminatedText,
    #[error("text literal contains non-ASCII character {0:?}")]
    NonAscii(char),
}

/// A flat sequence of tokens; nesting is expressed with explicit `BRA`/`KET`.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Message(Vec<Token>);

impl Message {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_tokens(tokens: impl IntoIterator<Item = Token>) -> Self {
        Self(tokens.into_iter().collect())
    }

    /// `( tokens )` as a standalone message.
    pub fn wrapped(tokens: impl IntoIterator<Item = Token>) -> Self {
        let mut message = Self(vec![BRA]);
        message.0.extend(tokens);
        message.0.push(KET);
        message
    }

    pub fn text(text: &str) -> Self {
        Self(text.bytes().map(Token::character).collect())
    }

    pub fn number(value: i16) -> Option<Self> {
        Token::number(value).map(|t| Self(vec![t]))
    }

    pub fn tokens(&self) -> &[Token] {
        &self.0
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<Token> {
        self.0.first().copied()
    }

    pub fn push(&mut self, token: Token) {
        self.0.push(token);
    }

    pub fn extend(&mut self, tokens: impl IntoIterator<Item = Token>) {
        self.0.extend(tokens);
    }

    /// Appends `( other )`.
    pub fn push_group(&mut self, other: &Message) {
        self.0.push(BRA);
        self.0.extend_from_slice(&other.0);
        self.0.push(KET);
    }

    pub fn wrap(&self) -> Message {
        Self::wrapped(self.0.iter().copied())
    }

    pub fn is_balanced(&self) -> bool {
        let mut depth = 0usize;
        for token in &self.0 {
            if *token == BRA {
                depth += 1;
            } else if *token == KET {
                match depth.checked_sub(1) {
                    Some(d) => depth = d,
                    None => return false,
                }
            }
        }
        depth == 0
    }

    pub fn first_reserved(&self) -> Option<(usize, Token)> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, t)| t.is_reserved())
            .map(|(i, t)| (i, *t))
    }

    /// Copy of the message with `ERR` spliced in before `index`.
    pub fn insert_error(&self, index: usize) -> Message {
        let mut tokens = self.0.clone();
        tokens.insert(index.min(tokens.len()), ERR);
        Self(tokens)
    }

    /// Index of the `KET` matching the `BRA` at `open`, if any.
    pub fn matching_ket(tokens: &[Token], open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (i, token) in tokens.iter().enumerate().skip(open) {
            if *token == BRA {
                depth += 1;
            } else if *token == KET {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
        None
    }

    /// The top-level groups of the message as sub-messages, brackets removed.
    /// Bare tokens at the top level each form a one-token group.
    pub fn fold(&self) -> Vec<Message> {
        let mut groups = Vec::new();
        let mut i = 0;
        while i < self.0.len() {
            if self.0[i] == BRA {
                let end = Self::matching_ket(&self.0, i).unwrap_or(self.0.len());
                groups.push(Self(self.0[i + 1..end.min(self.0.len())].to_vec()));
                i = end + 1;
            } else {
                groups.push(Self(vec![self.0[i]]));
                i += 1;
            }
        }
        groups
    }

    /// Decodes a run of text tokens back into a string.
    pub fn as_text(&self) -> Option<String> {
        self.0
            .iter()
            .map(|t| t.as_char().map(char::from))
            .collect()
    }

    /// Parses the human-readable notation, e.g. `NME ( 'bot' ) ( 'v1' )`.
    pub fn parse(text: &str, rep: &Representation) -> Result<Self, MessageError> {
        let mut tokens = Vec::new();
        let mut chars = text.chars().peekable();

        while let Some(&c) = chars.peek() {
            match c {
                c if c.is_whitespace() => {
                    chars.next();
                }
                '(' => {
                    chars.next();
                    tokens.push(BRA);
                }
                ')' => {
                    chars.next();
                    tokens.push(KET);
                }
                '\'' => {
                    chars.next();
                    loop {
                        match chars.next() {
                            Some('\'') if chars.peek() == Some(&'\'') => {
                                chars.next();
                                tokens.push(Token::character(b'\''));
                            }
                            Some('\'') => break,
                            Some(ch) if ch.is_ascii() => tokens.push(Token::character(ch as u8)),
                            Some(ch) => return Err(MessageError::NonAscii(ch)),
                            None => return Err(MessageError::UnterminatedText),
                        }
                    }
                }
                _ => {
                    let mut word = String::new();
                    while let Some(&ch) = chars.peek() {
                        if ch.is_whitespace() || matches!(ch, '(' | ')' | '\'') {
                            break;
                        }
                        word.push(ch);
                        chars.next();
                    }
                    tokens.push(parse_word(&word, rep)?);
                }
            }
        }

        Ok(Self(tokens))
    }
}

fn parse_word(word: &str, rep: &Representation) -> Result<Token, MessageError> {
    let numeric = word
        .strip_prefix('-')
        .unwrap_or(word)
        .chars()
        .all(|c| c.is_ascii_digit());
    if numeric && !word.is_empty() && word != "-" {
        return word
            .parse::<i16>()
            .ok()
            .and_then(Token::number)
            .ok_or_else(|| MessageError::NumberRange(word.to_string()));
    }
    rep.lookup_name(word)
        .ok_or_else(|| MessageError::UnknownToken(word.to_string()))
}

impl Index<usize> for Message {
    type Output = Token;

    fn index(&self, index: usize) -> &Token {
        &self.0[index]
    }
}

impl From<Vec<Token>> for Message {
    fn from(tokens: Vec<Token>) -> Self {
        Self(tokens)
    }
}

impl<'a> IntoIterator for &'a Message {
    type Item = &'a Token;
    type IntoIter = std::slice::Iter<'a, Token>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut in_text = false;
        for token in &self.0 {
            if token.category() == Category::Text {
                if !in_text {
                    if !first {
                        f.write_str(" ")?;
                    }
                    f.write_str("'")?;
                    in_text = true;
                }
                match token.as_char() {
                    Some(b'\'') => f.write_str("''")?,
                    Some(c) => write!(f, "{}", c as char)?,
                    None => {}
                }
            } else {
                if in_text {
                    f.write_str("'")?;
                    in_text = false;
                }
                if !first {
                    f.write_str(" ")?;
                }
                write!(f, "{}", token)?;
            }
            first = false;
        }
        if in_text {
            f.write_str("'")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{ENG, HLO, NME, YES};

    #[test]
    fn test_parse_and_display() {
        let rep = Representation::standard();
        let message = Message::parse("NME ( 'Bot''s' ) ( 'v1' )", rep).unwrap();
        assert_eq!(message.first(), Some(NME));
        assert_eq!(message.len(), 12);
        assert_eq!(message.to_string(), "NME ( 'Bot''s' ) ( 'v1' )");

        let message = Message::parse("HLO (ENG) (-5) ((LVL 10))", rep).unwrap();
        assert_eq!(message[0], HLO);
        assert_eq!(message[2], ENG);
        assert_eq!(message[5].value(), Some(-5));
        assert_eq!(message.to_string(), "HLO ( ENG ) ( -5 ) ( ( LVL 10 ) )");
    }

    #[test]
    fn test_parse_errors() {
        let rep = Representation::standard();
        assert_eq!(
            Message::parse("NME ( 'open", rep).unwrap_err(),
            MessageError::UnterminatedText
        );
        assert_eq!(
            Message::parse("QQQ", rep).unwrap_err(),
            MessageError::UnknownToken("QQQ".into())
        );
        assert!(matches!(
            Message::parse("9000", rep).unwrap_err(),
            MessageError::NumberRange(_)
        ));
    }

    #[test]
    fn test_balance_and_groups() {
        let rep = Representation::standard();
        let message = Message::parse("YES ( NME ( 'a' ) ( 'b' ) )", rep).unwrap();
        assert!(message.is_balanced());
        assert_eq!(Message::matching_ket(message.tokens(), 1), Some(message.len() - 1));

        let groups = message.fold();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].first(), Some(YES));
        assert_eq!(groups[1].fold().len(), 3);

        let unbalanced = Message::parse("YES ( NME", rep).unwrap();
        assert!(!unbalanced.is_balanced());
        assert!(!Message::parse(") (", rep).unwrap().is_balanced());
    }

    #[test]
    fn test_insert_error_and_text() {
        let message = Message::from_tokens([NME, BRA, KET]);
        let marked = message.insert_error(1);
        assert_eq!(marked.tokens(), &[NME, ERR, BRA, KET]);
        assert_eq!(message.insert_error(99).tokens().last(), Some(&ERR));
        assert_eq!(Message::text("abc").as_text().as_deref(), Some("abc"));
        assert!(Message::from_tokens([NME]).as_text().is_none());
    }
}
