mod grammar;
mod levels;

use std::path::Path;

use crate::message::Message;
use crate::options::Options;
use crate::token::{BRA, ERR, HUH, KET, PRN, Token};

pub use grammar::{Alternative, CategoryMatch, Grammar, GrammarError, Item};
pub use levels::SyntaxLevels;

const STANDARD_SYNTAX: &str = include_str!("../../data/syntax.txt");
const MAX_DEPTH: usize = 256;

/// How far a rule matched from a starting index.
///
/// `end` is where a valid match stopped or where an invalid one failed;
/// `furthest` is the deepest failure seen on the way, which pinpoints the
/// error when an optional part gave up early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub valid: bool,
    pub end: usize,
    pub furthest: usize,
}

impl Match {
    fn valid(end: usize, furthest: usize) -> Self {
        Self {
            valid: true,
            end,
            furthest: furthest.max(end),
        }
    }

    fn invalid(end: usize) -> Self {
        Self {
            valid: false,
            end,
            furthest: end,
        }
    }

    fn better_than(&self, other: &Match) -> bool {
        (self.valid, self.end) > (other.valid, other.end)
    }

    /// Index of the first token the rule could not account for.
    pub fn error_index(&self) -> usize {
        self.end.max(self.furthest)
    }
}

/// Checks messages against the DAIDE grammar for a connection's syntax level.
#[derive(Debug, Clone)]
pub struct Validator {
    grammar: Grammar,
}

impl Validator {
    pub fn from_syntax(text: &str) -> Result<Self, GrammarError> {
        let grammar = Grammar::parse(text)?;
        log::debug!(
            "loaded {} rules over {} syntax levels",
            grammar.rules.len(),
            grammar.levels.levels().len()
        );
        Ok(Self { grammar })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GrammarError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::info!("reading syntax from {}", path.as_ref().display());
        Self::from_syntax(&text)
    }

    /// The grammar shipped with the crate.
    pub fn standard() -> Result<Self, GrammarError> {
        Self::from_syntax(STANDARD_SYNTAX)
    }

    pub fn from_options(options: &Options) -> Result<Self, GrammarError> {
        match &options.syntax_file {
            Some(path) => Self::load(path),
            None => Self::standard(),
        }
    }

    pub fn levels(&self) -> &SyntaxLevels {
        &self.grammar.levels
    }

    pub fn has_rule(&self, rule: &str) -> bool {
        self.grammar.rules.contains_key(rule)
    }

    /// Returns `None` for a valid message, otherwise the diagnostic to send
    /// back: `PRN ( … )` for unbalanced brackets, `HUH ( … ERR … )` with the
    /// marker at the first offending token for everything else.
    pub fn validate(&self, message: &Message, rule: &str, level: i32) -> Option<Message> {
        if let Some((index, _)) = message.first_reserved() {
            return Some(Self::huh(&message.insert_error(index)));
        }
        if !message.is_balanced() {
            let mut reply = Message::from_tokens([PRN]);
            reply.push_group(message);
            return Some(reply);
        }

        let tokens = message.tokens();
        let found = self.validate_expression(tokens, 0, rule, level);
        if found.valid && found.end == tokens.len() {
            return None;
        }
        let index = found.error_index().min(tokens.len());
        let marked = message.insert_error(index);
        Some(Self::huh(&self.trim(&marked, level)))
    }

    fn huh(content: &Message) -> Message {
        let mut reply = Message::from_tokens([HUH]);
        reply.push_group(content);
        reply
    }

    /// Best match of `rule` starting at `start` among the alternatives
    /// visible at `level`.
    pub fn validate_expression(&self, tokens: &[Token], start: usize, rule: &str, level: i32) -> Match {
        self.expression(tokens, start, rule, level, 0)
    }

    /// Matches one alternative's items starting at `start`.
    pub fn validate_option(&self, tokens: &[Token], start: usize, items: &[Item], level: i32) -> Match {
        self.option(tokens, start, items, level, 0)
    }

    fn expression(&self, tokens: &[Token], start: usize, rule: &str, level: i32, depth: usize) -> Match {
        let Some(alternatives) = self.grammar.rules.get(rule) else {
            log::warn!("no such rule {}", rule);
            return Match::invalid(start);
        };
        if depth > MAX_DEPTH {
            return Match::invalid(start);
        }

        let mut best: Option<Match> = None;
        let mut furthest = start;
        for alternative in alternatives.iter().filter(|a| a.visible_at(level)) {
            let found = self.option(tokens, start, &alternative.items, level, depth + 1);
            furthest = furthest.max(found.end).max(found.furthest);
            if best.is_none_or(|b| found.better_than(&b)) {
                best = Some(found);
            }
        }
        // A losing alternative may have got further than the winner.
        match best {
            Some(found) => Match {
                furthest: found.furthest.max(furthest),
                ..found
            },
            None => Match::invalid(start),
        }
    }

    fn option(&self, tokens: &[Token], start: usize, items: &[Item], level: i32, depth: usize) -> Match {
        let mut pos = start;
        let mut furthest = start;
        let mut repeat = false;
        let mut fallback: Option<usize> = None;

        let fail = |at: usize, furthest: usize, fallback: Option<usize>| match fallback {
            Some(resume) => Match::valid(resume, furthest.max(at)),
            None => Match::invalid(at.max(furthest)),
        };

        for item in items {
            match item {
                Item::Repeat => {
                    repeat = true;
                    continue;
                }
                Item::Optional => {
                    fallback = Some(pos);
                }
                Item::Token(_) | Item::Category(_) => {
                    let accepts = |token: &Token| match item {
                        Item::Token(expected) => token == expected,
                        Item::Category(category) => category.matches(token),
                        _ => false,
                    };
                    if repeat {
                        while tokens.get(pos).is_some_and(accepts) {
                            pos += 1;
                        }
                    } else if tokens.get(pos).is_some_and(accepts) {
                        pos += 1;
                    } else {
                        return fail(pos, furthest, fallback);
                    }
                }
                Item::Rule(name) => {
                    if repeat {
                        loop {
                            let found = self.expression(tokens, pos, name, level, depth + 1);
                            if found.valid && found.end > pos {
                                pos = found.end;
                                furthest = furthest.max(found.furthest);
                            } else {
                                if !found.valid && found.end > pos {
                                    furthest = furthest.max(found.end);
                                }
                                break;
                            }
                        }
                    } else {
                        let found = self.expression(tokens, pos, name, level, depth + 1);
                        furthest = furthest.max(found.furthest);
                        if !found.valid {
                            return fail(found.end, furthest, fallback);
                        }
                        pos = found.end;
                    }
                }
                Item::Wrapped(name) => {
                    if repeat {
                        while tokens.get(pos) == Some(&BRA) {
                            let found = self.wrapped(tokens, pos, name, level, depth + 1);
                            if !found.valid {
                                furthest = furthest.max(found.end);
                                break;
                            }
                            pos = found.end;
                        }
                    } else {
                        let found = self.wrapped(tokens, pos, name, level, depth + 1);
                        if !found.valid {
                            return fail(found.end, furthest, fallback);
                        }
                        pos = found.end;
                    }
                }
            }
            repeat = false;
        }
        Match::valid(pos, furthest)
    }

    /// `( rule )` at `open`: the bracketed contents must match the rule
    /// completely.
    fn wrapped(&self, tokens: &[Token], open: usize, rule: &str, level: i32, depth: usize) -> Match {
        if tokens.get(open) != Some(&BRA) {
            return Match::invalid(open);
        }
        let Some(close) = Message::matching_ket(tokens, open) else {
            return Match::invalid(open);
        };
        let inner = self.expression(&tokens[..close], open + 1, rule, level, depth);
        if inner.valid && inner.end == close {
            Match::valid(close + 1, open)
        } else {
            Match::invalid(inner.error_index().min(close))
        }
    }

    /// Removes groups led by syntax the peer's level does not include,
    /// keeping any group that holds the error marker.
    pub fn trim(&self, message: &Message, level: i32) -> Message {
        let hidden: Vec<Token> = self
            .grammar
            .trims
            .iter()
            .filter(|(min, _)| level < *min)
            .map(|(_, token)| *token)
            .collect();
        if hidden.is_empty() {
            return message.clone();
        }

        let tokens = message.tokens();
        let mut kept = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            if tokens[i] == BRA && tokens.get(i + 1).is_some_and(|t| hidden.contains(t)) {
                if let Some(close) = Message::matching_ket(tokens, i) {
                    if !tokens[i..=close].contains(&ERR) {
                        i = close + 1;
                        continue;
                    }
                }
            }
            kept.push(tokens[i]);
            i += 1;
        }
        Message::from(kept)
    }
}

/// True when `message` is a `HUH`/`PRN` diagnostic rather than a request.
pub fn is_diagnostic(message: &Message) -> bool {
    matches!(message.first(), Some(t) if t == HUH || t == PRN)
        && message.tokens().get(1) == Some(&BRA)
        && message.tokens().last() == Some(&KET)
}
