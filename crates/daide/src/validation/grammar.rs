use std::collections::HashMap;

use crate::representation::Representation;
use crate::token::{Category, Token};
use crate::validation::levels::SyntaxLevels;

#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: unknown token {name}")]
    UnknownToken { line: usize, name: String },
    #[error("line {line}: unknown category %{name}")]
    UnknownCategory { line: usize, name: String },
    #[error("rule {0} is referenced but never defined")]
    UndefinedRule(String),
    #[error("failed to read syntax file: {0}")]
    Io(#[from] std::io::Error),
}

/// Token class a `%name` placeholder stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryMatch {
    Is(Category),
    /// Anything except brackets.
    Any,
}

impl CategoryMatch {
    fn named(name: &str) -> Option<Self> {
        let category = match name {
            "any" => return Some(CategoryMatch::Any),
            "number" => Category::Number,
            "power" => Category::Power,
            "unit_type" => Category::UnitType,
            "order" => Category::Order,
            "order_note" => Category::OrderNote,
            "result" => Category::Result,
            "coast" => Category::Coast,
            "phase" => Category::Phase,
            "command" => Category::Command,
            "parameter" => Category::Parameter,
            "press" => Category::Press,
            "text" => Category::Text,
            "province" => Category::Province,
            _ => return None,
        };
        Some(CategoryMatch::Is(category))
    }

    pub fn matches(&self, token: &Token) -> bool {
        match self {
            CategoryMatch::Is(category) => token.category() == *category,
            CategoryMatch::Any => token.category() != Category::Bracket,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Token(Token),
    Category(CategoryMatch),
    Rule(String),
    /// `( rule )`: a bracketed group whose contents must match the rule exactly.
    Wrapped(String),
    /// The next item may occur any number of times.
    Repeat,
    /// Everything after this point may be missing.
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alternative {
    pub level: i32,
    pub items: Vec<Item>,
}

impl Alternative {
    /// Positive levels are minimums; negative ones restrict the alternative
    /// to connections strictly below the magnitude.
    pub fn visible_at(&self, level: i32) -> bool {
        if self.level >= 0 {
            level >= self.level
        } else {
            level < -self.level
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Grammar {
    pub rules: HashMap<String, Vec<Alternative>>,
    pub levels: SyntaxLevels,
    pub trims: Vec<(i32, Token)>,
}

impl Grammar {
    pub fn parse(text: &str) -> Result<Self, GrammarError> {
        let mut grammar = Grammar::default();
        let mut levels = Vec::new();
        let mut levels_valid = true;
        let mut synthetic = 0usize;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.trim();
            if content.is_empty() || content.starts_with('#') {
                continue;
            }

            if let Some(rest) = content.strip_prefix("level ") {
                match parse_level(rest) {
                    Some(level) => levels.push(level),
                    None => {
                        log::warn!("line {}: unreadable level declaration {:?}", line, content);
                        levels_valid = false;
                    }
                }
                continue;
            }

            if let Some(rest) = content.strip_prefix("trim ") {
                let mut words = rest.split_whitespace();
                let level = words.next().and_then(|w| w.parse::<i32>().ok());
                let (Some(level), Some(name), None) = (level, words.next(), words.next()) else {
                    return Err(GrammarError::Syntax {
                        line,
                        message: "expected `trim <level> <TOKEN>`".into(),
                    });
                };
                let token = lookup_token(name, line)?;
                grammar.trims.push((level, token));
                continue;
            }

            let (head, pattern) = content.split_once('=').ok_or_else(|| GrammarError::Syntax {
                line,
                message: "expected `<rule> [@<level>] = <pattern>`".into(),
            })?;
            let (name, level) = parse_head(head, line)?;
            let lexemes = lex(pattern);
            let mut parser = PatternParser {
                lexemes: &lexemes,
                pos: 0,
                line,
                rule: &name,
                grammar: &mut grammar,
                synthetic: &mut synthetic,
            };
            let items = parser.sequence(None)?;
            grammar
                .rules
                .entry(name)
                .or_default()
                .push(Alternative { level, items });
        }

        grammar.levels = if levels_valid && !levels.is_empty() {
            SyntaxLevels::new(levels)
        } else {
            log::warn!("syntax levels unavailable, using the default ladder");
            SyntaxLevels::fallback()
        };
        grammar.check_references()?;
        Ok(grammar)
    }

    fn check_references(&self) -> Result<(), GrammarError> {
        for alternatives in self.rules.values() {
            for item in alternatives.iter().flat_map(|a| &a.items) {
                if let Item::Rule(name) | Item::Wrapped(name) = item {
                    if !self.rules.contains_key(name) {
                        return Err(GrammarError::UndefinedRule(name.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_level(rest: &str) -> Option<(i32, String)> {
    let (number, name) = rest.trim().split_once(char::is_whitespace)?;
    let name = name.trim().strip_prefix('"')?.strip_suffix('"')?;
    Some((number.parse().ok()?, name.to_string()))
}

fn parse_head(head: &str, line: usize) -> Result<(String, i32), GrammarError> {
    let mut words = head.split_whitespace();
    let name = words.next().unwrap_or_default();
    if !is_rule_name(name) {
        return Err(GrammarError::Syntax {
            line,
            message: format!("bad rule name {:?}", name),
        });
    }
    let level = match words.next() {
        None => 0,
        Some(word) => word
            .strip_prefix('@')
            .and_then(|n| n.parse::<i32>().ok())
            .ok_or_else(|| GrammarError::Syntax {
                line,
                message: format!("bad level tag {:?}", word),
            })?,
    };
    if let Some(extra) = words.next() {
        return Err(GrammarError::Syntax {
            line,
            message: format!("unexpected {:?} before `=`", extra),
        });
    }
    Ok((name.to_string(), level))
}

fn is_rule_name(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn lookup_token(name: &str, line: usize) -> Result<Token, GrammarError> {
    Representation::standard()
        .lookup_name(name)
        .filter(|_| name.chars().all(|c| c.is_ascii_uppercase()))
        .ok_or_else(|| GrammarError::UnknownToken {
            line,
            name: name.to_string(),
        })
}

fn lex(pattern: &str) -> Vec<String> {
    let mut lexemes = Vec::new();
    let mut word = String::new();
    for c in pattern.chars() {
        if c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '*') {
            if !word.is_empty() {
                lexemes.push(std::mem::take(&mut word));
            }
            if !c.is_whitespace() {
                lexemes.push(c.to_string());
            }
        } else {
            word.push(c);
        }
    }
    if !word.is_empty() {
        lexemes.push(word);
    }
    lexemes
}

struct PatternParser<'a> {
    lexemes: &'a [String],
    pos: usize,
    line: usize,
    rule: &'a str,
    grammar: &'a mut Grammar,
    synthetic: &'a mut usize,
}

impl PatternParser<'_> {
    fn sequence(&mut self, closing: Option<&str>) -> Result<Vec<Item>, GrammarError> {
        let lexemes = self.lexemes;
        let mut items = Vec::new();
        while self.pos < lexemes.len() {
            let lexeme = lexemes[self.pos].as_str();
            self.pos += 1;
            match lexeme {
                "*" => items.push(Item::Repeat),
                "(" => {
                    let inner = self.sequence(Some(")"))?;
                    let name = match inner.as_slice() {
                        [Item::Rule(name)] => name.clone(),
                        _ => self.define(inner),
                    };
                    items.push(Item::Wrapped(name));
                }
                "[" => {
                    let mut inner = vec![Item::Optional];
                    inner.extend(self.sequence(Some("]"))?);
                    let name = self.define(inner);
                    items.push(Item::Rule(name));
                }
                ")" | "]" => {
                    if closing == Some(lexeme) {
                        return Ok(items);
                    }
                    return Err(self.error(format!("unmatched {:?}", lexeme)));
                }
                word if word.starts_with('%') => {
                    let category = CategoryMatch::named(&word[1..]).ok_or_else(|| {
                        GrammarError::UnknownCategory {
                            line: self.line,
                            name: word[1..].to_string(),
                        }
                    })?;
                    items.push(Item::Category(category));
                }
                word if is_rule_name(word) => items.push(Item::Rule(word.to_string())),
                word => items.push(Item::Token(lookup_token(word, self.line)?)),
            }
        }
        match closing {
            Some(expected) => Err(self.error(format!("missing {:?}", expected))),
            None => Ok(items),
        }
    }

    /// Registers a synthetic rule; `#` keeps its name out of the
    /// namespace a syntax file can write.
    fn define(&mut self, items: Vec<Item>) -> String {
        *self.synthetic += 1;
        let name = format!("{}#{}", self.rule, self.synthetic);
        self.grammar
            .rules
            .insert(name.clone(), vec![Alternative { level: 0, items }]);
        name
    }

    fn error(&self, message: String) -> GrammarError {
        GrammarError::Syntax {
            line: self.line,
            message,
        }
    }
}
