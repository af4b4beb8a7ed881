//! Tokenizer for the JSON dialects.

use crate::error::{BsonError, BsonResult};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    BeginObject,
    EndObject,
    BeginArray,
    EndArray,
    LeftParen,
    RightParen,
    Colon,
    Comma,
    /// A double- or single-quoted string, unescaped.
    String(String),
    /// Numeric text exactly as written, including any sign.
    Number(String),
    /// A bare word such as `true`, `NumberLong`, `$oid` or `-Infinity`.
    Identifier(String),
    /// A `/pattern/flags` literal.
    Regex { pattern: String, options: String },
    Eof,
}

#[derive(Debug)]
pub(crate) struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: impl std::fmt::Display) -> BsonError {
        BsonError::format(format!("JSON reader: {} at offset {}", message, self.pos))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    /// Whether only whitespace remains.
    pub(crate) fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.input.len()
    }

    pub(crate) fn next_token(&mut self) -> BsonResult<Token> {
        self.skip_whitespace();
        let Some(c) = self.peek_char() else {
            return Ok(Token::Eof);
        };
        match c {
            '{' | '}' | '[' | ']' | '(' | ')' | ':' | ',' => {
                self.pos += 1;
                Ok(match c {
                    '{' => Token::BeginObject,
                    '}' => Token::EndObject,
                    '[' => Token::BeginArray,
                    ']' => Token::EndArray,
                    '(' => Token::LeftParen,
                    ')' => Token::RightParen,
                    ':' => Token::Colon,
                    _ => Token::Comma,
                })
            }
            '"' | '\'' => self.scan_string(c),
            '/' => self.scan_regex(),
            '-' | '+' | '0'..='9' | '.' => self.scan_number(),
            c if is_identifier_start(c) => Ok(Token::Identifier(self.scan_word())),
            other => Err(self.error(format!("unexpected character {:?}", other))),
        }
    }

    fn scan_word(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if is_identifier_part(c) {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_string()
    }

    fn scan_string(&mut self, quote: char) -> BsonResult<Token> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            let c = self.bump().ok_or_else(|| self.error("unterminated string"))?;
            match c {
                c if c == quote => return Ok(Token::String(text)),
                '\\' => {
                    let escaped = self.bump().ok_or_else(|| self.error("unterminated escape"))?;
                    match escaped {
                        '"' | '\'' | '\\' | '/' => text.push(escaped),
                        'b' => text.push('\u{08}'),
                        'f' => text.push('\u{0C}'),
                        'n' => text.push('\n'),
                        'r' => text.push('\r'),
                        't' => text.push('\t'),
                        'u' => text.push(self.scan_unicode_escape()?),
                        other => return Err(self.error(format!("invalid escape \\{}", other))),
                    }
                }
                c => text.push(c),
            }
        }
    }

    fn scan_hex4(&mut self) -> BsonResult<u32> {
        let end = self.pos + 4;
        let digits = self
            .input
            .get(self.pos..end)
            .ok_or_else(|| self.error("truncated unicode escape"))?;
        let value =
            u32::from_str_radix(digits, 16).map_err(|_| self.error("invalid unicode escape"))?;
        self.pos = end;
        Ok(value)
    }

    fn scan_unicode_escape(&mut self) -> BsonResult<char> {
        let high = self.scan_hex4()?;
        if (0xD800..0xDC00).contains(&high) {
            if self.input[self.pos..].starts_with("\\u") {
                self.pos += 2;
                let low = self.scan_hex4()?;
                if (0xDC00..0xE000).contains(&low) {
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    return char::from_u32(combined).ok_or_else(|| self.error("invalid surrogate pair"));
                }
            }
            return Err(self.error("unpaired surrogate in unicode escape"));
        }
        char::from_u32(high).ok_or_else(|| self.error("invalid unicode escape"))
    }

    fn scan_regex(&mut self) -> BsonResult<Token> {
        self.pos += 1;
        let mut pattern = String::new();
        loop {
            let c = self.bump().ok_or_else(|| self.error("unterminated regular expression"))?;
            match c {
                '/' => break,
                '\\' => {
                    // Escapes are part of the pattern, `\/` included.
                    let next = self.bump().ok_or_else(|| self.error("unterminated regular expression"))?;
                    pattern.push('\\');
                    pattern.push(next);
                }
                c => pattern.push(c),
            }
        }
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphabetic() {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(Token::Regex {
            pattern,
            options: self.input[start..self.pos].to_string(),
        })
    }

    fn scan_number(&mut self) -> BsonResult<Token> {
        let start = self.pos;
        if matches!(self.peek_char(), Some('-' | '+')) {
            self.pos += 1;
            if self.peek_char().is_some_and(is_identifier_start) {
                let word = self.scan_word();
                return match word.as_str() {
                    "Infinity" | "NaN" => Ok(Token::Identifier(self.input[start..self.pos].to_string())),
                    _ => Err(self.error(format!("unexpected word {:?} after sign", word))),
                };
            }
        }
        let mut digits = 0;
        while let Some(c) = self.peek_char() {
            match c {
                '0'..='9' => {
                    digits += 1;
                    self.pos += 1;
                }
                '.' | 'e' | 'E' => self.pos += 1,
                '+' | '-' if matches!(self.input[..self.pos].chars().last(), Some('e' | 'E')) => {
                    self.pos += 1
                }
                _ => break,
            }
        }
        if digits == 0 {
            return Err(self.error("invalid number"));
        }
        Ok(Token::Number(self.input[start..self.pos].to_string()))
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_identifier_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.'
}
