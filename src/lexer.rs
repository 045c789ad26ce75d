use crate::config::{Config, Delimiters};
use crate::error::{Result, TemplateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Data,
    Comment,
    BlockStart,    // {%
    BlockEnd,      // %}
    VariableStart, // {{
    VariableEnd,   // }}
    Whitespace,

    // Literals
    String,
    Int,
    Float,
    Boolean,
    None,
    Regex,
    Symbol,

    // Punctuation
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftCurly,
    RightCurly,
    Comma,
    Colon,
    Tilde,
    Pipe,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Decoded text for strings, literal source text for everything else
    /// (delimiters keep their `-` markers, regexes keep `r/body/flags`).
    pub value: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(kind: TokenKind, value: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind,
            value: value.into(),
            line,
            column,
        }
    }

    pub fn is(&self, kind: TokenKind, value: &str) -> bool {
        self.kind == kind && self.value == value
    }

    /// Body and flags of a regex literal.
    pub fn regex_parts(&self) -> Option<(&str, &str)> {
        if self.kind != TokenKind::Regex {
            return None;
        }
        self.value.strip_prefix("r/")?.rsplit_once('/')
    }
}

const DELIMITERS: &str = "()[]{}%*-+~/#,:|.<>=!";
const COMPLEX_OPERATORS: [&str; 8] = ["===", "!==", "==", "!=", "<=", ">=", "//", "**"];
const REGEX_FLAGS: &str = "gimy";

fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\n' | '\t' | '\r' | '\u{a0}')
}

fn is_symbol(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Body of a raw/verbatim section, taken straight from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBody {
    pub text: String,
    /// The end tag closed with `-%}`.
    pub trim_after: bool,
}

#[derive(Clone)]
pub struct Tokenizer<'a> {
    input: &'a str,
    cursor: usize,
    line: usize,
    column: usize,
    in_code: bool,
    tags: Delimiters,
    trim_blocks: bool,
    lstrip_blocks: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self::with_config(input, &Config::default())
    }

    pub fn with_config(input: &'a str, config: &Config) -> Self {
        Self {
            input,
            cursor: 0,
            line: 1,
            column: 1,
            in_code: false,
            tags: config.tags.clone(),
            trim_blocks: config.trim_blocks,
            lstrip_blocks: config.lstrip_blocks,
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn column(&self) -> usize {
        self.column
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.cursor..]
    }

    fn advance(&mut self, n: usize) {
        for c in self.input[self.cursor..self.cursor + n].chars() {
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.cursor += n;
    }

    fn take(&mut self, kind: TokenKind, n: usize) -> Token {
        let token = Token::new(kind, &self.remaining()[..n], self.line, self.column);
        self.advance(n);
        token
    }

    /// Length of an opening delimiter at the cursor, including a trailing `-`.
    fn open_len(&self, delim: &str) -> Option<usize> {
        let rest = self.remaining().strip_prefix(delim)?;
        Some(delim.len() + usize::from(rest.starts_with('-')))
    }

    /// Length of a closing delimiter at the cursor, including a leading `-`.
    fn close_len(&self, delim: &str) -> Option<usize> {
        let rest = self.remaining();
        if rest.starts_with(delim) {
            Some(delim.len())
        } else if rest.strip_prefix('-')?.starts_with(delim) {
            Some(delim.len() + 1)
        } else {
            None
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>> {
        if self.remaining().is_empty() {
            return Ok(None);
        }
        if self.in_code {
            self.code_token().map(Some)
        } else {
            self.text_token()
        }
    }

    fn text_token(&mut self) -> Result<Option<Token>> {
        loop {
            let rest = self.remaining();
            if rest.is_empty() {
                return Ok(None);
            }

            if let Some(n) = self.open_len(&self.tags.block_start) {
                self.in_code = true;
                return Ok(Some(self.take(TokenKind::BlockStart, n)));
            }
            if let Some(n) = self.open_len(&self.tags.variable_start) {
                self.in_code = true;
                return Ok(Some(self.take(TokenKind::VariableStart, n)));
            }
            if let Some(body) = rest.strip_prefix(self.tags.comment_start.as_str()) {
                return match body.find(self.tags.comment_end.as_str()) {
                    Some(i) => {
                        let n = self.tags.comment_start.len() + i + self.tags.comment_end.len();
                        Ok(Some(self.take(TokenKind::Comment, n)))
                    }
                    None => Err(TemplateError::lexical(
                        "expected end of comment, got end of file",
                        self.line,
                        self.column,
                    )),
                };
            }

            // Plain text up to the next opening delimiter
            let end = [
                &self.tags.block_start,
                &self.tags.variable_start,
                &self.tags.comment_start,
            ]
            .iter()
            .filter_map(|delim| rest.find(delim.as_str()))
            .min()
            .unwrap_or(rest.len());

            let mut text = &rest[..end];
            let next = &rest[end..];
            let starts_line = self.column == 1;
            if self.lstrip_blocks
                && (next.starts_with(self.tags.block_start.as_str())
                    || next.starts_with(self.tags.comment_start.as_str()))
            {
                let line_start = text.rfind('\n').map(|i| i + 1).unwrap_or(0);
                let tail = &text[line_start..];
                if (line_start > 0 || starts_line)
                    && !tail.is_empty()
                    && tail.chars().all(|c| c == ' ' || c == '\t')
                {
                    text = &text[..line_start];
                }
            }

            let token = Token::new(TokenKind::Data, text, self.line, self.column);
            self.advance(end);
            if token.value.is_empty() {
                continue;
            }
            return Ok(Some(token));
        }
    }

    fn code_token(&mut self) -> Result<Token> {
        let rest = self.remaining();
        let (line, column) = (self.line, self.column);
        let first = match rest.chars().next() {
            Some(c) => c,
            None => return Err(TemplateError::lexical("unexpected end of input", line, column)),
        };

        if first == '"' || first == '\'' {
            return self.string_token(first);
        }

        let ws = rest
            .char_indices()
            .find(|(_, c)| !is_whitespace(*c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if ws > 0 {
            return Ok(self.take(TokenKind::Whitespace, ws));
        }

        if let Some(n) = self.close_len(&self.tags.block_end) {
            let token = self.take(TokenKind::BlockEnd, n);
            self.in_code = false;
            if self.trim_blocks {
                let after = self.remaining();
                if after.starts_with("\r\n") {
                    self.advance(2);
                } else if after.starts_with('\n') {
                    self.advance(1);
                }
            }
            return Ok(token);
        }
        if let Some(n) = self.close_len(&self.tags.variable_end) {
            let token = self.take(TokenKind::VariableEnd, n);
            self.in_code = false;
            return Ok(token);
        }

        if first == 'r' && rest[1..].starts_with('/') {
            return self.regex_token();
        }

        if DELIMITERS.contains(first) {
            let n = COMPLEX_OPERATORS
                .iter()
                .find(|op| rest.starts_with(*op))
                .map(|op| op.len())
                .unwrap_or(1);
            let kind = match &rest[..n] {
                "(" => TokenKind::LeftParen,
                ")" => TokenKind::RightParen,
                "[" => TokenKind::LeftBracket,
                "]" => TokenKind::RightBracket,
                "{" => TokenKind::LeftCurly,
                "}" => TokenKind::RightCurly,
                "," => TokenKind::Comma,
                ":" => TokenKind::Colon,
                "~" => TokenKind::Tilde,
                "|" => TokenKind::Pipe,
                _ => TokenKind::Operator,
            };
            return Ok(self.take(kind, n));
        }

        let end = rest
            .char_indices()
            .find(|(_, c)| is_whitespace(*c) || DELIMITERS.contains(*c))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let word = &rest[..end];

        if word.bytes().all(|b| b.is_ascii_digit()) {
            // Decimal part, only when a digit follows the dot
            let after = &rest[end..];
            if let Some(fraction) = after.strip_prefix('.') {
                let digits = fraction.bytes().take_while(|b| b.is_ascii_digit()).count();
                if digits > 0 {
                    return Ok(self.take(TokenKind::Float, end + 1 + digits));
                }
            }
            return Ok(self.take(TokenKind::Int, end));
        }

        let kind = match word {
            "true" | "false" => TokenKind::Boolean,
            "none" | "null" => TokenKind::None,
            w if is_symbol(w) => TokenKind::Symbol,
            w => {
                return Err(TemplateError::lexical(
                    format!("unexpected value while parsing: {}", w),
                    line,
                    column,
                ))
            }
        };
        Ok(self.take(kind, end))
    }

    fn string_token(&mut self, quote: char) -> Result<Token> {
        let rest = self.remaining();
        let (line, column) = (self.line, self.column);
        let mut value = String::new();
        let mut chars = rest.char_indices().skip(1);
        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, other)) => value.push(other),
                    None => break,
                }
            } else if c == quote {
                self.advance(i + 1);
                return Ok(Token::new(TokenKind::String, value, line, column));
            } else {
                value.push(c);
            }
        }
        Err(TemplateError::lexical("unterminated string", line, column))
    }

    fn regex_token(&mut self) -> Result<Token> {
        let rest = self.remaining();
        let mut previous = '\0';
        let mut close = None;
        for (i, c) in rest[2..].char_indices() {
            if c == '/' && previous != '\\' {
                close = Some(2 + i);
                break;
            }
            previous = c;
        }
        let close = match close {
            Some(i) => i,
            None => {
                return Err(TemplateError::lexical(
                    "unterminated regular expression",
                    self.line,
                    self.column,
                ))
            }
        };
        let flags = rest[close + 1..]
            .chars()
            .take_while(|c| REGEX_FLAGS.contains(*c))
            .count();
        Ok(self.take(TokenKind::Regex, close + 1 + flags))
    }

    /// Consume source text verbatim up to and including the `end_tag` block
    /// (`{% endraw %}`). Only valid in text mode, straight after a block end.
    pub fn take_raw(&mut self, end_tag: &str) -> Option<RawBody> {
        let rest = self.remaining();
        let block_start = self.tags.block_start.clone();
        let block_end = self.tags.block_end.clone();

        let mut search = 0;
        while let Some(i) = rest[search..].find(block_start.as_str()) {
            let start = search + i;
            search = start + block_start.len();

            let inner = &rest[search..];
            let trim_before = inner.starts_with('-');
            let inner = inner.strip_prefix('-').unwrap_or(inner).trim_start();
            let Some(after) = inner.strip_prefix(end_tag) else {
                continue;
            };
            if after.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
                continue;
            }
            let after = after.trim_start();
            let trim_after = after.starts_with('-');
            let after = after.strip_prefix('-').unwrap_or(after);
            let Some(tail) = after.strip_prefix(block_end.as_str()) else {
                continue;
            };

            let mut text = &rest[..start];
            if trim_before {
                text = text.trim_end();
            }
            let text = text.to_string();
            self.advance(rest.len() - tail.len());
            if self.trim_blocks {
                let after = self.remaining();
                if after.starts_with("\r\n") {
                    self.advance(2);
                } else if after.starts_with('\n') {
                    self.advance(1);
                }
            }
            return Some(RawBody { text, trim_after });
        }
        None
    }
}
