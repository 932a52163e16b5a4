//! Lexer: turns UTF-8 source text into a token stream.
//!
//! The lexer owns a cursor over the source's `char` positions and
//! produces one [`Token`] per call to [`Lexer::next_token`]. Higher-level
//! constructs (heredocs, EPP) are handled in sibling modules and re-enter
//! the cursor the same way the parser re-enters the lexer for `${...}`.

mod epp;
mod heredoc;
mod string;

pub use epp::{EppLexer, EppSegment};
pub use heredoc::HeredocHeader;

use crate::fault::LexFault;
use crate::position::{Position, Span};
use crate::token::{KEYWORDS, NumberBase, NumberLiteral, STATEMENT_CALLS, Token, TokenKind};

/// Whether a just-lexed token can end an expression operand. A `/` seen
/// after one of these is division; anywhere else it starts a regex
/// literal.
pub(crate) fn ends_value(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Number(_)
            | TokenKind::SingleQuotedString(_)
            | TokenKind::StringLiteral(_)
            | TokenKind::Regex(_)
            | TokenKind::Variable(_)
            | TokenKind::Name(_)
            | TokenKind::Type(_)
            | TokenKind::BareWord(_)
            | TokenKind::RParen
            | TokenKind::RBracket
            | TokenKind::Keyword("true")
            | TokenKind::Keyword("false")
            | TokenKind::Keyword("undef")
            | TokenKind::Keyword("default")
    )
}

pub struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    idx: usize,
    line: usize,
    path: Option<String>,
    after_value: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source,
            chars: source.char_indices().collect(),
            idx: 0,
            line: 1,
            path: None,
            after_value: false,
        }
    }

    pub fn with_path(source: &'a str, path: impl Into<String>) -> Self {
        let mut lexer = Lexer::new(source);
        lexer.path = Some(path.into());
        lexer
    }

    pub fn source(&self) -> &'a str {
        self.source
    }

    fn pos(&self) -> Position {
        let offset = self.chars.get(self.idx).map(|(o, _)| *o).unwrap_or(self.source.len());
        Position { offset, line: self.line }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.idx).map(|(_, c)| *c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.idx + ahead).map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.idx += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn fault(&self, message: impl Into<String>, begin: Position) -> LexFault {
        let span = Span::new(begin, self.pos());
        LexFault {
            message: message.into(),
            column: span.column(self.source),
            span,
            path: self.path.clone(),
        }
    }

    /// Jump the cursor to an absolute char index (used after heredoc
    /// scanning, which consumes whole lines ahead of the normal cursor,
    /// and by the parser's checkpoint/restore).
    pub(crate) fn seek(&mut self, idx: usize, line: usize) {
        self.idx = idx;
        self.line = line;
    }

    pub(crate) fn set_after_value(&mut self, after_value: bool) {
        self.after_value = after_value;
    }

    pub(crate) fn idx(&self) -> usize {
        self.idx
    }

    pub(crate) fn line(&self) -> usize {
        self.line
    }

    fn skip_trivia(&mut self) -> Result<(), LexFault> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let begin = self.pos();
                    self.bump();
                    self.bump();
                    let mut closed = false;
                    while let Some(c) = self.peek() {
                        if c == '*' && self.peek_at(1) == Some('/') {
                            self.bump();
                            self.bump();
                            closed = true;
                            break;
                        }
                        self.bump();
                    }
                    if !closed {
                        return Err(self.fault("unterminated block comment", begin));
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Produces the next token. Returns an `Eof` token forever once the
    /// source is exhausted.
    pub fn next_token(&mut self) -> Result<Token, LexFault> {
        let token = self.next_token_inner()?;
        self.after_value = ends_value(&token.kind);
        Ok(token)
    }

    fn next_token_inner(&mut self) -> Result<Token, LexFault> {
        self.skip_trivia()?;
        let begin = self.pos();
        let c = match self.peek() {
            None => return Ok(Token::new(TokenKind::Eof, Span::point(begin))),
            Some(c) => c,
        };

        if c == '$' {
            return self.lex_variable(begin);
        }
        if c.is_ascii_digit() {
            return self.lex_number(begin);
        }
        if c == '\'' {
            return self.lex_single_quoted(begin);
        }
        if c == '"' {
            return self.lex_double_quoted_start(begin);
        }
        if c == '@' {
            return self.lex_at(begin);
        }
        if c == '/' {
            return self.lex_regex_or_slash(begin);
        }
        if c.is_alphabetic() || c == '_' || c == ':' {
            return self.lex_identifier(begin);
        }

        self.lex_operator(begin)
    }

    fn lex_variable(&mut self, begin: Position) -> Result<Token, LexFault> {
        self.bump(); // '$'
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == ':' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.fault("expected variable name after '$'", begin));
        }
        Ok(Token::new(TokenKind::Variable(name), Span::new(begin, self.pos())))
    }

    fn lex_identifier(&mut self, begin: Position) -> Result<Token, LexFault> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == ':' || c == '-' {
                // a lone trailing '-' that starts a new token (e.g. `foo-1`)
                // is ambiguous in real Puppet grammar; this lexer treats
                // identifiers as greedy over [A-Za-z0-9_:-] which matches
                // qualified names like `foo::bar`.
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let span = Span::new(begin, self.pos());
        if let Some(kw) = KEYWORDS.iter().find(|k| **k == text) {
            return Ok(Token::new(TokenKind::Keyword(kw), span));
        }
        if let Some(sc) = STATEMENT_CALLS.iter().find(|k| **k == text) {
            return Ok(Token::new(TokenKind::StatementCall(sc), span));
        }
        let first = text.trim_start_matches(':').chars().next();
        match first {
            Some(ch) if ch.is_uppercase() => Ok(Token::new(TokenKind::Type(text), span)),
            _ => Ok(Token::new(TokenKind::Name(text), span)),
        }
    }

    fn lex_number(&mut self, begin: Position) -> Result<Token, LexFault> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '.' || (c == '-' && text.ends_with(['e', 'E'])) || c == '+' && text.ends_with(['e', 'E']) {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let span = Span::new(begin, self.pos());
        parse_number(&text).map(|n| Token::new(TokenKind::Number(n), span)).map_err(|msg| self.fault(msg, begin))
    }

    fn lex_at(&mut self, begin: Position) -> Result<Token, LexFault> {
        self.bump();
        if self.peek() == Some('@') {
            self.bump();
            return Ok(Token::new(TokenKind::AtAt, Span::new(begin, self.pos())));
        }
        if self.peek() == Some('(') {
            // Heredoc opener: delegate entirely to the heredoc module.
            return heredoc::lex_heredoc_header(self, begin);
        }
        Ok(Token::new(TokenKind::At, Span::new(begin, self.pos())))
    }

    fn lex_regex_or_slash(&mut self, begin: Position) -> Result<Token, LexFault> {
        // Division vs. regex literal is context-sensitive: a '/' directly
        // after a completed operand is the division operator; anywhere
        // else it opens a regex literal.
        if self.after_value {
            self.bump();
            return Ok(Token::new(TokenKind::Slash, Span::new(begin, self.pos())));
        }
        self.bump();
        let mut text = String::new();
        let mut closed = false;
        while let Some(c) = self.peek() {
            if c == '/' {
                self.bump();
                closed = true;
                break;
            }
            if c == '\\' {
                text.push(c);
                self.bump();
                if let Some(next) = self.peek() {
                    text.push(next);
                    self.bump();
                }
                continue;
            }
            if c == '\n' {
                break;
            }
            text.push(c);
            self.bump();
        }
        if !closed {
            return Err(self.fault("unterminated regular expression literal", begin));
        }
        Ok(Token::new(TokenKind::Regex(text), Span::new(begin, self.pos())))
    }

    fn lex_operator(&mut self, begin: Position) -> Result<Token, LexFault> {
        let c = self.bump().unwrap();
        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '?' => TokenKind::Question,
            '.' => TokenKind::Dot,
            '*' => TokenKind::Splat,
            '%' => TokenKind::Percent,
            '|' => {
                if self.peek() == Some('>') {
                    self.bump();
                    if self.peek() == Some('>') {
                        self.bump();
                        TokenKind::PipeRightRight
                    } else {
                        TokenKind::PipeRight
                    }
                } else {
                    TokenKind::Pipe
                }
            }
            ':' => {
                if self.peek() == Some(':') {
                    self.bump();
                    TokenKind::DoubleColon
                } else {
                    TokenKind::Colon
                }
            }
            '=' => match self.peek() {
                Some('>') => {
                    self.bump();
                    TokenKind::FatArrow
                }
                Some('=') => {
                    self.bump();
                    TokenKind::Eq
                }
                Some('~') => {
                    self.bump();
                    TokenKind::Match
                }
                _ => TokenKind::Assign,
            },
            '+' => match self.peek() {
                Some('>') => {
                    self.bump();
                    TokenKind::PlusArrow
                }
                _ => TokenKind::Plus,
            },
            '-' => match self.peek() {
                Some('>') => {
                    self.bump();
                    TokenKind::InArrow
                }
                _ => TokenKind::Minus,
            },
            '~' => match self.peek() {
                Some('>') => {
                    self.bump();
                    TokenKind::InArrowSub
                }
                _ => return Err(self.fault("unexpected character '~'", begin)),
            },
            '<' => match self.peek() {
                Some('=') => {
                    self.bump();
                    TokenKind::Le
                }
                Some('<') => {
                    self.bump();
                    if self.peek() == Some('|') {
                        self.bump();
                        TokenKind::PipeLeftLeft
                    } else {
                        TokenKind::ShiftLeft
                    }
                }
                Some('|') => {
                    self.bump();
                    TokenKind::PipeLeft
                }
                Some('-') => {
                    self.bump();
                    TokenKind::OutArrow
                }
                Some('~') => {
                    self.bump();
                    TokenKind::OutArrowSub
                }
                _ => TokenKind::Lt,
            },
            '>' => match self.peek() {
                Some('=') => {
                    self.bump();
                    TokenKind::Ge
                }
                Some('>') => {
                    self.bump();
                    TokenKind::ShiftRight
                }
                _ => TokenKind::Gt,
            },
            '!' => match self.peek() {
                Some('=') => {
                    self.bump();
                    TokenKind::NotEq
                }
                Some('~') => {
                    self.bump();
                    TokenKind::NotMatch
                }
                _ => TokenKind::Not,
            },
            other => return Err(self.fault(format!("unexpected character '{}'", other), begin)),
        };
        Ok(Token::new(kind, Span::new(begin, self.pos())))
    }
}

pub fn parse_number(text: &str) -> Result<NumberLiteral, String> {
    if text.contains('.') || ((text.contains('e') || text.contains('E')) && !text.starts_with("0x") && !text.starts_with("0X")) {
        return text
            .parse::<f64>()
            .map(NumberLiteral::Float)
            .map_err(|_| format!("'{}' is not a valid floating point literal", text));
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("'{}' is not a valid hexadecimal literal", text));
        }
        return i64::from_str_radix(hex, 16)
            .map(|v| NumberLiteral::Integer { value: v, base: NumberBase::Hexadecimal })
            .map_err(|_| format!("hexadecimal literal '{}' is out of range", text));
    }
    if text.starts_with('0') && text.len() > 1 {
        let body = &text[1..];
        if !body.chars().all(|c| ('0'..='7').contains(&c)) {
            return Err(format!("'{}' is not a valid octal literal (digits must be 0-7)", text));
        }
        return i64::from_str_radix(body, 8)
            .map(|v| NumberLiteral::Integer { value: v, base: NumberBase::Octal })
            .map_err(|_| format!("octal literal '{}' is out of range", text));
    }
    text.parse::<i64>()
        .map(|v| NumberLiteral::Integer { value: v, base: NumberBase::Decimal })
        .map_err(|_| format!("decimal literal '{}' is out of range", text))
}
