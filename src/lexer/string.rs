//! Single- and double-quoted string lexing.
//!
//! Single-quoted strings only escape `\\` and `\'`. Double-quoted strings
//! are escaped and interpolated in a single pass: every unescaped `$name`
//! or `${expr}` is recorded as its own [`RawStringPart`] alongside the
//! literal text around it, matching the `string_start`/`string_text`/
//! `interpolation_start`/`interpolation_end`/`string_end` decomposition
//! a token-stream decomposition would produce, without a second pass.

use super::Lexer;
use crate::fault::LexFault;
use crate::position::Position;
use crate::token::{RawStringPart, StringPayload, Token, TokenKind};

/// The escapes recognized inside a double-quoted string.
const DOUBLE_QUOTE_ESCAPES: &[char] = &['\\', '"', '\'', 'r', 'n', 't', 's', '$', 'u'];

impl<'a> Lexer<'a> {
    pub(super) fn lex_single_quoted(&mut self, begin: Position) -> Result<Token, LexFault> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(self.fault("unclosed single-quoted string", begin)),
                Some('\'') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    match self.peek() {
                        Some('\'') => {
                            value.push('\'');
                            self.bump();
                        }
                        Some('\\') => {
                            value.push('\\');
                            self.bump();
                        }
                        Some(other) => {
                            value.push('\\');
                            value.push(other);
                            self.bump();
                        }
                        None => return Err(self.fault("unclosed single-quoted string", begin)),
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.bump();
                }
            }
        }
        Ok(Token::new(
            TokenKind::SingleQuotedString(value),
            crate::position::Span::new(begin, self.pos()),
        ))
    }

    pub(super) fn lex_double_quoted_start(&mut self, begin: Position) -> Result<Token, LexFault> {
        self.bump(); // opening quote
        let parts = self.scan_interpolated_body(begin, true, DOUBLE_QUOTE_ESCAPES)?;
        let interpolated = parts.len() != 1 || !matches!(parts.first(), Some(RawStringPart::Text(_)));
        Ok(Token::new(
            TokenKind::StringLiteral(StringPayload {
                parts,
                format: None,
                margin: None,
                interpolated,
            }),
            crate::position::Span::new(begin, self.pos()),
        ))
    }

    /// Scans a double-quoted string body up to its closing `"`, producing
    /// the escape-resolved, interpolation-split piece list. `quoted`
    /// controls whether a bare `"` ends the scan (always true for this
    /// caller; heredoc bodies use the sibling free function instead since
    /// they terminate on a margin line, not a quote character).
    fn scan_interpolated_body(
        &mut self,
        begin: Position,
        quoted: bool,
        escapes: &[char],
    ) -> Result<Vec<RawStringPart>, LexFault> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => {
                    if quoted {
                        return Err(self.fault("unclosed double-quoted string", begin));
                    }
                    break;
                }
                Some('"') if quoted => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    self.decode_escape(&mut text, begin, escapes)?;
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    if !text.is_empty() {
                        parts.push(RawStringPart::Text(std::mem::take(&mut text)));
                    }
                    self.bump();
                    self.bump();
                    let mut depth = 1usize;
                    let mut expr = String::new();
                    let mut closed = false;
                    while let Some(c) = self.peek() {
                        if c == '{' {
                            depth += 1;
                        } else if c == '}' {
                            depth -= 1;
                            if depth == 0 {
                                self.bump();
                                closed = true;
                                break;
                            }
                        }
                        expr.push(c);
                        self.bump();
                    }
                    if !closed {
                        return Err(self.fault("unterminated '${' interpolation", begin));
                    }
                    parts.push(RawStringPart::Expr(expr));
                }
                Some('$') if matches!(self.peek_at(1), Some(c) if c.is_alphanumeric() || c == '_') => {
                    if !text.is_empty() {
                        parts.push(RawStringPart::Text(std::mem::take(&mut text)));
                    }
                    self.bump();
                    let mut name = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_alphanumeric() || c == '_' || c == ':' {
                            name.push(c);
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    parts.push(RawStringPart::BareVariable(name));
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(RawStringPart::Text(text));
        }
        Ok(parts)
    }

    fn decode_escape(&mut self, out: &mut String, begin: Position, allowed: &[char]) -> Result<(), LexFault> {
        let c = match self.peek() {
            Some(c) => c,
            None => return Err(self.fault("unclosed string", begin)),
        };
        // The heredoc 'L' escape is backslash at end of line: it deletes
        // the line break rather than translating a letter.
        if c == '\n' {
            if allowed.contains(&'L') {
                self.bump();
            } else {
                out.push('\\');
                out.push('\n');
                self.bump();
            }
            return Ok(());
        }
        if !allowed.contains(&c) || c == 'L' {
            out.push('\\');
            out.push(c);
            self.bump();
            return Ok(());
        }
        match c {
            '\\' => {
                out.push('\\');
                self.bump();
            }
            '"' => {
                out.push('"');
                self.bump();
            }
            '\'' => {
                out.push('\'');
                self.bump();
            }
            'r' => {
                out.push('\r');
                self.bump();
            }
            'n' => {
                out.push('\n');
                self.bump();
            }
            't' => {
                out.push('\t');
                self.bump();
            }
            's' => {
                out.push(' ');
                self.bump();
            }
            '$' => {
                out.push('$');
                self.bump();
            }
            'u' => {
                self.bump();
                self.decode_unicode_escape(out, begin)?;
            }
            _ => unreachable!("checked by `allowed` above"),
        }
        Ok(())
    }

    fn decode_unicode_escape(&mut self, out: &mut String, begin: Position) -> Result<(), LexFault> {
        let hex = if self.peek() == Some('{') {
            self.bump();
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c == '}' {
                    break;
                }
                digits.push(c);
                self.bump();
            }
            if self.peek() != Some('}') {
                return Err(self.fault("unterminated \\u{...} escape", begin));
            }
            self.bump();
            digits
        } else {
            let mut digits = String::new();
            for _ in 0..4 {
                match self.peek() {
                    Some(c) if c.is_ascii_hexdigit() => {
                        digits.push(c);
                        self.bump();
                    }
                    _ => return Err(self.fault("\\u escape requires four hex digits or {1..6 hex}", begin)),
                }
            }
            digits
        };
        if hex.is_empty() || hex.len() > 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(self.fault(format!("malformed unicode escape '\\u{{{}}}'", hex), begin));
        }
        let code = u32::from_str_radix(&hex, 16).map_err(|_| self.fault("malformed unicode escape", begin))?;
        match char::from_u32(code) {
            Some(ch) => out.push(ch),
            None => return Err(self.fault(format!("'\\u{{{}}}' is not a valid code point", hex), begin)),
        }
        Ok(())
    }
}

/// Entry point used by [`super::heredoc`] to apply its own (smaller, opt-in)
/// escape set to an already margin-stripped heredoc body, splitting out
/// interpolation the same way a double-quoted string does.
pub(super) fn scan_interpolated_text(body: &str, escapes: &[char]) -> Result<Vec<RawStringPart>, String> {
    let mut lexer = Lexer::new(body);
    lexer
        .scan_interpolated_body(Position::start(), false, escapes)
        .map_err(|e| e.message)
}
