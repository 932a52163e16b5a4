//! Heredoc lexing: `@(TAG[/escapes][:format])` openers and their bodies.

use super::string::scan_interpolated_text;
use super::Lexer;
use crate::fault::LexFault;
use crate::position::{Position, Span};
use crate::token::{RawStringPart, StringPayload, Token, TokenKind};

const TAB_WIDTH: usize = 4;
const VALID_ESCAPE_LETTERS: &[char] = &['t', 'r', 'n', 's', 'u', 'L', '$'];

#[derive(Debug, Clone, PartialEq)]
pub struct HeredocHeader {
    pub tag: String,
    pub escapes: Vec<char>,
    pub format: Option<String>,
    /// Tag was wrapped in single quotes: behaves like a single-quoted
    /// string and never interpolates, matching `lex_single_quoted`.
    pub raw: bool,
}

/// Parses the `@(...)` opener starting right after the `@` has been
/// consumed by the caller (cursor sits on `(`).
pub fn lex_heredoc_header(lexer: &mut Lexer<'_>, begin: Position) -> Result<Token, LexFault> {
    lexer.bump(); // '('
    let quote_char = match lexer.peek() {
        Some(c @ '"') | Some(c @ '\'') => {
            lexer.bump();
            Some(c)
        }
        _ => None,
    };
    let mut tag = String::new();
    while let Some(c) = lexer.peek() {
        if quote_char.is_some() && Some(c) == quote_char {
            break;
        }
        if quote_char.is_none() {
            if c == '/' || c == ':' || c == ')' {
                break;
            }
            if !(c.is_alphanumeric() || c == '_' || c == '-') {
                return Err(lexer.fault(format!("'{}' is not valid in a heredoc tag", c), begin));
            }
        }
        tag.push(c);
        lexer.bump();
    }
    if let Some(qc) = quote_char {
        if lexer.peek() != Some(qc) {
            return Err(lexer.fault("unterminated heredoc tag", begin));
        }
        lexer.bump();
    }
    if tag.is_empty() {
        return Err(lexer.fault("heredoc tag must not be empty", begin));
    }

    let mut escapes = Vec::new();
    if lexer.peek() == Some('/') {
        lexer.bump();
        while let Some(c) = lexer.peek() {
            if c == ':' || c == ')' {
                break;
            }
            if !VALID_ESCAPE_LETTERS.contains(&c) {
                return Err(lexer.fault(format!("'{}' is not a valid heredoc escape letter", c), begin));
            }
            if escapes.contains(&c) {
                return Err(lexer.fault(format!("heredoc escape letter '{}' specified twice", c), begin));
            }
            escapes.push(c);
            lexer.bump();
        }
    }

    let mut format = None;
    if lexer.peek() == Some(':') {
        lexer.bump();
        let mut fmt = String::new();
        while let Some(c) = lexer.peek() {
            if c == ')' {
                break;
            }
            fmt.push(c);
            lexer.bump();
        }
        format = Some(fmt);
    }

    if lexer.peek() != Some(')') {
        return Err(lexer.fault("expected ')' to close heredoc tag", begin));
    }
    lexer.bump();

    // Consume and discard the remainder of the opening line.
    while let Some(c) = lexer.peek() {
        if c == '\n' {
            break;
        }
        lexer.bump();
    }
    if lexer.peek() == Some('\n') {
        lexer.bump();
    }

    let header = HeredocHeader {
        tag: tag.clone(),
        escapes: escapes.clone(),
        format: format.clone(),
        raw: quote_char == Some('\''),
    };

    let (body, margin) = scan_heredoc_body(lexer, &header, begin)?;

    let parts = if header.raw {
        vec![RawStringPart::Text(body)]
    } else {
        scan_interpolated_text(&body, &header.escapes).map_err(|message| lexer.fault(message, begin))?
    };
    let interpolated = !header.raw
        && (parts.len() != 1 || !matches!(parts.first(), Some(RawStringPart::Text(_))));

    Ok(Token::new(
        TokenKind::StringLiteral(StringPayload {
            parts,
            format,
            margin: Some(margin),
            interpolated,
        }),
        Span::new(begin, lexer.pos()),
    ))
}

/// Reads heredoc body lines until a terminator line (trimmed content is
/// `| TAG`, optionally preceded by `~` for indent-tracked stripping, and
/// optionally suffixed with `-` to suppress the trailing line break).
fn scan_heredoc_body(
    lexer: &mut Lexer<'_>,
    header: &HeredocHeader,
    begin: Position,
) -> Result<(String, usize), LexFault> {
    let mut lines: Vec<String> = Vec::new();
    let mut margin = 0usize;
    let mut suppress_trailing_break = false;
    loop {
        if lexer.peek().is_none() {
            return Err(lexer.fault(format!("unterminated heredoc '{}'", header.tag), begin));
        }
        let mut raw = String::new();
        while let Some(c) = lexer.peek() {
            if c == '\n' {
                break;
            }
            raw.push(c);
            lexer.bump();
        }
        if lexer.peek() == Some('\n') {
            lexer.bump();
        }
        let trimmed = raw.trim_start();
        let marker_body = trimmed.strip_prefix('~').map(str::trim_start).unwrap_or(trimmed);
        if let Some(rest) = marker_body.strip_prefix('|') {
            let rest = rest.trim_start();
            let (candidate_tag, minus) = match rest.strip_prefix('-') {
                Some(r) => (r.trim_start(), true),
                None => (rest, false),
            };
            if candidate_tag.trim_end() == header.tag {
                let indent_len = raw.len() - raw.trim_start().len();
                margin = expand_tabs_len(&raw[..indent_len]);
                suppress_trailing_break = minus;
                break;
            }
        }
        lines.push(raw);
    }

    let mut body = String::new();
    for line in &lines {
        let stripped = strip_margin(line, margin);
        body.push_str(&stripped);
        body.push('\n');
    }
    if suppress_trailing_break && body.ends_with('\n') {
        body.pop();
    }

    Ok((body, margin))
}

fn expand_tabs_len(prefix: &str) -> usize {
    let mut col = 0usize;
    for c in prefix.chars() {
        if c == '\t' {
            col += TAB_WIDTH - (col % TAB_WIDTH);
        } else {
            col += 1;
        }
    }
    col
}

/// Strips at most `margin` columns of leading whitespace from `line`,
/// expanding tabs to `TAB_WIDTH` for the column count. A line with fewer
/// leading columns than `margin` is emitted with only its own leading
/// whitespace, never more.
fn strip_margin(line: &str, margin: usize) -> String {
    if margin == 0 {
        return line.to_string();
    }
    let mut col = 0usize;
    let mut byte_idx = 0usize;
    for c in line.chars() {
        if col >= margin {
            break;
        }
        if c == ' ' || c == '\t' {
            col += if c == '\t' { TAB_WIDTH - (col % TAB_WIDTH) } else { 1 };
            byte_idx += c.len_utf8();
        } else {
            break;
        }
    }
    line[byte_idx..].to_string()
}
