//! EPP (embedded Puppet) template tokenization: text interleaved with
//! `<% ... %>` (code, statement) and `<%= ... %>` (code, expression-prints)
//! tags.

#[derive(Debug, Clone, PartialEq)]
pub enum EppSegment {
    Text(String),
    Code(String),
    PrintingCode(String),
}

/// Splits raw EPP source into alternating text/code segments. The returned
/// segments are handed to the ordinary [`Lexer`](super::Lexer)/parser for
/// each `Code`/`PrintingCode` body; `Text` segments become string literal
/// pieces in the synthesized EPP body.
pub struct EppLexer<'a> {
    source: &'a str,
}

impl<'a> EppLexer<'a> {
    pub fn new(source: &'a str) -> Self {
        EppLexer { source }
    }

    pub fn segments(&self) -> Vec<EppSegment> {
        let mut out = Vec::new();
        let mut rest = self.source;
        loop {
            match rest.find("<%") {
                None => {
                    if !rest.is_empty() {
                        out.push(EppSegment::Text(rest.to_string()));
                    }
                    break;
                }
                Some(idx) => {
                    if idx > 0 {
                        out.push(EppSegment::Text(rest[..idx].to_string()));
                    }
                    let after_open = &rest[idx + 2..];
                    let (printing, after_marker) = if let Some(stripped) = after_open.strip_prefix('=') {
                        (true, stripped)
                    } else {
                        (false, after_open)
                    };
                    match after_marker.find("%>") {
                        None => {
                            // Unterminated tag: treat remainder as code,
                            // matching the lexer's lean-forward recovery
                            // style rather than failing hard here; the
                            // nested parser will report the real fault.
                            let code = after_marker.to_string();
                            out.push(if printing { EppSegment::PrintingCode(code) } else { EppSegment::Code(code) });
                            break;
                        }
                        Some(end) => {
                            let code = after_marker[..end].to_string();
                            out.push(if printing { EppSegment::PrintingCode(code) } else { EppSegment::Code(code) });
                            rest = &after_marker[end + 2..];
                        }
                    }
                }
            }
        }
        out
    }
}
