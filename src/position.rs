//! Source positions and spans.
//!
//! A [`Position`] is a `(offset, line)` pair into a single source string; a
//! [`Span`] is a `(begin, end)` pair of positions referring to a contiguous
//! range of that source. Every token and every AST node carries a `Span`.

use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
}

impl Position {
    pub const fn start() -> Self {
        Position { offset: 0, line: 1 }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset.cmp(&other.offset)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}

/// A contiguous range `[begin, end)` in one source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub begin: Position,
    pub end: Position,
}

impl Span {
    pub fn new(begin: Position, end: Position) -> Self {
        Span { begin, end }
    }

    /// A zero-width span at the given position, used for synthetic nodes.
    pub fn point(pos: Position) -> Self {
        Span { begin: pos, end: pos }
    }

    /// The smallest span covering both `self` and `other`.
    pub fn merge(&self, other: &Span) -> Span {
        let begin = if self.begin.offset <= other.begin.offset {
            self.begin
        } else {
            other.begin
        };
        let end = if self.end.offset >= other.end.offset {
            self.end
        } else {
            other.end
        };
        Span { begin, end }
    }

    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.begin.offset.min(source.len())..self.end.offset.min(source.len())]
    }

    /// Column (1-based) computed by scanning back to the last line start.
    pub fn column(&self, source: &str) -> usize {
        let upto = &source[..self.begin.offset.min(source.len())];
        match upto.rfind('\n') {
            Some(idx) => self.begin.offset - idx,
            None => self.begin.offset + 1,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.begin.line, self.end.line)
    }
}
