//! Recursive-descent parser: token stream to [`Ast`].
//!
//! Statement-level productions live here; expression-level productions
//! (primary, postfix chains, precedence climbing over the flat
//! `(BinOp, Ast)` vector) live in [`expr`]. Both halves are methods on the
//! same [`Parser`] so either side can call into the other without a
//! public seam between them.

mod expr;

use crate::ast::{
    Ast, AstKind, AttributeName, AttributeOp, CaseOption, HostMatcher, HostMatcherKind, Parameter,
    PostfixOp, ResourceBody, SyntaxTree,
};
use crate::fault::ParseFault;
use crate::lexer::Lexer;
use crate::position::Span;
use crate::token::{Token, TokenKind};

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    path: Option<String>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str) -> Result<Self, ParseFault> {
        Self::with_path(source, None)
    }

    pub fn with_path(source: &'a str, path: Option<String>) -> Result<Self, ParseFault> {
        let mut lexer = match &path {
            Some(p) => Lexer::with_path(source, p.clone()),
            None => Lexer::new(source),
        };
        let current = lexer.next_token().map_err(|e| ParseFault {
            message: e.message,
            span: e.span,
            column: e.column,
            path: path.clone(),
        })?;
        Ok(Parser { lexer, current, path })
    }

    fn fault(&self, message: impl Into<String>, span: Span) -> ParseFault {
        ParseFault {
            message: message.into(),
            column: span.column(self.lexer.source()),
            span,
            path: self.path.clone(),
        }
    }

    fn bump(&mut self) -> Result<Token, ParseFault> {
        let next = self.lexer.next_token().map_err(|e| ParseFault {
            message: e.message,
            span: e.span,
            column: e.column,
            path: self.path.clone(),
        })?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.current.kind == kind
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(&self.current.kind, TokenKind::Keyword(k) if *k == word)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseFault> {
        if self.current.kind == kind {
            self.bump()
        } else {
            Err(self.fault(format!("expected {}", what), self.current.span))
        }
    }

    fn name_text(&mut self, what: &str) -> Result<(String, Span), ParseFault> {
        match self.current.kind.clone() {
            TokenKind::Name(s) => {
                let span = self.current.span;
                self.bump()?;
                Ok((s, span))
            }
            TokenKind::Type(s) => {
                let span = self.current.span;
                self.bump()?;
                Ok((s, span))
            }
            _ => Err(self.fault(format!("expected {}", what), self.current.span)),
        }
    }

    /// Parses a whole manifest file into a [`SyntaxTree`].
    pub fn parse_manifest(source: &'a str, path: Option<String>) -> Result<SyntaxTree, ParseFault> {
        let mut parser = Parser::with_path(source, path.clone())?;
        let body = parser.parse_statements_until_eof()?;
        Ok(SyntaxTree { path, source: source.to_string(), parameters: None, body })
    }

    fn parse_statements_until_eof(&mut self) -> Result<Vec<Ast>, ParseFault> {
        let mut out = Vec::new();
        while !self.at(&TokenKind::Eof) {
            out.push(self.parse_statement()?);
            while self.at(&TokenKind::Semicolon) {
                self.bump()?;
            }
        }
        Ok(out)
    }

    fn parse_block(&mut self) -> Result<Vec<Ast>, ParseFault> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut out = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Eof) {
                return Err(self.fault("unexpected end of file inside block", self.current.span));
            }
            out.push(self.parse_statement()?);
            while self.at(&TokenKind::Semicolon) {
                self.bump()?;
            }
        }
        self.bump()?;
        Ok(out)
    }

    fn parse_statement(&mut self) -> Result<Ast, ParseFault> {
        match self.current.kind.clone() {
            TokenKind::Keyword("if") => self.parse_if(),
            TokenKind::Keyword("unless") => self.parse_unless(),
            TokenKind::Keyword("case") => self.parse_case(),
            TokenKind::Keyword("class") => self.parse_class(),
            TokenKind::Keyword("define") => self.parse_defined_type(),
            TokenKind::Keyword("node") => self.parse_node(),
            TokenKind::Keyword("function") => self.parse_function(),
            TokenKind::Keyword("type") => self.parse_type_alias(),
            TokenKind::Keyword("application") => self.parse_application(),
            TokenKind::Keyword("site") => self.parse_site(),
            TokenKind::Keyword("produces") => self.parse_produces(),
            TokenKind::Keyword("consumes") => self.parse_consumes(),
            TokenKind::Variable(_) if self.assignment_ahead()? => self.parse_assignment(),
            _ => self.parse_expression_statement(),
        }
    }

    /// Looks one token past the current `$variable` to see if `=` follows,
    /// without consuming anything permanently: a bare variable is also a
    /// valid expression-statement, so this must not mistake a later
    /// unrelated `=>`/`==` for assignment. Single-token lookahead suffices
    /// since the lexer has already folded `==`/`=>`/`=~` into their own
    /// token kinds.
    fn assignment_ahead(&mut self) -> Result<bool, ParseFault> {
        if !matches!(self.current.kind, TokenKind::Variable(_)) {
            return Ok(false);
        }
        let cp = self.checkpoint();
        self.bump()?;
        let is_assign = self.at(&TokenKind::Assign);
        self.restore(cp);
        Ok(is_assign)
    }

    fn parse_assignment(&mut self) -> Result<Ast, ParseFault> {
        let (name, begin) = match self.current.kind.clone() {
            TokenKind::Variable(n) => {
                let span = self.current.span;
                self.bump()?;
                (n, span)
            }
            _ => unreachable!("caller checked assignment_ahead"),
        };
        self.expect(TokenKind::Assign, "'='")?;
        let value = self.parse_expression()?;
        let span = begin.merge(&value.span);
        Ok(Ast::new(
            AstKind::Assignment {
                target: Box::new(Ast::new(AstKind::Variable(name), begin)),
                value: Box::new(value),
            },
            span,
        ))
    }

    fn parse_if(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'if'
        let condition = self.parse_expression()?;
        let then_body = self.parse_block()?;
        let mut elsifs = Vec::new();
        while self.at_keyword("elsif") {
            self.bump()?;
            let cond = self.parse_expression()?;
            let body = self.parse_block()?;
            elsifs.push((cond, body));
        }
        let else_body = if self.at_keyword("else") {
            self.bump()?;
            self.parse_block()?
        } else {
            Vec::new()
        };
        let end = self.current.span;
        Ok(Ast::new(
            AstKind::If { condition: Box::new(condition), then_body, elsifs, else_body },
            begin.merge(&end),
        ))
    }

    fn parse_unless(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'unless'
        let condition = self.parse_expression()?;
        let then_body = self.parse_block()?;
        let else_body = if self.at_keyword("else") {
            self.bump()?;
            self.parse_block()?
        } else {
            Vec::new()
        };
        let end = self.current.span;
        Ok(Ast::new(
            AstKind::Unless { condition: Box::new(condition), then_body, else_body },
            begin.merge(&end),
        ))
    }

    fn parse_case(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'case'
        let subject = self.parse_expression()?;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut options = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let opt_begin = self.current.span;
            let mut values = Vec::new();
            let mut is_default = false;
            loop {
                if self.at_keyword("default") {
                    is_default = true;
                    self.bump()?;
                } else {
                    values.push(self.parse_expression()?);
                }
                if self.at(&TokenKind::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }
            self.expect(TokenKind::Colon, "':'")?;
            let body = self.parse_block()?;
            let end = self.current.span;
            options.push(CaseOption { values, is_default, body, span: opt_begin.merge(&end) });
        }
        self.bump()?; // '}'
        let end = self.current.span;
        Ok(Ast::new(AstKind::Case { subject: Box::new(subject), options }, begin.merge(&end)))
    }

    fn parse_parameters(&mut self) -> Result<Vec<Parameter>, ParseFault> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let begin = self.current.span;
            let type_expr = if matches!(self.current.kind, TokenKind::Type(_)) {
                Some(Box::new(self.parse_postfix_primary()?))
            } else {
                None
            };
            let captures_rest = if self.at(&TokenKind::Splat) {
                self.bump()?;
                true
            } else {
                false
            };
            let name = match self.current.kind.clone() {
                TokenKind::Variable(n) => {
                    self.bump()?;
                    n
                }
                _ => return Err(self.fault("expected parameter name", self.current.span)),
            };
            let default = if self.at(&TokenKind::Assign) {
                self.bump()?;
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };
            let end = self.current.span;
            params.push(Parameter { name, type_expr, default, captures_rest, span: begin.merge(&end) });
            if self.at(&TokenKind::Comma) {
                self.bump()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(params)
    }

    fn parse_class(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'class'
        if self.at(&TokenKind::LBrace) {
            // `class { 'title': ... }` is a resource-style class
            // declaration, not a class definition.
            let base = Ast::new(AstKind::Name("class".to_string()), begin);
            return self.parse_resource_declaration(base, false, false);
        }
        let (name, _) = self.name_text("class name")?;
        let parameters = if self.at(&TokenKind::LParen) { self.parse_parameters()? } else { Vec::new() };
        let parent = if self.at_keyword("inherits") {
            self.bump()?;
            Some(self.name_text("parent class name")?.0)
        } else {
            None
        };
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Class { name, parent, parameters, body }, begin.merge(&end)))
    }

    fn parse_defined_type(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'define'
        let (name, _) = self.name_text("defined type name")?;
        let parameters = if self.at(&TokenKind::LParen) { self.parse_parameters()? } else { Vec::new() };
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::DefinedType { name, parameters, body }, begin.merge(&end)))
    }

    fn parse_node(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'node'
        let mut hostnames = Vec::new();
        loop {
            let span = self.current.span;
            let kind = match self.current.kind.clone() {
                TokenKind::Regex(r) => {
                    self.bump()?;
                    HostMatcherKind::Regex(r)
                }
                TokenKind::Keyword("default") => {
                    self.bump()?;
                    HostMatcherKind::Default
                }
                TokenKind::Name(n) => {
                    self.bump()?;
                    let mut full = n;
                    while self.at(&TokenKind::Dot) {
                        self.bump()?;
                        full.push('.');
                        full.push_str(&self.name_text("host name segment")?.0);
                    }
                    HostMatcherKind::Name(full)
                }
                TokenKind::SingleQuotedString(s) => {
                    self.bump()?;
                    HostMatcherKind::Name(s)
                }
                TokenKind::StringLiteral(payload) => {
                    self.bump()?;
                    let text = payload
                        .parts
                        .iter()
                        .map(|p| match p {
                            crate::token::RawStringPart::Text(t) => t.clone(),
                            _ => String::new(),
                        })
                        .collect();
                    HostMatcherKind::Name(text)
                }
                _ => return Err(self.fault("expected a node host name", self.current.span)),
            };
            hostnames.push(HostMatcher { kind, span });
            if self.at(&TokenKind::Comma) {
                self.bump()?;
                continue;
            }
            break;
        }
        let parent = if self.at_keyword("inherits") {
            self.bump()?;
            Some(Box::new(self.parse_postfix_primary()?))
        } else {
            None
        };
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::NodeDef { hostnames, parent, body }, begin.merge(&end)))
    }

    fn parse_function(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'function'
        let (name, _) = self.name_text("function name")?;
        let parameters = self.parse_parameters()?;
        let return_type = if self.at(&TokenKind::ShiftRight) {
            self.bump()?;
            Some(Box::new(self.parse_postfix_primary()?))
        } else {
            None
        };
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Function { name, parameters, return_type, body }, begin.merge(&end)))
    }

    fn parse_type_alias(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'type'
        let (name, _) = self.name_text("type alias name")?;
        self.expect(TokenKind::Assign, "'='")?;
        let type_expr = self.parse_expression()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::TypeAlias { name, type_expr: Box::new(type_expr) }, begin.merge(&end)))
    }

    fn parse_application(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'application'
        let (name, _) = self.name_text("application name")?;
        let parameters = if self.at(&TokenKind::LParen) { self.parse_parameters()? } else { Vec::new() };
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Application { name, parameters, body }, begin.merge(&end)))
    }

    fn parse_site(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'site'
        let name = if let TokenKind::Name(n) = self.current.kind.clone() {
            self.bump()?;
            n
        } else {
            String::new()
        };
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Site { name, body }, begin.merge(&end)))
    }

    fn parse_produces(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'produces'
        let (resource_type, _) = self.name_text("capability resource type")?;
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Produces { resource_type, body }, begin.merge(&end)))
    }

    fn parse_consumes(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // 'consumes'
        let (resource_type, _) = self.name_text("capability resource type")?;
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Consumes { resource_type, body }, begin.merge(&end)))
    }

    fn parse_expression_statement(&mut self) -> Result<Ast, ParseFault> {
        if let TokenKind::StatementCall(name) = self.current.kind {
            return self.parse_statement_call(name);
        }
        if matches!(
            self.current.kind,
            TokenKind::At | TokenKind::AtAt | TokenKind::Name(_) | TokenKind::Type(_)
        ) {
            return self.parse_name_or_type_statement();
        }
        self.parse_expression()
    }

    fn checkpoint(&self) -> (usize, usize, Token) {
        (self.lexer.idx(), self.lexer.line(), self.current.clone())
    }

    fn restore(&mut self, (idx, line, current): (usize, usize, Token)) {
        self.lexer.seek(idx, line);
        self.lexer.set_after_value(crate::lexer::ends_value(&current.kind));
        self.current = current;
    }

    /// A statement starting with an optional `@`/`@@` virtual/exported
    /// marker followed by a `Name`/`Type` token: a resource declaration,
    /// resource-defaults expression, resource override, or (falling
    /// through) an ordinary expression that merely happens to start with a
    /// bare name or type reference.
    fn parse_name_or_type_statement(&mut self) -> Result<Ast, ParseFault> {
        let is_virtual = self.at(&TokenKind::At);
        let is_exported = self.at(&TokenKind::AtAt);
        if is_virtual || is_exported {
            self.bump()?;
        }
        let span0 = self.current.span;
        let (is_type, text) = match self.current.kind.clone() {
            TokenKind::Type(t) => (true, t),
            TokenKind::Name(n) => (false, n),
            _ => return Err(self.fault("expected a resource type after '@'", self.current.span)),
        };
        self.bump()?;
        if is_type && (self.at(&TokenKind::PipeLeft) || self.at(&TokenKind::PipeLeftLeft)) {
            return self.parse_collector(text);
        }
        let base = Ast::new(if is_type { AstKind::Type(text) } else { AstKind::Name(text) }, span0);

        if self.at(&TokenKind::LBrace) {
            if is_virtual || is_exported {
                return self.parse_resource_declaration(base, is_virtual, is_exported);
            }
            let cp = self.checkpoint();
            self.bump()?; // '{'
            let looks_like_declaration = if self.at(&TokenKind::RBrace) {
                true
            } else {
                let probe_ok = self.parse_expression().is_ok();
                probe_ok && self.at(&TokenKind::Colon)
            };
            self.restore(cp);
            return if looks_like_declaration {
                self.parse_resource_declaration(base, is_virtual, is_exported)
            } else {
                self.parse_resource_defaults(base)
            };
        }

        let postfixed = self.continue_postfix_chain(base)?;
        let has_access = matches!(
            &postfixed.kind,
            AstKind::Postfix { ops, .. } if ops.iter().any(|o| matches!(o, PostfixOp::Access(_)))
        );
        if has_access && self.at(&TokenKind::LBrace) {
            return self.parse_resource_override(postfixed);
        }
        self.parse_binop_rest(postfixed)
    }

    /// Bare statement calls (`include foo, bar`, `notice "x"`) accept a
    /// comma-separated argument list with or without parens and never take
    /// a trailing block.
    fn parse_statement_call(&mut self, name: &'static str) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?;
        let mut args = Vec::new();
        let parenthesized = self.at(&TokenKind::LParen);
        if parenthesized {
            self.bump()?;
        }
        let stops_statement = matches!(
            self.current.kind,
            TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof | TokenKind::RParen
        );
        if !stops_statement {
            loop {
                args.push(self.parse_expression()?);
                if self.at(&TokenKind::Comma) {
                    self.bump()?;
                    continue;
                }
                break;
            }
        }
        if parenthesized {
            self.expect(TokenKind::RParen, "')'")?;
        }
        let end = self.current.span;
        Ok(Ast::new(
            AstKind::FunctionCall { name: name.to_string(), args, block: None },
            begin.merge(&end),
        ))
    }

    /// Parses the body of a `type_expr { ... }` construct once the caller
    /// has determined (via `expr::resource_shape_ahead`) that this is a
    /// resource declaration rather than an override or defaults form.
    pub(super) fn parse_resource_declaration(
        &mut self,
        type_name: Ast,
        is_virtual: bool,
        is_exported: bool,
    ) -> Result<Ast, ParseFault> {
        let begin = type_name.span;
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut bodies = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let body_begin = self.current.span;
            let title = self.parse_expression()?;
            self.expect(TokenKind::Colon, "':'")?;
            let attributes = self.parse_attribute_list(&[TokenKind::Semicolon, TokenKind::RBrace])?;
            let end = self.current.span;
            bodies.push(ResourceBody { title, attributes, span: body_begin.merge(&end) });
            if self.at(&TokenKind::Semicolon) {
                self.bump()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        let end = self.current.span;
        Ok(Ast::new(
            AstKind::Resource { type_name: Box::new(type_name), bodies, is_virtual, is_exported },
            begin.merge(&end),
        ))
    }

    pub(super) fn parse_resource_override(&mut self, reference: Ast) -> Result<Ast, ParseFault> {
        let begin = reference.span;
        self.expect(TokenKind::LBrace, "'{'")?;
        let attributes = self.parse_attribute_list(&[TokenKind::RBrace])?;
        self.expect(TokenKind::RBrace, "'}'")?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::ResourceOverride { reference: Box::new(reference), attributes }, begin.merge(&end)))
    }

    pub(super) fn parse_resource_defaults(&mut self, type_name: Ast) -> Result<Ast, ParseFault> {
        let begin = type_name.span;
        self.expect(TokenKind::LBrace, "'{'")?;
        let attributes = self.parse_attribute_list(&[TokenKind::RBrace])?;
        self.expect(TokenKind::RBrace, "'}'")?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::ResourceDefaults { type_name: Box::new(type_name), attributes }, begin.merge(&end)))
    }

    fn parse_attribute_list(&mut self, stop_tokens: &[TokenKind]) -> Result<Vec<crate::ast::Attribute>, ParseFault> {
        let mut attrs = Vec::new();
        loop {
            if stop_tokens.iter().any(|t| self.at(t)) {
                break;
            }
            let begin = self.current.span;
            let name = if self.at(&TokenKind::Splat) {
                self.bump()?;
                AttributeName::Splat
            } else {
                match self.current.kind.clone() {
                    TokenKind::Name(n) => {
                        self.bump()?;
                        AttributeName::Named(n)
                    }
                    TokenKind::Keyword(k) => {
                        self.bump()?;
                        AttributeName::Named(k.to_string())
                    }
                    TokenKind::SingleQuotedString(s) => {
                        self.bump()?;
                        AttributeName::Named(s)
                    }
                    _ => return Err(self.fault("expected attribute name", self.current.span)),
                }
            };
            let operator = if self.at(&TokenKind::PlusArrow) {
                self.bump()?;
                AttributeOp::Append
            } else {
                self.expect(TokenKind::FatArrow, "'=>'")?;
                AttributeOp::Assignment
            };
            let value = self.parse_expression()?;
            let end = value.span;
            attrs.push(crate::ast::Attribute { name, operator, value, span: begin.merge(&end) });
            if self.at(&TokenKind::Comma) {
                self.bump()?;
            } else {
                break;
            }
        }
        Ok(attrs)
    }

    /// Parses a `<| query |>` / `<<| query |>>` collector, called once the
    /// caller has consumed the resource type name.
    pub(super) fn parse_collector(&mut self, type_name: String) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        let exported = self.at(&TokenKind::PipeLeftLeft);
        let close = if exported { TokenKind::PipeRightRight } else { TokenKind::PipeRight };
        self.bump()?; // '<|' or '<<|'
        let query = if self.at(&close) { None } else { Some(Box::new(self.parse_expression()?)) };
        self.expect(close, "collector close")?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Collector { type_name, query, exported }, begin.merge(&end)))
    }
}

/// Parses the `${ ... }` raw text captured by the lexer, stopping at the
/// first unmatched `}`: the entry point the string interpolator re-enters
/// the parser through.
pub fn interpolate_parse(raw: &str) -> Result<Ast, ParseFault> {
    let mut parser = Parser::new(raw)?;
    parser.parse_expression()
}

/// Parses a whole EPP document: interleaved text/code, yielding a
/// synthetic body that prints text segments and evaluates code segments in
/// order.
pub fn parse_epp(source: &str, path: Option<String>) -> Result<SyntaxTree, ParseFault> {
    use crate::lexer::{EppLexer, EppSegment};

    let segments = EppLexer::new(source).segments();
    let mut parameters = None;
    let mut body = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        match segment {
            EppSegment::Text(text) => {
                body.push(Ast::new(
                    AstKind::FunctionCall {
                        name: "$epp_print".to_string(),
                        args: vec![Ast::new(AstKind::PlainString(text.clone()), Span::point(crate::position::Position::start()))],
                        block: None,
                    },
                    Span::point(crate::position::Position::start()),
                ));
            }
            EppSegment::Code(code) => {
                if i == 0 {
                    if let Some(params) = try_parse_epp_params(code, path.clone())? {
                        parameters = Some(params);
                        continue;
                    }
                }
                let mut sub = Parser::with_path(code, path.clone())?;
                body.extend(sub.parse_statements_until_eof()?);
            }
            EppSegment::PrintingCode(code) => {
                let mut sub = Parser::with_path(code, path.clone())?;
                let expr = sub.parse_expression()?;
                let span = expr.span;
                body.push(Ast::new(
                    AstKind::FunctionCall { name: "$epp_print".to_string(), args: vec![expr], block: None },
                    span,
                ));
            }
        }
    }
    Ok(SyntaxTree { path, source: source.to_string(), parameters, body })
}

/// The opening `<%- |$x, $y = 1| -%>` parameter tag, if the first code
/// segment is one.
fn try_parse_epp_params(code: &str, path: Option<String>) -> Result<Option<Vec<Parameter>>, ParseFault> {
    let trimmed = code.trim().trim_start_matches('-').trim();
    if !trimmed.starts_with('|') {
        return Ok(None);
    }
    let mut parser = Parser::with_path(trimmed, path)?;
    parser.expect(TokenKind::Pipe, "'|'")?;
    let mut params = Vec::new();
    while !parser.at(&TokenKind::Pipe) {
        let begin = parser.current.span;
        let type_expr = if matches!(parser.current.kind, TokenKind::Type(_)) {
            Some(Box::new(parser.parse_postfix_primary()?))
        } else {
            None
        };
        let name = match parser.current.kind.clone() {
            TokenKind::Variable(n) => {
                parser.bump()?;
                n
            }
            _ => return Err(parser.fault("expected parameter name", parser.current.span)),
        };
        let default = if parser.at(&TokenKind::Assign) {
            parser.bump()?;
            Some(Box::new(parser.parse_expression()?))
        } else {
            None
        };
        let end = parser.current.span;
        params.push(Parameter { name, type_expr, default, captures_rest: false, span: begin.merge(&end) });
        if parser.at(&TokenKind::Comma) {
            parser.bump()?;
        } else {
            break;
        }
    }
    parser.expect(TokenKind::Pipe, "'|'")?;
    Ok(Some(params))
}
