//! Expression-level productions: primary, postfix chains (access, method
//! call, selector), and the flat binary-operator vector consumed by the
//! evaluator's precedence climb.

use super::Parser;
use crate::ast::{Ast, AstKind, BinOp, Lambda, Parameter, PostfixOp, SelectorCase, StringPart, UnaryOp};
use crate::fault::ParseFault;
use crate::position::Span;
use crate::token::{RawStringPart, StringPayload, TokenKind};

impl<'a> Parser<'a> {
    /// Full expression: unary/postfix primary plus a flat `(op, rhs)` tail.
    pub(super) fn parse_expression(&mut self) -> Result<Ast, ParseFault> {
        let primary = self.parse_unary()?;
        self.parse_binop_rest(primary)
    }

    pub(super) fn parse_binop_rest(&mut self, primary: Ast) -> Result<Ast, ParseFault> {
        let mut rest = Vec::new();
        while let Some(op) = self.peek_binop() {
            self.bump()?;
            let rhs = self.parse_unary()?;
            rest.push((op, rhs));
        }
        if rest.is_empty() {
            Ok(primary)
        } else {
            let span = primary.span.merge(&rest.last().unwrap().1.span);
            Ok(Ast::new(AstKind::Expression { primary: Box::new(primary), rest }, span))
        }
    }

    fn peek_binop(&self) -> Option<BinOp> {
        match &self.current.kind {
            TokenKind::Plus => Some(BinOp::Add),
            TokenKind::Minus => Some(BinOp::Sub),
            TokenKind::Star => Some(BinOp::Mul),
            TokenKind::Slash => Some(BinOp::Div),
            TokenKind::Percent => Some(BinOp::Mod),
            TokenKind::ShiftLeft => Some(BinOp::ShiftLeft),
            TokenKind::ShiftRight => Some(BinOp::ShiftRight),
            TokenKind::Eq => Some(BinOp::Eq),
            TokenKind::NotEq => Some(BinOp::NotEq),
            TokenKind::Lt => Some(BinOp::Lt),
            TokenKind::Le => Some(BinOp::Le),
            TokenKind::Gt => Some(BinOp::Gt),
            TokenKind::Ge => Some(BinOp::Ge),
            TokenKind::Match => Some(BinOp::Match),
            TokenKind::NotMatch => Some(BinOp::NotMatch),
            TokenKind::InArrow => Some(BinOp::RelBefore),
            TokenKind::InArrowSub => Some(BinOp::RelNotify),
            TokenKind::OutArrow => Some(BinOp::RelRequire),
            TokenKind::OutArrowSub => Some(BinOp::RelSubscribe),
            TokenKind::Keyword("in") => Some(BinOp::In),
            TokenKind::Keyword("and") => Some(BinOp::And),
            TokenKind::Keyword("or") => Some(BinOp::Or),
            _ => None,
        }
    }

    fn parse_unary(&mut self) -> Result<Ast, ParseFault> {
        let span = self.current.span;
        match self.current.kind {
            TokenKind::Not => {
                self.bump()?;
                let operand = self.parse_unary()?;
                let full = span.merge(&operand.span);
                Ok(Ast::new(AstKind::Unary { op: UnaryOp::Not, operand: Box::new(operand) }, full))
            }
            TokenKind::Minus => {
                self.bump()?;
                let operand = self.parse_unary()?;
                let full = span.merge(&operand.span);
                Ok(Ast::new(AstKind::Unary { op: UnaryOp::Neg, operand: Box::new(operand) }, full))
            }
            TokenKind::Splat => {
                self.bump()?;
                let operand = self.parse_unary()?;
                let full = span.merge(&operand.span);
                Ok(Ast::new(AstKind::Unary { op: UnaryOp::Splat, operand: Box::new(operand) }, full))
            }
            _ => self.parse_postfix_primary(),
        }
    }

    pub(super) fn parse_postfix_primary(&mut self) -> Result<Ast, ParseFault> {
        let primary = self.parse_primary()?;
        self.continue_postfix_chain(primary)
    }

    pub(super) fn continue_postfix_chain(&mut self, primary: Ast) -> Result<Ast, ParseFault> {
        let begin = primary.span;
        let mut ops: Vec<PostfixOp> = Vec::new();
        loop {
            match &self.current.kind {
                TokenKind::Dot => {
                    let op_begin = self.current.span;
                    self.bump()?;
                    let (name, _) = self.name_text("method name")?;
                    let mut args = Vec::new();
                    if self.at(&TokenKind::LParen) {
                        self.bump()?;
                        while !self.at(&TokenKind::RParen) {
                            args.push(self.parse_expression()?);
                            if self.at(&TokenKind::Comma) {
                                self.bump()?;
                            } else {
                                break;
                            }
                        }
                        self.expect(TokenKind::RParen, "')'")?;
                    }
                    let block = self.parse_lambda_opt()?;
                    let end = self.current.span;
                    ops.push(PostfixOp::MethodCall { name, args, block, span: op_begin.merge(&end) });
                }
                TokenKind::LBracket => {
                    self.bump()?;
                    let mut items = Vec::new();
                    while !self.at(&TokenKind::RBracket) {
                        items.push(self.parse_expression()?);
                        if self.at(&TokenKind::Comma) {
                            self.bump()?;
                        } else {
                            break;
                        }
                    }
                    self.expect(TokenKind::RBracket, "']'")?;
                    ops.push(PostfixOp::Access(items));
                }
                TokenKind::Question => {
                    self.bump()?;
                    self.expect(TokenKind::LBrace, "'{'")?;
                    let mut cases = Vec::new();
                    while !self.at(&TokenKind::RBrace) {
                        let is_default = self.at_keyword("default");
                        let value = if is_default {
                            let s = self.current.span;
                            self.bump()?;
                            Ast::new(AstKind::Default, s)
                        } else {
                            self.parse_expression()?
                        };
                        self.expect(TokenKind::FatArrow, "'=>'")?;
                        let result = self.parse_expression()?;
                        cases.push(SelectorCase { value, is_default, result });
                        if self.at(&TokenKind::Comma) {
                            self.bump()?;
                        } else {
                            break;
                        }
                    }
                    self.expect(TokenKind::RBrace, "'}'")?;
                    ops.push(PostfixOp::Selector(cases));
                }
                _ => break,
            }
        }
        if ops.is_empty() {
            Ok(primary)
        } else {
            let end = self.current.span;
            Ok(Ast::new(AstKind::Postfix { primary: Box::new(primary), ops }, begin.merge(&end)))
        }
    }

    fn parse_primary(&mut self) -> Result<Ast, ParseFault> {
        let span = self.current.span;
        match self.current.kind.clone() {
            TokenKind::Keyword("undef") => {
                self.bump()?;
                Ok(Ast::new(AstKind::Undef, span))
            }
            TokenKind::Keyword("default") => {
                self.bump()?;
                Ok(Ast::new(AstKind::Default, span))
            }
            TokenKind::Keyword("true") => {
                self.bump()?;
                Ok(Ast::new(AstKind::Boolean(true), span))
            }
            TokenKind::Keyword("false") => {
                self.bump()?;
                Ok(Ast::new(AstKind::Boolean(false), span))
            }
            TokenKind::Keyword("if") => self.parse_if(),
            TokenKind::Keyword("unless") => self.parse_unless(),
            TokenKind::Keyword("case") => self.parse_case(),
            TokenKind::Number(n) => {
                self.bump()?;
                Ok(Ast::new(AstKind::Number(n), span))
            }
            TokenKind::SingleQuotedString(s) => {
                self.bump()?;
                Ok(Ast::new(AstKind::PlainString(s), span))
            }
            TokenKind::StringLiteral(payload) => {
                self.bump()?;
                self.build_string_ast(payload, span)
            }
            TokenKind::Regex(r) => {
                self.bump()?;
                Ok(Ast::new(AstKind::Regex(r), span))
            }
            TokenKind::Variable(name) => {
                self.bump()?;
                Ok(Ast::new(AstKind::Variable(name), span))
            }
            TokenKind::LParen => {
                self.bump()?;
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_array(),
            TokenKind::LBrace => self.parse_hash(),
            TokenKind::Pipe => {
                let lambda = self.parse_lambda_opt()?.expect("caller checked for '|'");
                let lspan = lambda.span;
                Ok(Ast::new(AstKind::Lambda(lambda), lspan))
            }
            TokenKind::Name(n) => {
                self.bump()?;
                if self.at(&TokenKind::LParen) {
                    self.parse_call_tail(n, span)
                } else {
                    Ok(Ast::new(AstKind::BareWord(n), span))
                }
            }
            TokenKind::Type(t) => {
                self.bump()?;
                if self.at(&TokenKind::PipeLeft) || self.at(&TokenKind::PipeLeftLeft) {
                    self.parse_collector(t)
                } else {
                    Ok(Ast::new(AstKind::Type(t), span))
                }
            }
            TokenKind::StatementCall(name) => {
                self.bump()?;
                if self.at(&TokenKind::LParen) {
                    self.parse_call_tail(name.to_string(), span)
                } else {
                    Ok(Ast::new(AstKind::BareWord(name.to_string()), span))
                }
            }
            other => Err(self.fault(format!("unexpected token {:?}", other), span)),
        }
    }

    fn parse_call_tail(&mut self, name: String, begin: Span) -> Result<Ast, ParseFault> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        while !self.at(&TokenKind::RParen) {
            args.push(self.parse_expression()?);
            if self.at(&TokenKind::Comma) {
                self.bump()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        let block = self.parse_lambda_opt()?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::FunctionCall { name, args, block }, begin.merge(&end)))
    }

    fn parse_lambda_opt(&mut self) -> Result<Option<Lambda>, ParseFault> {
        if !self.at(&TokenKind::Pipe) {
            return Ok(None);
        }
        let begin = self.current.span;
        self.bump()?;
        let mut params = Vec::new();
        while !self.at(&TokenKind::Pipe) {
            let pbegin = self.current.span;
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
                _ => return Err(self.fault("expected lambda parameter", self.current.span)),
            };
            let default = if self.at(&TokenKind::Assign) {
                self.bump()?;
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };
            let pend = self.current.span;
            params.push(Parameter { name, type_expr, default, captures_rest, span: pbegin.merge(&pend) });
            if self.at(&TokenKind::Comma) {
                self.bump()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::Pipe, "'|'")?;
        let body = self.parse_block()?;
        let end = self.current.span;
        Ok(Some(Lambda { parameters: params, body, span: begin.merge(&end) }))
    }

    fn parse_array(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // '['
        let mut items = Vec::new();
        while !self.at(&TokenKind::RBracket) {
            items.push(self.parse_expression()?);
            if self.at(&TokenKind::Comma) {
                self.bump()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBracket, "']'")?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Array(items), begin.merge(&end)))
    }

    fn parse_hash(&mut self) -> Result<Ast, ParseFault> {
        let begin = self.current.span;
        self.bump()?; // '{'
        let mut pairs = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let key = self.parse_expression()?;
            self.expect(TokenKind::FatArrow, "'=>'")?;
            let value = self.parse_expression()?;
            pairs.push((key, value));
            if self.at(&TokenKind::Comma) {
                self.bump()?;
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        let end = self.current.span;
        Ok(Ast::new(AstKind::Hash(pairs), begin.merge(&end)))
    }

    /// Converts the lexer's escape-resolved, interpolation-split
    /// [`StringPayload`] into an AST string node, re-entering the parser
    /// for each `${...}` piece.
    fn build_string_ast(&self, payload: StringPayload, span: Span) -> Result<Ast, ParseFault> {
        if !payload.interpolated {
            let text = payload
                .parts
                .into_iter()
                .map(|p| match p {
                    RawStringPart::Text(t) => t,
                    _ => String::new(),
                })
                .collect();
            return Ok(Ast::new(AstKind::PlainString(text), span));
        }
        let mut parts = Vec::with_capacity(payload.parts.len());
        for part in payload.parts {
            match part {
                RawStringPart::Text(t) => parts.push(StringPart::Text(t)),
                RawStringPart::BareVariable(name) => {
                    parts.push(StringPart::Expr(Box::new(Ast::new(AstKind::Variable(name), span))))
                }
                RawStringPart::Expr(raw) => {
                    let parsed = super::interpolate_parse(&raw).map_err(|e| self.fault(e.message, span))?;
                    parts.push(StringPart::Expr(Box::new(promote_interpolated_name(parsed))));
                }
            }
        }
        Ok(Ast::new(AstKind::Interpolated(parts), span))
    }
}

/// `${title}` means the variable `$title`, not the bare word `title`:
/// a name at the head of an interpolated expression is a variable
/// lookup, including through a postfix chain (`${hash['key']}`).
fn promote_interpolated_name(ast: Ast) -> Ast {
    let span = ast.span;
    match ast.kind {
        AstKind::BareWord(name) | AstKind::Name(name) => Ast::new(AstKind::Variable(name), span),
        AstKind::Postfix { primary, ops } => {
            let primary = Box::new(promote_interpolated_name(*primary));
            Ast::new(AstKind::Postfix { primary, ops }, span)
        }
        other => Ast::new(other, span),
    }
}
