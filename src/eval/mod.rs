//! The statement/expression walker.
//!
//! [`Evaluator`] ties together [`operators`] (binary/unary application),
//! [`interpolate`] (string interpolation), [`resource`] (the
//! resource-declaration and override algorithm) and [`builtins`] (the
//! function table) against a live [`Context`].

pub mod builtins;
pub mod interpolate;
pub mod operators;
pub mod resource;

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{Ast, AstKind, BinOp, CaseOption, Lambda, Parameter, PostfixOp, SelectorCase};
use crate::catalog::Relation;
use crate::context::Context;
use crate::fault::{EvalFault, FinalizationFault};
use crate::position::Span;
use crate::registry::normalize_name;
use crate::scope::{classify_variable_name, resolve_variable, Resolved, ScopeTable, VariableKind};
use crate::value::{Type, Value};

use operators::BinaryOutcome;

#[derive(Debug, Clone)]
struct UserFunctionDef {
    parameters: Vec<Parameter>,
    body: Vec<Ast>,
}

/// One dispatch of an embedder-defined native function:
/// `signature` is expected to be a `Callable[...]` type used to pick the
/// implementation matching a call's argument count and types, the same
/// role Puppet's own multi-`dispatch` functions give a type signature.
/// The embedding layer is what actually builds these from C callbacks;
/// this module only needs to store and select between them.
#[derive(Clone)]
pub struct NativeDispatch {
    pub signature: Type,
    pub callback: Rc<dyn Fn(&mut Evaluator, &mut Context, Vec<Value>, Option<&Lambda>, Span) -> Result<Value, EvalFault>>,
}

fn native_dispatch_matches(signature: &Type, args: &[Value]) -> bool {
    match signature {
        Type::Callable { params, min, max } => {
            let min = min.unwrap_or(params.len() as i64);
            let max = max.unwrap_or(params.len() as i64);
            let count = args.len() as i64;
            count >= min && count <= max && params.iter().zip(args.iter()).all(|(p, a)| p.is_instance(a))
        }
        // A non-Callable specification (or one this crate's parser
        // couldn't resolve further) is treated as "accepts any call",
        // matching how a function with no explicit dispatch works.
        _ => true,
    }
}

fn select_native_dispatch<'a>(dispatches: &'a [NativeDispatch], args: &[Value]) -> Option<&'a NativeDispatch> {
    dispatches.iter().find(|d| native_dispatch_matches(&d.signature, args))
}

/// Walks a validated, registry-scanned [`crate::ast::SyntaxTree`] body
/// against a [`Context`]. Stateless apart from the user-defined and
/// native function tables and a counter used to name lambda scopes
/// uniquely.
#[derive(Default)]
pub struct Evaluator {
    functions: HashMap<String, UserFunctionDef>,
    native_functions: HashMap<String, Vec<NativeDispatch>>,
    lambda_seq: u64,
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator::default()
    }

    /// Recursively collects every `function` definition reachable from
    /// `body` (including inside classes, defines, nodes, sites, and
    /// applications) so a function can be called before its textual
    /// definition, the same way classes and defined types can.
    pub fn hoist_functions(&mut self, body: &[Ast]) {
        for stmt in body {
            match &stmt.kind {
                AstKind::Function { name, parameters, body: fbody, .. } => {
                    self.functions.insert(normalize_name(name), UserFunctionDef { parameters: parameters.clone(), body: fbody.clone() });
                }
                AstKind::Class { body: inner, .. }
                | AstKind::DefinedType { body: inner, .. }
                | AstKind::NodeDef { body: inner, .. }
                | AstKind::Site { body: inner, .. }
                | AstKind::Application { body: inner, .. } => self.hoist_functions(inner),
                _ => {}
            }
        }
    }

    /// Registers an embedder-provided native function under `name`.
    /// Returns `false` if `name` already names a Puppet or native
    /// function, mirroring `puppet_define_function`'s redefinition guard.
    pub fn define_function(&mut self, name: &str, dispatches: Vec<NativeDispatch>) -> bool {
        let key = normalize_name(name);
        if self.functions.contains_key(&key) || self.native_functions.contains_key(&key) {
            return false;
        }
        self.native_functions.insert(key, dispatches);
        true
    }

    pub fn eval_body(&mut self, body: &[Ast], ctx: &mut Context) -> Result<Value, EvalFault> {
        let mut last = Value::Undef;
        for stmt in body {
            last = self.eval(stmt, ctx)?;
        }
        Ok(last)
    }

    pub fn eval(&mut self, ast: &Ast, ctx: &mut Context) -> Result<Value, EvalFault> {
        let span = ast.span;
        match &ast.kind {
            AstKind::Undef => Ok(Value::Undef),
            AstKind::Default => Ok(Value::Default),
            AstKind::Boolean(b) => Ok(Value::Boolean(*b)),
            AstKind::Number(lit) => Ok(number_value(lit)),
            AstKind::PlainString(s) => Ok(Value::String(s.clone())),
            AstKind::Interpolated(parts) => {
                let text = interpolate::evaluate(parts, span, |expr| self.eval(expr, ctx))?;
                Ok(Value::String(text))
            }
            AstKind::Regex(pattern) => Ok(Value::Regex(pattern.clone())),
            AstKind::Variable(name) => self.eval_variable(ctx, name, span),
            AstKind::Name(name) => Ok(Value::string(name.clone())),
            AstKind::BareWord(word) => Ok(Value::string(word.clone())),
            AstKind::Type(name) => Ok(Value::Type(bare_type(name))),
            AstKind::Array(items) => {
                let values = items.iter().map(|i| self.eval(i, ctx)).collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Array(values))
            }
            AstKind::Hash(pairs) => {
                let values = pairs
                    .iter()
                    .map(|(k, v)| Ok((self.eval(k, ctx)?, self.eval(v, ctx)?)))
                    .collect::<Result<Vec<_>, EvalFault>>()?;
                Ok(Value::Hash(values))
            }
            AstKind::If { condition, then_body, elsifs, else_body } => {
                self.eval_if(ctx, condition, then_body, elsifs, else_body)
            }
            AstKind::Unless { condition, then_body, else_body } => {
                if self.eval(condition, ctx)?.is_truthy() {
                    self.eval_body(else_body, ctx)
                } else {
                    self.eval_body(then_body, ctx)
                }
            }
            AstKind::Case { subject, options } => self.eval_case(ctx, subject, options),
            AstKind::FunctionCall { name, args, block } => self.eval_function_call(ctx, name, args, block.as_ref(), span),
            AstKind::Resource { type_name, bodies, is_virtual, is_exported } => {
                resource::eval_resource(self, ctx, type_name, bodies, *is_virtual, *is_exported)
            }
            AstKind::ResourceOverride { reference, attributes } => {
                resource::eval_resource_override(self, ctx, reference, attributes, span)
            }
            AstKind::ResourceDefaults { .. } => Err(EvalFault::not_yet_implemented("resource default expressions", span)),
            AstKind::Class { .. } | AstKind::DefinedType { .. } | AstKind::NodeDef { .. } | AstKind::TypeAlias { .. } => {
                // Already captured by the registry scan that runs before
                // evaluation; encountering the defining statement again
                // while walking a block is a no-op.
                Ok(Value::Undef)
            }
            AstKind::Collector { type_name, query, exported } => {
                ctx.queue_collector(crate::context::QueuedCollector {
                    type_name: type_name.clone(),
                    exported: *exported,
                    query: query.as_deref().cloned(),
                    span,
                    matched: false,
                });
                Ok(Value::Array(Vec::new()))
            }
            AstKind::Function { .. } => Ok(Value::Undef),
            AstKind::Produces { .. } => Err(EvalFault::not_yet_implemented("produces blocks", span)),
            AstKind::Consumes { .. } => Err(EvalFault::not_yet_implemented("consumes blocks", span)),
            AstKind::Application { .. } => Err(EvalFault::not_yet_implemented("application definitions", span)),
            AstKind::Site { .. } => Err(EvalFault::not_yet_implemented("site blocks", span)),
            AstKind::Unary { op, operand } => {
                let value = self.eval(operand, ctx)?;
                operators::apply_unary(*op, value, span)
            }
            AstKind::Postfix { primary, ops } => self.eval_postfix(ctx, primary, ops, span),
            AstKind::Expression { primary, rest } => self.eval_expression(ctx, primary, rest, span),
            AstKind::Assignment { target, value } => {
                let v = self.eval(value, ctx)?;
                self.bind(ctx, target, v.clone())?;
                Ok(v)
            }
            AstKind::Lambda(_) => Err(EvalFault::new("a lambda cannot be evaluated outside of a function call", span)),
        }
    }

    fn eval_variable(&self, ctx: &Context, name: &str, span: Span) -> Result<Value, EvalFault> {
        match resolve_variable(&ctx.scopes, &ctx.matches, ctx.current_scope(), name) {
            Resolved::Value(v) => Ok(Value::VariableRef(v)),
            Resolved::Undef => {
                // The top scope is backed by the session's fact source: a
                // name with no binding anywhere on the scope chain falls
                // through to a fact lookup before resolving to undef.
                match classify_variable_name(name) {
                    VariableKind::Local(fact) | VariableKind::TopScope(fact) => {
                        Ok(ctx.facts.lookup(fact).unwrap_or(Value::Undef))
                    }
                    _ => Ok(Value::Undef),
                }
            }
            Resolved::UnqualifiedMissingScope(scope_name) => {
                let reason = if ctx.registry.class(&scope_name).is_some() {
                    "has not been declared"
                } else {
                    "has not been defined"
                };
                ctx.logger.log(
                    crate::log::LogLevel::Warning,
                    span,
                    span.column(&ctx.source_text),
                    None,
                    format!("unknown variable '${}': class '{}' {}", name, scope_name, reason),
                );
                Ok(Value::Undef)
            }
        }
    }

    fn eval_if(
        &mut self,
        ctx: &mut Context,
        condition: &Ast,
        then_body: &[Ast],
        elsifs: &[(Ast, Vec<Ast>)],
        else_body: &[Ast],
    ) -> Result<Value, EvalFault> {
        if self.eval(condition, ctx)?.is_truthy() {
            return self.eval_body(then_body, ctx);
        }
        for (cond, body) in elsifs {
            if self.eval(cond, ctx)?.is_truthy() {
                return self.eval_body(body, ctx);
            }
        }
        self.eval_body(else_body, ctx)
    }

    fn eval_case(&mut self, ctx: &mut Context, subject: &Ast, options: &[CaseOption]) -> Result<Value, EvalFault> {
        let subject_value = self.eval(subject, ctx)?;
        let mut default: Option<&CaseOption> = None;
        for option in options {
            if option.is_default {
                default = Some(option);
                continue;
            }
            for candidate_ast in &option.values {
                if self.case_matches(ctx, candidate_ast, &subject_value)? {
                    return self.eval_body(&option.body, ctx);
                }
            }
        }
        match default {
            Some(option) => self.eval_body(&option.body, ctx),
            None => Ok(Value::Undef),
        }
    }

    fn case_matches(&mut self, ctx: &mut Context, candidate_ast: &Ast, subject: &Value) -> Result<bool, EvalFault> {
        if let AstKind::Unary { op: crate::ast::UnaryOp::Splat, operand } = &candidate_ast.kind {
            let array = self.eval(operand, ctx)?;
            let items = array.as_array().map(|s| s.to_vec()).unwrap_or_default();
            for item in items {
                if candidate_matches_value(&item, subject) {
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        let candidate = self.eval(candidate_ast, ctx)?;
        Ok(candidate_matches_value(&candidate, subject))
    }

    fn eval_function_call(
        &mut self,
        ctx: &mut Context,
        name: &str,
        args: &[Ast],
        block: Option<&Lambda>,
        span: Span,
    ) -> Result<Value, EvalFault> {
        let values = args.iter().map(|a| self.eval(a, ctx)).collect::<Result<Vec<_>, _>>()?;
        self.dispatch(ctx, name, values, block, span)
    }

    /// Resolves a call by name: Puppet `function` definitions first, then
    /// embedder-registered native dispatches, then the built-in table.
    fn dispatch(
        &mut self,
        ctx: &mut Context,
        name: &str,
        values: Vec<Value>,
        block: Option<&Lambda>,
        span: Span,
    ) -> Result<Value, EvalFault> {
        if let Some(def) = self.functions.get(&normalize_name(name)).cloned() {
            return self.invoke(&def.parameters, &def.body, values, ctx, span, format!("function:{}", normalize_name(name)), ScopeTable::TOP);
        }
        if let Some(dispatches) = self.native_functions.get(&normalize_name(name)).cloned() {
            let dispatch = select_native_dispatch(&dispatches, &values)
                .ok_or_else(|| EvalFault::new(format!("no matching dispatch for function '{}'", name), span))?
                .callback
                .clone();
            return dispatch(self, ctx, values, block, span);
        }
        builtins::call(self, ctx, name, values, block, span)
    }

    fn eval_postfix(&mut self, ctx: &mut Context, primary: &Ast, ops: &[PostfixOp], span: Span) -> Result<Value, EvalFault> {
        let mut current = self.eval(primary, ctx)?;
        for op in ops {
            current = match op {
                PostfixOp::Access(indices) => self.apply_access(ctx, &current, indices, span)?,
                PostfixOp::MethodCall { name, args, block, span: call_span } => {
                    let mut values = vec![current];
                    for arg in args {
                        values.push(self.eval(arg, ctx)?);
                    }
                    self.dispatch(ctx, name, values, block.as_ref(), *call_span)?
                }
                PostfixOp::Selector(cases) => self.apply_selector(ctx, &current, cases)?,
            };
        }
        Ok(current)
    }

    fn apply_access(&mut self, ctx: &mut Context, base: &Value, indices: &[Ast], span: Span) -> Result<Value, EvalFault> {
        // Indices resolve through variable handles so the match arms below
        // see the underlying value shapes.
        let index_values = indices
            .iter()
            .map(|i| self.eval(i, ctx).map(|v| v.resolve().clone()))
            .collect::<Result<Vec<_>, _>>()?;
        match base.resolve() {
            Value::Array(items) => array_access(items, &index_values, span),
            Value::Hash(pairs) => hash_access(pairs, &index_values),
            Value::String(s) => string_access(s, &index_values, span),
            Value::Type(Type::Resource { name: Some(type_name), title: None }) => {
                let titles: Vec<Value> = index_values
                    .into_iter()
                    .map(|v| Value::Type(Type::Resource { name: Some(type_name.clone()), title: Some(v.to_display_string()) }))
                    .collect();
                if titles.len() == 1 {
                    Ok(titles.into_iter().next().unwrap())
                } else {
                    Ok(Value::Array(titles))
                }
            }
            // A fully qualified reference accessed with an attribute name
            // reads that attribute off the declared resource, handed back
            // as an immutable variable.
            Value::Type(Type::Resource { name: Some(type_name), title: Some(title) }) => {
                let attr_name = index_values
                    .first()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| EvalFault::new("resource attribute access requires an attribute name", span))?;
                let id = ctx
                    .catalog
                    .find(type_name, title)
                    .ok_or_else(|| EvalFault::new(format!("{}['{}'] is not declared", type_name, title), span))?;
                let value = ctx.catalog.resource(id).attribute(&attr_name).cloned().unwrap_or(Value::Undef);
                Ok(Value::VariableRef(Rc::new(value)))
            }
            // `Resource['file', 'x']` (or `Resource[File, 'x']`) qualifies
            // the generic resource type.
            Value::Type(Type::Resource { name: None, title: None }) => {
                let type_name = index_values
                    .first()
                    .and_then(|v| match v.resolve() {
                        Value::String(s) => Some(normalize_name(s)),
                        Value::Type(Type::Resource { name: Some(n), .. }) => Some(n.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| EvalFault::new("Resource[] requires a resource type name", span))?;
                let title = index_values.get(1).map(|v| v.to_display_string());
                Ok(Value::Type(Type::Resource { name: Some(type_name), title }))
            }
            Value::Type(Type::Class(None)) => {
                let refs: Vec<Value> = index_values
                    .into_iter()
                    .map(|v| {
                        Value::Type(Type::Resource {
                            name: Some("class".to_string()),
                            title: Some(normalize_name(&v.to_display_string())),
                        })
                    })
                    .collect();
                if refs.len() == 1 {
                    Ok(refs.into_iter().next().unwrap())
                } else {
                    Ok(Value::Array(refs))
                }
            }
            Value::Type(base_type) => parameterize_type(base_type.clone(), &index_values, span).map(Value::Type),
            _ => Err(EvalFault::new("value does not support '[]' access", span)),
        }
    }

    fn apply_selector(&mut self, ctx: &mut Context, subject: &Value, cases: &[SelectorCase]) -> Result<Value, EvalFault> {
        let mut default: Option<&SelectorCase> = None;
        for case in cases {
            if case.is_default {
                default = Some(case);
                continue;
            }
            if self.case_matches(ctx, &case.value, subject)? {
                return self.eval(&case.result, ctx);
            }
        }
        match default {
            Some(case) => self.eval(&case.result, ctx),
            None => Ok(Value::Undef),
        }
    }

    fn eval_expression(&mut self, ctx: &mut Context, primary: &Ast, rest: &[(BinOp, Ast)], span: Span) -> Result<Value, EvalFault> {
        let first = self.eval(primary, ctx)?;
        let mut values = vec![first];
        let mut ops: Vec<BinOp> = Vec::new();
        for (op, rhs_ast) in rest {
            let rhs = self.eval(rhs_ast, ctx)?;
            while let Some(top) = ops.last().copied() {
                if top.precedence() >= op.precedence() {
                    ops.pop();
                    let right = values.pop().unwrap();
                    let left = values.pop().unwrap();
                    values.push(self.apply(ctx, top, left, right, span)?);
                } else {
                    break;
                }
            }
            ops.push(*op);
            values.push(rhs);
        }
        while let Some(top) = ops.pop() {
            let right = values.pop().unwrap();
            let left = values.pop().unwrap();
            values.push(self.apply(ctx, top, left, right, span)?);
        }
        Ok(values.pop().unwrap())
    }

    fn apply(&mut self, ctx: &mut Context, op: BinOp, left: Value, right: Value, span: Span) -> Result<Value, EvalFault> {
        match op {
            BinOp::RelBefore | BinOp::RelNotify | BinOp::RelRequire | BinOp::RelSubscribe => {
                apply_relationship(ctx, op, &left, &right, span)?;
                Ok(right)
            }
            _ => match operators::apply_binary(op, left, right, span)? {
                BinaryOutcome::Value(v) => Ok(v),
                BinaryOutcome::Match(v, frame) => {
                    ctx.push_match(frame);
                    Ok(v)
                }
            },
        }
    }

    fn bind(&mut self, ctx: &mut Context, target: &Ast, value: Value) -> Result<(), EvalFault> {
        match &target.kind {
            AstKind::Variable(name) => {
                let scope_name = ctx.current_scope().to_string();
                ctx.scopes.ensure_scope(&scope_name, None);
                if let Some(scope) = ctx.scopes.scope_mut(&scope_name) {
                    scope.set_local(name, value);
                }
                Ok(())
            }
            AstKind::Array(targets) => {
                let items = value
                    .as_array()
                    .ok_or_else(|| EvalFault::new("cannot destructure a non-array value", target.span))?
                    .to_vec();
                for (t, v) in targets.iter().zip(items.into_iter()) {
                    self.bind(ctx, t, v)?;
                }
                Ok(())
            }
            _ => Err(EvalFault::new("invalid assignment target", target.span)),
        }
    }

    fn invoke(
        &mut self,
        parameters: &[Parameter],
        body: &[Ast],
        args: Vec<Value>,
        ctx: &mut Context,
        span: Span,
        scope_name: String,
        parent_scope: &str,
    ) -> Result<Value, EvalFault> {
        ctx.scopes.ensure_scope(&scope_name, Some(parent_scope));
        ctx.push_scope(&scope_name);
        let result = match self.bind_parameters(ctx, &scope_name, parameters, args, span) {
            Ok(()) => self.eval_body(body, ctx),
            Err(e) => Err(e),
        };
        ctx.pop_scope();
        result.map_err(|e| push_backtrace_frame(e, &scope_name, span))
    }

    fn bind_parameters(
        &mut self,
        ctx: &mut Context,
        scope_name: &str,
        parameters: &[Parameter],
        mut args: Vec<Value>,
        span: Span,
    ) -> Result<(), EvalFault> {
        let captures_rest = parameters.last().map(|p| p.captures_rest).unwrap_or(false);
        let fixed_count = if captures_rest { parameters.len().saturating_sub(1) } else { parameters.len() };
        for (i, param) in parameters.iter().enumerate() {
            if captures_rest && i == parameters.len() - 1 {
                let rest = if args.len() > fixed_count { args.split_off(fixed_count) } else { Vec::new() };
                if let Some(scope) = ctx.scopes.scope_mut(scope_name) {
                    scope.set_local(&param.name, Value::Array(rest));
                }
                break;
            }
            let value = if i < args.len() {
                args[i].clone()
            } else if let Some(default_ast) = &param.default {
                self.eval(default_ast, ctx)?
            } else {
                return Err(EvalFault::new(format!("missing required argument '{}'", param.name), span));
            };
            if let Some(scope) = ctx.scopes.scope_mut(scope_name) {
                scope.set_local(&param.name, value);
            }
        }
        Ok(())
    }

    pub(crate) fn call_lambda(&mut self, lambda: &Lambda, args: Vec<Value>, ctx: &mut Context, span: Span) -> Result<Value, EvalFault> {
        self.lambda_seq += 1;
        let parent = ctx.current_scope().to_string();
        let scope_name = format!("{}#lambda{}", parent, self.lambda_seq);
        self.invoke(&lambda.parameters, &lambda.body, args, ctx, span, scope_name, &parent)
    }

    /// Renders a parsed EPP template (from [`crate::parser::parse_epp`]):
    /// binds the template's declared parameters (or, when it declares
    /// none, every supplied argument) in a fresh scope, pushes an
    /// output-stream overlay, walks the body, and returns the captured
    /// text.
    pub fn eval_epp(
        &mut self,
        tree: &crate::ast::SyntaxTree,
        arguments: &[(String, Value)],
        ctx: &mut Context,
    ) -> Result<String, EvalFault> {
        self.lambda_seq += 1;
        let scope_name = format!("epp#{}", self.lambda_seq);
        ctx.scopes.ensure_scope(&scope_name, Some(ScopeTable::TOP));
        match &tree.parameters {
            Some(parameters) => {
                for param in parameters {
                    let value = match arguments.iter().find(|(k, _)| k == &param.name) {
                        Some((_, v)) => v.clone(),
                        None => match &param.default {
                            Some(default_ast) => self.eval(default_ast, ctx)?,
                            None => {
                                return Err(EvalFault::new(
                                    format!("missing required template parameter '{}'", param.name),
                                    param.span,
                                ))
                            }
                        },
                    };
                    if let Some(scope) = ctx.scopes.scope_mut(&scope_name) {
                        scope.set_local(&param.name, value);
                    }
                }
            }
            None => {
                for (name, value) in arguments {
                    if let Some(scope) = ctx.scopes.scope_mut(&scope_name) {
                        scope.set_local(name, value.clone());
                    }
                }
            }
        }
        ctx.push_scope(&scope_name);
        ctx.push_stream();
        let result = self.eval_body(&tree.body, ctx);
        let output = ctx.pop_stream();
        ctx.pop_scope();
        result.map(|_| output)
    }
}

/// Records the scope a fault bubbled out of. Frames accumulate
/// outermost-first as the error unwinds, matching how the diagnostic
/// renderer prints them.
pub(crate) fn push_backtrace_frame(mut fault: EvalFault, scope_name: &str, span: Span) -> EvalFault {
    fault.backtrace.insert(0, crate::fault::BacktraceFrame { scope_name: scope_name.to_string(), span });
    fault
}

fn number_value(lit: &crate::token::NumberLiteral) -> Value {
    match lit {
        crate::token::NumberLiteral::Integer { value, .. } => Value::Integer(*value),
        crate::token::NumberLiteral::Float(f) => Value::Float(*f),
    }
}

fn bare_type(name: &str) -> Type {
    Type::parse(name).unwrap_or_else(|_| Type::Resource { name: Some(name.to_lowercase()), title: None })
}

fn candidate_matches_value(candidate: &Value, subject: &Value) -> bool {
    match candidate.resolve() {
        Value::Regex(pattern) => {
            let subject_text = subject.as_str();
            match (subject_text, regex::Regex::new(pattern)) {
                (Some(s), Ok(re)) => re.is_match(s),
                _ => false,
            }
        }
        Value::Type(t) => t.is_instance(subject),
        Value::Default if !matches!(subject.resolve(), Value::Default) => false,
        _ => candidate.equals(subject),
    }
}

/// Resolves a possibly length-relative index; `None` when a negative
/// index reaches past the front (out of range, never clamped back in).
fn resolve_relative_index(i: i64, len: i64) -> Option<usize> {
    if i < 0 {
        let adjusted = len + i;
        if adjusted < 0 {
            None
        } else {
            Some(adjusted as usize)
        }
    } else {
        Some(i as usize)
    }
}

/// The exclusive end of an `[start, count]` slice. A negative count is an
/// inclusive end index counted from the end of the collection.
fn resolve_slice_end(start: usize, count: i64, len: i64) -> usize {
    let end = if count < 0 { len + count + 1 } else { start as i64 + count };
    end.clamp(0, len) as usize
}

fn array_access(items: &[Value], indices: &[Value], span: Span) -> Result<Value, EvalFault> {
    let len = items.len() as i64;
    match indices {
        [Value::Integer(i)] => Ok(resolve_relative_index(*i, len)
            .and_then(|idx| items.get(idx))
            .cloned()
            .unwrap_or(Value::Undef)),
        [Value::Integer(start), Value::Integer(count)] => {
            let start = match resolve_relative_index(*start, len) {
                Some(s) => s,
                None => return Ok(Value::Array(Vec::new())),
            };
            let end = resolve_slice_end(start, *count, len);
            if end <= start {
                return Ok(Value::Array(Vec::new()));
            }
            Ok(Value::Array(items.get(start..end).map(|s| s.to_vec()).unwrap_or_default()))
        }
        _ => Err(EvalFault::new("array access requires one or two integer indices", span)),
    }
}

fn hash_access(pairs: &[(Value, Value)], indices: &[Value]) -> Result<Value, EvalFault> {
    let lookup = |key: &Value| pairs.iter().find(|(k, _)| k.equals(key)).map(|(_, v)| v.clone()).unwrap_or(Value::Undef);
    if indices.len() == 1 {
        Ok(lookup(&indices[0]))
    } else {
        Ok(Value::Array(indices.iter().map(lookup).collect()))
    }
}

fn string_access(s: &str, indices: &[Value], span: Span) -> Result<Value, EvalFault> {
    use unicode_segmentation::UnicodeSegmentation;
    let graphemes: Vec<&str> = s.graphemes(true).collect();
    let len = graphemes.len() as i64;
    match indices {
        [Value::Integer(i)] => Ok(Value::string(
            resolve_relative_index(*i, len).and_then(|idx| graphemes.get(idx)).copied().unwrap_or(""),
        )),
        [Value::Integer(start), Value::Integer(count)] => {
            let start = match resolve_relative_index(*start, len) {
                Some(idx) => idx,
                None => return Ok(Value::string("")),
            };
            let end = resolve_slice_end(start, *count, len);
            if end <= start {
                return Ok(Value::string(""));
            }
            Ok(Value::string(graphemes.get(start..end).map(|s| s.concat()).unwrap_or_default()))
        }
        _ => Err(EvalFault::new("string access requires one or two integer indices", span)),
    }
}

fn parameterize_type(base: Type, indices: &[Value], span: Span) -> Result<Type, EvalFault> {
    let as_type = |v: &Value| -> Option<Type> {
        match v.resolve() {
            Value::Type(t) => Some(t.clone()),
            _ => None,
        }
    };
    let as_int = |v: &Value| -> Option<i64> {
        match v.resolve() {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    };
    match base {
        Type::Array { .. } => {
            let has_leading_type = indices.first().and_then(as_type).is_some();
            let element = indices.first().and_then(as_type).map(Box::new).unwrap_or_else(|| Box::new(Type::Any));
            let (from, to) = int_range(indices, has_leading_type);
            Ok(Type::Array { element, from, to })
        }
        Type::Hash { .. } => {
            let key = indices.first().and_then(as_type).map(Box::new).unwrap_or_else(|| Box::new(Type::Any));
            let value = indices.get(1).and_then(as_type).map(Box::new).unwrap_or_else(|| Box::new(Type::Any));
            Ok(Type::Hash { key, value, from: None, to: None })
        }
        Type::Optional(_) => {
            let inner = indices.first().and_then(as_type).ok_or_else(|| EvalFault::new("Optional[] requires a type argument", span))?;
            Ok(Type::Optional(Box::new(inner)))
        }
        Type::NotUndef(_) => {
            let inner = indices.first().and_then(as_type).ok_or_else(|| EvalFault::new("NotUndef[] requires a type argument", span))?;
            Ok(Type::NotUndef(Box::new(inner)))
        }
        Type::Variant(_) => Ok(Type::Variant(indices.iter().filter_map(as_type).collect())),
        Type::Enum(_) => Ok(Type::Enum(indices.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())),
        Type::Pattern(_) => Ok(Type::Pattern(indices.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())),
        Type::Integer { .. } => {
            let from = indices.first().and_then(as_int);
            let to = indices.get(1).and_then(as_int);
            Ok(Type::Integer { from, to })
        }
        Type::Float { .. } => {
            let from = indices.first().and_then(|v| v.as_float());
            let to = indices.get(1).and_then(|v| v.as_float());
            Ok(Type::Float { from, to })
        }
        Type::StringType { .. } => {
            let from = indices.first().and_then(as_int);
            let to = indices.get(1).and_then(as_int);
            Ok(Type::StringType { from, to })
        }
        Type::Regexp(_) => Ok(Type::Regexp(indices.first().and_then(|v| v.as_str().map(str::to_string)))),
        other => Err(EvalFault::new(format!("{} is not a parameterizable type", other.name()), span)),
    }
}

fn int_range(indices: &[Value], has_leading_type: bool) -> (Option<i64>, Option<i64>) {
    let nums: Vec<i64> = indices
        .iter()
        .skip(if has_leading_type { 1 } else { 0 })
        .filter_map(|v| match v.resolve() {
            Value::Integer(i) => Some(*i),
            _ => None,
        })
        .collect();
    (nums.first().copied(), nums.get(1).copied())
}

/// Relationship operators (`-> ~> <- <~`) queue catalog edges between the
/// resources each side refers to. Edges are wired up at finalization so a
/// chain may name resources that are only declared later in the manifest
/// (or by a collector realization).
fn apply_relationship(ctx: &mut Context, op: BinOp, left: &Value, right: &Value, span: Span) -> Result<(), EvalFault> {
    let left_refs = resource::collect_references(left, span)?;
    let right_refs = resource::collect_references(right, span)?;
    for left_ref in &left_refs {
        for right_ref in &right_refs {
            let (source, target, relation) = match op {
                BinOp::RelBefore => (left_ref.clone(), right_ref.clone(), Relation::Before),
                BinOp::RelNotify => (left_ref.clone(), right_ref.clone(), Relation::Notify),
                BinOp::RelRequire => (right_ref.clone(), left_ref.clone(), Relation::Before),
                BinOp::RelSubscribe => (right_ref.clone(), left_ref.clone(), Relation::Notify),
                _ => unreachable!("only relationship operators reach apply_relationship"),
            };
            ctx.queue_relationship(crate::context::QueuedRelationship { source, target, relation, span });
        }
    }
    Ok(())
}

/// The per-pass closure [`Context::finalize`] drives to a fixed point:
/// try to realize virtual resources against every outstanding collector
/// query first, then evaluate any defined-type instances queued by
/// resource declarations whose own instance resource is no longer
/// virtual, so a collector realizing a virtual defined-type instance
/// and that instance's body expanding can both happen within the same
/// pass. Pending overrides are not retried here directly: they resolve
/// as a side effect of `declare_one` running for the first time a
/// matching `(type, title)` is added, which happens while a queued
/// defined type's body is walked, so their resolution already shows up
/// as defined-type progress.
pub fn run_finalization_pass(eval: &mut Evaluator, ctx: &mut Context) -> Result<bool, FinalizationFault> {
    let collectors_progressed = run_collectors(eval, ctx).map_err(eval_fault_to_finalization)?;
    let defined_types_progressed = run_defined_types(eval, ctx).map_err(eval_fault_to_finalization)?;
    Ok(collectors_progressed || defined_types_progressed)
}

fn eval_fault_to_finalization(fault: EvalFault) -> FinalizationFault {
    FinalizationFault { message: fault.message, span: fault.span }
}

fn run_defined_types(eval: &mut Evaluator, ctx: &mut Context) -> Result<bool, EvalFault> {
    let pending = ctx.take_pending_defined_types();
    if pending.is_empty() {
        return Ok(false);
    }
    let mut progressed = false;
    for instance in pending {
        let still_virtual = instance.container.map(|id| ctx.catalog.resource(id).is_virtual).unwrap_or(false);
        if still_virtual {
            ctx.queue_defined_type(instance);
            continue;
        }
        resource::declare_defined_type(eval, ctx, &instance)?;
        progressed = true;
    }
    Ok(progressed)
}

fn run_collectors(eval: &mut Evaluator, ctx: &mut Context) -> Result<bool, EvalFault> {
    let mut progressed = false;
    for index in 0..ctx.collectors.len() {
        let collector = ctx.collectors[index].clone();
        let candidates: Vec<_> = ctx.catalog.resources_of_type(&collector.type_name).collect();
        for id in candidates {
            let resource = ctx.catalog.resource(id).clone();
            if collector.exported && !resource.exported {
                continue;
            }
            if !resource::resource_matches_query(eval, ctx, &resource, collector.query.as_ref())? {
                continue;
            }
            ctx.collectors[index].matched = true;
            if resource.is_virtual {
                ctx.catalog.realize(id).map_err(|m| EvalFault::new(m, collector.span))?;
                progressed = true;
            }
        }
    }
    Ok(progressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::MapFactSource;
    use crate::log::{LogLevel as Lvl, MemorySink};
    use crate::parser::Parser;
    use std::sync::Arc;

    fn context() -> Context {
        Context::new("t.example.com", "production", Arc::new(MapFactSource::new()), Arc::new(MemorySink::new()), Lvl::Notice)
    }

    fn run(src: &str) -> (Value, Context) {
        let mut ctx = context();
        let body = Parser::parse_manifest(src, None).unwrap().body;
        ctx.registry.scan_and_commit(&body).unwrap();
        let mut eval = Evaluator::new();
        eval.hoist_functions(&body);
        let result = eval.eval_body(&body, &mut ctx).unwrap();
        (result, ctx)
    }

    #[test]
    fn arithmetic_expression_respects_precedence() {
        let (value, _) = run("1 + 2 * 3");
        assert!(value.equals(&Value::Integer(7)));
    }

    #[test]
    fn if_elsif_else_picks_the_first_truthy_branch() {
        let (value, _) = run("if false { 1 } elsif true { 2 } else { 3 }");
        assert!(value.equals(&Value::Integer(2)));
    }

    #[test]
    fn case_falls_back_to_default() {
        let (value, _) = run("case 'z' { 'a': { 1 } default: { 2 } }");
        assert!(value.equals(&Value::Integer(2)));
    }

    #[test]
    fn array_access_supports_negative_indices() {
        let (value, _) = run("[1, 2, 3][-1]");
        assert!(value.equals(&Value::Integer(3)));
    }

    #[test]
    fn variable_assignment_is_visible_to_later_statements() {
        let (value, _) = run("$x = 10 $x + 1");
        assert!(value.equals(&Value::Integer(11)));
    }

    #[test]
    fn user_defined_function_is_callable_before_its_definition_textually() {
        let (value, _) = run("double(5) function double($n) { $n * 2 }");
        assert!(value.equals(&Value::Integer(10)));
    }

    #[test]
    fn resource_defaults_are_not_yet_implemented() {
        let mut ctx = context();
        let body = Parser::parse_manifest("File { ensure => present }", None).unwrap().body;
        let mut eval = Evaluator::new();
        assert!(eval.eval_body(&body, &mut ctx).is_err());
    }

    #[test]
    fn relationship_arrow_creates_an_edge_at_finalization() {
        // The chain may name a resource declared after it appears.
        let (_, mut ctx) = run("File['a'] -> File['b'] file { 'a': } file { 'b': }");
        let mut eval = Evaluator::new();
        ctx.finalize(|ctx| run_finalization_pass(&mut eval, ctx)).unwrap();
        let a = ctx.catalog.find("file", "a").unwrap();
        let b = ctx.catalog.find("file", "b").unwrap();
        assert!(ctx.catalog.edges.iter().any(|e| e.source == b && e.target == a));
    }

    #[test]
    fn require_metaparameter_becomes_an_edge_at_finalization() {
        let (_, mut ctx) = run("file { 'a': require => File['b'] } file { 'b': }");
        let mut eval = Evaluator::new();
        ctx.finalize(|ctx| run_finalization_pass(&mut eval, ctx)).unwrap();
        let a = ctx.catalog.find("file", "a").unwrap();
        let b = ctx.catalog.find("file", "b").unwrap();
        assert!(ctx.catalog.edges.iter().any(|e| e.source == a && e.target == b && matches!(e.relation, crate::catalog::Relation::Require)));
    }

    #[test]
    fn finalize_evaluates_queued_defined_type_instances() {
        let (_, mut ctx) = run("define app($mode) { file { '/tmp/app': mode => $mode } } app { 'one': mode => '0600' }");
        let mut eval = Evaluator::new();
        ctx.finalize(|ctx| run_finalization_pass(&mut eval, ctx)).unwrap();
        let id = ctx.catalog.find("file", "/tmp/app").unwrap();
        assert!(ctx.catalog.resource(id).attribute("mode").unwrap().equals(&Value::string("0600")));
    }

    #[test]
    fn finalize_defers_a_virtual_defined_type_instance_until_realized() {
        let (_, mut ctx) =
            run("define app($mode) { file { '/tmp/app': mode => $mode } } @app { 'one': mode => '0600', tag => 'web' } App <| tag == 'web' |>");
        let mut eval = Evaluator::new();
        ctx.finalize(|ctx| run_finalization_pass(&mut eval, ctx)).unwrap();
        let instance_id = ctx.catalog.find("app", "one").unwrap();
        assert!(!ctx.catalog.resource(instance_id).is_virtual);
        let file_id = ctx.catalog.find("file", "/tmp/app").unwrap();
        assert!(ctx.catalog.resource(file_id).attribute("mode").unwrap().equals(&Value::string("0600")));
    }

    #[test]
    fn finalize_realizes_virtual_resources_matching_a_collector() {
        let (_, mut ctx) = run("@file { 'a': tag => 'web' } @file { 'b': tag => 'db' } File <| tag == 'web' |>");
        let mut eval = Evaluator::new();
        ctx.finalize(|ctx| run_finalization_pass(&mut eval, ctx)).unwrap();
        let a = ctx.catalog.find("file", "a").unwrap();
        let b = ctx.catalog.find("file", "b").unwrap();
        assert!(!ctx.catalog.resource(a).is_virtual);
        assert!(ctx.catalog.resource(b).is_virtual);
    }

    #[test]
    fn a_native_function_is_reachable_the_same_way_as_a_puppet_one() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        eval.define_function(
            "double",
            vec![NativeDispatch {
                signature: Type::Callable { params: vec![Type::Numeric], min: None, max: None },
                callback: Rc::new(|_eval, _ctx, args, _block, span| match args.first() {
                    Some(v) if v.as_integer().is_some() => Ok(Value::Integer(v.as_integer().unwrap() * 2)),
                    _ => Err(EvalFault::new("double() requires a numeric argument", span)),
                }),
            }],
        );
        let body = Parser::parse_manifest("double(21)", None).unwrap().body;
        let result = eval.eval_body(&body, &mut ctx).unwrap();
        assert!(result.equals(&Value::Integer(42)));
    }

    #[test]
    fn defining_a_native_function_over_an_existing_name_fails() {
        let mut eval = Evaluator::new();
        let dispatch = || {
            vec![NativeDispatch { signature: Type::Any, callback: Rc::new(|_, _, _, _, _| Ok(Value::Undef)) }]
        };
        assert!(eval.define_function("greet", dispatch()));
        assert!(!eval.define_function("greet", dispatch()));
    }

    #[test]
    fn a_native_function_can_yield_to_its_block() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        eval.define_function(
            "call_twice",
            vec![NativeDispatch {
                signature: Type::Any,
                callback: Rc::new(|eval, ctx, _args, block, span| {
                    let lambda = block.ok_or_else(|| EvalFault::new("call_twice() requires a block", span))?;
                    let first = eval.call_lambda(lambda, vec![Value::Integer(1)], ctx, span)?;
                    let second = eval.call_lambda(lambda, vec![Value::Integer(2)], ctx, span)?;
                    Ok(Value::Array(vec![first, second]))
                }),
            }],
        );
        let body = Parser::parse_manifest("call_twice() |$x| { $x * 10 }", None).unwrap().body;
        let result = eval.eval_body(&body, &mut ctx).unwrap();
        assert!(result.equals(&Value::Array(vec![Value::Integer(10), Value::Integer(20)])));
    }
}
