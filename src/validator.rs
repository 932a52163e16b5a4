//! Tree-walking legality checks that run after parsing and before the
//! definition scan. These never touch a scope or evaluate
//! anything; they only reject shapes the rest of the pipeline could not
//! make sense of.

use std::collections::HashSet;

use crate::ast::{Ast, AstKind, HostMatcherKind, Lambda, Parameter};
use crate::fault::ValidationFault;
use crate::position::Span;

/// Names every resource carries implicitly; a defined type or class cannot
/// declare a parameter that would shadow one of these.
pub const RESERVED_PARAMETER_NAMES: &[&str] = &["title", "name"];

/// Built-in attributes accepted on every resource regardless of type.
pub const METAPARAMETERS: &[&str] = &[
    "before", "notify", "require", "subscribe", "alias", "tag", "noop", "loglevel", "stage",
    "schedule", "audit",
];

/// Type names the language defines itself; `type X = ...` cannot reuse one.
pub const BUILTIN_TYPE_NAMES: &[&str] = &[
    "Any", "Undef", "Default", "Boolean", "Scalar", "Numeric", "Integer", "Float", "String",
    "Regexp", "Pattern", "Enum", "Array", "Hash", "Tuple", "Struct", "Collection", "Data",
    "Optional", "NotUndef", "Variant", "Callable", "Type", "Runtime", "Resource", "Class",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    TopLevel,
    InsideClass,
    InsideSite,
    Nested,
}

// Column 1 here: the walk has no source text; `Fault::locate` fills in
// the real column at the pipeline boundary.
fn fault(message: impl Into<String>, span: Span) -> ValidationFault {
    ValidationFault { message: message.into(), span, column: 1, path: None }
}

/// Validates a whole parsed manifest body. Entry point used before the
/// definition scan.
pub fn validate(body: &[Ast]) -> Result<(), ValidationFault> {
    for stmt in body {
        validate_node(stmt, Ctx::TopLevel)?;
    }
    Ok(())
}

fn validate_block(body: &[Ast], ctx: Ctx) -> Result<(), ValidationFault> {
    for stmt in body {
        validate_node(stmt, ctx)?;
    }
    Ok(())
}

fn validate_node(ast: &Ast, ctx: Ctx) -> Result<(), ValidationFault> {
    match &ast.kind {
        AstKind::Class { name, parameters, body, .. } => {
            if !matches!(ctx, Ctx::TopLevel | Ctx::InsideClass) {
                return Err(fault("a class may only be declared at top level or inside another class", ast.span));
            }
            validate_definition_name(name, ctx, ast.span)?;
            validate_parameters(parameters, false, true)?;
            validate_block(body, Ctx::InsideClass)
        }
        AstKind::DefinedType { name, parameters, body, .. } => {
            if !matches!(ctx, Ctx::TopLevel | Ctx::InsideClass) {
                return Err(fault("a defined type may only be declared at top level or inside a class", ast.span));
            }
            validate_definition_name(name, ctx, ast.span)?;
            validate_parameters(parameters, false, true)?;
            validate_block(body, Ctx::Nested)
        }
        AstKind::NodeDef { hostnames, parent, body } => {
            if !matches!(ctx, Ctx::TopLevel | Ctx::InsideClass) {
                return Err(fault("a node definition may only appear at top level or inside a class", ast.span));
            }
            for h in hostnames {
                if let HostMatcherKind::Name(n) = &h.kind {
                    validate_hostname_token(n, h.span)?;
                }
            }
            if let Some(p) = parent {
                validate_node(p, Ctx::Nested)?;
            }
            validate_block(body, Ctx::Nested)
        }
        AstKind::Function { parameters, body, .. } => {
            if ctx != Ctx::TopLevel {
                return Err(fault("a function may only be declared at top level", ast.span));
            }
            validate_parameters(parameters, false, false)?;
            validate_block(body, Ctx::Nested)
        }
        AstKind::Application { parameters, body, .. } => {
            if ctx != Ctx::TopLevel {
                return Err(fault("an application may only be declared at top level", ast.span));
            }
            validate_parameters(parameters, false, false)?;
            validate_block(body, Ctx::Nested)
        }
        AstKind::Site { body, .. } => {
            if ctx != Ctx::TopLevel {
                return Err(fault("a site may only be declared at top level", ast.span));
            }
            validate_block(body, Ctx::InsideSite)
        }
        AstKind::TypeAlias { name, type_expr } => {
            if ctx != Ctx::TopLevel {
                return Err(fault("a type alias may only be declared at top level", ast.span));
            }
            if BUILTIN_TYPE_NAMES.iter().any(|b| *b == name.as_str()) {
                return Err(fault(format!("'{}' is a built-in type and cannot be redefined", name), ast.span));
            }
            validate_node(type_expr, Ctx::Nested)
        }
        AstKind::Produces { body, .. } | AstKind::Consumes { body, .. } => {
            if !matches!(ctx, Ctx::TopLevel | Ctx::InsideSite) {
                return Err(fault("produces/consumes may only appear at top level or inside a site", ast.span));
            }
            validate_block(body, Ctx::Nested)
        }
        AstKind::If { condition, then_body, elsifs, else_body } => {
            validate_node(condition, Ctx::Nested)?;
            validate_block(then_body, Ctx::Nested)?;
            for (cond, body) in elsifs {
                validate_node(cond, Ctx::Nested)?;
                validate_block(body, Ctx::Nested)?;
            }
            validate_block(else_body, Ctx::Nested)
        }
        AstKind::Unless { condition, then_body, else_body } => {
            validate_node(condition, Ctx::Nested)?;
            validate_block(then_body, Ctx::Nested)?;
            validate_block(else_body, Ctx::Nested)
        }
        AstKind::Case { subject, options } => {
            validate_node(subject, Ctx::Nested)?;
            for opt in options {
                for v in &opt.values {
                    validate_node(v, Ctx::Nested)?;
                }
                validate_block(&opt.body, Ctx::Nested)?;
            }
            Ok(())
        }
        AstKind::Resource { type_name, bodies, .. } => {
            validate_node(type_name, Ctx::Nested)?;
            for body in bodies {
                validate_node(&body.title, Ctx::Nested)?;
                for attr in &body.attributes {
                    validate_node(&attr.value, Ctx::Nested)?;
                }
            }
            Ok(())
        }
        AstKind::ResourceOverride { reference, attributes } => {
            validate_node(reference, Ctx::Nested)?;
            for attr in attributes {
                validate_node(&attr.value, Ctx::Nested)?;
            }
            Ok(())
        }
        AstKind::ResourceDefaults { type_name, attributes } => {
            validate_node(type_name, Ctx::Nested)?;
            for attr in attributes {
                validate_node(&attr.value, Ctx::Nested)?;
            }
            Ok(())
        }
        AstKind::Collector { query, .. } => {
            if let Some(q) = query {
                validate_node(q, Ctx::Nested)?;
            }
            Ok(())
        }
        AstKind::Assignment { target, value } => {
            validate_assignment_target(target)?;
            validate_node(value, Ctx::Nested)
        }
        AstKind::FunctionCall { args, block, .. } => {
            for a in args {
                validate_node(a, Ctx::Nested)?;
            }
            if let Some(l) = block {
                validate_lambda(l)?;
            }
            Ok(())
        }
        AstKind::Array(items) => {
            for i in items {
                validate_node(i, Ctx::Nested)?;
            }
            Ok(())
        }
        AstKind::Hash(pairs) => {
            for (k, v) in pairs {
                validate_node(k, Ctx::Nested)?;
                validate_node(v, Ctx::Nested)?;
            }
            Ok(())
        }
        AstKind::Unary { operand, .. } => validate_node(operand, Ctx::Nested),
        AstKind::Postfix { primary, ops } => {
            validate_node(primary, Ctx::Nested)?;
            for op in ops {
                match op {
                    crate::ast::PostfixOp::Access(items) => {
                        for i in items {
                            validate_node(i, Ctx::Nested)?;
                        }
                    }
                    crate::ast::PostfixOp::MethodCall { args, block, .. } => {
                        for a in args {
                            validate_node(a, Ctx::Nested)?;
                        }
                        if let Some(l) = block {
                            validate_lambda(l)?;
                        }
                    }
                    crate::ast::PostfixOp::Selector(cases) => {
                        for case in cases {
                            if !case.is_default {
                                validate_node(&case.value, Ctx::Nested)?;
                            }
                            validate_node(&case.result, Ctx::Nested)?;
                        }
                    }
                }
            }
            Ok(())
        }
        AstKind::Expression { primary, rest } => {
            validate_node(primary, Ctx::Nested)?;
            for (_, rhs) in rest {
                validate_node(rhs, Ctx::Nested)?;
            }
            Ok(())
        }
        AstKind::Lambda(lambda) => validate_lambda(lambda),
        AstKind::Interpolated(parts) => {
            for part in parts {
                if let crate::ast::StringPart::Expr(e) = part {
                    validate_node(e, Ctx::Nested)?;
                }
            }
            Ok(())
        }
        // Leaves with nothing to check.
        AstKind::Undef
        | AstKind::Default
        | AstKind::Boolean(_)
        | AstKind::Number(_)
        | AstKind::PlainString(_)
        | AstKind::Regex(_)
        | AstKind::Variable(_)
        | AstKind::Name(_)
        | AstKind::BareWord(_)
        | AstKind::Type(_) => Ok(()),
    }
}

fn validate_lambda(lambda: &Lambda) -> Result<(), ValidationFault> {
    validate_parameters(&lambda.parameters, true, false)?;
    validate_block(&lambda.body, Ctx::Nested)
}

/// `captures_rest` parameters (`*$rest`) must come last and are only legal
/// on lambdas. Required parameters cannot follow optional ones, and a
/// default expression cannot reach forward to a later parameter.
fn validate_parameters(
    params: &[Parameter],
    allow_captures_rest: bool,
    check_reserved: bool,
) -> Result<(), ValidationFault> {
    let mut seen_optional = false;
    for (i, p) in params.iter().enumerate() {
        if p.captures_rest {
            if !allow_captures_rest {
                return Err(fault("a captures-rest parameter is only permitted in a lambda", p.span));
            }
            if i != params.len() - 1 {
                return Err(fault("a captures-rest parameter must be the last parameter", p.span));
            }
        }
        if check_reserved {
            if RESERVED_PARAMETER_NAMES.contains(&p.name.as_str()) {
                return Err(fault(format!("parameter '${}' collides with a reserved name", p.name), p.span));
            }
            if METAPARAMETERS.contains(&p.name.as_str()) {
                return Err(fault(format!("parameter '${}' collides with a metaparameter", p.name), p.span));
            }
        }
        match &p.default {
            Some(default) => {
                seen_optional = true;
                let mut referenced = HashSet::new();
                collect_variables(default, &mut referenced);
                for later in &params[i + 1..] {
                    if referenced.contains(&later.name) {
                        return Err(fault(
                            format!("default value of parameter '${}' references later parameter '${}'", p.name, later.name),
                            default.span,
                        ));
                    }
                }
            }
            None if seen_optional && !p.captures_rest => {
                return Err(fault(
                    format!("required parameter '${}' cannot follow an optional parameter", p.name),
                    p.span,
                ));
            }
            None => {}
        }
    }
    Ok(())
}

/// Finds every `$name` referenced in `ast`, not descending into a nested
/// lambda body (that is a separate parameter scope).
fn collect_variables(ast: &Ast, out: &mut HashSet<String>) {
    match &ast.kind {
        AstKind::Variable(name) => {
            out.insert(name.clone());
        }
        AstKind::Array(items) => items.iter().for_each(|i| collect_variables(i, out)),
        AstKind::Hash(pairs) => pairs.iter().for_each(|(k, v)| {
            collect_variables(k, out);
            collect_variables(v, out);
        }),
        AstKind::Unary { operand, .. } => collect_variables(operand, out),
        AstKind::Expression { primary, rest } => {
            collect_variables(primary, out);
            rest.iter().for_each(|(_, rhs)| collect_variables(rhs, out));
        }
        AstKind::Postfix { primary, ops } => {
            collect_variables(primary, out);
            for op in ops {
                if let crate::ast::PostfixOp::Access(items) = op {
                    items.iter().for_each(|i| collect_variables(i, out));
                }
            }
        }
        AstKind::FunctionCall { args, .. } => args.iter().for_each(|a| collect_variables(a, out)),
        AstKind::Interpolated(parts) => {
            for part in parts {
                if let crate::ast::StringPart::Expr(e) = part {
                    collect_variables(e, out);
                }
            }
        }
        // Lambdas open a fresh parameter scope: their bodies are opaque here.
        AstKind::Lambda(_) => {}
        _ => {}
    }
}

/// Rejects assigning to anything but a local variable, or an array
/// (recursively) of local variables. Match variables (`$1`, `$2`, …) are
/// never assignable.
fn validate_assignment_target(target: &Ast) -> Result<(), ValidationFault> {
    match &target.kind {
        AstKind::Variable(name) => {
            if name.chars().all(|c| c.is_ascii_digit()) && !name.is_empty() {
                return Err(fault(format!("'${}' is a match variable and cannot be assigned", name), target.span));
            }
            if name.contains("::") {
                return Err(fault("cannot assign to a qualified variable name", target.span));
            }
            Ok(())
        }
        AstKind::Array(items) => {
            for item in items {
                validate_assignment_target(item)?;
            }
            Ok(())
        }
        _ => Err(fault("assignment target must be a variable or an array of variables", target.span)),
    }
}

fn validate_definition_name(name: &str, ctx: Ctx, span: Span) -> Result<(), ValidationFault> {
    if name.starts_with("::") {
        return Err(fault(format!("'{}' cannot begin with '::'", name), span));
    }
    if ctx == Ctx::TopLevel && (name == "main" || name == "settings") {
        return Err(fault(format!("'{}' is a reserved name at top level", name), span));
    }
    Ok(())
}

fn validate_hostname_token(name: &str, span: Span) -> Result<(), ValidationFault> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(fault(format!("'{}' is not a valid node host name", name), span))
    }
}
