//! Built-in function dispatch.
//!
//! Bare statement calls (`include foo`) arrive here as ordinary
//! `FunctionCall` nodes; [`crate::token::STATEMENT_CALLS`] only tells the
//! parser to accept them without parentheses, there is no separate AST
//! variant, so this is the single place that special-cases their names.

use crate::ast::Lambda;
use crate::context::Context;
use crate::fault::EvalFault;
use crate::log::LogLevel;
use crate::position::Span;
use crate::value::{IterationItem, Type, Value};

use super::resource::{collect_references, declare_class};
use super::Evaluator;

pub fn call(
    eval: &mut Evaluator,
    ctx: &mut Context,
    name: &str,
    args: Vec<Value>,
    block: Option<&Lambda>,
    span: Span,
) -> Result<Value, EvalFault> {
    match name {
        "include" | "require" => include_or_require(eval, ctx, name, args, span),
        "contain" => contain(eval, ctx, args, span),
        "realize" => realize(ctx, args, span),
        "defined" => Ok(Value::Boolean(args.iter().all(|v| is_defined(ctx, v)))),
        "tag" => {
            if let Some(id) = ctx.current_resource() {
                for arg in &args {
                    let tag = arg.to_display_string();
                    let resource = ctx.catalog.resource_mut(id);
                    if !resource.tags.contains(&tag) {
                        resource.tags.push(tag);
                    }
                }
            }
            Ok(Value::Undef)
        }
        "fail" => Err(EvalFault::new(join_messages(&args), span)),
        "import" => Err(EvalFault::not_yet_implemented("import", span)),
        // Synthesized by the EPP parser for text segments and `<%= %>`
        // expressions; not reachable from manifest source ('$' is not a
        // legal function name character).
        "$epp_print" => {
            let text = join_messages(&args);
            if !ctx.write_stream(&text) {
                return Err(EvalFault::new("template output occurred outside of a template evaluation", span));
            }
            Ok(Value::Undef)
        }
        "debug" => log(ctx, LogLevel::Debug, &args, span),
        "info" => log(ctx, LogLevel::Info, &args, span),
        "notice" => log(ctx, LogLevel::Notice, &args, span),
        "warning" => log(ctx, LogLevel::Warning, &args, span),
        "err" => log(ctx, LogLevel::Error, &args, span),
        "versioncmp" => versioncmp(&args, span),
        "shellquote" => Ok(Value::string(shellquote(&args))),
        "each" => each(eval, ctx, args, block, span),
        "map" => map(eval, ctx, args, block, span),
        "filter" => filter(eval, ctx, args, block, span),
        "reduce" => reduce(eval, ctx, args, block, span),
        "with" => match block {
            Some(lambda) => eval.call_lambda(lambda, args, ctx, span),
            None => Err(EvalFault::new("'with' requires a block", span)),
        },
        _ => Err(EvalFault::new(format!("Unknown function: '{}'", name), span)),
    }
}

fn join_messages(args: &[Value]) -> String {
    args.iter().map(Value::to_display_string).collect::<Vec<_>>().join(" ")
}

fn log(ctx: &mut Context, level: LogLevel, args: &[Value], span: Span) -> Result<Value, EvalFault> {
    let column = span.column(&ctx.source_text);
    ctx.logger.log(level, span, column, None, join_messages(args));
    Ok(Value::Undef)
}

fn include_or_require(eval: &mut Evaluator, ctx: &mut Context, name: &str, args: Vec<Value>, span: Span) -> Result<Value, EvalFault> {
    let source = ctx.current_resource();
    for arg in &args {
        for class_name in class_names_of(arg) {
            declare_class(eval, ctx, &class_name, Vec::new(), span)?;
            if name == "require" {
                if let (Some(source_id), Some(target_id)) = (source, ctx.catalog.find("class", &class_name)) {
                    ctx.catalog.add_edge(source_id, target_id, crate::catalog::Relation::Require).map_err(|m| EvalFault::new(m, span))?;
                }
            }
        }
    }
    Ok(Value::Undef)
}

fn contain(eval: &mut Evaluator, ctx: &mut Context, args: Vec<Value>, span: Span) -> Result<Value, EvalFault> {
    for arg in &args {
        for class_name in class_names_of(arg) {
            declare_class(eval, ctx, &class_name, Vec::new(), span)?;
            if let (Some(container_id), Some(target_id)) = (ctx.current_resource(), ctx.catalog.find("class", &class_name)) {
                ctx.catalog.add_edge(container_id, target_id, crate::catalog::Relation::Contains).map_err(|m| EvalFault::new(m, span))?;
            }
        }
    }
    Ok(Value::Undef)
}

/// A class-name argument is either a bare/qualified name string or a
/// `Class['name']` reference; arrays of either are flattened.
fn class_names_of(value: &Value) -> Vec<String> {
    match value.resolve() {
        Value::String(s) => vec![s.clone()],
        Value::Type(Type::Class(Some(name))) => vec![name.clone()],
        Value::Type(Type::Resource { name: Some(n), title: Some(t) }) if n == "class" => vec![t.clone()],
        Value::Array(items) => items.iter().flat_map(class_names_of).collect(),
        other => vec![other.to_display_string()],
    }
}

fn realize(ctx: &mut Context, args: Vec<Value>, span: Span) -> Result<Value, EvalFault> {
    for arg in &args {
        for (type_name, title) in collect_references(arg, span)? {
            let id = ctx
                .catalog
                .find(&type_name, &title)
                .ok_or_else(|| EvalFault::new(format!("cannot realize undeclared resource {}['{}']", type_name, title), span))?;
            ctx.catalog.realize(id).map_err(|m| EvalFault::new(m, span))?;
        }
    }
    Ok(Value::Undef)
}

fn is_defined(ctx: &Context, value: &Value) -> bool {
    match value.resolve() {
        Value::Type(Type::Resource { name: Some(n), title: Some(t) }) => ctx.catalog.find(n, t).is_some(),
        Value::Type(Type::Class(Some(name))) => ctx.class_is_declared(name),
        Value::String(s) if s.starts_with('$') => {
            !matches!(
                crate::scope::resolve_variable(&ctx.scopes, &ctx.matches, ctx.current_scope(), s.trim_start_matches('$')),
                crate::scope::Resolved::Undef
            )
        }
        Value::String(s) => ctx.registry.class(s).is_some() || ctx.registry.defined_type(s).is_some(),
        _ => false,
    }
}

fn versioncmp(args: &[Value], span: Span) -> Result<Value, EvalFault> {
    let a = args.first().and_then(Value::as_str).ok_or_else(|| EvalFault::new("versioncmp requires two string arguments", span))?;
    let b = args.get(1).and_then(Value::as_str).ok_or_else(|| EvalFault::new("versioncmp requires two string arguments", span))?;
    let split = |v: &str| -> Vec<String> { v.split(|c: char| c == '.' || c == '-').map(str::to_string).collect() };
    let (pa, pb) = (split(a), split(b));
    for i in 0..pa.len().max(pb.len()) {
        let sa = pa.get(i).map(String::as_str).unwrap_or("0");
        let sb = pb.get(i).map(String::as_str).unwrap_or("0");
        let ordering = match (sa.parse::<i64>(), sb.parse::<i64>()) {
            (Ok(na), Ok(nb)) => na.cmp(&nb),
            _ => sa.cmp(sb),
        };
        if ordering != std::cmp::Ordering::Equal {
            return Ok(Value::Integer(if ordering.is_lt() { -1 } else { 1 }));
        }
    }
    Ok(Value::Integer(0))
}

fn shellquote(args: &[Value]) -> String {
    args.iter()
        .map(|v| {
            let text = v.to_display_string();
            if text.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c)) && !text.is_empty() {
                text
            } else {
                format!("'{}'", text.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn each(eval: &mut Evaluator, ctx: &mut Context, args: Vec<Value>, block: Option<&Lambda>, span: Span) -> Result<Value, EvalFault> {
    let collection = args.into_iter().next().ok_or_else(|| EvalFault::new("'each' requires a collection argument", span))?;
    let lambda = block.ok_or_else(|| EvalFault::new("'each' requires a block", span))?;
    let items = collection.iterate().ok_or_else(|| EvalFault::new("'each' requires an array or a hash", span))?;
    for item in items {
        eval.call_lambda(lambda, item_args(item), ctx, span)?;
    }
    Ok(collection)
}

fn map(eval: &mut Evaluator, ctx: &mut Context, args: Vec<Value>, block: Option<&Lambda>, span: Span) -> Result<Value, EvalFault> {
    let collection = args.into_iter().next().ok_or_else(|| EvalFault::new("'map' requires a collection argument", span))?;
    let lambda = block.ok_or_else(|| EvalFault::new("'map' requires a block", span))?;
    let items = collection.iterate().ok_or_else(|| EvalFault::new("'map' requires an array or a hash", span))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(eval.call_lambda(lambda, item_args(item), ctx, span)?);
    }
    Ok(Value::Array(out))
}

fn filter(eval: &mut Evaluator, ctx: &mut Context, args: Vec<Value>, block: Option<&Lambda>, span: Span) -> Result<Value, EvalFault> {
    let collection = args.into_iter().next().ok_or_else(|| EvalFault::new("'filter' requires a collection argument", span))?;
    let lambda = block.ok_or_else(|| EvalFault::new("'filter' requires a block", span))?;
    let items = collection.iterate().ok_or_else(|| EvalFault::new("'filter' requires an array or a hash", span))?;
    let is_hash = matches!(collection.resolve(), Value::Hash(_));
    let mut kept_pairs = Vec::new();
    let mut kept_single = Vec::new();
    for item in items {
        let keep = eval.call_lambda(lambda, item_args(item.clone()), ctx, span)?.is_truthy();
        if !keep {
            continue;
        }
        match item {
            IterationItem::Single(v) => kept_single.push(v),
            IterationItem::Pair(k, v) => kept_pairs.push((k, v)),
        }
    }
    Ok(if is_hash { Value::Hash(kept_pairs) } else { Value::Array(kept_single) })
}

fn reduce(eval: &mut Evaluator, ctx: &mut Context, mut args: Vec<Value>, block: Option<&Lambda>, span: Span) -> Result<Value, EvalFault> {
    if args.is_empty() {
        return Err(EvalFault::new("'reduce' requires a collection argument", span));
    }
    let lambda = block.ok_or_else(|| EvalFault::new("'reduce' requires a block", span))?;
    let (collection, mut memo, has_initial) = if args.len() >= 2 {
        let initial = args.pop().unwrap();
        (args.pop().unwrap(), Some(initial), true)
    } else {
        (args.pop().unwrap(), None, false)
    };
    let mut items = collection.iterate().ok_or_else(|| EvalFault::new("'reduce' requires an array or a hash", span))?.into_iter();
    if !has_initial {
        memo = items.next().map(|item| match item {
            IterationItem::Single(v) => v,
            IterationItem::Pair(k, v) => Value::Array(vec![k, v]),
        });
    }
    let mut memo = memo.ok_or_else(|| EvalFault::new("'reduce' on an empty collection requires an initial value", span))?;
    for item in items {
        let mut call_args = vec![memo];
        call_args.extend(item_args(item));
        memo = eval.call_lambda(lambda, call_args, ctx, span)?;
    }
    Ok(memo)
}

fn item_args(item: IterationItem) -> Vec<Value> {
    match item {
        IterationItem::Single(v) => vec![v],
        IterationItem::Pair(k, v) => vec![k, v],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::MapFactSource;
    use crate::log::MemorySink;
    use crate::parser::Parser;
    use std::sync::Arc;

    fn context() -> Context {
        Context::new("t.example.com", "production", Arc::new(MapFactSource::new()), Arc::new(MemorySink::new()), LogLevel::Notice)
    }

    fn run(src: &str, ctx: &mut Context) -> Value {
        let body = Parser::parse_manifest(src, None).unwrap().body;
        ctx.registry.scan_and_commit(&body).unwrap();
        let mut eval = Evaluator::new();
        eval.hoist_functions(&body);
        eval.eval_body(&body, ctx).unwrap()
    }

    #[test]
    fn include_declares_the_class_once() {
        let mut ctx = context();
        run("class foo { } include foo include foo", &mut ctx);
        assert!(ctx.catalog.find("class", "foo").is_some());
    }

    #[test]
    fn require_adds_a_dependency_edge_from_the_requiring_class() {
        let mut ctx = context();
        run("class foo { } class bar { require foo } include bar", &mut ctx);
        let bar = ctx.catalog.find("class", "bar").unwrap();
        let foo = ctx.catalog.find("class", "foo").unwrap();
        assert!(ctx
            .catalog
            .edges
            .iter()
            .any(|e| e.source == bar && e.target == foo && e.relation == crate::catalog::Relation::Require));
    }

    #[test]
    fn mutual_include_is_reported_as_a_dependency_cycle() {
        let mut ctx = context();
        let body = Parser::parse_manifest("class a { include b } class b { include a } include a", None).unwrap().body;
        ctx.registry.scan_and_commit(&body).unwrap();
        let mut eval = Evaluator::new();
        let err = eval.eval_body(&body, &mut ctx).unwrap_err();
        assert_eq!(err.message, "found dependency cycle: Class[A] => Class[B] => Class[A]");
    }

    #[test]
    fn versioncmp_orders_numeric_segments() {
        assert!(matches!(versioncmp(&[Value::string("1.9"), Value::string("1.10")], Span::point(crate::position::Position::start())).unwrap(), Value::Integer(-1)));
    }

    #[test]
    fn shellquote_escapes_special_characters() {
        assert_eq!(shellquote(&[Value::string("a b")]), "'a b'");
        assert_eq!(shellquote(&[Value::string("plain")]), "plain");
    }

    #[test]
    fn map_applies_the_block_to_each_element() {
        let mut ctx = context();
        let result = run("$out = [1, 2, 3].map |$x| { $x * 2 } $out", &mut ctx);
        match result {
            Value::Array(items) => assert_eq!(items.len(), 3),
            other => panic!("expected an array, got {:?}", other),
        }
    }
}
