//! Resource declaration and override evaluation.

use crate::ast::{
    Ast, AstKind, Attribute as AstAttribute, AttributeName, AttributeOp, Parameter, ResourceBody,
};
use crate::catalog::{Attribute, Relation, Resource, MAIN_STAGE};
use crate::context::{Context, OverrideAttribute, PendingDefinedType, PendingOverride, QueuedRelationship};
use crate::fault::EvalFault;
use crate::position::Span;
use crate::registry::normalize_name;
use crate::scope::ScopeTable;
use crate::value::{Type, Value};

use super::Evaluator;

/// Step 1: evaluate the resource-type expression. A bare `Name` (`file`)
/// or `Type` (`File`) token is used literally; anything else (a
/// variable, a function call) is evaluated and converted to its string
/// form, so `$type { 'x': }` works the same as `file { 'x': }`.
fn resolve_type_name(eval: &mut Evaluator, ctx: &mut Context, ast: &Ast) -> Result<String, EvalFault> {
    match &ast.kind {
        AstKind::Name(n) => Ok(n.to_lowercase()),
        AstKind::Type(t) => Ok(crate::registry::normalize_name(t)),
        _ => {
            let value = eval.eval(ast, ctx)?;
            match value.resolve() {
                Value::String(s) => Ok(s.to_lowercase()),
                Value::Type(Type::Resource { name: Some(n), .. }) => Ok(n.clone()),
                other => Ok(other.to_display_string().to_lowercase()),
            }
        }
    }
}

/// Step 2: a title may be a single string or an array of strings, each
/// producing its own resource body.
fn title_list(value: &Value) -> Vec<String> {
    match value.resolve() {
        Value::Array(items) => items.iter().map(|v| v.to_display_string()).collect(),
        other => vec![other.to_display_string()],
    }
}

fn attrs_as_args(attrs: &[Attribute]) -> Vec<(String, Value)> {
    attrs.iter().map(|a| (a.name.clone(), a.value.clone())).collect()
}

/// Step 3: composes a body's attribute list on top of the type's default
/// body (if any), applying `+>` append and `*` hash-splat.
fn compose_attributes(
    eval: &mut Evaluator,
    ctx: &mut Context,
    own: &[AstAttribute],
    defaults: &[Attribute],
) -> Result<Vec<Attribute>, EvalFault> {
    let mut attrs: Vec<Attribute> = defaults.to_vec();
    for attr in own {
        match &attr.name {
            AttributeName::Splat => {
                let value = eval.eval(&attr.value, ctx)?;
                let pairs = value
                    .as_hash()
                    .ok_or_else(|| EvalFault::new("the '*' attribute splat requires a hash", attr.span))?
                    .to_vec();
                for (k, v) in pairs {
                    let name = k
                        .as_str()
                        .ok_or_else(|| EvalFault::new("splatted attribute keys must be strings", attr.span))?
                        .to_string();
                    check_metaparameter(&name, &v, attr.span)?;
                    set_or_append(&mut attrs, name, v, attr.operator);
                }
            }
            AttributeName::Named(name) => {
                let value = eval.eval(&attr.value, ctx)?;
                check_metaparameter(name, &value, attr.span)?;
                set_or_append(&mut attrs, name.clone(), value, attr.operator);
            }
        }
    }
    Ok(attrs)
}

fn set_or_append(attrs: &mut Vec<Attribute>, name: String, value: Value, op: AttributeOp) {
    if let Some(existing) = attrs.iter_mut().find(|a| a.name == name) {
        match op {
            AttributeOp::Assignment => existing.value = value,
            AttributeOp::Append => {
                let mut combined = existing.value.as_array().map(|s| s.to_vec()).unwrap_or_else(|| vec![existing.value.clone()]);
                combined.push(value);
                existing.value = Value::Array(combined);
            }
        }
    } else {
        attrs.push(Attribute { name, value });
    }
}

const RELATIONSHIP_METAPARAMS: &[&str] = &["before", "notify", "require", "subscribe"];
const KNOWN_LOG_LEVELS: &[&str] = &["debug", "info", "notice", "warning", "err", "alert", "emerg", "crit", "verbose"];

/// Seeds a resource's tag set from its own `tag` metaparameter attribute
/// (string or array of strings), mirroring what the `tag()` built-in does
/// for tags added after declaration. Collector queries match against
/// `Resource::tags`, not the raw attribute, so this is what makes `tag =>
/// 'web'` on a resource body visible to `<| tag == 'web' |>`.
fn tags_from_attrs(attrs: &[Attribute]) -> Vec<String> {
    attrs
        .iter()
        .find(|a| a.name == "tag")
        .map(|a| match a.value.resolve() {
            Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            Value::String(s) => vec![s.clone()],
            _ => Vec::new(),
        })
        .unwrap_or_default()
}

fn check_metaparameter(name: &str, value: &Value, span: Span) -> Result<(), EvalFault> {
    let is_string_or_strings = matches!(value.resolve(), Value::Array(_) | Value::String(_) | Value::Type(Type::Resource { .. }));
    match name {
        _ if RELATIONSHIP_METAPARAMS.contains(&name) => {
            if !is_string_or_strings {
                return Err(EvalFault::new(format!("'{}' must be a string, resource reference, or array of either", name), span));
            }
        }
        "alias" | "tag" => {
            if !matches!(value.resolve(), Value::Array(_) | Value::String(_)) {
                return Err(EvalFault::new(format!("'{}' must be a string or an array of strings", name), span));
            }
        }
        "noop" => {
            if !matches!(value.resolve(), Value::Boolean(_)) {
                return Err(EvalFault::new("'noop' must be a boolean", span));
            }
        }
        "loglevel" => {
            let ok = value.as_str().map(|s| KNOWN_LOG_LEVELS.contains(&s.to_lowercase().as_str())).unwrap_or(false);
            if !ok {
                return Err(EvalFault::new("'loglevel' must be one of the known log levels", span));
            }
        }
        "stage" | "schedule" => {
            if value.as_str().is_none() {
                return Err(EvalFault::new(format!("'{}' must be a string", name), span));
            }
        }
        "audit" => {
            if !matches!(value.resolve(), Value::Array(_) | Value::String(_)) {
                return Err(EvalFault::new("'audit' must be a string or an array of strings", span));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Evaluates an `AstKind::Resource` node end to end: type resolution,
/// titles, attribute composition, then declaration. Returns the last
/// resource declared (or `undef` if every body set only the defaults).
pub fn eval_resource(
    eval: &mut Evaluator,
    ctx: &mut Context,
    type_name: &Ast,
    bodies: &[ResourceBody],
    is_virtual: bool,
    is_exported: bool,
) -> Result<Value, EvalFault> {
    let type_str = resolve_type_name(eval, ctx, type_name)?;
    let mut default_attrs: Vec<Attribute> = Vec::new();
    let mut last = Value::Undef;
    for body in bodies {
        let title_value = eval.eval(&body.title, ctx)?;
        if title_value.is_default() {
            default_attrs = compose_attributes(eval, ctx, &body.attributes, &[])?;
            continue;
        }
        for title in title_list(&title_value) {
            let attrs = compose_attributes(eval, ctx, &body.attributes, &default_attrs)?;
            last = declare_one(eval, ctx, &type_str, &title, attrs, is_virtual, is_exported, body.span)?;
        }
    }
    Ok(last)
}

fn declare_one(
    eval: &mut Evaluator,
    ctx: &mut Context,
    type_str: &str,
    title: &str,
    attrs: Vec<Attribute>,
    is_virtual: bool,
    is_exported: bool,
    span: Span,
) -> Result<Value, EvalFault> {
    if type_str == "class" {
        if is_virtual || is_exported {
            return Err(EvalFault::new("classes cannot be virtual or exported", span));
        }
        let normalized = normalize_name(title);
        declare_class(eval, ctx, &normalized, attrs_as_args(&attrs), span)?;
        return Ok(Value::Type(Type::Resource { name: Some("class".to_string()), title: Some(normalized) }));
    }
    // Stages partition the whole catalog and are never contained.
    let container = if type_str == "stage" { None } else { ctx.current_resource() };
    let tags = tags_from_attrs(&attrs);
    let resource = Resource {
        type_name: type_str.to_string(),
        title: title.to_string(),
        container,
        scope: ctx.current_scope().to_string(),
        exported: is_exported,
        is_virtual: is_virtual || is_exported,
        tags,
        attributes: attrs,
        declared_at: Some(span),
        vertex: None,
    };
    let id = ctx.catalog.add_resource(resource).map_err(|message| EvalFault::new(message, span))?;
    apply_queued_overrides(ctx, type_str, title, id)?;
    queue_relationship_metaparameters(ctx, id, span)?;

    if let Some(def) = ctx.registry.defined_type(type_str).cloned() {
        let arguments = attrs_as_args(&ctx.catalog.resource(id).attributes);
        ctx.queue_defined_type(PendingDefinedType {
            type_name: def.name.clone(),
            title: title.to_string(),
            arguments,
            container: Some(id),
            span,
        });
    }
    Ok(Value::Type(Type::Resource { name: Some(type_str.to_string()), title: Some(title.to_string()) }))
}

/// Applies one override operation to a resource: `=>` replaces, `+>`
/// appends to the existing value (promoting a scalar to an array).
fn apply_override_attribute(resource: &mut Resource, attr: &OverrideAttribute) {
    match attr.operator {
        AttributeOp::Assignment => resource.set_attribute(attr.name.clone(), attr.value.clone()),
        AttributeOp::Append => {
            let combined = match resource.attribute(&attr.name) {
                Some(existing) => {
                    let mut items = existing.as_array().map(|s| s.to_vec()).unwrap_or_else(|| vec![existing.clone()]);
                    items.push(attr.value.clone());
                    Value::Array(items)
                }
                None => Value::Array(vec![attr.value.clone()]),
            };
            resource.set_attribute(attr.name.clone(), combined);
        }
    }
}

fn apply_queued_overrides(ctx: &mut Context, type_str: &str, title: &str, id: crate::catalog::ResourceId) -> Result<(), EvalFault> {
    let matching: Vec<PendingOverride> = {
        let remaining = ctx.take_pending_overrides();
        let (matching, rest): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|o| o.type_name.eq_ignore_ascii_case(type_str) && o.title == title);
        for pending in rest {
            ctx.queue_override(pending);
        }
        matching
    };
    for pending in matching {
        for attr in &pending.attributes {
            apply_override_attribute(ctx.catalog.resource_mut(id), attr);
        }
    }
    Ok(())
}

/// Queues an edge for each `before`/`notify`/`require`/`subscribe`
/// metaparameter on a freshly declared resource. The edges themselves are
/// wired up at finalization, so a target declared later in the manifest
/// is fine.
fn queue_relationship_metaparameters(ctx: &mut Context, id: crate::catalog::ResourceId, span: Span) -> Result<(), EvalFault> {
    const RELATIONS: &[(&str, Relation)] = &[
        ("before", Relation::Before),
        ("notify", Relation::Notify),
        ("require", Relation::Require),
        ("subscribe", Relation::Subscribe),
    ];
    let source = {
        let resource = ctx.catalog.resource(id);
        (resource.type_name.clone(), resource.title.clone())
    };
    for (name, relation) in RELATIONS {
        let value = match ctx.catalog.resource(id).attribute(name) {
            Some(v) => v.clone(),
            None => continue,
        };
        for target in relationship_targets(&value, span)? {
            ctx.queue_relationship(QueuedRelationship { source: source.clone(), target, relation: *relation, span });
        }
    }
    Ok(())
}

/// A relationship metaparameter's value: resource references, strings of
/// the form `Type[title]`, or arrays of either.
fn relationship_targets(value: &Value, span: Span) -> Result<Vec<(String, String)>, EvalFault> {
    match value.resolve() {
        Value::String(s) => parse_reference_string(s)
            .map(|r| vec![r])
            .ok_or_else(|| EvalFault::new(format!("'{}' is not a resource reference", s), span)),
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(relationship_targets(item, span)?);
            }
            Ok(out)
        }
        _ => collect_references(value, span),
    }
}

fn parse_reference_string(s: &str) -> Option<(String, String)> {
    let open = s.find('[')?;
    let close = s.rfind(']')?;
    if close <= open {
        return None;
    }
    let type_name = s[..open].trim().to_lowercase();
    let title = s[open + 1..close].trim().trim_matches('\'').trim_matches('"').to_string();
    if type_name.is_empty() || title.is_empty() {
        return None;
    }
    Some((type_name, title))
}

/// Unwraps a resource-reference value (`Type::Resource` or an array of
/// them) into `(type, title)` pairs.
pub(crate) fn collect_references(value: &Value, span: Span) -> Result<Vec<(String, String)>, EvalFault> {
    match value.resolve() {
        Value::Type(Type::Resource { name: Some(n), title: Some(t) }) => Ok(vec![(n.clone(), t.clone())]),
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(collect_references(item, span)?);
            }
            Ok(out)
        }
        _ => Err(EvalFault::new("expected a resource reference (e.g. File['x'])", span)),
    }
}

/// Evaluates an `AstKind::ResourceOverride` node: applies immediately if
/// the target already exists, otherwise queues it. A resource may only
/// be overridden from a scope that contains it (or an unassociated
/// top-level scope), matching Puppet's "no parameter override" rule.
pub fn eval_resource_override(
    eval: &mut Evaluator,
    ctx: &mut Context,
    reference: &Ast,
    attributes: &[AstAttribute],
    span: Span,
) -> Result<Value, EvalFault> {
    let reference_value = eval.eval(reference, ctx)?;
    let targets = collect_references(&reference_value, span)?;
    let attrs = eval_override_attributes(eval, ctx, attributes)?;
    let current_scope = ctx.current_scope().to_string();
    for (type_name, title) in targets {
        match ctx.catalog.find(&type_name, &title) {
            Some(id) => {
                let target_scope = ctx.catalog.resource(id).scope.clone();
                if !target_scope.is_empty() && !ctx.scope_contains(&current_scope, &target_scope) {
                    return Err(EvalFault::new(
                        format!("cannot override {}['{}']: not in an inheriting scope", type_name, title),
                        span,
                    ));
                }
                for attr in &attrs {
                    apply_override_attribute(ctx.catalog.resource_mut(id), attr);
                }
            }
            None => {
                ctx.queue_override(PendingOverride {
                    type_name,
                    title,
                    attributes: attrs.clone(),
                    from_scope: current_scope.clone(),
                    span,
                });
            }
        }
    }
    Ok(Value::Undef)
}

/// Evaluates an override's attribute list, keeping each entry's operator
/// (unlike a declaration body, which only assigns). `*` splat entries
/// expand to plain assignments.
fn eval_override_attributes(
    eval: &mut Evaluator,
    ctx: &mut Context,
    attributes: &[AstAttribute],
) -> Result<Vec<OverrideAttribute>, EvalFault> {
    let mut out = Vec::new();
    for attr in attributes {
        match &attr.name {
            AttributeName::Splat => {
                let value = eval.eval(&attr.value, ctx)?;
                let pairs = value
                    .as_hash()
                    .ok_or_else(|| EvalFault::new("the '*' attribute splat requires a hash", attr.span))?
                    .to_vec();
                for (k, v) in pairs {
                    let name = k
                        .as_str()
                        .ok_or_else(|| EvalFault::new("splatted attribute keys must be strings", attr.span))?
                        .to_string();
                    check_metaparameter(&name, &v, attr.span)?;
                    out.push(OverrideAttribute { name, value: v, operator: AttributeOp::Assignment });
                }
            }
            AttributeName::Named(name) => {
                let value = eval.eval(&attr.value, ctx)?;
                check_metaparameter(name, &value, attr.span)?;
                out.push(OverrideAttribute { name: name.clone(), value, operator: attr.operator });
            }
        }
    }
    Ok(out)
}

/// Binds `parameters` into `scope_name`, preferring a caller-supplied
/// argument and falling back to the parameter's own default (evaluated
/// lazily, in the new scope, so defaults can reference earlier
/// parameters). Shared by class and defined-type instantiation.
fn bind_parameters_into_scope(
    eval: &mut Evaluator,
    ctx: &mut Context,
    scope_name: &str,
    parameters: &[Parameter],
    arguments: &[(String, Value)],
    span: Span,
) -> Result<(), EvalFault> {
    for param in parameters {
        let value = match arguments.iter().find(|(k, _)| k == &param.name) {
            Some((_, v)) => v.clone(),
            None => match &param.default {
                Some(default_ast) => eval.eval(default_ast, ctx)?,
                None => return Err(EvalFault::new(format!("missing required parameter '{}'", param.name), span)),
            },
        };
        if let Some(scope) = ctx.scopes.scope_mut(scope_name) {
            scope.set_local(&param.name, value);
        }
    }
    Ok(())
}

/// Renders a class reference the way diagnostics print it:
/// `Class[Foo::Bar]`.
pub(crate) fn class_reference(name: &str) -> String {
    let capitalized: Vec<String> = name
        .split("::")
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    format!("Class[{}]", capitalized.join("::"))
}

/// Declares a class by name: idempotent via
/// [`Context::mark_class_declared`], locates the definition in the
/// registry, contains the resulting `Class` resource in its `stage`
/// metaparameter's stage, and evaluates the body exactly once. Reached
/// from `include`/`require`/`contain` (see [`super::builtins`]) and from
/// resource-style `class { 'foo': }` declarations via [`eval_resource`].
///
/// Reaching a class again while its own body is still being evaluated
/// (`class a { include b } class b { include a }`) is a dependency
/// cycle, reported with the chain of classes from the first occurrence.
pub fn declare_class(
    eval: &mut Evaluator,
    ctx: &mut Context,
    name: &str,
    arguments: Vec<(String, Value)>,
    span: Span,
) -> Result<(), EvalFault> {
    let normalized = normalize_name(name);
    if let Err(chain) = ctx.begin_class_evaluation(&normalized) {
        let rendered: Vec<String> = chain.iter().map(|c| class_reference(c)).collect();
        return Err(EvalFault::new(format!("found dependency cycle: {}", rendered.join(" => ")), span));
    }
    let result = declare_class_body(eval, ctx, &normalized, arguments, span);
    ctx.end_class_evaluation();
    result
}

fn declare_class_body(
    eval: &mut Evaluator,
    ctx: &mut Context,
    normalized: &str,
    arguments: Vec<(String, Value)>,
    span: Span,
) -> Result<(), EvalFault> {
    if !ctx.mark_class_declared(normalized) {
        return Ok(());
    }
    let defs = ctx
        .registry
        .class(normalized)
        .map(|d| d.to_vec())
        .ok_or_else(|| EvalFault::new(format!("Could not find class {}", normalized), span))?;

    let parent = defs.first().and_then(|d| d.parent.clone());
    if let Some(parent_name) = &parent {
        declare_class(eval, ctx, parent_name, Vec::new(), span)?;
    }
    let parent_scope = parent.as_deref().map(normalize_name).unwrap_or_else(|| ScopeTable::TOP.to_string());

    let stage_title = arguments
        .iter()
        .find(|(k, _)| k == "stage")
        .and_then(|(_, v)| v.as_str().map(str::to_string))
        .unwrap_or_else(|| MAIN_STAGE.to_string());
    let stage_id = ctx
        .catalog
        .find("stage", &stage_title)
        .ok_or_else(|| EvalFault::new(format!("stage '{}' is not declared", stage_title), span))?;

    let resource = Resource {
        type_name: "class".to_string(),
        title: normalized.to_string(),
        container: Some(stage_id),
        scope: normalized.to_string(),
        exported: false,
        is_virtual: false,
        tags: Vec::new(),
        attributes: arguments.iter().map(|(k, v)| Attribute { name: k.clone(), value: v.clone() }).collect(),
        declared_at: Some(span),
        vertex: None,
    };
    let id = ctx.catalog.add_resource(resource).map_err(|m| EvalFault::new(m, span))?;
    queue_relationship_metaparameters(ctx, id, span)?;

    ctx.scopes.ensure_scope(normalized, Some(&parent_scope));
    if let Some(parameters) = defs.first().map(|d| d.parameters.clone()) {
        bind_parameters_into_scope(eval, ctx, normalized, &parameters, &arguments, span)?;
    }

    ctx.push_scope(normalized);
    ctx.push_resource(id);
    let mut result = Ok(());
    for def in &defs {
        if let Err(fault) = eval.eval_body(&def.body, ctx) {
            result = Err(super::push_backtrace_frame(fault, normalized, span));
            break;
        }
    }
    ctx.pop_resource();
    ctx.pop_scope();
    result
}

/// Evaluates a previously-queued defined-type instance during a
/// finalization pass: binds `$title`/`$name` plus the type's own
/// parameters in a fresh scope named after the instance, then walks the
/// body the same way a class body is walked. Resources declared inside
/// are contained by the instance's own resource (recorded as
/// `container` when the instance was queued in `declare_one`), not by
/// whatever was active at the call site.
pub fn declare_defined_type(eval: &mut Evaluator, ctx: &mut Context, pending: &PendingDefinedType) -> Result<(), EvalFault> {
    let def = ctx
        .registry
        .defined_type(&pending.type_name)
        .cloned()
        .ok_or_else(|| EvalFault::new(format!("Could not find defined type {}", pending.type_name), pending.span))?;

    let scope_name = format!("{}[{}]", normalize_name(&pending.type_name), pending.title);
    ctx.scopes.ensure_scope(&scope_name, Some(ScopeTable::TOP));
    if let Some(scope) = ctx.scopes.scope_mut(&scope_name) {
        scope.set_local("title", Value::string(pending.title.clone()));
        scope.set_local("name", Value::string(pending.title.clone()));
    }
    bind_parameters_into_scope(eval, ctx, &scope_name, &def.parameters, &pending.arguments, pending.span)?;

    ctx.push_scope(&scope_name);
    if let Some(id) = pending.container {
        ctx.push_resource(id);
    }
    let result = eval.eval_body(&def.body, ctx);
    if pending.container.is_some() {
        ctx.pop_resource();
    }
    ctx.pop_scope();
    result.map(|_| ()).map_err(|e| super::push_backtrace_frame(e, &scope_name, pending.span))
}

/// One side of a collector query comparison: either a bare attribute
/// name (`tag`, `ensure`) still waiting to be resolved against the
/// candidate resource, or an already-evaluated literal.
enum QueryAtom {
    Attribute(String),
    Literal(Value),
}

fn eval_query_atom(eval: &mut Evaluator, ctx: &mut Context, ast: &Ast) -> Result<QueryAtom, EvalFault> {
    match &ast.kind {
        AstKind::Name(n) | AstKind::BareWord(n) => Ok(QueryAtom::Attribute(n.clone())),
        _ => Ok(QueryAtom::Literal(eval.eval(ast, ctx)?)),
    }
}

fn resolve_query_atom(resource: &Resource, atom: QueryAtom) -> Value {
    match atom {
        QueryAtom::Attribute(name) if name == "tag" => Value::Array(resource.tags.iter().cloned().map(Value::string).collect()),
        QueryAtom::Attribute(name) => resource.attribute(&name).cloned().unwrap_or(Value::Undef),
        QueryAtom::Literal(value) => value,
    }
}

fn apply_query_op(resource: &Resource, op: crate::ast::BinOp, left: QueryAtom, right: QueryAtom, span: Span) -> Result<QueryAtom, EvalFault> {
    use crate::ast::BinOp;
    match op {
        BinOp::Eq | BinOp::NotEq => {
            let matches = match (&left, &right) {
                (QueryAtom::Attribute(name), other) | (other, QueryAtom::Attribute(name)) if name == "tag" => {
                    let needle = resolve_query_atom(resource, match other {
                        QueryAtom::Literal(v) => QueryAtom::Literal(v.clone()),
                        QueryAtom::Attribute(n) => QueryAtom::Attribute(n.clone()),
                    });
                    resource.tags.iter().any(|t| needle.as_str().map(|n| n.eq_ignore_ascii_case(t)).unwrap_or(false))
                }
                _ => {
                    let lv = resolve_query_atom(resource, left);
                    let rv = resolve_query_atom(resource, right);
                    lv.equals(&rv)
                }
            };
            Ok(QueryAtom::Literal(Value::Boolean(if op == BinOp::Eq { matches } else { !matches })))
        }
        BinOp::And | BinOp::Or => {
            let lb = resolve_query_atom(resource, left).is_truthy();
            let rb = resolve_query_atom(resource, right).is_truthy();
            let result = if op == BinOp::And { lb && rb } else { lb || rb };
            Ok(QueryAtom::Literal(Value::Boolean(result)))
        }
        _ => Err(EvalFault::new("collector queries only support ==, !=, and, and or", span)),
    }
}

/// Evaluates a `<| query |>` collector's predicate against a candidate
/// resource. `None` (a bare `<| |>`) matches every resource of the
/// collected type.
pub(crate) fn resource_matches_query(
    eval: &mut Evaluator,
    ctx: &mut Context,
    resource: &Resource,
    query: Option<&Ast>,
) -> Result<bool, EvalFault> {
    use crate::ast::BinOp;

    let query = match query {
        Some(q) => q,
        None => return Ok(true),
    };
    let (primary, rest) = match &query.kind {
        AstKind::Expression { primary, rest } => (primary.as_ref(), rest.as_slice()),
        _ => (query, &[][..]),
    };

    // Same shape as eval_expression's stack-based precedence climbing, but
    // folding QueryAtoms against one candidate resource instead of eval()ing
    // Values against a context. `tag == 'x'` and `and`/`or` bind as BinOp
    // precedence dictates, so `a == 'x' and b == 'y'` groups as `(a == 'x')
    // and (b == 'y')` rather than left-to-right.
    let first = eval_query_atom(eval, ctx, primary)?;
    let mut atoms = vec![first];
    let mut ops: Vec<BinOp> = Vec::new();
    for (op, rhs_ast) in rest {
        let rhs = eval_query_atom(eval, ctx, rhs_ast)?;
        while let Some(top) = ops.last().copied() {
            if top.precedence() >= op.precedence() {
                ops.pop();
                let right = atoms.pop().unwrap();
                let left = atoms.pop().unwrap();
                atoms.push(apply_query_op(resource, top, left, right, query.span)?);
            } else {
                break;
            }
        }
        ops.push(*op);
        atoms.push(rhs);
    }
    while let Some(top) = ops.pop() {
        let right = atoms.pop().unwrap();
        let left = atoms.pop().unwrap();
        atoms.push(apply_query_op(resource, top, left, right, query.span)?);
    }
    Ok(resolve_query_atom(resource, atoms.pop().unwrap()).is_truthy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::MapFactSource;
    use crate::log::{LogLevel, MemorySink};
    use crate::parser::Parser;
    use std::sync::Arc;

    fn context() -> Context {
        Context::new("t.example.com", "production", Arc::new(MapFactSource::new()), Arc::new(MemorySink::new()), LogLevel::Notice)
    }

    fn parse(src: &str) -> Vec<Ast> {
        Parser::parse_manifest(src, None).unwrap().body
    }

    #[test]
    fn declares_a_resource_and_its_title_becomes_findable() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("file { 'x': ensure => present }");
        eval.eval_body(&body, &mut ctx).unwrap();
        let id = ctx.catalog.find("file", "x").unwrap();
        assert!(ctx.catalog.resource(id).attribute("ensure").is_some());
    }

    #[test]
    fn duplicate_resource_declaration_is_an_error() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("file { 'x': } file { 'x': }");
        assert!(eval.eval_body(&body, &mut ctx).is_err());
    }

    #[test]
    fn array_title_declares_multiple_resources() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("file { ['a', 'b']: ensure => present }");
        eval.eval_body(&body, &mut ctx).unwrap();
        assert!(ctx.catalog.find("file", "a").is_some());
        assert!(ctx.catalog.find("file", "b").is_some());
    }

    #[test]
    fn override_after_declaration_merges_attributes() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("file { 'x': ensure => present } File['x'] { mode => '0644' }");
        eval.eval_body(&body, &mut ctx).unwrap();
        let id = ctx.catalog.find("file", "x").unwrap();
        let resource = ctx.catalog.resource(id);
        assert!(resource.attribute("ensure").is_some());
        assert!(resource.attribute("mode").is_some());
    }

    #[test]
    fn append_override_extends_the_existing_value() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("file { 'x': tag => 'one' } File['x'] { tag +> 'two' }");
        eval.eval_body(&body, &mut ctx).unwrap();
        let id = ctx.catalog.find("file", "x").unwrap();
        let tags = ctx.catalog.resource(id).attribute("tag").unwrap();
        assert!(tags.equals(&Value::Array(vec![Value::string("one"), Value::string("two")])));
    }

    #[test]
    fn override_before_declaration_is_queued_then_applied() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("File['x'] { mode => '0644' } file { 'x': ensure => present }");
        eval.eval_body(&body, &mut ctx).unwrap();
        let id = ctx.catalog.find("file", "x").unwrap();
        assert!(ctx.catalog.resource(id).attribute("mode").is_some());
    }

    #[test]
    fn declaring_a_class_twice_runs_its_body_once() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("class foo { file { '/tmp/x': } }");
        ctx.registry.scan_and_commit(&body).unwrap();
        declare_class(&mut eval, &mut ctx, "foo", Vec::new(), Span::point(crate::position::Position::start())).unwrap();
        declare_class(&mut eval, &mut ctx, "foo", Vec::new(), Span::point(crate::position::Position::start())).unwrap();
        assert!(ctx.catalog.find("file", "/tmp/x").is_some());
        let class_id = ctx.catalog.find("class", "foo").unwrap();
        assert_eq!(ctx.catalog.resource(class_id).container, ctx.catalog.find("stage", "main"));
    }

    #[test]
    fn class_parameter_default_is_used_when_not_supplied() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("class foo($mode = '0644') { file { '/tmp/x': mode => $mode } }");
        ctx.registry.scan_and_commit(&body).unwrap();
        declare_class(&mut eval, &mut ctx, "foo", Vec::new(), Span::point(crate::position::Position::start())).unwrap();
        let id = ctx.catalog.find("file", "/tmp/x").unwrap();
        assert!(ctx.catalog.resource(id).attribute("mode").unwrap().equals(&Value::string("0644")));
    }

    #[test]
    fn defined_type_instance_contains_the_resources_it_declares() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("define app($mode) { file { '/tmp/app': mode => $mode } } app { 'one': mode => '0600' }");
        ctx.registry.scan_and_commit(&body).unwrap();
        eval.eval_body(&body, &mut ctx).unwrap();
        let instances = ctx.take_pending_defined_types();
        assert_eq!(instances.len(), 1);
        declare_defined_type(&mut eval, &mut ctx, &instances[0]).unwrap();

        let file_id = ctx.catalog.find("file", "/tmp/app").unwrap();
        assert!(ctx.catalog.resource(file_id).attribute("mode").unwrap().equals(&Value::string("0600")));
        let instance_id = ctx.catalog.find("app", "one").unwrap();
        assert_eq!(ctx.catalog.resource(file_id).container, Some(instance_id));
    }

    #[test]
    fn collector_query_groups_and_before_comparisons() {
        let mut ctx = context();
        let mut eval = Evaluator::new();
        let body = parse("File <| tag == 'web' and mode == '0644' |>");
        eval.eval_body(&body, &mut ctx).unwrap();
        let collector = ctx.collectors[0].clone();

        let mut matching = Resource {
            type_name: "file".to_string(),
            title: "a".to_string(),
            container: None,
            scope: String::new(),
            exported: false,
            is_virtual: true,
            tags: vec!["web".to_string()],
            attributes: vec![Attribute { name: "mode".to_string(), value: Value::string("0644") }],
            declared_at: None,
            vertex: None,
        };
        assert!(resource_matches_query(&mut eval, &mut ctx, &matching, collector.query.as_ref()).unwrap());

        // Wrong mode: the `and` must still apply after the `tag ==`
        // comparison resolves, not fold left-to-right across the bare
        // `mode` atom before its own `==` is evaluated.
        matching.attributes[0].value = Value::string("0600");
        assert!(!resource_matches_query(&mut eval, &mut ctx, &matching, collector.query.as_ref()).unwrap());
    }
}
