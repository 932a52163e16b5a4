//! Evaluation-time state: scopes, the catalog under construction, the
//! deferred-work queues, and the finalization fixed-point loop.
//!
//! `Context` only owns state and simple queue bookkeeping; it does not
//! know how to evaluate an AST node. [`Context::finalize`] drives the
//! fixed-point loop but takes the actual per-pass work (running
//! collectors, evaluating queued defined types, and so on) as a
//! closure supplied by [`crate::eval`], so this module never needs to
//! depend back on the evaluator.

use std::collections::HashSet;
use std::sync::Arc;

use crate::ast::{Ast, AttributeOp};
use crate::catalog::{Catalog, Relation, ResourceId};
use crate::fact::FactSource;
use crate::fault::FinalizationFault;
use crate::log::{LogSink, Logger};
use crate::position::Span;
use crate::registry::{normalize_name, Registry};
use crate::scope::{MatchScope, MatchScopeStack, ScopeTable};
use crate::value::Value;

/// Caps the finalization loop so a manifest that queues its own work
/// forever (a collector whose match can never be satisfied, a defined
/// type that keeps re-queueing itself) is reported rather than hung.
pub const MAX_FINALIZATION_PASSES: usize = 1000;

/// One attribute operation from a resource override, kept with its
/// operator: `=>` replaces the target's value, `+>` appends to it.
#[derive(Debug, Clone)]
pub struct OverrideAttribute {
    pub name: String,
    pub value: Value,
    pub operator: AttributeOp,
}

#[derive(Debug, Clone)]
pub struct PendingOverride {
    pub type_name: String,
    pub title: String,
    pub attributes: Vec<OverrideAttribute>,
    pub from_scope: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct PendingDefinedType {
    pub type_name: String,
    pub title: String,
    pub arguments: Vec<(String, Value)>,
    pub container: Option<ResourceId>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct QueuedCollector {
    pub type_name: String,
    pub exported: bool,
    pub query: Option<Ast>,
    pub span: Span,
    /// Whether any pass has found a resource satisfying this collector's
    /// query. An exported collector that never matches is a finalization
    /// fault.
    pub matched: bool,
}

/// A relationship whose endpoints are recorded by reference rather than
/// id: either side may name a resource that is only declared later (by a
/// collector realization or a queued defined type), so edges are wired
/// up after the finalization loop reaches its fixed point.
#[derive(Debug, Clone)]
pub struct QueuedRelationship {
    pub source: (String, String),
    pub target: (String, String),
    pub relation: Relation,
    pub span: Span,
}

/// The scope/resource/match stacks plus the catalog they are building.
pub struct Context {
    pub registry: Registry,
    pub catalog: Catalog,
    pub scopes: ScopeTable,
    pub matches: MatchScopeStack,
    pub logger: Logger,
    pub facts: Arc<dyn FactSource>,
    pub node_name: String,
    /// Source text of the manifest being evaluated, used to compute the
    /// column of log entries and diagnostics whose spans point into it.
    pub source_text: String,
    classes_declared: HashSet<String>,
    classes_evaluating: Vec<String>,
    scope_stack: Vec<String>,
    resource_stack: Vec<ResourceId>,
    streams: Vec<String>,
    pub(crate) pending_overrides: Vec<PendingOverride>,
    pub(crate) pending_defined_types: Vec<PendingDefinedType>,
    pub(crate) collectors: Vec<QueuedCollector>,
    pub(crate) pending_relationships: Vec<QueuedRelationship>,
}

impl Context {
    pub fn new(
        node_name: impl Into<String>,
        environment: impl Into<String>,
        facts: Arc<dyn FactSource>,
        sink: Arc<dyn LogSink>,
        floor: crate::log::LogLevel,
    ) -> Self {
        let node_name = node_name.into();
        Context {
            registry: Registry::new(),
            catalog: Catalog::new(node_name.clone(), environment),
            scopes: ScopeTable::new(),
            matches: MatchScopeStack::default(),
            logger: Logger::new(sink, floor),
            facts,
            node_name,
            source_text: String::new(),
            classes_declared: HashSet::new(),
            classes_evaluating: Vec::new(),
            scope_stack: vec![ScopeTable::TOP.to_string()],
            resource_stack: Vec::new(),
            streams: Vec::new(),
            pending_overrides: Vec::new(),
            pending_defined_types: Vec::new(),
            collectors: Vec::new(),
            pending_relationships: Vec::new(),
        }
    }

    pub fn current_scope(&self) -> &str {
        self.scope_stack.last().map(String::as_str).unwrap_or(ScopeTable::TOP)
    }

    pub fn current_resource(&self) -> Option<ResourceId> {
        self.resource_stack.last().copied()
    }

    pub fn push_scope(&mut self, name: &str) {
        self.scope_stack.push(name.to_string());
    }

    pub fn pop_scope(&mut self) {
        if self.scope_stack.len() > 1 {
            self.scope_stack.pop();
        }
    }

    pub fn push_resource(&mut self, id: ResourceId) {
        self.resource_stack.push(id);
    }

    pub fn pop_resource(&mut self) {
        self.resource_stack.pop();
    }

    pub fn push_match(&mut self, frame: MatchScope) {
        self.matches.push(frame);
    }

    pub fn pop_match(&mut self) {
        self.matches.pop();
    }

    /// A scope `ancestor` contains `candidate` if `candidate` or one of
    /// its parents (climbing by name) is `ancestor`. Used to validate
    /// resource overrides, which may only come from a scope that
    /// contains the resource being overridden.
    pub fn scope_contains(&self, ancestor: &str, candidate: &str) -> bool {
        if ancestor == candidate {
            return true;
        }
        let mut current = self.scopes.scope(candidate).and_then(|s| s.parent_name().map(str::to_string));
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.scopes.scope(&name).and_then(|s| s.parent_name().map(str::to_string));
        }
        false
    }

    /// Marks `name` (already normalized) declared; returns `false` if it
    /// was already declared, so callers can make class declaration
    /// idempotent: the body runs exactly once no matter how many times
    /// `include`/`require`/a resource-style `class { }` names it.
    pub fn mark_class_declared(&mut self, name: &str) -> bool {
        self.classes_declared.insert(normalize_name(name))
    }

    pub fn class_is_declared(&self, name: &str) -> bool {
        self.classes_declared.contains(&normalize_name(name))
    }

    /// Tracks the chain of class bodies currently being evaluated, so a
    /// class reached again before its own body has finished (mutual
    /// `include`, self-`include`) is reported as a dependency cycle
    /// rather than silently skipped or recursed into.
    pub fn begin_class_evaluation(&mut self, name: &str) -> Result<(), Vec<String>> {
        let normalized = normalize_name(name);
        if let Some(pos) = self.classes_evaluating.iter().position(|c| *c == normalized) {
            let mut chain = self.classes_evaluating[pos..].to_vec();
            chain.push(normalized);
            return Err(chain);
        }
        self.classes_evaluating.push(normalized);
        Ok(())
    }

    pub fn end_class_evaluation(&mut self) {
        self.classes_evaluating.pop();
    }

    /// Pushes a fresh output-stream overlay (EPP rendering).
    pub fn push_stream(&mut self) {
        self.streams.push(String::new());
    }

    pub fn pop_stream(&mut self) -> String {
        self.streams.pop().unwrap_or_default()
    }

    /// Appends to the innermost output stream; `false` when none is
    /// active.
    pub fn write_stream(&mut self, text: &str) -> bool {
        match self.streams.last_mut() {
            Some(stream) => {
                stream.push_str(text);
                true
            }
            None => false,
        }
    }

    pub fn queue_override(&mut self, pending: PendingOverride) {
        self.pending_overrides.push(pending);
    }

    pub fn queue_defined_type(&mut self, pending: PendingDefinedType) {
        self.pending_defined_types.push(pending);
    }

    pub fn queue_collector(&mut self, collector: QueuedCollector) {
        self.collectors.push(collector);
    }

    pub fn queue_relationship(&mut self, relationship: QueuedRelationship) {
        self.pending_relationships.push(relationship);
    }

    pub fn take_pending_defined_types(&mut self) -> Vec<PendingDefinedType> {
        std::mem::take(&mut self.pending_defined_types)
    }

    pub fn take_pending_overrides(&mut self) -> Vec<PendingOverride> {
        std::mem::take(&mut self.pending_overrides)
    }

    pub fn has_queued_work(&self) -> bool {
        !self.pending_overrides.is_empty()
            || !self.pending_defined_types.is_empty()
            || !self.pending_relationships.is_empty()
            || !self.collectors.is_empty()
    }

    /// Drains the deferred-work queues to a fixed point: `run_pass` is
    /// called once per pass and returns whether it made progress
    /// (resolved a collector, evaluated a defined type, applied an
    /// override, or wired up a relationship). The loop stops as soon as
    /// a pass makes no progress, or fails after [`MAX_FINALIZATION_PASSES`]
    /// passes with queued work still outstanding.
    pub fn finalize<F>(&mut self, mut run_pass: F) -> Result<(), FinalizationFault>
    where
        F: FnMut(&mut Context) -> Result<bool, FinalizationFault>,
    {
        let mut passes = 0;
        loop {
            if !self.has_queued_work() {
                break;
            }
            if passes >= MAX_FINALIZATION_PASSES {
                return Err(FinalizationFault {
                    message: format!(
                        "finalization did not converge after {} passes; a collector or defined type appears to recurse forever",
                        MAX_FINALIZATION_PASSES
                    ),
                    span: Span::point(crate::position::Position::start()),
                });
            }
            let progressed = run_pass(self)?;
            passes += 1;
            if !progressed {
                break;
            }
        }
        self.apply_pending_relationships()?;
        if let Some(collector) = self.collectors.iter().find(|c| c.exported && !c.matched) {
            return Err(FinalizationFault {
                message: format!("exported resource collector for '{}' did not match any resources", collector.type_name),
                span: collector.span,
            });
        }
        if let Err(cycle) = self.catalog.detect_cycles() {
            return Err(FinalizationFault { message: cycle.to_string(), span: Span::point(crate::position::Position::start()) });
        }
        Ok(())
    }

    /// Wires up every queued relationship (`->`/`~>` chains and the
    /// `before`/`notify`/`require`/`subscribe` metaparameters) once the
    /// catalog has stopped growing. Both endpoints must exist by now.
    fn apply_pending_relationships(&mut self) -> Result<(), FinalizationFault> {
        for relationship in std::mem::take(&mut self.pending_relationships) {
            let (source_type, source_title) = &relationship.source;
            let (target_type, target_title) = &relationship.target;
            let source = self.catalog.find(source_type, source_title).ok_or_else(|| FinalizationFault {
                message: format!("cannot create relationship: {}['{}'] is not declared", source_type, source_title),
                span: relationship.span,
            })?;
            let target = self.catalog.find(target_type, target_title).ok_or_else(|| FinalizationFault {
                message: format!("cannot create relationship: {}['{}'] is not declared", target_type, target_title),
                span: relationship.span,
            })?;
            self.catalog
                .add_edge(source, target, relationship.relation)
                .map_err(|message| FinalizationFault { message, span: relationship.span })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::MapFactSource;
    use crate::log::{LogLevel, MemorySink};

    fn context() -> Context {
        Context::new("test.example.com", "production", Arc::new(MapFactSource::new()), Arc::new(MemorySink::new()), LogLevel::Notice)
    }

    #[test]
    fn class_is_declared_once() {
        let mut ctx = context();
        assert!(ctx.mark_class_declared("Foo"));
        assert!(!ctx.mark_class_declared("foo"));
        assert!(ctx.class_is_declared("foo"));
    }

    #[test]
    fn finalize_with_no_queued_work_runs_zero_passes() {
        let mut ctx = context();
        let mut calls = 0;
        ctx.finalize(|_| {
            calls += 1;
            Ok(false)
        })
        .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn finalize_stops_once_a_pass_makes_no_progress() {
        let mut ctx = context();
        ctx.queue_collector(QueuedCollector { type_name: "file".to_string(), exported: false, query: None, span: Span::point(crate::position::Position::start()), matched: false });
        let mut calls = 0;
        ctx.finalize(|context| {
            calls += 1;
            context.collectors.clear();
            Ok(false)
        })
        .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn finalize_reports_non_convergence() {
        let mut ctx = context();
        ctx.queue_collector(QueuedCollector { type_name: "file".to_string(), exported: false, query: None, span: Span::point(crate::position::Position::start()), matched: false });
        let err = ctx.finalize(|_| Ok(true));
        assert!(err.is_err());
    }

    #[test]
    fn scope_containment_climbs_parents() {
        let mut ctx = context();
        ctx.scopes.ensure_scope("base", Some(ScopeTable::TOP));
        ctx.scopes.ensure_scope("child", Some("base"));
        assert!(ctx.scope_contains("base", "child"));
        assert!(!ctx.scope_contains("child", "base"));
    }
}
