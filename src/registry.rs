//! Class/defined-type/node/type-alias registry and its transactional
//! scanner.
//!
//! The scanner walks a validated syntax tree once, collecting definitions
//! into staging maps; nothing is merged into the live [`Registry`] unless
//! the whole scan succeeds, so a manifest with one bad definition never
//! leaves the registry half-updated.

use std::collections::HashMap;

use crate::ast::{Ast, AstKind, HostMatcher, HostMatcherKind, Parameter};
use crate::fault::ValidationFault;
use crate::position::Span;

/// Strips a leading `::` and lowercases, the canonical form for class
/// and defined-type names.
pub fn normalize_name(name: &str) -> String {
    name.trim_start_matches("::").to_lowercase()
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub parent: Option<String>,
    pub parameters: Vec<Parameter>,
    pub body: Vec<Ast>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct DefinedTypeDef {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub body: Vec<Ast>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub hostnames: Vec<HostMatcher>,
    pub parent: Option<Box<Ast>>,
    pub body: Vec<Ast>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct TypeAliasDef {
    pub name: String,
    pub type_expr: Ast,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Class,
    DefinedType,
    TypeAlias,
}

impl Category {
    fn label(self) -> &'static str {
        match self {
            Category::Class => "class",
            Category::DefinedType => "defined type",
            Category::TypeAlias => "type alias",
        }
    }
}

/// Class/defined-type/node/alias lookup table built by successive scans.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    classes: HashMap<String, Vec<ClassDef>>,
    defined_types: HashMap<String, DefinedTypeDef>,
    type_aliases: HashMap<String, TypeAliasDef>,
    nodes: Vec<NodeEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn class(&self, name: &str) -> Option<&[ClassDef]> {
        self.classes.get(&normalize_name(name)).map(|v| v.as_slice())
    }

    pub fn defined_type(&self, name: &str) -> Option<&DefinedTypeDef> {
        self.defined_types.get(&normalize_name(name))
    }

    pub fn type_alias(&self, name: &str) -> Option<&TypeAliasDef> {
        self.type_aliases.get(&normalize_name(name))
    }

    /// Finds the node definition matching `hostname`: an exact name match
    /// wins, then the first regex match in declaration order, then the
    /// `default` entry if any.
    pub fn node_for(&self, hostname: &str) -> Option<&NodeEntry> {
        for entry in &self.nodes {
            if entry.hostnames.iter().any(|h| matches!(&h.kind, HostMatcherKind::Name(n) if n.eq_ignore_ascii_case(hostname)))
            {
                return Some(entry);
            }
        }
        for entry in &self.nodes {
            for h in &entry.hostnames {
                if let HostMatcherKind::Regex(pattern) = &h.kind {
                    if let Ok(re) = regex::Regex::new(pattern) {
                        if re.is_match(hostname) {
                            return Some(entry);
                        }
                    }
                }
            }
        }
        self.nodes.iter().find(|entry| entry.hostnames.iter().any(|h| matches!(h.kind, HostMatcherKind::Default)))
    }

    fn category_of(&self, staging: &Staging, normalized: &str) -> Option<Category> {
        if staging.classes.contains_key(normalized) || self.classes.contains_key(normalized) {
            return Some(Category::Class);
        }
        if staging.defined_types.contains_key(normalized) || self.defined_types.contains_key(normalized) {
            return Some(Category::DefinedType);
        }
        if staging.type_aliases.contains_key(normalized) || self.type_aliases.contains_key(normalized) {
            return Some(Category::TypeAlias);
        }
        None
    }

    /// Scans `body` (already passed through [`crate::validator::validate`])
    /// and commits its definitions only if the entire scan succeeds.
    pub fn scan_and_commit(&mut self, body: &[Ast]) -> Result<(), ValidationFault> {
        let mut staging = Staging::default();
        self.scan_block(&mut staging, body)?;
        self.commit(staging);
        Ok(())
    }

    fn scan_block(&self, staging: &mut Staging, body: &[Ast]) -> Result<(), ValidationFault> {
        for stmt in body {
            self.scan_statement(staging, stmt)?;
        }
        Ok(())
    }

    fn scan_statement(&self, staging: &mut Staging, ast: &Ast) -> Result<(), ValidationFault> {
        match &ast.kind {
            AstKind::Class { name, parent, parameters, body } => {
                self.scan_class(staging, name, parent.clone(), parameters, body, ast.span)?;
                self.scan_block(staging, body)
            }
            AstKind::DefinedType { name, parameters, body } => {
                self.scan_defined_type(staging, name, parameters, body, ast.span)
            }
            AstKind::NodeDef { hostnames, parent, body } => {
                self.scan_node(staging, hostnames, parent, body, ast.span)
            }
            AstKind::TypeAlias { name, type_expr } => self.scan_type_alias(staging, name, type_expr, ast.span),
            _ => Ok(()),
        }
    }

    fn scan_class(
        &self,
        staging: &mut Staging,
        name: &str,
        parent: Option<String>,
        parameters: &[Parameter],
        body: &[Ast],
        span: Span,
    ) -> Result<(), ValidationFault> {
        let normalized = normalize_name(name);
        if let Some(other) = self.category_of(staging, &normalized) {
            if other != Category::Class {
                return Err(fault(
                    format!("'{}' is already defined as a {}", name, other.label()),
                    span,
                ));
            }
        }
        let existing_parent = self
            .classes
            .get(&normalized)
            .and_then(|v| v.first())
            .or_else(|| staging.classes.get(&normalized).and_then(|v| v.first()))
            .and_then(|c| c.parent.clone());
        if let Some(existing) = &existing_parent {
            if let Some(new_parent) = &parent {
                if existing != new_parent {
                    return Err(fault(
                        format!("class '{}' is already declared inheriting from '{}'", name, existing),
                        span,
                    ));
                }
            }
        }
        staging.classes.entry(normalized.clone()).or_default().push(ClassDef {
            name: normalized,
            parent,
            parameters: parameters.to_vec(),
            body: body.to_vec(),
            span,
        });
        Ok(())
    }

    fn scan_defined_type(
        &self,
        staging: &mut Staging,
        name: &str,
        parameters: &[Parameter],
        body: &[Ast],
        span: Span,
    ) -> Result<(), ValidationFault> {
        let normalized = normalize_name(name);
        if let Some(other) = self.category_of(staging, &normalized) {
            return Err(fault(format!("'{}' is already defined as a {}", name, other.label()), span));
        }
        staging.defined_types.insert(
            normalized.clone(),
            DefinedTypeDef { name: normalized, parameters: parameters.to_vec(), body: body.to_vec(), span },
        );
        Ok(())
    }

    fn scan_type_alias(&self, staging: &mut Staging, name: &str, type_expr: &Ast, span: Span) -> Result<(), ValidationFault> {
        let normalized = normalize_name(name);
        if let Some(other) = self.category_of(staging, &normalized) {
            return Err(fault(format!("'{}' is already defined as a {}", name, other.label()), span));
        }
        staging
            .type_aliases
            .insert(normalized.clone(), TypeAliasDef { name: normalized, type_expr: type_expr.clone(), span });
        Ok(())
    }

    fn scan_node(
        &self,
        staging: &mut Staging,
        hostnames: &[HostMatcher],
        parent: &Option<Box<Ast>>,
        body: &[Ast],
        span: Span,
    ) -> Result<(), ValidationFault> {
        let signature = node_signature(hostnames);
        let duplicate = self
            .nodes
            .iter()
            .chain(staging.nodes.iter())
            .any(|entry| node_signature(&entry.hostnames) == signature);
        if duplicate {
            return Err(fault("duplicate node definition for the same host match", span));
        }
        staging.nodes.push(NodeEntry { hostnames: hostnames.to_vec(), parent: parent.clone(), body: body.to_vec(), span });
        Ok(())
    }

    fn commit(&mut self, staging: Staging) {
        for (name, mut defs) in staging.classes {
            self.classes.entry(name).or_default().append(&mut defs);
        }
        for (name, def) in staging.defined_types {
            self.defined_types.insert(name, def);
        }
        for (name, def) in staging.type_aliases {
            self.type_aliases.insert(name, def);
        }
        self.nodes.extend(staging.nodes);
    }
}

#[derive(Default)]
struct Staging {
    classes: HashMap<String, Vec<ClassDef>>,
    defined_types: HashMap<String, DefinedTypeDef>,
    type_aliases: HashMap<String, TypeAliasDef>,
    nodes: Vec<NodeEntry>,
}

fn node_signature(hostnames: &[HostMatcher]) -> Vec<String> {
    let mut sig: Vec<String> = hostnames
        .iter()
        .map(|h| match &h.kind {
            HostMatcherKind::Name(n) => format!("name:{}", n.to_lowercase()),
            HostMatcherKind::Regex(r) => format!("regex:{}", r),
            HostMatcherKind::Default => "default".to_string(),
        })
        .collect();
    sig.sort();
    sig
}

// Column 1 here: the scan has no source text; `Fault::locate` fills in
// the real column at the pipeline boundary.
fn fault(message: impl Into<String>, span: Span) -> ValidationFault {
    ValidationFault { message: message.into(), span, column: 1, path: None }
}
