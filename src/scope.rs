//! Variable scopes, the scope registry, and match scopes.
//!
//! A [`Scope`] is a named variable frame; node/class/defined-type
//! evaluation each get one, linked to a parent by name so `$name` lookups
//! can climb. The [`ScopeTable`] is the compile-wide registry of every
//! scope created so far, keyed by the normalized class/defined-type name
//! (the top scope is keyed by the empty string). Whether an unresolved
//! qualified name names an undefined or merely undeclared class is a
//! question only the caller can answer, since that requires the class
//! [registry](crate::registry) as well as this table; see
//! [`Resolved::UnqualifiedMissingScope`].

use std::collections::HashMap;
use std::rc::Rc;

use crate::value::Value;

#[derive(Debug, Clone)]
pub struct Scope {
    pub name: String,
    parent: Option<String>,
    variables: HashMap<String, Rc<Value>>,
}

impl Scope {
    pub fn new(name: impl Into<String>, parent: Option<String>) -> Self {
        Scope { name: name.into(), parent, variables: HashMap::new() }
    }

    pub fn set_local(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), Rc::new(value));
    }

    pub fn get_local(&self, name: &str) -> Option<Rc<Value>> {
        self.variables.get(name).cloned()
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }
}

#[derive(Debug)]
pub struct ScopeTable {
    scopes: HashMap<String, Scope>,
}

impl ScopeTable {
    pub const TOP: &'static str = "";

    pub fn new() -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(Self::TOP.to_string(), Scope::new(Self::TOP, None));
        ScopeTable { scopes }
    }

    pub fn top_scope(&mut self) -> &mut Scope {
        self.scopes.get_mut(Self::TOP).expect("top scope always present")
    }

    pub fn ensure_scope(&mut self, name: &str, parent: Option<&str>) -> &mut Scope {
        self.scopes
            .entry(name.to_string())
            .or_insert_with(|| Scope::new(name, parent.map(|p| p.to_string())))
    }

    pub fn scope(&self, name: &str) -> Option<&Scope> {
        self.scopes.get(name)
    }

    pub fn scope_mut(&mut self, name: &str) -> Option<&mut Scope> {
        self.scopes.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    /// Looks up `name` in `start`, then its parent, and so on to the top
    /// scope.
    pub fn lookup_climbing(&self, start: &str, name: &str) -> Option<Rc<Value>> {
        let mut current = Some(start);
        while let Some(scope_name) = current {
            let scope = self.scopes.get(scope_name)?;
            if let Some(v) = scope.get_local(name) {
                return Some(v);
            }
            current = scope.parent_name();
        }
        None
    }
}

impl Default for ScopeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Captures from the most recent regex match (`=~`, `case`/`selector`
/// regex options), addressable as `$1`, `$2`, …
#[derive(Debug, Clone, Default)]
pub struct MatchScope {
    captures: Vec<Option<String>>,
}

impl MatchScope {
    pub fn from_captures(captures: Vec<Option<String>>) -> Self {
        MatchScope { captures }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        if index == 0 {
            return None;
        }
        self.captures.get(index - 1).and_then(|c| c.as_deref())
    }
}

#[derive(Debug, Default)]
pub struct MatchScopeStack {
    frames: Vec<MatchScope>,
}

impl MatchScopeStack {
    pub fn push(&mut self, frame: MatchScope) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<MatchScope> {
        self.frames.pop()
    }

    pub fn lookup(&self, index: usize) -> Option<&str> {
        self.frames.last().and_then(|f| f.get(index))
    }
}

/// RAII guard that pops a [`MatchScope`] when dropped, mirroring how the
/// evaluator's other stacks (scope, output stream) are scoped by block
/// structure rather than explicit pop calls.
pub struct MatchScopeGuard<'a> {
    stack: &'a mut MatchScopeStack,
}

impl<'a> MatchScopeGuard<'a> {
    pub fn push(stack: &'a mut MatchScopeStack, frame: MatchScope) -> Self {
        stack.push(frame);
        MatchScopeGuard { stack }
    }
}

impl Drop for MatchScopeGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind<'a> {
    Match(usize),
    TopScope(&'a str),
    Qualified(&'a str, &'a str),
    Local(&'a str),
}

pub fn classify_variable_name(name: &str) -> VariableKind<'_> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) {
        return VariableKind::Match(name.parse().expect("all-digit string parses as usize"));
    }
    if let Some(rest) = name.strip_prefix("::") {
        return VariableKind::TopScope(rest);
    }
    if let Some(idx) = name.rfind("::") {
        return VariableKind::Qualified(&name[..idx], &name[idx + 2..]);
    }
    VariableKind::Local(name)
}

#[derive(Debug, Clone)]
pub enum Resolved {
    Value(Rc<Value>),
    /// A variable that resolved to no binding anywhere on its search path;
    /// Puppet treats this as `undef`, not an error.
    Undef,
    /// A qualified lookup (`$ns::name`) whose scope `ns` has no entry in
    /// the table. The caller decides whether to report it as "undefined"
    /// or "undeclared" by also consulting the class registry.
    UnqualifiedMissingScope(String),
}

/// Resolves a variable: unqualified names climb from
/// `current_scope`, `::name` starts at the top scope, `ns::name` looks up
/// the named scope directly, and all-digit names read the match scope.
pub fn resolve_variable(table: &ScopeTable, matches: &MatchScopeStack, current_scope: &str, name: &str) -> Resolved {
    match classify_variable_name(name) {
        VariableKind::Match(index) => match matches.lookup(index) {
            Some(text) => Resolved::Value(Rc::new(Value::String(text.to_string()))),
            None => Resolved::Undef,
        },
        VariableKind::TopScope(rest) => match table.scope(ScopeTable::TOP).and_then(|s| s.get_local(rest)) {
            Some(v) => Resolved::Value(v),
            None => Resolved::Undef,
        },
        VariableKind::Qualified(scope_name, var_name) => {
            if !table.contains(scope_name) {
                return Resolved::UnqualifiedMissingScope(scope_name.to_string());
            }
            match table.scope(scope_name).and_then(|s| s.get_local(var_name)) {
                Some(v) => Resolved::Value(v),
                None => Resolved::Undef,
            }
        }
        VariableKind::Local(local) => match table.lookup_climbing(current_scope, local) {
            Some(v) => Resolved::Value(v),
            None => Resolved::Undef,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_variable_kinds() {
        assert_eq!(classify_variable_name("1"), VariableKind::Match(1));
        assert_eq!(classify_variable_name("::foo"), VariableKind::TopScope("foo"));
        assert_eq!(classify_variable_name("apache::version"), VariableKind::Qualified("apache", "version"));
        assert_eq!(classify_variable_name("name"), VariableKind::Local("name"));
    }

    #[test]
    fn unqualified_lookup_climbs_to_parent() {
        let mut table = ScopeTable::new();
        table.top_scope().set_local("fqdn", Value::string("host.example.com"));
        table.ensure_scope("apache", Some(ScopeTable::TOP));
        match resolve_variable(&table, &MatchScopeStack::default(), "apache", "fqdn") {
            Resolved::Value(v) => assert_eq!(v.to_display_string(), "host.example.com"),
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn unqualified_unknown_variable_is_undef_not_an_error() {
        let table = ScopeTable::new();
        assert!(matches!(resolve_variable(&table, &MatchScopeStack::default(), ScopeTable::TOP, "nope"), Resolved::Undef));
    }

    #[test]
    fn qualified_lookup_into_missing_scope_is_reported() {
        let table = ScopeTable::new();
        match resolve_variable(&table, &MatchScopeStack::default(), ScopeTable::TOP, "apache::version") {
            Resolved::UnqualifiedMissingScope(name) => assert_eq!(name, "apache"),
            other => panic!("expected a missing-scope report, got {:?}", other),
        }
    }

    #[test]
    fn match_variable_reads_current_frame() {
        let mut matches = MatchScopeStack::default();
        matches.push(MatchScope::from_captures(vec![Some("a".to_string()), None]));
        assert_eq!(resolve_variable(&ScopeTable::new(), &matches, ScopeTable::TOP, "1").to_text(), Some("a".to_string()));
        assert!(matches!(resolve_variable(&ScopeTable::new(), &matches, ScopeTable::TOP, "2"), Resolved::Undef));
    }

    #[test]
    fn match_scope_guard_pops_on_drop() {
        let mut stack = MatchScopeStack::default();
        {
            let guard = MatchScopeGuard::push(&mut stack, MatchScope::from_captures(vec![Some("x".to_string())]));
            assert_eq!(guard.stack.lookup(1), Some("x"));
        }
        assert_eq!(stack.lookup(1), None);
    }
}

#[cfg(test)]
impl Resolved {
    fn to_text(&self) -> Option<String> {
        match self {
            Resolved::Value(v) => Some(v.to_display_string()),
            _ => None,
        }
    }
}
