//! The compiled catalog: resources, containment, and the relationship
//! graph.

pub mod cycles;

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use crate::position::Span;
use crate::value::Value;

pub const MAIN_STAGE: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Contains,
    Before,
    Require,
    Notify,
    Subscribe,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attribute {
    pub name: String,
    pub value: Value,
}

/// A unique `(type, title)` key. Types are compared case-insensitively,
/// per Puppet's resource-reference semantics (`File['x']` ==
/// `file['x']`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub type_name: String,
    pub title: String,
}

impl ResourceKey {
    pub fn new(type_name: impl Into<String>, title: impl Into<String>) -> Self {
        ResourceKey { type_name: type_name.into().to_lowercase(), title: title.into() }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub type_name: String,
    pub title: String,
    #[serde(skip)]
    pub container: Option<ResourceId>,
    pub scope: String,
    pub exported: bool,
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
    pub tags: Vec<String>,
    pub attributes: Vec<Attribute>,
    /// Span of the declaring resource body, reported by cycle detection.
    #[serde(skip)]
    pub declared_at: Option<Span>,
    #[serde(skip)]
    pub vertex: Option<NodeIndex>,
}

impl Resource {
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.iter().find(|a| a.name == name).map(|a| &a.value)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(existing) = self.attributes.iter_mut().find(|a| a.name == name) {
            existing.value = value;
        } else {
            self.attributes.push(Attribute { name, value });
        }
    }
}

pub type ResourceId = usize;

#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    pub source: ResourceId,
    pub target: ResourceId,
    pub relation: Relation,
}

/// Reported when cycle detection finds one or more dependency loops.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCycleFault {
    /// Each cycle as an ordered list of `(type, title)`, first element
    /// repeated at the end to show the closed loop.
    pub cycles: Vec<Vec<String>>,
}

impl std::fmt::Display for ResourceCycleFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for cycle in &self.cycles {
            writeln!(f, "found dependency cycle: {}", cycle.join(" => "))?;
        }
        Ok(())
    }
}
impl std::error::Error for ResourceCycleFault {}

#[derive(Debug, Default, Serialize)]
pub struct Catalog {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub resources: Vec<Resource>,
    pub edges: Vec<Edge>,
    pub classes: Vec<String>,
    #[serde(skip)]
    by_key: HashMap<ResourceKey, ResourceId>,
    #[serde(skip)]
    by_type: HashMap<String, Vec<ResourceId>>,
    #[serde(skip)]
    graph: DiGraph<ResourceId, Relation>,
    #[serde(skip)]
    vertex_for: HashMap<ResourceId, NodeIndex>,
}

impl Catalog {
    pub fn new(name: impl Into<String>, environment: impl Into<String>) -> Self {
        let mut catalog = Catalog {
            name: name.into(),
            version: "1".to_string(),
            environment: environment.into(),
            ..Default::default()
        };
        catalog
            .add_resource(Resource {
                type_name: "stage".to_string(),
                title: MAIN_STAGE.to_string(),
                container: None,
                scope: String::new(),
                exported: false,
                is_virtual: false,
                tags: Vec::new(),
                attributes: Vec::new(),
                declared_at: None,
                vertex: None,
            })
            .expect("main stage never collides on a fresh catalog");
        catalog
    }

    pub fn find(&self, type_name: &str, title: &str) -> Option<ResourceId> {
        self.by_key.get(&ResourceKey::new(type_name, title)).copied()
    }

    pub fn resource(&self, id: ResourceId) -> &Resource {
        &self.resources[id]
    }

    pub fn resource_mut(&mut self, id: ResourceId) -> &mut Resource {
        &mut self.resources[id]
    }

    pub fn resources_of_type(&self, type_name: &str) -> impl Iterator<Item = ResourceId> + '_ {
        self.by_type.get(&type_name.to_lowercase()).into_iter().flatten().copied()
    }

    /// Adds a resource, rejecting a duplicate `(type, title)` key.
    /// Virtual resources get an id but no graph vertex until realized.
    pub fn add_resource(&mut self, mut resource: Resource) -> Result<ResourceId, String> {
        if resource.type_name.is_empty() || resource.title.is_empty() {
            return Err("a resource must have a non-empty type and title".to_string());
        }
        let key = ResourceKey::new(&resource.type_name, &resource.title);
        if self.by_key.contains_key(&key) {
            return Err(format!("Duplicate declaration: {}['{}']", resource.type_name, resource.title));
        }
        let id = self.resources.len();
        let container = resource.container;
        let is_virtual = resource.is_virtual;
        if !is_virtual {
            let vertex = self.graph.add_node(id);
            resource.vertex = Some(vertex);
            self.vertex_for.insert(id, vertex);
        }
        self.by_type.entry(resource.type_name.to_lowercase()).or_default().push(id);
        if resource.type_name == "class" {
            self.classes.push(resource.title.clone());
        }
        self.resources.push(resource);
        self.by_key.insert(key, id);
        if !is_virtual {
            if let Some(container_id) = container {
                self.add_edge(container_id, id, Relation::Contains)?;
            }
        }
        Ok(id)
    }

    /// Adds the graph vertex and containment edge for a previously virtual
    /// resource (`realize`), atomically: either both happen or neither.
    pub fn realize(&mut self, id: ResourceId) -> Result<(), String> {
        if !self.resources[id].is_virtual {
            return Ok(());
        }
        let container = self.resources[id].container;
        let vertex = self.graph.add_node(id);
        self.resources[id].is_virtual = false;
        self.resources[id].vertex = Some(vertex);
        self.vertex_for.insert(id, vertex);
        if let Some(container_id) = container {
            self.add_edge(container_id, id, Relation::Contains)?;
        }
        Ok(())
    }

    /// Adds a labeled edge, idempotently: re-adding the same
    /// `(source, target, relation)` is a no-op. `before`/`notify` edges
    /// are stored as their inverse (`require`/`subscribe` from target to
    /// source) so every stored edge points "dependent depends on
    /// dependency" uniformly.
    pub fn add_edge(&mut self, source: ResourceId, target: ResourceId, relation: Relation) -> Result<(), String> {
        let (from, to, relation) = match relation {
            Relation::Before => (target, source, Relation::Require),
            Relation::Notify => (target, source, Relation::Subscribe),
            other => (source, target, other),
        };
        if self.edges.iter().any(|e| e.source == from && e.target == to && e.relation == relation) {
            return Ok(());
        }
        let from_vertex = *self
            .vertex_for
            .get(&from)
            .ok_or_else(|| format!("cannot relate virtual resource {}", self.resources[from].title))?;
        let to_vertex = *self
            .vertex_for
            .get(&to)
            .ok_or_else(|| format!("cannot relate virtual resource {}", self.resources[to].title))?;
        self.graph.add_edge(from_vertex, to_vertex, relation);
        self.edges.push(Edge { source: from, target: to, relation });
        Ok(())
    }

    /// Runs cycle detection over the realized-resource graph.
    pub fn detect_cycles(&self) -> Result<(), ResourceCycleFault> {
        let raw_cycles = cycles::enumerate_simple_cycles(&self.graph);
        if raw_cycles.is_empty() {
            return Ok(());
        }
        let cycles = raw_cycles
            .into_iter()
            .map(|path| {
                let mut names: Vec<String> = path
                    .iter()
                    .map(|vertex| self.cycle_member_label(self.graph[*vertex]))
                    .collect();
                if let Some(first) = names.first().cloned() {
                    names.push(first);
                }
                names
            })
            .collect();
        Err(ResourceCycleFault { cycles })
    }

    /// One entry in a reported cycle: the resource reference plus its
    /// declaration site when one was recorded.
    fn cycle_member_label(&self, id: ResourceId) -> String {
        let r = &self.resources[id];
        let reference = format!("{}[{}]", capitalize(&r.type_name), r.title);
        match r.declared_at {
            Some(span) => format!("{} declared at line {}", reference, span.begin.line),
            None => reference,
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
