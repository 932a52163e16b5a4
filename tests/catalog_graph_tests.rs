//! Catalog store and dependency-graph behavior: key uniqueness, stable
//! ordering, edge inversion and idempotence, cycle enumeration, and the
//! serialization shape a catalog writer consumes.

use std::path::Path;
use std::sync::Arc;

use puppetc::catalog::{Catalog, Relation, Resource};
use puppetc::fact::MapFactSource;
use puppetc::log::MemorySink;
use puppetc::session::{CompilerOptions, Session, StringSource};

fn resource(type_name: &str, title: &str) -> Resource {
    Resource {
        type_name: type_name.to_string(),
        title: title.to_string(),
        container: None,
        scope: String::new(),
        exported: false,
        is_virtual: false,
        tags: Vec::new(),
        attributes: Vec::new(),
        declared_at: None,
        vertex: None,
    }
}

fn compile(manifest: &str) -> Catalog {
    let mut session = Session::new(
        CompilerOptions::new("node.example.com", "production"),
        Arc::new(MapFactSource::new()),
        Arc::new(MemorySink::new()),
    );
    let source = StringSource::new().with("site.pp", manifest);
    session.compile(&source, Path::new("site.pp")).expect("compile should succeed")
}

// =============================================================================
// Store invariants
// =============================================================================

#[test]
fn duplicate_keys_are_rejected_and_leave_the_catalog_unchanged() {
    let mut catalog = Catalog::new("n", "production");
    catalog.add_resource(resource("file", "x")).unwrap();
    let count = catalog.resources.len();
    assert!(catalog.add_resource(resource("file", "x")).is_err());
    assert!(catalog.add_resource(resource("File", "x")).is_err(), "type comparison is case-insensitive");
    assert_eq!(catalog.resources.len(), count);
}

#[test]
fn resources_without_a_type_or_title_are_rejected() {
    let mut catalog = Catalog::new("n", "production");
    assert!(catalog.add_resource(resource("", "x")).is_err());
    assert!(catalog.add_resource(resource("file", "")).is_err());
}

#[test]
fn enumeration_preserves_insertion_order() {
    let catalog = compile("file { 'b': } file { 'a': } file { 'c': }");
    let titles: Vec<&str> = catalog
        .resources
        .iter()
        .filter(|r| r.type_name == "file")
        .map(|r| r.title.as_str())
        .collect();
    assert_eq!(titles, vec!["b", "a", "c"]);
}

#[test]
fn lookup_by_type_lists_every_title() {
    let catalog = compile("file { 'a': } file { 'b': } user { 'u': }");
    let files: Vec<_> = catalog.resources_of_type("File").collect();
    assert_eq!(files.len(), 2);
}

// =============================================================================
// Edges
// =============================================================================

#[test]
fn before_and_notify_store_their_inverted_relation() {
    let mut catalog = Catalog::new("n", "production");
    let a = catalog.add_resource(resource("file", "a")).unwrap();
    let b = catalog.add_resource(resource("file", "b")).unwrap();
    catalog.add_edge(a, b, Relation::Before).unwrap();
    catalog.add_edge(a, b, Relation::Notify).unwrap();
    assert!(catalog.edges.iter().all(|e| e.source == b && e.target == a));
    assert!(catalog.edges.iter().any(|e| e.relation == Relation::Require));
    assert!(catalog.edges.iter().any(|e| e.relation == Relation::Subscribe));
}

#[test]
fn re_adding_an_edge_is_a_no_op() {
    let mut catalog = Catalog::new("n", "production");
    let a = catalog.add_resource(resource("file", "a")).unwrap();
    let b = catalog.add_resource(resource("file", "b")).unwrap();
    catalog.add_edge(a, b, Relation::Require).unwrap();
    catalog.add_edge(a, b, Relation::Require).unwrap();
    catalog.add_edge(b, a, Relation::Before).unwrap();
    assert_eq!(catalog.edges.len(), 1);
}

#[test]
fn edges_to_virtual_resources_are_rejected() {
    let mut catalog = Catalog::new("n", "production");
    let a = catalog.add_resource(resource("file", "a")).unwrap();
    let mut v = resource("file", "v");
    v.is_virtual = true;
    let virtual_id = catalog.add_resource(v).unwrap();
    assert!(catalog.add_edge(a, virtual_id, Relation::Require).is_err());
    catalog.realize(virtual_id).unwrap();
    assert!(catalog.add_edge(a, virtual_id, Relation::Require).is_ok());
}

// =============================================================================
// Cycle detection
// =============================================================================

#[test]
fn each_cycle_is_reported_once_with_its_members() {
    let mut catalog = Catalog::new("n", "production");
    let a = catalog.add_resource(resource("exec", "a")).unwrap();
    let b = catalog.add_resource(resource("exec", "b")).unwrap();
    let c = catalog.add_resource(resource("exec", "c")).unwrap();
    catalog.add_edge(a, b, Relation::Require).unwrap();
    catalog.add_edge(b, a, Relation::Require).unwrap();
    catalog.add_edge(b, c, Relation::Require).unwrap();
    let fault = catalog.detect_cycles().unwrap_err();
    assert_eq!(fault.cycles.len(), 1);
    let cycle = &fault.cycles[0];
    assert_eq!(cycle.first(), cycle.last(), "reported as a closed loop");
    assert_eq!(cycle.len(), 3);
}

#[test]
fn overlapping_cycles_are_each_enumerated() {
    let mut catalog = Catalog::new("n", "production");
    let a = catalog.add_resource(resource("exec", "a")).unwrap();
    let b = catalog.add_resource(resource("exec", "b")).unwrap();
    let c = catalog.add_resource(resource("exec", "c")).unwrap();
    catalog.add_edge(a, b, Relation::Require).unwrap();
    catalog.add_edge(b, a, Relation::Require).unwrap();
    catalog.add_edge(b, c, Relation::Require).unwrap();
    catalog.add_edge(c, b, Relation::Require).unwrap();
    let fault = catalog.detect_cycles().unwrap_err();
    assert_eq!(fault.cycles.len(), 2);
}

#[test]
fn cycle_messages_name_the_resources_and_their_declaration_sites() {
    let mut session = Session::new(
        CompilerOptions::new("node.example.com", "production"),
        Arc::new(MapFactSource::new()),
        Arc::new(MemorySink::new()),
    );
    let source = StringSource::new().with(
        "site.pp",
        "exec { 'a': require => Exec['b'] }\nexec { 'b': require => Exec['a'] }",
    );
    let err = session.compile(&source, Path::new("site.pp")).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Exec[a]"));
    assert!(message.contains("declared at line 1"));
    assert!(message.contains("declared at line 2"));
}

// =============================================================================
// Serialization
// =============================================================================

#[test]
fn catalog_serializes_to_the_documented_json_shape() {
    let catalog = compile("class web { } include web file { '/tmp/a': ensure => present }");
    let json = serde_json::to_value(&catalog).unwrap();
    for field in ["name", "version", "environment", "resources", "edges", "classes"] {
        assert!(json.get(field).is_some(), "missing field {:?}", field);
    }
    assert_eq!(json["name"], "node.example.com");
    assert_eq!(json["environment"], "production");
    assert_eq!(json["classes"], serde_json::json!(["web"]));

    let file = json["resources"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["title"] == "/tmp/a")
        .expect("file resource should serialize");
    assert_eq!(file["type"], "file");
    assert_eq!(file["attributes"][0]["name"], "ensure");
    assert_eq!(file["attributes"][0]["value"], "present");
}

#[test]
fn edges_serialize_with_source_target_and_relation() {
    let catalog = compile("file { 'a': } file { 'b': require => File['a'] }");
    let json = serde_json::to_value(&catalog).unwrap();
    let edges = json["edges"].as_array().unwrap();
    assert!(edges
        .iter()
        .any(|e| e["relation"] == "require" && e["source"].is_number() && e["target"].is_number()));
}
