//! Session/Environment: the embedding-facing entry point that threads a
//! manifest's source through lex → parse → validate → scan → evaluate →
//! finalize and hands back a finished catalog.
//!
//! [`Environment`] owns the per-path syntax-tree cache and the registry
//! for one compilation universe; [`Session`] owns one `Environment` plus
//! the fact source and log sink a compile needs. Neither ever touches a
//! filesystem directly; [`ManifestSource`] is the seam a front end
//! implements to supply file contents.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crate::ast::SyntaxTree;
use crate::catalog::Catalog;
use crate::context::Context;
use crate::eval::{self, Evaluator};
use crate::fact::FactSource;
use crate::fault::Fault;
use crate::log::{LogLevel, LogSink};
use crate::parser::Parser;
use crate::registry::{NodeEntry, Registry};
use crate::validator;

/// Where an [`Environment`] reads manifest source from. A front end
/// implements this over its own module/manifest directory discovery;
/// [`StringSource`] stands in for it in this crate's own tests.
pub trait ManifestSource {
    fn read(&self, path: &Path) -> io::Result<String>;
}

/// An in-memory [`ManifestSource`] keyed by path.
#[derive(Debug, Default)]
pub struct StringSource {
    files: HashMap<PathBuf, String>,
}

impl StringSource {
    pub fn new() -> Self {
        StringSource::default()
    }

    pub fn with(mut self, path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        self.files.insert(path.into(), source.into());
        self
    }
}

impl ManifestSource for StringSource {
    fn read(&self, path: &Path) -> io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no manifest source for {}", path.display())))
    }
}

/// Node name, environment name, and base directories a compilation runs
/// under. Directories are stored but never resolved here: module and
/// manifest discovery under them is a front-end collaborator's job.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    pub node_name: String,
    pub environment_name: String,
    pub manifest_dir: PathBuf,
    pub module_dir: PathBuf,
    pub log_level: LogLevel,
}

impl CompilerOptions {
    pub fn new(node_name: impl Into<String>, environment_name: impl Into<String>) -> Self {
        CompilerOptions {
            node_name: node_name.into(),
            environment_name: environment_name.into(),
            manifest_dir: PathBuf::new(),
            module_dir: PathBuf::new(),
            log_level: LogLevel::Notice,
        }
    }

    pub fn with_manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.manifest_dir = dir.into();
        self
    }

    pub fn with_module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.module_dir = dir.into();
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}

/// One compilation universe: a syntax-tree cache (so a manifest reached
/// from more than one entry point is only parsed once) plus the
/// class/defined-type/node registry scanned from it so far. Building an
/// `Environment` never touches disk.
pub struct Environment {
    options: CompilerOptions,
    cache: Mutex<HashMap<PathBuf, Rc<SyntaxTree>>>,
    registry: Registry,
}

impl Environment {
    pub fn new(options: CompilerOptions) -> Self {
        Environment { options, cache: Mutex::new(HashMap::new()), registry: Registry::new() }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Parses `path` via `source`, memoizing the tree. A cache hit never
    /// touches `source` again.
    fn parse(&self, source: &dyn ManifestSource, path: &Path) -> Result<Rc<SyntaxTree>, Fault> {
        let mut cache = self.cache.lock().expect("syntax tree cache poisoned");
        if let Some(tree) = cache.get(path) {
            return Ok(tree.clone());
        }
        let text = source.read(path).map_err(|e| Fault::Io(e.to_string()))?;
        let tree = Rc::new(Parser::parse_manifest(&text, Some(path.display().to_string()))?);
        cache.insert(path.to_path_buf(), tree.clone());
        Ok(tree)
    }

    /// Scans `body` into the registry. [`Registry::scan_and_commit`] only
    /// commits once a full scan succeeds, so a malformed manifest never
    /// leaves partial class/defined-type entries behind.
    fn scan(&mut self, body: &[crate::ast::Ast]) -> Result<(), Fault> {
        self.registry.scan_and_commit(body)?;
        Ok(())
    }
}

/// Owns one [`Environment`] plus the fact source and log sink a compile
/// needs, and drives a manifest through the full pipeline.
pub struct Session {
    environment: Environment,
    facts: Arc<dyn FactSource>,
    log_sink: Arc<dyn LogSink>,
}

impl Session {
    pub fn new(options: CompilerOptions, facts: Arc<dyn FactSource>, log_sink: Arc<dyn LogSink>) -> Self {
        Session { environment: Environment::new(options), facts, log_sink }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Compiles the manifest at `path` (read through `source`) into a
    /// finished catalog for this session's node: parse, validate, scan,
    /// evaluate the top-level body, evaluate the matching `node` entry
    /// (walking its `inherits` chain first) if one exists, then drain
    /// the finalization queues to a fixed point.
    pub fn compile(&mut self, source: &dyn ManifestSource, path: &Path) -> Result<Catalog, Fault> {
        let tree = self.environment.parse(source, path)?;
        validator::validate(&tree.body).map_err(|e| Fault::from(e).locate(&tree.source))?;
        self.environment.scan(&tree.body).map_err(|e| e.locate(&tree.source))?;

        let options = self.environment.options().clone();
        let mut ctx = Context::new(
            options.node_name.clone(),
            options.environment_name.clone(),
            self.facts.clone(),
            self.log_sink.clone(),
            options.log_level,
        );
        ctx.registry = self.environment.registry.clone();
        ctx.source_text = tree.source.clone();

        let mut evaluator = Evaluator::new();
        evaluator.hoist_functions(&tree.body);
        evaluator.eval_body(&tree.body, &mut ctx).map_err(|e| Fault::from(e).locate(&tree.source))?;

        if let Some(node) = ctx.registry.node_for(&options.node_name).cloned() {
            Self::evaluate_node(&mut evaluator, &mut ctx, &node).map_err(|e| e.locate(&tree.source))?;
        }

        ctx.finalize(|ctx| eval::run_finalization_pass(&mut evaluator, ctx))?;
        Ok(ctx.catalog)
    }

    fn evaluate_node(evaluator: &mut Evaluator, ctx: &mut Context, node: &NodeEntry) -> Result<(), Fault> {
        if let Some(parent_ast) = &node.parent {
            let parent_name = evaluator.eval(parent_ast, ctx)?.to_display_string();
            if let Some(parent_node) = ctx.registry.node_for(&parent_name).cloned() {
                Self::evaluate_node(evaluator, ctx, &parent_node)?;
            }
        }
        evaluator.eval_body(&node.body, ctx)?;
        Ok(())
    }
}
