//! A compiler core for Puppet manifests: lexer, parser, validator,
//! evaluator, and catalog builder.
//!
//! [`session`] is the usual entry point for embedders: it owns the
//! per-environment class/defined-type registry and drives a manifest
//! from source text through to a finished [`catalog::Catalog`]. The
//! stages below it can also be used directly for tooling that only
//! needs part of the pipeline (a linter that stops after [`validator`],
//! for instance).

pub mod ast;
pub mod catalog;
pub mod context;
pub mod embed;
pub mod eval;
pub mod fact;
pub mod fault;
pub mod lexer;
pub mod log;
pub mod parser;
pub mod position;
pub mod registry;
pub mod scope;
pub mod session;
pub mod token;
pub mod validator;
pub mod value;
