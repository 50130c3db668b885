//! Document model for Trellis.
//!
//! These are the shapes the designer produces and the engine consumes:
//! an [`Application`] owns [`Page`]s, every page owns a flat list of
//! [`Container`]s forming a tree, plus the variables, queries, fetchers and
//! callables scoped to it.
//!
//! Field names serialize in camelCase so editor documents load unchanged.

mod document;
mod id;
pub mod tree;

pub use document::*;
pub use id::Id;
pub use tree::ModelError;
