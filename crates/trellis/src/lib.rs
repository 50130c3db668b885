//! Trellis runs the formulas of a visual application builder.
//!
//! An [`Application`](trellis_model::Application) declares variables, queries,
//! fetchers and callables at app level and on every page; each page holds a
//! tree of containers whose properties are formulas. A [`Session`] turns that
//! document into a live reactive graph:
//!
//! - [`variables`] instantiates state, computed and effect variables,
//! - [`scope`] composes them with the callable, fetch and query helpers,
//! - [`binding`] evaluates container properties against the composed scope,
//! - [`ledger`] keeps the errors all of the above produce.
//!
//! Formulas are a small JavaScript subset ([`formula`]) exporting their result
//! through `module.exports`.

pub mod binding;
pub mod clock;
pub mod config;
pub mod context;
pub mod elements;
pub mod error;
pub mod formula;
pub mod ledger;
pub mod level;
pub mod reactive;
pub mod schema;
pub mod scope;
pub mod services;
pub mod session;
pub mod utils;
pub mod validators;
pub mod variables;

pub use binding::{BindingMode, ContainerBinding, PropertyState};
pub use clock::{Clock, SystemClock, TestClock};
pub use config::EngineConfig;
pub use context::{EngineContext, InitialValues, Navigation};
pub use elements::{ElementRegistry, ElementSpec};
pub use error::EngineError;
pub use formula::{EvalError, FormulaEngine, FormulaEvaluator, Value};
pub use ledger::{ErrorCategory, ErrorEntry, ErrorLedger, ErrorSubject};
pub use services::Services;
pub use session::Session;
pub use trellis_model;
