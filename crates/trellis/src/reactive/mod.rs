//! Single-threaded reactive cells.
//!
//! [`State`] holds a value, [`Computed`] derives one lazily and [`Effect`]
//! re-runs a closure whenever something it read changes. All of them belong
//! to one explicit [`Runtime`]; there is no process-wide graph.

mod computed;
mod effect;
mod runtime;
mod state;

pub use computed::Computed;
pub use effect::Effect;
pub use runtime::{DEFAULT_MAX_FLUSH_ITERATIONS, NodeId, Runtime};
pub use state::State;
