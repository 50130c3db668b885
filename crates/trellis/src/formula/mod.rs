//! The formula language: a small JavaScript subset whose snippets assign
//! their result to `module.exports`.
//!
//! Source text goes through [`lexer`] and [`parser`] (chumsky), then the
//! [`resolver`] checks every free identifier against the names the caller
//! injects. [`compiler::FormulaEngine`] caches parsed programs and runs them
//! on the tree-walking [`interpreter`].

pub mod ast;
pub mod builtins;
pub mod compiler;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod promise;
pub mod report;
pub mod resolver;
pub mod value;

use chumsky::prelude::*;

pub use compiler::{Environment, FormulaEngine, FormulaError, FormulaEvaluator, Outcome, Program};
pub use interpreter::{EvalError, Interpreter, Limits};
pub use promise::Promise;
pub use report::{CompileError, Diagnostic};
pub use value::{Function, ObjectMap, Signal, Value};

pub type Span = SimpleSpan;
pub type ParseError<'src, T> = Rich<'src, T, Span>;

#[derive(Debug, Clone)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}
