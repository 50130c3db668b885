use super::Spanned;
use super::ast::{Name, Stmt};
use super::builtins::{self, GLOBAL_NAMES};
use super::interpreter::{EvalError, Interpreter, Limits, Scope};
use super::parser::parse;
use super::report::CompileError;
use super::resolver::resolve;
use super::value::Value;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

const PARSE_CACHE_CAPACITY: usize = 1024;

/// Name every formula gets for its result object.
pub const MODULE: &str = "module";

/// A parsed formula whose free names were checked against an environment.
pub struct Program {
    source: Rc<str>,
    body: Rc<Vec<Spanned<Stmt>>>,
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("source", &self.source)
            .field("statements", &self.body.len())
            .finish()
    }
}

/// The names a formula may use beyond the standard globals, with their
/// values. Bindings are constant inside the formula.
#[derive(Clone, Default)]
pub struct Environment {
    bindings: IndexMap<Name, Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<Name>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<Name>, value: impl Into<Value>) {
        self.bindings.insert(name.into(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &Name> {
        self.bindings.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &Value)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.bindings.keys()).finish()
    }
}

impl<K: Into<Name>> FromIterator<(K, Value)> for Environment {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Self {
            bindings: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        }
    }
}

/// Result of running a formula.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// `module.exports` after the run.
    pub exports: Value,
    /// `true` when the formula never replaced or filled the initial empty
    /// `module.exports` object.
    pub untouched: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FormulaError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Seam between the engine and whatever runs formulas.
pub trait FormulaEvaluator {
    fn compile(&self, source: &str, environment: &Environment) -> Result<Rc<Program>, CompileError>;

    fn evaluate(&self, program: &Program, environment: &Environment) -> Result<Outcome, EvalError>;

    fn run(&self, source: &str, environment: &Environment) -> Result<Outcome, FormulaError> {
        let program = self.compile(source, environment)?;
        Ok(self.evaluate(&program, environment)?)
    }
}

type Parsed = Result<Rc<Vec<Spanned<Stmt>>>, CompileError>;

/// The built-in evaluator: parses with a cache keyed by source text and runs
/// programs on the tree-walking interpreter.
pub struct FormulaEngine {
    limits: Limits,
    globals: Scope,
    cache: RefCell<HashMap<Rc<str>, Parsed>>,
}

impl Default for FormulaEngine {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl fmt::Debug for FormulaEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormulaEngine")
            .field("limits", &self.limits)
            .field("cached", &self.cache.borrow().len())
            .finish()
    }
}

impl FormulaEngine {
    pub fn new(limits: Limits) -> Self {
        let globals = Scope::root();
        builtins::install_globals(&globals);
        Self {
            limits,
            globals,
            cache: RefCell::default(),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn is_global(name: &str) -> bool {
        GLOBAL_NAMES.contains(&name)
    }

    fn parse_cached(&self, source: &str) -> Parsed {
        if let Some(parsed) = self.cache.borrow().get(source) {
            return parsed.clone();
        }
        let parsed = parse(source).map(Rc::new).map_err(CompileError::new);
        let mut cache = self.cache.borrow_mut();
        if cache.len() >= PARSE_CACHE_CAPACITY {
            log::debug!("formula parse cache full, clearing {} entries", cache.len());
            cache.clear();
        }
        cache.insert(Rc::from(source), parsed.clone());
        parsed
    }
}

impl FormulaEvaluator for FormulaEngine {
    fn compile(&self, source: &str, environment: &Environment) -> Result<Rc<Program>, CompileError> {
        let body = self.parse_cached(source)?;
        resolve(&body, |name| {
            name == MODULE || environment.contains(name) || Self::is_global(name)
        })
        .map_err(CompileError::new)?;
        Ok(Rc::new(Program {
            source: Rc::from(source),
            body,
        }))
    }

    fn evaluate(&self, program: &Program, environment: &Environment) -> Result<Outcome, EvalError> {
        let scope = self.globals.child();
        for (name, value) in environment.iter() {
            scope.declare_const(name.clone(), value.clone());
        }
        let exports = Value::empty_object();
        let module = Value::object([("exports", exports.clone())]);
        scope.declare_const(MODULE, module.clone());

        Interpreter::new(self.limits).run(&program.body, &scope.child())?;

        let current = module.field("exports").unwrap_or_default();
        let untouched = current.strict_equals(&exports)
            && matches!(&current, Value::Object(map) if map.borrow().is_empty());
        Ok(Outcome {
            exports: current,
            untouched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_names_are_visible_and_constant() {
        let engine = FormulaEngine::default();
        let environment = Environment::new().with("price", 4).with("quantity", 3);
        let outcome = engine
            .run("module.exports = price * quantity", &environment)
            .unwrap();
        assert_eq!(outcome.exports, Value::from(12));
        assert!(!outcome.untouched);

        let error = engine.run("price = 1", &environment).unwrap_err();
        assert!(matches!(error, FormulaError::Eval(EvalError::Type(_))), "{error}");
    }

    #[test]
    fn unknown_names_fail_to_compile() {
        let engine = FormulaEngine::default();
        let error = engine
            .compile("module.exports = secret", &Environment::new())
            .unwrap_err();
        assert_eq!(error.to_string(), "`secret` is not defined");
    }

    #[test]
    fn untouched_exports_are_detected() {
        let engine = FormulaEngine::default();
        let environment = Environment::new();
        assert!(engine.run("const x = 1", &environment).unwrap().untouched);
        assert!(!engine.run("module.exports.a = 1", &environment).unwrap().untouched);
        assert!(!engine.run("module.exports = {}", &environment).unwrap().untouched);
    }

    #[test]
    fn parse_results_are_cached_per_source() {
        let engine = FormulaEngine::default();
        let first = engine.compile("module.exports = 1", &Environment::new()).unwrap();
        let second = engine.compile("module.exports = 1", &Environment::new()).unwrap();
        assert!(Rc::ptr_eq(&first.body, &second.body));
        assert_eq!(engine.cache.borrow().len(), 1);
    }

    #[test]
    fn syntax_errors_are_compile_errors() {
        let engine = FormulaEngine::default();
        let error = engine.run("module.exports = (", &Environment::new()).unwrap_err();
        assert!(matches!(error, FormulaError::Compile(_)), "{error}");
    }
}
