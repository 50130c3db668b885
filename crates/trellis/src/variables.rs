//! Turns declared variables into live signals.
//!
//! Variables are processed in declaration order. Each one sees the app scope
//! (on a page) plus the same-level variables declared before it. Nothing a
//! formula does here escapes: compile problems are collected per variable
//! for the combined `variable.schema` report, evaluation failures go to the
//! ledger as `variable.value`.

use crate::context::{EngineContext, FormulaKind, InitialValues, ScopeView};
use crate::formula::ast::Name;
use crate::formula::{Signal, Value};
use crate::ledger::ErrorCategory;
use crate::reactive::{Computed, Effect, State};
use crate::scope::{FormulaScope, level_value};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use trellis_model::{Id, Variable, VariableKind};

/// A live signal standing for one declared variable.
#[derive(Clone)]
pub struct VariableInstance {
    pub id: Id,
    pub name: Name,
    pub signal: Signal,
}

impl fmt::Debug for VariableInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("signal", &self.signal.id())
            .finish()
    }
}

/// Everything [`instantiate`] produced for one level. Dropping it (or
/// calling [`Instantiation::dispose`]) stops the `effect` variables.
#[derive(Default)]
pub struct Instantiation {
    instances: Vec<VariableInstance>,
    effects: RefCell<Vec<Effect>>,
    compile_errors: IndexMap<Id, String>,
    variables: Rc<Vec<Variable>>,
    parent: Option<Rc<FormulaScope>>,
    initial_values: Rc<InitialValues>,
}

impl fmt::Debug for Instantiation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instantiation")
            .field("instances", &self.instances)
            .field("effects", &self.effects.borrow().len())
            .field("compile_errors", &self.compile_errors)
            .finish()
    }
}

impl Instantiation {
    pub fn instances(&self) -> &[VariableInstance] {
        &self.instances
    }

    pub fn instance(&self, id: &Id) -> Option<&VariableInstance> {
        self.instances.iter().find(|instance| &instance.id == id)
    }

    pub fn effect_count(&self) -> usize {
        self.effects.borrow().len()
    }

    /// `functionCode` compile failures, by variable id.
    pub fn compile_errors(&self) -> &IndexMap<Id, String> {
        &self.compile_errors
    }

    pub fn dispose(&self) {
        for effect in self.effects.borrow_mut().drain(..) {
            effect.dispose();
        }
    }

    /// Whether instantiating these inputs again would produce the same thing.
    pub fn is_for(
        &self,
        variables: &Rc<Vec<Variable>>,
        parent: Option<&Rc<FormulaScope>>,
        initial_values: &Rc<InitialValues>,
    ) -> bool {
        let same_parent = match (&self.parent, parent) {
            (None, None) => true,
            (Some(previous), Some(parent)) => Rc::ptr_eq(previous, parent),
            _ => false,
        };
        same_parent
            && (Rc::ptr_eq(&self.variables, variables) || self.variables == *variables)
            && (Rc::ptr_eq(&self.initial_values, initial_values)
                || self.initial_values == *initial_values)
    }
}

impl Drop for Instantiation {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The view a variable's formula gets: the parent scope plus `declared`.
fn view(parent: Option<&Rc<FormulaScope>>, declared: &IndexMap<Name, Signal>) -> ScopeView {
    let own = level_value(declared, &IndexMap::new(), &IndexMap::new(), &IndexMap::new());
    match parent {
        None => ScopeView {
            app: own,
            page: None,
            vars: declared.clone(),
        },
        Some(app) => {
            let mut vars = app.vars().clone();
            for (name, signal) in declared {
                vars.insert(name.clone(), signal.clone());
            }
            ScopeView {
                app: app.value().clone(),
                page: Some(own),
                vars,
            }
        }
    }
}

/// Creates one instance per `state`/`computed` variable and one running
/// effect per `effect` variable. `parent` is the app scope when
/// instantiating a page, `None` at app level.
pub fn instantiate(
    context: &Rc<EngineContext>,
    variables: Rc<Vec<Variable>>,
    parent: Option<Rc<FormulaScope>>,
    initial_values: Rc<InitialValues>,
) -> Instantiation {
    let mut declared = IndexMap::new();
    let mut instances = Vec::new();
    let mut effects = Vec::new();
    let mut compile_errors = IndexMap::new();
    for variable in variables.iter() {
        let name = Name::from(variable.name.as_str());
        let signal = match variable.kind {
            VariableKind::State => {
                let seed = match initial_values.get(&name) {
                    Some(value) => {
                        context.ledger.variable(&variable.id, ErrorCategory::Value, "");
                        value.clone()
                    }
                    None => seed(context, variable, &mut compile_errors),
                };
                Signal::State(State::new(&context.runtime, seed))
            }
            VariableKind::Computed => {
                let view = view(parent.as_ref(), &declared);
                Signal::Computed(computed(context, variable, &view, &mut compile_errors))
            }
            VariableKind::Effect => {
                let view = view(parent.as_ref(), &declared);
                if let Some(effect) = effect(context, variable, &view, &mut compile_errors) {
                    effects.push(effect);
                }
                continue;
            }
        };
        declared.insert(name.clone(), signal.clone());
        instances.push(VariableInstance {
            id: variable.id.clone(),
            name,
            signal,
        });
    }
    log::debug!(
        "instantiated {} variables ({} effects) at {} level",
        instances.len(),
        effects.len(),
        if parent.is_some() { "page" } else { "app" }
    );
    Instantiation {
        instances,
        effects: RefCell::new(effects),
        compile_errors,
        variables,
        parent,
        initial_values,
    }
}

fn seed(
    context: &EngineContext,
    variable: &Variable,
    compile_errors: &mut IndexMap<Id, String>,
) -> Value {
    if variable.function_code.trim().is_empty() {
        return Value::Undefined;
    }
    let environment = context.environment(FormulaKind::State, &ScopeView::default());
    let program = match context.evaluator.compile(&variable.function_code, &environment) {
        Ok(program) => program,
        Err(error) => {
            compile_errors.insert(variable.id.clone(), error.to_string());
            return Value::Undefined;
        }
    };
    match context.evaluator.evaluate(&program, &environment) {
        Ok(outcome) => {
            context.ledger.variable(&variable.id, ErrorCategory::Value, "");
            outcome.exports
        }
        Err(error) => {
            context
                .ledger
                .variable(&variable.id, ErrorCategory::Value, error.to_string());
            Value::Undefined
        }
    }
}

fn computed(
    context: &Rc<EngineContext>,
    variable: &Variable,
    view: &ScopeView,
    compile_errors: &mut IndexMap<Id, String>,
) -> Computed<Value> {
    let environment = context.environment(FormulaKind::Computed, view);
    let program = match context.evaluator.compile(&variable.function_code, &environment) {
        Ok(program) => program,
        Err(error) => {
            compile_errors.insert(variable.id.clone(), error.to_string());
            return Computed::new(&context.runtime, || Value::Undefined);
        }
    };
    let runtime = context.runtime.clone();
    let context = context.clone();
    let id = variable.id.clone();
    // A failed recomputation keeps the last good value.
    Computed::with_previous(&runtime, move |previous: Option<&Value>| {
        match context.evaluator.evaluate(&program, &environment) {
            Ok(outcome) => {
                context.ledger.variable(&id, ErrorCategory::Value, "");
                outcome.exports
            }
            Err(error) => {
                log::debug!("computed variable {id} failed: {error}");
                context.ledger.variable(&id, ErrorCategory::Value, error.to_string());
                previous.cloned().unwrap_or_default()
            }
        }
    })
}

fn effect(
    context: &Rc<EngineContext>,
    variable: &Variable,
    view: &ScopeView,
    compile_errors: &mut IndexMap<Id, String>,
) -> Option<Effect> {
    let environment = context.environment(FormulaKind::Effect, view);
    let program = match context.evaluator.compile(&variable.function_code, &environment) {
        Ok(program) => program,
        Err(error) => {
            compile_errors.insert(variable.id.clone(), error.to_string());
            return None;
        }
    };
    let runtime = context.runtime.clone();
    let context = context.clone();
    let id = variable.id.clone();
    Some(Effect::new(&runtime, move || {
        let message = match context.evaluator.evaluate(&program, &environment) {
            Ok(_) => String::new(),
            Err(error) => error.to_string(),
        };
        context.ledger.variable(&id, ErrorCategory::Value, message);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::services::{RecordingTransport, Services};
    use futures::executor::LocalPool;

    fn context() -> Rc<EngineContext> {
        let pool = LocalPool::new();
        let services = Services::in_memory(
            &[],
            Rc::new(RecordingTransport::new()),
            Rc::new(pool.spawner()),
        );
        EngineContext::new(services, EngineConfig::default())
    }

    fn run(context: &Rc<EngineContext>, variables: Vec<Variable>) -> Instantiation {
        instantiate(context, Rc::new(variables), None, Rc::default())
    }

    #[test]
    fn initial_values_take_precedence_over_function_code() {
        let context = context();
        let variables = Rc::new(vec![Variable::state("v1", "x", "module.exports = 1")]);
        let seeded = instantiate(
            &context,
            variables.clone(),
            None,
            Rc::new(InitialValues::from_iter([(Name::from("x"), Value::from(5))])),
        );
        assert_eq!(seeded.instances()[0].signal.get_untracked(), Value::from(5));

        let computed = instantiate(&context, variables, None, Rc::default());
        assert_eq!(computed.instances()[0].signal.get_untracked(), Value::from(1));
    }

    #[test]
    fn computed_sees_earlier_variables_only() {
        let context = context();
        let instantiation = run(
            &context,
            vec![
                Variable::state("v1", "price", "module.exports = 3"),
                Variable::computed("v2", "total", "module.exports = price.get() * 2"),
                Variable::computed("v3", "early", "module.exports = later.get()"),
                Variable::state("v4", "later", "module.exports = 1"),
            ],
        );
        assert_eq!(instantiation.instances()[1].signal.get_untracked(), Value::from(6));
        assert_eq!(
            instantiation.compile_errors().get(&Id::from("v3")).map(String::as_str),
            Some("`later` is not defined")
        );
        assert_eq!(instantiation.instances()[2].signal.get_untracked(), Value::Undefined);
    }

    #[test]
    fn failing_state_code_is_logged_and_seeds_undefined() {
        let context = context();
        let instantiation = run(
            &context,
            vec![Variable::state("v1", "x", "module.exports = missing.call()")],
        );
        assert!(instantiation.compile_errors().contains_key(&Id::from("v1")));

        let instantiation = run(
            &context,
            vec![
                Variable::state("v1", "x", "throw new Error('nope')"),
                Variable::state("v2", "y", "module.exports = 2"),
            ],
        );
        assert_eq!(instantiation.instances()[0].signal.get_untracked(), Value::Undefined);
        assert_eq!(instantiation.instances()[1].signal.get_untracked(), Value::from(2));
        let errors = context.ledger.errors_untracked();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Error: nope");
    }

    #[test]
    fn failed_recomputation_keeps_the_previous_value() {
        let context = context();
        let instantiation = run(
            &context,
            vec![
                Variable::state("v1", "n", "module.exports = 1"),
                Variable::computed(
                    "v2",
                    "checked",
                    "if (n.get() < 0) throw new Error('negative'); module.exports = n.get()",
                ),
            ],
        );
        let (n, checked) = (
            instantiation.instances()[0].signal.clone(),
            instantiation.instances()[1].signal.clone(),
        );
        assert_eq!(checked.get_untracked(), Value::from(1));
        n.set(Value::from(-1)).unwrap();
        assert_eq!(checked.get_untracked(), Value::from(1));
        assert_eq!(context.ledger.len(), 1);
        n.set(Value::from(4)).unwrap();
        assert_eq!(checked.get_untracked(), Value::from(4));
        assert!(context.ledger.is_empty());
    }

    #[test]
    fn effects_rerun_until_disposed() {
        let context = context();
        let instantiation = run(
            &context,
            vec![
                Variable::state("v1", "n", "module.exports = 0"),
                Variable::state("v2", "log", "module.exports = []"),
                Variable::effect("v3", "logger", "log.get().push(n.get())"),
            ],
        );
        assert_eq!(instantiation.effect_count(), 1);
        let n = instantiation.instances()[0].signal.clone();
        let log = instantiation.instances()[1].signal.clone();
        n.set(Value::from(1)).unwrap();
        instantiation.dispose();
        n.set(Value::from(2)).unwrap();
        assert_eq!(log.get_untracked().to_json(), serde_json::json!([0, 1]));
    }

    #[test]
    fn identical_inputs_are_recognised() {
        let context = context();
        let variables = Rc::new(vec![Variable::state("v1", "x", "module.exports = 1")]);
        let initial = Rc::new(InitialValues::new());
        let instantiation = instantiate(&context, variables.clone(), None, initial.clone());
        assert!(instantiation.is_for(&Rc::new(variables.as_ref().clone()), None, &initial));
        let renamed = Rc::new(vec![Variable::state("v1", "y", "module.exports = 1")]);
        assert!(!instantiation.is_for(&renamed, None, &initial));
    }
}
