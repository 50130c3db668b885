//! The reactive pipeline of one level (the application or the open page):
//! document collections in, an instantiated and composed scope out.
//!
//! ```text
//! variables ─┬─> instantiation ─┐
//! initial ───┘                  ├─> scope ──> keeper effect (schema errors,
//! queries, fetchers, callables ─┘             validation)
//! variables ──> validators ──────────────────┘
//! ```
//!
//! Instantiation and scope are memoized: when nothing they read changed in
//! value, they hand back the very same `Rc`.

use crate::context::{EngineContext, InitialValues};
use crate::ledger::ErrorCategory;
use crate::reactive::{Computed, Effect, State};
use crate::scope::{FormulaScope, Level, ScopeInputs, compose};
use crate::validators::{Validators, compile_validators, validate};
use crate::variables::{Instantiation, instantiate};
use indexmap::IndexSet;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use trellis_model::{Callable, Fetcher, Id, Query, Variable};

/// The editable collections of one level. Every setter replaces the whole
/// collection.
#[derive(Clone)]
pub struct LevelInputs {
    pub variables: State<Rc<Vec<Variable>>>,
    pub queries: State<Rc<Vec<Query>>>,
    pub fetchers: State<Rc<Vec<Fetcher>>>,
    pub callables: State<Rc<Vec<Callable>>>,
    pub initial_values: State<Rc<InitialValues>>,
}

impl LevelInputs {
    pub fn new(context: &EngineContext, inputs: ScopeInputs, initial_values: InitialValues) -> Self {
        let runtime = &context.runtime;
        Self {
            variables: State::new(runtime, inputs.variables),
            queries: State::new(runtime, inputs.queries),
            fetchers: State::new(runtime, inputs.fetchers),
            callables: State::new(runtime, inputs.callables),
            initial_values: State::new(runtime, Rc::new(initial_values)),
        }
    }

    fn read(&self) -> ScopeInputs {
        ScopeInputs {
            variables: self.variables.get(),
            queries: self.queries.get(),
            fetchers: self.fetchers.get(),
            callables: self.callables.get(),
        }
    }
}

pub struct LevelGraph {
    level: Level,
    context: Rc<EngineContext>,
    inputs: LevelInputs,
    instantiation: Computed<Rc<Instantiation>>,
    scope: Computed<Rc<FormulaScope>>,
    keeper: Effect,
    reported: Rc<RefCell<IndexSet<Id>>>,
}

impl fmt::Debug for LevelGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelGraph")
            .field("level", &self.level)
            .field("scope", &self.scope.id())
            .finish_non_exhaustive()
    }
}

impl LevelGraph {
    /// Wires the level up and composes it once. A page passes the app
    /// level's scope as `parent`.
    pub fn new(
        context: &Rc<EngineContext>,
        level: Level,
        inputs: LevelInputs,
        parent: Option<Computed<Rc<FormulaScope>>>,
    ) -> Self {
        let runtime = &context.runtime;
        let instantiation = Computed::with_previous(runtime, {
            let context = context.clone();
            let inputs = inputs.clone();
            let parent = parent.clone();
            move |previous: Option<&Rc<Instantiation>>| {
                let variables = inputs.variables.get();
                let initial_values = inputs.initial_values.get();
                let parent = parent.as_ref().map(Computed::get);
                if let Some(previous) = previous {
                    if previous.is_for(&variables, parent.as_ref(), &initial_values) {
                        return previous.clone();
                    }
                    // Old effects stop before the new ones start.
                    previous.dispose();
                }
                let instantiation = context
                    .runtime
                    .untracked(|| instantiate(&context, variables, parent, initial_values));
                Rc::new(instantiation)
            }
        });
        let validators = Computed::new(runtime, {
            let context = context.clone();
            let variables = inputs.variables.clone();
            move || Rc::new(compile_validators(&context, &variables.get()))
        });
        let scope = Computed::with_previous(runtime, {
            let context = context.clone();
            let inputs = inputs.clone();
            let instantiation = instantiation.clone();
            move |previous: Option<&Rc<FormulaScope>>| {
                let instantiation = instantiation.get();
                let read = inputs.read();
                let parent = parent.as_ref().map(Computed::get);
                if let Some(previous) = previous {
                    if previous.is_for(&instantiation, &read, parent.as_ref()) {
                        return previous.clone();
                    }
                }
                context
                    .runtime
                    .untracked(|| compose(&context, level, instantiation, read, parent))
            }
        });
        let reported = Rc::new(RefCell::new(IndexSet::new()));
        let keeper = Effect::new(runtime, {
            let context = context.clone();
            let scope = scope.clone();
            let reported = reported.clone();
            move || {
                let scope = scope.get();
                let validators = validators.get();
                report_schema_errors(&context, &scope, &validators, &mut reported.borrow_mut());
                validate(&context.ledger, scope.instantiation().instances(), &validators);
            }
        });
        Self {
            level,
            context: context.clone(),
            inputs,
            instantiation,
            scope,
            keeper,
            reported,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn inputs(&self) -> &LevelInputs {
        &self.inputs
    }

    pub fn scope_signal(&self) -> &Computed<Rc<FormulaScope>> {
        &self.scope
    }

    /// Untracked read of the composed scope.
    pub fn scope(&self) -> Rc<FormulaScope> {
        self.scope.get_untracked().unwrap_or_default()
    }

    /// Stops the level's effects and drops its variable errors.
    pub fn dispose(&self) {
        self.keeper.dispose();
        if let Some(instantiation) = self.instantiation.get_untracked() {
            instantiation.dispose();
        }
        let variables = self.inputs.variables.get_untracked();
        let reported = std::mem::take(&mut *self.reported.borrow_mut());
        for id in variables.iter().map(|variable| &variable.id).chain(reported.iter()) {
            self.context.ledger.clear_variable(id);
        }
        log::debug!("disposed {} level", self.level);
    }
}

/// One `variable.schema` entry per variable, combining `functionCode` and
/// `schemaCode` failures. Entries of variables that went away are cleared.
fn report_schema_errors(
    context: &EngineContext,
    scope: &FormulaScope,
    validators: &Validators,
    reported: &mut IndexSet<Id>,
) {
    let compile_errors = scope.instantiation().compile_errors();
    let mut current = IndexSet::new();
    for variable in scope.inputs().variables.iter() {
        let message = [
            compile_errors.get(&variable.id),
            validators.errors().get(&variable.id),
        ]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
        context
            .ledger
            .variable(&variable.id, ErrorCategory::Schema, message);
        current.insert(variable.id.clone());
    }
    for gone in reported.difference(&current) {
        context.ledger.clear_variable(gone);
    }
    *reported = current;
}
