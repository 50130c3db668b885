//! Binds a container's property formulas to reactive prop values.
//!
//! Every property gets one [`Effect`]. Each run evaluates the formula, checks
//! the result against the element's declared schema and publishes it into the
//! property's [`State`]. Functions are published wrapped, so a callback that
//! throws later is reported as `property.invocation` instead of escaping into
//! whoever invoked it.

use crate::context::{EngineContext, FormulaKind};
use crate::elements::ElementSpec;
use crate::formula::{Environment, EvalError, Function, Program, Signal, Value};
use crate::ledger::ErrorCategory;
use crate::reactive::{Computed, Effect, State};
use crate::schema::Schema;
use crate::scope::Scopes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use trellis_model::{Container, Id};

/// Which signals a property effect depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindingMode {
    /// Re-run whenever any variable visible to the container changes.
    #[default]
    WholeScope,
    /// Re-run only when a signal the formula actually read changes.
    FineGrained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyState {
    Uncompiled,
    Compiled,
    Valid,
    /// The last run failed; the category says how.
    Invalid(ErrorCategory),
    Disposed,
}

struct PropertyBinding {
    value: State<Value>,
    state: Rc<Cell<PropertyState>>,
    effect: Effect,
}

/// The live props of one container.
pub struct ContainerBinding {
    container: Id,
    kind: String,
    props: IndexMap<String, PropertyBinding>,
    context: Rc<EngineContext>,
}

impl fmt::Debug for ContainerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerBinding")
            .field("container", &self.container)
            .field("kind", &self.kind)
            .field("props", &self.props.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ContainerBinding {
    pub fn container(&self) -> &Id {
        &self.container
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Tracked read of one prop.
    pub fn prop(&self, name: &str) -> Option<Value> {
        self.props.get(name).map(|binding| binding.value.get())
    }

    pub fn signal(&self, name: &str) -> Option<&State<Value>> {
        self.props.get(name).map(|binding| &binding.value)
    }

    pub fn state(&self, name: &str) -> Option<PropertyState> {
        self.props.get(name).map(|binding| binding.state.get())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.props.keys().map(String::as_str)
    }

    /// Every prop's current value, untracked.
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.props
            .iter()
            .map(|(name, binding)| (name.clone(), binding.value.get_untracked()))
            .collect()
    }

    /// Calls a callback prop the way a rendered component would. Failures
    /// inside the callback are already recorded by the wrapper.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        match self.props.get(name).map(|binding| binding.value.get_untracked()) {
            Some(Value::Function(function)) => function.call(args),
            Some(other) => Err(EvalError::type_error(format!(
                "{}.{name} is {}, not a function",
                self.container,
                other.type_of()
            ))),
            None => Err(EvalError::type_error(format!(
                "{} has no property `{name}`",
                self.container
            ))),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.props.values().all(|binding| binding.effect.is_disposed())
    }

    /// Stops every property effect and forgets the container's errors.
    pub fn dispose(&self) {
        for binding in self.props.values() {
            binding.effect.dispose();
            binding.state.set(PropertyState::Disposed);
        }
        self.context.ledger.clear_container(&self.container);
    }
}

/// Binds every property of `container`. `form_context` is the state of the
/// closest enclosing form, exposed to formulas as `formContext`.
pub fn bind(
    context: &Rc<EngineContext>,
    container: &Container,
    scopes: &Computed<Scopes>,
    element: &ElementSpec,
    form_context: Option<&State<Value>>,
    mode: BindingMode,
) -> ContainerBinding {
    let props = container
        .properties
        .iter()
        .map(|(name, property)| {
            let value = State::new(&context.runtime, Value::Undefined);
            let state = Rc::new(Cell::new(PropertyState::Uncompiled));
            let effect = Effect::new(
                &context.runtime,
                PropertyRun {
                    context: context.clone(),
                    container: container.id.clone(),
                    name: name.clone(),
                    formula: property.formula.clone(),
                    schema: element.properties.get(name).cloned(),
                    form_context: form_context.cloned(),
                    mode,
                    scopes: scopes.clone(),
                    value: value.clone(),
                    state: state.clone(),
                    compiled: None,
                }
                .into_closure(),
            );
            (name.clone(), PropertyBinding { value, state, effect })
        })
        .collect();
    log::debug!(
        "bound {} ({}) with {} properties",
        container.id,
        container.kind,
        container.properties.len()
    );
    ContainerBinding {
        container: container.id.clone(),
        kind: container.kind.clone(),
        props,
        context: context.clone(),
    }
}

struct Compiled {
    scopes: Scopes,
    program: Result<(Rc<Program>, Environment), String>,
}

struct PropertyRun {
    context: Rc<EngineContext>,
    container: Id,
    name: String,
    formula: String,
    schema: Option<Rc<Schema>>,
    form_context: Option<State<Value>>,
    mode: BindingMode,
    scopes: Computed<Scopes>,
    value: State<Value>,
    state: Rc<Cell<PropertyState>>,
    compiled: Option<Compiled>,
}

impl PropertyRun {
    fn into_closure(mut self) -> impl FnMut() + 'static {
        move || self.run()
    }

    fn record(&self, category: ErrorCategory, message: impl Into<String>) {
        self.context
            .ledger
            .property(&self.container, &self.name, category, message);
    }

    fn compile(&mut self, scopes: Scopes) {
        let reusable = self
            .compiled
            .as_ref()
            .is_some_and(|compiled| compiled.scopes.ptr_eq(&scopes));
        if reusable {
            return;
        }
        let mut environment = self.context.environment(FormulaKind::Property, &scopes.view());
        if let Some(form_context) = &self.form_context {
            environment.insert("formContext", Signal::State(form_context.clone()));
        }
        let program = self
            .context
            .evaluator
            .compile(&self.formula, &environment)
            .map(|program| (program, environment))
            .map_err(|error| error.to_string());
        self.compiled = Some(Compiled { scopes, program });
    }

    fn run(&mut self) {
        let Some(scopes) = self.scopes.try_get() else {
            return;
        };
        if self.mode == BindingMode::WholeScope {
            for signal in scopes.current().vars().values() {
                signal.get();
            }
        }
        self.compile(scopes);
        let program = match self.compiled.as_ref().map(|compiled| &compiled.program) {
            Some(Ok(program)) => program.clone(),
            Some(Err(message)) => {
                self.record(ErrorCategory::Value, message.as_str());
                self.state.set(PropertyState::Invalid(ErrorCategory::Value));
                return;
            }
            None => return,
        };
        if self.state.get() == PropertyState::Uncompiled {
            self.state.set(PropertyState::Compiled);
        }
        let (program, environment) = program;
        let outcome = match self.context.evaluator.evaluate(&program, &environment) {
            Ok(outcome) => outcome,
            Err(error) => {
                // The previous value stays published.
                self.record(ErrorCategory::Value, error.to_string());
                self.state.set(PropertyState::Invalid(ErrorCategory::Value));
                return;
            }
        };
        self.record(ErrorCategory::Value, "");

        let value = if outcome.untouched {
            self.record(ErrorCategory::Validation, "");
            self.state.set(PropertyState::Valid);
            Value::Undefined
        } else {
            let problem = match &self.schema {
                Some(schema) => schema.parse(&outcome.exports).err().map(|error| error.message()),
                None => None,
            };
            match problem {
                Some(message) => {
                    self.record(ErrorCategory::Validation, message);
                    self.state.set(PropertyState::Invalid(ErrorCategory::Validation));
                }
                None => {
                    self.record(ErrorCategory::Validation, "");
                    self.state.set(PropertyState::Valid);
                }
            }
            outcome.exports
        };
        let value = match value {
            Value::Function(function) => Value::Function(self.guard(function)),
            value => value,
        };
        self.value.set(value);
    }

    /// Wraps a callback so that whatever it throws (or whatever its promise
    /// rejects with) lands in the ledger as `property.invocation`.
    fn guard(&self, function: Function) -> Function {
        let context = self.context.clone();
        let container = self.container.clone();
        let name = self.name.clone();
        let state = self.state.clone();
        let label = function.name().to_owned();
        Function::native(label, move |interpreter, args| {
            let report = {
                let (context, container, name, state) =
                    (context.clone(), container.clone(), name.clone(), state.clone());
                move |message: String| {
                    log::debug!("{container}.{name} failed when invoked: {message}");
                    context
                        .ledger
                        .property(&container, &name, ErrorCategory::Invocation, message);
                    state.set(PropertyState::Invalid(ErrorCategory::Invocation));
                }
            };
            match interpreter.call_function(&function, args) {
                Ok(Value::Promise(promise)) => {
                    let on_rejected = Function::native("onRejected", move |_, reasons| {
                        let reason = reasons.first().cloned().unwrap_or_default();
                        report(EvalError::Thrown(reason).to_string());
                        Ok(Value::Undefined)
                    });
                    let _handled = promise.catch(Some(on_rejected));
                    Ok(Value::Promise(promise))
                }
                Ok(value) => {
                    context
                        .ledger
                        .property(&container, &name, ErrorCategory::Invocation, "");
                    Ok(value)
                }
                Err(error) => {
                    report(error.to_string());
                    Ok(Value::Undefined)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::scope::{Level, ScopeInputs, compose};
    use crate::services::{RecordingTransport, Services};
    use crate::variables::instantiate;
    use futures::executor::LocalPool;
    use trellis_model::Variable;

    struct Fixture {
        _pool: LocalPool,
        context: Rc<EngineContext>,
        scopes: Computed<Scopes>,
    }

    fn fixture(variables: Vec<Variable>) -> Fixture {
        let pool = LocalPool::new();
        let services = Services::in_memory(
            &[],
            Rc::new(RecordingTransport::new()),
            Rc::new(pool.spawner()),
        );
        let context = EngineContext::new(services, EngineConfig::default());
        let variables = Rc::new(variables);
        let instantiation = Rc::new(instantiate(&context, variables.clone(), None, Rc::default()));
        let app = compose(
            &context,
            Level::App,
            instantiation,
            ScopeInputs {
                variables,
                ..ScopeInputs::default()
            },
            None,
        );
        let scopes = Scopes { app, page: None };
        let scopes = Computed::new(&context.runtime, move || scopes.clone());
        Fixture {
            _pool: pool,
            context,
            scopes,
        }
    }

    fn element(properties: &[(&str, Schema)]) -> ElementSpec {
        ElementSpec {
            properties: properties
                .iter()
                .map(|(name, schema)| (name.to_string(), Rc::new(schema.clone())))
                .collect(),
            form: false,
        }
    }

    fn var(fixture: &Fixture, name: &str) -> Signal {
        fixture.scopes.get_untracked().unwrap().app.var(name).cloned().unwrap()
    }

    #[test]
    fn props_follow_their_variables() {
        let fixture = fixture(vec![Variable::state("v1", "count", "module.exports = 1")]);
        let container = Container::new("c1", "Text")
            .with_property("text", "module.exports = `Count: ${count.get()}`");
        let binding = bind(
            &fixture.context,
            &container,
            &fixture.scopes,
            &element(&[("text", Schema::string())]),
            None,
            BindingMode::WholeScope,
        );
        assert_eq!(binding.prop("text"), Some(Value::from("Count: 1")));
        assert_eq!(binding.state("text"), Some(PropertyState::Valid));
        var(&fixture, "count").set(Value::from(2)).unwrap();
        assert_eq!(binding.prop("text"), Some(Value::from("Count: 2")));
    }

    #[test]
    fn failures_keep_the_previous_value() {
        let fixture = fixture(vec![Variable::state("v1", "n", "module.exports = 1")]);
        let container = Container::new("c1", "Text")
            .with_property("text", "if (n.get() > 1) throw new Error('too big'); module.exports = String(n.get())")
            .with_property("label", "module.exports = undefinedThing");
        let binding = bind(
            &fixture.context,
            &container,
            &fixture.scopes,
            &ElementSpec::default(),
            None,
            BindingMode::WholeScope,
        );
        var(&fixture, "n").set(Value::from(2)).unwrap();
        assert_eq!(binding.prop("text"), Some(Value::from("1")));
        assert_eq!(binding.state("text"), Some(PropertyState::Invalid(ErrorCategory::Value)));
        assert_eq!(binding.prop("label"), Some(Value::Undefined));

        let errors = fixture.context.ledger.errors_untracked();
        let messages: Vec<_> = errors.iter().map(|entry| entry.message.as_str()).collect();
        assert_eq!(messages, ["`undefinedThing` is not defined", "Error: too big"]);

        binding.dispose();
        assert!(binding.is_disposed());
        assert!(fixture.context.ledger.is_empty());
        assert_eq!(binding.state("text"), Some(PropertyState::Disposed));
    }

    #[test]
    fn schema_mismatches_are_validation_errors() {
        let fixture = fixture(vec![]);
        let container = Container::new("c1", "Button")
            .with_property("label", "module.exports = 42")
            .with_property("disabled", "const unused = 1");
        let binding = bind(
            &fixture.context,
            &container,
            &fixture.scopes,
            &element(&[("label", Schema::string()), ("disabled", Schema::boolean())]),
            None,
            BindingMode::WholeScope,
        );
        assert_eq!(
            binding.state("label"),
            Some(PropertyState::Invalid(ErrorCategory::Validation))
        );
        assert_eq!(binding.state("disabled"), Some(PropertyState::Valid));
        assert_eq!(binding.prop("disabled"), Some(Value::Undefined));
        let errors = fixture.context.ledger.errors_untracked();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "invalid_type value is Expected string, received number");
    }

    #[test]
    fn throwing_callbacks_are_reported_not_propagated() {
        let fixture = fixture(vec![Variable::state("v1", "clicks", "module.exports = 0")]);
        let container = Container::new("c1", "Button").with_property(
            "onClick",
            "module.exports = (by) => {
                 if (by < 0) throw new Error('negative');
                 clicks.set(clicks.get() + by)
             }",
        );
        let binding = bind(
            &fixture.context,
            &container,
            &fixture.scopes,
            &element(&[("onClick", Schema::function())]),
            None,
            BindingMode::WholeScope,
        );
        binding.invoke("onClick", &[Value::from(2)]).unwrap();
        assert_eq!(var(&fixture, "clicks").get_untracked(), Value::from(2));

        assert_eq!(binding.invoke("onClick", &[Value::from(-1)]).unwrap(), Value::Undefined);
        assert_eq!(
            binding.state("onClick"),
            Some(PropertyState::Invalid(ErrorCategory::Invocation))
        );
        let errors = fixture.context.ledger.errors_untracked();
        assert_eq!(errors[0].category, ErrorCategory::Invocation);
        assert_eq!(errors[0].message, "Error: negative");

        binding.invoke("onClick", &[Value::from(1)]).unwrap();
        assert!(fixture.context.ledger.is_empty());
    }

    #[test]
    fn rejected_promises_from_callbacks_are_reported() {
        let fixture = fixture(vec![]);
        let container = Container::new("c1", "Button")
            .with_property("onClick", "module.exports = () => Promise.reject(new Error('offline'))");
        let binding = bind(
            &fixture.context,
            &container,
            &fixture.scopes,
            &ElementSpec::default(),
            None,
            BindingMode::WholeScope,
        );
        binding.invoke("onClick", &[]).unwrap();
        let errors = fixture.context.ledger.errors_untracked();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Error: offline");
    }

    #[test]
    fn fine_grained_mode_only_tracks_what_was_read() {
        let fixture = fixture(vec![
            Variable::state("v1", "shown", "module.exports = 'a'"),
            Variable::state("v2", "other", "module.exports = 0"),
        ]);
        let container = Container::new("c1", "Text")
            .with_property("text", "module.exports = shown.get()");
        let bindings = [BindingMode::WholeScope, BindingMode::FineGrained].map(|mode| {
            bind(
                &fixture.context,
                &container,
                &fixture.scopes,
                &ElementSpec::default(),
                None,
                mode,
            )
        });
        let runs = bindings.each_ref().map(|binding| {
            let signal = binding.signal("text").unwrap().clone();
            let runs = Rc::new(Cell::new(0));
            let effect = Effect::new(&fixture.context.runtime, {
                let runs = runs.clone();
                move || {
                    signal.get();
                    runs.set(runs.get() + 1);
                }
            });
            (runs, effect)
        });
        var(&fixture, "other").set(Value::from(1)).unwrap();
        assert_eq!(runs[0].0.get(), 2);
        assert_eq!(runs[1].0.get(), 1);
    }

    #[test]
    fn form_context_is_only_visible_inside_forms() {
        let fixture = fixture(vec![]);
        let form = State::new(&fixture.context.runtime, Value::object([("email", Value::from("a@b.c"))]));
        let container = Container::new("c1", "Input")
            .with_property("value", "module.exports = formContext.get().email");
        let inside = bind(
            &fixture.context,
            &container,
            &fixture.scopes,
            &ElementSpec::default(),
            Some(&form),
            BindingMode::WholeScope,
        );
        assert_eq!(inside.prop("value"), Some(Value::from("a@b.c")));
        let outside = bind(
            &fixture.context,
            &container,
            &fixture.scopes,
            &ElementSpec::default(),
            None,
            BindingMode::WholeScope,
        );
        assert_eq!(outside.state("value"), Some(PropertyState::Invalid(ErrorCategory::Value)));
    }
}
