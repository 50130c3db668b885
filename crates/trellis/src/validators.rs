//! Variable validators compiled from `schemaCode`.

use crate::context::EngineContext;
use crate::formula::{Environment, FormulaEvaluator, Value};
use crate::ledger::{ErrorCategory, ErrorLedger};
use crate::schema::{Schema, z};
use crate::variables::VariableInstance;
use indexmap::IndexMap;
use std::rc::Rc;
use trellis_model::{Id, Variable, VariableKind};

/// Compiles schema code with only `z` in scope. Code that never mentions
/// `module.exports` is taken as an expression.
pub fn compile_schema(evaluator: &dyn FormulaEvaluator, code: &str) -> Result<Rc<Schema>, String> {
    let source = if code.contains("module.exports") {
        code.to_owned()
    } else {
        format!("module.exports = ({})", code.trim().trim_end_matches(';'))
    };
    let environment = Environment::new().with("z", z());
    let outcome = evaluator
        .run(&source, &environment)
        .map_err(|error| error.to_string())?;
    match outcome.exports {
        Value::Schema(schema) => Ok(schema),
        other => Err(format!(
            "schema code must export a schema, received {}",
            other.type_of()
        )),
    }
}

#[derive(Debug, Default)]
pub struct Validators {
    schemas: Vec<(Id, Rc<Schema>)>,
    errors: IndexMap<Id, String>,
}

impl Validators {
    pub fn schemas(&self) -> &[(Id, Rc<Schema>)] {
        &self.schemas
    }

    pub fn get(&self, id: &Id) -> Option<&Rc<Schema>> {
        self.schemas
            .iter()
            .find_map(|(variable, schema)| (variable == id).then_some(schema))
    }

    /// `schemaCode` failures, by variable id.
    pub fn errors(&self) -> &IndexMap<Id, String> {
        &self.errors
    }
}

/// One validator per non-effect variable with schema code. A variable whose
/// schema fails to compile stays unvalidated.
pub fn compile_validators(context: &EngineContext, variables: &[Variable]) -> Validators {
    let mut validators = Validators::default();
    for variable in variables {
        if variable.kind == VariableKind::Effect || variable.schema_code.trim().is_empty() {
            continue;
        }
        match compile_schema(context.evaluator.as_ref(), &variable.schema_code) {
            Ok(schema) => validators.schemas.push((variable.id.clone(), schema)),
            Err(message) => {
                log::debug!("schema of variable {} does not compile: {message}", variable.id);
                validators.errors.insert(variable.id.clone(), message);
            }
        }
    }
    validators
}

/// Checks the current value of every validated instance. Reads are tracked,
/// so calling this from an effect re-validates on every change.
pub fn validate(ledger: &ErrorLedger, instances: &[VariableInstance], validators: &Validators) {
    for (id, schema) in &validators.schemas {
        let Some(instance) = instances.iter().find(|instance| &instance.id == id) else {
            continue;
        };
        let message = match schema.parse(&instance.signal.get()) {
            Ok(_) => String::new(),
            Err(error) => error.message(),
        };
        ledger.variable(id, ErrorCategory::Validation, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::formula::{FormulaEngine, Signal};
    use crate::formula::ast::Name;
    use crate::reactive::State;
    use crate::services::{RecordingTransport, Services};
    use futures::executor::LocalPool;

    #[test]
    fn expressions_and_modules_both_compile() {
        let engine = FormulaEngine::default();
        let schema = compile_schema(&engine, "z.number().min(0);").unwrap();
        assert!(schema.is_valid(&Value::from(3)));
        let schema = compile_schema(&engine, "module.exports = z.string()").unwrap();
        assert!(!schema.is_valid(&Value::from(3)));
        assert_eq!(
            compile_schema(&engine, "42").unwrap_err(),
            "schema code must export a schema, received number"
        );
        assert_eq!(
            compile_schema(&engine, "count.get()").unwrap_err(),
            "`count` is not defined"
        );
    }

    #[test]
    fn failures_are_recorded_and_cleared() {
        let pool = LocalPool::new();
        let services = Services::in_memory(
            &[],
            Rc::new(RecordingTransport::new()),
            Rc::new(pool.spawner()),
        );
        let context = EngineContext::new(services, EngineConfig::default());
        let variables = vec![
            Variable::state("v1", "age", "").with_schema("z.number().int()"),
            Variable::state("v2", "name", "").with_schema("z.nope()"),
            Variable::effect("v3", "log", "").with_schema("z.string()"),
        ];
        let validators = compile_validators(&context, &variables);
        assert_eq!(validators.schemas().len(), 1);
        assert!(validators.errors().contains_key(&Id::from("v2")));

        let age = State::new(&context.runtime, Value::from(1.5));
        let instances = vec![VariableInstance {
            id: Id::from("v1"),
            name: Name::from("age"),
            signal: Signal::State(age.clone()),
        }];
        validate(&context.ledger, &instances, &validators);
        let errors = context.ledger.errors_untracked();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::Validation);
        assert_eq!(errors[0].message, "invalid_type value is Expected integer, received float");

        age.set(Value::from(2));
        validate(&context.ledger, &instances, &validators);
        assert!(context.ledger.is_empty());
    }
}
