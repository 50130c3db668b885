//! The `z` handle formulas use to build schemas, and the members of schema
//! values (`z.string().min(2).parse(x)`).

use super::{Check, Schema, SchemaKind};
use crate::formula::builtins::{arg, iterate};
use crate::formula::{EvalError, Function, Interpreter, Value};
use std::rc::Rc;

type Modifier = fn(&mut Schema, &[Value]) -> Result<(), EvalError>;

fn native(
    name: &str,
    call: impl Fn(&mut Interpreter, &[Value]) -> Result<Value, EvalError> + 'static,
) -> Value {
    Value::Function(Function::native(name, call))
}

fn leaf(name: &'static str, kind: fn() -> SchemaKind) -> (&'static str, Value) {
    (
        name,
        native(name, move |_, _| Ok(Value::Schema(Rc::new(Schema::new(kind()))))),
    )
}

fn schema_arg(args: &[Value], index: usize, what: &str) -> Result<Rc<Schema>, EvalError> {
    match arg(args, index) {
        Value::Schema(schema) => Ok(schema),
        other => Err(EvalError::type_error(format!(
            "{what} expects a schema, received {}",
            other.type_of()
        ))),
    }
}

/// The schema builder object injected as `z`.
pub fn z() -> Value {
    let mut entries = vec![
        leaf("string", || SchemaKind::String),
        leaf("number", || SchemaKind::Number),
        leaf("boolean", || SchemaKind::Boolean),
        leaf("null", || SchemaKind::Null),
        leaf("undefined", || SchemaKind::Undefined),
        leaf("any", || SchemaKind::Any),
        leaf("unknown", || SchemaKind::Unknown),
        leaf("function", || SchemaKind::Function),
    ];
    entries.push((
        "array",
        native("array", |_, args| {
            let item = schema_arg(args, 0, "z.array")?;
            Ok(Value::Schema(Rc::new(Schema::new(SchemaKind::Array(item)))))
        }),
    ));
    entries.push((
        "object",
        native("object", |_, args| {
            let Value::Object(shape) = arg(args, 0) else {
                return Err(EvalError::type_error("z.object expects an object of schemas"));
            };
            let mut fields = indexmap::IndexMap::new();
            for (key, value) in shape.borrow().iter() {
                let Value::Schema(schema) = value else {
                    return Err(EvalError::type_error(format!(
                        "z.object: field `{key}` is not a schema"
                    )));
                };
                fields.insert(key.clone(), schema.clone());
            }
            Ok(Value::Schema(Rc::new(Schema::new(SchemaKind::Object(fields)))))
        }),
    ));
    entries.push((
        "record",
        native("record", |_, args| {
            // `z.record(keys, values)` validates values only.
            let index = if args.len() > 1 { 1 } else { 0 };
            let value = schema_arg(args, index, "z.record")?;
            Ok(Value::Schema(Rc::new(Schema::new(SchemaKind::Record(value)))))
        }),
    ));
    entries.push((
        "enum",
        native("enum", |_, args| {
            let options = iterate(&arg(args, 0))?
                .into_iter()
                .map(|option| match option {
                    Value::String(text) => Ok(text),
                    other => Err(EvalError::type_error(format!(
                        "z.enum options must be strings, received {}",
                        other.type_of()
                    ))),
                })
                .collect::<Result<_, _>>()?;
            Ok(Value::Schema(Rc::new(Schema::new(SchemaKind::Enum(options)))))
        }),
    ));
    entries.push((
        "literal",
        native("literal", |_, args| {
            Ok(Value::Schema(Rc::new(Schema::new(SchemaKind::Literal(arg(
                args, 0,
            ))))))
        }),
    ));
    entries.push((
        "union",
        native("union", |_, args| {
            let options = iterate(&arg(args, 0))?
                .into_iter()
                .map(|option| match option {
                    Value::Schema(schema) => Ok(schema),
                    other => Err(EvalError::type_error(format!(
                        "z.union options must be schemas, received {}",
                        other.type_of()
                    ))),
                })
                .collect::<Result<_, _>>()?;
            Ok(Value::Schema(Rc::new(Schema::new(SchemaKind::Union(options)))))
        }),
    ));
    Value::object(entries)
}

fn bound_number(args: &[Value], what: &str) -> Result<f64, EvalError> {
    match arg(args, 0) {
        Value::Number(number) if !number.is_nan() => Ok(number),
        other => Err(EvalError::type_error(format!(
            "{what} expects a number, received {}",
            other.type_of()
        ))),
    }
}

fn modifier(name: &str, schema: &Rc<Schema>, modify: Modifier) -> Value {
    let schema = schema.clone();
    native(name, move |_, args| {
        let mut next = Schema::clone(&schema);
        modify(&mut next, args)?;
        Ok(Value::Schema(Rc::new(next)))
    })
}

/// Members of a schema value, or `None` for unknown keys.
pub(crate) fn member(schema: &Rc<Schema>, key: &str) -> Option<Value> {
    let value = match key {
        "optional" => modifier(key, schema, |schema, _| {
            schema.optional = true;
            Ok(())
        }),
        "nullable" => modifier(key, schema, |schema, _| {
            schema.nullable = true;
            Ok(())
        }),
        "nullish" => modifier(key, schema, |schema, _| {
            schema.optional = true;
            schema.nullable = true;
            Ok(())
        }),
        "min" => modifier(key, schema, |schema, args| {
            schema.checks.push(Check::Min(bound_number(args, "min")?));
            Ok(())
        }),
        "max" => modifier(key, schema, |schema, args| {
            schema.checks.push(Check::Max(bound_number(args, "max")?));
            Ok(())
        }),
        "int" => modifier(key, schema, |schema, _| {
            schema.checks.push(Check::Int);
            Ok(())
        }),
        "email" => modifier(key, schema, |schema, _| {
            schema.checks.push(Check::Email);
            Ok(())
        }),
        "nonempty" => modifier(key, schema, |schema, _| {
            schema.checks.push(Check::NonEmpty);
            Ok(())
        }),
        "parse" => {
            let schema = schema.clone();
            native(key, move |_, args| {
                schema
                    .parse(&arg(args, 0))
                    .map_err(|error| EvalError::Thrown(error.to_value()))
            })
        }
        "safeParse" => {
            let schema = schema.clone();
            native(key, move |_, args| {
                Ok(match schema.parse(&arg(args, 0)) {
                    Ok(data) => Value::object([("success", Value::Bool(true)), ("data", data)]),
                    Err(error) => Value::object([
                        ("success", Value::Bool(false)),
                        ("error", error.to_value()),
                    ]),
                })
            })
        }
        "describe" => {
            let description = schema.describe();
            native(key, move |_, _| Ok(Value::from(description.as_str())))
        }
        _ => return None,
    };
    Some(value)
}
