//! Standard globals and the methods of built-in value kinds.
//!
//! Methods are looked up at property access time and returned as natives
//! bound to their receiver, so `const push = items.push; push(1)` works
//! without a `this` binding.

use super::ast::Name;
use super::interpreter::{EvalError, Interpreter, Scope, property_key};
use super::promise::Promise;
use super::value::{Function, ObjectMap, Signal, Value, format_number};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;
use ulid::Ulid;

type Method = fn(&mut Interpreter, &Value, &[Value]) -> Result<Value, EvalError>;

/// Names every formula can use without them being injected.
pub const GLOBAL_NAMES: &[&str] = &[
    "Math",
    "JSON",
    "Object",
    "Array",
    "String",
    "Number",
    "Boolean",
    "Promise",
    "Error",
    "TypeError",
    "RangeError",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "console",
    "NaN",
    "Infinity",
    "undefined",
];

pub fn install_globals(scope: &Scope) {
    scope.declare_const("NaN", Value::Number(f64::NAN));
    scope.declare_const("Infinity", Value::Number(f64::INFINITY));
    scope.declare_const("undefined", Value::Undefined);
    scope.declare_const("Math", math());
    scope.declare_const("JSON", json());
    scope.declare_const("Object", object_global());
    scope.declare_const("Array", array_global());
    scope.declare_const("Promise", promise_global());
    scope.declare_const("console", console());
    scope.declare_const(
        "String",
        native("String", |_, args| Ok(Value::from(arg(args, 0).to_display()))),
    );
    scope.declare_const(
        "Number",
        native("Number", |_, args| {
            Ok(Value::Number(args.first().map_or(0.0, Value::to_number)))
        }),
    );
    scope.declare_const(
        "Boolean",
        native("Boolean", |_, args| Ok(Value::Bool(arg(args, 0).is_truthy()))),
    );
    for name in ["Error", "TypeError", "RangeError"] {
        scope.declare_const(
            name,
            native(name, move |_, args| {
                let message = match arg(args, 0) {
                    Value::Undefined => String::new(),
                    message => message.to_display(),
                };
                Ok(error_object(name, &message))
            }),
        );
    }
    scope.declare_const(
        "parseInt",
        native("parseInt", |_, args| {
            Ok(Value::Number(parse_int(&arg(args, 0).to_display(), &arg(args, 1))))
        }),
    );
    scope.declare_const(
        "parseFloat",
        native("parseFloat", |_, args| {
            Ok(Value::Number(parse_float(&arg(args, 0).to_display())))
        }),
    );
    scope.declare_const(
        "isNaN",
        native("isNaN", |_, args| Ok(Value::Bool(arg(args, 0).to_number().is_nan()))),
    );
    scope.declare_const(
        "isFinite",
        native("isFinite", |_, args| {
            Ok(Value::Bool(arg(args, 0).to_number().is_finite()))
        }),
    );
}

/// `{ name, message }`, the shape of every error value formulas see.
pub fn error_object(name: &str, message: &str) -> Value {
    Value::object([("name", Value::from(name)), ("message", Value::from(message))])
}

fn native(
    name: &str,
    call: impl Fn(&mut Interpreter, &[Value]) -> Result<Value, EvalError> + 'static,
) -> Value {
    Value::Function(Function::native(name, call))
}

fn bound(name: &str, receiver: &Value, method: Method) -> Value {
    let receiver = receiver.clone();
    native(name, move |interpreter, args| method(interpreter, &receiver, args))
}

pub(crate) fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

fn callback(args: &[Value], index: usize) -> Option<Function> {
    args.get(index).and_then(Value::as_function).cloned()
}

fn array_index(key: &str) -> Option<usize> {
    let index: usize = key.parse().ok()?;
    (index.to_string() == key).then_some(index)
}

/// Longest array a formula may build. Arrays are dense, so this sits well
/// below the `2^32 - 1` of sparse engines.
pub const MAX_ARRAY_LENGTH: usize = 1 << 24;

/// Longest string, in bytes, a formula may build.
pub const MAX_STRING_LENGTH: usize = 1 << 27;

pub(crate) fn array_length(length: f64) -> Result<usize, EvalError> {
    if length >= 0.0 && length.fract() == 0.0 && length <= MAX_ARRAY_LENGTH as f64 {
        Ok(length as usize)
    } else {
        Err(EvalError::Range("Invalid array length".to_owned()))
    }
}

pub(crate) fn string_length(length: f64) -> Result<usize, EvalError> {
    if length <= MAX_STRING_LENGTH as f64 {
        Ok(length.max(0.0) as usize)
    } else {
        Err(EvalError::Range("Invalid string length".to_owned()))
    }
}

/// Resolves a relative index (negative counts from the end) into `0..=len`.
fn relative(index: &Value, len: usize, default: usize) -> usize {
    if matches!(index, Value::Undefined) {
        return default;
    }
    let index = index.to_number();
    if index.is_nan() {
        return 0;
    }
    let index = index.trunc();
    if index < 0.0 {
        (len as f64 + index).max(0.0) as usize
    } else {
        index.min(len as f64) as usize
    }
}

pub fn iterate(value: &Value) -> Result<Vec<Value>, EvalError> {
    match value {
        Value::Array(items) => Ok(items.borrow().clone()),
        Value::String(text) => Ok(text.chars().map(|c| Value::from(c.to_string())).collect()),
        other => Err(EvalError::type_error(format!(
            "{} is not iterable",
            match other {
                Value::Undefined | Value::Null => other.to_display(),
                _ => other.type_of().to_owned(),
            }
        ))),
    }
}

pub fn get_property(value: &Value, key: &str) -> Result<Value, EvalError> {
    let found = match value {
        Value::Undefined | Value::Null => {
            return Err(EvalError::type_error(format!(
                "Cannot read properties of {value} (reading '{key}')"
            )));
        }
        Value::Object(map) => match map.borrow().get(key) {
            Some(found) => Some(found.clone()),
            None if key == "hasOwnProperty" => Some(bound(key, value, |_, this, args| {
                let key = property_key(&arg(args, 0));
                Ok(Value::Bool(this.field(&key).is_some()))
            })),
            None => None,
        },
        Value::Array(items) => match key {
            "length" => Some(Value::from(items.borrow().len() as f64)),
            _ => match array_index(key) {
                Some(index) => items.borrow().get(index).cloned(),
                None => array_method(key).map(|method| bound(key, value, method)),
            },
        },
        Value::String(text) => match key {
            "length" => Some(Value::from(text.chars().count() as f64)),
            _ => match array_index(key) {
                Some(index) => text.chars().nth(index).map(|c| Value::from(c.to_string())),
                None => string_method(key).map(|method| bound(key, value, method)),
            },
        },
        Value::Number(_) => number_method(key).map(|method| bound(key, value, method)),
        Value::Bool(_) => (key == "toString").then(|| {
            bound(key, value, |_, this, _| Ok(Value::from(this.to_display())))
        }),
        Value::Function(function) => match key {
            "name" => Some(Value::from(function.name())),
            _ => static_member(function.name(), key),
        },
        Value::Signal(_) => signal_method(key).map(|method| bound(key, value, method)),
        Value::Promise(_) => promise_method(key).map(|method| bound(key, value, method)),
        Value::Schema(schema) => crate::schema::member(schema, key),
    };
    Ok(found.unwrap_or_default())
}

pub fn set_property(target: &Value, key: &str, value: Value) -> Result<(), EvalError> {
    match target {
        Value::Object(map) => {
            map.borrow_mut().insert(Name::from(key), value);
            Ok(())
        }
        Value::Array(items) => {
            let mut items = items.borrow_mut();
            if key == "length" {
                let length = array_length(value.to_number())?;
                items.resize(length, Value::Undefined);
                return Ok(());
            }
            let Some(index) = array_index(key) else {
                return Err(EvalError::type_error(format!(
                    "cannot set property '{key}' of an array"
                )));
            };
            if index >= items.len() {
                let length = array_length(index as f64 + 1.0)?;
                items.resize(length, Value::Undefined);
            }
            items[index] = value;
            Ok(())
        }
        other => Err(EvalError::type_error(format!(
            "Cannot set properties of {} (setting '{key}')",
            match other {
                Value::Undefined | Value::Null => other.to_display(),
                _ => other.type_of().to_owned(),
            }
        ))),
    }
}

fn static_member(function: &str, key: &str) -> Option<Value> {
    let member = match (function, key) {
        ("Number", "isInteger") => native(key, |_, args| {
            Ok(Value::Bool(matches!(arg(args, 0), Value::Number(n) if n.is_finite() && n.fract() == 0.0)))
        }),
        ("Number", "isFinite") => native(key, |_, args| {
            Ok(Value::Bool(matches!(arg(args, 0), Value::Number(n) if n.is_finite())))
        }),
        ("Number", "isNaN") => native(key, |_, args| {
            Ok(Value::Bool(matches!(arg(args, 0), Value::Number(n) if n.is_nan())))
        }),
        ("Number", "parseFloat") => native(key, |_, args| {
            Ok(Value::Number(parse_float(&arg(args, 0).to_display())))
        }),
        ("Number", "parseInt") => native(key, |_, args| {
            Ok(Value::Number(parse_int(&arg(args, 0).to_display(), &arg(args, 1))))
        }),
        ("Number", "MAX_SAFE_INTEGER") => Value::Number(9_007_199_254_740_991.0),
        ("Number", "EPSILON") => Value::Number(f64::EPSILON),
        _ => return None,
    };
    Some(member)
}

fn parse_int(text: &str, radix: &Value) -> f64 {
    let text = text.trim_start();
    let (sign, text) = match text.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, text.strip_prefix('+').unwrap_or(text)),
    };
    let mut radix = match radix {
        Value::Undefined => 10,
        radix => radix.to_number() as u32,
    };
    let text = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(rest) if radix == 10 || radix == 16 || radix == 0 => {
            radix = 16;
            rest
        }
        _ => text,
    };
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    let digits: String = text.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let magnitude = digits.chars().fold(0.0, |acc, digit| {
        acc * f64::from(radix) + f64::from(digit.to_digit(radix).unwrap_or(0))
    });
    sign * magnitude
}

fn parse_float(text: &str) -> f64 {
    let text = text.trim_start();
    if text.starts_with("Infinity") || text.starts_with("+Infinity") {
        return f64::INFINITY;
    }
    if text.starts_with("-Infinity") {
        return f64::NEG_INFINITY;
    }
    // Longest prefix that parses as a number.
    let candidates = text
        .char_indices()
        .map(|(index, c)| index + c.len_utf8())
        .take_while(|end| {
            text[..*end]
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        });
    candidates
        .filter_map(|end| text[..end].parse::<f64>().ok())
        .last()
        .unwrap_or(f64::NAN)
}

fn math() -> Value {
    fn unary(name: &'static str, f: fn(f64) -> f64) -> (&'static str, Value) {
        (name, native(name, move |_, args| Ok(Value::Number(f(arg(args, 0).to_number())))))
    }
    Value::object([
        ("PI", Value::Number(std::f64::consts::PI)),
        ("E", Value::Number(std::f64::consts::E)),
        unary("abs", f64::abs),
        unary("floor", f64::floor),
        unary("ceil", f64::ceil),
        unary("round", |n| (n + 0.5).floor()),
        unary("trunc", f64::trunc),
        unary("sign", |n| if n == 0.0 || n.is_nan() { n } else { n.signum() }),
        unary("sqrt", f64::sqrt),
        unary("cbrt", f64::cbrt),
        unary("log", f64::ln),
        unary("log10", f64::log10),
        unary("log2", f64::log2),
        unary("exp", f64::exp),
        unary("sin", f64::sin),
        unary("cos", f64::cos),
        unary("tan", f64::tan),
        (
            "pow",
            native("pow", |_, args| {
                Ok(Value::Number(arg(args, 0).to_number().powf(arg(args, 1).to_number())))
            }),
        ),
        (
            "min",
            native("min", |_, args| {
                Ok(Value::Number(args.iter().map(Value::to_number).fold(f64::INFINITY, |a, b| {
                    if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }
                })))
            }),
        ),
        (
            "max",
            native("max", |_, args| {
                Ok(Value::Number(args.iter().map(Value::to_number).fold(f64::NEG_INFINITY, |a, b| {
                    if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }
                })))
            }),
        ),
        (
            "random",
            native("random", |_, _| {
                // 80 random bits of a fresh ULID.
                Ok(Value::Number(Ulid::new().random() as f64 / 2f64.powi(80)))
            }),
        ),
    ])
}

fn json() -> Value {
    Value::object([
        (
            "stringify",
            native("stringify", |_, args| {
                let value = arg(args, 0);
                if matches!(value, Value::Undefined | Value::Function(_)) {
                    return Ok(Value::Undefined);
                }
                let json = value.to_json();
                let indented = match arg(args, 2) {
                    Value::Number(n) => n > 0.0,
                    Value::String(indent) => !indent.is_empty(),
                    _ => false,
                };
                let text = if indented {
                    serde_json::to_string_pretty(&json)
                } else {
                    serde_json::to_string(&json)
                };
                text.map(Value::from)
                    .map_err(|error| EvalError::type_error(error.to_string()))
            }),
        ),
        (
            "parse",
            native("parse", |_, args| {
                let text = arg(args, 0).to_display();
                serde_json::from_str::<serde_json::Value>(&text)
                    .map(|json| Value::from_json(&json))
                    .map_err(|error| {
                        EvalError::Thrown(error_object("SyntaxError", &error.to_string()))
                    })
            }),
        ),
    ])
}

fn entries_of(value: &Value) -> Vec<(Name, Value)> {
    match value {
        Value::Object(map) => map
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        Value::Array(items) => items
            .borrow()
            .iter()
            .enumerate()
            .map(|(index, value)| (Name::from(index.to_string()), value.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

fn object_global() -> Value {
    Value::object([
        (
            "keys",
            native("keys", |_, args| {
                Ok(Value::array(
                    entries_of(&arg(args, 0))
                        .into_iter()
                        .map(|(key, _)| Value::String(key))
                        .collect(),
                ))
            }),
        ),
        (
            "values",
            native("values", |_, args| {
                Ok(Value::array(
                    entries_of(&arg(args, 0)).into_iter().map(|(_, value)| value).collect(),
                ))
            }),
        ),
        (
            "entries",
            native("entries", |_, args| {
                Ok(Value::array(
                    entries_of(&arg(args, 0))
                        .into_iter()
                        .map(|(key, value)| Value::array(vec![Value::String(key), value]))
                        .collect(),
                ))
            }),
        ),
        (
            "assign",
            native("assign", |_, args| {
                let target = arg(args, 0);
                for source in args.iter().skip(1) {
                    for (key, value) in entries_of(source) {
                        set_property(&target, &key, value)?;
                    }
                }
                Ok(target)
            }),
        ),
        (
            "fromEntries",
            native("fromEntries", |_, args| {
                let mut map = ObjectMap::new();
                for entry in iterate(&arg(args, 0))? {
                    let key = property_key(&get_property(&entry, "0")?);
                    map.insert(key, get_property(&entry, "1")?);
                }
                Ok(Value::Object(Rc::new(RefCell::new(map))))
            }),
        ),
        ("freeze", native("freeze", |_, args| Ok(arg(args, 0)))),
    ])
}

fn array_global() -> Value {
    Value::object([
        (
            "isArray",
            native("isArray", |_, args| {
                Ok(Value::Bool(matches!(arg(args, 0), Value::Array(_))))
            }),
        ),
        (
            "from",
            native("from", |interpreter, args| {
                let source = arg(args, 0);
                let items = match &source {
                    Value::Object(_) => {
                        let length = get_property(&source, "length")?.to_number();
                        let length = if length > 0.0 { array_length(length.trunc())? } else { 0 };
                        vec![Value::Undefined; length]
                    }
                    _ => iterate(&source)?,
                };
                let Some(map) = callback(args, 1) else {
                    return Ok(Value::array(items));
                };
                let mut mapped = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    mapped.push(interpreter.call_function(&map, &[item, Value::from(index as f64)])?);
                }
                Ok(Value::array(mapped))
            }),
        ),
        ("of", native("of", |_, args| Ok(Value::array(args.to_vec())))),
    ])
}

fn promise_global() -> Value {
    Value::object([
        (
            "resolve",
            native("resolve", |_, args| Ok(Value::Promise(Promise::resolved(arg(args, 0))))),
        ),
        (
            "reject",
            native("reject", |_, args| Ok(Value::Promise(Promise::rejected(arg(args, 0))))),
        ),
        (
            "all",
            native("all", |_, args| Ok(Value::Promise(Promise::all(iterate(&arg(args, 0))?)))),
        ),
    ])
}

fn inspect(value: &Value) -> String {
    match value {
        Value::String(text) => text.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_json().to_string(),
        other => other.to_display(),
    }
}

fn console() -> Value {
    fn line(args: &[Value]) -> String {
        args.iter().map(inspect).collect::<Vec<_>>().join(" ")
    }
    Value::object([
        ("log", native("log", |_, args| {
            log::info!(target: "formula", "{}", line(args));
            Ok(Value::Undefined)
        })),
        ("info", native("info", |_, args| {
            log::info!(target: "formula", "{}", line(args));
            Ok(Value::Undefined)
        })),
        ("debug", native("debug", |_, args| {
            log::debug!(target: "formula", "{}", line(args));
            Ok(Value::Undefined)
        })),
        ("warn", native("warn", |_, args| {
            log::warn!(target: "formula", "{}", line(args));
            Ok(Value::Undefined)
        })),
        ("error", native("error", |_, args| {
            log::error!(target: "formula", "{}", line(args));
            Ok(Value::Undefined)
        })),
    ])
}

fn items_of(this: &Value) -> Result<&Rc<RefCell<Vec<Value>>>, EvalError> {
    match this {
        Value::Array(items) => Ok(items),
        other => Err(EvalError::type_error(format!("{} is not an array", other.type_of()))),
    }
}

fn text_of(this: &Value) -> Rc<str> {
    match this {
        Value::String(text) => text.clone(),
        other => Name::from(other.to_display()),
    }
}

fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan() => true,
        _ => a.strict_equals(b),
    }
}

/// Calls `f(item, index, array)` for every element of a snapshot of the array.
fn each(
    interpreter: &mut Interpreter,
    this: &Value,
    args: &[Value],
    mut visit: impl FnMut(usize, Value, Value) -> Option<Value>,
) -> Result<Option<Value>, EvalError> {
    let items = items_of(this)?.borrow().clone();
    let Some(function) = callback(args, 0) else {
        return Err(EvalError::type_error(format!(
            "{} is not a function",
            arg(args, 0).type_of()
        )));
    };
    for (index, item) in items.into_iter().enumerate() {
        let result = interpreter.call_function(
            &function,
            &[item.clone(), Value::from(index as f64), this.clone()],
        )?;
        if let Some(stop) = visit(index, item, result) {
            return Ok(Some(stop));
        }
    }
    Ok(None)
}

fn flatten(items: &[Value], depth: f64, into: &mut Vec<Value>) {
    for item in items {
        match item {
            Value::Array(nested) if depth >= 1.0 => flatten(&nested.borrow(), depth - 1.0, into),
            other => into.push(other.clone()),
        }
    }
}

fn sort_values(
    items: Vec<Value>,
    compare: &mut dyn FnMut(&Value, &Value) -> Result<Ordering, EvalError>,
) -> Result<Vec<Value>, EvalError> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let middle = items.len() / 2;
    let mut left = items;
    let right = left.split_off(middle);
    let left = sort_values(left, compare)?;
    let right = sort_values(right, compare)?;
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(a), Some(b)) = (left.peek(), right.peek()) {
        if compare(b, a)? == Ordering::Less {
            merged.extend(right.next());
        } else {
            merged.extend(left.next());
        }
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

fn array_method(key: &str) -> Option<Method> {
    let method: Method = match key {
        "push" => |_, this, args| {
            let items = items_of(this)?;
            items.borrow_mut().extend_from_slice(args);
            Ok(Value::from(items.borrow().len() as f64))
        },
        "pop" => |_, this, _| Ok(items_of(this)?.borrow_mut().pop().unwrap_or_default()),
        "shift" => |_, this, _| {
            let items = items_of(this)?;
            let mut items = items.borrow_mut();
            Ok(if items.is_empty() { Value::Undefined } else { items.remove(0) })
        },
        "unshift" => |_, this, args| {
            let items = items_of(this)?;
            let mut items = items.borrow_mut();
            items.splice(0..0, args.iter().cloned());
            Ok(Value::from(items.len() as f64))
        },
        "slice" => |_, this, args| {
            let items = items_of(this)?.borrow();
            let start = relative(&arg(args, 0), items.len(), 0);
            let end = relative(&arg(args, 1), items.len(), items.len());
            Ok(Value::array(items.get(start..end.max(start)).map(<[Value]>::to_vec).unwrap_or_default()))
        },
        "splice" => |_, this, args| {
            let items = items_of(this)?;
            let mut items = items.borrow_mut();
            let start = relative(&arg(args, 0), items.len(), 0);
            let count = match args.get(1) {
                None => items.len() - start,
                Some(count) => (count.to_number().max(0.0) as usize).min(items.len() - start),
            };
            let removed: Vec<Value> = items
                .splice(start..start + count, args.iter().skip(2).cloned())
                .collect();
            Ok(Value::array(removed))
        },
        "concat" => |_, this, args| {
            let mut items = items_of(this)?.borrow().clone();
            for item in args {
                match item {
                    Value::Array(more) => {
                        let more = more.borrow();
                        array_length((items.len() + more.len()) as f64)?;
                        items.extend(more.iter().cloned());
                    }
                    other => items.push(other.clone()),
                }
            }
            Ok(Value::array(items))
        },
        "join" => |_, this, args| {
            let separator = match arg(args, 0) {
                Value::Undefined => ",".to_owned(),
                separator => separator.to_display(),
            };
            let joined = items_of(this)?
                .borrow()
                .iter()
                .map(|item| if item.is_nullish() { String::new() } else { item.to_display() })
                .collect::<Vec<_>>()
                .join(&separator);
            Ok(Value::from(joined))
        },
        "reverse" => |_, this, _| {
            items_of(this)?.borrow_mut().reverse();
            Ok(this.clone())
        },
        "indexOf" => |_, this, args| {
            let needle = arg(args, 0);
            let position = items_of(this)?.borrow().iter().position(|item| item.strict_equals(&needle));
            Ok(Value::Number(position.map_or(-1.0, |index| index as f64)))
        },
        "includes" => |_, this, args| {
            let needle = arg(args, 0);
            Ok(Value::Bool(items_of(this)?.borrow().iter().any(|item| same_value_zero(item, &needle))))
        },
        "at" => |_, this, args| {
            let items = items_of(this)?.borrow();
            let index = arg(args, 0).to_number().trunc();
            let index = if index < 0.0 { items.len() as f64 + index } else { index };
            Ok(if index < 0.0 { Value::Undefined } else { items.get(index as usize).cloned().unwrap_or_default() })
        },
        "flat" => |_, this, args| {
            let depth = match arg(args, 0) {
                Value::Undefined => 1.0,
                depth => depth.to_number(),
            };
            let mut flat = Vec::new();
            flatten(&items_of(this)?.borrow(), depth, &mut flat);
            Ok(Value::array(flat))
        },
        "forEach" => |interpreter, this, args| {
            each(interpreter, this, args, |_, _, _| None)?;
            Ok(Value::Undefined)
        },
        "map" => |interpreter, this, args| {
            let mut mapped = Vec::new();
            each(interpreter, this, args, |_, _, result| {
                mapped.push(result);
                None
            })?;
            Ok(Value::array(mapped))
        },
        "flatMap" => |interpreter, this, args| {
            let mut mapped = Vec::new();
            each(interpreter, this, args, |_, _, result| {
                mapped.push(result);
                None
            })?;
            let mut flat = Vec::new();
            flatten(&mapped, 1.0, &mut flat);
            Ok(Value::array(flat))
        },
        "filter" => |interpreter, this, args| {
            let mut kept = Vec::new();
            each(interpreter, this, args, |_, item, result| {
                if result.is_truthy() {
                    kept.push(item);
                }
                None
            })?;
            Ok(Value::array(kept))
        },
        "find" => |interpreter, this, args| {
            let found = each(interpreter, this, args, |_, item, result| result.is_truthy().then_some(item))?;
            Ok(found.unwrap_or_default())
        },
        "findIndex" => |interpreter, this, args| {
            let found = each(interpreter, this, args, |index, _, result| {
                result.is_truthy().then(|| Value::from(index as f64))
            })?;
            Ok(found.unwrap_or(Value::Number(-1.0)))
        },
        "some" => |interpreter, this, args| {
            let found = each(interpreter, this, args, |_, _, result| result.is_truthy().then_some(Value::Bool(true)))?;
            Ok(Value::Bool(found.is_some()))
        },
        "every" => |interpreter, this, args| {
            let failed = each(interpreter, this, args, |_, _, result| (!result.is_truthy()).then_some(Value::Bool(false)))?;
            Ok(Value::Bool(failed.is_none()))
        },
        "reduce" => |interpreter, this, args| {
            let items = items_of(this)?.borrow().clone();
            let Some(function) = callback(args, 0) else {
                return Err(EvalError::type_error("reducer is not a function"));
            };
            let mut items = items.into_iter().enumerate();
            let mut accumulator = match args.get(1) {
                Some(initial) => initial.clone(),
                None => match items.next() {
                    Some((_, first)) => first,
                    None => {
                        return Err(EvalError::type_error("Reduce of empty array with no initial value"));
                    }
                },
            };
            for (index, item) in items {
                accumulator = interpreter.call_function(
                    &function,
                    &[accumulator, item, Value::from(index as f64), this.clone()],
                )?;
            }
            Ok(accumulator)
        },
        "sort" => |interpreter, this, args| {
            let items = items_of(this)?;
            let snapshot = items.borrow().clone();
            let comparator = callback(args, 0);
            let mut compare = |a: &Value, b: &Value| -> Result<Ordering, EvalError> {
                match (a, b) {
                    (Value::Undefined, Value::Undefined) => Ok(Ordering::Equal),
                    (Value::Undefined, _) => Ok(Ordering::Greater),
                    (_, Value::Undefined) => Ok(Ordering::Less),
                    _ => match &comparator {
                        Some(comparator) => {
                            let order = interpreter
                                .call_function(comparator, &[a.clone(), b.clone()])?
                                .to_number();
                            Ok(order.partial_cmp(&0.0).unwrap_or(Ordering::Equal))
                        }
                        None => Ok(a.to_display().cmp(&b.to_display())),
                    },
                }
            };
            let sorted = sort_values(snapshot, &mut compare)?;
            *items.borrow_mut() = sorted;
            Ok(this.clone())
        },
        _ => return None,
    };
    Some(method)
}

fn string_method(key: &str) -> Option<Method> {
    let method: Method = match key {
        "toString" | "valueOf" => |_, this, _| Ok(this.clone()),
        "toUpperCase" => |_, this, _| Ok(Value::from(text_of(this).to_uppercase())),
        "toLowerCase" => |_, this, _| Ok(Value::from(text_of(this).to_lowercase())),
        "trim" => |_, this, _| Ok(Value::from(text_of(this).trim())),
        "trimStart" => |_, this, _| Ok(Value::from(text_of(this).trim_start())),
        "trimEnd" => |_, this, _| Ok(Value::from(text_of(this).trim_end())),
        "includes" => |_, this, args| {
            Ok(Value::Bool(text_of(this).contains(&*arg(args, 0).to_display())))
        },
        "startsWith" => |_, this, args| {
            Ok(Value::Bool(text_of(this).starts_with(&*arg(args, 0).to_display())))
        },
        "endsWith" => |_, this, args| {
            Ok(Value::Bool(text_of(this).ends_with(&*arg(args, 0).to_display())))
        },
        "indexOf" => |_, this, args| {
            let text = text_of(this);
            let position = text
                .find(&*arg(args, 0).to_display())
                .map(|byte| text[..byte].chars().count() as f64);
            Ok(Value::Number(position.unwrap_or(-1.0)))
        },
        "charAt" | "at" => |_, this, args| {
            let chars: Vec<char> = text_of(this).chars().collect();
            let index = arg(args, 0).to_number();
            let index = if index.is_nan() { 0.0 } else { index.trunc() };
            let index = if index < 0.0 { chars.len() as f64 + index } else { index };
            Ok(if index < 0.0 {
                Value::Undefined
            } else {
                chars.get(index as usize).map_or(Value::Undefined, |c| Value::from(c.to_string()))
            })
        },
        "slice" => |_, this, args| {
            let chars: Vec<char> = text_of(this).chars().collect();
            let start = relative(&arg(args, 0), chars.len(), 0);
            let end = relative(&arg(args, 1), chars.len(), chars.len());
            Ok(Value::from(chars.get(start..end.max(start)).unwrap_or_default().iter().collect::<String>()))
        },
        "substring" => |_, this, args| {
            let chars: Vec<char> = text_of(this).chars().collect();
            let clamp = |value: Value, default: usize| match value {
                Value::Undefined => default,
                value => {
                    let n = value.to_number();
                    if n.is_nan() { 0 } else { n.clamp(0.0, chars.len() as f64) as usize }
                }
            };
            let (a, b) = (clamp(arg(args, 0), 0), clamp(arg(args, 1), chars.len()));
            let (start, end) = (a.min(b), a.max(b));
            Ok(Value::from(chars[start..end].iter().collect::<String>()))
        },
        "split" => |_, this, args| {
            let text = text_of(this);
            let parts: Vec<Value> = match arg(args, 0) {
                Value::Undefined => vec![Value::String(text.clone())],
                separator => {
                    let separator = separator.to_display();
                    if separator.is_empty() {
                        text.chars().map(|c| Value::from(c.to_string())).collect()
                    } else {
                        text.split(&*separator).map(Value::from).collect()
                    }
                }
            };
            let parts = match arg(args, 1) {
                Value::Undefined => parts,
                limit => parts.into_iter().take(limit.to_number().max(0.0) as usize).collect(),
            };
            Ok(Value::array(parts))
        },
        "replace" => |interpreter, this, args| replace(interpreter, this, args, Some(1)),
        "replaceAll" => |interpreter, this, args| replace(interpreter, this, args, None),
        "repeat" => |_, this, args| {
            let count = arg(args, 0).to_number();
            if !(count >= 0.0 && count.is_finite()) {
                return Err(EvalError::Range(format!("Invalid count value: {}", format_number(count))));
            }
            let text = text_of(this);
            if text.is_empty() {
                return Ok(Value::from(""));
            }
            let count = string_length(count.trunc() * text.len() as f64)? / text.len();
            Ok(Value::from(text.repeat(count)))
        },
        "padStart" => |_, this, args| Ok(Value::from(pad(&text_of(this), args, true)?)),
        "padEnd" => |_, this, args| Ok(Value::from(pad(&text_of(this), args, false)?)),
        "concat" => |_, this, args| {
            let mut text = text_of(this).to_string();
            for item in args {
                let item = item.to_display();
                string_length((text.len() + item.len()) as f64)?;
                text.push_str(&item);
            }
            Ok(Value::from(text))
        },
        "localeCompare" => |_, this, args| {
            let order = text_of(this).as_ref().cmp(arg(args, 0).to_display().as_str());
            Ok(Value::Number(match order {
                Ordering::Less => -1.0,
                Ordering::Equal => 0.0,
                Ordering::Greater => 1.0,
            }))
        },
        _ => return None,
    };
    Some(method)
}

fn replace(
    interpreter: &mut Interpreter,
    this: &Value,
    args: &[Value],
    limit: Option<usize>,
) -> Result<Value, EvalError> {
    let text = text_of(this);
    let pattern = arg(args, 0).to_display();
    let replacement = arg(args, 1);
    let mut result = String::new();
    let mut rest: &str = &text;
    let mut replaced = 0;
    while limit.is_none_or(|limit| replaced < limit) {
        let Some(position) = rest.find(&*pattern) else {
            break;
        };
        result.push_str(&rest[..position]);
        let substitute = match &replacement {
            Value::Function(function) => interpreter
                .call_function(function, &[Value::from(pattern.as_str())])?
                .to_display(),
            other => other.to_display(),
        };
        result.push_str(&substitute);
        replaced += 1;
        if pattern.is_empty() {
            // An empty pattern matches between every character.
            let mut chars = rest.chars();
            match chars.next() {
                Some(c) => result.push(c),
                None => {
                    rest = "";
                    break;
                }
            }
            rest = chars.as_str();
        } else {
            rest = &rest[position + pattern.len()..];
        }
    }
    result.push_str(rest);
    Ok(Value::from(result))
}

fn pad(text: &str, args: &[Value], start: bool) -> Result<String, EvalError> {
    let target = arg(args, 0).to_number();
    let fill = match arg(args, 1) {
        Value::Undefined => " ".to_owned(),
        fill => fill.to_display(),
    };
    let length = text.chars().count();
    if !(target > length as f64) || fill.is_empty() {
        return Ok(text.to_owned());
    }
    let target = string_length(target)?;
    let padding: String = fill.chars().cycle().take(target - length).collect();
    Ok(if start {
        format!("{padding}{text}")
    } else {
        format!("{text}{padding}")
    })
}

/// `n.toFixed(digits)` with JavaScript's round-half-up on ties.
pub fn to_fixed(number: f64, digits: usize) -> String {
    if !number.is_finite() {
        return format_number(number);
    }
    let scale = 10f64.powi(digits as i32);
    let rounded = (number.abs() * scale).round() / scale;
    let signed = if number < 0.0 && rounded != 0.0 { -rounded } else { rounded };
    format!("{signed:.digits$}")
}

fn number_method(key: &str) -> Option<Method> {
    let method: Method = match key {
        "toFixed" => |_, this, args| {
            let digits = arg(args, 0).to_number();
            let digits = if digits.is_nan() { 0.0 } else { digits };
            if !(0.0..=100.0).contains(&digits) {
                return Err(EvalError::Range("toFixed() digits argument must be between 0 and 100".to_owned()));
            }
            Ok(Value::from(to_fixed(this.to_number(), digits as usize)))
        },
        "toString" => |_, this, _| Ok(Value::from(this.to_display())),
        "valueOf" => |_, this, _| Ok(this.clone()),
        _ => return None,
    };
    Some(method)
}

fn signal_of(this: &Value) -> Result<&Signal, EvalError> {
    this.as_signal()
        .ok_or_else(|| EvalError::type_error("receiver is not a variable"))
}

fn signal_method(key: &str) -> Option<Method> {
    let method: Method = match key {
        "get" => |_, this, _| Ok(signal_of(this)?.get()),
        "peek" => |_, this, _| Ok(signal_of(this)?.get_untracked()),
        "set" => |_, this, args| {
            signal_of(this)?.set(arg(args, 0))?;
            Ok(Value::Undefined)
        },
        "update" => |interpreter, this, args| {
            let signal = signal_of(this)?;
            let next = interpreter.call_value(&arg(args, 0), &[signal.get_untracked()])?;
            signal.set(next.clone())?;
            Ok(next)
        },
        _ => return None,
    };
    Some(method)
}

fn promise_of(this: &Value) -> Result<&Promise, EvalError> {
    match this {
        Value::Promise(promise) => Ok(promise),
        _ => Err(EvalError::type_error("receiver is not a promise")),
    }
}

fn promise_method(key: &str) -> Option<Method> {
    let method: Method = match key {
        "then" => |_, this, args| {
            Ok(Value::Promise(promise_of(this)?.then(callback(args, 0), callback(args, 1))))
        },
        "catch" => |_, this, args| Ok(Value::Promise(promise_of(this)?.catch(callback(args, 0)))),
        "finally" => |_, this, args| {
            Ok(Value::Promise(promise_of(this)?.finally(callback(args, 0))))
        },
        _ => return None,
    };
    Some(method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::interpreter::Limits;
    use crate::formula::parser::parse;

    fn run(source: &str) -> Result<Value, EvalError> {
        let statements = parse(source).unwrap();
        let scope = Scope::root();
        install_globals(&scope);
        let exports = Value::object([("exports", Value::Undefined)]);
        scope.declare_const("module", exports.clone());
        Interpreter::new(Limits::default()).run(&statements, &scope)?;
        Ok(exports.field("exports").unwrap_or_default())
    }

    fn eval(source: &str) -> Value {
        run(&format!("module.exports = {source}")).unwrap()
    }

    fn range_error(source: &str) -> String {
        match run(source) {
            Err(EvalError::Range(message)) => message,
            other => panic!("expected a RangeError from `{source}`, got {other:?}"),
        }
    }

    #[test]
    fn array_methods() {
        assert_eq!(eval("[3, 1, 2].map(n => n * 2).join('-')"), Value::from("6-2-4"));
        assert_eq!(eval("[1, 2, 3, 4].filter(n => n % 2).length"), Value::from(2));
        assert_eq!(eval("[1, 2, 3].reduce((a, b) => a + b, 10)"), Value::from(16));
        assert_eq!(eval("[10, 9, 1].sort().join()"), Value::from("1,10,9"));
        assert_eq!(eval("[10, 9, 1].sort((a, b) => a - b)[2]"), Value::from(10));
        assert_eq!(eval("[1, [2, [3]]].flat().length"), Value::from(3));
        assert_eq!(eval("[1, 2, 3].find(n => n > 1)"), Value::from(2));
        assert_eq!(eval("[NaN].includes(NaN)"), Value::Bool(true));
    }

    #[test]
    fn inconsistent_comparators_do_not_panic() {
        assert_eq!(eval("[3, 1, 2, 5, 4].sort(() => 1).length"), Value::from(5));
    }

    #[test]
    fn push_is_bound_to_its_array() {
        assert_eq!(
            eval("(() => { const xs = []; const push = xs.push; push(1, 2); return xs.length })()"),
            Value::from(2)
        );
    }

    #[test]
    fn oversized_lengths_are_range_errors() {
        assert_eq!(range_error("'x'.repeat(1e300)"), "Invalid string length");
        assert_eq!(range_error("'x'.padStart(1e18)"), "Invalid string length");
        assert_eq!(range_error("'x'.padEnd(1e18, 'ab')"), "Invalid string length");
        assert_eq!(range_error("[].length = 1e300"), "Invalid array length");
        assert_eq!(range_error("const a = []; a[4294967295] = 1"), "Invalid array length");
        assert_eq!(range_error("Array.from({ length: 1e300 })"), "Invalid array length");
        assert_eq!(
            range_error("let s = 'ab'; for (let i = 0; i < 64; i++) { s = s + s }"),
            "Invalid string length"
        );
        assert_eq!(
            range_error("let s = 'ab'; for (let i = 0; i < 64; i++) { s = `${s}${s}` }"),
            "Invalid string length"
        );
    }

    #[test]
    fn lengths_under_the_caps_still_work() {
        assert_eq!(eval("'ab'.repeat(3)"), Value::from("ababab"));
        assert_eq!(eval("''.repeat(1e300)"), Value::from(""));
        assert_eq!(eval("'x'.padEnd(4.7, 'ab')"), Value::from("xaba"));
        assert_eq!(eval("(() => { const a = [1]; a[3] = 4; return a.length })()"), Value::from(4));
        assert_eq!(
            eval("(() => { const a = [1, 2, 3]; a.length = 1; return a })()"),
            Value::array(vec![Value::from(1)])
        );
        assert_eq!(eval("Array.from({ length: 2.5 }).length"), Value::from(2));
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval("'a,b,,c'.split(',').length"), Value::from(4));
        assert_eq!(eval("'hello'.slice(-3)"), Value::from("llo"));
        assert_eq!(eval("'x'.padStart(3, '0')"), Value::from("00x"));
        assert_eq!(eval("'a-b-c'.replace('-', '+')"), Value::from("a+b-c"));
        assert_eq!(eval("'a-b-c'.replaceAll('-', '+')"), Value::from("a+b+c"));
        assert_eq!(eval("'  Hi '.trim().toUpperCase()"), Value::from("HI"));
    }

    #[test]
    fn number_helpers() {
        assert_eq!(eval("(2.5).toFixed(0)"), Value::from("3"));
        assert_eq!(eval("(1.005).toFixed(2)"), Value::from("1.00"));
        assert_eq!(eval("parseInt('42px')"), Value::from(42));
        assert_eq!(eval("parseInt('ff', 16)"), Value::from(255));
        assert_eq!(eval("parseFloat('3.5e2 units')"), Value::from(350));
        assert_eq!(eval("Math.max(1, 5, 3)"), Value::from(5));
        assert_eq!(eval("Math.round(-2.5)"), Value::from(-2));
        assert_eq!(eval("Number.isInteger(4)"), Value::Bool(true));
    }

    #[test]
    fn json_and_object_helpers() {
        assert_eq!(eval("JSON.stringify({ a: [1, 'x'], f: () => 1 })"), Value::from(r#"{"a":[1,"x"]}"#));
        assert_eq!(eval("JSON.parse('{\"n\": 2}').n"), Value::from(2));
        assert_eq!(eval("Object.entries({ a: 1, b: 2 }).length"), Value::from(2));
        assert_eq!(
            eval("Object.fromEntries([['k', 'v']]).k"),
            Value::from("v")
        );
        assert_eq!(eval("Object.assign({}, { a: 1 }, { b: 2 }).b"), Value::from(2));
    }

    #[test]
    fn random_stays_in_the_unit_interval() {
        for _ in 0..32 {
            let n = eval("Math.random()").to_number();
            assert!((0.0..1.0).contains(&n), "{n}");
        }
    }
}
