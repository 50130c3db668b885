use super::ast::{FunctionDef, Name};
use super::interpreter::{EvalError, Interpreter, Limits, Scope};
use super::promise::Promise;
use crate::reactive::{Computed, NodeId, State};
use crate::schema::Schema;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

pub type ObjectMap = IndexMap<Name, Value>;

/// A runtime value of the formula language.
///
/// Arrays and objects are shared, mutable references like their JavaScript
/// counterparts; `PartialEq` compares them structurally, unlike `===`.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Name),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<ObjectMap>>),
    Function(Function),
    Signal(Signal),
    Promise(Promise),
    Schema(Rc<Schema>),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object<K: Into<Name>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Object(Rc::new(RefCell::new(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )))
    }

    pub fn empty_object() -> Self {
        Self::Object(Rc::new(RefCell::new(ObjectMap::new())))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Function(_) => "function",
            Self::Null
            | Self::Array(_)
            | Self::Object(_)
            | Self::Signal(_)
            | Self::Promise(_)
            | Self::Schema(_) => "object",
        }
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(value) => *value,
            Self::Number(number) => *number != 0.0 && !number.is_nan(),
            Self::String(text) => !text.is_empty(),
            _ => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(value) => f64::from(u8::from(*value)),
            Self::Number(number) => *number,
            Self::String(text) => string_to_number(text),
            Self::Array(items) => {
                let items = items.borrow();
                match items.as_slice() {
                    [] => 0.0,
                    [only] => only.to_number(),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// `String(value)` in JavaScript terms.
    pub fn to_display(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_owned(),
            Self::Null => "null".to_owned(),
            Self::Bool(value) => value.to_string(),
            Self::Number(number) => format_number(*number),
            Self::String(text) => text.to_string(),
            Self::Array(items) => items
                .borrow()
                .iter()
                .map(|item| {
                    if item.is_nullish() {
                        String::new()
                    } else {
                        item.to_display()
                    }
                })
                .collect::<Vec<_>>()
                .join(","),
            Self::Object(_) | Self::Schema(_) => "[object Object]".to_owned(),
            Self::Function(function) => format!("function {}() {{ [code] }}", function.name()),
            Self::Signal(signal) => signal.get_untracked().to_display(),
            Self::Promise(_) => "[object Promise]".to_owned(),
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Signal(a), Self::Signal(b)) => a.ptr_eq(b),
            (Self::Promise(a), Self::Promise(b)) => a.ptr_eq(b),
            (Self::Schema(a), Self::Schema(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Self::Number(_), Self::String(_))
            | (Self::String(_), Self::Number(_))
            | (Self::Bool(_), _)
            | (_, Self::Bool(_)) => self.to_number() == other.to_number(),
            _ => self.strict_equals(other),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_signal(&self) -> Option<&Signal> {
        match self {
            Self::Signal(signal) => Some(signal),
            _ => None,
        }
    }

    /// Own property of an object value; `None` for every other kind.
    pub fn field(&self, key: &str) -> Option<Value> {
        match self {
            Self::Object(map) => map.borrow().get(key).cloned(),
            _ => None,
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(value) => Self::Bool(*value),
            serde_json::Value::Number(number) => Self::Number(number.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(text) => Self::String(Name::from(text.as_str())),
            serde_json::Value::Array(items) => {
                Self::array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::object(
                map.iter()
                    .map(|(key, value)| (Name::from(key.as_str()), Self::from_json(value))),
            ),
        }
    }

    /// `JSON.stringify` semantics: functions and `undefined` disappear from
    /// objects and become `null` inside arrays. Signals serialize their
    /// current value.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_at_depth(0)
    }

    fn to_json_at_depth(&self, depth: usize) -> serde_json::Value {
        const MAX_DEPTH: usize = 64;
        if depth > MAX_DEPTH {
            return serde_json::Value::Null;
        }
        match self {
            Self::Undefined | Self::Null | Self::Function(_) => serde_json::Value::Null,
            Self::Bool(value) => serde_json::Value::Bool(*value),
            Self::Number(number) => number_to_json(*number),
            Self::String(text) => serde_json::Value::String(text.to_string()),
            Self::Array(items) => serde_json::Value::Array(
                items
                    .borrow()
                    .iter()
                    .map(|item| item.to_json_at_depth(depth + 1))
                    .collect(),
            ),
            Self::Object(map) => serde_json::Value::Object(
                map.borrow()
                    .iter()
                    .filter(|(_, value)| !matches!(value, Self::Undefined | Self::Function(_)))
                    .map(|(key, value)| (key.to_string(), value.to_json_at_depth(depth + 1)))
                    .collect(),
            ),
            Self::Signal(signal) => signal.get_untracked().to_json_at_depth(depth + 1),
            Self::Promise(_) | Self::Schema(_) => serde_json::Value::Object(Default::default()),
        }
    }
}

fn number_to_json(number: f64) -> serde_json::Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if number.is_finite() && number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER {
        serde_json::Value::from(number as i64)
    } else {
        serde_json::Number::from_f64(number)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

pub(crate) fn string_to_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => {
            if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
                return i64::from_str_radix(hex, 16).map_or(f64::NAN, |number| number as f64);
            }
            if trimmed.chars().any(|character| character.is_ascii_alphabetic() && !matches!(character, 'e' | 'E')) {
                return f64::NAN;
            }
            trimmed.parse().unwrap_or(f64::NAN)
        }
    }
}

/// Formats a number the way JavaScript's `String(number)` does.
pub fn format_number(number: f64) -> String {
    if number.is_nan() {
        return "NaN".to_owned();
    }
    if number.is_infinite() {
        return if number > 0.0 { "Infinity" } else { "-Infinity" }.to_owned();
    }
    if number == 0.0 {
        return "0".to_owned();
    }
    let magnitude = number.abs();
    if (1e-7..1e21).contains(&magnitude) {
        return number.to_string();
    }
    let formatted = format!("{number:e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) if !exponent.starts_with('-') => {
            format!("{mantissa}e+{exponent}")
        }
        _ => formatted,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Array(a), Self::Array(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Self::Object(a), Self::Object(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self.strict_equals(other),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Number(number) => f.write_str(&format_number(*number)),
            Self::String(text) => write!(f, "{text:?}"),
            Self::Array(items) => match items.try_borrow() {
                Ok(items) => f.debug_list().entries(items.iter()).finish(),
                Err(_) => f.write_str("[..]"),
            },
            Self::Object(map) => match map.try_borrow() {
                Ok(map) => f
                    .debug_map()
                    .entries(map.iter().map(|(key, value)| (&**key, value)))
                    .finish(),
                Err(_) => f.write_str("{..}"),
            },
            Self::Function(function) => write!(f, "[Function {}]", function.name()),
            Self::Signal(signal) => write!(f, "Signal({:?})", signal.id()),
            Self::Promise(promise) => write!(f, "Promise({})", promise.state_name()),
            Self::Schema(schema) => write!(f, "Schema({})", schema.describe()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display())
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Self::Number(number)
    }
}

impl From<i32> for Value {
    fn from(number: i32) -> Self {
        Self::Number(f64::from(number))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Self::String(Name::from(text))
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Self::String(Name::from(text))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::array(items)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Self::Function(function)
    }
}

impl From<Signal> for Value {
    fn from(signal: Signal) -> Self {
        Self::Signal(signal)
    }
}

impl From<Promise> for Value {
    fn from(promise: Promise) -> Self {
        Self::Promise(promise)
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        Self::from_json(json)
    }
}

pub type NativeFn = dyn Fn(&mut Interpreter, &[Value]) -> Result<Value, EvalError>;

/// A callable value: either host code or a closure over formula code.
#[derive(Clone)]
pub struct Function(Rc<FunctionKind>);

pub(crate) enum FunctionKind {
    Native {
        name: Name,
        call: Box<NativeFn>,
    },
    Closure {
        def: Rc<FunctionDef>,
        scope: Scope,
        limits: Limits,
    },
}

impl Function {
    pub fn native(
        name: impl Into<Name>,
        call: impl Fn(&mut Interpreter, &[Value]) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        Self(Rc::new(FunctionKind::Native {
            name: name.into(),
            call: Box::new(call),
        }))
    }

    pub(crate) fn closure(def: Rc<FunctionDef>, scope: Scope, limits: Limits) -> Self {
        Self(Rc::new(FunctionKind::Closure { def, scope, limits }))
    }

    pub(crate) fn kind(&self) -> &FunctionKind {
        &self.0
    }

    pub fn name(&self) -> &str {
        match &*self.0 {
            FunctionKind::Native { name, .. } => name,
            FunctionKind::Closure { def, .. } => def.name.as_deref().unwrap_or("anonymous"),
        }
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Invokes the function from host code with a fresh step budget.
    pub fn call(&self, arguments: &[Value]) -> Result<Value, EvalError> {
        let limits = match &*self.0 {
            FunctionKind::Closure { limits, .. } => *limits,
            FunctionKind::Native { .. } => Limits::default(),
        };
        Interpreter::new(limits).call_function(self, arguments)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Function {}]", self.name())
    }
}

/// A variable's live cell as seen by formulas: `count.get()`,
/// `count.set(1)`, `count.update(n => n + 1)`.
#[derive(Clone)]
pub enum Signal {
    State(State<Value>),
    Computed(Computed<Value>),
}

impl Signal {
    pub fn get(&self) -> Value {
        match self {
            Self::State(state) => state.get(),
            Self::Computed(computed) => computed.get(),
        }
    }

    pub fn get_untracked(&self) -> Value {
        match self {
            Self::State(state) => state.get_untracked(),
            Self::Computed(computed) => computed.get_untracked().unwrap_or_default(),
        }
    }

    pub fn set(&self, value: Value) -> Result<(), EvalError> {
        match self {
            Self::State(state) => {
                state.set(value);
                Ok(())
            }
            Self::Computed(_) => Err(EvalError::type_error(
                "cannot assign to a computed variable",
            )),
        }
    }

    pub fn id(&self) -> NodeId {
        match self {
            Self::State(state) => state.id(),
            Self::Computed(computed) => computed.id(),
        }
    }

    pub fn ptr_eq(&self, other: &Signal) -> bool {
        match (self, other) {
            (Self::State(a), Self::State(b)) => a.ptr_eq(b),
            (Self::Computed(a), Self::Computed(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(state) => write!(f, "State({:?})", state.id()),
            Self::Computed(computed) => write!(f, "Computed({:?})", computed.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_like_javascript() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(f64::NAN), "NaN");
    }

    #[test]
    fn coercions() {
        assert_eq!(Value::from(" 42 ").to_number(), 42.0);
        assert!(Value::from("").to_number() == 0.0);
        assert!(Value::from("12px").to_number().is_nan());
        assert!(!Value::from(0).is_truthy());
        assert!(Value::empty_object().is_truthy());
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(Value::from("1").loose_equals(&Value::from(1)));
        assert!(!Value::from("1").strict_equals(&Value::from(1)));
    }

    #[test]
    fn json_round_trip_keeps_integers_integral() {
        let json = serde_json::json!({"name": "Ada", "tags": ["a", "b"], "age": 36, "ratio": 0.5});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
        assert_eq!(value.to_json().to_string(), json.to_string());
    }

    #[test]
    fn objects_drop_functions_when_serialized() {
        let value = Value::object([
            ("keep", Value::from(1)),
            ("skip", Value::Function(Function::native("f", |_, _| Ok(Value::Undefined)))),
        ]);
        assert_eq!(value.to_json(), serde_json::json!({"keep": 1}));
    }
}
