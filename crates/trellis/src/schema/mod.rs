//! Zod-like schema values.
//!
//! Schemas are immutable: every modifier returns a new schema. Formulas build
//! them through the `z` object ([`builder`]); hosts use the constructors on
//! [`Schema`] directly.

mod builder;

pub use builder::z;
pub(crate) use builder::member;

use crate::formula::ast::Name;
use crate::formula::value::{Value, format_number};
use indexmap::IndexMap;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaKind {
    String,
    Number,
    Boolean,
    Null,
    Undefined,
    Any,
    Unknown,
    Function,
    Array(Rc<Schema>),
    Object(IndexMap<Name, Rc<Schema>>),
    Record(Rc<Schema>),
    Enum(Vec<Name>),
    Literal(Value),
    Union(Vec<Rc<Schema>>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Check {
    Min(f64),
    Max(f64),
    Int,
    Email,
    NonEmpty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub kind: SchemaKind,
    pub optional: bool,
    pub nullable: bool,
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueCode {
    InvalidType,
    TooSmall,
    TooBig,
    InvalidString,
    InvalidEnumValue,
    InvalidLiteral,
    InvalidUnion,
}

impl IssueCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidType => "invalid_type",
            Self::TooSmall => "too_small",
            Self::TooBig => "too_big",
            Self::InvalidString => "invalid_string",
            Self::InvalidEnumValue => "invalid_enum_value",
            Self::InvalidLiteral => "invalid_literal",
            Self::InvalidUnion => "invalid_union",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(Name),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub code: IssueCode,
    pub path: Vec<PathSegment>,
    pub message: String,
}

impl Issue {
    /// Dotted path; the root is printed as `value`.
    pub fn path_string(&self) -> String {
        if self.path.is_empty() {
            return "value".to_owned();
        }
        self.path
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn to_value(&self) -> Value {
        Value::object([
            ("code", Value::from(self.code.as_str())),
            (
                "path",
                Value::array(
                    self.path
                        .iter()
                        .map(|segment| match segment {
                            PathSegment::Key(key) => Value::String(key.clone()),
                            PathSegment::Index(index) => Value::from(*index as f64),
                        })
                        .collect(),
                ),
            ),
            ("message", Value::from(self.message.as_str())),
        ])
    }
}

/// `<code> <path> is <message>`
impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} is {}", self.code, self.path_string(), self.message)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", self.message())]
pub struct SchemaError {
    pub issues: Vec<Issue>,
}

impl SchemaError {
    /// Every issue flattened, one per line.
    pub fn message(&self) -> String {
        self.issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn to_value(&self) -> Value {
        Value::object([
            ("name", Value::from("ZodError")),
            ("message", Value::from(self.message())),
            (
                "issues",
                Value::array(self.issues.iter().map(Issue::to_value).collect()),
            ),
        ])
    }
}

impl Schema {
    pub fn new(kind: SchemaKind) -> Self {
        Self {
            kind,
            optional: false,
            nullable: false,
            checks: Vec::new(),
        }
    }

    pub fn string() -> Self {
        Self::new(SchemaKind::String)
    }

    pub fn number() -> Self {
        Self::new(SchemaKind::Number)
    }

    pub fn boolean() -> Self {
        Self::new(SchemaKind::Boolean)
    }

    pub fn any() -> Self {
        Self::new(SchemaKind::Any)
    }

    pub fn function() -> Self {
        Self::new(SchemaKind::Function)
    }

    pub fn array(item: Schema) -> Self {
        Self::new(SchemaKind::Array(Rc::new(item)))
    }

    pub fn object<K: Into<Name>>(shape: impl IntoIterator<Item = (K, Schema)>) -> Self {
        Self::new(SchemaKind::Object(
            shape
                .into_iter()
                .map(|(key, schema)| (key.into(), Rc::new(schema)))
                .collect(),
        ))
    }

    pub fn enumeration<S: Into<Name>>(options: impl IntoIterator<Item = S>) -> Self {
        Self::new(SchemaKind::Enum(options.into_iter().map(Into::into).collect()))
    }

    pub fn union(options: impl IntoIterator<Item = Schema>) -> Self {
        Self::new(SchemaKind::Union(options.into_iter().map(Rc::new).collect()))
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn min(self, bound: f64) -> Self {
        self.with_check(Check::Min(bound))
    }

    pub fn max(self, bound: f64) -> Self {
        self.with_check(Check::Max(bound))
    }

    /// Short human description, e.g. `array<string>`.
    pub fn describe(&self) -> String {
        let base = match &self.kind {
            SchemaKind::Array(item) => format!("array<{}>", item.describe()),
            SchemaKind::Object(shape) => format!(
                "object{{{}}}",
                shape.keys().map(|key| &**key).collect::<Vec<_>>().join(", ")
            ),
            SchemaKind::Record(value) => format!("record<{}>", value.describe()),
            SchemaKind::Enum(options) => format!("enum({})", options.join("|")),
            SchemaKind::Literal(value) => format!("literal({})", value.to_json()),
            SchemaKind::Union(options) => options
                .iter()
                .map(|option| option.describe())
                .collect::<Vec<_>>()
                .join(" | "),
            kind => expected_name(kind).to_owned(),
        };
        match (self.optional, self.nullable) {
            (true, true) => format!("{base}?|null"),
            (true, false) => format!("{base}?"),
            (false, true) => format!("{base}|null"),
            (false, false) => base,
        }
    }

    /// Validates `value`, returning the parsed copy. Objects keep only the
    /// keys of their shape.
    pub fn parse(&self, value: &Value) -> Result<Value, SchemaError> {
        let mut issues = Vec::new();
        let mut path = Vec::new();
        let parsed = self.check(value, &mut path, &mut issues);
        if issues.is_empty() {
            Ok(parsed)
        } else {
            Err(SchemaError { issues })
        }
    }

    pub fn is_valid(&self, value: &Value) -> bool {
        self.parse(value).is_ok()
    }

    fn check(&self, value: &Value, path: &mut Vec<PathSegment>, issues: &mut Vec<Issue>) -> Value {
        let mut issue = |code: IssueCode, message: String| {
            issues.push(Issue {
                code,
                path: path.clone(),
                message,
            });
        };
        match value {
            Value::Undefined if self.optional => return Value::Undefined,
            Value::Null if self.nullable => return Value::Null,
            _ => {}
        }
        match (&self.kind, value) {
            (SchemaKind::Any | SchemaKind::Unknown, value) => value.clone(),
            (SchemaKind::Undefined, Value::Undefined) | (SchemaKind::Null, Value::Null) => {
                value.clone()
            }
            (SchemaKind::Boolean, Value::Bool(_)) | (SchemaKind::Function, Value::Function(_)) => {
                value.clone()
            }
            (SchemaKind::String, Value::String(text)) => {
                let length = text.chars().count() as f64;
                for check in &self.checks {
                    match *check {
                        Check::Min(bound) if length < bound => issue(
                            IssueCode::TooSmall,
                            format!("String must contain at least {} character(s)", format_number(bound)),
                        ),
                        Check::NonEmpty if length < 1.0 => issue(
                            IssueCode::TooSmall,
                            "String must contain at least 1 character(s)".to_owned(),
                        ),
                        Check::Max(bound) if length > bound => issue(
                            IssueCode::TooBig,
                            format!("String must contain at most {} character(s)", format_number(bound)),
                        ),
                        Check::Email if !is_email(text) => {
                            issue(IssueCode::InvalidString, "Invalid email".to_owned())
                        }
                        _ => {}
                    }
                }
                value.clone()
            }
            (SchemaKind::Number, Value::Number(number)) if !number.is_nan() => {
                for check in &self.checks {
                    match *check {
                        Check::Int if number.fract() != 0.0 => issue(
                            IssueCode::InvalidType,
                            "Expected integer, received float".to_owned(),
                        ),
                        Check::Min(bound) if *number < bound => issue(
                            IssueCode::TooSmall,
                            format!("Number must be greater than or equal to {}", format_number(bound)),
                        ),
                        Check::Max(bound) if *number > bound => issue(
                            IssueCode::TooBig,
                            format!("Number must be less than or equal to {}", format_number(bound)),
                        ),
                        _ => {}
                    }
                }
                value.clone()
            }
            (SchemaKind::Array(item), Value::Array(items)) => {
                let items = items.borrow().clone();
                let length = items.len() as f64;
                for check in &self.checks {
                    match *check {
                        Check::Min(bound) if length < bound => issue(
                            IssueCode::TooSmall,
                            format!("Array must contain at least {} element(s)", format_number(bound)),
                        ),
                        Check::NonEmpty if items.is_empty() => issue(
                            IssueCode::TooSmall,
                            "Array must contain at least 1 element(s)".to_owned(),
                        ),
                        Check::Max(bound) if length > bound => issue(
                            IssueCode::TooBig,
                            format!("Array must contain at most {} element(s)", format_number(bound)),
                        ),
                        _ => {}
                    }
                }
                let parsed = items
                    .iter()
                    .enumerate()
                    .map(|(index, element)| {
                        path.push(PathSegment::Index(index));
                        let parsed = item.check(element, path, issues);
                        path.pop();
                        parsed
                    })
                    .collect();
                Value::array(parsed)
            }
            (SchemaKind::Object(shape), Value::Object(map)) => {
                let map = map.borrow().clone();
                let mut parsed = Vec::new();
                for (key, schema) in shape {
                    let field = map.get(key).cloned().unwrap_or_default();
                    path.push(PathSegment::Key(key.clone()));
                    let field = schema.check(&field, path, issues);
                    path.pop();
                    if map.contains_key(key) || !matches!(field, Value::Undefined) {
                        parsed.push((key.clone(), field));
                    }
                }
                Value::object(parsed)
            }
            (SchemaKind::Record(schema), Value::Object(map)) => {
                let map = map.borrow().clone();
                let mut parsed = Vec::new();
                for (key, field) in &map {
                    path.push(PathSegment::Key(key.clone()));
                    parsed.push((key.clone(), schema.check(field, path, issues)));
                    path.pop();
                }
                Value::object(parsed)
            }
            (SchemaKind::Enum(options), value) => {
                match value.as_str() {
                    Some(text) if options.iter().any(|option| &**option == text) => {}
                    _ => issue(
                        IssueCode::InvalidEnumValue,
                        format!(
                            "Invalid enum value. Expected {}, received {}",
                            options
                                .iter()
                                .map(|option| format!("'{option}'"))
                                .collect::<Vec<_>>()
                                .join(" | "),
                            match value {
                                Value::String(text) => format!("'{text}'"),
                                other => received_name(other).to_owned(),
                            }
                        ),
                    ),
                }
                value.clone()
            }
            (SchemaKind::Literal(expected), value) => {
                if !expected.strict_equals(value) {
                    issue(
                        IssueCode::InvalidLiteral,
                        format!("Invalid literal value, expected {}", expected.to_json()),
                    );
                }
                value.clone()
            }
            (SchemaKind::Union(options), value) => {
                for option in options {
                    let mut attempt = Vec::new();
                    let parsed = option.check(value, path, &mut attempt);
                    if attempt.is_empty() {
                        return parsed;
                    }
                }
                issues.push(Issue {
                    code: IssueCode::InvalidUnion,
                    path: path.clone(),
                    message: "Invalid input".to_owned(),
                });
                value.clone()
            }
            (kind, value) => {
                let message = match value {
                    Value::Undefined => "Required".to_owned(),
                    value => format!(
                        "Expected {}, received {}",
                        expected_name(kind),
                        received_name(value)
                    ),
                };
                issue(IssueCode::InvalidType, message);
                value.clone()
            }
        }
    }
}

fn expected_name(kind: &SchemaKind) -> &'static str {
    match kind {
        SchemaKind::String => "string",
        SchemaKind::Number => "number",
        SchemaKind::Boolean => "boolean",
        SchemaKind::Null => "null",
        SchemaKind::Undefined => "undefined",
        SchemaKind::Any => "any",
        SchemaKind::Unknown => "unknown",
        SchemaKind::Function => "function",
        SchemaKind::Array(_) => "array",
        SchemaKind::Object(_) | SchemaKind::Record(_) => "object",
        SchemaKind::Enum(_) => "enum",
        SchemaKind::Literal(_) => "literal",
        SchemaKind::Union(_) => "union",
    }
}

fn received_name(value: &Value) -> &'static str {
    match value {
        Value::Number(number) if number.is_nan() => "nan",
        Value::Null => "null",
        Value::Array(_) => "array",
        Value::Promise(_) => "promise",
        other => other.type_of(),
    }
}

fn is_email(text: &str) -> bool {
    let Some((local, domain)) = text.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !text.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, rest)| !host.is_empty() && !rest.is_empty() && !rest.ends_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(schema: &Schema, value: Value) -> Vec<String> {
        match schema.parse(&value) {
            Ok(_) => Vec::new(),
            Err(error) => error.issues.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn root_issues_use_value_as_path() {
        assert_eq!(
            messages(&Schema::string(), Value::from(3)),
            ["invalid_type value is Expected string, received number"]
        );
        assert_eq!(
            messages(&Schema::string(), Value::Undefined),
            ["invalid_type value is Required"]
        );
    }

    #[test]
    fn nested_paths_are_dotted() {
        let schema = Schema::object([(
            "items",
            Schema::array(Schema::object([("qty", Schema::number().min(1.0))])),
        )]);
        let value = Value::from_json(&serde_json::json!({"items": [{"qty": 2}, {"qty": 0}]}));
        assert_eq!(
            messages(&schema, value),
            ["too_small items.1.qty is Number must be greater than or equal to 1"]
        );
    }

    #[test]
    fn optional_and_nullable_modifiers() {
        assert!(Schema::string().optional().is_valid(&Value::Undefined));
        assert!(!Schema::string().optional().is_valid(&Value::Null));
        assert!(Schema::string().nullable().is_valid(&Value::Null));
    }

    #[test]
    fn objects_strip_unknown_keys() {
        let schema = Schema::object([("name", Schema::string())]);
        let value = Value::from_json(&serde_json::json!({"name": "Ada", "extra": 1}));
        assert_eq!(
            schema.parse(&value).unwrap().to_json(),
            serde_json::json!({"name": "Ada"})
        );
    }

    #[test]
    fn unions_enums_and_emails() {
        let schema = Schema::union([Schema::string(), Schema::number()]);
        assert!(schema.is_valid(&Value::from(1)));
        assert_eq!(
            messages(&schema, Value::Bool(true)),
            ["invalid_union value is Invalid input"]
        );
        assert_eq!(
            messages(&Schema::enumeration(["a", "b"]), Value::from("c")),
            ["invalid_enum_value value is Invalid enum value. Expected 'a' | 'b', received 'c'"]
        );
        let email = Schema::string().with_check(Check::Email);
        assert!(email.is_valid(&Value::from("ada@example.com")));
        assert!(!email.is_valid(&Value::from("ada@example")));
    }
}
