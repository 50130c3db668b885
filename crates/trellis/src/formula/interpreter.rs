use super::Spanned;
use super::ast::*;
use super::builtins;
use super::value::{Function, FunctionKind, ObjectMap, Value};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 100;

/// Bounds of one evaluation. Every statement, expression and loop iteration
/// costs one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_steps: u64,
    pub max_call_depth: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    #[error("ReferenceError: {0} is not defined")]
    Reference(Name),
    #[error("TypeError: {0}")]
    Type(String),
    #[error("RangeError: {0}")]
    Range(String),
    #[error("{}", describe_thrown(.0))]
    Thrown(Value),
}

impl EvalError {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    /// The value a `catch` clause binds for this error.
    pub fn into_value(self) -> Value {
        let (name, message) = match self {
            Self::Thrown(value) => return value,
            Self::Reference(name) => ("ReferenceError", format!("{name} is not defined")),
            Self::Type(message) => ("TypeError", message),
            Self::Range(message) => ("RangeError", message),
        };
        builtins::error_object(name, &message)
    }
}

fn describe_thrown(value: &Value) -> String {
    match (value.field("name"), value.field("message")) {
        (Some(name), Some(message)) if !name.is_nullish() => {
            format!("{}: {}", name.to_display(), message.to_display())
        }
        (_, Some(message)) => message.to_display(),
        _ => value.to_display(),
    }
}

/// Lexical environment: a chain of frames, innermost first.
#[derive(Clone, Default)]
pub struct Scope(Rc<Frame>);

#[derive(Default)]
struct Frame {
    bindings: RefCell<HashMap<Name, Binding>>,
    parent: Option<Scope>,
}

struct Binding {
    value: Value,
    mutable: bool,
}

impl Scope {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self(Rc::new(Frame {
            bindings: RefCell::default(),
            parent: Some(self.clone()),
        }))
    }

    pub fn declare(&self, name: impl Into<Name>, value: Value) {
        self.bind(name.into(), value, true);
    }

    pub fn declare_const(&self, name: impl Into<Name>, value: Value) {
        self.bind(name.into(), value, false);
    }

    pub(crate) fn bind(&self, name: Name, value: Value, mutable: bool) {
        self.0
            .bindings
            .borrow_mut()
            .insert(name, Binding { value, mutable });
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = self;
        loop {
            if let Some(binding) = scope.0.bindings.borrow().get(name) {
                return Some(binding.value.clone());
            }
            scope = scope.0.parent.as_ref()?;
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        let mut scope = self;
        loop {
            if scope.0.bindings.borrow().contains_key(name) {
                return true;
            }
            match &scope.0.parent {
                Some(parent) => scope = parent,
                None => return false,
            }
        }
    }

    pub(crate) fn assign(&self, name: &str, value: Value) -> Result<(), EvalError> {
        let mut scope = self;
        loop {
            if let Some(binding) = scope.0.bindings.borrow_mut().get_mut(name) {
                if !binding.mutable {
                    return Err(EvalError::type_error(format!(
                        "Assignment to constant variable `{name}`."
                    )));
                }
                binding.value = value;
                return Ok(());
            }
            match &scope.0.parent {
                Some(parent) => scope = parent,
                None => return Err(EvalError::Reference(Name::from(name))),
            }
        }
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

enum Place {
    Variable(Name),
    Property(Value, Name),
}

/// Tree-walking evaluator. One interpreter serves one host-level call and
/// carries its step and call-depth budget.
pub struct Interpreter {
    limits: Limits,
    steps: u64,
    depth: u32,
}

impl Interpreter {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            steps: 0,
            depth: 0,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn tick(&mut self) -> Result<(), EvalError> {
        self.steps += 1;
        if self.exhausted() {
            return Err(EvalError::Range(format!(
                "formula exceeded its budget of {} steps",
                self.limits.max_steps
            )));
        }
        Ok(())
    }

    fn exhausted(&self) -> bool {
        self.steps > self.limits.max_steps
    }

    /// Runs top-level statements. A top-level `return` stops the formula
    /// early and its value is handed back.
    pub fn run(
        &mut self,
        body: &[Spanned<Stmt>],
        scope: &Scope,
    ) -> Result<Option<Value>, EvalError> {
        match self.exec_block(body, scope)? {
            Flow::Return(value) => Ok(Some(value)),
            Flow::Normal | Flow::Break | Flow::Continue => Ok(None),
        }
    }

    pub fn call_value(&mut self, callee: &Value, arguments: &[Value]) -> Result<Value, EvalError> {
        match callee {
            Value::Function(function) => self.call_function(function, arguments),
            other => Err(EvalError::type_error(format!(
                "{} is not a function",
                other.type_of()
            ))),
        }
    }

    pub fn call_function(
        &mut self,
        function: &Function,
        arguments: &[Value],
    ) -> Result<Value, EvalError> {
        if self.depth >= self.limits.max_call_depth {
            return Err(EvalError::Range("Maximum call stack size exceeded".to_owned()));
        }
        self.depth += 1;
        let result = match function.kind() {
            FunctionKind::Native { call, .. } => call(self, arguments),
            FunctionKind::Closure { def, scope, .. } => {
                self.call_closure(function, def, scope, arguments)
            }
        };
        self.depth -= 1;
        result
    }

    fn call_closure(
        &mut self,
        function: &Function,
        def: &FunctionDef,
        captured: &Scope,
        arguments: &[Value],
    ) -> Result<Value, EvalError> {
        let scope = captured.child();
        if let Some(name) = &def.name {
            scope.bind(name.clone(), Value::Function(function.clone()), true);
        }
        for (index, param) in def.params.iter().enumerate() {
            let value = if param.rest {
                Value::array(arguments.get(index..).map(<[Value]>::to_vec).unwrap_or_default())
            } else {
                arguments.get(index).cloned().unwrap_or_default()
            };
            self.bind_item(&param.item, value, &scope, true)?;
        }
        match &def.body {
            FunctionBody::Block(body) => match self.exec_block(body, &scope)? {
                Flow::Return(value) => Ok(value),
                Flow::Normal | Flow::Break | Flow::Continue => Ok(Value::Undefined),
            },
            FunctionBody::Expression(expression) => self.eval(expression, &scope),
        }
    }

    fn exec_block(&mut self, body: &[Spanned<Stmt>], scope: &Scope) -> Result<Flow, EvalError> {
        for statement in body {
            if let Stmt::Function(def) = &statement.node {
                if let Some(name) = &def.name {
                    let function = Function::closure(def.clone(), scope.clone(), self.limits);
                    scope.bind(name.clone(), Value::Function(function), true);
                }
            }
        }
        for statement in body {
            match self.exec(statement, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, statement: &Spanned<Stmt>, scope: &Scope) -> Result<Flow, EvalError> {
        self.tick()?;
        match &statement.node {
            Stmt::Expression(expression) => {
                self.eval(expression, scope)?;
                Ok(Flow::Normal)
            }
            Stmt::Declare { kind, declarators } => {
                for declarator in declarators {
                    let value = match &declarator.init {
                        Some(init) => self.eval(init, scope)?,
                        None => Value::Undefined,
                    };
                    self.bind_pattern(&declarator.target, value, scope, *kind != DeclareKind::Const)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.is_truthy() {
                    self.exec(consequent, scope)
                } else if let Some(alternate) = alternate {
                    self.exec(alternate, scope)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::Block(body) => self.exec_block(body, &scope.child()),
            Stmt::ForOf {
                kind,
                target,
                iterable,
                body,
            } => {
                let iterable = self.eval(iterable, scope)?;
                for item in builtins::iterate(&iterable)? {
                    self.tick()?;
                    let iteration = scope.child();
                    match kind {
                        Some(kind) => {
                            self.bind_pattern(target, item, &iteration, *kind != DeclareKind::Const)?
                        }
                        None => self.assign_pattern(target, item, scope)?,
                    }
                    match self.exec(body, &iteration)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => {
                let scope = scope.child();
                if let Some(init) = init {
                    self.exec(init, &scope)?;
                }
                loop {
                    self.tick()?;
                    if let Some(test) = test {
                        if !self.eval(test, &scope)?.is_truthy() {
                            break;
                        }
                    }
                    match self.exec(body, &scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = update {
                        self.eval(update, &scope)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::While { test, body } => {
                while self.eval(test, scope)?.is_truthy() {
                    match self.exec(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Return(value) => {
                let value = match value {
                    Some(value) => self.eval(value, scope)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Throw(value) => Err(EvalError::Thrown(self.eval(value, scope)?)),
            Stmt::Try {
                block,
                handler,
                finalizer,
            } => {
                let outcome = match (self.exec_block(block, &scope.child()), handler) {
                    // An exhausted budget is not catchable.
                    (Err(error), Some(handler)) if !self.exhausted() => {
                        self.run_handler(handler, error, scope)
                    }
                    (outcome, _) => outcome,
                };
                if let Some(finalizer) = finalizer {
                    match self.exec_block(finalizer, &scope.child())? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                outcome
            }
        }
    }

    fn run_handler(
        &mut self,
        handler: &CatchClause,
        error: EvalError,
        scope: &Scope,
    ) -> Result<Flow, EvalError> {
        let scope = scope.child();
        if let Some(param) = &handler.param {
            self.bind_pattern(param, error.into_value(), &scope, true)?;
        }
        self.exec_block(&handler.body, &scope)
    }

    fn bind_item(
        &mut self,
        item: &PatternItem,
        value: Value,
        scope: &Scope,
        mutable: bool,
    ) -> Result<(), EvalError> {
        let value = match (&value, &item.default) {
            (Value::Undefined, Some(default)) => self.eval(default, scope)?,
            _ => value,
        };
        self.bind_pattern(&item.target, value, scope, mutable)
    }

    fn bind_pattern(
        &mut self,
        pattern: &Pattern,
        value: Value,
        scope: &Scope,
        mutable: bool,
    ) -> Result<(), EvalError> {
        match pattern {
            Pattern::Identifier(name) => {
                scope.bind(name.node.clone(), value, mutable);
                Ok(())
            }
            Pattern::Object { entries, rest } => {
                if value.is_nullish() {
                    return Err(EvalError::type_error(format!(
                        "Cannot destructure '{value}' as it is {value}."
                    )));
                }
                for entry in entries {
                    let field = builtins::get_property(&value, &entry.key)?;
                    self.bind_item(&entry.item, field, scope, mutable)?;
                }
                if let Some(rest) = rest {
                    let taken: HashSet<&str> = entries.iter().map(|entry| &*entry.key).collect();
                    let remaining: Vec<(Name, Value)> = match &value {
                        Value::Object(map) => map
                            .borrow()
                            .iter()
                            .filter(|(key, _)| !taken.contains(&***key))
                            .map(|(key, value)| (key.clone(), value.clone()))
                            .collect(),
                        _ => Vec::new(),
                    };
                    scope.bind(rest.node.clone(), Value::object(remaining), mutable);
                }
                Ok(())
            }
            Pattern::Array { items, rest } => {
                let values = builtins::iterate(&value)?;
                for (index, item) in items.iter().enumerate() {
                    let value = values.get(index).cloned().unwrap_or_default();
                    self.bind_item(item, value, scope, mutable)?;
                }
                if let Some(rest) = rest {
                    let remaining = values.get(items.len()..).map(<[Value]>::to_vec).unwrap_or_default();
                    scope.bind(rest.node.clone(), Value::array(remaining), mutable);
                }
                Ok(())
            }
        }
    }

    /// `for (x of xs)` without a declaration writes to existing bindings.
    fn assign_pattern(&mut self, pattern: &Pattern, value: Value, scope: &Scope) -> Result<(), EvalError> {
        let staging = scope.child();
        self.bind_pattern(pattern, value, &staging, true)?;
        for name in pattern.names() {
            let value = staging.lookup(&name.node).unwrap_or_default();
            scope.assign(&name.node, value)?;
        }
        Ok(())
    }

    pub(crate) fn eval(&mut self, expression: &Spanned<Expr>, scope: &Scope) -> Result<Value, EvalError> {
        self.tick()?;
        match &expression.node {
            Expr::Number(number) => Ok(Value::Number(*number)),
            Expr::Str(text) => Ok(Value::String(text.clone())),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::Null => Ok(Value::Null),
            Expr::Template(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(chunk) => text.push_str(chunk),
                        TemplatePart::Expression(expression) => {
                            let value = self.eval(expression, scope)?.to_display();
                            builtins::string_length((text.len() + value.len()) as f64)?;
                            text.push_str(&value)
                        }
                    }
                }
                Ok(Value::from(text))
            }
            Expr::Identifier(name) => scope
                .lookup(name)
                .ok_or_else(|| EvalError::Reference(name.clone())),
            Expr::Array(elements) => Ok(Value::array(self.eval_elements(elements, scope)?)),
            Expr::Object(entries) => self.eval_object(entries, scope),
            Expr::Function(def) => Ok(Value::Function(Function::closure(
                def.clone(),
                scope.clone(),
                self.limits,
            ))),
            Expr::Unary { op, operand } => {
                if let (UnaryOp::Typeof, Expr::Identifier(name)) = (op, &operand.node) {
                    let type_of = scope.lookup(name).map_or("undefined", |value| value.type_of());
                    return Ok(Value::from(type_of));
                }
                let value = self.eval(operand, scope)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.is_truthy()),
                    UnaryOp::Negate => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::Typeof => Value::from(value.type_of()),
                })
            }
            Expr::Update { op, prefix, target } => {
                let place = self.place(target, scope)?;
                let old = self.read_place(&place, scope)?.to_number();
                let new = match op {
                    UpdateOp::Increment => old + 1.0,
                    UpdateOp::Decrement => old - 1.0,
                };
                self.write_place(&place, Value::Number(new), scope)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                binary(*op, &left, &right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left, scope)?;
                let short_circuits = match op {
                    LogicalOp::And => !left.is_truthy(),
                    LogicalOp::Or => left.is_truthy(),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short_circuits {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.is_truthy() {
                    self.eval(consequent, scope)
                } else {
                    self.eval(alternate, scope)
                }
            }
            Expr::Assign { op, target, value } => {
                let place = self.place(target, scope)?;
                let result = if let Some(binary_op) = op.binary() {
                    let current = self.read_place(&place, scope)?;
                    let operand = self.eval(value, scope)?;
                    binary(binary_op, &current, &operand)?
                } else if *op == AssignOp::Assign {
                    self.eval(value, scope)?
                } else {
                    let current = self.read_place(&place, scope)?;
                    let keep = match op {
                        AssignOp::Nullish => !current.is_nullish(),
                        AssignOp::Or => current.is_truthy(),
                        _ => !current.is_truthy(),
                    };
                    if keep {
                        return Ok(current);
                    }
                    self.eval(value, scope)?
                };
                self.write_place(&place, result.clone(), scope)?;
                Ok(result)
            }
            Expr::Member { .. } | Expr::Index { .. } | Expr::Call { .. } => {
                Ok(self.eval_chain(expression, scope)?.unwrap_or_default())
            }
        }
    }

    /// Evaluates a member/call chain; `None` means an optional link hit
    /// `null` or `undefined` and the rest of the chain was skipped.
    fn eval_chain(
        &mut self,
        expression: &Spanned<Expr>,
        scope: &Scope,
    ) -> Result<Option<Value>, EvalError> {
        match &expression.node {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Some(object) = self.eval_link(object, scope)? else {
                    return Ok(None);
                };
                if *optional && object.is_nullish() {
                    return Ok(None);
                }
                builtins::get_property(&object, property).map(Some)
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let Some(object) = self.eval_link(object, scope)? else {
                    return Ok(None);
                };
                if *optional && object.is_nullish() {
                    return Ok(None);
                }
                let key = property_key(&self.eval(index, scope)?);
                builtins::get_property(&object, &key).map(Some)
            }
            Expr::Call {
                callee,
                arguments,
                optional,
            } => {
                let Some(function) = self.eval_link(callee, scope)? else {
                    return Ok(None);
                };
                if *optional && function.is_nullish() {
                    return Ok(None);
                }
                let arguments = self.eval_elements(arguments, scope)?;
                match function {
                    Value::Function(function) => self.call_function(&function, &arguments).map(Some),
                    _ => Err(EvalError::type_error(format!(
                        "{} is not a function",
                        describe(&callee.node)
                    ))),
                }
            }
            _ => self.eval(expression, scope).map(Some),
        }
    }

    fn eval_link(
        &mut self,
        expression: &Spanned<Expr>,
        scope: &Scope,
    ) -> Result<Option<Value>, EvalError> {
        self.tick()?;
        self.eval_chain(expression, scope)
    }

    fn eval_elements(&mut self, elements: &[Element], scope: &Scope) -> Result<Vec<Value>, EvalError> {
        let mut values = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                Element::Item(expression) => values.push(self.eval(expression, scope)?),
                Element::Spread(expression) => {
                    let spread = self.eval(expression, scope)?;
                    values.extend(builtins::iterate(&spread)?);
                }
            }
        }
        Ok(values)
    }

    fn eval_object(&mut self, entries: &[ObjectEntry], scope: &Scope) -> Result<Value, EvalError> {
        let mut map = ObjectMap::new();
        for entry in entries {
            match entry {
                ObjectEntry::Property { key, value } => {
                    let key = match key {
                        PropertyKey::Static(key) => key.clone(),
                        PropertyKey::Computed(key) => property_key(&self.eval(key, scope)?),
                    };
                    let value = self.eval(value, scope)?;
                    map.insert(key, value);
                }
                ObjectEntry::Shorthand(name) => {
                    let value = scope
                        .lookup(&name.node)
                        .ok_or_else(|| EvalError::Reference(name.node.clone()))?;
                    map.insert(name.node.clone(), value);
                }
                ObjectEntry::Spread(expression) => match self.eval(expression, scope)? {
                    Value::Object(source) => map.extend(
                        source
                            .borrow()
                            .iter()
                            .map(|(key, value)| (key.clone(), value.clone())),
                    ),
                    Value::Array(items) => map.extend(
                        items
                            .borrow()
                            .iter()
                            .enumerate()
                            .map(|(index, value)| (Name::from(index.to_string()), value.clone())),
                    ),
                    _ => {}
                },
            }
        }
        Ok(Value::Object(Rc::new(RefCell::new(map))))
    }

    fn place(&mut self, target: &Spanned<Expr>, scope: &Scope) -> Result<Place, EvalError> {
        match &target.node {
            Expr::Identifier(name) => Ok(Place::Variable(name.clone())),
            Expr::Member {
                object, property, ..
            } => Ok(Place::Property(self.eval(object, scope)?, property.clone())),
            Expr::Index { object, index, .. } => {
                let object = self.eval(object, scope)?;
                let key = property_key(&self.eval(index, scope)?);
                Ok(Place::Property(object, key))
            }
            _ => Err(EvalError::type_error("invalid assignment target")),
        }
    }

    fn read_place(&mut self, place: &Place, scope: &Scope) -> Result<Value, EvalError> {
        match place {
            Place::Variable(name) => scope
                .lookup(name)
                .ok_or_else(|| EvalError::Reference(name.clone())),
            Place::Property(object, key) => builtins::get_property(object, key),
        }
    }

    fn write_place(&mut self, place: &Place, value: Value, scope: &Scope) -> Result<(), EvalError> {
        match place {
            Place::Variable(name) => scope.assign(name, value),
            Place::Property(object, key) => builtins::set_property(object, key, value),
        }
    }
}

pub(crate) fn property_key(value: &Value) -> Name {
    match value {
        Value::String(key) => key.clone(),
        other => Name::from(other.to_display()),
    }
}

fn describe(expression: &Expr) -> String {
    match expression {
        Expr::Identifier(name) => name.to_string(),
        Expr::Member {
            object, property, ..
        } => format!("{}.{property}", describe(&object.node)),
        Expr::Index { object, .. } => format!("{}[..]", describe(&object.node)),
        Expr::Call { callee, .. } => format!("{}(..)", describe(&callee.node)),
        _ => "expression".to_owned(),
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        _ => left.to_number().partial_cmp(&right.to_number()),
    }
}

fn concatenates(value: &Value) -> bool {
    !matches!(
        value,
        Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_)
    )
}

pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    Ok(match op {
        BinaryOp::Add if concatenates(left) || concatenates(right) => {
            let (left, right) = (left.to_display(), right.to_display());
            builtins::string_length((left.len() + right.len()) as f64)?;
            Value::from(left + &right)
        }
        BinaryOp::Add => Value::Number(left.to_number() + right.to_number()),
        BinaryOp::Subtract => Value::Number(left.to_number() - right.to_number()),
        BinaryOp::Multiply => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Divide => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Remainder => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Power => Value::Number(left.to_number().powf(right.to_number())),
        BinaryOp::StrictEqual => Value::Bool(left.strict_equals(right)),
        BinaryOp::StrictNotEqual => Value::Bool(!left.strict_equals(right)),
        BinaryOp::Equal => Value::Bool(left.loose_equals(right)),
        BinaryOp::NotEqual => Value::Bool(!left.loose_equals(right)),
        BinaryOp::Less => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOp::LessOrEqual => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Greater => Value::Bool(compare(left, right) == Some(Ordering::Greater)),
        BinaryOp::GreaterOrEqual => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parser::parse;

    fn run_with(source: &str, limits: Limits) -> Result<Value, EvalError> {
        let statements = parse(source).unwrap();
        let scope = Scope::root();
        builtins::install_globals(&scope);
        let exports = Value::empty_object();
        scope.declare_const("module", Value::object([("exports", exports)]));
        let mut interpreter = Interpreter::new(limits);
        interpreter.run(&statements, &scope.child())?;
        Ok(scope
            .lookup("module")
            .and_then(|module| module.field("exports"))
            .unwrap_or_default())
    }

    fn run(source: &str) -> Value {
        run_with(source, Limits::default()).unwrap()
    }

    #[test]
    fn arithmetic_and_strings() {
        assert_eq!(run("module.exports = 1 + 2 * 3 ** 2"), Value::from(19));
        assert_eq!(run("module.exports = 'Count: ' + 5"), Value::from("Count: 5"));
        assert_eq!(run("module.exports = 7 % 3 - -1"), Value::from(2));
        assert_eq!(run("module.exports = `${1 + 1} items`"), Value::from("2 items"));
        assert_eq!(run("module.exports = '2' * '3'"), Value::from(6));
    }

    #[test]
    fn closures_capture_their_scope() {
        let source = "
            function counter() {
                let n = 0
                return () => ++n
            }
            const next = counter()
            next(); next()
            module.exports = next()
        ";
        assert_eq!(run(source), Value::from(3));
    }

    #[test]
    fn function_declarations_are_hoisted() {
        let source = "
            module.exports = fact(5)
            function fact(n) { return n <= 1 ? 1 : n * fact(n - 1) }
        ";
        assert_eq!(run(source), Value::from(120));
    }

    #[test]
    fn destructuring_with_defaults_and_rest() {
        let source = "
            const { a, b = 2, ...others } = { a: 1, c: 3, d: 4 }
            const [first, second, ...tail] = [10, 20, 30, 40]
            module.exports = [a, b, Object.keys(others).join(''), first + second, tail.length]
        ";
        let value = run(source);
        assert_eq!(value.to_json(), serde_json::json!([1, 2, "cd", 30, 2]));
    }

    #[test]
    fn loops_break_and_continue() {
        let source = "
            let total = 0
            for (const n of [1, 2, 3, 4, 5, 6]) {
                if (n % 2 === 0) continue
                if (n > 4) break
                total += n
            }
            let i = 0
            while (true) { i++; if (i >= 3) break }
            for (let j = 0; j < 4; j++) total += j
            module.exports = total * 10 + i
        ";
        assert_eq!(run(source), Value::from(103));
    }

    #[test]
    fn try_catch_finally() {
        let source = "
            const log = []
            const empty = {}
            try {
                empty.missing.call()
            } catch (error) {
                log.push(error.name)
            } finally {
                log.push('done')
            }
            try { throw new Error('boom') } catch ({ message }) { log.push(message) }
            module.exports = log.join(',')
        ";
        assert_eq!(run(source), Value::from("TypeError,done,boom"));
    }

    #[test]
    fn optional_chaining_short_circuits_the_whole_chain() {
        assert_eq!(run("const a = null; module.exports = a?.b.c.d"), Value::Undefined);
        assert_eq!(run("const a = {}; module.exports = a.f?.()"), Value::Undefined);
        assert_eq!(run("module.exports = null ?? 'fallback'"), Value::from("fallback"));
    }

    #[test]
    fn reading_a_property_of_undefined_is_a_type_error() {
        let error = run_with("const a = {}; module.exports = a.b.c", Limits::default()).unwrap_err();
        assert!(matches!(error, EvalError::Type(_)), "{error}");
    }

    #[test]
    fn const_bindings_cannot_be_reassigned() {
        let error = run_with("const a = 1; a = 2", Limits::default()).unwrap_err();
        assert!(error.to_string().contains("constant"), "{error}");
    }

    #[test]
    fn step_budget_stops_infinite_loops() {
        let limits = Limits {
            max_steps: 10_000,
            ..Limits::default()
        };
        let error = run_with("try { while (true) {} } catch (e) {}", limits).unwrap_err();
        assert!(matches!(error, EvalError::Range(_)), "{error}");
    }

    #[test]
    fn call_depth_is_limited() {
        let limits = Limits {
            max_call_depth: 20,
            ..Limits::default()
        };
        let error = run_with("function f() { return f() } f()", limits).unwrap_err();
        assert_eq!(error.to_string(), "RangeError: Maximum call stack size exceeded");
    }

    #[test]
    fn thrown_values_keep_their_message() {
        let error = run_with("throw new TypeError('bad input')", Limits::default()).unwrap_err();
        assert_eq!(error.to_string(), "TypeError: bad input");
        let error = run_with("throw 'plain'", Limits::default()).unwrap_err();
        assert_eq!(error.to_string(), "plain");
    }
}
