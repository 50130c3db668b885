use super::Spanned;
use super::ast::*;
use super::report::Diagnostic;
use std::collections::HashSet;

/// Checks that every free identifier of a formula is either declared by the
/// formula itself or accepted by `is_defined`, and that loop control and
/// assignments are well-formed.
///
/// Declarations are visible in their whole block, so functions may call
/// functions declared after them.
pub fn resolve(
    statements: &[Spanned<Stmt>],
    is_defined: impl Fn(&str) -> bool,
) -> Result<(), Vec<Diagnostic>> {
    let mut resolver = Resolver {
        is_defined: &is_defined,
        scopes: Vec::new(),
        loop_depth: 0,
        errors: Vec::new(),
    };
    resolver.block(statements);
    if resolver.errors.is_empty() {
        Ok(())
    } else {
        Err(resolver.errors)
    }
}

struct Resolver<'a> {
    is_defined: &'a dyn Fn(&str) -> bool,
    scopes: Vec<HashSet<Name>>,
    loop_depth: usize,
    errors: Vec<Diagnostic>,
}

impl Resolver<'_> {
    fn declare(&mut self, name: &Name) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.clone());
        }
    }

    fn declare_pattern(&mut self, pattern: &Pattern) {
        for name in pattern.names() {
            self.declare(&name.node);
        }
    }

    fn is_visible(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|scope| scope.contains(name)) || (self.is_defined)(name)
    }

    fn reference(&mut self, name: &str, span: super::Span) {
        if !self.is_visible(name) {
            self.errors.push(Diagnostic::new(
                span,
                format!("`{name}` is not defined"),
                "not in scope here",
            ));
        }
    }

    fn block(&mut self, statements: &[Spanned<Stmt>]) {
        self.scopes.push(HashSet::new());
        self.hoist(statements);
        for statement in statements {
            self.statement(statement);
        }
        self.scopes.pop();
    }

    fn hoist(&mut self, statements: &[Spanned<Stmt>]) {
        for statement in statements {
            match &statement.node {
                Stmt::Declare { declarators, .. } => {
                    for declarator in declarators {
                        self.declare_pattern(&declarator.target);
                    }
                }
                Stmt::Function(def) => {
                    if let Some(name) = &def.name {
                        self.declare(name);
                    }
                }
                _ => {}
            }
        }
    }

    fn statement(&mut self, statement: &Spanned<Stmt>) {
        match &statement.node {
            Stmt::Expression(expression) => self.expression(expression),
            Stmt::Declare { declarators, .. } => {
                for declarator in declarators {
                    self.pattern_defaults(&declarator.target);
                    if let Some(init) = &declarator.init {
                        self.expression(init);
                    }
                }
            }
            Stmt::Function(def) => self.function(def),
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                self.expression(test);
                self.nested(consequent);
                if let Some(alternate) = alternate {
                    self.nested(alternate);
                }
            }
            Stmt::Block(statements) => self.block(statements),
            Stmt::ForOf {
                kind,
                target,
                iterable,
                body,
            } => {
                self.expression(iterable);
                self.scopes.push(HashSet::new());
                match kind {
                    Some(_) => self.declare_pattern(target),
                    None => {
                        for name in target.names() {
                            self.reference(&name.node, name.span);
                        }
                    }
                }
                self.pattern_defaults(target);
                self.loop_body(body);
                self.scopes.pop();
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => {
                self.scopes.push(HashSet::new());
                if let Some(init) = init {
                    self.hoist(std::slice::from_ref(init));
                    self.statement(init);
                }
                if let Some(test) = test {
                    self.expression(test);
                }
                if let Some(update) = update {
                    self.expression(update);
                }
                self.loop_body(body);
                self.scopes.pop();
            }
            Stmt::While { test, body } => {
                self.expression(test);
                self.loop_body(body);
            }
            Stmt::Break | Stmt::Continue => {
                if self.loop_depth == 0 {
                    let keyword = if matches!(statement.node, Stmt::Break) {
                        "break"
                    } else {
                        "continue"
                    };
                    self.errors.push(Diagnostic::new(
                        statement.span,
                        format!("`{keyword}` outside of a loop"),
                        "no enclosing loop",
                    ));
                }
            }
            Stmt::Return(value) => {
                if let Some(value) = value {
                    self.expression(value);
                }
            }
            Stmt::Throw(value) => self.expression(value),
            Stmt::Try {
                block,
                handler,
                finalizer,
            } => {
                self.block(block);
                if let Some(handler) = handler {
                    self.scopes.push(HashSet::new());
                    if let Some(param) = &handler.param {
                        self.declare_pattern(param);
                        self.pattern_defaults(param);
                    }
                    self.block(&handler.body);
                    self.scopes.pop();
                }
                if let Some(finalizer) = finalizer {
                    self.block(finalizer);
                }
            }
            Stmt::Empty => {}
        }
    }

    /// Single statement in a branch or loop body; a block opens its own scope.
    fn nested(&mut self, statement: &Spanned<Stmt>) {
        self.statement(statement);
    }

    fn loop_body(&mut self, body: &Spanned<Stmt>) {
        self.loop_depth += 1;
        self.nested(body);
        self.loop_depth -= 1;
    }

    fn pattern_defaults(&mut self, pattern: &Pattern) {
        match pattern {
            Pattern::Identifier(_) => {}
            Pattern::Object { entries, .. } => {
                for entry in entries {
                    self.item_default(&entry.item);
                }
            }
            Pattern::Array { items, .. } => {
                for item in items {
                    self.item_default(item);
                }
            }
        }
    }

    fn item_default(&mut self, item: &PatternItem) {
        if let Some(default) = &item.default {
            self.expression(default);
        }
        self.pattern_defaults(&item.target);
    }

    fn function(&mut self, def: &FunctionDef) {
        let loop_depth = std::mem::take(&mut self.loop_depth);
        self.scopes.push(HashSet::new());
        if let Some(name) = &def.name {
            self.declare(name);
        }
        for param in &def.params {
            self.declare_pattern(&param.item.target);
        }
        for param in &def.params {
            self.item_default(&param.item);
        }
        match &def.body {
            FunctionBody::Block(statements) => self.block(statements),
            FunctionBody::Expression(expression) => self.expression(expression),
        }
        self.scopes.pop();
        self.loop_depth = loop_depth;
    }

    fn assignment_target(&mut self, target: &Spanned<Expr>) {
        if !target.node.is_assignable() {
            self.errors.push(Diagnostic::new(
                target.span,
                "invalid assignment target",
                "cannot be assigned to",
            ));
        }
        self.expression(target);
    }

    fn elements(&mut self, elements: &[Element]) {
        for element in elements {
            match element {
                Element::Item(expression) | Element::Spread(expression) => {
                    self.expression(expression)
                }
            }
        }
    }

    fn expression(&mut self, expression: &Spanned<Expr>) {
        match &expression.node {
            Expr::Number(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Null => {}
            Expr::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Expression(expression) = part {
                        self.expression(expression);
                    }
                }
            }
            Expr::Identifier(name) => self.reference(name, expression.span),
            Expr::Array(elements) => self.elements(elements),
            Expr::Object(entries) => {
                for entry in entries {
                    match entry {
                        ObjectEntry::Property { key, value } => {
                            if let PropertyKey::Computed(key) = key {
                                self.expression(key);
                            }
                            self.expression(value);
                        }
                        ObjectEntry::Shorthand(name) => self.reference(&name.node, name.span),
                        ObjectEntry::Spread(expression) => self.expression(expression),
                    }
                }
            }
            Expr::Function(def) => self.function(def),
            Expr::Unary { op, operand } => {
                // `typeof missing` is allowed and yields "undefined".
                if !(*op == UnaryOp::Typeof && matches!(operand.node, Expr::Identifier(_))) {
                    self.expression(operand);
                }
            }
            Expr::Update { target, .. } => self.assignment_target(target),
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                self.expression(left);
                self.expression(right);
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.expression(test);
                self.expression(consequent);
                self.expression(alternate);
            }
            Expr::Assign { target, value, .. } => {
                self.assignment_target(target);
                self.expression(value);
            }
            Expr::Member { object, .. } => self.expression(object),
            Expr::Index { object, index, .. } => {
                self.expression(object);
                self.expression(index);
            }
            Expr::Call {
                callee, arguments, ..
            } => {
                self.expression(callee);
                self.elements(arguments);
            }
        }
    }
}
