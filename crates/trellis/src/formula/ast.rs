use super::{Span, Spanned};
use std::rc::Rc;

pub type Name = Rc<str>;

#[derive(Debug, Clone)]
pub enum Stmt {
    Expression(Spanned<Expr>),
    Declare {
        kind: DeclareKind,
        declarators: Vec<Declarator>,
    },
    Function(Rc<FunctionDef>),
    If {
        test: Spanned<Expr>,
        consequent: Box<Spanned<Stmt>>,
        alternate: Option<Box<Spanned<Stmt>>>,
    },
    Block(Vec<Spanned<Stmt>>),
    ForOf {
        kind: Option<DeclareKind>,
        target: Pattern,
        iterable: Spanned<Expr>,
        body: Box<Spanned<Stmt>>,
    },
    For {
        init: Option<Box<Spanned<Stmt>>>,
        test: Option<Spanned<Expr>>,
        update: Option<Spanned<Expr>>,
        body: Box<Spanned<Stmt>>,
    },
    While {
        test: Spanned<Expr>,
        body: Box<Spanned<Stmt>>,
    },
    Break,
    Continue,
    Return(Option<Spanned<Expr>>),
    Throw(Spanned<Expr>),
    Try {
        block: Vec<Spanned<Stmt>>,
        handler: Option<CatchClause>,
        finalizer: Option<Vec<Spanned<Stmt>>>,
    },
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareKind {
    Let,
    Const,
    Var,
}

#[derive(Debug, Clone)]
pub struct Declarator {
    pub target: Pattern,
    pub init: Option<Spanned<Expr>>,
}

#[derive(Debug, Clone)]
pub struct CatchClause {
    pub param: Option<Pattern>,
    pub body: Vec<Spanned<Stmt>>,
}

/// Binding target of declarations, parameters and `for .. of`.
#[derive(Debug, Clone)]
pub enum Pattern {
    Identifier(Spanned<Name>),
    Object {
        entries: Vec<PatternEntry>,
        rest: Option<Spanned<Name>>,
    },
    Array {
        items: Vec<PatternItem>,
        rest: Option<Spanned<Name>>,
    },
}

#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub key: Name,
    pub item: PatternItem,
}

#[derive(Debug, Clone)]
pub struct PatternItem {
    pub target: Pattern,
    pub default: Option<Spanned<Expr>>,
}

impl Pattern {
    /// Every name this pattern binds, in source order.
    pub fn names(&self) -> Vec<&Spanned<Name>> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a Spanned<Name>>) {
        match self {
            Self::Identifier(name) => names.push(name),
            Self::Object { entries, rest } => {
                for entry in entries {
                    entry.item.target.collect_names(names);
                }
                names.extend(rest);
            }
            Self::Array { items, rest } => {
                for item in items {
                    item.target.collect_names(names);
                }
                names.extend(rest);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Option<Name>,
    pub params: Vec<Param>,
    pub body: FunctionBody,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub item: PatternItem,
    pub rest: bool,
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Block(Vec<Spanned<Stmt>>),
    Expression(Box<Spanned<Expr>>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Number(f64),
    Str(Name),
    Template(Vec<TemplatePart>),
    Bool(bool),
    Null,
    Identifier(Name),
    Array(Vec<Element>),
    Object(Vec<ObjectEntry>),
    Function(Rc<FunctionDef>),
    Unary {
        op: UnaryOp,
        operand: Box<Spanned<Expr>>,
    },
    Update {
        op: UpdateOp,
        prefix: bool,
        target: Box<Spanned<Expr>>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Spanned<Expr>>,
        right: Box<Spanned<Expr>>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Spanned<Expr>>,
        right: Box<Spanned<Expr>>,
    },
    Conditional {
        test: Box<Spanned<Expr>>,
        consequent: Box<Spanned<Expr>>,
        alternate: Box<Spanned<Expr>>,
    },
    Assign {
        op: AssignOp,
        target: Box<Spanned<Expr>>,
        value: Box<Spanned<Expr>>,
    },
    Member {
        object: Box<Spanned<Expr>>,
        property: Name,
        optional: bool,
    },
    Index {
        object: Box<Spanned<Expr>>,
        index: Box<Spanned<Expr>>,
        optional: bool,
    },
    Call {
        callee: Box<Spanned<Expr>>,
        arguments: Vec<Element>,
        optional: bool,
    },
}

impl Expr {
    pub fn is_assignable(&self) -> bool {
        matches!(
            self,
            Self::Identifier(_)
                | Self::Member {
                    optional: false,
                    ..
                }
                | Self::Index {
                    optional: false,
                    ..
                }
        )
    }
}

#[derive(Debug, Clone)]
pub enum TemplatePart {
    Text(Name),
    Expression(Spanned<Expr>),
}

/// An array literal item or a call argument.
#[derive(Debug, Clone)]
pub enum Element {
    Item(Spanned<Expr>),
    Spread(Spanned<Expr>),
}

#[derive(Debug, Clone)]
pub enum ObjectEntry {
    Property {
        key: PropertyKey,
        value: Spanned<Expr>,
    },
    Shorthand(Spanned<Name>),
    Spread(Spanned<Expr>),
}

#[derive(Debug, Clone)]
pub enum PropertyKey {
    Static(Name),
    Computed(Spanned<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
    Typeof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Power,
    StrictEqual,
    StrictNotEqual,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Nullish,
    Or,
    And,
}

impl AssignOp {
    pub fn binary(self) -> Option<BinaryOp> {
        match self {
            Self::Add => Some(BinaryOp::Add),
            Self::Subtract => Some(BinaryOp::Subtract),
            Self::Multiply => Some(BinaryOp::Multiply),
            Self::Divide => Some(BinaryOp::Divide),
            Self::Remainder => Some(BinaryOp::Remainder),
            Self::Assign | Self::Nullish | Self::Or | Self::And => None,
        }
    }
}
