use super::ast::*;
use super::lexer::{Token, lexer, unescape};
use super::report::Diagnostic;
use super::{ParseError, Span, Spanned};
use chumsky::{input::ValueInput, pratt::*, prelude::*, recursive::Indirect};
use std::rc::Rc;

type Extra<'src> = extra::Err<ParseError<'src, Token<'src>>>;

#[derive(Clone)]
enum Postfix {
    Member(Name, bool),
    Index(Spanned<Expr>, bool),
    Call(Vec<Element>, bool),
    Update(UpdateOp),
}

fn boxed(expression: Spanned<Expr>) -> Box<Spanned<Expr>> {
    Box::new(expression)
}

fn binary(op: BinaryOp, left: Spanned<Expr>, right: Spanned<Expr>, span: Span) -> Spanned<Expr> {
    Spanned {
        span,
        node: Expr::Binary {
            op,
            left: boxed(left),
            right: boxed(right),
        },
    }
}

fn logical(op: LogicalOp, left: Spanned<Expr>, right: Spanned<Expr>, span: Span) -> Spanned<Expr> {
    Spanned {
        span,
        node: Expr::Logical {
            op,
            left: boxed(left),
            right: boxed(right),
        },
    }
}

fn identifier_param(name: Spanned<Name>) -> Param {
    Param {
        item: PatternItem {
            target: Pattern::Identifier(name),
            default: None,
        },
        rest: false,
    }
}

pub fn parser<'src, I>()
-> impl Parser<'src, I, Vec<Spanned<Stmt>>, Extra<'src>> + Clone
where
    I: ValueInput<'src, Token = Token<'src>, Span = Span>,
{
    let mut statement: Recursive<Indirect<'src, 'src, I, Spanned<Stmt>, Extra<'src>>> =
        Recursive::declare();
    let mut expression: Recursive<Indirect<'src, 'src, I, Spanned<Expr>, Extra<'src>>> =
        Recursive::declare();

    let comma = just(Token::Comma);
    let bracket_round_open = just(Token::BracketRoundOpen);
    let bracket_round_close = just(Token::BracketRoundClose);
    let bracket_curly_open = just(Token::BracketCurlyOpen);
    let bracket_curly_close = just(Token::BracketCurlyClose);
    let bracket_square_open = just(Token::BracketSquareOpen);
    let bracket_square_close = just(Token::BracketSquareClose);

    let identifier = select! { Token::Identifier(identifier) => Name::from(identifier) };
    let binding_name = identifier
        .clone()
        .map_with(|name, extra| Spanned {
            node: name,
            span: extra.span(),
        });
    let property_name = select! {
        Token::Identifier(identifier) => Name::from(identifier),
        token if token.keyword().is_some() => Name::from(token.keyword().unwrap_or_default()),
    };

    let block = statement
        .clone()
        .repeated()
        .collect::<Vec<_>>()
        .delimited_by(bracket_curly_open.clone(), bracket_curly_close.clone())
        .boxed();

    // Binding patterns: `name`, `{ a, b: c = 1, ...rest }`, `[a, b = 2, ...rest]`.
    let pattern = recursive(|pattern| {
        let item = pattern
            .clone()
            .then(just(Token::Assign).ignore_then(expression.clone()).or_not())
            .map(|(target, default)| PatternItem { target, default });

        let renamed_entry = property_name
            .clone()
            .then_ignore(just(Token::Colon))
            .then(item.clone())
            .map(|(key, item)| PatternEntry { key, item });
        let shorthand_entry = binding_name
            .clone()
            .then(just(Token::Assign).ignore_then(expression.clone()).or_not())
            .map(|(name, default)| PatternEntry {
                key: name.node.clone(),
                item: PatternItem {
                    target: Pattern::Identifier(name),
                    default,
                },
            });
        let rest = just(Token::Ellipsis).ignore_then(binding_name.clone());

        let object = renamed_entry
            .or(shorthand_entry)
            .separated_by(comma.clone())
            .allow_trailing()
            .collect::<Vec<_>>()
            .then(rest.clone().or_not())
            .delimited_by(bracket_curly_open.clone(), bracket_curly_close.clone())
            .map(|(entries, rest)| Pattern::Object { entries, rest });

        let array = item
            .separated_by(comma.clone())
            .allow_trailing()
            .collect::<Vec<_>>()
            .then(rest.or_not())
            .delimited_by(bracket_square_open.clone(), bracket_square_close.clone())
            .map(|(items, rest)| Pattern::Array { items, rest });

        choice((binding_name.clone().map(Pattern::Identifier), object, array))
    });

    let param = just(Token::Ellipsis)
        .or_not()
        .then(
            pattern
                .clone()
                .then(just(Token::Assign).ignore_then(expression.clone()).or_not()),
        )
        .map(|(rest, (target, default))| Param {
            item: PatternItem { target, default },
            rest: rest.is_some(),
        });
    let params = param
        .separated_by(comma.clone())
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(bracket_round_open.clone(), bracket_round_close.clone())
        .boxed();

    let element = just(Token::Ellipsis)
        .ignore_then(expression.clone())
        .map(Element::Spread)
        .or(expression.clone().map(Element::Item));
    let arguments = element
        .clone()
        .separated_by(comma.clone())
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(bracket_round_open.clone(), bracket_round_close.clone())
        .boxed();

    let literal = select! {
        Token::Number(number) => Expr::Number(number),
        Token::Str(text) => Expr::Str(Name::from(unescape(text))),
        Token::True => Expr::Bool(true),
        Token::False => Expr::Bool(false),
        Token::Null => Expr::Null,
    };

    let template = select! { Token::Template(raw) => raw }.try_map(|raw: &str, span: Span| {
        parse_template(raw, span.start + 1)
            .map(Expr::Template)
            .map_err(|message| ParseError::custom(span, message))
    });

    let arrow_params = binding_name
        .clone()
        .map(|name| vec![identifier_param(name)])
        .or(params.clone());
    let arrow_body = block
        .clone()
        .map(FunctionBody::Block)
        .or(expression
            .clone()
            .map(|body| FunctionBody::Expression(boxed(body))));
    let arrow = arrow_params
        .then_ignore(just(Token::Arrow))
        .then(arrow_body)
        .map_with(|(params, body), extra| {
            Expr::Function(Rc::new(FunctionDef {
                name: None,
                params,
                body,
                span: extra.span(),
            }))
        });

    let function_expression = just(Token::Function)
        .ignore_then(identifier.clone().or_not())
        .then(params.clone())
        .then(block.clone())
        .map_with(|((name, params), body), extra| {
            Expr::Function(Rc::new(FunctionDef {
                name,
                params,
                body: FunctionBody::Block(body),
                span: extra.span(),
            }))
        });

    let array = element
        .separated_by(comma.clone())
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(bracket_square_open.clone(), bracket_square_close.clone())
        .map(Expr::Array);

    let property_key = choice((
        property_name.clone().map(PropertyKey::Static),
        select! {
            Token::Str(text) => Name::from(unescape(text)),
            Token::Number(number) => Name::from(number.to_string()),
        }
        .map(PropertyKey::Static),
        expression
            .clone()
            .delimited_by(bracket_square_open.clone(), bracket_square_close.clone())
            .map(PropertyKey::Computed),
    ));
    let method = property_key
        .clone()
        .then(params.clone())
        .then(block.clone())
        .map_with(|((key, params), body), extra| {
            let name = match &key {
                PropertyKey::Static(name) => Some(name.clone()),
                PropertyKey::Computed(_) => None,
            };
            let function = Rc::new(FunctionDef {
                name,
                params,
                body: FunctionBody::Block(body),
                span: extra.span(),
            });
            ObjectEntry::Property {
                key,
                value: Spanned {
                    node: Expr::Function(function),
                    span: extra.span(),
                },
            }
        });
    let object_entry = choice((
        just(Token::Ellipsis)
            .ignore_then(expression.clone())
            .map(ObjectEntry::Spread),
        method,
        property_key
            .then_ignore(just(Token::Colon))
            .then(expression.clone())
            .map(|(key, value)| ObjectEntry::Property { key, value }),
        binding_name.clone().map(ObjectEntry::Shorthand),
    ));
    let object = object_entry
        .separated_by(comma.clone())
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(bracket_curly_open.clone(), bracket_curly_close.clone())
        .map(Expr::Object);

    let primary = choice((
        literal,
        template,
        arrow,
        function_expression,
        identifier.clone().map(Expr::Identifier),
        array,
        object,
    ))
    .map_with(|expression, extra| Spanned {
        node: expression,
        span: extra.span(),
    })
    .or(expression
        .clone()
        .delimited_by(bracket_round_open.clone(), bracket_round_close.clone()))
    .boxed();

    let index = expression
        .clone()
        .delimited_by(bracket_square_open.clone(), bracket_square_close.clone());
    let postfix = choice((
        just(Token::Dot)
            .ignore_then(property_name.clone())
            .map(|name| Postfix::Member(name, false)),
        just(Token::QuestionDot)
            .ignore_then(property_name)
            .map(|name| Postfix::Member(name, true)),
        just(Token::QuestionDot)
            .ignore_then(index.clone())
            .map(|index| Postfix::Index(index, true)),
        just(Token::QuestionDot)
            .ignore_then(arguments.clone())
            .map(|arguments| Postfix::Call(arguments, true)),
        index.map(|index| Postfix::Index(index, false)),
        arguments.map(|arguments| Postfix::Call(arguments, false)),
        just(Token::PlusPlus).to(Postfix::Update(UpdateOp::Increment)),
        just(Token::MinusMinus).to(Postfix::Update(UpdateOp::Decrement)),
    ));
    let call_chain = primary
        .foldl_with(postfix.repeated(), |object, postfix, extra| {
            let object = boxed(object);
            let node = match postfix {
                Postfix::Member(property, optional) => Expr::Member {
                    object,
                    property,
                    optional,
                },
                Postfix::Index(index, optional) => Expr::Index {
                    object,
                    index: boxed(index),
                    optional,
                },
                Postfix::Call(arguments, optional) => Expr::Call {
                    callee: object,
                    arguments,
                    optional,
                },
                Postfix::Update(op) => Expr::Update {
                    op,
                    prefix: false,
                    target: object,
                },
            };
            Spanned {
                node,
                span: extra.span(),
            }
        })
        .boxed();

    let operators = call_chain
        .pratt((
            prefix(
                15,
                select! {
                    Token::Not => UnaryOp::Not,
                    Token::Minus => UnaryOp::Negate,
                    Token::Plus => UnaryOp::Plus,
                    Token::Typeof => UnaryOp::Typeof,
                },
                |op, operand, extra| Spanned {
                    span: extra.span(),
                    node: Expr::Unary {
                        op,
                        operand: boxed(operand),
                    },
                },
            ),
            prefix(
                15,
                select! {
                    Token::PlusPlus => UpdateOp::Increment,
                    Token::MinusMinus => UpdateOp::Decrement,
                },
                |op, target, extra| Spanned {
                    span: extra.span(),
                    node: Expr::Update {
                        op,
                        prefix: true,
                        target: boxed(target),
                    },
                },
            ),
            // `new X(..)` evaluates as the plain call `X(..)`.
            prefix(15, just(Token::New), |_, operand, _| operand),
            infix(
                right(14),
                just(Token::DoubleAsterisk).to(BinaryOp::Power),
                |l, op, r, extra| binary(op, l, r, extra.span()),
            ),
            infix(
                left(13),
                select! {
                    Token::Asterisk => BinaryOp::Multiply,
                    Token::Slash => BinaryOp::Divide,
                    Token::Percent => BinaryOp::Remainder,
                },
                |l, op, r, extra| binary(op, l, r, extra.span()),
            ),
            infix(
                left(12),
                select! {
                    Token::Plus => BinaryOp::Add,
                    Token::Minus => BinaryOp::Subtract,
                },
                |l, op, r, extra| binary(op, l, r, extra.span()),
            ),
            infix(
                left(10),
                select! {
                    Token::Less => BinaryOp::Less,
                    Token::LessOrEqual => BinaryOp::LessOrEqual,
                    Token::Greater => BinaryOp::Greater,
                    Token::GreaterOrEqual => BinaryOp::GreaterOrEqual,
                },
                |l, op, r, extra| binary(op, l, r, extra.span()),
            ),
            infix(
                left(9),
                select! {
                    Token::StrictEqual => BinaryOp::StrictEqual,
                    Token::StrictNotEqual => BinaryOp::StrictNotEqual,
                    Token::Equal => BinaryOp::Equal,
                    Token::NotEqual => BinaryOp::NotEqual,
                },
                |l, op, r, extra| binary(op, l, r, extra.span()),
            ),
            infix(
                left(5),
                just(Token::And).to(LogicalOp::And),
                |l, op, r, extra| logical(op, l, r, extra.span()),
            ),
            infix(
                left(4),
                just(Token::Or).to(LogicalOp::Or),
                |l, op, r, extra| logical(op, l, r, extra.span()),
            ),
            infix(
                left(3),
                just(Token::Nullish).to(LogicalOp::Nullish),
                |l, op, r, extra| logical(op, l, r, extra.span()),
            ),
        ))
        .boxed();

    let conditional = operators
        .then(
            just(Token::Question)
                .ignore_then(expression.clone())
                .then_ignore(just(Token::Colon))
                .then(expression.clone())
                .or_not(),
        )
        .map_with(|(test, branches), extra| match branches {
            None => test,
            Some((consequent, alternate)) => Spanned {
                span: extra.span(),
                node: Expr::Conditional {
                    test: boxed(test),
                    consequent: boxed(consequent),
                    alternate: boxed(alternate),
                },
            },
        });

    let assign_op = select! {
        Token::Assign => AssignOp::Assign,
        Token::PlusAssign => AssignOp::Add,
        Token::MinusAssign => AssignOp::Subtract,
        Token::AsteriskAssign => AssignOp::Multiply,
        Token::SlashAssign => AssignOp::Divide,
        Token::PercentAssign => AssignOp::Remainder,
        Token::NullishAssign => AssignOp::Nullish,
        Token::OrAssign => AssignOp::Or,
        Token::AndAssign => AssignOp::And,
    };
    let assignment = conditional
        .then(assign_op.then(expression.clone()).or_not())
        .map_with(|(target, assignment), extra| match assignment {
            None => target,
            Some((op, value)) => Spanned {
                span: extra.span(),
                node: Expr::Assign {
                    op,
                    target: boxed(target),
                    value: boxed(value),
                },
            },
        });
    expression.define(assignment);

    let declare_kind = select! {
        Token::Let => DeclareKind::Let,
        Token::Const => DeclareKind::Const,
        Token::Var => DeclareKind::Var,
    };
    let declaration = declare_kind
        .clone()
        .then(
            pattern
                .clone()
                .then(just(Token::Assign).ignore_then(expression.clone()).or_not())
                .map(|(target, init)| Declarator { target, init })
                .separated_by(comma.clone())
                .at_least(1)
                .collect::<Vec<_>>(),
        )
        .map(|(kind, declarators)| Stmt::Declare { kind, declarators })
        .boxed();

    let function_declaration = just(Token::Function)
        .ignore_then(identifier)
        .then(params)
        .then(block.clone())
        .map_with(|((name, params), body), extra| {
            Stmt::Function(Rc::new(FunctionDef {
                name: Some(name),
                params,
                body: FunctionBody::Block(body),
                span: extra.span(),
            }))
        });

    let condition = expression
        .clone()
        .delimited_by(bracket_round_open.clone(), bracket_round_close.clone());

    let if_ = just(Token::If)
        .ignore_then(condition.clone())
        .then(statement.clone())
        .then(just(Token::Else).ignore_then(statement.clone()).or_not())
        .map(|((test, consequent), alternate)| Stmt::If {
            test,
            consequent: Box::new(consequent),
            alternate: alternate.map(Box::new),
        });

    let of = select! { Token::Identifier("of") => () };
    let for_of = just(Token::For)
        .ignore_then(
            declare_kind
                .or_not()
                .then(pattern.clone())
                .then_ignore(of)
                .then(expression.clone())
                .delimited_by(bracket_round_open.clone(), bracket_round_close.clone()),
        )
        .then(statement.clone())
        .map(|(((kind, target), iterable), body)| Stmt::ForOf {
            kind,
            target,
            iterable,
            body: Box::new(body),
        });

    let for_init = declaration
        .clone()
        .or(expression.clone().map(Stmt::Expression))
        .map_with(|node, extra| Spanned {
            node,
            span: extra.span(),
        });
    let for_classic = just(Token::For)
        .ignore_then(
            for_init
                .or_not()
                .then_ignore(just(Token::Semicolon))
                .then(expression.clone().or_not())
                .then_ignore(just(Token::Semicolon))
                .then(expression.clone().or_not())
                .delimited_by(bracket_round_open.clone(), bracket_round_close.clone()),
        )
        .then(statement.clone())
        .map(|(((init, test), update), body)| Stmt::For {
            init: init.map(Box::new),
            test,
            update,
            body: Box::new(body),
        });

    let while_ = just(Token::While)
        .ignore_then(condition)
        .then(statement.clone())
        .map(|(test, body)| Stmt::While {
            test,
            body: Box::new(body),
        });

    let catch = just(Token::Catch)
        .ignore_then(
            pattern
                .delimited_by(bracket_round_open.clone(), bracket_round_close.clone())
                .or_not(),
        )
        .then(block.clone())
        .map(|(param, body)| CatchClause { param, body });
    let try_ = just(Token::Try)
        .ignore_then(block.clone())
        .then(catch.or_not())
        .then(just(Token::Finally).ignore_then(block.clone()).or_not())
        .map(|((block, handler), finalizer)| Stmt::Try {
            block,
            handler,
            finalizer,
        });

    let simple = choice((
        just(Token::Return)
            .ignore_then(expression.clone().or_not())
            .map(Stmt::Return),
        just(Token::Throw)
            .ignore_then(expression.clone())
            .map(Stmt::Throw),
        just(Token::Break).to(Stmt::Break),
        just(Token::Continue).to(Stmt::Continue),
        just(Token::Semicolon).to(Stmt::Empty),
    ));

    statement.define(
        choice((
            block.map(Stmt::Block),
            declaration,
            function_declaration,
            if_,
            for_of,
            for_classic,
            while_,
            try_,
            simple,
            expression.map(Stmt::Expression),
        ))
        .map_with(|node, extra| Spanned {
            node,
            span: extra.span(),
        })
        .then_ignore(just(Token::Semicolon).or_not()),
    );

    statement.repeated().collect()
}

fn shift(span: Span, offset: usize) -> Span {
    Span::from((span.start + offset)..(span.end + offset))
}

/// Lexes and parses `source`; spans are shifted by `offset` so nested
/// sources (template parts) report positions in the outer formula.
pub(crate) fn parse_at(source: &str, offset: usize) -> Result<Vec<Spanned<Stmt>>, Vec<Diagnostic>> {
    let (tokens, errors) = lexer().parse(source).into_output_errors();
    let diagnostics: Vec<Diagnostic> = errors
        .iter()
        .map(|error| Diagnostic::from_error(error, offset))
        .collect();
    let Some(mut tokens) = tokens else {
        return Err(diagnostics);
    };
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    tokens.retain(|spanned_token| !matches!(spanned_token.node, Token::Comment(_)));
    for token in &mut tokens {
        token.span = shift(token.span, offset);
    }

    let end = offset + source.len();
    let (statements, errors) = parser()
        .parse(
            tokens
                .as_slice()
                .map(Span::from(end..end), |Spanned { node, span }| (node, span)),
        )
        .into_output_errors();
    let diagnostics: Vec<Diagnostic> = errors
        .iter()
        .map(|error| Diagnostic::from_error(error, 0))
        .collect();
    match statements {
        Some(statements) if diagnostics.is_empty() => Ok(statements),
        _ => Err(diagnostics),
    }
}

pub fn parse(source: &str) -> Result<Vec<Spanned<Stmt>>, Vec<Diagnostic>> {
    parse_at(source, 0)
}

fn parse_expression_at(source: &str, offset: usize) -> Result<Spanned<Expr>, String> {
    let mut statements = parse_at(source, offset).map_err(|diagnostics| {
        diagnostics
            .iter()
            .map(|diagnostic| diagnostic.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    })?;
    statements.retain(|statement| !matches!(statement.node, Stmt::Empty));
    match statements.pop() {
        Some(Spanned {
            node: Stmt::Expression(expression),
            ..
        }) if statements.is_empty() => Ok(expression),
        _ => Err("template placeholder must contain exactly one expression".to_owned()),
    }
}

/// Splits a raw template body into text chunks and `${..}` expressions.
fn parse_template(raw: &str, offset: usize) -> Result<Vec<TemplatePart>, String> {
    let bytes = raw.as_bytes();
    let mut parts = Vec::new();
    let mut chunk_start = 0;
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'\\' => index += 2,
            b'$' if bytes.get(index + 1) == Some(&b'{') => {
                if index > chunk_start {
                    parts.push(TemplatePart::Text(Name::from(unescape(
                        &raw[chunk_start..index],
                    ))));
                }
                let start = index + 2;
                let mut depth = 1;
                let mut end = start;
                while end < bytes.len() {
                    match bytes[end] {
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    end += 1;
                }
                if depth != 0 {
                    return Err("unterminated `${` in template literal".to_owned());
                }
                let expression = parse_expression_at(&raw[start..end], offset + start)?;
                parts.push(TemplatePart::Expression(expression));
                index = end + 1;
                chunk_start = index;
            }
            _ => index += 1,
        }
    }
    if chunk_start < raw.len() {
        parts.push(TemplatePart::Text(Name::from(unescape(&raw[chunk_start..]))));
    }
    Ok(parts)
}
