use super::{ParseError, Spanned};
use chumsky::prelude::*;
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<'src> {
    BracketRoundOpen,
    BracketRoundClose,
    BracketCurlyOpen,
    BracketCurlyClose,
    BracketSquareOpen,
    BracketSquareClose,
    Comment(&'src str),
    Number(f64),
    // Raw contents between the quotes, escapes not yet processed.
    Str(&'src str),
    // Raw contents between the backticks, `${..}` parts included.
    Template(&'src str),
    Identifier(&'src str),
    Comma,
    Semicolon,
    Colon,
    Dot,
    Ellipsis,
    Question,
    QuestionDot,
    Arrow,
    Assign,
    PlusAssign,
    MinusAssign,
    AsteriskAssign,
    SlashAssign,
    PercentAssign,
    NullishAssign,
    OrAssign,
    AndAssign,
    StrictEqual,
    StrictNotEqual,
    Equal,
    NotEqual,
    LessOrEqual,
    Less,
    GreaterOrEqual,
    Greater,
    And,
    Or,
    Nullish,
    Not,
    PlusPlus,
    MinusMinus,
    Plus,
    Minus,
    DoubleAsterisk,
    Asterisk,
    Slash,
    Percent,
    Let,
    Const,
    Var,
    Function,
    Return,
    If,
    Else,
    For,
    While,
    Break,
    Continue,
    Throw,
    Try,
    Catch,
    Finally,
    New,
    Typeof,
    True,
    False,
    Null,
}

impl<'src> Token<'src> {
    pub fn into_cow_str(self) -> Cow<'src, str> {
        match self {
            Self::BracketRoundOpen => "(".into(),
            Self::BracketRoundClose => ")".into(),
            Self::BracketCurlyOpen => "{".into(),
            Self::BracketCurlyClose => "}".into(),
            Self::BracketSquareOpen => "[".into(),
            Self::BracketSquareClose => "]".into(),
            Self::Comment(comment) => comment.into(),
            Self::Number(number) => number.to_string().into(),
            Self::Str(text) => format!("'{text}'").into(),
            Self::Template(text) => format!("`{text}`").into(),
            Self::Identifier(identifier) => identifier.into(),
            Self::Comma => ",".into(),
            Self::Semicolon => ";".into(),
            Self::Colon => ":".into(),
            Self::Dot => ".".into(),
            Self::Ellipsis => "...".into(),
            Self::Question => "?".into(),
            Self::QuestionDot => "?.".into(),
            Self::Arrow => "=>".into(),
            Self::Assign => "=".into(),
            Self::PlusAssign => "+=".into(),
            Self::MinusAssign => "-=".into(),
            Self::AsteriskAssign => "*=".into(),
            Self::SlashAssign => "/=".into(),
            Self::PercentAssign => "%=".into(),
            Self::NullishAssign => "??=".into(),
            Self::OrAssign => "||=".into(),
            Self::AndAssign => "&&=".into(),
            Self::StrictEqual => "===".into(),
            Self::StrictNotEqual => "!==".into(),
            Self::Equal => "==".into(),
            Self::NotEqual => "!=".into(),
            Self::LessOrEqual => "<=".into(),
            Self::Less => "<".into(),
            Self::GreaterOrEqual => ">=".into(),
            Self::Greater => ">".into(),
            Self::And => "&&".into(),
            Self::Or => "||".into(),
            Self::Nullish => "??".into(),
            Self::Not => "!".into(),
            Self::PlusPlus => "++".into(),
            Self::MinusMinus => "--".into(),
            Self::Plus => "+".into(),
            Self::Minus => "-".into(),
            Self::DoubleAsterisk => "**".into(),
            Self::Asterisk => "*".into(),
            Self::Slash => "/".into(),
            Self::Percent => "%".into(),
            other => other.keyword().unwrap_or_default().into(),
        }
    }

    /// Keyword tokens are still valid property names (`promise.catch(..)`).
    pub fn keyword(self) -> Option<&'static str> {
        Some(match self {
            Self::Let => "let",
            Self::Const => "const",
            Self::Var => "var",
            Self::Function => "function",
            Self::Return => "return",
            Self::If => "if",
            Self::Else => "else",
            Self::For => "for",
            Self::While => "while",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Throw => "throw",
            Self::Try => "try",
            Self::Catch => "catch",
            Self::Finally => "finally",
            Self::New => "new",
            Self::Typeof => "typeof",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            _ => return None,
        })
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.into_cow_str())
    }
}

fn keyword_or_identifier(identifier: &str) -> Token<'_> {
    match identifier {
        "let" => Token::Let,
        "const" => Token::Const,
        "var" => Token::Var,
        "function" => Token::Function,
        "return" => Token::Return,
        "if" => Token::If,
        "else" => Token::Else,
        "for" => Token::For,
        "while" => Token::While,
        "break" => Token::Break,
        "continue" => Token::Continue,
        "throw" => Token::Throw,
        "try" => Token::Try,
        "catch" => Token::Catch,
        "finally" => Token::Finally,
        "new" => Token::New,
        "typeof" => Token::Typeof,
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        _ => Token::Identifier(identifier),
    }
}

pub fn lexer<'src>()
-> impl Parser<'src, &'src str, Vec<Spanned<Token<'src>>>, extra::Err<ParseError<'src, char>>> {
    let bracket = choice((
        just('(').to(Token::BracketRoundOpen),
        just(')').to(Token::BracketRoundClose),
        just('{').to(Token::BracketCurlyOpen),
        just('}').to(Token::BracketCurlyClose),
        just('[').to(Token::BracketSquareOpen),
        just(']').to(Token::BracketSquareClose),
    ));

    let line_comment = just("//")
        .then(any().and_is(text::newline().not()).repeated())
        .to_slice();
    let block_comment = just("/*")
        .then(any().and_is(just("*/").not()).repeated())
        .then(just("*/"))
        .to_slice();
    let comment = line_comment.or(block_comment).map(Token::Comment);

    let exponent = one_of("eE")
        .then(one_of("+-").or_not())
        .then(text::digits(10));
    let number = text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .then(exponent.or_not())
        .to_slice()
        .try_map(|number: &str, span| {
            number
                .parse::<f64>()
                .map(Token::Number)
                .map_err(|error| ParseError::custom(span, format!("Invalid number '{number}': {error}")))
        });

    let escape = just('\\').then(any()).ignored();
    let double_quoted = just('"')
        .ignore_then(escape.clone().or(none_of("\\\"\n").ignored()).repeated().to_slice())
        .then_ignore(just('"'));
    let single_quoted = just('\'')
        .ignore_then(escape.clone().or(none_of("\\'\n").ignored()).repeated().to_slice())
        .then_ignore(just('\''));
    let text = double_quoted.or(single_quoted).map(Token::Str);

    // `${ .. }` may nest braces (object literals, blocks of arrow bodies).
    let balanced = recursive(|balanced| {
        choice((
            just('{').then(balanced).then(just('}')).ignored(),
            none_of("{}").ignored(),
        ))
        .repeated()
    });
    let template = just('`')
        .ignore_then(
            choice((
                escape,
                just("${").then(balanced).then(just('}')).ignored(),
                none_of("`\\").ignored(),
            ))
            .repeated()
            .to_slice(),
        )
        .then_ignore(just('`'))
        .map(Token::Template);

    let identifier = any()
        .filter(|character: &char| {
            character.is_ascii_alphabetic() || *character == '_' || *character == '$'
        })
        .then(
            any()
                .filter(|character: &char| {
                    character.is_ascii_alphanumeric() || *character == '_' || *character == '$'
                })
                .repeated(),
        )
        .to_slice()
        .map(keyword_or_identifier);

    // Longest operators first.
    let operator = choice((
        just("...").to(Token::Ellipsis),
        just("===").to(Token::StrictEqual),
        just("!==").to(Token::StrictNotEqual),
        just("??=").to(Token::NullishAssign),
        just("||=").to(Token::OrAssign),
        just("&&=").to(Token::AndAssign),
        just("=>").to(Token::Arrow),
        just("==").to(Token::Equal),
        just("!=").to(Token::NotEqual),
        just("<=").to(Token::LessOrEqual),
        just(">=").to(Token::GreaterOrEqual),
        just("&&").to(Token::And),
        just("||").to(Token::Or),
        just("??").to(Token::Nullish),
        just("?.").to(Token::QuestionDot),
        just("++").to(Token::PlusPlus),
        just("--").to(Token::MinusMinus),
        just("+=").to(Token::PlusAssign),
        just("-=").to(Token::MinusAssign),
        just("**").to(Token::DoubleAsterisk),
    ))
    .or(choice((
        just("*=").to(Token::AsteriskAssign),
        just("/=").to(Token::SlashAssign),
        just("%=").to(Token::PercentAssign),
        just('=').to(Token::Assign),
        just('<').to(Token::Less),
        just('>').to(Token::Greater),
        just('!').to(Token::Not),
        just('?').to(Token::Question),
        just('+').to(Token::Plus),
        just('-').to(Token::Minus),
        just('*').to(Token::Asterisk),
        just('/').to(Token::Slash),
        just('%').to(Token::Percent),
        just(',').to(Token::Comma),
        just(';').to(Token::Semicolon),
        just(':').to(Token::Colon),
        just('.').to(Token::Dot),
    )));

    let token = choice((bracket, comment, number, text, template, identifier, operator));

    token
        .map_with(|token, extra| Spanned {
            node: token,
            span: extra.span(),
        })
        .padded()
        .recover_with(skip_then_retry_until(any().ignored(), end()))
        .repeated()
        .collect()
        .padded()
}

/// Processes the escape sequences of a string or template chunk.
pub fn unescape(raw: &str) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut characters = raw.chars();
    while let Some(character) = characters.next() {
        if character != '\\' {
            text.push(character);
            continue;
        }
        match characters.next() {
            Some('n') => text.push('\n'),
            Some('t') => text.push('\t'),
            Some('r') => text.push('\r'),
            Some('0') => text.push('\0'),
            Some('u') => {
                let code: String = characters.by_ref().take(4).collect();
                match u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => text.push(decoded),
                    None => {
                        text.push_str("\\u");
                        text.push_str(&code);
                    }
                }
            }
            Some(other) => text.push(other),
            None => text.push('\\'),
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token<'_>> {
        lexer()
            .parse(source)
            .into_output()
            .unwrap()
            .into_iter()
            .map(|token| token.node)
            .collect()
    }

    #[test]
    fn module_exports_assignment() {
        assert_eq!(
            tokens("module.exports = 'Count: ' + count.get()"),
            vec![
                Token::Identifier("module"),
                Token::Dot,
                Token::Identifier("exports"),
                Token::Assign,
                Token::Str("Count: "),
                Token::Plus,
                Token::Identifier("count"),
                Token::Dot,
                Token::Identifier("get"),
                Token::BracketRoundOpen,
                Token::BracketRoundClose,
            ]
        );
    }

    #[test]
    fn longest_operator_wins() {
        assert_eq!(
            tokens("a === b ?? c?.d => ...e"),
            vec![
                Token::Identifier("a"),
                Token::StrictEqual,
                Token::Identifier("b"),
                Token::Nullish,
                Token::Identifier("c"),
                Token::QuestionDot,
                Token::Identifier("d"),
                Token::Arrow,
                Token::Ellipsis,
                Token::Identifier("e"),
            ]
        );
    }

    #[test]
    fn comments_numbers_and_templates() {
        assert_eq!(
            tokens("// note\nlet x = 1.5e2 /* inline */ `a ${ {b: 1}.b } c`"),
            vec![
                Token::Comment("// note"),
                Token::Let,
                Token::Identifier("x"),
                Token::Assign,
                Token::Number(150.0),
                Token::Comment("/* inline */"),
                Token::Template("a ${ {b: 1}.b } c"),
            ]
        );
    }

    #[test]
    fn whitespace_only_source_has_no_tokens() {
        assert!(tokens("  \n\t ").is_empty());
    }

    #[test]
    fn unescape_sequences() {
        assert_eq!(unescape(r"a\nb\'c\u0041"), "a\nb'cA");
    }
}
