use winnow::ascii::{digit0, digit1, multispace0};
use winnow::combinator::{alt, cut_err, fail, opt, preceded, repeat};
use winnow::error::{StrContext, StrContextValue};
use winnow::stream::Stateful;
use winnow::token::{literal, one_of, take_while};
use winnow::{ModalResult, Parser};

use ery_types::EryError;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::value::ScriptValue;

/// Deepest run of parentheses and unary operators accepted in one expression.
pub const MAX_NESTING: usize = 128;

/// Source text plus the current nesting depth.
type Input<'i> = Stateful<&'i str, usize>;

/// Whitespace consumer (including newlines).
fn ws<'i>(input: &mut Input<'i>) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse an identifier: [A-Za-z_$][A-Za-z0-9_$]*
fn identifier<'i>(input: &mut Input<'i>) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_' || c == '$'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$'),
    )
        .take()
        .parse_next(input)
}

/// Parse a number: `12`, `1.5`, `.5`, `2e3`.
fn number(input: &mut Input<'_>) -> ModalResult<f64> {
    let exponent = (one_of(['e', 'E']), opt(one_of(['+', '-'])), digit1);
    let s: &str = alt((
        (digit1, opt(('.', digit0)), opt(exponent)).take(),
        ('.', digit1).take(),
    ))
    .parse_next(input)?;
    s.parse()
        .map_err(|_| winnow::error::ErrMode::Backtrack(winnow::error::ContextError::new()))
}

/// Parse a single- or double-quoted string with escape support.
fn string_literal(input: &mut Input<'_>) -> ModalResult<String> {
    let quote = one_of(['"', '\'']).parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = winnow::token::any
            .context(StrContext::Expected(StrContextValue::Description(
                "closing quote",
            )))
            .parse_next(input)?;
        if c == quote {
            break;
        }
        if c == '\\' {
            let esc = winnow::token::any.parse_next(input)?;
            match esc {
                'n' => s.push('\n'),
                't' => s.push('\t'),
                'r' => s.push('\r'),
                '0' => s.push('\0'),
                other => s.push(other),
            }
        } else {
            s.push(c);
        }
    }
    Ok(s)
}

/// Identifier with optional `.member` chain, or one of the literal keywords.
fn identifier_or_keyword(input: &mut Input<'_>) -> ModalResult<Expr> {
    let root = identifier.parse_next(input)?;
    match root {
        "true" => return Ok(Expr::Literal(ScriptValue::Bool(true))),
        "false" => return Ok(Expr::Literal(ScriptValue::Bool(false))),
        "null" => return Ok(Expr::Literal(ScriptValue::Null)),
        "undefined" => return Ok(Expr::Literal(ScriptValue::Undefined)),
        _ => {}
    }
    let path: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    Ok(Expr::Ident {
        root: root.to_string(),
        path: path.into_iter().map(String::from).collect(),
    })
}

/// Run `inner` one nesting level deeper, failing hard once `MAX_NESTING` is reached.
fn nested(input: &mut Input<'_>, inner: Level) -> ModalResult<Expr> {
    if input.state >= MAX_NESTING {
        return cut_err(fail::<_, Expr, _>.context(StrContext::Label("expression nested too deeply")))
            .parse_next(input);
    }
    input.state += 1;
    let result = inner(input);
    input.state -= 1;
    result
}

fn parenthesized(input: &mut Input<'_>) -> ModalResult<Expr> {
    let _ = '('.parse_next(input)?;
    let inner = nested(input, expression)?;
    let _ = ws.parse_next(input)?;
    let _ = ')'
        .context(StrContext::Expected(StrContextValue::CharLiteral(')')))
        .parse_next(input)?;
    Ok(inner)
}

fn primary(input: &mut Input<'_>) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    alt((
        number.map(|n| Expr::Literal(ScriptValue::Number(n))),
        string_literal.map(|s| Expr::Literal(ScriptValue::String(s))),
        parenthesized,
        identifier_or_keyword,
    ))
    .context(StrContext::Expected(StrContextValue::Description(
        "operand",
    )))
    .parse_next(input)
}

fn unary(input: &mut Input<'_>) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    if opt('!').parse_next(input)?.is_some() {
        let operand = nested(input, unary)?;
        return Ok(Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        });
    }
    if opt('-').parse_next(input)?.is_some() {
        let operand = nested(input, unary)?;
        // Fold negative numeric literals.
        if let Expr::Literal(ScriptValue::Number(n)) = operand {
            return Ok(Expr::Literal(ScriptValue::Number(-n)));
        }
        return Ok(Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(operand),
        });
    }
    primary.parse_next(input)
}

// ---------------------------------------------------------------------------
// Binary precedence levels
// ---------------------------------------------------------------------------

type Level = fn(&mut Input<'_>) -> ModalResult<Expr>;
type OpParser = fn(&mut Input<'_>) -> ModalResult<BinaryOp>;

/// Left-associative chain: `next (op next)*`.
fn binary_level(input: &mut Input<'_>, next: Level, op: OpParser) -> ModalResult<Expr> {
    let mut left = next(input)?;
    loop {
        let _ = ws.parse_next(input)?;
        match opt(op).parse_next(input)? {
            Some(op) => {
                let right = next(input)?;
                left = Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            None => return Ok(left),
        }
    }
}

fn or_op(input: &mut Input<'_>) -> ModalResult<BinaryOp> {
    literal("||").value(BinaryOp::Or).parse_next(input)
}

fn and_op(input: &mut Input<'_>) -> ModalResult<BinaryOp> {
    literal("&&").value(BinaryOp::And).parse_next(input)
}

fn xor_op(input: &mut Input<'_>) -> ModalResult<BinaryOp> {
    '^'.value(BinaryOp::Xor).parse_next(input)
}

fn equality_op(input: &mut Input<'_>) -> ModalResult<BinaryOp> {
    alt((
        literal("===").value(BinaryOp::StrictEq),
        literal("!==").value(BinaryOp::StrictNotEq),
        literal("==").value(BinaryOp::Eq),
        literal("!=").value(BinaryOp::NotEq),
    ))
    .parse_next(input)
}

fn relational_op(input: &mut Input<'_>) -> ModalResult<BinaryOp> {
    alt((
        literal("<=").value(BinaryOp::LtEq),
        literal(">=").value(BinaryOp::GtEq),
        '<'.value(BinaryOp::Lt),
        '>'.value(BinaryOp::Gt),
    ))
    .parse_next(input)
}

fn additive_op(input: &mut Input<'_>) -> ModalResult<BinaryOp> {
    alt(('+'.value(BinaryOp::Add), '-'.value(BinaryOp::Sub))).parse_next(input)
}

fn multiplicative_op(input: &mut Input<'_>) -> ModalResult<BinaryOp> {
    alt((
        '*'.value(BinaryOp::Mul),
        '/'.value(BinaryOp::Div),
        '%'.value(BinaryOp::Rem),
    ))
    .parse_next(input)
}

fn multiplicative(input: &mut Input<'_>) -> ModalResult<Expr> {
    binary_level(input, unary, multiplicative_op)
}

fn additive(input: &mut Input<'_>) -> ModalResult<Expr> {
    binary_level(input, multiplicative, additive_op)
}

fn relational(input: &mut Input<'_>) -> ModalResult<Expr> {
    binary_level(input, additive, relational_op)
}

fn equality(input: &mut Input<'_>) -> ModalResult<Expr> {
    binary_level(input, relational, equality_op)
}

fn xor(input: &mut Input<'_>) -> ModalResult<Expr> {
    binary_level(input, equality, xor_op)
}

fn and(input: &mut Input<'_>) -> ModalResult<Expr> {
    binary_level(input, xor, and_op)
}

fn expression(input: &mut Input<'_>) -> ModalResult<Expr> {
    binary_level(input, and, or_op)
}

/// Public entry point.
pub fn parse(input: &str) -> std::result::Result<Expr, EryError> {
    let mut remaining = Stateful { input, state: 0usize };

    let expr = expression.parse_next(&mut remaining).map_err(|e| {
        EryError::ScriptParse {
            offset: input.len() - remaining.input.len(),
            message: format!("{}", e),
        }
    })?;

    let trailing = remaining.input.trim_start();
    if !trailing.is_empty() {
        let snippet = trailing.chars().take(20).collect::<String>();
        return Err(EryError::ScriptParse {
            offset: input.len() - trailing.len(),
            message: format!("unexpected input '{}'", snippet),
        });
    }

    tracing::trace!(source = input, "parsed expression");
    Ok(expr)
}
