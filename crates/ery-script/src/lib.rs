//! Parser and evaluator for the JavaScript expression subset emitted by Ery conditions.
//!
//! Supports literals, identifiers with `.member` access, `!`/unary `-`, arithmetic,
//! relational and equality operators, `^`, and short-circuiting `&&`/`||`, with
//! JavaScript coercion rules.
//!
//! # Example
//! ```
//! use ery_script::{evaluate, Scope, ScriptValue};
//!
//! let scope: Scope = [("age", ScriptValue::Number(21.0))].into_iter().collect();
//! let value = evaluate("is_adult", "(age) >= (18)", &scope).unwrap();
//! assert_eq!(value, ScriptValue::Bool(true));
//! ```

pub mod ast;
mod eval;
mod parser;
pub mod value;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use eval::{loose_equals, strict_equals, Evaluator, Scope};
pub use parser::{parse, MAX_NESTING};
pub use value::ScriptValue;

use ery_types::Result;

/// Parse and evaluate `source` against `scope`. `label` names the evaluation in errors.
pub fn evaluate(label: &str, source: &str, scope: &Scope) -> Result<ScriptValue> {
    let expr = parse(source)?;
    evaluate_expr(label, &expr, scope)
}

/// Evaluate an already parsed expression.
pub fn evaluate_expr(label: &str, expr: &Expr, scope: &Scope) -> Result<ScriptValue> {
    Evaluator::new(label, scope).eval(expr)
}

/// Parse and evaluate `source`, returning the truthiness of the result.
pub fn evaluate_bool(label: &str, source: &str, scope: &Scope) -> Result<bool> {
    Ok(evaluate(label, source, scope)?.is_truthy())
}
