use std::cmp::Ordering;
use std::collections::BTreeMap;

use ery_types::{EryError, Result};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::value::ScriptValue;

/// Variable bindings visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    bindings: BTreeMap<String, ScriptValue>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ScriptValue>) {
        self.bindings.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ScriptValue> {
        self.bindings.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }
}

impl<K: Into<String>, V: Into<ScriptValue>> FromIterator<(K, V)> for Scope {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut scope = Scope::new();
        for (k, v) in iter {
            scope.insert(k, v);
        }
        scope
    }
}

/// Tree-walking evaluator. `label` names the evaluation in error messages.
pub struct Evaluator<'a> {
    label: &'a str,
    scope: &'a Scope,
}

impl<'a> Evaluator<'a> {
    pub fn new(label: &'a str, scope: &'a Scope) -> Self {
        Self { label, scope }
    }

    fn error(&self, message: impl Into<String>) -> EryError {
        EryError::ScriptEval {
            label: self.label.to_string(),
            message: message.into(),
        }
    }

    fn member_error(&self, base: &str, member: &str) -> EryError {
        self.error(format!(
            "Cannot read properties of {} (reading '{}')",
            base, member
        ))
    }

    pub fn eval(&self, expr: &Expr) -> Result<ScriptValue> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident { root, path } => self.lookup(root, path),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => ScriptValue::Bool(!value.is_truthy()),
                    UnaryOp::Neg => ScriptValue::Number(-value.to_number()),
                })
            }
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = self.eval(left)?;
                    if l.is_truthy() {
                        self.eval(right)
                    } else {
                        Ok(l)
                    }
                }
                BinaryOp::Or => {
                    let l = self.eval(left)?;
                    if l.is_truthy() {
                        Ok(l)
                    } else {
                        self.eval(right)
                    }
                }
                _ => {
                    let l = self.eval(left)?;
                    let r = self.eval(right)?;
                    Ok(apply_binary(*op, &l, &r))
                }
            },
        }
    }

    fn lookup(&self, root: &str, path: &[String]) -> Result<ScriptValue> {
        let mut current = self
            .scope
            .get(root)
            .cloned()
            .ok_or_else(|| self.error(format!("{} is not defined", root)))?;
        for member in path {
            current = match current {
                ScriptValue::Undefined => return Err(self.member_error("undefined", member)),
                ScriptValue::Null => return Err(self.member_error("null", member)),
                ScriptValue::Object(mut map) => {
                    map.remove(member).unwrap_or(ScriptValue::Undefined)
                }
                ScriptValue::Array(items) if member == "length" => {
                    ScriptValue::Number(items.len() as f64)
                }
                ScriptValue::String(s) if member == "length" => {
                    ScriptValue::Number(s.encode_utf16().count() as f64)
                }
                _ => ScriptValue::Undefined,
            };
        }
        Ok(current)
    }
}

fn apply_binary(op: BinaryOp, l: &ScriptValue, r: &ScriptValue) -> ScriptValue {
    match op {
        BinaryOp::Eq => ScriptValue::Bool(loose_equals(l, r)),
        BinaryOp::NotEq => ScriptValue::Bool(!loose_equals(l, r)),
        BinaryOp::StrictEq => ScriptValue::Bool(strict_equals(l, r)),
        BinaryOp::StrictNotEq => ScriptValue::Bool(!strict_equals(l, r)),
        BinaryOp::Lt => ScriptValue::Bool(compare(l, r) == Some(Ordering::Less)),
        BinaryOp::Gt => ScriptValue::Bool(compare(l, r) == Some(Ordering::Greater)),
        BinaryOp::LtEq => ScriptValue::Bool(matches!(
            compare(l, r),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::GtEq => ScriptValue::Bool(matches!(
            compare(l, r),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Xor => ScriptValue::Number((l.to_int32() ^ r.to_int32()) as f64),
        BinaryOp::Add => {
            let l = to_primitive(l);
            let r = to_primitive(r);
            if matches!(l, ScriptValue::String(_)) || matches!(r, ScriptValue::String(_)) {
                ScriptValue::String(format!("{}{}", l.to_js_string(), r.to_js_string()))
            } else {
                ScriptValue::Number(l.to_number() + r.to_number())
            }
        }
        BinaryOp::Sub => ScriptValue::Number(l.to_number() - r.to_number()),
        BinaryOp::Mul => ScriptValue::Number(l.to_number() * r.to_number()),
        BinaryOp::Div => ScriptValue::Number(l.to_number() / r.to_number()),
        BinaryOp::Rem => ScriptValue::Number(l.to_number() % r.to_number()),
        BinaryOp::And => {
            if l.is_truthy() {
                r.clone()
            } else {
                l.clone()
            }
        }
        BinaryOp::Or => {
            if l.is_truthy() {
                l.clone()
            } else {
                r.clone()
            }
        }
    }
}

/// Arrays and objects become their string form; primitives are unchanged.
fn to_primitive(value: &ScriptValue) -> ScriptValue {
    match value {
        ScriptValue::Array(_) | ScriptValue::Object(_) => {
            ScriptValue::String(value.to_js_string())
        }
        other => other.clone(),
    }
}

/// `===`. Compound values have no identity here, so they are never strictly equal.
pub fn strict_equals(l: &ScriptValue, r: &ScriptValue) -> bool {
    match (l, r) {
        (ScriptValue::Undefined, ScriptValue::Undefined) => true,
        (ScriptValue::Null, ScriptValue::Null) => true,
        (ScriptValue::Bool(a), ScriptValue::Bool(b)) => a == b,
        (ScriptValue::Number(a), ScriptValue::Number(b)) => a == b,
        (ScriptValue::String(a), ScriptValue::String(b)) => a == b,
        _ => false,
    }
}

/// `==` with the abstract equality coercions.
pub fn loose_equals(l: &ScriptValue, r: &ScriptValue) -> bool {
    use ScriptValue::*;
    match (l, r) {
        (Undefined | Null, Undefined | Null) => true,
        (Undefined | Null, _) | (_, Undefined | Null) => false,
        (Array(_) | Object(_), Array(_) | Object(_)) => false,
        (Bool(_), _) => loose_equals(&Number(l.to_number()), r),
        (_, Bool(_)) => loose_equals(l, &Number(r.to_number())),
        (Number(a), String(_)) => *a == r.to_number(),
        (String(_), Number(b)) => l.to_number() == *b,
        (Array(_) | Object(_), _) => loose_equals(&to_primitive(l), r),
        (_, Array(_) | Object(_)) => loose_equals(l, &to_primitive(r)),
        _ => strict_equals(l, r),
    }
}

/// Relational comparison; `None` when either side is NaN.
fn compare(l: &ScriptValue, r: &ScriptValue) -> Option<Ordering> {
    let l = to_primitive(l);
    let r = to_primitive(r);
    if let (ScriptValue::String(a), ScriptValue::String(b)) = (&l, &r) {
        return Some(a.cmp(b));
    }
    l.to_number().partial_cmp(&r.to_number())
}
