//! Conditions: binary expression trees compiled to JavaScript and evaluated by the engine.
//!
//! A condition's operands are literal expressions, variable references, or
//! references (by name) to other conditions of the same module. Compilation
//! produces `"({left}) {op} ({right})"` recursively, tracking the visiting stack
//! so self-referential sub-conditions fail instead of recursing forever.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ery_engine::{Engine, EngineContext};
use ery_types::{EryError, NotFoundKind, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Operand and comparator types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandType {
    Variable,
    SubCondition,
    Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
}

impl Relation {
    pub fn symbol(self) -> &'static str {
        match self {
            Relation::Equal => "==",
            Relation::NotEqual => "!=",
            Relation::Less => "<",
            Relation::Greater => ">",
            Relation::LessOrEqual => "<=",
            Relation::GreaterOrEqual => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOperator {
    #[serde(rename = "op_and")]
    And,
    #[serde(rename = "op_or")]
    Or,
    #[serde(rename = "op_exclusive_or")]
    ExclusiveOr,
}

impl BinaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::And => "&&",
            BinaryOperator::Or => "||",
            BinaryOperator::ExclusiveOr => "^",
        }
    }
}

/// One side of a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Raw expression text.
    Expression(String),
    /// Name of a module variable; its value is bound by the engine.
    Variable(String),
    /// Name of another condition in the same module.
    SubCondition(String),
}

impl Operand {
    pub fn operand_type(&self) -> OperandType {
        match self {
            Operand::Expression(_) => OperandType::Expression,
            Operand::Variable(_) => OperandType::Variable,
            Operand::SubCondition(_) => OperandType::SubCondition,
        }
    }

    pub fn sub_condition(&self) -> Option<&str> {
        match self {
            Operand::SubCondition(name) => Some(name),
            _ => None,
        }
    }
}

/// Exactly one of relation or operator, depending on the operand types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Relation(Relation),
    Operator(BinaryOperator),
}

impl Comparator {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Relation(r) => r.symbol(),
            Comparator::Operator(o) => o.symbol(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConditionRecord: flat authoring form
// ---------------------------------------------------------------------------

/// Flat authoring form of a condition, as stored in catalog documents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionRecord {
    pub name: String,
    pub left_type: Option<OperandType>,
    pub right_type: Option<OperandType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_variable_definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_variable_definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_sub_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_sub_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<BinaryOperator>,
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn prefix(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl ConditionRecord {
    fn object(&self) -> String {
        format!("Condition '{}'", self.name)
    }

    fn operand_fields(&self, side: Side) -> (Option<OperandType>, &Option<String>, &Option<String>, &Option<String>) {
        match side {
            Side::Left => (
                self.left_type,
                &self.left_expression,
                &self.left_variable_definition,
                &self.left_sub_condition,
            ),
            Side::Right => (
                self.right_type,
                &self.right_expression,
                &self.right_variable_definition,
                &self.right_sub_condition,
            ),
        }
    }

    fn operand(&self, side: Side) -> Result<Operand> {
        let (kind, expression, variable, sub_condition) = self.operand_fields(side);
        let missing = |field: &str, what: &str| {
            EryError::validation(
                self.object(),
                format!("{}_{}", side.prefix(), field),
                format!("{} type requires a {}", side.prefix(), what),
            )
        };
        match kind {
            None => Err(EryError::validation(
                self.object(),
                format!("{}_type", side.prefix()),
                "an operand type is required",
            )),
            Some(OperandType::Expression) => expression
                .clone()
                .map(Operand::Expression)
                .ok_or_else(|| missing("expression", "expression")),
            Some(OperandType::Variable) => variable
                .clone()
                .filter(|v| !v.is_empty())
                .map(Operand::Variable)
                .ok_or_else(|| missing("variable_definition", "variable definition")),
            Some(OperandType::SubCondition) => sub_condition
                .clone()
                .filter(|c| !c.is_empty())
                .map(Operand::SubCondition)
                .ok_or_else(|| missing("sub_condition", "sub condition")),
        }
    }

    /// Field-scoped validation.
    ///
    /// Each side must carry the field its type names. Without a sub-condition
    /// side a relation is required and an operator rejected; with one, an
    /// operator is required and a relation rejected.
    pub fn clean(&self) -> Result<()> {
        self.to_condition().map(|_| ())
    }

    fn to_condition(&self) -> Result<Condition> {
        let left = self.operand(Side::Left)?;
        let right = self.operand(Side::Right)?;
        let uses_sub_condition = left.sub_condition().is_some() || right.sub_condition().is_some();

        let comparator = if uses_sub_condition {
            if self.relation.is_some() {
                return Err(EryError::validation(
                    self.object(),
                    "relation",
                    "a relation cannot be used with a sub condition; use an operator",
                ));
            }
            let operator = self.operator.ok_or_else(|| {
                EryError::validation(
                    self.object(),
                    "operator",
                    "an operator is required when either side is a sub condition",
                )
            })?;
            Comparator::Operator(operator)
        } else {
            if self.operator.is_some() {
                return Err(EryError::validation(
                    self.object(),
                    "operator",
                    "an operator can only join sub conditions; use a relation",
                ));
            }
            let relation = self.relation.ok_or_else(|| {
                EryError::validation(
                    self.object(),
                    "relation",
                    "a relation is required when neither side is a sub condition",
                )
            })?;
            Comparator::Relation(relation)
        };

        Ok(Condition {
            name: self.name.clone(),
            left,
            right,
            comparator,
        })
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A validated condition. Built from a [`ConditionRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ConditionRecord", into = "ConditionRecord")]
pub struct Condition {
    pub name: String,
    pub left: Operand,
    pub right: Operand,
    pub comparator: Comparator,
}

impl TryFrom<ConditionRecord> for Condition {
    type Error = EryError;

    fn try_from(record: ConditionRecord) -> Result<Self> {
        record.to_condition()
    }
}

impl From<Condition> for ConditionRecord {
    fn from(condition: Condition) -> Self {
        let mut record = ConditionRecord {
            name: condition.name,
            ..Default::default()
        };
        for (side, operand) in [(Side::Left, condition.left), (Side::Right, condition.right)] {
            let (kind, expression, variable, sub_condition) = match side {
                Side::Left => (
                    &mut record.left_type,
                    &mut record.left_expression,
                    &mut record.left_variable_definition,
                    &mut record.left_sub_condition,
                ),
                Side::Right => (
                    &mut record.right_type,
                    &mut record.right_expression,
                    &mut record.right_variable_definition,
                    &mut record.right_sub_condition,
                ),
            };
            *kind = Some(operand.operand_type());
            match operand {
                Operand::Expression(text) => *expression = Some(text),
                Operand::Variable(name) => *variable = Some(name),
                Operand::SubCondition(name) => *sub_condition = Some(name),
            }
        }
        match condition.comparator {
            Comparator::Relation(r) => record.relation = Some(r),
            Comparator::Operator(o) => record.operator = Some(o),
        }
        record
    }
}

impl Condition {
    /// A `relation` condition between two operands.
    pub fn relation(name: impl Into<String>, left: Operand, relation: Relation, right: Operand) -> Result<Self> {
        Self::build(name.into(), left, Comparator::Relation(relation), right)
    }

    /// An `operator` condition joining operands, at least one a sub-condition.
    pub fn operator(name: impl Into<String>, left: Operand, operator: BinaryOperator, right: Operand) -> Result<Self> {
        Self::build(name.into(), left, Comparator::Operator(operator), right)
    }

    fn build(name: String, left: Operand, comparator: Comparator, right: Operand) -> Result<Self> {
        Condition::try_from(ConditionRecord::from(Condition {
            name,
            left,
            right,
            comparator,
        }))
    }

    /// Names of the sub-conditions this condition references directly.
    pub fn sub_conditions(&self) -> impl Iterator<Item = &str> {
        [&self.left, &self.right]
            .into_iter()
            .filter_map(|o| o.sub_condition())
    }

    /// Compile to JavaScript, resolving sub-conditions through `source`.
    pub fn as_javascript<S: ConditionSource + ?Sized>(&self, source: &S, max_depth: usize) -> Result<String> {
        ConditionCompiler::new(source, max_depth).compile_condition(self)
    }

    /// Compile and evaluate through the engine, labelled with the condition name.
    pub async fn evaluate<S: ConditionSource + ?Sized>(
        &self,
        source: &S,
        engine: &Engine,
        context: &EngineContext,
        max_depth: usize,
    ) -> Result<bool> {
        let code = self.as_javascript(source, max_depth)?;
        let passed = engine.evaluate_bool(&self.name, &code, context).await?;
        tracing::debug!(condition = %self.name, code = %code, passed, "condition evaluated");
        Ok(passed)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ---------------------------------------------------------------------------
// ConditionSource / ConditionCompiler
// ---------------------------------------------------------------------------

/// Lookup of conditions by name.
pub trait ConditionSource {
    fn condition(&self, name: &str) -> Option<&Condition>;
}

impl ConditionSource for BTreeMap<String, Condition> {
    fn condition(&self, name: &str) -> Option<&Condition> {
        self.get(name)
    }
}

impl ConditionSource for [Condition] {
    fn condition(&self, name: &str) -> Option<&Condition> {
        self.iter().find(|c| c.name == name)
    }
}

/// Recursive compiler with a depth limit and cycle detection.
pub struct ConditionCompiler<'a, S: ConditionSource + ?Sized> {
    source: &'a S,
    max_depth: usize,
}

impl<'a, S: ConditionSource + ?Sized> ConditionCompiler<'a, S> {
    pub fn new(source: &'a S, max_depth: usize) -> Self {
        Self { source, max_depth }
    }

    /// Compile the named condition.
    pub fn compile(&self, name: &str) -> Result<String> {
        let condition = self.lookup(name)?;
        self.compile_condition(condition)
    }

    pub fn compile_condition(&self, condition: &Condition) -> Result<String> {
        let mut stack = Vec::new();
        self.compile_inner(condition, &mut stack)
    }

    fn lookup(&self, name: &str) -> Result<&'a Condition> {
        self.source.condition(name).ok_or_else(|| {
            EryError::not_found(NotFoundKind::Condition, format!("no condition named '{}'", name))
        })
    }

    fn compile_inner(&self, condition: &Condition, stack: &mut Vec<String>) -> Result<String> {
        if stack.iter().any(|n| n == &condition.name) {
            let mut path = stack.clone();
            path.push(condition.name.clone());
            let start = path.iter().position(|n| n == &condition.name).unwrap_or(0);
            return Err(EryError::ConditionCycle {
                condition: condition.name.clone(),
                path: path[start..].join(" -> "),
            });
        }
        if stack.len() >= self.max_depth {
            let root = stack.first().cloned().unwrap_or_else(|| condition.name.clone());
            return Err(EryError::ConditionDepthExceeded {
                condition: root,
                max_depth: self.max_depth,
            });
        }

        stack.push(condition.name.clone());
        let left = self.get_value(&condition.left, stack)?;
        let right = self.get_value(&condition.right, stack)?;
        stack.pop();

        Ok(format!(
            "({}) {} ({})",
            left,
            condition.comparator.symbol(),
            right
        ))
    }

    /// Resolve one operand to its JavaScript text.
    fn get_value(&self, operand: &Operand, stack: &mut Vec<String>) -> Result<String> {
        match operand {
            Operand::Expression(text) => Ok(normalize_expression(text)),
            Operand::Variable(name) => Ok(name.clone()),
            Operand::SubCondition(name) => {
                let sub = self.lookup(name)?;
                self.compile_inner(sub, stack)
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// Every condition lying on a sub-condition cycle, mapped to the cycle as seen
/// from that condition (`a -> b -> a`).
///
/// Walks names only, with an explicit stack, so long chains and shared
/// sub-trees cost linear time without compiling anything.
/// References to unknown conditions are ignored.
pub fn sub_condition_cycles(conditions: &[Condition]) -> BTreeMap<&str, Vec<String>> {
    let names: BTreeSet<&str> = conditions.iter().map(|c| c.name.as_str()).collect();
    let children: BTreeMap<&str, Vec<&str>> = conditions
        .iter()
        .map(|c| (c.name.as_str(), c.sub_conditions().filter(|n| names.contains(n)).collect()))
        .collect();

    let mut marks: BTreeMap<&str, Mark> = children.keys().map(|&name| (name, Mark::White)).collect();
    let mut cycles: BTreeMap<&str, Vec<String>> = BTreeMap::new();

    for &root in children.keys() {
        if marks[root] != Mark::White {
            continue;
        }
        // (condition, index of the next child to visit)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::Grey);

        while let Some((node, index)) = stack.last().copied() {
            let Some(&child) = children[node].get(index) else {
                marks.insert(node, Mark::Black);
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            match marks[child] {
                Mark::White => {
                    marks.insert(child, Mark::Grey);
                    stack.push((child, 0));
                }
                Mark::Grey => {
                    let start = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                    let ring: Vec<&str> = stack[start..].iter().map(|(n, _)| *n).collect();
                    for (i, &member) in ring.iter().enumerate() {
                        cycles.entry(member).or_insert_with(|| {
                            ring[i..]
                                .iter()
                                .chain(&ring[..=i])
                                .map(|n| n.to_string())
                                .collect()
                        });
                    }
                }
                Mark::Black => {}
            }
        }
    }
    cycles
}

/// Boolean literals stored as text are lower-cased; anything else is kept verbatim.
pub fn normalize_expression(text: &str) -> String {
    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
        text.to_ascii_lowercase()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(text: &str) -> Operand {
        Operand::Expression(text.into())
    }

    fn sub(name: &str) -> Operand {
        Operand::SubCondition(name.into())
    }

    fn source(conditions: Vec<Condition>) -> BTreeMap<String, Condition> {
        conditions.into_iter().map(|c| (c.name.clone(), c)).collect()
    }

    #[test]
    fn compiles_expression_relation() {
        let c = Condition::relation("same", expr("1"), Relation::Equal, expr("1")).unwrap();
        assert_eq!(c.as_javascript(&BTreeMap::new(), 32).unwrap(), "(1) == (1)");
    }

    #[test]
    fn variable_compiles_to_its_name() {
        let c = Condition::relation(
            "adult",
            Operand::Variable("age".into()),
            Relation::GreaterOrEqual,
            expr("18"),
        )
        .unwrap();
        assert_eq!(c.as_javascript(&BTreeMap::new(), 32).unwrap(), "(age) >= (18)");
    }

    #[test]
    fn boolean_text_is_lowercased() {
        assert_eq!(normalize_expression("TRUE"), "true");
        assert_eq!(normalize_expression("False"), "false");
        assert_eq!(normalize_expression("'True story'"), "'True story'");
    }

    #[test]
    fn sub_conditions_compile_recursively() {
        let a = Condition::relation("a", expr("1"), Relation::Less, expr("2")).unwrap();
        let b = Condition::relation("b", expr("x"), Relation::NotEqual, expr("null")).unwrap();
        let both = Condition::operator("both", sub("a"), BinaryOperator::And, sub("b")).unwrap();
        let src = source(vec![a, b, both.clone()]);
        assert_eq!(
            both.as_javascript(&src, 32).unwrap(),
            "((1) < (2)) && ((x) != (null))"
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let looped = Condition::operator("loop", sub("loop"), BinaryOperator::Or, expr("true")).unwrap();
        let src = source(vec![looped]);
        let err = ConditionCompiler::new(&src, 32).compile("loop").unwrap_err();
        match err {
            EryError::ConditionCycle { condition, path } => {
                assert_eq!(condition, "loop");
                assert_eq!(path, "loop -> loop");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn mutual_reference_is_a_cycle() {
        let a = Condition::operator("a", sub("b"), BinaryOperator::And, expr("true")).unwrap();
        let b = Condition::operator("b", sub("a"), BinaryOperator::And, expr("true")).unwrap();
        let src = source(vec![a, b]);
        let err = ConditionCompiler::new(&src, 32).compile("a").unwrap_err();
        match err {
            EryError::ConditionCycle { path, .. } => assert_eq!(path, "a -> b -> a"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn depth_limit_is_enforced() {
        let leaf = Condition::relation("c0", expr("1"), Relation::Equal, expr("1")).unwrap();
        let mid = Condition::operator("c1", sub("c0"), BinaryOperator::And, expr("true")).unwrap();
        let top = Condition::operator("c2", sub("c1"), BinaryOperator::And, expr("true")).unwrap();
        let src = source(vec![leaf, mid, top]);
        assert!(ConditionCompiler::new(&src, 3).compile("c2").is_ok());
        let err = ConditionCompiler::new(&src, 2).compile("c2").unwrap_err();
        assert!(matches!(err, EryError::ConditionDepthExceeded { max_depth: 2, .. }));
    }

    #[test]
    fn missing_sub_condition_is_not_found() {
        let c = Condition::operator("c", sub("ghost"), BinaryOperator::Or, expr("true")).unwrap();
        let err = c.as_javascript(&BTreeMap::new(), 32).unwrap_err();
        assert_eq!(err.not_found_kind(), Some(NotFoundKind::Condition));
    }

    // --- clean ---

    fn record() -> ConditionRecord {
        ConditionRecord {
            name: "c".into(),
            left_type: Some(OperandType::Expression),
            right_type: Some(OperandType::Expression),
            left_expression: Some("1".into()),
            right_expression: Some("1".into()),
            relation: Some(Relation::Equal),
            ..Default::default()
        }
    }

    fn field_of(err: EryError) -> String {
        match err {
            EryError::Validation { field, .. } => field,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn clean_accepts_valid_record() {
        assert!(record().clean().is_ok());
    }

    #[test]
    fn clean_requires_relation_without_sub_conditions() {
        let r = ConditionRecord {
            relation: None,
            ..record()
        };
        assert_eq!(field_of(r.clean().unwrap_err()), "relation");
    }

    #[test]
    fn clean_requires_expression_text() {
        let r = ConditionRecord {
            left_expression: None,
            ..record()
        };
        assert_eq!(field_of(r.clean().unwrap_err()), "left_expression");
        let r = ConditionRecord {
            right_expression: None,
            ..record()
        };
        assert_eq!(field_of(r.clean().unwrap_err()), "right_expression");
    }

    #[test]
    fn clean_requires_variable_definition() {
        let r = ConditionRecord {
            left_type: Some(OperandType::Variable),
            ..record()
        };
        assert_eq!(field_of(r.clean().unwrap_err()), "left_variable_definition");
    }

    #[test]
    fn clean_requires_operator_with_sub_condition() {
        let r = ConditionRecord {
            right_type: Some(OperandType::SubCondition),
            right_sub_condition: Some("other".into()),
            ..record()
        };
        // A relation is rejected once a sub-condition side is present
        assert_eq!(field_of(r.clone().clean().unwrap_err()), "relation");
        let r = ConditionRecord { relation: None, ..r };
        assert_eq!(field_of(r.clone().clean().unwrap_err()), "operator");
        let r = ConditionRecord {
            operator: Some(BinaryOperator::Or),
            ..r
        };
        assert!(r.clean().is_ok());
    }

    #[test]
    fn clean_rejects_operator_between_plain_operands() {
        let r = ConditionRecord {
            operator: Some(BinaryOperator::And),
            ..record()
        };
        assert_eq!(field_of(r.clean().unwrap_err()), "operator");
    }

    #[test]
    fn deserializes_flat_record() {
        let json = r#"{
            "name": "is_adult",
            "left_type": "variable",
            "left_variable_definition": "age",
            "right_type": "expression",
            "right_expression": "18",
            "relation": "greater_or_equal"
        }"#;
        let c: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(c.left, Operand::Variable("age".into()));
        assert_eq!(c.comparator, Comparator::Relation(Relation::GreaterOrEqual));

        let bad = r#"{"name": "x", "left_type": "expression", "right_type": "expression", "right_expression": "1", "relation": "equal"}"#;
        let err = serde_json::from_str::<Condition>(bad).unwrap_err();
        assert!(err.to_string().contains("left_expression"));
    }

    #[test]
    fn operator_serializes_with_op_prefix() {
        assert_eq!(
            serde_json::to_string(&BinaryOperator::ExclusiveOr).unwrap(),
            "\"op_exclusive_or\""
        );
    }
}
