//! Redirect resolution: ordered, first-match-wins selection of the next stage.

use ery_engine::{Engine, EngineContext};
use ery_types::{EryError, NotFoundKind, Result};

use crate::catalog::{ModuleDefinition, Redirect, StageDefinition, StageKey};
use crate::condition::ConditionSource;

/// One redirect that was looked at during selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEvaluation {
    pub order: i64,
    pub condition: Option<String>,
    pub target: StageKey,
    pub passed: bool,
}

/// Result of a successful selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectSelection {
    pub target: StageKey,
    /// Redirects evaluated before (and including) the match, in evaluation order.
    pub evaluations: Vec<RedirectEvaluation>,
}

/// Redirects of `definition` sorted ascending by `order`. The sort is stable,
/// so equal orders keep authoring order.
pub fn ordered_redirects(definition: &StageDefinition) -> Vec<&Redirect> {
    let mut redirects: Vec<&Redirect> = definition.redirects.iter().collect();
    redirects.sort_by_key(|r| r.order);
    redirects
}

/// Pick the first redirect whose condition is absent or passes.
///
/// Conditions are evaluated lazily: nothing after the first match reaches
/// the engine. Engine failures propagate unchanged.
pub async fn select_redirect(
    module: &ModuleDefinition,
    definition: &StageDefinition,
    engine: &Engine,
    context: &EngineContext,
    max_condition_depth: usize,
) -> Result<RedirectSelection> {
    let mut evaluations = Vec::new();

    for redirect in ordered_redirects(definition) {
        let target = redirect.next_stage_definition.resolve(&module.name);
        let passed = match &redirect.condition {
            None => true,
            Some(name) => {
                let condition = module.condition(name).ok_or_else(|| {
                    EryError::not_found(
                        NotFoundKind::Condition,
                        format!("no condition named '{}'", name),
                    )
                })?;
                condition
                    .evaluate(module, engine, context, max_condition_depth)
                    .await?
            }
        };
        tracing::debug!(
            stage = %definition.name,
            order = redirect.order,
            target = %target,
            passed,
            "redirect evaluated"
        );
        evaluations.push(RedirectEvaluation {
            order: redirect.order,
            condition: redirect.condition.clone(),
            target: target.clone(),
            passed,
        });
        if passed {
            return Ok(RedirectSelection {
                target,
                evaluations,
            });
        }
    }

    Err(EryError::not_found(
        NotFoundKind::Redirect,
        format!(
            "No matching redirect exists or passes the condition requirements to be used. (stage: {}/{})",
            module.name, definition.name
        ),
    ))
}

/// Target of the first matching redirect.
pub async fn get_redirect_stage(
    module: &ModuleDefinition,
    definition: &StageDefinition,
    engine: &Engine,
    context: &EngineContext,
    max_condition_depth: usize,
) -> Result<StageKey> {
    select_redirect(module, definition, engine, context, max_condition_depth)
        .await
        .map(|selection| selection.target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StageRef;
    use crate::condition::{Condition, Operand, Relation};
    use ery_engine::{CallCountingMiddleware, LocalEngineClient};

    fn relation(name: &str, left: &str, right: &str) -> Condition {
        Condition::relation(
            name,
            Operand::Expression(left.into()),
            Relation::Equal,
            Operand::Expression(right.into()),
        )
        .unwrap()
    }

    fn module() -> ModuleDefinition {
        let mut module = ModuleDefinition::new("m", "Start");
        module.conditions = vec![relation("never", "1", "2"), relation("always", "1", "1")];
        module
    }

    #[tokio::test]
    async fn unconditional_redirect_matches() {
        let module = module();
        let start = StageDefinition::new("Start")
            .with_redirect(Redirect::new(1, StageRef::local("Next")));
        let engine = Engine::new(LocalEngineClient::new());
        let target = get_redirect_stage(&module, &start, &engine, &EngineContext::new(), 32)
            .await
            .unwrap();
        assert_eq!(target, StageKey::new("m", "Next"));
    }

    #[tokio::test]
    async fn equal_orders_keep_authoring_order() {
        let module = module();
        let start = StageDefinition::new("Start")
            .with_redirect(Redirect::new(5, StageRef::local("First")))
            .with_redirect(Redirect::new(5, StageRef::local("Second")));
        let engine = Engine::new(LocalEngineClient::new());
        let target = get_redirect_stage(&module, &start, &engine, &EngineContext::new(), 32)
            .await
            .unwrap();
        assert_eq!(target.stage, "First");
    }

    #[tokio::test]
    async fn no_match_is_redirect_not_found() {
        let module = module();
        let start = StageDefinition::new("Start")
            .with_redirect(Redirect::new(1, StageRef::local("A")).with_condition("never"));
        let counter = CallCountingMiddleware::new();
        let engine = Engine::new(LocalEngineClient::new()).with_middleware(counter.clone());
        let err = select_redirect(&module, &start, &engine, &EngineContext::new(), 32)
            .await
            .unwrap_err();
        assert_eq!(err.not_found_kind(), Some(NotFoundKind::Redirect));
        assert!(err.to_string().contains("No matching redirect"));
        assert_eq!(counter.calls_for("never"), 1);
    }

    #[tokio::test]
    async fn no_redirects_is_not_found() {
        let module = module();
        let engine = Engine::new(LocalEngineClient::new());
        let err = get_redirect_stage(
            &module,
            &StageDefinition::new("Start"),
            &engine,
            &EngineContext::new(),
            32,
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn evaluations_record_failed_edges() {
        let module = module();
        let start = StageDefinition::new("Start")
            .with_redirect(Redirect::new(2, StageRef::local("B")).with_condition("always"))
            .with_redirect(Redirect::new(1, StageRef::local("A")).with_condition("never"));
        let engine = Engine::new(LocalEngineClient::new());
        let selection = select_redirect(&module, &start, &engine, &EngineContext::new(), 32)
            .await
            .unwrap();
        assert_eq!(selection.target.stage, "B");
        let orders: Vec<(i64, bool)> = selection
            .evaluations
            .iter()
            .map(|e| (e.order, e.passed))
            .collect();
        assert_eq!(orders, vec![(1, false), (2, true)]);
    }
}
