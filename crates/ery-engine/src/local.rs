use async_trait::async_trait;
use ery_script::{Scope, ScriptValue};
use ery_types::Result;

use crate::{EngineClient, EngineContext, JavascriptOp};

// ---------------------------------------------------------------------------
// LocalEngineClient
// ---------------------------------------------------------------------------

/// Evaluates expressions in-process with `ery-script`.
///
/// Context variables are bound by name; `stint`, `era` and `stage` are bound
/// to their names when present and never shadow a variable of the same name.
#[derive(Debug, Default, Clone)]
pub struct LocalEngineClient;

impl LocalEngineClient {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn scope_for(context: &EngineContext) -> Scope {
    let mut scope: Scope = context
        .variables
        .iter()
        .map(|(name, value)| (name.clone(), ScriptValue::from(value)))
        .collect();
    for (name, value) in [
        ("stint", &context.stint),
        ("era", &context.era),
        ("stage", &context.stage),
    ] {
        if let Some(value) = value {
            if !scope.contains(name) {
                scope.insert(name, ScriptValue::String(value.clone()));
            }
        }
    }
    scope
}

#[async_trait]
impl EngineClient for LocalEngineClient {
    fn name(&self) -> &str {
        "local"
    }

    async fn run(&self, op: &JavascriptOp) -> Result<serde_json::Value> {
        let scope = scope_for(&op.context);
        let value = ery_script::evaluate(&op.name, &op.code, &scope)?;
        Ok(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use ery_types::EryError;
    use serde_json::json;

    #[tokio::test]
    async fn evaluates_against_variables() {
        let engine = Engine::new(LocalEngineClient::new());
        let ctx = EngineContext::new().with_variable("age", json!(17));
        assert!(!engine.evaluate_bool("is_adult", "(age) >= (18)", &ctx).await.unwrap());

        let ctx = ctx.with_variable("age", json!(30));
        assert!(engine.evaluate_bool("is_adult", "(age) >= (18)", &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn exposes_stage_name() {
        let engine = Engine::new(LocalEngineClient::new());
        let ctx = EngineContext::new().with_stage("Intro").with_era("pilot");
        let value = engine
            .evaluate_without_side_effects("where", "stage + '/' + era", &ctx)
            .await
            .unwrap();
        assert_eq!(value, json!("Intro/pilot"));
    }

    #[test]
    fn variables_shadow_context_names() {
        let ctx = EngineContext::new()
            .with_stage("Intro")
            .with_variable("stage", json!(3));
        let scope = scope_for(&ctx);
        assert_eq!(scope.get("stage"), Some(&ScriptValue::Number(3.0)));
    }

    #[tokio::test]
    async fn undefined_variable_is_reported_with_label() {
        let engine = Engine::new(LocalEngineClient::new());
        let err = engine
            .evaluate_bool("needs_age", "(age) > (1)", &EngineContext::new())
            .await
            .unwrap_err();
        match err {
            EryError::ScriptEval { label, message } => {
                assert_eq!(label, "needs_age");
                assert_eq!(message, "age is not defined");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn parse_errors_propagate() {
        let engine = Engine::new(LocalEngineClient::new());
        let err = engine
            .evaluate_without_side_effects("bad", "(1) ==", &EngineContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EryError::ScriptParse { .. }));
    }
}
