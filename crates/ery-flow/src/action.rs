//! Actions: ordered, optionally guarded steps run against a hand's variables.

use std::future::Future;
use std::pin::Pin;

use ery_engine::{Engine, EngineContext};
use ery_types::{Context, EryError, NotFoundKind, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::ModuleDefinition;
use crate::condition::ConditionSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<ActionStep>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: ActionStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Steps sorted by `order`; ties keep authoring order.
    pub fn ordered_steps(&self) -> Vec<&ActionStep> {
        let mut steps: Vec<&ActionStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub invert_condition: bool,
    #[serde(flatten)]
    pub kind: ActionKind,
}

impl ActionStep {
    pub fn new(order: i64, kind: ActionKind) -> Self {
        Self {
            order,
            condition: None,
            invert_condition: false,
            kind,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn unless(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self.invert_condition = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Evaluate `value` and store the result in `variable`.
    SetVariable { variable: String, value: String },
    Log { message: String },
    /// Evaluate `code` and discard the result.
    RunCode { code: String },
    Subaction { action: String },
    Quit,
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::SetVariable { .. } => "set_variable",
            ActionKind::Log { .. } => "log",
            ActionKind::RunCode { .. } => "run_code",
            ActionKind::Subaction { .. } => "subaction",
            ActionKind::Quit => "quit",
        }
    }
}

// ---------------------------------------------------------------------------
// ActionRunner
// ---------------------------------------------------------------------------

/// What running an action did to the hand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    pub steps_run: usize,
    pub steps_skipped: usize,
    pub quit: bool,
}

type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Runs a module's actions against a variable store.
pub struct ActionRunner<'a> {
    module: &'a ModuleDefinition,
    engine: &'a Engine,
    stage: Option<String>,
    max_condition_depth: usize,
    max_action_depth: usize,
}

impl<'a> ActionRunner<'a> {
    pub fn new(module: &'a ModuleDefinition, engine: &'a Engine) -> Self {
        Self {
            module,
            engine,
            stage: None,
            max_condition_depth: 32,
            max_action_depth: 16,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_limits(mut self, max_condition_depth: usize, max_action_depth: usize) -> Self {
        self.max_condition_depth = max_condition_depth;
        self.max_action_depth = max_action_depth;
        self
    }

    /// Run the named action. Writes go straight to `context`; callers wanting
    /// all-or-nothing semantics pass an isolated copy.
    pub async fn run(&self, name: &str, context: &Context) -> Result<ActionOutcome> {
        let action = self.lookup(name)?;
        let mut outcome = ActionOutcome::default();
        self.run_action(action, context, 1, &mut outcome).await?;
        tracing::debug!(
            action = %name,
            steps_run = outcome.steps_run,
            steps_skipped = outcome.steps_skipped,
            quit = outcome.quit,
            "action finished"
        );
        Ok(outcome)
    }

    fn lookup(&self, name: &str) -> Result<&'a Action> {
        self.module.action(name).ok_or_else(|| {
            EryError::not_found(
                NotFoundKind::Action,
                format!("no action '{}' in module '{}'", name, self.module.name),
            )
        })
    }

    async fn engine_context(&self, context: &Context) -> EngineContext {
        let ctx = EngineContext::new().with_variables(context.snapshot().await);
        match &self.stage {
            Some(stage) => ctx.with_stage(stage.clone()),
            None => ctx,
        }
    }

    fn run_action<'b>(
        &'b self,
        action: &'b Action,
        context: &'b Context,
        depth: usize,
        outcome: &'b mut ActionOutcome,
    ) -> StepFuture<'b> {
        Box::pin(async move {
            if depth > self.max_action_depth {
                return Err(EryError::ActionFailed {
                    action: action.name.clone(),
                    step: 0,
                    message: format!("subactions nest deeper than {}", self.max_action_depth),
                });
            }
            for step in action.ordered_steps() {
                if outcome.quit {
                    break;
                }
                if !self.step_enabled(step, context).await.map_err(|e| wrap(action, step, e))? {
                    outcome.steps_skipped += 1;
                    continue;
                }
                self.run_step(action, step, context, depth, outcome).await?;
            }
            Ok(())
        })
    }

    async fn step_enabled(&self, step: &ActionStep, context: &Context) -> Result<bool> {
        let Some(name) = &step.condition else {
            return Ok(true);
        };
        let condition = self.module.condition(name).ok_or_else(|| {
            EryError::not_found(NotFoundKind::Condition, format!("no condition named '{}'", name))
        })?;
        let ctx = self.engine_context(context).await;
        let passed = condition
            .evaluate(self.module, self.engine, &ctx, self.max_condition_depth)
            .await?;
        Ok(passed != step.invert_condition)
    }

    async fn run_step(
        &self,
        action: &Action,
        step: &ActionStep,
        context: &Context,
        depth: usize,
        outcome: &mut ActionOutcome,
    ) -> Result<()> {
        tracing::debug!(action = %action.name, order = step.order, kind = step.kind.label(), "action step");
        match &step.kind {
            ActionKind::SetVariable { variable, value } => {
                if self.module.variable(variable).is_none() {
                    return Err(wrap(
                        action,
                        step,
                        EryError::not_found(
                            NotFoundKind::Variable,
                            format!("no variable '{}' in module '{}'", variable, self.module.name),
                        ),
                    ));
                }
                let ctx = self.engine_context(context).await;
                let result = self
                    .engine
                    .evaluate_without_side_effects(&action.name, value, &ctx)
                    .await
                    .map_err(|e| wrap(action, step, e))?;
                context.set(variable.clone(), result).await;
            }
            ActionKind::Log { message } => {
                context.append_log(message.clone()).await;
            }
            ActionKind::RunCode { code } => {
                let ctx = self.engine_context(context).await;
                self.engine
                    .evaluate_without_side_effects(&action.name, code, &ctx)
                    .await
                    .map_err(|e| wrap(action, step, e))?;
            }
            ActionKind::Subaction { action: sub } => {
                let sub_action = self.lookup(sub).map_err(|e| wrap(action, step, e))?;
                self.run_action(sub_action, context, depth + 1, outcome).await?;
            }
            ActionKind::Quit => {
                outcome.quit = true;
            }
        }
        outcome.steps_run += 1;
        Ok(())
    }
}

fn wrap(action: &Action, step: &ActionStep, error: EryError) -> EryError {
    match error {
        EryError::ActionFailed { .. } => error,
        other => EryError::ActionFailed {
            action: action.name.clone(),
            step: step.order,
            message: other.to_string(),
        },
    }
}
