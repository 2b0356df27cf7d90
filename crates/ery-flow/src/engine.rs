//! The flow engine: hands moving through a module's stages.
//!
//! [`FlowEngine`] owns an authoring [`Catalog`], the [`Runtime`] state and the
//! injected evaluation [`Engine`]. Every transition resolves and evaluates
//! first and mutates last, so a failed evaluation leaves the runtime untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use ery_engine::{Engine, EngineContext};
use ery_types::{Context, EryError, NotFoundKind, Result};

use crate::action::{ActionOutcome, ActionRunner};
use crate::blocks::{self, BlockInfo};
use crate::breadcrumb::{plan_repair, BreadcrumbId, RepairPlan};
use crate::catalog::{BreadcrumbType, Catalog, StageDefinition, StageKey};
use crate::checkpoint::{self, HandRecord, RuntimeCheckpoint};
use crate::events::{EventEmitter, FlowEvent};
use crate::redirect::select_redirect;
use crate::runtime::{Hand, HandId, HandStatus, Runtime, StageId};
use crate::validation::{validate_or_raise, Diagnostic};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Limits and persistence settings for a [`FlowEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    pub max_condition_depth: usize,
    pub max_action_depth: usize,
    /// Directory for `runtime.json`; checkpointing is off when `None`.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_condition_depth: 32,
            max_action_depth: 16,
            checkpoint_dir: None,
        }
    }
}

/// What a submit did to the hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The stage does not advance on submit, or the hand is no longer active.
    Stayed,
    /// Followed the recorded `next` breadcrumb.
    Replayed { to: StageKey, breadcrumb: BreadcrumbId },
    /// Resolved a redirect and recorded a new breadcrumb.
    Redirected { to: StageKey, breadcrumb: BreadcrumbId },
}

/// Result of deleting a stage definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub stages_removed: usize,
    pub repair: RepairPlan,
}

enum Step {
    Replay {
        breadcrumb: BreadcrumbId,
        stage: StageId,
        key: StageKey,
        run_preaction: bool,
    },
    Redirect {
        key: StageKey,
    },
}

impl Step {
    fn key(&self) -> &StageKey {
        match self {
            Step::Replay { key, .. } | Step::Redirect { key } => key,
        }
    }
}

fn status_after(definition: &StageDefinition, preaction: Option<&ActionOutcome>) -> HandStatus {
    if preaction.is_some_and(|o| o.quit) {
        HandStatus::Quit
    } else if definition.end_stage {
        HandStatus::Finished
    } else {
        HandStatus::Active
    }
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

pub struct FlowEngine {
    catalog: Catalog,
    runtime: Runtime,
    engine: Engine,
    events: EventEmitter,
    config: FlowConfig,
}

impl FlowEngine {
    /// Validate `catalog` and build an engine with default limits.
    pub fn new(catalog: Catalog, engine: Engine) -> Result<Self> {
        Self::with_config(catalog, engine, FlowConfig::default())
    }

    pub fn with_config(catalog: Catalog, engine: Engine, config: FlowConfig) -> Result<Self> {
        let diagnostics: Vec<Diagnostic> = validate_or_raise(&catalog)?;
        for d in &diagnostics {
            tracing::warn!(rule = %d.rule, location = ?d.location, "{}", d.message);
        }
        Ok(Self {
            catalog,
            runtime: Runtime::new(),
            engine,
            events: EventEmitter::default(),
            config,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    pub fn hand(&self, id: HandId) -> Result<&Hand> {
        self.runtime.hand(id)
    }

    /// Stage definition the hand is currently on.
    pub fn current_stage(&self, id: HandId) -> Result<StageKey> {
        self.runtime.current_definition(id).cloned()
    }

    /// Snapshot of a hand's variables for the evaluation engine.
    pub async fn engine_context(&self, id: HandId) -> Result<EngineContext> {
        let hand = self.runtime.hand(id)?;
        let key = self.runtime.current_definition(id)?;
        Ok(EngineContext::new()
            .with_stage(key.stage.clone())
            .with_variables(hand.context.snapshot().await))
    }

    // --- Hands ---

    /// Start a hand on the module's start stage with default variable values.
    pub async fn add_hand(&mut self, module: &str, frontend: &str, language: &str) -> Result<HandId> {
        self.add_hand_with_variables(module, frontend, language, HashMap::new())
            .await
    }

    /// Start a hand, overriding some variable defaults.
    pub async fn add_hand_with_variables(
        &mut self,
        module: &str,
        frontend: &str,
        language: &str,
        overrides: HashMap<String, serde_json::Value>,
    ) -> Result<HandId> {
        let module_def = self.catalog.module(module)?;
        let mut values: HashMap<String, serde_json::Value> = module_def
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.default.clone()))
            .collect();
        for (name, value) in overrides {
            if module_def.variable(&name).is_none() {
                return Err(EryError::not_found(
                    NotFoundKind::Variable,
                    format!("no variable '{}' in module '{}'", name, module),
                ));
            }
            values.insert(name, value);
        }

        let key = StageKey::new(module, &module_def.start_stage);
        let start = self.catalog.stage_definition(&key)?;
        let mut hand = Hand::new(module, frontend, language);
        hand.context = Context::with_values(values);

        let preaction = match &start.pre_action {
            Some(action) => Some(self.run_pre_action(&key, action, &hand.context).await?),
            None => None,
        };
        let status = status_after(start, preaction.as_ref());
        let breadcrumb_type = start.breadcrumb_type;

        // Commit
        let stage = self.runtime.create_stage(key.clone());
        if preaction.is_some() {
            self.runtime.stage_mut(stage)?.preaction_started = true;
        }
        let breadcrumb = self
            .runtime
            .breadcrumbs_mut()
            .create_breadcrumb(hand.id, stage, breadcrumb_type, None)?;
        hand.stage = Some(stage);
        hand.current_breadcrumb = Some(breadcrumb);
        hand.status = status;
        let id = self.runtime.insert_hand(hand);

        tracing::info!(hand = %id, module, frontend, language, stage = %key, "hand started");
        self.events.emit(FlowEvent::HandStarted {
            hand: id,
            module: module.to_string(),
            frontend: frontend.to_string(),
            language: language.to_string(),
        });
        self.events.emit(FlowEvent::BreadcrumbCreated {
            hand: id,
            breadcrumb,
            previous: None,
        });
        self.announce_entry(id, &key, preaction.as_ref(), status);
        Ok(id)
    }

    // --- Transitions ---

    /// Advance the hand from its current stage.
    ///
    /// Does nothing when the stage has `redirect_on_submit` off. When the stage
    /// keeps full breadcrumbs and the current breadcrumb already has a `next`,
    /// that recorded path is replayed; otherwise redirects are evaluated and a
    /// new breadcrumb is recorded.
    pub async fn submit(&mut self, hand_id: HandId) -> Result<Transition> {
        let hand = self.runtime.hand(hand_id)?;
        if !hand.is_active() {
            tracing::debug!(hand = %hand_id, status = %hand.status, "submit ignored for inactive hand");
            return Ok(Transition::Stayed);
        }
        let current_key = self.runtime.current_definition(hand_id)?.clone();
        let module = self.catalog.module(&current_key.module)?;
        let definition = self.catalog.stage_definition(&current_key)?;
        if !definition.redirect_on_submit {
            tracing::debug!(hand = %hand_id, stage = %current_key, "stage does not redirect on submit");
            return Ok(Transition::Stayed);
        }

        let current_breadcrumb = hand.current_breadcrumb;
        let hand_context = hand.context.clone();
        let recorded_next = match current_breadcrumb {
            Some(crumb) if definition.breadcrumb_type == BreadcrumbType::All => {
                self.runtime.breadcrumbs().get(crumb)?.next
            }
            _ => None,
        };

        // Resolve
        let step = match recorded_next {
            Some(next) => {
                let stage_id = self.runtime.breadcrumbs().get(next)?.stage;
                let stage = self.runtime.stage(stage_id)?;
                Step::Replay {
                    breadcrumb: next,
                    stage: stage_id,
                    key: stage.definition.clone(),
                    run_preaction: !stage.preaction_started,
                }
            }
            None => {
                let ctx = self.engine_context(hand_id).await?;
                let selection = select_redirect(
                    module,
                    definition,
                    &self.engine,
                    &ctx,
                    self.config.max_condition_depth,
                )
                .await?;
                for evaluation in &selection.evaluations {
                    self.events.emit(FlowEvent::RedirectEvaluated {
                        hand: hand_id,
                        from: current_key.to_string(),
                        order: evaluation.order,
                        condition: evaluation.condition.clone(),
                        passed: evaluation.passed,
                    });
                }
                self.events.emit(FlowEvent::RedirectSelected {
                    hand: hand_id,
                    from: current_key.to_string(),
                    to: selection.target.to_string(),
                });
                Step::Redirect {
                    key: selection.target,
                }
            }
        };

        let target_key = step.key().clone();
        let target = self.catalog.stage_definition(&target_key)?;
        let run_preaction = match &step {
            Step::Replay { run_preaction, .. } => *run_preaction,
            Step::Redirect { .. } => true,
        };

        // Speculative pre-action on an isolated copy of the variables
        let isolated = hand_context.clone_isolated().await;
        let preaction = match (&target.pre_action, run_preaction) {
            (Some(action), true) => Some(self.run_pre_action(&target_key, action, &isolated).await?),
            _ => None,
        };
        let status = status_after(target, preaction.as_ref());
        let target_type = target.breadcrumb_type;
        let last = match current_breadcrumb {
            Some(crumb) => Some((crumb, self.breadcrumb_type_of(crumb)?)),
            None => None,
        };

        // Commit
        let (stage_id, breadcrumb, transition) = match step {
            Step::Replay {
                breadcrumb, stage, ..
            } => (
                stage,
                breadcrumb,
                Transition::Replayed {
                    to: target_key.clone(),
                    breadcrumb,
                },
            ),
            Step::Redirect { key } => {
                let stage = self.runtime.create_stage(key);
                let breadcrumb = self
                    .runtime
                    .breadcrumbs_mut()
                    .create_breadcrumb(hand_id, stage, target_type, last)?;
                (
                    stage,
                    breadcrumb,
                    Transition::Redirected {
                        to: target_key.clone(),
                        breadcrumb,
                    },
                )
            }
        };
        if preaction.is_some() {
            self.runtime.stage_mut(stage_id)?.preaction_started = true;
            hand_context.replace_with(&isolated).await;
        }
        let hand = self.runtime.hand_mut(hand_id)?;
        hand.stage = Some(stage_id);
        hand.current_breadcrumb = Some(breadcrumb);
        hand.status = status;

        tracing::info!(hand = %hand_id, from = %current_key, to = %target_key, "stage transition");
        match &transition {
            Transition::Replayed { .. } => self.events.emit(FlowEvent::BreadcrumbReplayed {
                hand: hand_id,
                breadcrumb,
                stage: target_key.to_string(),
            }),
            _ => {
                let previous = self.runtime.breadcrumbs().get(breadcrumb)?.previous;
                self.events.emit(FlowEvent::BreadcrumbCreated {
                    hand: hand_id,
                    breadcrumb,
                    previous,
                });
            }
        }
        self.announce_entry(hand_id, &target_key, preaction.as_ref(), status);
        Ok(transition)
    }

    /// Move the hand to its previous breadcrumb.
    ///
    /// Returns `false` when the current stage does not allow going back or
    /// there is nothing to go back to.
    pub fn back(&mut self, hand_id: HandId) -> Result<bool> {
        let hand = self.runtime.hand(hand_id)?;
        let current_key = self.runtime.current_definition(hand_id)?.clone();
        let definition = self.catalog.stage_definition(&current_key)?;
        if !definition.breadcrumb_type.links_backward() {
            return Ok(false);
        }
        let Some(crumb) = hand.current_breadcrumb else {
            return Ok(false);
        };
        let Some(previous) = self.runtime.breadcrumbs().get(crumb)?.previous else {
            return Ok(false);
        };
        let stage = self.runtime.breadcrumbs().get(previous)?.stage;
        let target_key = self.runtime.stage(stage)?.definition.clone();

        let hand = self.runtime.hand_mut(hand_id)?;
        hand.stage = Some(stage);
        hand.current_breadcrumb = Some(previous);

        tracing::info!(hand = %hand_id, from = %current_key, to = %target_key, "went back");
        self.events.emit(FlowEvent::WentBack {
            hand: hand_id,
            from: current_key.to_string(),
            to: target_key.to_string(),
        });
        self.events.emit(FlowEvent::StageEntered {
            hand: hand_id,
            stage: target_key.to_string(),
        });
        Ok(true)
    }

    // --- Queries ---

    /// Redirect target for the hand's current stage, without moving the hand.
    pub async fn get_redirect_stage(&self, hand_id: HandId) -> Result<StageKey> {
        let key = self.runtime.current_definition(hand_id)?;
        let module = self.catalog.module(&key.module)?;
        let definition = self.catalog.stage_definition(key)?;
        let ctx = self.engine_context(hand_id).await?;
        let selection = select_redirect(
            module,
            definition,
            &self.engine,
            &ctx,
            self.config.max_condition_depth,
        )
        .await?;
        Ok(selection.target)
    }

    /// Blocks of the hand's current stage for its frontend and language.
    pub fn get_blocks(&self, hand_id: HandId) -> Result<BTreeMap<String, BlockInfo>> {
        let hand = self.runtime.hand(hand_id)?;
        let key = self.runtime.current_definition(hand_id)?;
        blocks::get_blocks(&self.catalog, key, &hand.frontend, &hand.language)
    }

    // --- Authoring with runtime effects ---

    /// Delete a stage definition with its stages and breadcrumbs.
    ///
    /// The breadcrumb repair is planned from the intact runtime before anything
    /// is removed; incoming redirects are removed with the definition.
    pub fn delete_stage_definition(&mut self, key: &StageKey) -> Result<DeletionReport> {
        self.catalog.stage_definition(key)?;
        let stages: BTreeSet<StageId> = self.runtime.stages_of(key).into_iter().collect();
        let doomed = self.runtime.breadcrumbs().on_stages(&stages);

        let runtime = &self.runtime;
        let catalog = &self.catalog;
        let plan = plan_repair(
            runtime.breadcrumbs(),
            &doomed,
            |stage| {
                let definition = &runtime.stages.get(&stage)?.definition;
                catalog
                    .stage_definition(definition)
                    .ok()
                    .map(|d| d.breadcrumb_type)
            },
            &runtime.hand_pointers(),
        )?;

        // Hands on a removed stage follow their repaired breadcrumb pointer.
        let mut moved_hands = Vec::new();
        for hand in runtime.hands() {
            let on_removed = hand.stage.is_some_and(|s| stages.contains(&s));
            if !on_removed {
                continue;
            }
            let pointer = plan
                .hand_changes
                .iter()
                .find(|(h, _)| *h == hand.id)
                .map(|(_, p)| *p)
                .unwrap_or(hand.current_breadcrumb);
            let stage = match pointer {
                Some(crumb) => Some(runtime.breadcrumbs().get(crumb)?.stage),
                None => None,
            };
            moved_hands.push((hand.id, stage));
        }

        plan.apply(&mut self.runtime)?;
        for (hand, stage) in &moved_hands {
            self.runtime.hand_mut(*hand)?.stage = *stage;
        }
        for stage in &stages {
            self.runtime.stages.remove(stage);
        }
        self.catalog.remove_stage_definition(key)?;

        tracing::info!(
            stage = %key,
            stages_removed = stages.len(),
            breadcrumbs_removed = plan.removed.len(),
            hands_moved = moved_hands.len(),
            "stage definition deleted"
        );
        self.events.emit(FlowEvent::StageDefinitionDeleted {
            stage: key.to_string(),
            stages_removed: stages.len(),
            breadcrumbs_removed: plan.removed.len(),
            hands_moved: moved_hands.len(),
        });
        Ok(DeletionReport {
            stages_removed: stages.len(),
            repair: plan,
        })
    }

    // --- Checkpoints ---

    /// Capture the runtime as a serializable checkpoint.
    pub async fn to_checkpoint(&self) -> RuntimeCheckpoint {
        let mut hands = Vec::new();
        for hand in self.runtime.hands() {
            hands.push(HandRecord {
                id: hand.id,
                module: hand.module.clone(),
                frontend: hand.frontend.clone(),
                language: hand.language.clone(),
                stage: hand.stage,
                current_breadcrumb: hand.current_breadcrumb,
                status: hand.status,
                variables: hand.context.snapshot().await,
                logs: hand.context.logs().await,
            });
        }
        RuntimeCheckpoint::new(
            self.runtime.stages().cloned().collect(),
            self.runtime.breadcrumbs().clone(),
            hands,
        )
    }

    /// Save to the configured checkpoint directory. `None` when checkpointing is off.
    pub async fn checkpoint(&self) -> Result<Option<PathBuf>> {
        match &self.config.checkpoint_dir {
            Some(dir) => Ok(Some(self.checkpoint_to(dir).await?)),
            None => Ok(None),
        }
    }

    pub async fn checkpoint_to(&self, dir: &Path) -> Result<PathBuf> {
        let cp = self.to_checkpoint().await;
        checkpoint::save_checkpoint(&cp, dir).await
    }

    /// Load the configured checkpoint. Returns `false` when there is none.
    pub async fn restore(&mut self) -> Result<bool> {
        let Some(dir) = self.config.checkpoint_dir.clone() else {
            return Ok(false);
        };
        self.restore_from(&dir).await
    }

    /// Replace the runtime with the checkpoint in `dir`, if present.
    pub async fn restore_from(&mut self, dir: &Path) -> Result<bool> {
        let Some(cp) = checkpoint::load_checkpoint(dir).await? else {
            return Ok(false);
        };
        self.restore_checkpoint(cp).await?;
        Ok(true)
    }

    pub async fn restore_checkpoint(&mut self, cp: RuntimeCheckpoint) -> Result<()> {
        for stage in &cp.stages {
            self.catalog.stage_definition(&stage.definition)?;
        }
        cp.breadcrumbs.check_links()?;

        let mut runtime = Runtime::new();
        for stage in cp.stages {
            runtime.stages.insert(stage.id, stage);
        }
        runtime.breadcrumbs = cp.breadcrumbs;
        for record in cp.hands {
            let context = Context::with_values(record.variables);
            for entry in record.logs {
                context.append_log(entry).await;
            }
            runtime.insert_hand(Hand {
                id: record.id,
                module: record.module,
                frontend: record.frontend,
                language: record.language,
                stage: record.stage,
                current_breadcrumb: record.current_breadcrumb,
                status: record.status,
                context,
            });
        }
        tracing::info!(
            hands = runtime.hands.len(),
            stages = runtime.stages.len(),
            timestamp = %cp.timestamp,
            "runtime restored from checkpoint"
        );
        self.runtime = runtime;
        Ok(())
    }

    // --- Helpers ---

    async fn run_pre_action(&self, key: &StageKey, action: &str, context: &Context) -> Result<ActionOutcome> {
        let module = self.catalog.module(&key.module)?;
        ActionRunner::new(module, &self.engine)
            .with_stage(key.stage.clone())
            .with_limits(self.config.max_condition_depth, self.config.max_action_depth)
            .run(action, context)
            .await
    }

    fn breadcrumb_type_of(&self, crumb: BreadcrumbId) -> Result<BreadcrumbType> {
        let stage = self.runtime.breadcrumbs().get(crumb)?.stage;
        let key = &self.runtime.stage(stage)?.definition;
        Ok(self.catalog.stage_definition(key)?.breadcrumb_type)
    }

    fn announce_entry(&self, hand: HandId, key: &StageKey, preaction: Option<&ActionOutcome>, status: HandStatus) {
        let stage = key.to_string();
        self.events.emit(FlowEvent::StageEntered {
            hand,
            stage: stage.clone(),
        });
        if let (Some(outcome), Ok(definition)) = (preaction, self.catalog.stage_definition(key)) {
            self.events.emit(FlowEvent::PreActionRun {
                hand,
                stage: stage.clone(),
                action: definition.pre_action.clone().unwrap_or_default(),
                steps_run: outcome.steps_run,
            });
        }
        match status {
            HandStatus::Finished => {
                tracing::info!(hand = %hand, stage = %key, "end stage reached");
                self.events.emit(FlowEvent::EndStageReached { hand, stage });
            }
            HandStatus::Quit => {
                tracing::info!(hand = %hand, stage = %key, "hand quit");
                self.events.emit(FlowEvent::HandQuit { hand, stage });
            }
            HandStatus::Active => {}
        }
    }
}
