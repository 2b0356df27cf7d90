//! Runtime state: stage instances, hands and their breadcrumb history.

use std::collections::BTreeMap;
use std::fmt;

use ery_types::{Context, EryError, NotFoundKind, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::breadcrumb::{BreadcrumbArena, BreadcrumbId};
use crate::catalog::StageKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub Uuid);

impl StageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandId(pub Uuid);

impl HandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One instantiation of a stage definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub definition: StageKey,
    /// Set once the definition's pre-action has run for this instance.
    #[serde(default)]
    pub preaction_started: bool,
}

impl Stage {
    pub fn new(definition: StageKey) -> Self {
        Self {
            id: StageId::new(),
            definition,
            preaction_started: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandStatus {
    #[default]
    Active,
    /// Reached an end stage.
    Finished,
    /// Left through a quit action step.
    Quit,
}

impl fmt::Display for HandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandStatus::Active => "active",
            HandStatus::Finished => "finished",
            HandStatus::Quit => "quit",
        })
    }
}

/// A participant moving through one module.
///
/// Clones share the same variable store.
#[derive(Clone)]
pub struct Hand {
    pub id: HandId,
    pub module: String,
    pub frontend: String,
    pub language: String,
    pub stage: Option<StageId>,
    pub current_breadcrumb: Option<BreadcrumbId>,
    pub status: HandStatus,
    pub context: Context,
}

impl Hand {
    pub fn new(module: impl Into<String>, frontend: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: HandId::new(),
            module: module.into(),
            frontend: frontend.into(),
            language: language.into(),
            stage: None,
            current_breadcrumb: None,
            status: HandStatus::Active,
            context: Context::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == HandStatus::Active
    }
}

impl fmt::Debug for Hand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hand")
            .field("id", &self.id)
            .field("module", &self.module)
            .field("frontend", &self.frontend)
            .field("language", &self.language)
            .field("stage", &self.stage)
            .field("current_breadcrumb", &self.current_breadcrumb)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Runtime {
    pub(crate) stages: BTreeMap<StageId, Stage>,
    pub(crate) hands: BTreeMap<HandId, Hand>,
    pub(crate) breadcrumbs: BreadcrumbArena,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_stage(&mut self, definition: StageKey) -> StageId {
        let stage = Stage::new(definition);
        let id = stage.id;
        self.stages.insert(id, stage);
        id
    }

    pub fn stage(&self, id: StageId) -> Result<&Stage> {
        self.stages
            .get(&id)
            .ok_or_else(|| EryError::not_found(NotFoundKind::Stage, format!("no stage {}", id)))
    }

    pub fn stage_mut(&mut self, id: StageId) -> Result<&mut Stage> {
        self.stages
            .get_mut(&id)
            .ok_or_else(|| EryError::not_found(NotFoundKind::Stage, format!("no stage {}", id)))
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values()
    }

    /// Stage instances of one definition.
    pub fn stages_of(&self, definition: &StageKey) -> Vec<StageId> {
        self.stages
            .values()
            .filter(|s| &s.definition == definition)
            .map(|s| s.id)
            .collect()
    }

    pub fn insert_hand(&mut self, hand: Hand) -> HandId {
        let id = hand.id;
        self.hands.insert(id, hand);
        id
    }

    pub fn hand(&self, id: HandId) -> Result<&Hand> {
        self.hands
            .get(&id)
            .ok_or_else(|| EryError::not_found(NotFoundKind::Hand, format!("no hand {}", id)))
    }

    pub fn hand_mut(&mut self, id: HandId) -> Result<&mut Hand> {
        self.hands
            .get_mut(&id)
            .ok_or_else(|| EryError::not_found(NotFoundKind::Hand, format!("no hand {}", id)))
    }

    pub fn hands(&self) -> impl Iterator<Item = &Hand> {
        self.hands.values()
    }

    pub fn breadcrumbs(&self) -> &BreadcrumbArena {
        &self.breadcrumbs
    }

    pub fn breadcrumbs_mut(&mut self) -> &mut BreadcrumbArena {
        &mut self.breadcrumbs
    }

    /// Every hand's current breadcrumb pointer.
    pub fn hand_pointers(&self) -> BTreeMap<HandId, Option<BreadcrumbId>> {
        self.hands
            .values()
            .map(|h| (h.id, h.current_breadcrumb))
            .collect()
    }

    /// Stage definition of the hand's current stage.
    pub fn current_definition(&self, hand: HandId) -> Result<&StageKey> {
        let hand = self.hand(hand)?;
        let stage = hand.stage.ok_or_else(|| {
            EryError::not_found(NotFoundKind::Stage, format!("hand {} has no current stage", hand.id))
        })?;
        Ok(&self.stage(stage)?.definition)
    }
}
