//! Flow events for observability.
//!
//! [`FlowEngine`](crate::FlowEngine) emits [`FlowEvent`]s on a
//! [`tokio::sync::broadcast`] channel so observers can follow hands through a
//! module without reaching into engine state.

use serde::{Deserialize, Serialize};

use crate::breadcrumb::BreadcrumbId;
use crate::runtime::HandId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowEvent {
    HandStarted {
        hand: HandId,
        module: String,
        frontend: String,
        language: String,
    },
    StageEntered {
        hand: HandId,
        stage: String,
    },
    RedirectEvaluated {
        hand: HandId,
        from: String,
        order: i64,
        condition: Option<String>,
        passed: bool,
    },
    RedirectSelected {
        hand: HandId,
        from: String,
        to: String,
    },
    BreadcrumbCreated {
        hand: HandId,
        breadcrumb: BreadcrumbId,
        previous: Option<BreadcrumbId>,
    },
    BreadcrumbReplayed {
        hand: HandId,
        breadcrumb: BreadcrumbId,
        stage: String,
    },
    WentBack {
        hand: HandId,
        from: String,
        to: String,
    },
    PreActionRun {
        hand: HandId,
        stage: String,
        action: String,
        steps_run: usize,
    },
    EndStageReached {
        hand: HandId,
        stage: String,
    },
    HandQuit {
        hand: HandId,
        stage: String,
    },
    StageDefinitionDeleted {
        stage: String,
        stages_removed: usize,
        breadcrumbs_removed: usize,
        hands_moved: usize,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to current subscribers; dropped when nobody listens.
    pub fn emit(&self, event: FlowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
