//! Shared errors and the participant variable store for the Ery flow engine.
//!
//! This crate provides the foundational types used across all other Ery crates:
//! - `EryError`: unified error taxonomy (authoring validation, runtime lookups, evaluation)
//! - `NotFoundKind`: which resolution failed when an `EryError::NotFound` is raised
//! - `Context`: thread-safe key-value store holding a participant's variables

use serde::{Deserialize, Serialize};

/// Unified error type for all Ery subsystems.
#[derive(Debug, thiserror::Error)]
pub enum EryError {
    // === Authoring Errors ===
    #[error("Validation failed for '{field}' on {object}: {message}")]
    Validation {
        object: String,
        field: String,
        message: String,
    },

    #[error("Condition '{condition}' references itself through sub-conditions: {path}")]
    ConditionCycle { condition: String, path: String },

    #[error("Condition '{condition}' exceeds the maximum nesting depth of {max_depth}")]
    ConditionDepthExceeded { condition: String, max_depth: usize },

    // === Runtime Resolution Errors ===
    #[error("{kind} not found: {message}")]
    NotFound { kind: NotFoundKind, message: String },

    #[error("Breadcrumb chain corrupted: {0}")]
    BreadcrumbCorrupted(String),

    #[error("Action '{action}' failed at step {step}: {message}")]
    ActionFailed {
        action: String,
        step: i64,
        message: String,
    },

    // === Script Errors ===
    #[error("Script parse error at offset {offset}: {message}")]
    ScriptParse { offset: usize, message: String },

    #[error("Script evaluation failed for '{label}': {message}")]
    ScriptEval { label: String, message: String },

    // === Engine Errors ===
    #[error("Engine at {endpoint} returned HTTP {status}: {message}")]
    EngineHttp {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Request to engine at {endpoint} timed out after {timeout_ms}ms")]
    EngineTimeout { endpoint: String, timeout_ms: u64 },

    #[error("Engine transport error: {0}")]
    EngineTransport(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl EryError {
    /// Build a field-scoped validation error.
    pub fn validation(
        object: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EryError::Validation {
            object: object.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build a resolution-not-found error.
    pub fn not_found(kind: NotFoundKind, message: impl Into<String>) -> Self {
        EryError::NotFound {
            kind,
            message: message.into(),
        }
    }

    /// Returns `true` for runtime resolution failures (no matching redirect, no
    /// stage template for a frontend, unknown names).
    pub fn is_not_found(&self) -> bool {
        matches!(self, EryError::NotFound { .. })
    }

    /// Returns the kind of lookup that failed, if this is a not-found error.
    pub fn not_found_kind(&self) -> Option<NotFoundKind> {
        match self {
            EryError::NotFound { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    ///
    /// The flow engine never retries on its own; callers decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            EryError::EngineTimeout { .. } | EryError::EngineTransport(_) => true,
            EryError::EngineHttp { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if the error is permanent: retrying will not help until
    /// the authored content changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EryError::Validation { .. }
                | EryError::ConditionCycle { .. }
                | EryError::ConditionDepthExceeded { .. }
                | EryError::ScriptParse { .. }
        )
    }

    /// Maps the error to an HTTP status code for the surrounding web layer.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            EryError::Validation { .. }
            | EryError::ConditionCycle { .. }
            | EryError::ConditionDepthExceeded { .. }
            | EryError::ScriptParse { .. } => Some(400),
            EryError::NotFound { .. } => Some(404),
            EryError::EngineHttp { .. } | EryError::EngineTransport(_) => Some(502),
            EryError::EngineTimeout { .. } => Some(504),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, EryError>`.
pub type Result<T> = std::result::Result<T, EryError>;

// ---------------------------------------------------------------------------
// NotFoundKind
// ---------------------------------------------------------------------------

/// The kind of object a runtime lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundKind {
    Redirect,
    StageTemplate,
    StageDefinition,
    Stage,
    Condition,
    Variable,
    Action,
    Template,
    Module,
    Hand,
    Breadcrumb,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotFoundKind::Redirect => "Redirect",
            NotFoundKind::StageTemplate => "StageTemplate",
            NotFoundKind::StageDefinition => "StageDefinition",
            NotFoundKind::Stage => "Stage",
            NotFoundKind::Condition => "Condition",
            NotFoundKind::Variable => "Variable",
            NotFoundKind::Action => "Action",
            NotFoundKind::Template => "Template",
            NotFoundKind::Module => "Module",
            NotFoundKind::Hand => "Hand",
            NotFoundKind::Breadcrumb => "Breadcrumb",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Context: a participant's variables
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Variable values and log of one participant, shared between handles.
///
/// Clones point at the same store. Pre-actions that must not leak partial
/// writes run against [`clone_isolated`](Context::clone_isolated) and are
/// committed with [`replace_with`](Context::replace_with).
#[derive(Clone, Default)]
pub struct Context {
    state: Arc<RwLock<Variables>>,
}

#[derive(Debug, Clone, Default)]
struct Variables {
    values: HashMap<String, serde_json::Value>,
    log: Vec<String>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with initial variable values and an empty log.
    pub fn with_values(values: HashMap<String, serde_json::Value>) -> Self {
        Self {
            state: Arc::new(RwLock::new(Variables {
                values,
                log: Vec::new(),
            })),
        }
    }

    pub async fn set(&self, name: impl Into<String>, value: serde_json::Value) {
        let mut state = self.state.write().await;
        state.values.insert(name.into(), value);
    }

    pub async fn get(&self, name: &str) -> Option<serde_json::Value> {
        let state = self.state.read().await;
        state.values.get(name).cloned()
    }

    pub async fn append_log(&self, entry: impl Into<String>) {
        let mut state = self.state.write().await;
        state.log.push(entry.into());
    }

    pub async fn logs(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.log.clone()
    }

    /// Current variable values.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        let state = self.state.read().await;
        state.values.clone()
    }

    /// Independent store holding a copy of the current values and log.
    pub async fn clone_isolated(&self) -> Context {
        let copy = self.state.read().await.clone();
        Context {
            state: Arc::new(RwLock::new(copy)),
        }
    }

    /// Take over the values and log of `other`. A no-op when both share a store.
    pub async fn replace_with(&self, other: &Context) {
        if Arc::ptr_eq(&self.state, &other.state) {
            return;
        }
        let incoming = other.state.read().await.clone();
        *self.state.write().await = incoming;
    }
}
