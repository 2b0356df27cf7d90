use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Snapshot of the participant state an expression is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub era: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl EngineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stint(mut self, stint: impl Into<String>) -> Self {
        self.stint = Some(stint.into());
        self
    }

    pub fn with_era(mut self, era: impl Into<String>) -> Self {
        self.era = Some(era.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_variables<I, K>(mut self, variables: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        self.variables
            .extend(variables.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }
}

/// One evaluation request sent to an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JavascriptOp {
    /// Label of the evaluation (condition or action name).
    pub name: String,
    /// Millisecond timestamp identifying this revision of the code.
    pub version: i64,
    pub code: String,
    pub context: EngineContext,
}

impl JavascriptOp {
    pub fn new(name: impl Into<String>, code: impl Into<String>, context: EngineContext) -> Self {
        Self {
            name: name.into(),
            version: chrono::Utc::now().timestamp_millis(),
            code: code.into(),
            context,
        }
    }
}

/// Body returned by a remote engine: either a value or an error message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineReply {
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}
