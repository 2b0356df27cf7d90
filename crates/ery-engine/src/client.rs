use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ery_types::{EryError, Result};

use crate::{EngineContext, JavascriptOp};

// ---------------------------------------------------------------------------
// EngineClient
// ---------------------------------------------------------------------------

/// A capability that runs JavaScript expressions against a context snapshot.
#[async_trait]
pub trait EngineClient: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, op: &JavascriptOp) -> Result<serde_json::Value>;
}

// ---------------------------------------------------------------------------
// DynEngineClient
// ---------------------------------------------------------------------------

pub struct DynEngineClient(Box<dyn EngineClient>);

impl DynEngineClient {
    pub fn new(client: impl EngineClient + 'static) -> Self {
        Self(Box::new(client))
    }

    pub async fn run(&self, op: &JavascriptOp) -> Result<serde_json::Value> {
        self.0.run(op).await
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

pub trait Middleware: Send + Sync {
    fn before(&self, _op: &mut JavascriptOp) {}
    fn after(&self, _op: &JavascriptOp, _value: &mut serde_json::Value) {}
    fn on_error(&self, _op: &JavascriptOp, _error: &EryError) {}
}

// ---------------------------------------------------------------------------
// Built-in middleware: LoggingMiddleware
// ---------------------------------------------------------------------------

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, op: &mut JavascriptOp) {
        tracing::debug!(
            label = %op.name,
            code = %op.code,
            variables = op.context.variables.len(),
            "engine request"
        );
    }

    fn after(&self, op: &JavascriptOp, value: &mut serde_json::Value) {
        tracing::debug!(label = %op.name, result = %value, "engine response");
    }

    fn on_error(&self, op: &JavascriptOp, error: &EryError) {
        tracing::warn!(label = %op.name, error = %error, "engine evaluation failed");
    }
}

// ---------------------------------------------------------------------------
// Built-in middleware: CallCountingMiddleware
// ---------------------------------------------------------------------------

/// Counts evaluations and records their labels in call order.
///
/// Clones share the same counters, so a handle can be kept after the
/// middleware is moved into an [`Engine`].
#[derive(Clone, Default)]
pub struct CallCountingMiddleware {
    total: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    labels: Arc<Mutex<Vec<String>>>,
}

impl CallCountingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_calls(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn failed_calls(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Labels of every evaluation seen so far.
    pub fn labels(&self) -> Vec<String> {
        self.labels
            .lock()
            .map(|labels| labels.clone())
            .unwrap_or_default()
    }

    pub fn calls_for(&self, label: &str) -> usize {
        self.labels().iter().filter(|l| l.as_str() == label).count()
    }
}

impl Middleware for CallCountingMiddleware {
    fn before(&self, op: &mut JavascriptOp) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut labels) = self.labels.lock() {
            labels.push(op.name.clone());
        }
    }

    fn on_error(&self, _op: &JavascriptOp, _error: &EryError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The injected evaluation capability used by conditions and actions.
///
/// Every call reaches the client; results are never cached.
pub struct Engine {
    client: DynEngineClient,
    middleware: Vec<Box<dyn Middleware>>,
}

impl Engine {
    pub fn new(client: impl EngineClient + 'static) -> Self {
        Self {
            client: DynEngineClient::new(client),
            middleware: Vec::new(),
        }
    }

    pub fn with_middleware(mut self, m: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(m));
        self
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    /// Evaluate `code` and return the raw result value.
    pub async fn evaluate_without_side_effects(
        &self,
        label: &str,
        code: &str,
        context: &EngineContext,
    ) -> Result<serde_json::Value> {
        let mut op = JavascriptOp::new(label, code, context.clone());

        for m in &self.middleware {
            m.before(&mut op);
        }

        let mut value = match self.client.run(&op).await {
            Ok(value) => value,
            Err(e) => {
                for m in &self.middleware {
                    m.on_error(&op, &e);
                }
                return Err(e);
            }
        };

        for m in &self.middleware {
            m.after(&op, &mut value);
        }

        Ok(value)
    }

    /// Evaluate `code` and return the JavaScript truthiness of the result.
    pub async fn evaluate_bool(
        &self,
        label: &str,
        code: &str,
        context: &EngineContext,
    ) -> Result<bool> {
        let value = self
            .evaluate_without_side_effects(label, code, context)
            .await?;
        Ok(ery_script::ScriptValue::from(value).is_truthy())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
