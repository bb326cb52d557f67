//! The action registry: the vendor-protocol/HTTP layer this core depends
//! on only through the `ActionExecutor` trait boundary — `(name, params{},
//! tenant) -> {output{}, error?}`, side effects external, never throws out
//! of the engine.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

/// The result of one action call. `error` set means the action failed in
/// a way the step's `on_failure` edge should handle — this never surfaces
/// as a Rust `Err`, matching the contract that actions don't throw out of
/// the engine.
#[derive(Debug, Clone, Default)]
pub struct ActionResult {
    pub output: Value,
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(output: Value) -> Self {
        Self { output, error: None }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self { output: Value::Null, error: Some(message.into()) }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, params: Value, tenant: &str) -> ActionResult;
}

/// Holds named actions, each an external collaborator reached through
/// `ActionExecutor`. Registration happens once at start-up; dispatch is a
/// simple name lookup with a consistent not-found error shape.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Box<dyn ActionExecutor>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self { actions: HashMap::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, executor: Box<dyn ActionExecutor>) {
        self.actions.insert(name.into(), executor);
    }

    pub async fn call(&self, name: &str, params: Value, tenant: &str) -> ActionResult {
        match self.actions.get(name) {
            Some(executor) => executor.execute(params, tenant).await,
            None => ActionResult::err(format!("no action registered for {name}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ActionExecutor for Echo {
        async fn execute(&self, params: Value, _tenant: &str) -> ActionResult {
            ActionResult::ok(params)
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_action() {
        let mut registry = ActionRegistry::new();
        registry.register("echo", Box::new(Echo));

        let result = registry.call("echo", json!({"x": 1}), "tenant-a").await;
        assert!(result.is_ok());
        assert_eq!(result.output, json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_action_returns_populated_error_not_a_panic() {
        let registry = ActionRegistry::new();
        let result = registry.call("missing", Value::Null, "tenant-a").await;
        assert!(!result.is_ok());
    }
}
