//! Handler registry
//!
//! Maps handler names used in action steps to their implementations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::{FnHandler, HandlerError, HandlerInvocation, StepHandler};

/// Registry of named step handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = HandlerRegistry::new();
    /// registry.register("send_email", SendEmail::new(mailer));
    /// ```
    pub fn register(&mut self, name: impl Into<String>, handler: impl StepHandler) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(HandlerInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(name, FnHandler::new(f));
    }

    /// Builder-style registration
    pub fn with_handler(mut self, name: impl Into<String>, handler: impl StepHandler) -> Self {
        self.register(name, handler);
        self
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Check if a handler is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Get the number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Get all registered handler names
    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("noop", |_inv| async { Ok::<_, HandlerError>(Value::Null) });

        assert!(registry.contains("noop"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let handler = registry.get("noop").unwrap();
        let inv = HandlerInvocation::new("t", "s", Uuid::now_v7(), "step");
        assert_eq!(handler.handle(&inv).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_register_replaces_existing() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("h", |_inv| async { Ok::<_, HandlerError>(json!(1)) });
        registry.register_fn("h", |_inv| async { Ok::<_, HandlerError>(json!(2)) });

        let inv = HandlerInvocation::new("t", "s", Uuid::now_v7(), "step");
        let output = registry.get("h").unwrap().handle(&inv).await.unwrap();
        assert_eq!(output, json!(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("send_email", |_inv| async { Ok::<_, HandlerError>(Value::Null) });

        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("send_email"));
    }

    #[test]
    fn test_handler_names_iterator() {
        let registry = HandlerRegistry::new()
            .with_handler("log", FnHandler::new(|_inv: HandlerInvocation| async { Ok::<_, HandlerError>(Value::Null) }));

        let names: Vec<_> = registry.handler_names().collect();
        assert_eq!(names, vec!["log"]);
    }
}
