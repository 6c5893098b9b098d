//! Local registry of service handlers.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// A registered service callback: payload in, result or application-level
/// failure out
pub type ServiceHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Name → handler table, at most one active registration per name
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: DashMap<String, ServiceHandler>,
}

impl ServiceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler. Returns `false` when the name is taken — a
    /// duplicate registration is rejected, not replaced.
    pub fn register(&self, name: &str, handler: ServiceHandler) -> bool {
        match self.handlers.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    /// Remove a registration
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    /// Handler for a name, if registered
    pub fn handler(&self, name: &str) -> Option<ServiceHandler> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }

    /// Names of all registered services
    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_registration_per_name() {
        let registry = ServiceRegistry::new();
        assert!(registry.register("Ping", Arc::new(|payload| Ok(payload))));
        assert!(!registry.register("Ping", Arc::new(|_| Err("shadowed".to_string()))));

        // The original handler stays in place
        let handler = registry.handler("Ping").unwrap();
        assert_eq!(handler(Value::from(7)).unwrap(), Value::from(7));
    }

    #[test]
    fn test_unregister_frees_the_name() {
        let registry = ServiceRegistry::new();
        registry.register("Ping", Arc::new(|payload| Ok(payload)));
        assert!(registry.unregister("Ping"));
        assert!(!registry.unregister("Ping"));
        assert!(registry.register("Ping", Arc::new(|payload| Ok(payload))));
    }
}
