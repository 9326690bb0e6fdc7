use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

/// Structured errors for the service registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("service '{0}' not found")]
    NotFound(String),
    #[error("service '{name}' is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

/// Process-wide mapping from service name to a live object.
///
/// Modules publish named capabilities during `init`; consumers resolve them
/// in the post-init wiring pass or late-bind in `start`. A duplicate publish
/// fails — last-writer-wins is forbidden. Writes happen only during build;
/// reads are lifelong, so a read-write lock fits the access pattern.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `svc` under `name`. Fails if the name is taken.
    ///
    /// Capability objects are published as their capability type, e.g.
    /// `register(name, callable as Arc<dyn Callable>)`, and resolved with
    /// `get::<Arc<dyn Callable>>(name)`.
    pub fn register<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
        svc: T,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut services = self.services.write();
        if services.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        tracing::debug!(service = %name, "Registered service");
        services.insert(name, Arc::new(svc));
        Ok(())
    }

    /// Resolve `name` and assert its published type.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Result<T, RegistryError> {
        let services = self.services.read();
        let entry = services
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        entry
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| RegistryError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Resolve `name` without a type assertion.
    pub fn get_any(&self, name: &str) -> Result<Arc<dyn Any + Send + Sync>, RegistryError> {
        self.services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// Snapshot of registered names, sorted for deterministic iteration.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All services currently published with type `T`, with their names.
    ///
    /// Used by the wiring pass to discover capability implementations
    /// (e.g. every published `Arc<dyn AuthProvider>`).
    pub fn all_of<T: Clone + Send + Sync + 'static>(&self) -> Vec<(String, T)> {
        let services = self.services.read();
        let mut found: Vec<(String, T)> = services
            .iter()
            .filter_map(|(name, svc)| {
                svc.downcast_ref::<T>().cloned().map(|t| (name.clone(), t))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_get() {
        let reg = ServiceRegistry::new();
        reg.register("greeting", "hello".to_string()).unwrap();

        let s: String = reg.get("greeting").unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn duplicate_register_fails() {
        let reg = ServiceRegistry::new();
        reg.register("svc", 1u32).unwrap();

        let err = reg.register("svc", 2u32).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(n) if n == "svc"));

        // The original registration survives.
        let v: u32 = reg.get("svc").unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let reg = ServiceRegistry::new();
        let err = reg.get::<u32>("nope").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn get_wrong_type_is_mismatch() {
        let reg = ServiceRegistry::new();
        reg.register("svc", 1u32).unwrap();

        let err = reg.get::<String>("svc").unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
    }

    #[test]
    fn trait_objects_round_trip_through_any() {
        trait Greeter: Send + Sync {
            fn greet(&self) -> String;
        }
        struct En;
        impl Greeter for En {
            fn greet(&self) -> String {
                "hi".into()
            }
        }

        let reg = ServiceRegistry::new();
        let svc: Arc<dyn Greeter> = Arc::new(En);
        reg.register("greeter", svc).unwrap();

        let got: Arc<dyn Greeter> = reg.get("greeter").unwrap();
        assert_eq!(got.greet(), "hi");
    }

    #[test]
    fn all_of_filters_by_type() {
        let reg = ServiceRegistry::new();
        reg.register("b-num", 2u32).unwrap();
        reg.register("a-num", 1u32).unwrap();
        reg.register("text", "x".to_string()).unwrap();

        let nums = reg.all_of::<u32>();
        assert_eq!(nums.len(), 2);
        // Sorted by name for determinism.
        assert_eq!(nums[0].0, "a-num");
        assert_eq!(nums[1].0, "b-num");
    }

    #[test]
    fn list_is_sorted_snapshot() {
        let reg = ServiceRegistry::new();
        reg.register("zeta", ()).unwrap();
        reg.register("alpha", ()).unwrap();
        assert_eq!(reg.list(), vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
