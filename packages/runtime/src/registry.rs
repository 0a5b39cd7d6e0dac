//! Job registry mapping payload type tags to blueprints.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::task::{Runner, Task, task_tag};

type Reconstruct =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn Runner>, serde_json::Error> + Send + Sync>;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no job type registered for payload type '{0}'")]
    NotFound(String),

    #[error("cannot decode payload for '{tag}': {source}")]
    Decode {
        tag: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Factory for one registered job type.
#[derive(Clone)]
pub struct Blueprint {
    tag: String,
    type_name: &'static str,
    reconstruct: Reconstruct,
}

impl Blueprint {
    /// Blueprint for `T`, tagged by its identity or type name.
    pub fn of<T: Task>() -> Self {
        Self {
            tag: task_tag::<T>(),
            type_name: std::any::type_name::<T>(),
            reconstruct: Arc::new(|payload: &[u8]| {
                T::from_payload(payload).map(|task| Box::new(task) as Box<dyn Runner>)
            }),
        }
    }

    /// The payload type tag this blueprint answers to.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The Rust type this blueprint builds.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Build a runnable instance populated from `payload`.
    pub fn reconstruct(&self, payload: &[u8]) -> Result<Box<dyn Runner>, RegistryError> {
        (self.reconstruct)(payload).map_err(|source| RegistryError::Decode {
            tag: self.tag.clone(),
            source,
        })
    }
}

impl std::fmt::Debug for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blueprint")
            .field("tag", &self.tag)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Registry shared between an orchestrator and the pools it creates.
pub type SharedRegistry = Arc<RwLock<JobRegistry>>;

/// Registry of blueprints keyed by payload type tag.
#[derive(Debug, Default)]
pub struct JobRegistry {
    blueprints: HashMap<String, Blueprint>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the registry for sharing with workers.
    pub fn shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// Register a blueprint. A later registration under the same tag
    /// replaces the earlier one, which is returned.
    pub fn register(&mut self, blueprint: Blueprint) -> Option<Blueprint> {
        let tag = blueprint.tag.clone();
        let previous = self.blueprints.insert(tag.clone(), blueprint);
        match &previous {
            Some(old) => tracing::warn!(
                tag = %tag,
                replaced = old.type_name,
                "re-registered job type"
            ),
            None => tracing::info!(tag = %tag, "registered job type"),
        }
        previous
    }

    /// Register `T` under its tag.
    pub fn register_task<T: Task>(&mut self) -> Option<Blueprint> {
        self.register(Blueprint::of::<T>())
    }

    /// Get the blueprint for a tag.
    pub fn lookup(&self, tag: &str) -> Result<&Blueprint, RegistryError> {
        self.blueprints
            .get(tag)
            .ok_or_else(|| RegistryError::NotFound(tag.to_string()))
    }

    /// Look up `tag` and build a runnable from `payload`.
    pub fn reconstruct(&self, tag: &str, payload: &[u8]) -> Result<Box<dyn Runner>, RegistryError> {
        self.lookup(tag)?.reconstruct(payload)
    }

    /// Check if a tag is registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.blueprints.contains_key(tag)
    }

    /// List all registered tags.
    pub fn tags(&self) -> Vec<&str> {
        self.blueprints.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.blueprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blueprints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::task::RunFuture;

    #[derive(Serialize, Deserialize)]
    struct First {
        n: u32,
    }

    impl Runner for First {
        fn run(&self) -> RunFuture<'_> {
            Box::pin(async { Ok(()) })
        }
    }

    impl Task for First {
        fn identify() -> Option<&'static str> {
            Some("dup")
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Second;

    impl Runner for Second {
        fn run(&self) -> RunFuture<'_> {
            Box::pin(async { Err("second".into()) })
        }
    }

    impl Task for Second {
        fn identify() -> Option<&'static str> {
            Some("dup")
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Anonymous {
        label: String,
    }

    impl Runner for Anonymous {
        fn run(&self) -> RunFuture<'_> {
            Box::pin(async { Ok(()) })
        }
    }

    impl Task for Anonymous {}

    #[test]
    fn last_registration_wins() {
        let mut registry = JobRegistry::new();
        assert!(registry.register_task::<First>().is_none());
        let replaced = registry.register_task::<Second>();

        assert_eq!(replaced.map(|b| b.type_name()), Some(std::any::type_name::<First>()));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup("dup").unwrap().type_name(),
            std::any::type_name::<Second>()
        );
    }

    #[test]
    fn untagged_types_fall_back_to_type_name() {
        let mut registry = JobRegistry::new();
        registry.register_task::<Anonymous>();

        let tag = std::any::type_name::<Anonymous>();
        assert_eq!(task_tag::<Anonymous>(), tag);
        assert!(registry.contains(tag));
        assert!(registry.reconstruct(tag, br#"{"label":"x"}"#).is_ok());
    }

    #[test]
    fn unknown_tag_is_not_found() {
        let registry = JobRegistry::new();
        assert!(matches!(
            registry.lookup("missing"),
            Err(RegistryError::NotFound(tag)) if tag == "missing"
        ));
    }

    #[test]
    fn bad_payload_is_a_decode_error() {
        let mut registry = JobRegistry::new();
        registry.register_task::<First>();
        assert!(matches!(
            registry.reconstruct("dup", b"{\"n\":\"nope\"}"),
            Err(RegistryError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn reconstructed_runner_runs_the_registered_type() {
        let mut registry = JobRegistry::new();
        registry.register_task::<First>();
        registry.register_task::<Second>();

        let runner = registry.reconstruct("dup", b"null").unwrap();
        assert!(runner.run().await.is_err());
    }
}
