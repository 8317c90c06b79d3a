use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

pub(crate) type Component = Arc<dyn Any + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum ComponentError {
    #[error("no live component registered as `{0}`")]
    NotFound(String),
    #[error("component `{identifier}` is not a {expected}")]
    TypeMismatch {
        identifier: String,
        expected: &'static str,
    },
}

/// Capabilities an integration contributes, collected during its start.
/// Nothing here is visible to callers until the start has succeeded.
#[derive(Default)]
pub(crate) struct ComponentSet {
    entries: Vec<(String, Component)>,
}

impl ComponentSet {
    pub fn insert<T: Any + Send + Sync>(&mut self, identifier: impl Into<String>, component: Arc<T>) {
        self.entries.push((identifier.into(), component as Component));
    }

    /// Register one component under several identifiers.
    pub fn insert_all<T, I, S>(&mut self, identifiers: I, component: Arc<T>)
    where
        T: Any + Send + Sync,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for identifier in identifiers {
            self.entries
                .push((identifier.into(), component.clone() as Component));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct Registration {
    owner: String,
    component: Component,
}

/// Directory of live capabilities keyed by string identifier.
///
/// An identifier can be shared by several owners (e.g. a connector type slug
/// with two running instances); lookups return the earliest live registrant.
#[derive(Default)]
pub(crate) struct ComponentRequestEngine {
    entries: RwLock<HashMap<String, Vec<Registration>>>,
}

impl ComponentRequestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner: &str, identifier: impl Into<String>, component: Component) {
        let identifier = identifier.into();
        debug!(target: "fleet::components", owner, identifier = %identifier, "component registered");
        self.entries
            .write()
            .entry(identifier)
            .or_default()
            .push(Registration {
                owner: owner.to_string(),
                component,
            });
    }

    /// Returns the identifiers that were registered.
    pub fn register_set(&self, owner: &str, set: ComponentSet) -> Vec<String> {
        let mut identifiers = Vec::with_capacity(set.entries.len());
        for (identifier, component) in set.entries {
            self.register(owner, identifier.clone(), component);
            if !identifiers.contains(&identifier) {
                identifiers.push(identifier);
            }
        }
        identifiers
    }

    /// Drop everything `owner` registered. Returns how many registrations went away.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let mut guard = self.entries.write();
        let mut removed = 0;
        guard.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|registration| registration.owner != owner);
            removed += before - registrations.len();
            !registrations.is_empty()
        });
        if removed > 0 {
            debug!(target: "fleet::components", owner, removed, "components unregistered");
        }
        removed
    }

    pub fn request(&self, identifier: &str) -> Result<Component, ComponentError> {
        self.entries
            .read()
            .get(identifier)
            .and_then(|registrations| registrations.first())
            .map(|registration| registration.component.clone())
            .ok_or_else(|| ComponentError::NotFound(identifier.to_string()))
    }

    /// Typed lookup; call sites wrap this in their own helpers.
    pub fn request_as<T: Any + Send + Sync>(
        &self,
        identifier: &str,
    ) -> Result<Arc<T>, ComponentError> {
        self.request(identifier)?
            .downcast::<T>()
            .map_err(|_| ComponentError::TypeMismatch {
                identifier: identifier.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.read().contains_key(identifier)
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
