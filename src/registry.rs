//! The component registry.
//!
//! Holds every component added before `start()`. Read-only afterwards:
//! the runtime clones the registry behind an `Arc` and no further
//! registration is possible.

use std::sync::Arc;

use crate::component::{
    ActionHandler, Component, EntityOptions, EventSourcedHandler, PreStartInfo,
    ReplicatedEntityHandler, ValueEntityHandler,
};
use crate::proto;

/// Errors from component registration.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("A component is already registered for service {0}")]
    DuplicateService(String),
}

/// Components keyed by fully-qualified service name, in registration
/// order.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    components: Vec<Component>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component. Service names are unique across all kinds.
    pub fn register(&mut self, component: Component) -> Result<(), RegistryError> {
        if self.get(component.service_name()).is_some() {
            return Err(RegistryError::DuplicateService(
                component.service_name().to_string(),
            ));
        }
        self.components.push(component);
        Ok(())
    }

    pub fn get(&self, service_name: &str) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| c.service_name() == service_name)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|c| c.service_name())
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Discovery descriptions, in registration order.
    pub(crate) fn descriptions(&self) -> Vec<proto::Component> {
        self.components.iter().map(|c| c.to_proto()).collect()
    }

    /// Run every component's pre-start hook.
    pub(crate) fn pre_start_all(&self, info: &PreStartInfo) {
        for component in &self.components {
            component.pre_start(info);
        }
    }

    pub(crate) fn value_entity(
        &self,
        service_name: &str,
    ) -> Option<(Arc<dyn ValueEntityHandler>, EntityOptions)> {
        match self.get(service_name)? {
            Component::ValueEntity {
                handler, options, ..
            } => Some((Arc::clone(handler), options.clone())),
            _ => None,
        }
    }

    pub(crate) fn event_sourced(
        &self,
        service_name: &str,
    ) -> Option<(Arc<dyn EventSourcedHandler>, EntityOptions)> {
        match self.get(service_name)? {
            Component::EventSourced {
                handler, options, ..
            } => Some((Arc::clone(handler), options.clone())),
            _ => None,
        }
    }

    pub(crate) fn replicated(
        &self,
        service_name: &str,
    ) -> Option<(Arc<dyn ReplicatedEntityHandler>, EntityOptions)> {
        match self.get(service_name)? {
            Component::Replicated {
                handler, options, ..
            } => Some((Arc::clone(handler), options.clone())),
            _ => None,
        }
    }

    pub(crate) fn action(&self, service_name: &str) -> Option<Arc<dyn ActionHandler>> {
        match self.get(service_name)? {
            Component::Action { handler, .. } => Some(Arc::clone(handler)),
            _ => None,
        }
    }
}
