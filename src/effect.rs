//! Validation and wire serialization of forwards and side effects.
//!
//! A target method is named by (service, command); the service must be
//! registered as a component and the method must exist on it, resolved
//! against the descriptor pool. The payload must already be Any-encoded
//! with the method's input type.

use std::collections::HashSet;

use prost_reflect::ServiceDescriptor;
use prost_types::Any;

use crate::any_support::{full_name, AnySupport};
use crate::metadata::Metadata;
use crate::reply::{Effect, Forward};

/// Errors from effect and forward serialization.
#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error("Service not registered as a component: {0}")]
    UnknownService(String),

    #[error("Method {method} is not part of service {service}")]
    MethodNotInService { service: String, method: String },

    #[error("Payload type {payload} does not match input type {expected} of {service}.{method}")]
    PayloadType {
        service: String,
        method: String,
        expected: String,
        payload: String,
    },
}

/// Serializer bound to the registered component services.
#[derive(Debug, Clone)]
pub struct EffectSerializer {
    any_support: AnySupport,
    services: HashSet<String>,
}

impl EffectSerializer {
    /// Create a serializer over the given registered service names.
    pub fn new(any_support: AnySupport, services: impl IntoIterator<Item = String>) -> Self {
        Self {
            any_support,
            services: services.into_iter().collect(),
        }
    }

    /// Validate and build a side effect targeting `service_name.command_name`.
    pub fn serialize_effect(
        &self,
        service_name: &str,
        command_name: &str,
        payload: Any,
        synchronous: bool,
        metadata: Option<Metadata>,
    ) -> Result<Effect, EffectError> {
        self.validate(service_name, command_name, &payload)?;
        Ok(Effect {
            service_name: service_name.to_string(),
            command_name: command_name.to_string(),
            payload,
            synchronous,
            metadata: metadata.unwrap_or_default(),
        })
    }

    /// Validate and build a forward targeting `service_name.command_name`.
    pub fn serialize_forward(
        &self,
        service_name: &str,
        command_name: &str,
        payload: Any,
        metadata: Option<Metadata>,
    ) -> Result<Forward, EffectError> {
        self.validate(service_name, command_name, &payload)?;
        Ok(Forward {
            service_name: service_name.to_string(),
            command_name: command_name.to_string(),
            payload,
            metadata: metadata.unwrap_or_default(),
        })
    }

    fn validate(
        &self,
        service_name: &str,
        command_name: &str,
        payload: &Any,
    ) -> Result<(), EffectError> {
        if !self.services.contains(service_name) {
            return Err(EffectError::UnknownService(service_name.to_string()));
        }

        // A registered service missing from the pool is equally unknown.
        let service: ServiceDescriptor = self
            .any_support
            .pool()
            .services()
            .find(|s| s.full_name() == service_name)
            .ok_or_else(|| EffectError::UnknownService(service_name.to_string()))?;

        let method = service
            .methods()
            .find(|m| m.name() == command_name)
            .ok_or_else(|| EffectError::MethodNotInService {
                service: service_name.to_string(),
                method: command_name.to_string(),
            })?;

        let expected = method.input().full_name().to_string();
        let payload_type = full_name(&payload.type_url);
        if payload_type != expected {
            return Err(EffectError::PayloadType {
                service: service_name.to_string(),
                method: command_name.to_string(),
                expected,
                payload: payload_type.to_string(),
            });
        }

        Ok(())
    }
}
