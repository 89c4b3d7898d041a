//! User-raisable command failures.

use crate::proto::Failure;

/// A failure raised by user code during command handling.
///
/// Becomes a `Failure` reply on the current command; the entity instance
/// keeps running. The optional gRPC status code is surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFailure {
    description: String,
    grpc_status: Option<i32>,
}

impl ContextFailure {
    /// A failure with a description and no explicit status code.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            grpc_status: None,
        }
    }

    /// A failure carrying a gRPC status code.
    ///
    /// Valid codes are 1 through 16; OK (0) cannot be used for a failure.
    pub fn with_status(
        description: impl Into<String>,
        grpc_status: i32,
    ) -> Result<Self, InvalidStatus> {
        if !(1..=16).contains(&grpc_status) {
            return Err(InvalidStatus(grpc_status));
        }
        Ok(Self {
            description: description.into(),
            grpc_status: Some(grpc_status),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn grpc_status(&self) -> Option<i32> {
        self.grpc_status
    }

    /// The wire form, tied to the command it failed.
    pub(crate) fn to_proto(&self, command_id: i64) -> Failure {
        Failure {
            command_id,
            description: self.description.clone(),
            grpc_status_code: self.grpc_status.unwrap_or(0),
        }
    }
}

impl std::fmt::Display for ContextFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.grpc_status {
            Some(code) => write!(f, "{} (gRPC status {})", self.description, code),
            None => write!(f, "{}", self.description),
        }
    }
}

impl std::error::Error for ContextFailure {}

impl From<crate::effect::EffectError> for ContextFailure {
    fn from(error: crate::effect::EffectError) -> Self {
        ContextFailure::new(error.to_string())
    }
}

impl From<crate::any_support::AnySupportError> for ContextFailure {
    fn from(error: crate::any_support::AnySupportError) -> Self {
        ContextFailure::new(error.to_string())
    }
}

impl From<crate::crdt::CrdtError> for ContextFailure {
    fn from(error: crate::crdt::CrdtError) -> Self {
        ContextFailure::new(error.to_string())
    }
}

/// A gRPC status code outside the failure range 1..=16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid gRPC status code for failure: {0} (must be 1-16)")]
pub struct InvalidStatus(pub i32);
