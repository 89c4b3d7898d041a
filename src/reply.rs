//! Command outcomes assembled by user handlers.
//!
//! A [`Reply`] carries at most one of message / forward / failure, plus an
//! ordered list of side effects and optional metadata. Wire emission
//! rejects ill-formed combinations.

use prost_types::Any;

use crate::context::ContextFailure;
use crate::metadata::Metadata;
use crate::proto::{client_action, ClientAction, SideEffect};

/// A redirect of the current command to another service method.
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub(crate) service_name: String,
    pub(crate) command_name: String,
    pub(crate) payload: Any,
    pub(crate) metadata: Metadata,
}

impl Forward {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    pub fn payload(&self) -> &Any {
        &self.payload
    }

    pub(crate) fn to_proto(&self) -> crate::proto::Forward {
        crate::proto::Forward {
            service_name: self.service_name.clone(),
            command_name: self.command_name.clone(),
            payload: Some(self.payload.clone()),
            metadata: self.metadata.to_proto(),
        }
    }
}

/// A call to another service issued as a side of the current command.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    pub(crate) service_name: String,
    pub(crate) command_name: String,
    pub(crate) payload: Any,
    pub(crate) synchronous: bool,
    pub(crate) metadata: Metadata,
}

impl Effect {
    pub(crate) fn to_proto(&self) -> SideEffect {
        SideEffect {
            service_name: self.service_name.clone(),
            command_name: self.command_name.clone(),
            payload: Some(self.payload.clone()),
            synchronous: self.synchronous,
            metadata: self.metadata.to_proto(),
        }
    }
}

/// A reply carrying both a message and a forward, which the wire protocol
/// cannot represent.
#[derive(Debug, thiserror::Error)]
#[error("Reply must not carry both a message and a forward")]
pub struct IllFormedReply;

/// The outcome of a command.
///
/// Built with [`Reply::message`], [`Reply::forward`], [`Reply::failure`], or
/// [`Reply::no_reply`]; side effects are appended with
/// [`Reply::add_effects`].
#[derive(Debug, Clone, Default)]
pub struct Reply {
    message: Option<(Any, Option<Metadata>)>,
    forward: Option<Forward>,
    failure: Option<ContextFailure>,
    effects: Vec<Effect>,
}

impl Reply {
    /// Reply to the caller with a message.
    pub fn message(payload: Any) -> Self {
        Self {
            message: Some((payload, None)),
            ..Default::default()
        }
    }

    /// Reply to the caller with a message and reply metadata.
    pub fn message_with_metadata(payload: Any, metadata: Metadata) -> Self {
        Self {
            message: Some((payload, Some(metadata))),
            ..Default::default()
        }
    }

    /// Redirect the caller's command to another method.
    pub fn forward(forward: Forward) -> Self {
        Self {
            forward: Some(forward),
            ..Default::default()
        }
    }

    /// Fail the command.
    pub fn failure(failure: ContextFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Default::default()
        }
    }

    /// Complete the command without telling the caller anything.
    pub fn no_reply() -> Self {
        Self::default()
    }

    /// Append side effects, preserving order.
    pub fn add_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }

    /// Whether this reply fails the command.
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    /// Emit the wire client action and side effects.
    ///
    /// Fails when the reply carries both a message and a forward.
    pub(crate) fn into_wire(
        self,
        command_id: i64,
    ) -> Result<(Option<ClientAction>, Vec<SideEffect>), IllFormedReply> {
        let effects = self.effects.iter().map(Effect::to_proto).collect();

        let action = match (self.message, self.forward, self.failure) {
            (Some(_), Some(_), _) => return Err(IllFormedReply),
            (_, _, Some(failure)) => Some(client_action::Action::Failure(
                failure.to_proto(command_id),
            )),
            (Some((payload, metadata)), None, None) => {
                Some(client_action::Action::Reply(crate::proto::Reply {
                    payload: Some(payload),
                    metadata: metadata.as_ref().and_then(Metadata::to_proto),
                }))
            }
            (None, Some(forward), None) => {
                Some(client_action::Action::Forward(forward.to_proto()))
            }
            (None, None, None) => None,
        };

        Ok((action.map(|a| ClientAction { action: Some(a) }), effects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(url: &str) -> Any {
        Any {
            type_url: url.to_string(),
            value: vec![],
        }
    }

    fn forward() -> Forward {
        Forward {
            service_name: "com.example.Other".to_string(),
            command_name: "Receive".to_string(),
            payload: any("type.googleapis.com/com.example.In"),
            metadata: Metadata::new(),
        }
    }

    fn effect() -> Effect {
        Effect {
            service_name: "com.example.Other".to_string(),
            command_name: "Notify".to_string(),
            payload: any("type.googleapis.com/com.example.In"),
            synchronous: false,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_message_reply() {
        let (action, effects) = Reply::message(any("type.googleapis.com/com.example.Out"))
            .into_wire(1)
            .unwrap();
        assert!(matches!(
            action.unwrap().action,
            Some(client_action::Action::Reply(_))
        ));
        assert!(effects.is_empty());
    }

    #[test]
    fn test_forward_reply() {
        let (action, _) = Reply::forward(forward()).into_wire(1).unwrap();
        match action.unwrap().action {
            Some(client_action::Action::Forward(f)) => {
                assert_eq!(f.service_name, "com.example.Other");
                assert_eq!(f.command_name, "Receive");
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_reply_carries_command_id() {
        let (action, _) = Reply::failure(ContextFailure::new("denied"))
            .into_wire(9)
            .unwrap();
        match action.unwrap().action {
            Some(client_action::Action::Failure(f)) => {
                assert_eq!(f.command_id, 9);
                assert_eq!(f.description, "denied");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_no_reply_has_no_action() {
        let (action, _) = Reply::no_reply().into_wire(1).unwrap();
        assert!(action.is_none());
    }

    #[test]
    fn test_effects_preserve_order() {
        let mut second = effect();
        second.command_name = "NotifyAgain".to_string();

        let (_, effects) = Reply::no_reply()
            .add_effects(vec![effect(), second])
            .into_wire(1)
            .unwrap();
        assert_eq!(effects.len(), 2);
        assert_eq!(effects[0].command_name, "Notify");
        assert_eq!(effects[1].command_name, "NotifyAgain");
    }

    #[test]
    fn test_message_and_forward_rejected_at_emission() {
        let mut reply = Reply::message(any("type.googleapis.com/com.example.Out"));
        reply.forward = Some(forward());
        assert!(reply.into_wire(1).is_err());
    }
}
