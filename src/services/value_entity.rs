//! Value entity service.
//!
//! One stream per entity instance: an init frame, then commands, processed
//! strictly in order. The only state the proxy persists is the value
//! shipped back in each reply's state action.

use std::sync::Arc;

use prost_types::Any;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, warn};

use crate::component::ValueEntityHandler;
use crate::context::ContextFailure;
use crate::effect::{EffectError, EffectSerializer};
use crate::metadata::Metadata;
use crate::proto::value_entities_server::ValueEntities;
use crate::proto::{
    client_action, value_entity_action, value_entity_stream_in, value_entity_stream_out,
    ClientAction, Command, ValueEntityAction, ValueEntityDelete, ValueEntityReply,
    ValueEntityStreamIn, ValueEntityStreamOut, ValueEntityUpdate,
};
use crate::registry::ComponentRegistry;
use crate::reply::{Effect, Forward};

use super::{EntityTracker, ProtocolError, ENTITY_QUEUE_DEPTH, REPLY_QUEUE_DEPTH};

/// State change requested by a command.
#[derive(Debug, Clone)]
enum StateAction {
    Update(Any),
    Delete,
}

/// Context handed to a value entity command handler.
pub struct ValueEntityCommandContext {
    entity_id: String,
    metadata: Metadata,
    state: Option<Any>,
    state_action: Option<StateAction>,
    effects: Vec<Effect>,
    forward: Option<Forward>,
    effect_serializer: Arc<EffectSerializer>,
}

impl ValueEntityCommandContext {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Metadata forwarded from the caller's request.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The entity's current state, as this command sees it.
    pub fn state(&self) -> Option<&Any> {
        self.state.as_ref()
    }

    /// Replace the entity's state. Takes effect when the command succeeds.
    pub fn update_state(&mut self, state: Any) {
        self.state = Some(state.clone());
        self.state_action = Some(StateAction::Update(state));
    }

    /// Delete the entity's state. The in-memory state resets to the
    /// handler's initial state when the command succeeds.
    pub fn delete_state(&mut self) {
        self.state = None;
        self.state_action = Some(StateAction::Delete);
    }

    /// Attach a side effect to the eventual reply.
    pub fn effect(
        &mut self,
        service_name: &str,
        command_name: &str,
        payload: Any,
        synchronous: bool,
        metadata: Option<Metadata>,
    ) -> Result<(), EffectError> {
        let effect = self.effect_serializer.serialize_effect(
            service_name,
            command_name,
            payload,
            synchronous,
            metadata,
        )?;
        self.effects.push(effect);
        Ok(())
    }

    /// Forward the command to another method. Used when the returned reply
    /// carries no message or forward of its own.
    pub fn forward(
        &mut self,
        service_name: &str,
        command_name: &str,
        payload: Any,
        metadata: Option<Metadata>,
    ) -> Result<(), EffectError> {
        let forward =
            self.effect_serializer
                .serialize_forward(service_name, command_name, payload, metadata)?;
        self.forward = Some(forward);
        Ok(())
    }

    /// A failure to return from the handler.
    pub fn fail(&self, description: impl Into<String>) -> ContextFailure {
        ContextFailure::new(description)
    }
}

/// Wait for the next frame, honoring shutdown: once signalled, buffered
/// frames drain and the stream ends.
pub(crate) async fn next_frame<T>(
    shutdown: &mut watch::Receiver<bool>,
    frames: &mut mpsc::Receiver<T>,
) -> Option<T> {
    if *shutdown.borrow() {
        frames.close();
        return frames.recv().await;
    }
    tokio::select! {
        frame = frames.recv() => frame,
        _ = async {
            loop {
                if shutdown.changed().await.is_err() {
                    break;
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        } => {
            frames.close();
            frames.recv().await
        }
    }
}

fn reply_out(reply: ValueEntityReply) -> ValueEntityStreamOut {
    ValueEntityStreamOut {
        message: Some(value_entity_stream_out::Message::Reply(reply)),
    }
}

fn failure_reply(command_id: i64, failure: &ContextFailure) -> ValueEntityStreamOut {
    reply_out(ValueEntityReply {
        command_id,
        client_action: Some(ClientAction {
            action: Some(client_action::Action::Failure(failure.to_proto(command_id))),
        }),
        side_effects: Vec::new(),
        state_action: None,
    })
}

fn stream_failure(error: &ProtocolError) -> ValueEntityStreamOut {
    ValueEntityStreamOut {
        message: Some(value_entity_stream_out::Message::Failure(
            error.to_failure(),
        )),
    }
}

/// The per-entity command loop. Frames arrive on a bounded queue filled by
/// the stream receive task; replies leave in arrival order.
pub(crate) async fn run_value_entity(
    registry: Arc<ComponentRegistry>,
    effect_serializer: Arc<EffectSerializer>,
    tracker: Arc<EntityTracker>,
    mut shutdown: watch::Receiver<bool>,
    mut frames: mpsc::Receiver<ValueEntityStreamIn>,
    out: mpsc::Sender<Result<ValueEntityStreamOut, Status>>,
) {
    use value_entity_stream_in::Message;

    let init = match next_frame(&mut shutdown, &mut frames).await {
        Some(ValueEntityStreamIn {
            message: Some(Message::Init(init)),
        }) => init,
        Some(_) => {
            let _ = out.send(Ok(stream_failure(&ProtocolError::MissingInit))).await;
            return;
        }
        None => return,
    };

    let Some((handler, _options)) = registry.value_entity(&init.service_name) else {
        let error = ProtocolError::UnknownService(init.service_name);
        warn!(%error, "Rejecting value entity stream");
        let _ = out.send(Ok(stream_failure(&error))).await;
        return;
    };

    let Some(_guard) = tracker.acquire(&init.service_name, &init.entity_id) else {
        let error = ProtocolError::EntityAlreadyActive(init.entity_id);
        warn!(%error, "Rejecting value entity stream");
        let _ = out.send(Ok(stream_failure(&error))).await;
        return;
    };

    let entity_id = init.entity_id;
    let mut state = init
        .state
        .and_then(|s| s.value)
        .or_else(|| handler.initial_state(&entity_id));
    debug!(entity_id = %entity_id, service = %init.service_name, "Value entity activated");

    while let Some(frame) = next_frame(&mut shutdown, &mut frames).await {
        match frame.message {
            Some(Message::Command(command)) => {
                let reply = process_command(
                    &handler,
                    &effect_serializer,
                    &entity_id,
                    &mut state,
                    command,
                )
                .await;
                if out.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
            Some(Message::Init(_)) => {
                let error = ProtocolError::DuplicateInit(entity_id.clone());
                error!(%error, "Closing value entity stream");
                let _ = out.send(Ok(stream_failure(&error))).await;
                return;
            }
            // Value entity commands are never streamed; nothing to cancel.
            Some(Message::StreamCancelled(_)) => {}
            None => {
                let error = ProtocolError::EmptyFrame;
                let _ = out.send(Ok(stream_failure(&error))).await;
                return;
            }
        }
    }
    debug!(entity_id = %entity_id, "Value entity released");
}

async fn process_command(
    handler: &Arc<dyn ValueEntityHandler>,
    effect_serializer: &Arc<EffectSerializer>,
    entity_id: &str,
    state: &mut Option<Any>,
    command: Command,
) -> ValueEntityStreamOut {
    let command_id = command.id;
    let mut ctx = ValueEntityCommandContext {
        entity_id: entity_id.to_string(),
        metadata: command
            .metadata
            .as_ref()
            .map(Metadata::from_proto)
            .unwrap_or_default(),
        state: state.clone(),
        state_action: None,
        effects: Vec::new(),
        forward: None,
        effect_serializer: Arc::clone(effect_serializer),
    };

    let payload = command.payload.unwrap_or_default();
    let reply = match handler.handle_command(&mut ctx, &command.name, payload).await {
        Ok(reply) => reply,
        Err(failure) => {
            // Failure discards any state change the command made.
            debug!(entity_id = %entity_id, command = %command.name, %failure, "Command failed");
            return failure_reply(command_id, &failure);
        }
    };

    if reply.is_failure() {
        // State changes are discarded; the failure keeps its own effects.
        debug!(entity_id = %entity_id, command = %command.name, "Command replied with failure");
        return match reply.into_wire(command_id) {
            Ok((client_action, side_effects)) => reply_out(ValueEntityReply {
                command_id,
                client_action,
                side_effects,
                state_action: None,
            }),
            Err(ill_formed) => {
                failure_reply(command_id, &ContextFailure::new(ill_formed.to_string()))
            }
        };
    }

    let state_action = ctx.state_action.take().map(|action| match action {
        StateAction::Update(value) => {
            *state = Some(value.clone());
            ValueEntityAction {
                action: Some(value_entity_action::Action::Update(ValueEntityUpdate {
                    value: Some(value),
                })),
            }
        }
        StateAction::Delete => {
            *state = handler.initial_state(entity_id);
            ValueEntityAction {
                action: Some(value_entity_action::Action::Delete(ValueEntityDelete {})),
            }
        }
    });

    match reply.into_wire(command_id) {
        Ok((mut client_action, mut side_effects)) => {
            side_effects.extend(ctx.effects.iter().map(Effect::to_proto));
            if client_action.is_none() {
                if let Some(forward) = ctx.forward.take() {
                    client_action = Some(ClientAction {
                        action: Some(client_action::Action::Forward(forward.to_proto())),
                    });
                }
            }
            reply_out(ValueEntityReply {
                command_id,
                client_action,
                side_effects,
                state_action,
            })
        }
        Err(ill_formed) => {
            error!(entity_id = %entity_id, %ill_formed, "Rejecting ill-formed reply");
            failure_reply(command_id, &ContextFailure::new(ill_formed.to_string()))
        }
    }
}

/// The tonic service: spawns a receive pump and the command loop per
/// stream.
pub struct ValueEntityService {
    registry: Arc<ComponentRegistry>,
    effect_serializer: Arc<EffectSerializer>,
    tracker: Arc<EntityTracker>,
    shutdown: watch::Receiver<bool>,
}

impl ValueEntityService {
    pub(crate) fn new(
        registry: Arc<ComponentRegistry>,
        effect_serializer: Arc<EffectSerializer>,
        tracker: Arc<EntityTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            effect_serializer,
            tracker,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl ValueEntities for ValueEntityService {
    type HandleStream = ReceiverStream<Result<ValueEntityStreamOut, Status>>;

    async fn handle(
        &self,
        request: Request<Streaming<ValueEntityStreamIn>>,
    ) -> Result<Response<Self::HandleStream>, Status> {
        let mut inbound = request.into_inner();
        let (frame_tx, frame_rx) = mpsc::channel(ENTITY_QUEUE_DEPTH);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(frame) = inbound.next().await {
                match frame {
                    Ok(frame) => {
                        if frame_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(status) => {
                        debug!(%status, "Value entity stream error from proxy");
                        break;
                    }
                }
            }
        });

        tokio::spawn(run_value_entity(
            Arc::clone(&self.registry),
            Arc::clone(&self.effect_serializer),
            Arc::clone(&self.tracker),
            self.shutdown.clone(),
            frame_rx,
            reply_tx,
        ));

        Ok(Response::new(ReceiverStream::new(reply_rx)))
    }
}
