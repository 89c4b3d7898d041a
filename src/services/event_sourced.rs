//! Event-sourced entity service.
//!
//! One stream per entity instance: init (optionally from a snapshot),
//! replayed events, then commands. Commands mutate state only by emitting
//! events; each event is applied through the user's event handler as it is
//! emitted, and shipped to the proxy for persistence with the reply.

use std::sync::Arc;

use prost_types::Any;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, warn};

use crate::any_support::unqualified_name;
use crate::component::EventSourcedHandler;
use crate::context::ContextFailure;
use crate::effect::{EffectError, EffectSerializer};
use crate::metadata::Metadata;
use crate::proto::event_sourced_entities_server::EventSourcedEntities;
use crate::proto::{
    client_action, event_sourced_stream_in, event_sourced_stream_out, ClientAction, Command,
    EventSourcedReply, EventSourcedStreamIn, EventSourcedStreamOut,
};
use crate::registry::ComponentRegistry;
use crate::reply::{Effect, Forward};

use super::value_entity::next_frame;
use super::{EntityTracker, ProtocolError, ENTITY_QUEUE_DEPTH, REPLY_QUEUE_DEPTH};

/// Context handed to an event-sourced command handler.
pub struct EventSourcedCommandContext {
    entity_id: String,
    metadata: Metadata,
    sequence: i64,
    state: Option<Any>,
    emitted: Vec<Any>,
    effects: Vec<Effect>,
    forward: Option<Forward>,
    handler: Arc<dyn EventSourcedHandler>,
    effect_serializer: Arc<EffectSerializer>,
}

impl EventSourcedCommandContext {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The sequence number of the last event applied, including events
    /// emitted by this command.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// The entity's current state, including the effect of events already
    /// emitted by this command.
    pub fn state(&self) -> Option<&Any> {
        self.state.as_ref()
    }

    /// Emit an event: it is applied to the state immediately through the
    /// event handler, and persisted by the proxy when the command
    /// succeeds.
    pub fn emit(&mut self, event: Any) -> Result<(), ContextFailure> {
        let event_name = unqualified_name(&event.type_url).to_string();
        let next = self
            .handler
            .handle_event(self.state.take(), &event_name, event.clone())?;
        self.state = next;
        self.sequence += 1;
        self.emitted.push(event);
        Ok(())
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

fn reply_out(reply: EventSourcedReply) -> EventSourcedStreamOut {
    EventSourcedStreamOut {
        message: Some(event_sourced_stream_out::Message::Reply(reply)),
    }
}

fn failure_reply(command_id: i64, failure: &ContextFailure) -> EventSourcedStreamOut {
    reply_out(EventSourcedReply {
        command_id,
        client_action: Some(ClientAction {
            action: Some(client_action::Action::Failure(failure.to_proto(command_id))),
        }),
        side_effects: Vec::new(),
        events: Vec::new(),
        snapshot: None,
    })
}

fn stream_failure(description: String) -> EventSourcedStreamOut {
    EventSourcedStreamOut {
        message: Some(event_sourced_stream_out::Message::Failure(
            crate::proto::Failure {
                command_id: 0,
                description,
                grpc_status_code: 0,
            },
        )),
    }
}

/// Apply one replayed event, advancing the sequence to the event's own.
fn replay_event(
    handler: &Arc<dyn EventSourcedHandler>,
    state: &mut Option<Any>,
    sequence: &mut i64,
    event: crate::proto::EventSourcedEvent,
) -> Result<(), ContextFailure> {
    let payload = event.payload.unwrap_or_default();
    let event_name = unqualified_name(&payload.type_url).to_string();
    let next = handler
        .handle_event(state.take(), &event_name, payload)
        .map_err(|failure| {
            ContextFailure::new(format!("Replay of {event_name} failed: {failure}"))
        })?;
    *state = next;
    *sequence = event.sequence;
    Ok(())
}

/// The per-entity command loop.
pub(crate) async fn run_event_sourced(
    registry: Arc<ComponentRegistry>,
    effect_serializer: Arc<EffectSerializer>,
    tracker: Arc<EntityTracker>,
    mut shutdown: watch::Receiver<bool>,
    mut frames: mpsc::Receiver<EventSourcedStreamIn>,
    out: mpsc::Sender<Result<EventSourcedStreamOut, Status>>,
) {
    use event_sourced_stream_in::Message;

    let init = match next_frame(&mut shutdown, &mut frames).await {
        Some(EventSourcedStreamIn {
            message: Some(Message::Init(init)),
        }) => init,
        Some(_) => {
            let error = ProtocolError::MissingInit;
            let _ = out.send(Ok(stream_failure(error.to_string()))).await;
            return;
        }
        None => return,
    };

    let Some((handler, options)) = registry.event_sourced(&init.service_name) else {
        let error = ProtocolError::UnknownService(init.service_name);
        warn!(%error, "Rejecting event-sourced stream");
        let _ = out.send(Ok(stream_failure(error.to_string()))).await;
        return;
    };

    let Some(_guard) = tracker.acquire(&init.service_name, &init.entity_id) else {
        let error = ProtocolError::EntityAlreadyActive(init.entity_id);
        warn!(%error, "Rejecting event-sourced stream");
        let _ = out.send(Ok(stream_failure(error.to_string()))).await;
        return;
    };

    let entity_id = init.entity_id;
    let snapshot_every = options.snapshot_every.unwrap_or(0) as i64;

    let mut sequence: i64 = 0;
    let mut state = handler.initial_state(&entity_id);
    if let Some(snapshot) = init.snapshot {
        sequence = snapshot.snapshot_sequence;
        match handler.restore_snapshot(snapshot.snapshot.unwrap_or_default()) {
            Ok(restored) => state = restored,
            Err(failure) => {
                // Unrecoverable for this instance: the proxy decides
                // whether to reinstantiate.
                error!(entity_id = %entity_id, %failure, "Snapshot restore failed");
                let _ = out.send(Ok(stream_failure(failure.to_string()))).await;
                return;
            }
        }
    }
    // Events shipped with the init frame replay before anything else.
    for event in init.events {
        if let Err(failure) = replay_event(&handler, &mut state, &mut sequence, event) {
            error!(entity_id = %entity_id, %failure, "Event replay failed");
            let _ = out.send(Ok(stream_failure(failure.to_string()))).await;
            return;
        }
    }
    let mut last_snapshot_sequence = sequence.max(0);
    debug!(entity_id = %entity_id, sequence, "Event-sourced entity activated");

    while let Some(frame) = next_frame(&mut shutdown, &mut frames).await {
        match frame.message {
            Some(Message::Event(event)) => {
                if let Err(failure) = replay_event(&handler, &mut state, &mut sequence, event) {
                    error!(entity_id = %entity_id, %failure, "Event replay failed");
                    let _ = out.send(Ok(stream_failure(failure.to_string()))).await;
                    return;
                }
            }
            Some(Message::Command(command)) => {
                let reply = process_command(
                    &handler,
                    &effect_serializer,
                    &entity_id,
                    &mut state,
                    &mut sequence,
                    &mut last_snapshot_sequence,
                    snapshot_every,
                    command,
                )
                .await;
                if out.send(Ok(reply)).await.is_err() {
                    break;
                }
            }
            Some(Message::Init(_)) => {
                let error = ProtocolError::DuplicateInit(entity_id.clone());
                error!(%error, "Closing event-sourced stream");
                let _ = out.send(Ok(stream_failure(error.to_string()))).await;
                return;
            }
            Some(Message::StreamCancelled(_)) => {}
            None => {
                let _ = out
                    .send(Ok(stream_failure(ProtocolError::EmptyFrame.to_string())))
                    .await;
                return;
            }
        }
    }
    debug!(entity_id = %entity_id, "Event-sourced entity released");
}

#[allow(clippy::too_many_arguments)]
async fn process_command(
    handler: &Arc<dyn EventSourcedHandler>,
    effect_serializer: &Arc<EffectSerializer>,
    entity_id: &str,
    state: &mut Option<Any>,
    sequence: &mut i64,
    last_snapshot_sequence: &mut i64,
    snapshot_every: i64,
    command: Command,
) -> EventSourcedStreamOut {
    let command_id = command.id;
    let mut ctx = EventSourcedCommandContext {
        entity_id: entity_id.to_string(),
        metadata: command
            .metadata
            .as_ref()
            .map(Metadata::from_proto)
            .unwrap_or_default(),
        sequence: *sequence,
        state: state.clone(),
        emitted: Vec::new(),
        effects: Vec::new(),
        forward: None,
        handler: Arc::clone(handler),
        effect_serializer: Arc::clone(effect_serializer),
    };

    let payload = command.payload.unwrap_or_default();
    let reply = match handler.handle_command(&mut ctx, &command.name, payload).await {
        Ok(reply) => reply,
        Err(failure) => {
            // Uncommitted emits are discarded with the context.
            debug!(entity_id = %entity_id, command = %command.name, %failure, "Command failed");
            return failure_reply(command_id, &failure);
        }
    };

    if reply.is_failure() {
        // Uncommitted emits are discarded; the failure keeps its effects.
        debug!(entity_id = %entity_id, command = %command.name, "Command replied with failure");
        return match reply.into_wire(command_id) {
            Ok((client_action, side_effects)) => reply_out(EventSourcedReply {
                command_id,
                client_action,
                side_effects,
                events: Vec::new(),
                snapshot: None,
            }),
            Err(ill_formed) => {
                failure_reply(command_id, &ContextFailure::new(ill_formed.to_string()))
            }
        };
    }

    // Commit: adopt the state produced by the emitted events.
    *state = ctx.state.take();
    *sequence = ctx.sequence;
    let events = ctx.emitted;

    let snapshot = if snapshot_every > 0
        && !events.is_empty()
        && *sequence - *last_snapshot_sequence >= snapshot_every
    {
        *last_snapshot_sequence = *sequence;
        handler.snapshot(state.as_ref())
    } else {
        None
    };

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
            reply_out(EventSourcedReply {
                command_id,
                client_action,
                side_effects,
                events,
                snapshot,
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
pub struct EventSourcedService {
    registry: Arc<ComponentRegistry>,
    effect_serializer: Arc<EffectSerializer>,
    tracker: Arc<EntityTracker>,
    shutdown: watch::Receiver<bool>,
}

impl EventSourcedService {
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
impl EventSourcedEntities for EventSourcedService {
    type HandleStream = ReceiverStream<Result<EventSourcedStreamOut, Status>>;

    async fn handle(
        &self,
        request: Request<Streaming<EventSourcedStreamIn>>,
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
                        debug!(%status, "Event-sourced stream error from proxy");
                        break;
                    }
                }
            }
        });

        tokio::spawn(run_event_sourced(
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
