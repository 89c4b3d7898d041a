//! Replicated (CRDT) entity service.
//!
//! One stream per entity instance. State moves as deltas: inbound frames
//! fold other replicas' changes into local state, and every command's
//! reply carries the delta of its local mutations. Streamed commands
//! leave a subscription open that pushes a message whenever the state
//! changes.

use std::collections::HashMap;
use std::sync::Arc;

use prost_types::Any;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, warn};

use crate::any_support::AnySupport;
use crate::component::ReplicatedEntityHandler;
use crate::context::ContextFailure;
use crate::crdt::{CrdtError, ReplicatedData};
use crate::effect::{EffectError, EffectSerializer};
use crate::metadata::Metadata;
use crate::proto::replicated_entities_server::ReplicatedEntities;
use crate::proto::{
    client_action, replicated_entity_state_action, replicated_entity_stream_in,
    replicated_entity_stream_out, ClientAction, Command, ReplicatedEntityDelete,
    ReplicatedEntityDelta, ReplicatedEntityReply, ReplicatedEntityStateAction,
    ReplicatedEntityStreamIn, ReplicatedEntityStreamOut, ReplicatedEntityStreamedMessage,
};
use crate::registry::ComponentRegistry;
use crate::reply::{Effect, Forward, Reply};

use super::value_entity::next_frame;
use super::{EntityTracker, ProtocolError, ENTITY_QUEUE_DEPTH, REPLY_QUEUE_DEPTH};

/// What a state-change callback asks the host to do with its stream.
pub enum StreamPush {
    /// Push nothing for this change.
    Nothing,
    /// Push a message.
    Message(Reply),
    /// Push an optional final message and end the stream.
    End(Option<Reply>),
}

/// Callback invoked when the state changes, for a streamed command.
pub type StateChangeCallback = Box<dyn FnMut(&ReplicatedData, &str) -> StreamPush + Send>;

/// Callback invoked when the proxy cancels a streamed command's stream.
pub type StreamCancelCallback = Box<dyn FnOnce(Option<&ReplicatedData>, &str) + Send>;

struct Subscription {
    on_change: StateChangeCallback,
    on_cancel: Option<StreamCancelCallback>,
}

/// Context handed to a replicated entity command handler.
pub struct ReplicatedCommandContext {
    entity_id: String,
    metadata: Metadata,
    state: Option<ReplicatedData>,
    installed: bool,
    delete: bool,
    streamed: bool,
    on_change: Option<StateChangeCallback>,
    on_cancel: Option<StreamCancelCallback>,
    effects: Vec<Effect>,
    forward: Option<Forward>,
    handler: Arc<dyn ReplicatedEntityHandler>,
    effect_serializer: Arc<EffectSerializer>,
}

impl ReplicatedCommandContext {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether the command expects a streamed response.
    pub fn streamed(&self) -> bool {
        self.streamed
    }

    /// The entity's current state.
    pub fn state(&self) -> Option<&ReplicatedData> {
        self.state.as_ref()
    }

    /// The entity's current state, mutable for local mutations.
    pub fn state_mut(&mut self) -> Option<&mut ReplicatedData> {
        self.state.as_mut()
    }

    /// Install the top-level state. Allowed only while no state exists;
    /// runs the handler's `on_state_set` hook.
    pub fn set_state(&mut self, mut state: ReplicatedData) -> Result<(), ContextFailure> {
        if self.state.is_some() {
            return Err(ContextFailure::new(
                "Replicated entity state is already set; mutate it instead of replacing it",
            ));
        }
        let handler = Arc::clone(&self.handler);
        handler.on_state_set(&mut state, &self.entity_id);
        self.state = Some(state);
        self.installed = true;
        Ok(())
    }

    /// Delete the entity's state on the proxy.
    pub fn delete_state(&mut self) {
        self.delete = true;
        self.state = None;
    }

    /// Register the state-change callback for a streamed command.
    pub fn on_state_change(
        &mut self,
        callback: impl FnMut(&ReplicatedData, &str) -> StreamPush + Send + 'static,
    ) -> Result<(), ContextFailure> {
        if !self.streamed {
            return Err(ContextFailure::new(
                "on_state_change is only available for streamed commands",
            ));
        }
        self.on_change = Some(Box::new(callback));
        Ok(())
    }

    /// Register the cancellation callback for a streamed command.
    pub fn on_stream_cancel(
        &mut self,
        callback: impl FnOnce(Option<&ReplicatedData>, &str) + Send + 'static,
    ) -> Result<(), ContextFailure> {
        if !self.streamed {
            return Err(ContextFailure::new(
                "on_stream_cancel is only available for streamed commands",
            ));
        }
        self.on_cancel = Some(Box::new(callback));
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

fn reply_out(reply: ReplicatedEntityReply) -> ReplicatedEntityStreamOut {
    ReplicatedEntityStreamOut {
        message: Some(replicated_entity_stream_out::Message::Reply(reply)),
    }
}

fn failure_reply(command_id: i64, failure: &ContextFailure) -> ReplicatedEntityStreamOut {
    reply_out(ReplicatedEntityReply {
        command_id,
        client_action: Some(ClientAction {
            action: Some(client_action::Action::Failure(failure.to_proto(command_id))),
        }),
        side_effects: Vec::new(),
        state_action: None,
        streamed: false,
    })
}

fn stream_failure(description: String) -> ReplicatedEntityStreamOut {
    ReplicatedEntityStreamOut {
        message: Some(replicated_entity_stream_out::Message::Failure(
            crate::proto::Failure {
                command_id: 0,
                description,
                grpc_status_code: 0,
            },
        )),
    }
}

/// Construct state from an inbound delta and run the state-set hook.
fn install_from_delta(
    handler: &Arc<dyn ReplicatedEntityHandler>,
    any_support: &AnySupport,
    entity_id: &str,
    delta: &ReplicatedEntityDelta,
) -> Result<ReplicatedData, CrdtError> {
    let mut state = ReplicatedData::from_delta(delta)?;
    state.apply_delta(delta, any_support)?;
    handler.on_state_set(&mut state, entity_id);
    Ok(state)
}

/// The per-entity command loop.
pub(crate) async fn run_replicated_entity(
    registry: Arc<ComponentRegistry>,
    any_support: AnySupport,
    effect_serializer: Arc<EffectSerializer>,
    tracker: Arc<EntityTracker>,
    mut shutdown: watch::Receiver<bool>,
    mut frames: mpsc::Receiver<ReplicatedEntityStreamIn>,
    out: mpsc::Sender<Result<ReplicatedEntityStreamOut, Status>>,
) {
    use replicated_entity_stream_in::Message;

    let init = match next_frame(&mut shutdown, &mut frames).await {
        Some(ReplicatedEntityStreamIn {
            message: Some(Message::Init(init)),
        }) => init,
        Some(_) => {
            let _ = out
                .send(Ok(stream_failure(ProtocolError::MissingInit.to_string())))
                .await;
            return;
        }
        None => return,
    };

    let Some((handler, _options)) = registry.replicated(&init.service_name) else {
        let error = ProtocolError::UnknownService(init.service_name);
        warn!(%error, "Rejecting replicated entity stream");
        let _ = out.send(Ok(stream_failure(error.to_string()))).await;
        return;
    };

    let Some(_guard) = tracker.acquire(&init.service_name, &init.entity_id) else {
        let error = ProtocolError::EntityAlreadyActive(init.entity_id);
        warn!(%error, "Rejecting replicated entity stream");
        let _ = out.send(Ok(stream_failure(error.to_string()))).await;
        return;
    };

    let entity_id = init.entity_id;
    let mut state: Option<ReplicatedData> = None;
    if let Some(delta) = init.delta {
        match install_from_delta(&handler, &any_support, &entity_id, &delta) {
            Ok(installed) => state = Some(installed),
            Err(error) => {
                error!(entity_id = %entity_id, %error, "Initial delta rejected");
                let _ = out.send(Ok(stream_failure(error.to_string()))).await;
                return;
            }
        }
    }
    let mut subscriptions: HashMap<i64, Subscription> = HashMap::new();
    debug!(entity_id = %entity_id, "Replicated entity activated");

    while let Some(frame) = next_frame(&mut shutdown, &mut frames).await {
        match frame.message {
            Some(Message::Delta(delta)) => {
                let applied = match state.as_mut() {
                    Some(existing) => existing.apply_delta(&delta, &any_support),
                    None => match install_from_delta(&handler, &any_support, &entity_id, &delta)
                    {
                        Ok(installed) => {
                            state = Some(installed);
                            Ok(())
                        }
                        Err(error) => Err(error),
                    },
                };
                if let Err(error) = applied {
                    error!(entity_id = %entity_id, %error, "Inbound delta rejected");
                    let _ = out.send(Ok(stream_failure(error.to_string()))).await;
                    return;
                }
                notify_subscriptions(&state, &mut subscriptions, &entity_id, &out).await;
            }
            Some(Message::Command(command)) => {
                if !process_command(
                    &handler,
                    &effect_serializer,
                    &entity_id,
                    &mut state,
                    &mut subscriptions,
                    command,
                    &out,
                )
                .await
                {
                    break;
                }
            }
            Some(Message::StreamCancelled(cancelled)) => {
                if let Some(subscription) = subscriptions.remove(&cancelled.id) {
                    debug!(entity_id = %entity_id, command_id = cancelled.id, "Stream cancelled");
                    if let Some(on_cancel) = subscription.on_cancel {
                        on_cancel(state.as_ref(), &entity_id);
                    }
                }
            }
            Some(Message::Init(_)) => {
                let error = ProtocolError::DuplicateInit(entity_id.clone());
                error!(%error, "Closing replicated entity stream");
                let _ = out.send(Ok(stream_failure(error.to_string()))).await;
                return;
            }
            None => {
                let _ = out
                    .send(Ok(stream_failure(ProtocolError::EmptyFrame.to_string())))
                    .await;
                return;
            }
        }
    }
    debug!(entity_id = %entity_id, "Replicated entity released");
}

/// Returns false when the outbound stream is gone and the loop should end.
async fn process_command(
    handler: &Arc<dyn ReplicatedEntityHandler>,
    effect_serializer: &Arc<EffectSerializer>,
    entity_id: &str,
    state: &mut Option<ReplicatedData>,
    subscriptions: &mut HashMap<i64, Subscription>,
    command: Command,
    out: &mpsc::Sender<Result<ReplicatedEntityStreamOut, Status>>,
) -> bool {
    let command_id = command.id;
    let mut ctx = ReplicatedCommandContext {
        entity_id: entity_id.to_string(),
        metadata: command
            .metadata
            .as_ref()
            .map(Metadata::from_proto)
            .unwrap_or_default(),
        state: state.take(),
        installed: false,
        delete: false,
        streamed: command.streamed,
        on_change: None,
        on_cancel: None,
        effects: Vec::new(),
        forward: None,
        handler: Arc::clone(handler),
        effect_serializer: Arc::clone(effect_serializer),
    };

    let payload = command.payload.unwrap_or_default();
    let result = handler.handle_command(&mut ctx, &command.name, payload).await;

    // Local mutations cannot be rolled back; state is adopted on every
    // outcome and pending deltas flush with the next successful command.
    let deleted = ctx.delete;
    let installed = ctx.installed;
    *state = ctx.state.take();

    let reply = match result {
        Ok(reply) => reply,
        Err(failure) => {
            debug!(entity_id = %entity_id, command = %command.name, %failure, "Command failed");
            return out.send(Ok(failure_reply(command_id, &failure))).await.is_ok();
        }
    };

    if reply.is_failure() {
        debug!(entity_id = %entity_id, command = %command.name, "Command replied with failure");
        let frame = match reply.into_wire(command_id) {
            Ok((client_action, side_effects)) => reply_out(ReplicatedEntityReply {
                command_id,
                client_action,
                side_effects,
                state_action: None,
                streamed: false,
            }),
            Err(ill_formed) => {
                failure_reply(command_id, &ContextFailure::new(ill_formed.to_string()))
            }
        };
        return out.send(Ok(frame)).await.is_ok();
    }

    let state_action = if deleted {
        Some(ReplicatedEntityStateAction {
            action: Some(replicated_entity_state_action::Action::Delete(
                ReplicatedEntityDelete {},
            )),
        })
    } else {
        // A state installed by this command ships its full initial delta
        // so the receiving side can construct it.
        state
            .as_mut()
            .and_then(|s| s.get_and_reset_delta(installed))
            .map(|delta| ReplicatedEntityStateAction {
                action: Some(replicated_entity_state_action::Action::Update(delta)),
            })
    };
    let state_changed = state_action.is_some();

    let streamed = command.streamed && (ctx.on_change.is_some() || ctx.on_cancel.is_some());

    let sent = match reply.into_wire(command_id) {
        Ok((mut client_action, mut side_effects)) => {
            side_effects.extend(ctx.effects.iter().map(Effect::to_proto));
            if client_action.is_none() {
                if let Some(forward) = ctx.forward.take() {
                    client_action = Some(ClientAction {
                        action: Some(client_action::Action::Forward(forward.to_proto())),
                    });
                }
            }
            out.send(Ok(reply_out(ReplicatedEntityReply {
                command_id,
                client_action,
                side_effects,
                state_action,
                streamed,
            })))
            .await
            .is_ok()
        }
        Err(ill_formed) => {
            error!(entity_id = %entity_id, %ill_formed, "Rejecting ill-formed reply");
            out.send(Ok(failure_reply(
                command_id,
                &ContextFailure::new(ill_formed.to_string()),
            )))
            .await
            .is_ok()
        }
    };
    if !sent {
        return false;
    }

    // Existing subscriptions observe this command's change before the new
    // subscription (if any) is registered.
    if state_changed {
        notify_subscriptions(state, subscriptions, entity_id, out).await;
    }

    if streamed {
        subscriptions.insert(
            command_id,
            Subscription {
                on_change: ctx
                    .on_change
                    .unwrap_or_else(|| Box::new(|_, _| StreamPush::Nothing)),
                on_cancel: ctx.on_cancel,
            },
        );
    }

    true
}

/// Run every subscription's state-change callback and push its output.
async fn notify_subscriptions(
    state: &Option<ReplicatedData>,
    subscriptions: &mut HashMap<i64, Subscription>,
    entity_id: &str,
    out: &mpsc::Sender<Result<ReplicatedEntityStreamOut, Status>>,
) {
    let Some(state) = state.as_ref() else {
        return;
    };

    let mut ended = Vec::new();
    for (command_id, subscription) in subscriptions.iter_mut() {
        let (reply, end_stream) = match (subscription.on_change)(state, entity_id) {
            StreamPush::Nothing => continue,
            StreamPush::Message(reply) => (reply, false),
            StreamPush::End(reply) => (reply.unwrap_or_else(Reply::no_reply), true),
        };
        if end_stream {
            ended.push(*command_id);
        }

        match reply.into_wire(*command_id) {
            Ok((client_action, side_effects)) => {
                let message = ReplicatedEntityStreamOut {
                    message: Some(replicated_entity_stream_out::Message::StreamedMessage(
                        ReplicatedEntityStreamedMessage {
                            command_id: *command_id,
                            client_action,
                            side_effects,
                            end_stream,
                        },
                    )),
                };
                if out.send(Ok(message)).await.is_err() {
                    return;
                }
            }
            Err(ill_formed) => {
                error!(entity_id = %entity_id, %ill_formed, "Dropping ill-formed streamed message");
            }
        }
    }

    for command_id in ended {
        subscriptions.remove(&command_id);
    }
}

/// The tonic service: spawns a receive pump and the command loop per
/// stream.
pub struct ReplicatedEntityService {
    registry: Arc<ComponentRegistry>,
    any_support: AnySupport,
    effect_serializer: Arc<EffectSerializer>,
    tracker: Arc<EntityTracker>,
    shutdown: watch::Receiver<bool>,
}

impl ReplicatedEntityService {
    pub(crate) fn new(
        registry: Arc<ComponentRegistry>,
        any_support: AnySupport,
        effect_serializer: Arc<EffectSerializer>,
        tracker: Arc<EntityTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            any_support,
            effect_serializer,
            tracker,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl ReplicatedEntities for ReplicatedEntityService {
    type HandleStream = ReceiverStream<Result<ReplicatedEntityStreamOut, Status>>;

    async fn handle(
        &self,
        request: Request<Streaming<ReplicatedEntityStreamIn>>,
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
                        debug!(%status, "Replicated entity stream error from proxy");
                        break;
                    }
                }
            }
        });

        tokio::spawn(run_replicated_entity(
            Arc::clone(&self.registry),
            self.any_support.clone(),
            Arc::clone(&self.effect_serializer),
            Arc::clone(&self.tracker),
            self.shutdown.clone(),
            frame_rx,
            reply_tx,
        ));

        Ok(Response::new(ReceiverStream::new(reply_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::any_support::PrimitiveValue;
    use crate::component::{Component, EntityOptions};
    use crate::crdt::Counter;
    use crate::proto::replicated_entity_delta;
    use crate::services::value_entity::tests::test_effect_serializer;
    use async_trait::async_trait;
    use prost_reflect::DescriptorPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn any_support() -> AnySupport {
        AnySupport::new(DescriptorPool::new())
    }

    fn number(value: i64) -> Any {
        any_support().encode_primitive(PrimitiveValue::Int64(value))
    }

    fn decode_number(any: &Any) -> i64 {
        match any_support().decode(any).unwrap() {
            crate::any_support::DecodedValue::Primitive(PrimitiveValue::Int64(v)) => v,
            other => panic!("expected int64, got {other:?}"),
        }
    }

    #[derive(Default)]
    struct CounterEntity {
        state_sets: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
    }

    impl CounterEntity {
        fn counter_value(state: &ReplicatedData) -> i64 {
            match state {
                ReplicatedData::Counter(c) => c.value(),
                other => panic!("expected counter, got {}", other.kind()),
            }
        }
    }

    #[async_trait]
    impl ReplicatedEntityHandler for CounterEntity {
        fn on_state_set(&self, _state: &mut ReplicatedData, _entity_id: &str) {
            self.state_sets.fetch_add(1, Ordering::SeqCst);
        }

        async fn handle_command(
            &self,
            ctx: &mut ReplicatedCommandContext,
            name: &str,
            payload: Any,
        ) -> Result<Reply, ContextFailure> {
            if ctx.state().is_none() {
                ctx.set_state(ReplicatedData::Counter(Counter::new()))?;
            }
            match name {
                "Increment" => {
                    match ctx.state_mut() {
                        Some(ReplicatedData::Counter(c)) => c.increment(decode_number(&payload)),
                        _ => return Err(ctx.fail("state is not a counter")),
                    }
                    let value = Self::counter_value(ctx.state().unwrap());
                    Ok(Reply::message(number(value)))
                }
                "GetValue" => {
                    let value = Self::counter_value(ctx.state().unwrap());
                    Ok(Reply::message(number(value)))
                }
                "Monitor" => {
                    let value = Self::counter_value(ctx.state().unwrap());
                    ctx.on_state_change(|state, _entity_id| {
                        StreamPush::Message(Reply::message(number(
                            CounterEntity::counter_value(state),
                        )))
                    })?;
                    let cancels = Arc::clone(&self.cancels);
                    ctx.on_stream_cancel(move |_state, _entity_id| {
                        cancels.fetch_add(1, Ordering::SeqCst);
                    })?;
                    Ok(Reply::message(number(value)))
                }
                other => Err(ctx.fail(format!("Unknown command: {other}"))),
            }
        }
    }

    struct Harness {
        frames: mpsc::Sender<ReplicatedEntityStreamIn>,
        replies: mpsc::Receiver<Result<ReplicatedEntityStreamOut, Status>>,
        state_sets: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
        _shutdown: watch::Sender<bool>,
    }

    fn spawn_entity() -> Harness {
        let handler = CounterEntity::default();
        let state_sets = Arc::clone(&handler.state_sets);
        let cancels = Arc::clone(&handler.cancels);

        let mut registry = ComponentRegistry::new();
        registry
            .register(Component::replicated(
                "com.example.ReplicatedCounter",
                EntityOptions::new("replicated-counter"),
                handler,
            ))
            .unwrap();

        let (frame_tx, frame_rx) = mpsc::channel(ENTITY_QUEUE_DEPTH);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_replicated_entity(
            Arc::new(registry),
            any_support(),
            test_effect_serializer(),
            EntityTracker::new(),
            shutdown_rx,
            frame_rx,
            reply_tx,
        ));

        Harness {
            frames: frame_tx,
            replies: reply_rx,
            state_sets,
            cancels,
            _shutdown: shutdown_tx,
        }
    }

    fn counter_delta(change: i64) -> ReplicatedEntityDelta {
        ReplicatedEntityDelta {
            delta: Some(replicated_entity_delta::Delta::Counter(
                crate::proto::ReplicatedCounterDelta { change },
            )),
        }
    }

    fn init_frame(entity_id: &str, delta: Option<ReplicatedEntityDelta>) -> ReplicatedEntityStreamIn {
        ReplicatedEntityStreamIn {
            message: Some(replicated_entity_stream_in::Message::Init(
                crate::proto::ReplicatedEntityInit {
                    service_name: "com.example.ReplicatedCounter".to_string(),
                    entity_id: entity_id.to_string(),
                    delta,
                },
            )),
        }
    }

    fn delta_frame(delta: ReplicatedEntityDelta) -> ReplicatedEntityStreamIn {
        ReplicatedEntityStreamIn {
            message: Some(replicated_entity_stream_in::Message::Delta(delta)),
        }
    }

    fn command_frame(id: i64, name: &str, value: i64, streamed: bool) -> ReplicatedEntityStreamIn {
        ReplicatedEntityStreamIn {
            message: Some(replicated_entity_stream_in::Message::Command(Command {
                entity_id: String::new(),
                id,
                name: name.to_string(),
                payload: Some(number(value)),
                streamed,
                metadata: None,
            })),
        }
    }

    fn cancel_frame(id: i64) -> ReplicatedEntityStreamIn {
        ReplicatedEntityStreamIn {
            message: Some(replicated_entity_stream_in::Message::StreamCancelled(
                crate::proto::StreamCancelled {
                    entity_id: String::new(),
                    id,
                },
            )),
        }
    }

    fn unwrap_reply(out: ReplicatedEntityStreamOut) -> ReplicatedEntityReply {
        match out.message {
            Some(replicated_entity_stream_out::Message::Reply(reply)) => reply,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    fn unwrap_streamed(out: ReplicatedEntityStreamOut) -> ReplicatedEntityStreamedMessage {
        match out.message {
            Some(replicated_entity_stream_out::Message::StreamedMessage(message)) => message,
            other => panic!("expected streamed message, got {other:?}"),
        }
    }

    fn reply_number(client_action: &Option<ClientAction>) -> i64 {
        match client_action.as_ref().and_then(|a| a.action.as_ref()) {
            Some(client_action::Action::Reply(r)) => decode_number(r.payload.as_ref().unwrap()),
            other => panic!("expected message reply, got {other:?}"),
        }
    }

    fn update_change(reply: &ReplicatedEntityReply) -> i64 {
        match reply
            .state_action
            .as_ref()
            .and_then(|a| a.action.as_ref())
        {
            Some(replicated_entity_state_action::Action::Update(delta)) => match &delta.delta {
                Some(replicated_entity_delta::Delta::Counter(c)) => c.change,
                other => panic!("expected counter delta, got {other:?}"),
            },
            other => panic!("expected update action, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_init_delta_seeds_state() {
        let mut harness = spawn_entity();
        harness
            .frames
            .send(init_frame("c-1", Some(counter_delta(5))))
            .await
            .unwrap();
        harness
            .frames
            .send(command_frame(1, "GetValue", 0, false))
            .await
            .unwrap();

        let reply = unwrap_reply(harness.replies.recv().await.unwrap().unwrap());
        assert_eq!(reply_number(&reply.client_action), 5);
        assert!(reply.state_action.is_none());
        assert_eq!(harness.state_sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_reply_carries_outbound_delta() {
        let mut harness = spawn_entity();
        harness.frames.send(init_frame("c-1", None)).await.unwrap();
        harness
            .frames
            .send(command_frame(1, "Increment", 4, false))
            .await
            .unwrap();

        let reply = unwrap_reply(harness.replies.recv().await.unwrap().unwrap());
        assert_eq!(reply_number(&reply.client_action), 4);
        assert_eq!(update_change(&reply), 4);
        // First command installed the state through the context.
        assert_eq!(harness.state_sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_delta_folds_into_state() {
        let mut harness = spawn_entity();
        harness
            .frames
            .send(init_frame("c-1", Some(counter_delta(5))))
            .await
            .unwrap();
        harness
            .frames
            .send(delta_frame(counter_delta(3)))
            .await
            .unwrap();
        harness
            .frames
            .send(command_frame(1, "GetValue", 0, false))
            .await
            .unwrap();

        let reply = unwrap_reply(harness.replies.recv().await.unwrap().unwrap());
        assert_eq!(reply_number(&reply.client_action), 8);
    }

    #[tokio::test]
    async fn test_streamed_command_pushes_on_changes() {
        let mut harness = spawn_entity();
        harness
            .frames
            .send(init_frame("c-1", Some(counter_delta(1))))
            .await
            .unwrap();
        harness
            .frames
            .send(command_frame(7, "Monitor", 0, true))
            .await
            .unwrap();

        let reply = unwrap_reply(harness.replies.recv().await.unwrap().unwrap());
        assert!(reply.streamed);
        assert_eq!(reply_number(&reply.client_action), 1);

        // A delta from another replica triggers a push.
        harness
            .frames
            .send(delta_frame(counter_delta(2)))
            .await
            .unwrap();
        let pushed = unwrap_streamed(harness.replies.recv().await.unwrap().unwrap());
        assert_eq!(pushed.command_id, 7);
        assert!(!pushed.end_stream);
        assert_eq!(reply_number(&pushed.client_action), 3);

        // A local mutation triggers one as well.
        harness
            .frames
            .send(command_frame(8, "Increment", 4, false))
            .await
            .unwrap();
        let increment_reply = unwrap_reply(harness.replies.recv().await.unwrap().unwrap());
        assert_eq!(update_change(&increment_reply), 4);
        let pushed = unwrap_streamed(harness.replies.recv().await.unwrap().unwrap());
        assert_eq!(pushed.command_id, 7);
        assert_eq!(reply_number(&pushed.client_action), 7);
    }

    #[tokio::test]
    async fn test_stream_cancel_runs_callback() {
        let mut harness = spawn_entity();
        harness
            .frames
            .send(init_frame("c-1", Some(counter_delta(1))))
            .await
            .unwrap();
        harness
            .frames
            .send(command_frame(7, "Monitor", 0, true))
            .await
            .unwrap();
        harness.replies.recv().await.unwrap().unwrap();

        harness.frames.send(cancel_frame(7)).await.unwrap();
        // The cancelled subscription no longer observes changes.
        harness
            .frames
            .send(delta_frame(counter_delta(2)))
            .await
            .unwrap();
        harness
            .frames
            .send(command_frame(8, "GetValue", 0, false))
            .await
            .unwrap();

        let reply = unwrap_reply(harness.replies.recv().await.unwrap().unwrap());
        assert_eq!(reply_number(&reply.client_action), 3);
        assert_eq!(harness.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_command_keeps_entity_alive() {
        let mut harness = spawn_entity();
        harness.frames.send(init_frame("c-1", None)).await.unwrap();
        harness
            .frames
            .send(command_frame(1, "Nope", 0, false))
            .await
            .unwrap();
        harness
            .frames
            .send(command_frame(2, "Increment", 2, false))
            .await
            .unwrap();

        let failed = unwrap_reply(harness.replies.recv().await.unwrap().unwrap());
        assert!(matches!(
            failed.client_action.as_ref().and_then(|a| a.action.as_ref()),
            Some(client_action::Action::Failure(_))
        ));

        let reply = unwrap_reply(harness.replies.recv().await.unwrap().unwrap());
        assert_eq!(reply_number(&reply.client_action), 2);
    }

    #[tokio::test]
    async fn test_kind_mismatch_delta_is_fatal() {
        let mut harness = spawn_entity();
        harness
            .frames
            .send(init_frame("c-1", Some(counter_delta(1))))
            .await
            .unwrap();
        let vote = ReplicatedEntityDelta {
            delta: Some(replicated_entity_delta::Delta::Vote(crate::proto::VoteDelta {
                self_vote: true,
                votes_for: 1,
                total_voters: 1,
            })),
        };
        harness.frames.send(delta_frame(vote)).await.unwrap();

        let out = harness.replies.recv().await.unwrap().unwrap();
        assert!(matches!(
            out.message,
            Some(replicated_entity_stream_out::Message::Failure(_))
        ));
        assert!(harness.replies.recv().await.is_none());
    }
}
