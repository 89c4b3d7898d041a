//! Action service.
//!
//! Stateless request/response in four shapes: unary, streamed-in,
//! streamed-out, and bidirectional. Dispatch goes by the command's
//! service name and command name; no entity instance is involved.

use std::sync::Arc;

use prost_types::Any;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, warn};

use crate::component::ActionHandler;
use crate::context::ContextFailure;
use crate::effect::{EffectError, EffectSerializer};
use crate::metadata::Metadata;
use crate::proto::actions_server::Actions;
use crate::proto::{action_response, client_action, ActionCommand, ActionResponse};
use crate::registry::ComponentRegistry;
use crate::reply::{Effect, Forward, Reply};

use super::ENTITY_QUEUE_DEPTH;

/// Inbound payloads of a streamed-in or bidirectional call.
pub type CommandStream = mpsc::Receiver<Any>;

/// Context for unary and streamed-in action calls.
pub struct ActionContext {
    metadata: Metadata,
    effects: Vec<Effect>,
    forward: Option<Forward>,
    effect_serializer: Arc<EffectSerializer>,
}

impl ActionContext {
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Attach a side effect to the reply.
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

    /// Forward the call to another method. Used when the returned reply
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

/// Context for streamed-out and bidirectional action calls.
pub struct StreamedActionContext {
    metadata: Metadata,
    effects: Vec<Effect>,
    effect_serializer: Arc<EffectSerializer>,
    out: mpsc::Sender<Result<ActionResponse, Status>>,
}

impl StreamedActionContext {
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Whether the caller has gone away. Writes after cancellation fail.
    pub fn is_cancelled(&self) -> bool {
        self.out.is_closed()
    }

    /// Attach a side effect to the next written message.
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

    /// Write one message to the response stream.
    pub async fn write(&mut self, reply: Reply) -> Result<(), ContextFailure> {
        let effects = std::mem::take(&mut self.effects);
        let response = wire_response(reply, effects)
            .map_err(|e| ContextFailure::new(e.to_string()))?;
        self.out
            .send(Ok(response))
            .await
            .map_err(|_| ContextFailure::new("Response stream cancelled by caller"))
    }

    /// A failure to return from the handler.
    pub fn fail(&self, description: impl Into<String>) -> ContextFailure {
        ContextFailure::new(description)
    }
}

/// Assemble the wire response from a reply plus buffered context effects.
fn wire_response(
    reply: Reply,
    extra_effects: Vec<Effect>,
) -> Result<ActionResponse, crate::reply::IllFormedReply> {
    let (client_action, mut side_effects) = reply.into_wire(0)?;
    side_effects.extend(extra_effects.iter().map(Effect::to_proto));

    let response = client_action
        .and_then(|a| a.action)
        .map(|action| match action {
            client_action::Action::Reply(reply) => action_response::Response::Reply(reply),
            client_action::Action::Forward(forward) => action_response::Response::Forward(forward),
            client_action::Action::Failure(failure) => action_response::Response::Failure(failure),
        });

    Ok(ActionResponse {
        response,
        side_effects,
    })
}

fn failure_response(failure: &ContextFailure) -> ActionResponse {
    ActionResponse {
        response: Some(action_response::Response::Failure(failure.to_proto(0))),
        side_effects: Vec::new(),
    }
}

fn finish_reply(reply: Reply, ctx: ActionContext) -> ActionResponse {
    if reply.is_failure() {
        // The failure keeps its own effects; context effects are dropped.
        return match wire_response(reply, Vec::new()) {
            Ok(response) => response,
            Err(ill_formed) => {
                error!(%ill_formed, "Rejecting ill-formed action reply");
                failure_response(&ContextFailure::new(ill_formed.to_string()))
            }
        };
    }

    match wire_response(reply, ctx.effects) {
        Ok(mut response) => {
            if response.response.is_none() {
                if let Some(forward) = ctx.forward {
                    response.response = Some(action_response::Response::Forward(forward.to_proto()));
                }
            }
            response
        }
        Err(ill_formed) => {
            error!(%ill_formed, "Rejecting ill-formed action reply");
            failure_response(&ContextFailure::new(ill_formed.to_string()))
        }
    }
}

pub(crate) async fn run_unary(
    handler: Arc<dyn ActionHandler>,
    effect_serializer: Arc<EffectSerializer>,
    command: ActionCommand,
) -> ActionResponse {
    let mut ctx = ActionContext {
        metadata: command
            .metadata
            .as_ref()
            .map(Metadata::from_proto)
            .unwrap_or_default(),
        effects: Vec::new(),
        forward: None,
        effect_serializer,
    };
    let payload = command.payload.unwrap_or_default();
    match handler.handle_unary(&mut ctx, &command.name, payload).await {
        Ok(reply) => finish_reply(reply, ctx),
        Err(failure) => {
            debug!(command = %command.name, %failure, "Unary action failed");
            failure_response(&failure)
        }
    }
}

pub(crate) async fn run_streamed_in(
    handler: Arc<dyn ActionHandler>,
    effect_serializer: Arc<EffectSerializer>,
    command: ActionCommand,
    payloads: CommandStream,
) -> ActionResponse {
    let mut ctx = ActionContext {
        metadata: command
            .metadata
            .as_ref()
            .map(Metadata::from_proto)
            .unwrap_or_default(),
        effects: Vec::new(),
        forward: None,
        effect_serializer,
    };
    match handler
        .handle_streamed_in(&mut ctx, &command.name, payloads)
        .await
    {
        Ok(reply) => finish_reply(reply, ctx),
        Err(failure) => {
            debug!(command = %command.name, %failure, "Streamed-in action failed");
            failure_response(&failure)
        }
    }
}

pub(crate) async fn run_streamed_out(
    handler: Arc<dyn ActionHandler>,
    effect_serializer: Arc<EffectSerializer>,
    command: ActionCommand,
    out: mpsc::Sender<Result<ActionResponse, Status>>,
) {
    let mut ctx = StreamedActionContext {
        metadata: command
            .metadata
            .as_ref()
            .map(Metadata::from_proto)
            .unwrap_or_default(),
        effects: Vec::new(),
        effect_serializer,
        out: out.clone(),
    };
    let payload = command.payload.unwrap_or_default();
    if let Err(failure) = handler
        .handle_streamed_out(&mut ctx, &command.name, payload)
        .await
    {
        debug!(command = %command.name, %failure, "Streamed-out action failed");
        let _ = out.send(Ok(failure_response(&failure))).await;
    }
}

pub(crate) async fn run_streamed(
    handler: Arc<dyn ActionHandler>,
    effect_serializer: Arc<EffectSerializer>,
    command: ActionCommand,
    payloads: CommandStream,
    out: mpsc::Sender<Result<ActionResponse, Status>>,
) {
    let mut ctx = StreamedActionContext {
        metadata: command
            .metadata
            .as_ref()
            .map(Metadata::from_proto)
            .unwrap_or_default(),
        effects: Vec::new(),
        effect_serializer,
        out: out.clone(),
    };
    if let Err(failure) = handler
        .handle_streamed(&mut ctx, &command.name, payloads)
        .await
    {
        debug!(command = %command.name, %failure, "Streamed action failed");
        let _ = out.send(Ok(failure_response(&failure))).await;
    }
}

/// The tonic service.
pub struct ActionService {
    registry: Arc<ComponentRegistry>,
    effect_serializer: Arc<EffectSerializer>,
}

impl ActionService {
    pub(crate) fn new(
        registry: Arc<ComponentRegistry>,
        effect_serializer: Arc<EffectSerializer>,
    ) -> Self {
        Self {
            registry,
            effect_serializer,
        }
    }

    fn handler(&self, service_name: &str) -> Result<Arc<dyn ActionHandler>, Status> {
        self.registry.action(service_name).ok_or_else(|| {
            warn!(service = %service_name, "Unknown action service");
            Status::not_found(format!("Unknown action service: {service_name}"))
        })
    }
}

/// Pump the remaining inbound commands into a payload queue.
fn pump_payloads(mut inbound: Streaming<ActionCommand>) -> CommandStream {
    let (tx, rx) = mpsc::channel(ENTITY_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(command) => {
                    if tx.send(command.payload.unwrap_or_default()).await.is_err() {
                        break;
                    }
                }
                Err(status) => {
                    debug!(%status, "Action command stream error from caller");
                    break;
                }
            }
        }
    });
    rx
}

#[tonic::async_trait]
impl Actions for ActionService {
    type HandleStreamedOutStream = ReceiverStream<Result<ActionResponse, Status>>;
    type HandleStreamedStream = ReceiverStream<Result<ActionResponse, Status>>;

    async fn handle_unary(
        &self,
        request: Request<ActionCommand>,
    ) -> Result<Response<ActionResponse>, Status> {
        let command = request.into_inner();
        let handler = self.handler(&command.service_name)?;
        let response = run_unary(handler, Arc::clone(&self.effect_serializer), command).await;
        Ok(Response::new(response))
    }

    async fn handle_streamed_in(
        &self,
        request: Request<Streaming<ActionCommand>>,
    ) -> Result<Response<ActionResponse>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("Empty action command stream"))??;
        let handler = self.handler(&first.service_name)?;

        let (tx, rx) = mpsc::channel(ENTITY_QUEUE_DEPTH);
        if let Some(payload) = first.payload.clone() {
            let _ = tx.send(payload).await;
        }
        tokio::spawn(async move {
            while let Some(frame) = inbound.next().await {
                match frame {
                    Ok(command) => {
                        if tx.send(command.payload.unwrap_or_default()).await.is_err() {
                            break;
                        }
                    }
                    Err(status) => {
                        debug!(%status, "Action command stream error from caller");
                        break;
                    }
                }
            }
        });

        let response =
            run_streamed_in(handler, Arc::clone(&self.effect_serializer), first, rx).await;
        Ok(Response::new(response))
    }

    async fn handle_streamed_out(
        &self,
        request: Request<ActionCommand>,
    ) -> Result<Response<Self::HandleStreamedOutStream>, Status> {
        let command = request.into_inner();
        let handler = self.handler(&command.service_name)?;

        let (tx, rx) = mpsc::channel(ENTITY_QUEUE_DEPTH);
        tokio::spawn(run_streamed_out(
            handler,
            Arc::clone(&self.effect_serializer),
            command,
            tx,
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn handle_streamed(
        &self,
        request: Request<Streaming<ActionCommand>>,
    ) -> Result<Response<Self::HandleStreamedStream>, Status> {
        let mut inbound = request.into_inner();
        let first = inbound
            .next()
            .await
            .ok_or_else(|| Status::invalid_argument("Empty action command stream"))??;
        let handler = self.handler(&first.service_name)?;

        let payloads = pump_payloads(inbound);
        let (tx, rx) = mpsc::channel(ENTITY_QUEUE_DEPTH);
        tokio::spawn(run_streamed(
            handler,
            Arc::clone(&self.effect_serializer),
            first,
            payloads,
            tx,
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
