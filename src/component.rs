//! User components and their handler contracts.
//!
//! A component binds a fully-qualified protobuf service name to user code:
//! a stateless action, a value entity, an event-sourced entity, a
//! replicated entity, or a view. Components are registered with the
//! runtime before start and advertised to the proxy during discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost_types::Any;

use crate::context::ContextFailure;
use crate::crdt::ReplicatedData;
use crate::proto;
use crate::reply::Reply;
use crate::services::action::{ActionContext, CommandStream, StreamedActionContext};
use crate::services::event_sourced::EventSourcedCommandContext;
use crate::services::replicated::ReplicatedCommandContext;
use crate::services::value_entity::ValueEntityCommandContext;

/// Component type tag for value entities.
pub const VALUE_ENTITY_TYPE: &str = "statehost.component.valueentity";
/// Component type tag for event-sourced entities.
pub const EVENT_SOURCED_TYPE: &str = "statehost.component.eventsourced";
/// Component type tag for replicated entities.
pub const REPLICATED_ENTITY_TYPE: &str = "statehost.component.replicatedentity";
/// Component type tag for actions.
pub const ACTION_TYPE: &str = "statehost.component.action";
/// Component type tag for views.
pub const VIEW_TYPE: &str = "statehost.component.view";

/// Write consistency for replicated entity updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConsistency {
    Local,
    Majority,
    All,
}

impl WriteConsistency {
    fn to_proto(self) -> proto::ReplicatedWriteConsistency {
        match self {
            WriteConsistency::Local => proto::ReplicatedWriteConsistency::LocalUnspecified,
            WriteConsistency::Majority => proto::ReplicatedWriteConsistency::Majority,
            WriteConsistency::All => proto::ReplicatedWriteConsistency::All,
        }
    }
}

/// Per-entity configuration advertised to the proxy.
#[derive(Debug, Clone)]
pub struct EntityOptions {
    /// Namespace for persisted state; distinguishes entities sharing a
    /// store.
    pub entity_type: String,
    /// Idle-eviction hint for the proxy.
    pub passivation_timeout: Option<Duration>,
    /// Request headers the proxy surfaces to command handlers.
    pub forward_headers: Vec<String>,
    /// Replicated entities only.
    pub write_consistency: Option<WriteConsistency>,
    /// Event-sourced entities only: snapshot every N events.
    pub snapshot_every: Option<u32>,
}

impl EntityOptions {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            passivation_timeout: None,
            forward_headers: Vec::new(),
            write_consistency: None,
            snapshot_every: None,
        }
    }

    pub fn with_passivation_timeout(mut self, timeout: Duration) -> Self {
        self.passivation_timeout = Some(timeout);
        self
    }

    pub fn with_forward_headers(mut self, headers: Vec<String>) -> Self {
        self.forward_headers = headers;
        self
    }

    pub fn with_write_consistency(mut self, consistency: WriteConsistency) -> Self {
        self.write_consistency = Some(consistency);
        self
    }

    pub fn with_snapshot_every(mut self, events: u32) -> Self {
        self.snapshot_every = Some(events);
        self
    }

    fn to_proto(&self) -> proto::EntitySettings {
        proto::EntitySettings {
            entity_type: self.entity_type.clone(),
            passivation_strategy: self.passivation_timeout.map(|timeout| {
                proto::PassivationStrategy {
                    strategy: Some(proto::passivation_strategy::Strategy::Timeout(
                        proto::TimeoutPassivationStrategy {
                            timeout: timeout.as_millis() as i64,
                        },
                    )),
                }
            }),
            forward_headers: self.forward_headers.clone(),
            replicated_write_consistency: self
                .write_consistency
                .map(|c| c.to_proto() as i32)
                .unwrap_or_default(),
            snapshot_every: self.snapshot_every.unwrap_or(0) as i32,
        }
    }
}

/// Proxy connection details passed to components before the first command.
///
/// Components use this to configure outbound clients back through the
/// proxy.
#[derive(Debug, Clone, Default)]
pub struct PreStartInfo {
    pub proxy_hostname: String,
    pub proxy_port: i32,
    pub identification: Option<proto::IdentificationInfo>,
}

/// Handler contract for value entities.
#[async_trait]
pub trait ValueEntityHandler: Send + Sync {
    /// State for an entity the proxy has nothing stored for, and the state
    /// installed again after a delete.
    fn initial_state(&self, entity_id: &str) -> Option<Any> {
        let _ = entity_id;
        None
    }

    /// Handle one command. State changes go through the context; the
    /// returned reply is sent to the caller.
    async fn handle_command(
        &self,
        ctx: &mut ValueEntityCommandContext,
        name: &str,
        payload: Any,
    ) -> Result<Reply, ContextFailure>;

    /// Called once per proxy handshake, before any command.
    fn pre_start(&self, info: &PreStartInfo) {
        let _ = info;
    }
}

/// Handler contract for event-sourced entities.
#[async_trait]
pub trait EventSourcedHandler: Send + Sync {
    /// State for an entity with no snapshot and no events.
    fn initial_state(&self, entity_id: &str) -> Option<Any> {
        let _ = entity_id;
        None
    }

    /// Turn a snapshot into state. The default treats the snapshot as the
    /// state itself.
    fn restore_snapshot(&self, snapshot: Any) -> Result<Option<Any>, ContextFailure> {
        Ok(Some(snapshot))
    }

    /// Apply one event, yielding the next state. `event_name` is the
    /// unqualified message name of the event payload.
    fn handle_event(
        &self,
        state: Option<Any>,
        event_name: &str,
        event: Any,
    ) -> Result<Option<Any>, ContextFailure>;

    /// Handle one command. Events are emitted through the context.
    async fn handle_command(
        &self,
        ctx: &mut EventSourcedCommandContext,
        name: &str,
        payload: Any,
    ) -> Result<Reply, ContextFailure>;

    /// Produce a snapshot of the current state. The default snapshots the
    /// state itself.
    fn snapshot(&self, state: Option<&Any>) -> Option<Any> {
        state.cloned()
    }

    /// Called once per proxy handshake, before any command.
    fn pre_start(&self, info: &PreStartInfo) {
        let _ = info;
    }
}

/// Handler contract for replicated entities.
#[async_trait]
pub trait ReplicatedEntityHandler: Send + Sync {
    /// Called whenever a new top-level state is installed, whether by an
    /// inbound delta or by the command context. May enrich the state but
    /// must not re-enter the command loop.
    fn on_state_set(&self, state: &mut ReplicatedData, entity_id: &str) {
        let _ = (state, entity_id);
    }

    /// Handle one command against the current state.
    async fn handle_command(
        &self,
        ctx: &mut ReplicatedCommandContext,
        name: &str,
        payload: Any,
    ) -> Result<Reply, ContextFailure>;

    /// Called once per proxy handshake, before any command.
    fn pre_start(&self, info: &PreStartInfo) {
        let _ = info;
    }
}

/// Handler contract for actions. Every shape has a failing default so a
/// handler implements only the shapes its service declares.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle_unary(
        &self,
        ctx: &mut ActionContext,
        name: &str,
        payload: Any,
    ) -> Result<Reply, ContextFailure> {
        let _ = (ctx, payload);
        Err(ContextFailure::new(format!(
            "No unary handler registered for command {name}"
        )))
    }

    async fn handle_streamed_in(
        &self,
        ctx: &mut ActionContext,
        name: &str,
        commands: CommandStream,
    ) -> Result<Reply, ContextFailure> {
        let _ = (ctx, commands);
        Err(ContextFailure::new(format!(
            "No streamed-in handler registered for command {name}"
        )))
    }

    async fn handle_streamed_out(
        &self,
        ctx: &mut StreamedActionContext,
        name: &str,
        payload: Any,
    ) -> Result<(), ContextFailure> {
        let _ = (ctx, payload);
        Err(ContextFailure::new(format!(
            "No streamed-out handler registered for command {name}"
        )))
    }

    async fn handle_streamed(
        &self,
        ctx: &mut StreamedActionContext,
        name: &str,
        commands: CommandStream,
    ) -> Result<(), ContextFailure> {
        let _ = (ctx, commands);
        Err(ContextFailure::new(format!(
            "No streamed handler registered for command {name}"
        )))
    }

    /// Called once per proxy handshake, before any command.
    fn pre_start(&self, info: &PreStartInfo) {
        let _ = info;
    }
}

/// A registered component.
#[derive(Clone)]
pub enum Component {
    ValueEntity {
        service_name: String,
        options: EntityOptions,
        handler: Arc<dyn ValueEntityHandler>,
    },
    EventSourced {
        service_name: String,
        options: EntityOptions,
        handler: Arc<dyn EventSourcedHandler>,
    },
    Replicated {
        service_name: String,
        options: EntityOptions,
        handler: Arc<dyn ReplicatedEntityHandler>,
    },
    Action {
        service_name: String,
        handler: Arc<dyn ActionHandler>,
    },
    View {
        service_name: String,
    },
}

impl Component {
    pub fn value_entity(
        service_name: impl Into<String>,
        options: EntityOptions,
        handler: impl ValueEntityHandler + 'static,
    ) -> Self {
        Component::ValueEntity {
            service_name: service_name.into(),
            options,
            handler: Arc::new(handler),
        }
    }

    pub fn event_sourced(
        service_name: impl Into<String>,
        options: EntityOptions,
        handler: impl EventSourcedHandler + 'static,
    ) -> Self {
        Component::EventSourced {
            service_name: service_name.into(),
            options,
            handler: Arc::new(handler),
        }
    }

    pub fn replicated(
        service_name: impl Into<String>,
        options: EntityOptions,
        handler: impl ReplicatedEntityHandler + 'static,
    ) -> Self {
        Component::Replicated {
            service_name: service_name.into(),
            options,
            handler: Arc::new(handler),
        }
    }

    pub fn action(
        service_name: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) -> Self {
        Component::Action {
            service_name: service_name.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn view(service_name: impl Into<String>) -> Self {
        Component::View {
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        match self {
            Component::ValueEntity { service_name, .. }
            | Component::EventSourced { service_name, .. }
            | Component::Replicated { service_name, .. }
            | Component::Action { service_name, .. }
            | Component::View { service_name } => service_name,
        }
    }

    pub fn component_type(&self) -> &'static str {
        match self {
            Component::ValueEntity { .. } => VALUE_ENTITY_TYPE,
            Component::EventSourced { .. } => EVENT_SOURCED_TYPE,
            Component::Replicated { .. } => REPLICATED_ENTITY_TYPE,
            Component::Action { .. } => ACTION_TYPE,
            Component::View { .. } => VIEW_TYPE,
        }
    }

    pub(crate) fn entity_options(&self) -> Option<&EntityOptions> {
        match self {
            Component::ValueEntity { options, .. }
            | Component::EventSourced { options, .. }
            | Component::Replicated { options, .. } => Some(options),
            Component::Action { .. } | Component::View { .. } => None,
        }
    }

    pub(crate) fn pre_start(&self, info: &PreStartInfo) {
        match self {
            Component::ValueEntity { handler, .. } => handler.pre_start(info),
            Component::EventSourced { handler, .. } => handler.pre_start(info),
            Component::Replicated { handler, .. } => handler.pre_start(info),
            Component::Action { handler, .. } => handler.pre_start(info),
            Component::View { .. } => {}
        }
    }

    /// The discovery description of this component.
    pub(crate) fn to_proto(&self) -> proto::Component {
        proto::Component {
            component_type: self.component_type().to_string(),
            service_name: self.service_name().to_string(),
            component_settings: self
                .entity_options()
                .map(|o| proto::component::ComponentSettings::Entity(o.to_proto())),
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("service_name", &self.service_name())
            .field("component_type", &self.component_type())
            .finish()
    }
}
