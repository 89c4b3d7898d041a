//! Statehost - user-function runtime
//!
//! Hosts application components (actions, value entities, event-sourced
//! entities, replicated entities, and views) and speaks the
//! bidirectional-streaming component protocols with an external proxy
//! that owns persistence, sharding, and routing.

pub mod any_support;
pub mod bootstrap;
pub mod component;
pub mod config;
pub mod context;
pub mod crdt;
pub mod doc_links;
pub mod effect;
pub mod metadata;
pub mod registry;
pub mod reply;
pub mod runtime;
pub mod services;

// Re-export generated proto types
pub mod proto {
    tonic::include_proto!("statehost.protocol");
}

// Re-export common types for library usage
pub use any_support::{AnySupport, ComparableKey, DecodedValue, PrimitiveValue};
pub use component::{
    ActionHandler, Component, EntityOptions, EventSourcedHandler, PreStartInfo,
    ReplicatedEntityHandler, ValueEntityHandler, WriteConsistency,
};
pub use config::Config;
pub use context::ContextFailure;
pub use crdt::{
    Clock, Counter, CounterMap, MultiMap, Register, RegisterMap, ReplicatedData, ReplicatedMap,
    ReplicatedSet, Vote,
};
pub use metadata::{Metadata, MetadataValue};
pub use registry::ComponentRegistry;
pub use reply::{Effect, Forward, Reply};
pub use runtime::{RunningRuntime, Runtime, RuntimeError};
pub use services::replicated::StreamPush;
