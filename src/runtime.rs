//! The host runtime.
//!
//! Owns the gRPC server lifecycle: components are registered before
//! [`Runtime::start`], which loads the compiled descriptor set, binds the
//! listen endpoint, and serves the discovery, health, and component
//! protocols until [`RunningRuntime::try_shutdown`] quiesces them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use prost_reflect::DescriptorPool;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::any_support::AnySupport;
use crate::component::Component;
use crate::config::{Config, ConfigError};
use crate::effect::EffectSerializer;
use crate::proto::actions_server::ActionsServer;
use crate::proto::discovery_server::DiscoveryServer;
use crate::proto::event_sourced_entities_server::EventSourcedEntitiesServer;
use crate::proto::replicated_entities_server::ReplicatedEntitiesServer;
use crate::proto::value_entities_server::ValueEntitiesServer;
use crate::registry::{ComponentRegistry, RegistryError};
use crate::services::{
    ActionService, DiscoveryService, EntityTracker, EventSourcedService, ReplicatedEntityService,
    ValueEntityService,
};

/// Errors from runtime startup and shutdown.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to read descriptor set '{path}': {source}")]
    DescriptorSet {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse descriptor set: {0}")]
    DescriptorPool(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Runtime task failed: {0}")]
    Join(String),
}

/// Builder for a running host: register components, then start.
pub struct Runtime {
    config: Config,
    registry: ComponentRegistry,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: ComponentRegistry::new(),
        }
    }

    /// A runtime configured from file and environment.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Ok(Self::new(Config::load()?))
    }

    /// Register a component. Every component must be added before start.
    pub fn register(&mut self, component: Component) -> Result<&mut Self, RuntimeError> {
        info!(
            service = %component.service_name(),
            component_type = %component.component_type(),
            "Registering component"
        );
        self.registry.register(component)?;
        Ok(self)
    }

    /// Load descriptors, bind the endpoint, and serve.
    pub async fn start(self) -> Result<RunningRuntime, RuntimeError> {
        let descriptor_path = self.config.descriptor_set_path.clone();
        let descriptor_bytes =
            std::fs::read(&descriptor_path).map_err(|source| RuntimeError::DescriptorSet {
                path: descriptor_path.clone(),
                source,
            })?;
        let pool = DescriptorPool::decode(descriptor_bytes.as_slice())
            .map_err(|e| RuntimeError::DescriptorPool(e.to_string()))?;
        let any_support = AnySupport::new(pool);

        let registry = Arc::new(self.registry);
        let effect_serializer = Arc::new(EffectSerializer::new(
            any_support.clone(),
            registry.service_names().map(String::from).collect::<Vec<_>>(),
        ));
        let tracker = EntityTracker::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RuntimeError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| RuntimeError::Bind {
            addr: self.config.bind_addr(),
            source,
        })?;

        let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<DiscoveryServer<DiscoveryService>>()
            .await;

        let discovery = DiscoveryService::new(
            Arc::clone(&registry),
            self.config.service.name.clone(),
            self.config.service.version.clone(),
            descriptor_bytes,
            PathBuf::from("."),
        );

        let router = Server::builder()
            .add_service(health_service)
            .add_service(DiscoveryServer::new(discovery))
            .add_service(ValueEntitiesServer::new(ValueEntityService::new(
                Arc::clone(&registry),
                Arc::clone(&effect_serializer),
                Arc::clone(&tracker),
                shutdown_rx.clone(),
            )))
            .add_service(EventSourcedEntitiesServer::new(EventSourcedService::new(
                Arc::clone(&registry),
                Arc::clone(&effect_serializer),
                Arc::clone(&tracker),
                shutdown_rx.clone(),
            )))
            .add_service(ReplicatedEntitiesServer::new(ReplicatedEntityService::new(
                Arc::clone(&registry),
                any_support.clone(),
                Arc::clone(&effect_serializer),
                Arc::clone(&tracker),
                shutdown_rx.clone(),
            )))
            .add_service(ActionsServer::new(ActionService::new(
                Arc::clone(&registry),
                Arc::clone(&effect_serializer),
            )));

        let mut shutdown_signal = shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    let _ = shutdown_signal.wait_for(|stopped| *stopped).await;
                })
                .await
        });

        info!(address = %local_addr, "Runtime started");

        Ok(RunningRuntime {
            local_addr,
            shutdown: shutdown_tx,
            handle,
        })
    }
}

/// A started host. Dropping it aborts the server; prefer
/// [`try_shutdown`](Self::try_shutdown).
pub struct RunningRuntime {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl RunningRuntime {
    /// The bound listen address. With port 0 in the config, this carries
    /// the ephemeral port actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Quiesce: stop accepting streams, let the per-entity command loops
    /// drain their queued frames, then stop the server.
    pub async fn try_shutdown(self) -> Result<(), RuntimeError> {
        info!("Runtime shutting down");
        let _ = self.shutdown.send(true);
        match self.handle.await {
            Ok(result) => {
                result?;
                info!("Runtime stopped");
                Ok(())
            }
            Err(join_error) => Err(RuntimeError::Join(join_error.to_string())),
        }
    }
}
