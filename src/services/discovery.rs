//! Discovery service.
//!
//! Handles the proxy handshake: advertises the registered components with
//! their entity settings and the compiled descriptor set, and surfaces
//! proxy-reported user errors in the logs.

use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::component::PreStartInfo;
use crate::doc_links::format_error_report;
use crate::proto::discovery_server::Discovery;
use crate::proto::{ProxyInfo, ServiceInfo, Spec, UserFunctionError};
use crate::registry::ComponentRegistry;

/// Protocol version advertised to the proxy.
pub const PROTOCOL_MAJOR_VERSION: i32 = 1;
pub const PROTOCOL_MINOR_VERSION: i32 = 0;

/// The discovery service.
pub struct DiscoveryService {
    registry: Arc<ComponentRegistry>,
    service_info: ServiceInfo,
    descriptor_set: Vec<u8>,
    source_root: PathBuf,
}

impl DiscoveryService {
    pub(crate) fn new(
        registry: Arc<ComponentRegistry>,
        service_name: String,
        service_version: String,
        descriptor_set: Vec<u8>,
        source_root: PathBuf,
    ) -> Self {
        Self {
            registry,
            service_info: ServiceInfo {
                service_name,
                service_version,
                service_runtime: format!("rust {}", env!("CARGO_PKG_RUST_VERSION")),
                support_library_name: env!("CARGO_PKG_NAME").to_string(),
                support_library_version: env!("CARGO_PKG_VERSION").to_string(),
                protocol_major_version: PROTOCOL_MAJOR_VERSION,
                protocol_minor_version: PROTOCOL_MINOR_VERSION,
            },
            descriptor_set,
            source_root,
        }
    }
}

#[tonic::async_trait]
impl Discovery for DiscoveryService {
    async fn discover(&self, request: Request<ProxyInfo>) -> Result<Response<Spec>, Status> {
        let proxy_info = request.into_inner();
        info!(
            proxy = %proxy_info.proxy_name,
            version = %proxy_info.proxy_version,
            protocol = format!(
                "{}.{}",
                proxy_info.protocol_major_version, proxy_info.protocol_minor_version
            ),
            "Discovery request from proxy"
        );

        if self.registry.is_empty() {
            warn!("No components registered; the proxy will have nothing to route to");
        }

        // Components may configure outbound clients before any command
        // reaches them.
        let pre_start = PreStartInfo {
            proxy_hostname: proxy_info.proxy_hostname.clone(),
            proxy_port: proxy_info.proxy_port,
            identification: proxy_info.identification_info.clone(),
        };
        self.registry.pre_start_all(&pre_start);

        Ok(Response::new(Spec {
            proto: self.descriptor_set.clone(),
            service_info: Some(self.service_info.clone()),
            components: self.registry.descriptions(),
        }))
    }

    async fn report_error(
        &self,
        request: Request<UserFunctionError>,
    ) -> Result<Response<()>, Status> {
        let user_error = request.into_inner();
        error!(
            "{}",
            format_error_report(&user_error, &self.source_root)
        );
        Ok(Response::new(()))
    }

    async fn proxy_terminated(&self, _request: Request<()>) -> Result<Response<()>, Status> {
        info!("Proxy terminated");
        Ok(Response::new(()))
    }

    async fn health_check(&self, _request: Request<()>) -> Result<Response<()>, Status> {
        Ok(Response::new(()))
    }
}
