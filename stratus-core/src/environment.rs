//! Engine environment: identity constants, local service knobs, and the
//! registries shared by all deployments.

use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::{ResourceProvider, ResourceRegistry};
use crate::services::{ExportsMap, ServiceClient, ServiceClientRegistry};

pub const DEFAULT_ACCOUNT_ID: &str = "000000000000";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_PARTITION: &str = "aws";
/// Domain substituted wherever the reference cloud would use its own.
pub const LOCAL_URL_SUFFIX: &str = "localhost.localstack.cloud";

/// Shared, effectively immutable engine configuration.
///
/// Concurrent stack deployments share one `Environment`; only the exports
/// map is ever written after startup.
pub struct Environment {
    pub region: String,
    pub account_id: String,
    pub partition: String,
    pub url_suffix: String,
    service_ports: HashMap<String, u16>,
    pub clients: ServiceClientRegistry,
    pub exports: ExportsMap,
    pub registry: ResourceRegistry,
}

impl Environment {
    pub fn new(registry: ResourceRegistry, clients: ServiceClientRegistry) -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            partition: DEFAULT_PARTITION.to_string(),
            url_suffix: LOCAL_URL_SUFFIX.to_string(),
            service_ports: HashMap::new(),
            clients,
            exports: ExportsMap::new(),
            registry,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    /// Local port a service is reachable on, used when rewriting
    /// constructed service URLs to their local endpoints.
    pub fn with_service_port(mut self, service: impl Into<String>, port: u16) -> Self {
        self.service_ports.insert(service.into(), port);
        self
    }

    pub fn service_port(&self, service: &str) -> Option<u16> {
        self.service_ports.get(service).copied()
    }

    pub fn client(&self, service: &str) -> Option<Arc<dyn ServiceClient>> {
        self.clients.get(service)
    }

    pub fn provider(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.registry.get(resource_type)
    }
}
