//! Narrow interfaces to backing services.
//!
//! The engine never talks to a cloud SDK directly: every call goes through a
//! [`ServiceClient`] registered for the owning service. Real clients live
//! outside this crate; tests register recording fakes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;

use crate::provider::TypeCoercion;

/// Substrings identifying a "not found" failure from a backing service.
/// During deletes these are treated as success.
pub const NOT_FOUND_MARKERS: &[&str] = &[
    "NoSuchBucket",
    "ResourceNotFound",
    "NoSuchEntity",
    "NotFoundException",
    "404",
    "not found",
    "not exist",
];

/// Failure returned by a backing service call.
#[derive(Debug, Clone, Error)]
#[error("{}: {}", .code.as_deref().unwrap_or("ServiceFailure"), .message)]
pub struct ServiceError {
    pub code: Option<String>,
    pub message: String,
    /// Present when the service rejected the call because of parameter
    /// types; the invoker coerces the reported fields and retries once.
    pub validation_report: Option<ParamValidationReport>,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            validation_report: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_validation_report(mut self, report: ParamValidationReport) -> Self {
        self.validation_report = Some(report);
        self
    }

    pub fn is_not_found(&self) -> bool {
        let code = self.code.as_deref().unwrap_or("");
        NOT_FOUND_MARKERS
            .iter()
            .any(|marker| code.contains(marker) || self.message.contains(marker))
    }
}

/// Report attached to a parameter-validation failure, naming the fields
/// whose types must be rewritten.
#[derive(Debug, Clone, Default)]
pub struct ParamValidationReport {
    pub issues: Vec<ParamIssue>,
}

/// One offending parameter: a dotted path into the call parameters and the
/// type the service expects there.
#[derive(Debug, Clone)]
pub struct ParamIssue {
    pub path: String,
    pub expected: TypeCoercion,
}

/// A blocking client for one backing service.
pub trait ServiceClient: Send + Sync {
    fn invoke(&self, method: &str, params: Value) -> Result<Value, ServiceError>;
}

/// Service-name -> client mapping, populated at startup.
#[derive(Default, Clone)]
pub struct ServiceClientRegistry {
    clients: HashMap<String, Arc<dyn ServiceClient>>,
}

impl ServiceClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, service: impl Into<String>, client: Arc<dyn ServiceClient>) -> Self {
        self.clients.insert(service.into(), client);
        self
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn ServiceClient>> {
        self.clients.get(service).cloned()
    }
}

/// Service name owning a resource type, e.g. `AWS::Route53::RecordSet` ->
/// `route53`. A handful of services use a client name that differs from
/// their type namespace.
pub fn service_name_for_type(resource_type: &str) -> Option<String> {
    let parts: Vec<&str> = resource_type.split("::").collect();
    if parts.len() < 2 {
        return None;
    }
    if resource_type.ends_with("Cognito::UserPool") {
        return Some("cognito-idp".to_string());
    }
    let service = match parts[parts.len() - 2] {
        "Cognito" => "cognito-idp",
        "Elasticsearch" => "es",
        "OpenSearchService" => "opensearch",
        "KinesisFirehose" => "firehose",
        "ResourceGroups" => "resource-groups",
        "CertificateManager" => "acm",
        _ => return Some(parts[1].to_ascii_lowercase()),
    };
    Some(service.to_string())
}

/// Cross-stack exports, shared between concurrently deploying stacks.
///
/// Written only while resolving the outputs of a completed stack; readers
/// tolerate stale views, and a missing export resolves to null rather than
/// blocking.
#[derive(Default, Clone)]
pub struct ExportsMap {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl ExportsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
    }

    pub fn publish(&self, name: impl Into<String>, value: Value) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(name.into(), value);
        }
    }

    pub fn remove(&self, name: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(name);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn not_found_matches_markers_in_code_and_message() {
        assert!(ServiceError::new("x").with_code("NotFoundException").is_not_found());
        assert!(ServiceError::new("record does not exist").is_not_found());
        assert!(!ServiceError::new("AccessDenied").is_not_found());
    }

    #[test]
    fn service_names_with_special_cases() {
        assert_eq!(
            service_name_for_type("AWS::Route53::RecordSet").as_deref(),
            Some("route53")
        );
        assert_eq!(
            service_name_for_type("AWS::Cognito::UserPool").as_deref(),
            Some("cognito-idp")
        );
        assert_eq!(
            service_name_for_type("AWS::OpenSearchService::Domain").as_deref(),
            Some("opensearch")
        );
        assert_eq!(
            service_name_for_type("AWS::CertificateManager::Certificate").as_deref(),
            Some("acm")
        );
        assert_eq!(service_name_for_type("Parameter"), None);
    }

    #[test]
    fn exports_resolve_missing_names_to_none() {
        let exports = ExportsMap::new();
        assert_eq!(exports.get("missing"), None);
        exports.publish("api-url", json!("http://localhost"));
        assert_eq!(exports.get("api-url"), Some(json!("http://localhost")));
        exports.remove("api-url");
        assert_eq!(exports.get("api-url"), None);
    }
}
