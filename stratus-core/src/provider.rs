//! Resource provider interface, deploy-template descriptors, and the
//! process-wide provider registry.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::environment::Environment;
use crate::error::EngineResult;
use crate::services::ServiceError;
use crate::template::Resource;
use crate::utils::first_char_to_lower;

/// Resource-level action a deploy template can describe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ResourceAction {
    Create,
    Update,
    Delete,
}

impl ResourceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context handed to provider callables and state fetches.
pub struct InvocationContext<'a> {
    pub resource_id: &'a str,
    pub resource_type: &'a str,
    pub stack_name: &'a str,
    pub resources: &'a IndexMap<String, Resource>,
    pub env: &'a Environment,
}

impl<'a> InvocationContext<'a> {
    pub fn resource(&self) -> Option<&'a Resource> {
        self.resources.get(self.resource_id)
    }

    /// Resolved properties of the target resource; an empty object when the
    /// resource is unknown.
    pub fn properties(&self) -> Value {
        self.resource()
            .map(|r| r.properties.clone())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }
}

pub type DirectFn =
    Arc<dyn Fn(&InvocationContext<'_>) -> EngineResult<Option<Value>> + Send + Sync>;
pub type ComputeParamsFn =
    Arc<dyn Fn(&InvocationContext<'_>) -> EngineResult<Option<Value>> + Send + Sync>;
pub type SelectorFn = Arc<dyn Fn(&InvocationContext<'_>) -> Option<Value> + Send + Sync>;
pub type ResultHandlerFn = Arc<dyn Fn(Option<&Value>, &mut Resource) + Send + Sync>;

/// How an action reaches the backing service.
#[derive(Clone)]
pub enum DeployCall {
    /// Invoke the named method on the service client owning the resource type.
    ServiceMethod(String),
    /// Invoke an arbitrary callable.
    Direct(DirectFn),
}

/// How call parameters are produced from resource properties.
#[derive(Clone)]
pub enum ParameterSpec {
    /// API parameter name -> property selectors; the first selector yielding
    /// a non-null value wins.
    Schema(IndexMap<String, Vec<PropertySelector>>),
    /// Arbitrary computation over the resource. Returning `None` skips the
    /// deployment of this descriptor.
    Compute(ComputeParamsFn),
}

impl ParameterSpec {
    /// Schema where every API parameter reads the identically named property.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Schema(
            names
                .into_iter()
                .map(|name| {
                    let name = name.into();
                    let selector = PropertySelector::Property(name.clone());
                    (name, vec![selector])
                })
                .collect(),
        )
    }
}

#[derive(Clone)]
pub enum PropertySelector {
    /// Read the named property, falling back to top-level resource fields
    /// and fetched state.
    Property(String),
    Computed(SelectorFn),
}

/// Per-field coercion applied to materialized call parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TypeCoercion {
    Bool,
    Int,
    Str,
}

impl TypeCoercion {
    pub fn apply(self, value: &Value) -> Value {
        match self {
            Self::Bool => match value {
                Value::Bool(_) => value.clone(),
                Value::String(s) => Value::Bool(matches!(s.as_str(), "true" | "True" | "TRUE" | "1")),
                Value::Number(n) => Value::Bool(n.as_i64() != Some(0)),
                other => other.clone(),
            },
            Self::Int => match value {
                Value::Number(_) => value.clone(),
                Value::String(s) => s
                    .parse::<i64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| value.clone()),
                Value::Bool(b) => Value::from(i64::from(*b)),
                other => other.clone(),
            },
            Self::Str => match value {
                Value::String(_) => value.clone(),
                other => Value::String(crate::utils::stringify(other)),
            },
        }
    }
}

/// One deployable step: the call, its parameters, an optional result
/// handler patching resource state, and per-field type coercions.
#[derive(Clone)]
pub struct ActionDescriptor {
    pub call: DeployCall,
    pub parameters: Option<ParameterSpec>,
    pub result_handler: Option<ResultHandlerFn>,
    pub types: HashMap<String, TypeCoercion>,
}

impl ActionDescriptor {
    pub fn service_method(name: impl Into<String>) -> Self {
        Self {
            call: DeployCall::ServiceMethod(name.into()),
            parameters: None,
            result_handler: None,
            types: HashMap::new(),
        }
    }

    pub fn direct<F>(function: F) -> Self
    where
        F: Fn(&InvocationContext<'_>) -> EngineResult<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            call: DeployCall::Direct(Arc::new(function)),
            parameters: None,
            result_handler: None,
            types: HashMap::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: ParameterSpec) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_result_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&Value>, &mut Resource) + Send + Sync + 'static,
    {
        self.result_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_type(mut self, field: impl Into<String>, coercion: TypeCoercion) -> Self {
        self.types.insert(field.into(), coercion);
        self
    }
}

/// Deploy template for one action: a single descriptor or a sequence run in
/// order. For a sequence, only the first result is surfaced.
#[derive(Clone)]
pub enum DeploySpec {
    Single(ActionDescriptor),
    Sequence(Vec<ActionDescriptor>),
}

impl DeploySpec {
    pub fn descriptors(&self) -> &[ActionDescriptor] {
        match self {
            Self::Single(descriptor) => std::slice::from_ref(descriptor),
            Self::Sequence(descriptors) => descriptors,
        }
    }
}

pub type DeployTemplates = HashMap<ResourceAction, DeploySpec>;

/// A resource provider: the per-type capability set the engine drives
/// create/update/delete through.
pub trait ResourceProvider: Send + Sync {
    /// Registry key, e.g. `AWS::Route53::RecordSet`.
    fn type_name(&self) -> &'static str;

    /// Inject missing required fields (generated names and the like) before
    /// the deployment loop starts.
    fn add_defaults(&self, _resource: &mut Resource, _stack_name: &str) {}

    fn is_updatable(&self) -> bool {
        false
    }

    /// Value produced by `Ref` for a deployed resource.
    fn get_ref(&self, resource: &Resource) -> Option<Value> {
        self.get_physical_resource_id(resource).map(Value::String)
    }

    /// Value produced by `Fn::GetAtt`.
    fn get_cfn_attribute(&self, resource: &Resource, attribute: &str) -> Option<Value> {
        default_cfn_attribute(resource, attribute)
    }

    fn get_physical_resource_id(&self, resource: &Resource) -> Option<String> {
        resource.physical_resource_id.clone()
    }

    /// Refresh runtime state from the backing service. `Ok(None)` means the
    /// resource is not deployed.
    fn fetch_state(&self, ctx: &InvocationContext<'_>) -> Result<Option<Value>, ServiceError>;

    fn get_deploy_templates(&self) -> DeployTemplates;
}

/// Generic attribute lookup: fetched state first, then properties, trying
/// the exact key and the lower-first-char variant, with a final fallback to
/// the ref-ish identifiers.
pub fn default_cfn_attribute(resource: &Resource, attribute: &str) -> Option<Value> {
    if attribute == "Ref" || attribute == "PhysicalResourceId" {
        if let Some(id) = &resource.physical_resource_id {
            return Some(Value::String(id.clone()));
        }
    }
    let lower = first_char_to_lower(attribute);
    for source in [&resource.state, &resource.properties] {
        if let Some(map) = source.as_object() {
            if let Some(value) = map.get(attribute).or_else(|| map.get(&lower)) {
                if !value.is_null() {
                    return Some(value.clone());
                }
            }
        }
    }
    if attribute == "Ref" || attribute == "PhysicalResourceId" {
        for key in ["Id", "PhysicalResourceId", "Ref"] {
            if let Some(value) = resource.state_value(key) {
                if !value.is_null() {
                    return Some(value.clone());
                }
            }
        }
    }
    None
}

/// Process-wide resource-type -> provider mapping. Built once at startup
/// and never mutated afterwards.
#[derive(Default, Clone)]
pub struct ResourceRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.providers
            .insert(provider.type_name().to_string(), provider);
        self
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(resource_type).cloned()
    }

    pub fn is_registered(&self, resource_type: &str) -> bool {
        self.providers.contains_key(resource_type)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn coercions() {
        assert_eq!(TypeCoercion::Bool.apply(&json!("true")), json!(true));
        assert_eq!(TypeCoercion::Bool.apply(&json!("no")), json!(false));
        assert_eq!(TypeCoercion::Int.apply(&json!("300")), json!(300));
        assert_eq!(TypeCoercion::Int.apply(&json!("abc")), json!("abc"));
        assert_eq!(TypeCoercion::Str.apply(&json!(42)), json!("42"));
    }

    #[test]
    fn default_attribute_prefers_state_over_properties() {
        let mut resource =
            Resource::new("AWS::S3::Bucket").with_property("Arn", json!("from-props"));
        resource.set_state_value("Arn", json!("from-state"));
        assert_eq!(
            default_cfn_attribute(&resource, "Arn"),
            Some(json!("from-state"))
        );
    }

    #[test]
    fn default_attribute_falls_back_to_lowercase_key() {
        let mut resource = Resource::new("AWS::S3::Bucket");
        resource.set_state_value("arn", json!("lower"));
        assert_eq!(default_cfn_attribute(&resource, "Arn"), Some(json!("lower")));
    }

    #[test]
    fn ref_attribute_uses_physical_id_then_state_id() {
        let mut resource = Resource::new("AWS::S3::Bucket");
        resource.set_state_value("Id", json!("state-id"));
        assert_eq!(default_cfn_attribute(&resource, "Ref"), Some(json!("state-id")));
        resource.physical_resource_id = Some("phys-id".to_string());
        assert_eq!(default_cfn_attribute(&resource, "Ref"), Some(json!("phys-id")));
    }

    #[test]
    fn schema_from_names_reads_identical_properties() {
        let ParameterSpec::Schema(schema) = ParameterSpec::from_names(["Name", "Type"]) else {
            panic!("expected schema");
        };
        assert_eq!(schema.len(), 2);
        assert!(matches!(
            schema["Name"][0],
            PropertySelector::Property(ref key) if key == "Name"
        ));
    }
}
