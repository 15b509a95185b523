//! Action invoker: materializes call parameters from resource properties,
//! normalizes them, dispatches the provider's deploy descriptors, and applies
//! result handlers to patch resource state.

use std::sync::LazyLock;

use indexmap::IndexMap;
use log::{debug, warn};
use regex::Regex;
use serde_json::Value;

use crate::environment::Environment;
use crate::error::{EngineError, EngineResult};
use crate::provider::{
    ActionDescriptor, DeployCall, InvocationContext, ParameterSpec, PropertySelector,
    ResourceAction, TypeCoercion,
};
use crate::services::{ParamValidationReport, ServiceClient, service_name_for_type};
use crate::template::{PARAMETER_TYPE, Resource};
use crate::utils::remove_nulls;

static ARN_ACCOUNT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(arn:[^:\s]+:[^:\s]+:[^:\s]*:)(\d{12})(:)").expect("arn regex"));

/// Run the provider deploy template for `action` against one resource.
///
/// Unknown resource types and missing actions are skipped with a warning;
/// the reserved `Parameter` type is silently a no-op. For descriptor
/// sequences, every descriptor runs but only the first result is surfaced.
pub fn execute_resource_action(
    resource_id: &str,
    action: ResourceAction,
    stack_name: &str,
    resources: &mut IndexMap<String, Resource>,
    env: &Environment,
) -> EngineResult<Option<Value>> {
    let Some(resource) = resources.get(resource_id) else {
        return Err(EngineError::Deployment(format!(
            "unknown resource \"{resource_id}\""
        )));
    };
    let resource_type = resource.resource_type.clone();
    if resource_type == PARAMETER_TYPE {
        return Ok(None);
    }

    let Some(provider) = env.registry.get(&resource_type) else {
        warn!("no resource provider registered for type \"{resource_type}\", skipping {action}");
        return Ok(None);
    };
    let templates = provider.get_deploy_templates();
    let Some(spec) = templates.get(&action) else {
        warn!("action \"{action}\" for resource type \"{resource_type}\" not available");
        return Ok(None);
    };

    debug!("running action \"{action}\" for resource type \"{resource_type}\" id \"{resource_id}\"");

    let mut results: Vec<Option<Value>> = Vec::new();
    for descriptor in spec.descriptors() {
        let result = run_descriptor(
            resource_id,
            &resource_type,
            action,
            stack_name,
            resources,
            env,
            descriptor,
        )?;
        if let Some(handler) = &descriptor.result_handler {
            debug!("executing result handler for {resource_type}:{resource_id}");
            if let Some(resource) = resources.get_mut(resource_id) {
                handler(result.as_ref(), resource);
            }
        }
        results.push(result);
    }
    Ok(results.into_iter().next().flatten())
}

fn run_descriptor(
    resource_id: &str,
    resource_type: &str,
    action: ResourceAction,
    stack_name: &str,
    resources: &IndexMap<String, Resource>,
    env: &Environment,
    descriptor: &ActionDescriptor,
) -> EngineResult<Option<Value>> {
    let ctx = InvocationContext {
        resource_id,
        resource_type,
        stack_name,
        resources,
        env,
    };
    match &descriptor.call {
        DeployCall::Direct(function) => function(&ctx),
        DeployCall::ServiceMethod(method) => {
            let Some(service) = service_name_for_type(resource_type) else {
                return Err(EngineError::Deployment(format!(
                    "cannot derive service name for resource type \"{resource_type}\""
                )));
            };
            let Some(client) = env.clients.get(&service) else {
                warn!("unable to get client for \"{service}\" API, skipping deployment");
                return Ok(None);
            };
            let Some(params) = resolve_resource_parameters(&ctx, descriptor)? else {
                return Ok(None);
            };
            invoke_function(client.as_ref(), method, params, resource_type, action)
        }
    }
}

/// Materialize the call parameters for a descriptor. `Ok(None)` indicates
/// the deployment of this descriptor should be skipped.
pub fn resolve_resource_parameters(
    ctx: &InvocationContext<'_>,
    descriptor: &ActionDescriptor,
) -> EngineResult<Option<Value>> {
    let params = match &descriptor.parameters {
        None => ctx.properties(),
        Some(ParameterSpec::Compute(function)) => match function(ctx)? {
            Some(params) => params,
            None => return Ok(None),
        },
        Some(ParameterSpec::Schema(schema)) => {
            let Some(resource) = ctx.resource() else {
                return Ok(None);
            };
            let mut out = serde_json::Map::new();
            for (api_name, selectors) in schema {
                for selector in selectors {
                    let value = match selector {
                        PropertySelector::Property(key) => lookup_property(resource, key),
                        PropertySelector::Computed(function) => function(ctx),
                    };
                    if let Some(value) = value {
                        if !value.is_null() {
                            out.insert(api_name.clone(), value);
                            break;
                        }
                    }
                }
            }
            Value::Object(out)
        }
    };

    let params = fix_account_id_in_arns(&params, &ctx.env.account_id);
    let params = convert_data_types(&descriptor.types, &params);
    Ok(Some(remove_nulls(&params)))
}

fn lookup_property(resource: &Resource, key: &str) -> Option<Value> {
    if let Some(value) = resource.property(key) {
        return Some(value.clone());
    }
    match key {
        "PhysicalResourceId" => {
            if let Some(id) = &resource.physical_resource_id {
                return Some(Value::String(id.clone()));
            }
        }
        "Type" => return Some(Value::String(resource.resource_type.clone())),
        _ => {}
    }
    resource.state_value(key).cloned()
}

/// Rewrite any account id embedded in an ARN to the engine's canonical one.
pub fn fix_account_id_in_arns(value: &Value, account_id: &str) -> Value {
    match value {
        Value::String(s) => Value::String(
            ARN_ACCOUNT_ID
                .replace_all(s, format!("${{1}}{account_id}${{3}}").as_str())
                .into_owned(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| fix_account_id_in_arns(item, account_id))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fix_account_id_in_arns(v, account_id)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Apply the descriptor's per-field coercions, at any nesting depth.
pub fn convert_data_types(
    types: &std::collections::HashMap<String, TypeCoercion>,
    value: &Value,
) -> Value {
    if types.is_empty() {
        return value.clone();
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let converted = match types.get(k) {
                        Some(coercion) => coercion.apply(v),
                        None => convert_data_types(types, v),
                    };
                    (k.clone(), converted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| convert_data_types(types, item))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Invoke a service method, retrying once after rewriting parameters when
/// the service reports a parameter-validation failure. Not-found failures
/// during deletes are swallowed.
pub fn invoke_function(
    client: &dyn ServiceClient,
    method: &str,
    params: Value,
    resource_type: &str,
    action: ResourceAction,
) -> EngineResult<Option<Value>> {
    let result = match client.invoke(method, params.clone()) {
        Ok(result) => Ok(result),
        Err(err) => match &err.validation_report {
            Some(report) => {
                debug!("converting parameters to allowed types for \"{method}\"");
                let converted = apply_validation_report(&params, report);
                client.invoke(method, converted)
            }
            None => Err(err),
        },
    };

    match result {
        Ok(result) => Ok(Some(result)),
        Err(err) if action == ResourceAction::Delete && err.is_not_found() => {
            debug!("treating \"not found\" error during delete of {resource_type} as success: {err}");
            Ok(None)
        }
        Err(err) => {
            warn!("error calling \"{method}\" for resource type \"{resource_type}\": {err}");
            Err(err.into())
        }
    }
}

/// Coerce the fields named by a validation report, addressed by dotted path.
fn apply_validation_report(params: &Value, report: &ParamValidationReport) -> Value {
    let mut converted = params.clone();
    for issue in &report.issues {
        let mut cursor = &mut converted;
        let mut found = true;
        let mut segments = issue.path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let next = match cursor.get_mut(segment) {
                Some(next) => next,
                None => {
                    found = false;
                    break;
                }
            };
            if segments.peek().is_none() {
                *next = issue.expected.apply(next);
                break;
            }
            cursor = next;
        }
        if !found {
            debug!("validation report names unknown parameter \"{}\"", issue.path);
        }
    }
    converted
}
