//! `AWS::Route53::RecordSet` provider.
//!
//! Records are written with a single `change_resource_record_sets` UPSERT.
//! When only a `HostedZoneName` is given, the zone id is looked up by name
//! first; the lookup must be unambiguous. The record's physical resource id
//! is its `Name`.

use std::sync::Arc;

use log::debug;
use serde_json::{Map, Value, json};

use stratus_core::{
    ActionDescriptor, DeploySpec, DeployTemplates, EngineError, EngineResult, InvocationContext,
    ParameterSpec, Resource, ResourceAction, ResourceProvider, ServiceClient, ServiceError,
};

const SERVICE: &str = "route53";

/// Record attributes forwarded to the service, in the shape the template
/// declares them.
const RECORD_ATTRIBUTES: &[&str] = &[
    "Name",
    "Type",
    "SetIdentifier",
    "Weight",
    "Region",
    "GeoLocation",
    "Failover",
    "MultiValueAnswer",
    "TTL",
    "ResourceRecords",
    "AliasTarget",
    "HealthCheckId",
];

pub struct Route53RecordSetProvider;

impl ResourceProvider for Route53RecordSetProvider {
    fn type_name(&self) -> &'static str {
        "AWS::Route53::RecordSet"
    }

    fn get_physical_resource_id(&self, resource: &Resource) -> Option<String> {
        resource
            .physical_resource_id
            .clone()
            .or_else(|| {
                resource
                    .state_value("Id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .or_else(|| {
                resource
                    .property("Name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
    }

    fn fetch_state(&self, ctx: &InvocationContext<'_>) -> Result<Option<Value>, ServiceError> {
        let Some(resource) = ctx.resource() else {
            return Ok(None);
        };
        let Some(client) = ctx.env.client(SERVICE) else {
            return Ok(None);
        };
        let lookup = |key: &str| {
            resource
                .state_value(key)
                .or_else(|| resource.property(key))
                .and_then(Value::as_str)
        };
        // without a zone id there is nothing to look up yet
        let Some(hosted_zone_id) = lookup("HostedZoneId") else {
            return Ok(None);
        };
        let (Some(name), Some(record_type)) = (lookup("Name"), lookup("Type")) else {
            return Ok(None);
        };

        let result = client.invoke(
            "list_resource_record_sets",
            json!({ "HostedZoneId": hosted_zone_id }),
        )?;
        let record = result
            .get("ResourceRecordSets")
            .and_then(Value::as_array)
            .and_then(|records| {
                records
                    .iter()
                    .find(|record| {
                        record.get("Name").and_then(Value::as_str) == Some(name)
                            && record.get("Type").and_then(Value::as_str) == Some(record_type)
                    })
                    .cloned()
            });
        Ok(record)
    }

    fn get_deploy_templates(&self) -> DeployTemplates {
        let mut templates = DeployTemplates::new();
        templates.insert(
            ResourceAction::Create,
            DeploySpec::Single(
                ActionDescriptor::direct(create_record_set).with_result_handler(
                    |result, resource| {
                        if let Some(model) = result {
                            resource.state = model.clone();
                            if let Some(id) = model.get("Id").and_then(Value::as_str) {
                                resource.physical_resource_id = Some(id.to_string());
                            }
                        }
                    },
                ),
            ),
        );
        templates.insert(
            ResourceAction::Delete,
            DeploySpec::Single(
                ActionDescriptor::service_method("change_resource_record_sets")
                    .with_parameters(ParameterSpec::Compute(Arc::new(delete_parameters))),
            ),
        );
        templates
    }
}

/// Create (UPSERT) the record set and return the resulting model; the
/// model's `Id` is the record `Name`.
fn create_record_set(ctx: &InvocationContext<'_>) -> EngineResult<Option<Value>> {
    let Some(resource) = ctx.resource() else {
        return Ok(None);
    };
    let client = ctx.env.client(SERVICE).ok_or_else(|| {
        EngineError::Deployment(format!("no client registered for service \"{SERVICE}\""))
    })?;

    let mut model = resource.properties.as_object().cloned().unwrap_or_default();

    let hosted_zone_id = match model.get("HostedZoneId").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            // only the zone name was provided
            let hosted_zone_name = model.get("HostedZoneName").and_then(Value::as_str);
            hosted_zone_id_from_name(client.as_ref(), hosted_zone_name)?
        }
    };
    model.insert("HostedZoneId".to_string(), json!(hosted_zone_id));

    let mut attrs = Map::new();
    for key in RECORD_ATTRIBUTES {
        if let Some(value) = model.get(*key) {
            if !value.is_null() {
                attrs.insert((*key).to_string(), value.clone());
            }
        }
    }

    match attrs.get_mut("AliasTarget") {
        Some(Value::Object(alias_target)) => {
            // the service defaults this to true, templates expect false
            alias_target
                .entry("EvaluateTargetHealth".to_string())
                .or_insert(json!(false));
        }
        _ => {
            if let Some(records) = attrs.get("ResourceRecords").and_then(Value::as_array) {
                let wrapped: Vec<Value> = records
                    .iter()
                    .map(|record| json!({ "Value": record }))
                    .collect();
                attrs.insert("ResourceRecords".to_string(), Value::Array(wrapped));
            }
        }
    }
    coerce_ttl(&mut attrs);

    debug!(
        "upserting record set \"{}\" in hosted zone {hosted_zone_id}",
        attrs.get("Name").and_then(Value::as_str).unwrap_or_default()
    );
    client.invoke(
        "change_resource_record_sets",
        json!({
            "HostedZoneId": hosted_zone_id,
            "ChangeBatch": {
                "Changes": [
                    {"Action": "UPSERT", "ResourceRecordSet": Value::Object(attrs)}
                ]
            }
        }),
    )?;

    let record_name = model.get("Name").cloned().unwrap_or(Value::Null);
    model.insert("Id".to_string(), record_name);
    Ok(Some(Value::Object(model)))
}

/// Parameters for the DELETE change; built from the deployed model so
/// not-found failures can be recognized and swallowed by the invoker.
fn delete_parameters(ctx: &InvocationContext<'_>) -> EngineResult<Option<Value>> {
    let Some(resource) = ctx.resource() else {
        return Ok(None);
    };
    let lookup = |key: &str| resource.state_value(key).or_else(|| resource.property(key));

    let (Some(name), Some(record_type)) = (lookup("Name"), lookup("Type")) else {
        return Ok(None);
    };
    let Some(hosted_zone_id) = lookup("HostedZoneId").and_then(Value::as_str) else {
        return Ok(None);
    };

    let mut record_set = Map::new();
    record_set.insert("Name".to_string(), name.clone());
    record_set.insert("Type".to_string(), record_type.clone());
    if let Some(alias_target) = lookup("AliasTarget") {
        record_set.insert("AliasTarget".to_string(), alias_target.clone());
    }
    if let Some(records) = lookup("ResourceRecords").and_then(Value::as_array) {
        let wrapped: Vec<Value> = records
            .iter()
            .map(|record| json!({ "Value": record }))
            .collect();
        record_set.insert("ResourceRecords".to_string(), Value::Array(wrapped));
    }
    if let Some(ttl) = lookup("TTL") {
        record_set.insert("TTL".to_string(), ttl.clone());
        coerce_ttl(&mut record_set);
    }

    Ok(Some(json!({
        "HostedZoneId": hosted_zone_id,
        "ChangeBatch": {
            "Changes": [
                {"Action": "DELETE", "ResourceRecordSet": Value::Object(record_set)}
            ]
        }
    })))
}

fn hosted_zone_id_from_name(
    client: &dyn ServiceClient,
    hosted_zone_name: Option<&str>,
) -> EngineResult<String> {
    let Some(hosted_zone_name) = hosted_zone_name else {
        return Err(EngineError::Deployment(
            "either HostedZoneId or HostedZoneName must be present".to_string(),
        ));
    };
    let result = client.invoke(
        "list_hosted_zones_by_name",
        json!({ "DNSName": hosted_zone_name }),
    )?;
    let zones = result
        .get("HostedZones")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if zones.len() != 1 {
        return Err(EngineError::Deployment(format!(
            "ambiguous HostedZoneName {hosted_zone_name} provided ({} zones found)",
            zones.len()
        )));
    }
    zones[0]
        .get("Id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::Deployment(format!(
                "hosted zone for {hosted_zone_name} carries no Id"
            ))
        })
}

/// The service wants an integer TTL; templates routinely carry strings.
fn coerce_ttl(record_set: &mut Map<String, Value>) {
    if let Some(ttl) = record_set.get("TTL") {
        if let Some(parsed) = ttl.as_str().and_then(|s| s.parse::<i64>().ok()) {
            record_set.insert("TTL".to_string(), json!(parsed));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ttl_strings_are_coerced() {
        let mut record_set = Map::new();
        record_set.insert("TTL".to_string(), json!("300"));
        coerce_ttl(&mut record_set);
        assert_eq!(record_set.get("TTL"), Some(&json!(300)));

        let mut untouched = Map::new();
        untouched.insert("TTL".to_string(), json!(600));
        coerce_ttl(&mut untouched);
        assert_eq!(untouched.get("TTL"), Some(&json!(600)));
    }

    #[test]
    fn physical_resource_id_is_the_record_name() {
        let provider = Route53RecordSetProvider;
        let resource = Resource::new("AWS::Route53::RecordSet")
            .with_property("Name", json!("test.example.com."));
        assert_eq!(
            provider.get_physical_resource_id(&resource).as_deref(),
            Some("test.example.com.")
        );

        let mut deployed = resource.clone();
        deployed.set_state_value("Id", json!("deployed-id"));
        assert_eq!(
            provider.get_physical_resource_id(&deployed).as_deref(),
            Some("deployed-id")
        );
    }
}
