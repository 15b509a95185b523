//! Intrinsic function evaluator.
//!
//! [`resolve_refs_recursively`] rewrites a template value tree, replacing
//! every intrinsic with its resolved form. Resolution is pure with respect
//! to the stack view it is given: evaluating the same tree twice against the
//! same state yields the same result. References to resources that are not
//! deployed yet surface as [`EngineError::DependencyNotYetSatisfied`], which
//! the deployment loop treats as a deferral signal.

use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{Value, json};

use crate::environment::Environment;
use crate::error::{EngineError, EngineResult};
use crate::template::Resource;
use crate::utils::{PLACEHOLDER_NO_VALUE, is_no_value, is_truthy, stringify};

/// Recursion bound protecting against cyclic references (e.g. circular
/// cross-stack exports). Past the cap the input value is returned unchanged.
pub const MAX_RESOLVE_DEPTH: usize = 64;

/// References always available inside `Fn::Sub` strings.
const STATIC_SUB_REFS: &[&str] = &[
    "AWS::Region",
    "AWS::Partition",
    "AWS::StackName",
    "AWS::AccountId",
];

static SUB_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder regex"));

static DYNAMIC_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{\{resolve:([^:]+):(.+)\}\}").expect("dynamic ref regex"));

static APIGATEWAY_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(https?://.+\.execute-api\.)(?:[^-]+-){2,3}\d\.(amazonaws\.com|localhost\.localstack\.cloud)/?(.*)$",
    )
    .expect("invoke url regex")
});

/// The view of one stack that resolution runs against.
pub struct EvalContext<'a> {
    pub stack_name: &'a str,
    pub conditions: &'a IndexMap<String, Value>,
    pub mappings: &'a IndexMap<String, Value>,
    pub resources: &'a IndexMap<String, Resource>,
    pub env: &'a Environment,
}

/// Recursively rewrite `value`, replacing every intrinsic with its resolved
/// form.
pub fn resolve_refs_recursively(ctx: &EvalContext<'_>, value: &Value) -> EngineResult<Value> {
    resolve_with_depth(ctx, value, 0)
}

/// Evaluate a condition value: intrinsics are resolved, and a resulting
/// string naming an entry in `Conditions` evaluates that entry.
pub fn evaluate_condition(ctx: &EvalContext<'_>, condition: &Value) -> EngineResult<bool> {
    evaluate_condition_value(ctx, condition, 0)
}

/// Evaluate a resource's `Condition` attribute; resources without one are
/// always deployed.
pub fn evaluate_resource_condition(
    ctx: &EvalContext<'_>,
    resource: &Resource,
) -> EngineResult<bool> {
    match &resource.condition {
        Some(name) => evaluate_condition_value(ctx, &Value::String(name.clone()), 0),
        None => Ok(true),
    }
}

fn resolve_with_depth(ctx: &EvalContext<'_>, value: &Value, depth: usize) -> EngineResult<Value> {
    if depth > MAX_RESOLVE_DEPTH {
        warn!("maximum resolution depth reached, returning value unresolved");
        return Ok(value.clone());
    }
    let result = resolve_inner(ctx, value, depth)?;

    // String post-processing runs after all other rewrites: constructed
    // service URLs are redirected to the local endpoint, and dynamic
    // references are looked up in their backing stores.
    if let Value::String(s) = &result {
        if let Some(rewritten) = rewrite_apigateway_url(ctx.env, s) {
            return Ok(Value::String(rewritten));
        }
        if let Some(resolved) = resolve_dynamic_reference(ctx, s)? {
            return Ok(resolved);
        }
    }
    Ok(result)
}

fn resolve_inner(ctx: &EvalContext<'_>, value: &Value, depth: usize) -> EngineResult<Value> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((key, arg)) = map.iter().next() {
                    if let Some(resolved) = resolve_intrinsic(ctx, key, arg, depth)? {
                        return Ok(resolved);
                    }
                }
            }
            let mut out = serde_json::Map::new();
            for (key, child) in map {
                let resolved = resolve_with_depth(ctx, child, depth + 1)?;
                if !is_no_value(&resolved) {
                    out.insert(key.clone(), resolved);
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            // Tolerated encoding of a single intrinsic as a nested pair,
            // e.g. `[["Fn::Sub", "${MyRef}"]]`.
            if items.len() == 1 {
                if let Value::Array(inner) = &items[0] {
                    if inner.len() == 2 {
                        if let Some(name) = inner[0].as_str() {
                            if name.to_ascii_lowercase().starts_with("fn::") {
                                let mut obj = serde_json::Map::new();
                                obj.insert(name.to_string(), inner[1].clone());
                                return resolve_with_depth(ctx, &Value::Object(obj), depth + 1);
                            }
                        }
                    }
                }
            }
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let resolved = resolve_with_depth(ctx, item, depth + 1)?;
                if !is_no_value(&resolved) {
                    out.push(resolved);
                }
            }
            Ok(Value::Array(out))
        }
        scalar => Ok(scalar.clone()),
    }
}

/// Resolve a single-key mapping when the key is an intrinsic; `Ok(None)`
/// means the mapping is ordinary data.
fn resolve_intrinsic(
    ctx: &EvalContext<'_>,
    key: &str,
    arg: &Value,
    depth: usize,
) -> EngineResult<Option<Value>> {
    if key == "Ref" {
        let name = arg
            .as_str()
            .ok_or_else(|| EngineError::Evaluation(format!("Ref expects a string, got {arg}")))?;
        let resolved = resolve_ref_value(ctx, name, depth)?;
        return match resolved {
            Some(v) => resolve_with_depth(ctx, &v, depth + 1).map(Some),
            None => {
                debug!("unable to resolve Ref for resource \"{name}\" (yet)");
                Err(EngineError::dependency(
                    name,
                    format!("unable to resolve Ref for resource \"{name}\""),
                ))
            }
        };
    }

    // A bare `Condition` key is only a condition reference when it names an
    // entry of the Conditions section; IAM policies and the like carry
    // ordinary `Condition` keys.
    if key == "Condition" {
        if let Some(name) = arg.as_str() {
            if ctx.conditions.contains_key(name) {
                return Ok(Some(Value::Bool(evaluate_condition_value(
                    ctx, arg, depth,
                )?)));
            }
        }
        return Ok(None);
    }

    let Some(fn_name) = key.strip_prefix("Fn::") else {
        return Ok(None);
    };

    let resolved = match fn_name.to_ascii_lowercase().as_str() {
        "getatt" => resolve_getatt(ctx, arg, depth)?,
        "sub" => resolve_sub(ctx, arg, depth)?,
        "join" => resolve_join(ctx, arg, depth)?,
        "split" => {
            let args = intrinsic_args("Fn::Split", arg, 2)?;
            let delimiter = stringify(&resolve_with_depth(ctx, &args[0], depth + 1)?);
            let string = stringify(&resolve_with_depth(ctx, &args[1], depth + 1)?);
            Value::Array(
                string
                    .split(delimiter.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )
        }
        "select" => {
            let args = intrinsic_args("Fn::Select", arg, 2)?;
            let index_value = resolve_with_depth(ctx, &args[0], depth + 1)?;
            let index = index_value
                .as_u64()
                .map(|i| i as usize)
                .or_else(|| index_value.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| {
                    EngineError::Evaluation(format!("Fn::Select index is not numeric: {index_value}"))
                })?;
            let values = resolve_with_depth(ctx, &args[1], depth + 1)?;
            values
                .as_array()
                .and_then(|items| items.get(index))
                .cloned()
                .ok_or_else(|| {
                    EngineError::Evaluation(format!("Fn::Select index {index} out of bounds"))
                })?
        }
        "findinmap" => resolve_find_in_map(ctx, arg, depth)?,
        "importvalue" => {
            let name = stringify(&resolve_with_depth(ctx, arg, depth + 1)?);
            match ctx.env.exports.get(&name) {
                Some(value) => value,
                None => {
                    info!(
                        "unable to find export \"{name}\" in stack \"{}\", existing export names: {:?}",
                        ctx.stack_name,
                        ctx.env.exports.names()
                    );
                    Value::Null
                }
            }
        }
        "if" => {
            let args = intrinsic_args("Fn::If", arg, 3)?;
            let condition = evaluate_condition_value(ctx, &args[0], depth)?;
            let branch = if condition { &args[1] } else { &args[2] };
            resolve_with_depth(ctx, branch, depth + 1)?
        }
        "condition" => Value::Bool(evaluate_condition_value(ctx, arg, depth)?),
        "not" => {
            let args = intrinsic_args("Fn::Not", arg, 1)?;
            let condition = resolve_with_depth(ctx, &args[0], depth + 1)?;
            Value::Bool(!is_truthy(&condition))
        }
        op @ ("and" | "or") => {
            let conditions = arg.as_array().ok_or_else(|| {
                EngineError::Evaluation(format!("malformed Fn::And/Fn::Or arguments: {arg}"))
            })?;
            let mut results = Vec::with_capacity(conditions.len());
            for condition in conditions {
                results.push(is_truthy(&resolve_with_depth(ctx, condition, depth + 1)?));
            }
            Value::Bool(if op == "and" {
                results.iter().all(|r| *r)
            } else {
                results.iter().any(|r| *r)
            })
        }
        "equals" => {
            let args = intrinsic_args("Fn::Equals", arg, 2)?;
            let left = resolve_with_depth(ctx, &args[0], depth + 1)?;
            let right = resolve_with_depth(ctx, &args[1], depth + 1)?;
            Value::Bool(stringify(&left) == stringify(&right))
        }
        "getazs" => {
            let region = stringify(&resolve_with_depth(ctx, arg, depth + 1)?);
            let region = if region.is_empty() {
                ctx.env.region.clone()
            } else {
                region
            };
            Value::Array(
                ["a", "b", "c", "d"]
                    .iter()
                    .map(|az| Value::String(format!("{region}{az}")))
                    .collect(),
            )
        }
        "base64" => {
            let input = stringify(&resolve_with_depth(ctx, arg, depth + 1)?);
            Value::String(BASE64.encode(input.as_bytes()))
        }
        _ => return Ok(None),
    };
    Ok(Some(resolved))
}

/// Resolve a `Ref` target: pseudo parameters, then parameters, then the
/// provider's ref value for a deployed resource. `Ok(None)` means the target
/// exists but is not resolvable yet.
fn resolve_ref_value(
    ctx: &EvalContext<'_>,
    name: &str,
    _depth: usize,
) -> EngineResult<Option<Value>> {
    match name {
        "AWS::Region" => return Ok(Some(Value::String(ctx.env.region.clone()))),
        "AWS::Partition" => return Ok(Some(Value::String(ctx.env.partition.clone()))),
        "AWS::StackName" | "AWS::StackId" => {
            return Ok(Some(Value::String(ctx.stack_name.to_string())));
        }
        "AWS::AccountId" => return Ok(Some(Value::String(ctx.env.account_id.clone()))),
        "AWS::NoValue" => return Ok(Some(Value::String(PLACEHOLDER_NO_VALUE.to_string()))),
        "AWS::NotificationARNs" => return Ok(Some(json!([]))),
        "AWS::URLSuffix" => return Ok(Some(Value::String(ctx.env.url_suffix.clone()))),
        _ => {}
    }

    let Some(resource) = ctx.resources.get(name) else {
        return Err(EngineError::Evaluation(format!(
            "reference to unknown resource \"{name}\""
        )));
    };

    if resource.is_parameter() {
        let value = resource
            .property("ResolvedValue")
            .or_else(|| resource.property("Value"))
            .cloned();
        return Ok(value);
    }

    match ctx.env.registry.get(&resource.resource_type) {
        Some(provider) => Ok(provider.get_ref(resource)),
        None => {
            log::error!("unsupported resource type: {}", resource.resource_type);
            Ok(None)
        }
    }
}

fn resolve_getatt(ctx: &EvalContext<'_>, arg: &Value, depth: usize) -> EngineResult<Value> {
    let (logical_id, attr_value) = match arg {
        Value::String(s) => {
            let parts: Vec<&str> = s.split('.').collect();
            if parts.len() < 2 {
                return Err(EngineError::Evaluation(format!(
                    "malformed Fn::GetAtt reference: {s}"
                )));
            }
            (parts[0].to_string(), Value::String(parts[1].to_string()))
        }
        Value::Array(items) if items.len() == 2 => {
            let id = items[0].as_str().ok_or_else(|| {
                EngineError::Evaluation(format!("malformed Fn::GetAtt arguments: {arg}"))
            })?;
            (id.to_string(), items[1].clone())
        }
        other => {
            return Err(EngineError::Evaluation(format!(
                "malformed Fn::GetAtt arguments: {other}"
            )));
        }
    };

    // The attribute name may itself be an intrinsic.
    let attribute = stringify(&resolve_with_depth(ctx, &attr_value, depth + 1)?);

    let Some(resource) = ctx.resources.get(&logical_id) else {
        return Err(EngineError::Evaluation(format!(
            "Fn::GetAtt references unknown resource \"{logical_id}\""
        )));
    };

    let resolved = match ctx.env.registry.get(&resource.resource_type) {
        Some(provider) => provider.get_cfn_attribute(resource, &attribute),
        None => {
            debug!(
                "unable to find provider for resource type \"{}\"",
                resource.resource_type
            );
            None
        }
    };
    resolved.ok_or_else(|| {
        EngineError::dependency(
            logical_id.clone(),
            format!("attribute \"{attribute}\" of resource \"{logical_id}\" not yet available"),
        )
    })
}

fn resolve_join(ctx: &EvalContext<'_>, arg: &Value, depth: usize) -> EngineResult<Value> {
    let args = intrinsic_args("Fn::Join", arg, 2)?;
    let separator = args[0].as_str().unwrap_or_default().to_string();
    let items = resolve_with_depth(ctx, &args[1], depth + 1)?;
    let items = items.as_array().ok_or_else(|| {
        EngineError::Evaluation(format!("Fn::Join expects a list of values, got {items}"))
    })?;
    if items.iter().any(Value::is_null) {
        return Err(EngineError::Evaluation(format!(
            "cannot resolve Fn::Join due to null values: {items:?}"
        )));
    }
    Ok(Value::String(
        items
            .iter()
            .map(stringify)
            .collect::<Vec<_>>()
            .join(&separator),
    ))
}

fn resolve_sub(ctx: &EvalContext<'_>, arg: &Value, depth: usize) -> EngineResult<Value> {
    let (template, aux) = match arg {
        Value::String(s) => (s.clone(), serde_json::Map::new()),
        Value::Array(items) if items.len() == 2 => {
            let template = items[0].as_str().ok_or_else(|| {
                EngineError::Evaluation(format!("Fn::Sub template is not a string: {}", items[0]))
            })?;
            let aux = items[1].as_object().cloned().unwrap_or_default();
            (template.to_string(), aux)
        }
        other => {
            return Err(EngineError::Evaluation(format!(
                "malformed Fn::Sub arguments: {other}"
            )));
        }
    };

    let mut result = template;
    for (name, value) in &aux {
        let resolved = resolve_with_depth(ctx, value, depth + 1)?;
        result = result.replace(&format!("${{{name}}}"), &stringify(&resolved));
    }
    for name in STATIC_SUB_REFS {
        if result.contains(&format!("${{{name}}}")) {
            let resolved = resolve_with_depth(ctx, &json!({ "Ref": name }), depth + 1)?;
            result = result.replace(&format!("${{{name}}}"), &stringify(&resolved));
        }
    }
    let result = resolve_placeholders_in_string(ctx, &result, depth)?;
    Ok(Value::String(result))
}

/// Resolve remaining `${...}` placeholders: a dotted expression resolves
/// with `Fn::GetAtt` semantics, a known logical id with `Ref` semantics;
/// anything else is left verbatim.
fn resolve_placeholders_in_string(
    ctx: &EvalContext<'_>,
    input: &str,
    depth: usize,
) -> EngineResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for m in SUB_PLACEHOLDER.find_iter(input) {
        out.push_str(&input[last..m.start()]);
        let expr = &input[m.start() + 2..m.end() - 1];

        let replacement = if let Some((resource_name, attr_name)) = expr.split_once('.') {
            match ctx.resources.get(resource_name) {
                Some(resource) => {
                    let resolved = ctx
                        .env
                        .registry
                        .get(&resource.resource_type)
                        .and_then(|provider| provider.get_cfn_attribute(resource, attr_name));
                    match resolved {
                        Some(value) => stringify(&value),
                        None => {
                            return Err(EngineError::dependency(
                                resource_name,
                                format!("unable to resolve attribute ref {expr}"),
                            ));
                        }
                    }
                }
                None => m.as_str().to_string(),
            }
        } else if ctx.resources.contains_key(expr) {
            match resolve_ref_value(ctx, expr, depth)? {
                Some(value) => {
                    let value = resolve_with_depth(ctx, &value, depth + 1)?;
                    stringify(&value)
                }
                None => {
                    return Err(EngineError::dependency(
                        expr,
                        format!("unable to resolve attribute ref {expr}"),
                    ));
                }
            }
        } else {
            m.as_str().to_string()
        };

        out.push_str(&replacement);
        last = m.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

fn resolve_find_in_map(ctx: &EvalContext<'_>, arg: &Value, depth: usize) -> EngineResult<Value> {
    let args = intrinsic_args("Fn::FindInMap", arg, 3)?;
    let map_name = stringify(&resolve_with_depth(ctx, &args[0], depth + 1)?);
    let top_key = stringify(&resolve_with_depth(ctx, &args[1], depth + 1)?);
    let second_key = stringify(&resolve_with_depth(ctx, &args[2], depth + 1)?);

    ctx.mappings
        .get(&map_name)
        .and_then(|mapping| mapping.get(top_key.as_str()))
        .and_then(|entry| entry.get(second_key.as_str()))
        .cloned()
        .ok_or_else(|| {
            EngineError::Evaluation(format!(
                "cannot resolve Fn::FindInMap [{map_name}, {top_key}, {second_key}]"
            ))
        })
}

fn evaluate_condition_value(
    ctx: &EvalContext<'_>,
    condition: &Value,
    depth: usize,
) -> EngineResult<bool> {
    if depth > MAX_RESOLVE_DEPTH {
        warn!("maximum resolution depth reached while evaluating condition");
        return Ok(is_truthy(condition));
    }
    let resolved = resolve_with_depth(ctx, condition, depth + 1)?;
    let value = if let Some(name) = resolved.as_str() {
        match ctx.conditions.get(name) {
            Some(expr) => resolve_with_depth(ctx, expr, depth + 1)?,
            None => resolved.clone(),
        }
    } else {
        resolved
    };
    Ok(is_truthy(&value))
}

fn rewrite_apigateway_url(env: &Environment, input: &str) -> Option<String> {
    let caps = APIGATEWAY_URL.captures(input)?;
    let port = env.service_port("apigateway")?;
    Some(format!("{}{}:{}/{}", &caps[1], &caps[2], port, &caps[3]))
}

/// Resolve a `{{resolve:SERVICE:KEY}}` dynamic reference against its backing
/// store. `Ok(None)` when the string is not a dynamic reference (or the
/// service is unsupported).
fn resolve_dynamic_reference(ctx: &EvalContext<'_>, input: &str) -> EngineResult<Option<Value>> {
    let Some(caps) = DYNAMIC_REF.captures(input) else {
        return Ok(None);
    };
    let service = caps[1].to_string();
    let key = caps[2].to_string();
    match service.as_str() {
        "ssm" => get_ssm_parameter(ctx.env, &key, false).map(Some),
        "ssm-secure" => get_ssm_parameter(ctx.env, &key, true).map(Some),
        "secretsmanager" => get_secret_value(ctx, &key).map(Some),
        other => {
            warn!("unsupported service for dynamic parameter: {other}");
            Ok(None)
        }
    }
}

pub(crate) fn get_ssm_parameter(
    env: &Environment,
    name: &str,
    with_decryption: bool,
) -> EngineResult<Value> {
    let client = env.client("ssm").ok_or_else(|| {
        EngineError::Evaluation("no client registered for service \"ssm\"".to_string())
    })?;
    let mut params = json!({ "Name": name });
    if with_decryption {
        params["WithDecryption"] = json!(true);
    }
    let result = client.invoke("get_parameter", params)?;
    Ok(result
        .get("Parameter")
        .and_then(|p| p.get("Value"))
        .cloned()
        .unwrap_or(Value::Null))
}

/// `SECRET_ID[:SecretString[:JSON_KEY[:VERSION_STAGE[:VERSION_ID]]]]`
fn get_secret_value(ctx: &EvalContext<'_>, key: &str) -> EngineResult<Value> {
    let client = ctx.env.client("secretsmanager").ok_or_else(|| {
        EngineError::Evaluation("no client registered for service \"secretsmanager\"".to_string())
    })?;

    let non_empty = |s: &str| {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    };
    let (secret_id, json_key, version_stage, version_id) =
        match key.split_once(":SecretString:") {
            Some((id, rest)) => {
                let padded = format!("{rest}::");
                let mut parts = padded.split(':');
                let json_key = non_empty(parts.next().unwrap_or_default());
                let version_stage = non_empty(parts.next().unwrap_or_default());
                let version_id = non_empty(parts.next().unwrap_or_default());
                (id.to_string(), json_key, version_stage, version_id)
            }
            None => (key.to_string(), None, None, None),
        };

    let mut params = json!({ "SecretId": secret_id });
    if let Some(stage) = &version_stage {
        params["VersionStage"] = json!(stage);
    }
    if let Some(id) = &version_id {
        params["VersionId"] = json!(id);
    }
    let result = client.invoke("get_secret_value", params)?;
    let secret_string = result
        .get("SecretString")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match json_key {
        Some(json_key) => {
            let parsed: Value = serde_json::from_str(&secret_string).map_err(|err| {
                EngineError::Evaluation(format!("secret \"{secret_id}\" is not valid JSON: {err}"))
            })?;
            match parsed.get(&json_key) {
                Some(value) => Ok(value.clone()),
                None => Err(EngineError::dependency(
                    secret_id.clone(),
                    format!("key {json_key} is not yet available in secret {secret_id}"),
                )),
            }
        }
        None => Ok(Value::String(secret_string)),
    }
}

/// Array arguments of a fixed arity, without resolving them.
fn intrinsic_args<'v>(name: &str, arg: &'v Value, expected: usize) -> EngineResult<&'v [Value]> {
    match arg.as_array() {
        Some(items) if items.len() == expected => Ok(items.as_slice()),
        _ => Err(EngineError::Evaluation(format!(
            "malformed {name} arguments: {arg}"
        ))),
    }
}
