//! End-to-end deployment scenarios against a mock resource provider and
//! recording service clients.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use stratus_core::{
    ActionDescriptor, ChangeAction, DeploySpec, DeployTemplates, EngineError, Environment,
    InvocationContext, ParameterSpec, ResourceAction, ResourceProvider, ResourceRegistry,
    ServiceClient, ServiceClientRegistry, ServiceError, Stack, StackParameter, StackStatus,
    TemplateDeployer, Template,
    status::ResourceStatus,
};

/// Records every invocation and answers through a scriptable handler.
struct RecordingClient {
    calls: Mutex<Vec<(String, Value)>>,
    handler: Box<dyn Fn(&str, &Value) -> Result<Value, ServiceError> + Send + Sync>,
}

impl RecordingClient {
    fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&str, &Value) -> Result<Value, ServiceError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }
}

impl ServiceClient for RecordingClient {
    fn invoke(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        (self.handler)(method, &params)
    }
}

/// Default handler: creates answer with an id/arn derived from `Name`,
/// everything else succeeds with an empty object.
fn widget_handler(method: &str, params: &Value) -> Result<Value, ServiceError> {
    match method {
        "create_widget" | "update_widget" => {
            let name = params
                .get("Name")
                .and_then(Value::as_str)
                .unwrap_or("anonymous");
            Ok(json!({"Id": format!("{name}-id"), "Arn": format!("arn:test:::{name}")}))
        }
        _ => Ok(json!({})),
    }
}

/// Copies the service result into the resource state and captures the
/// returned id as the physical resource id.
fn persist_result(result: Option<&Value>, resource: &mut stratus_core::Resource) {
    if let Some(result) = result {
        if result.is_object() {
            resource.state = result.clone();
            if let Some(id) = result.get("Id").and_then(Value::as_str) {
                resource.physical_resource_id = Some(id.to_string());
            }
        }
    }
}

struct WidgetProvider {
    updatable: bool,
}

impl ResourceProvider for WidgetProvider {
    fn type_name(&self) -> &'static str {
        "Test::Engine::Widget"
    }

    fn is_updatable(&self) -> bool {
        self.updatable
    }

    fn fetch_state(&self, ctx: &InvocationContext<'_>) -> Result<Option<Value>, ServiceError> {
        Ok(ctx
            .resource()
            .map(|resource| resource.state.clone())
            .filter(|state| state.as_object().is_some_and(|map| !map.is_empty())))
    }

    fn get_deploy_templates(&self) -> DeployTemplates {
        let mut templates = DeployTemplates::new();
        templates.insert(
            ResourceAction::Create,
            DeploySpec::Single(
                ActionDescriptor::service_method("create_widget")
                    .with_result_handler(persist_result),
            ),
        );
        templates.insert(
            ResourceAction::Update,
            DeploySpec::Single(
                ActionDescriptor::service_method("update_widget")
                    .with_result_handler(persist_result),
            ),
        );
        templates.insert(
            ResourceAction::Delete,
            DeploySpec::Single(
                ActionDescriptor::service_method("delete_widget")
                    .with_parameters(ParameterSpec::from_names(["Name"])),
            ),
        );
        templates
    }
}

fn environment(client: Arc<RecordingClient>, updatable: bool) -> Arc<Environment> {
    Arc::new(Environment::new(
        ResourceRegistry::new().register(Arc::new(WidgetProvider { updatable })),
        ServiceClientRegistry::new().register("engine", client),
    ))
}

fn template(value: Value) -> Template {
    serde_json::from_value(value).unwrap()
}

fn deployer_for(
    template_value: Value,
    env: &Arc<Environment>,
    parameters: Vec<StackParameter>,
) -> TemplateDeployer {
    let stack = Stack::new("test-stack", template(template_value)).with_parameters(parameters);
    TemplateDeployer::new(Arc::new(Mutex::new(stack)), Arc::clone(env))
}

#[test]
fn dependent_pair_deploys_in_reference_order() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), false);
    // B is listed first so its change is attempted, deferred, and retried.
    let deployer = deployer_for(
        json!({
            "Resources": {
                "B": {
                    "Type": "Test::Engine::Widget",
                    "Properties": {"Name": "b", "X": {"Fn::GetAtt": ["A", "Arn"]}}
                },
                "A": {
                    "Type": "Test::Engine::Widget",
                    "Properties": {"Name": "a"}
                }
            }
        }),
        &env,
        vec![],
    );

    deployer.deploy_stack().unwrap().join();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::CreateComplete);

    let creates = client.calls_for("create_widget");
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[0].get("Name"), Some(&json!("a")));
    assert_eq!(creates[1].get("Name"), Some(&json!("b")));
    // B's call observed A's resolved ARN
    assert_eq!(creates[1].get("X"), Some(&json!("arn:test:::a")));

    assert_eq!(
        stack.resource_status("A").unwrap().status,
        ResourceStatus::CreateComplete
    );
    assert_eq!(
        stack.resources["B"].physical_resource_id.as_deref(),
        Some("b-id")
    );
}

#[test]
fn false_condition_suppresses_calls_and_outputs() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), false);
    let deployer = deployer_for(
        json!({
            "Parameters": {"Env": {"Type": "String", "Default": "dev"}},
            "Conditions": {"IsProd": {"Fn::Equals": [{"Ref": "Env"}, "prod"]}},
            "Resources": {
                "Gated": {
                    "Type": "Test::Engine::Widget",
                    "Condition": "IsProd",
                    "Properties": {"Name": "gated"}
                },
                "Always": {
                    "Type": "Test::Engine::Widget",
                    "Properties": {"Name": "always"}
                }
            },
            "Outputs": {
                "GatedId": {"Value": {"Ref": "Gated"}}
            }
        }),
        &env,
        vec![],
    );

    deployer.deploy_stack().unwrap().join();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::CreateComplete);

    let creates = client.calls_for("create_widget");
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].get("Name"), Some(&json!("always")));
    assert_eq!(
        stack.resource_status("Gated").unwrap().status,
        ResourceStatus::CreateComplete
    );

    // the output referencing the absent resource resolves to null
    let output = stack
        .resolved_outputs
        .iter()
        .find(|o| o.output_key == "GatedId")
        .unwrap();
    assert_eq!(output.output_value, Value::Null);
}

#[test]
fn second_deploy_is_idempotent() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), false);
    let deployer = deployer_for(
        json!({
            "Resources": {
                "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a"}}
            }
        }),
        &env,
        vec![],
    );

    deployer.deploy_stack().unwrap().join();
    let first_id = {
        let stack = deployer.stack();
        let stack = stack.lock().unwrap();
        stack.resources["A"].physical_resource_id.clone()
    };

    deployer.deploy_stack().unwrap().join();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::CreateComplete);
    assert_eq!(stack.resources["A"].physical_resource_id, first_id);
    // the no-op Add was skipped: only one create call ever went out
    assert_eq!(client.calls_for("create_widget").len(), 1);
}

#[test]
fn change_set_on_unchanged_template_raises_no_stack_updates() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), false);
    let template_value = json!({
        "Resources": {
            "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a"}}
        }
    });
    let deployer = deployer_for(template_value.clone(), &env, vec![]);
    deployer.deploy_stack().unwrap().join();

    let change_set_id = deployer
        .create_change_set("no-op", template(template_value), vec![], vec![])
        .unwrap();
    let err = deployer.apply_change_set(&change_set_id).unwrap_err();
    assert!(matches!(err, EngineError::NoStackUpdates));

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    // status unchanged by the rejected execution
    assert_eq!(stack.status, StackStatus::CreateComplete);
}

#[test]
fn change_set_execution_updates_stack_and_change_set_status() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), true);
    let deployer = deployer_for(
        json!({
            "Resources": {
                "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a"}}
            }
        }),
        &env,
        vec![],
    );
    deployer.deploy_stack().unwrap().join();

    let new_template = template(json!({
        "Resources": {
            "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a", "Size": 2}},
            "B": {"Type": "Test::Engine::Widget", "Properties": {"Name": "b"}}
        }
    }));
    let change_set_id = deployer
        .create_change_set("grow", new_template, vec![], vec!["CAPABILITY_IAM".into()])
        .unwrap();

    {
        let stack = deployer.stack();
        let stack = stack.lock().unwrap();
        let change_set = stack.find_change_set("grow").unwrap();
        assert_eq!(change_set.status.to_string(), "CREATE_COMPLETE");
        let actions: Vec<ChangeAction> = change_set.changes.iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![ChangeAction::Add, ChangeAction::Modify]);
    }

    deployer.apply_change_set(&change_set_id).unwrap().join();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::UpdateComplete);
    assert_eq!(stack.capabilities, vec!["CAPABILITY_IAM".to_string()]);
    let change_set = stack.find_change_set("grow").unwrap();
    assert_eq!(change_set.execution_status.to_string(), "EXECUTE_COMPLETE");
    assert_eq!(change_set.status_reason.as_deref(), Some("Deployment succeeded"));
    assert!(stack.resources.contains_key("B"));
    assert_eq!(client.calls_for("update_widget").len(), 1);
}

#[test]
fn dynamic_ssm_reference_resolves_before_the_service_call() {
    let widget_client = RecordingClient::new(widget_handler);
    let ssm_client = RecordingClient::new(|method, _params| {
        assert_eq!(method, "get_parameter");
        Ok(json!({"Parameter": {"Value": "bar"}}))
    });
    let env = Arc::new(Environment::new(
        ResourceRegistry::new().register(Arc::new(WidgetProvider { updatable: false })),
        ServiceClientRegistry::new()
            .register("engine", widget_client.clone())
            .register("ssm", ssm_client),
    ));
    let deployer = deployer_for(
        json!({
            "Resources": {
                "A": {
                    "Type": "Test::Engine::Widget",
                    "Properties": {"Name": "a", "Secret": "{{resolve:ssm:/foo}}"}
                }
            }
        }),
        &env,
        vec![],
    );

    deployer.deploy_stack().unwrap().join();

    let creates = widget_client.calls_for("create_widget");
    assert_eq!(creates[0].get("Secret"), Some(&json!("bar")));
    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(
        stack.resources["A"].property("Secret"),
        Some(&json!("bar"))
    );
}

#[test]
fn ssm_backed_parameter_is_resolved_into_refs() {
    let widget_client = RecordingClient::new(widget_handler);
    let ssm_client = RecordingClient::new(|_, _| Ok(json!({"Parameter": {"Value": "from-ssm"}})));
    let env = Arc::new(Environment::new(
        ResourceRegistry::new().register(Arc::new(WidgetProvider { updatable: false })),
        ServiceClientRegistry::new()
            .register("engine", widget_client.clone())
            .register("ssm", ssm_client),
    ));
    let deployer = deployer_for(
        json!({
            "Parameters": {
                "Setting": {
                    "Type": "AWS::SSM::Parameter::Value<String>",
                    "Default": "/app/setting"
                }
            },
            "Resources": {
                "A": {
                    "Type": "Test::Engine::Widget",
                    "Properties": {"Name": "a", "Setting": {"Ref": "Setting"}}
                }
            }
        }),
        &env,
        vec![],
    );

    deployer.deploy_stack().unwrap().join();

    let creates = widget_client.calls_for("create_widget");
    assert_eq!(creates[0].get("Setting"), Some(&json!("from-ssm")));
    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    let parameter = stack.parameters.iter().find(|p| p.key == "Setting").unwrap();
    assert_eq!(parameter.resolved_value, Some(json!("from-ssm")));
}

#[test]
fn update_stack_modifies_deployed_resources() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), true);
    let deployer = deployer_for(
        json!({
            "Resources": {
                "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a"}}
            }
        }),
        &env,
        vec![],
    );
    deployer.deploy_stack().unwrap().join();

    let new_template = template(json!({
        "Resources": {
            "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a", "Size": 3}}
        }
    }));
    deployer.update_stack(new_template, vec![]).unwrap().join();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::UpdateComplete);
    assert!(stack.last_updated_time.is_some());
    let updates = client.calls_for("update_widget");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].get("Size"), Some(&json!(3)));
    assert_eq!(
        stack.resource_status("A").unwrap().status,
        ResourceStatus::UpdateComplete
    );
}

#[test]
fn removed_resources_are_deleted_and_stripped() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), true);
    let deployer = deployer_for(
        json!({
            "Resources": {
                "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a"}},
                "B": {"Type": "Test::Engine::Widget", "Properties": {"Name": "b"}}
            }
        }),
        &env,
        vec![],
    );
    deployer.deploy_stack().unwrap().join();

    let new_template = template(json!({
        "Resources": {
            "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a"}}
        }
    }));
    deployer.update_stack(new_template, vec![]).unwrap().join();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::UpdateComplete);
    assert!(!stack.resources.contains_key("B"));
    assert!(!stack.template.resources.contains_key("B"));
    let deletes = client.calls_for("delete_widget");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].get("Name"), Some(&json!("b")));
}

#[test]
fn delete_stack_retries_transient_failures_until_complete() {
    let attempts = Arc::new(Mutex::new(0u32));
    let attempts_for_handler = Arc::clone(&attempts);
    let client = RecordingClient::new(move |method, params| {
        if method == "delete_widget" && params.get("Name") == Some(&json!("flaky")) {
            let mut attempts = attempts_for_handler.lock().unwrap();
            *attempts += 1;
            if *attempts == 1 {
                return Err(ServiceError::new("throttled, try again"));
            }
        }
        widget_handler(method, params)
    });
    let env = environment(client.clone(), false);
    let deployer = deployer_for(
        json!({
            "Resources": {
                "Flaky": {"Type": "Test::Engine::Widget", "Properties": {"Name": "flaky"}},
                "Solid": {"Type": "Test::Engine::Widget", "Properties": {"Name": "solid"}}
            }
        }),
        &env,
        vec![],
    );
    deployer.deploy_stack().unwrap().join();

    deployer.delete_stack().unwrap();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::DeleteComplete);
    assert!(stack.deletion_time.is_some());
    for id in ["Flaky", "Solid"] {
        assert_eq!(
            stack.resource_status(id).unwrap().status,
            ResourceStatus::DeleteComplete
        );
    }
    assert_eq!(*attempts.lock().unwrap(), 2);
}

#[test]
fn outputs_publish_exports_for_other_stacks() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), false);
    let producer = deployer_for(
        json!({
            "Resources": {
                "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a"}}
            },
            "Outputs": {
                "WidgetArn": {
                    "Value": {"Fn::GetAtt": ["A", "Arn"]},
                    "Export": {"Name": "widget-arn"}
                }
            }
        }),
        &env,
        vec![],
    );
    producer.deploy_stack().unwrap().join();
    assert_eq!(env.exports.get("widget-arn"), Some(json!("arn:test:::a")));

    let consumer = deployer_for(
        json!({
            "Resources": {
                "B": {
                    "Type": "Test::Engine::Widget",
                    "Properties": {"Name": "b", "Upstream": {"Fn::ImportValue": "widget-arn"}}
                }
            }
        }),
        &env,
        vec![],
    );
    consumer.deploy_stack().unwrap().join();

    let creates = client.calls_for("create_widget");
    let b_call = creates
        .iter()
        .find(|c| c.get("Name") == Some(&json!("b")))
        .unwrap();
    assert_eq!(b_call.get("Upstream"), Some(&json!("arn:test:::a")));
}

#[test]
fn service_failure_marks_stack_and_resource_failed() {
    let client = RecordingClient::new(|method, _params| {
        if method == "create_widget" {
            Err(ServiceError::new("boom").with_code("InternalError"))
        } else {
            Ok(json!({}))
        }
    });
    let env = environment(client.clone(), false);
    let deployer = deployer_for(
        json!({
            "Resources": {
                "A": {"Type": "Test::Engine::Widget", "Properties": {"Name": "a"}}
            }
        }),
        &env,
        vec![],
    );

    deployer.deploy_stack().unwrap().join();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::CreateFailed);
    assert!(stack.status_reason.as_deref().unwrap_or("").contains("boom"));
    assert_eq!(
        stack.resource_status("A").unwrap().status,
        ResourceStatus::CreateFailed
    );
}

#[test]
fn unresolvable_dependencies_fail_the_loop_without_progress() {
    let client = RecordingClient::new(widget_handler);
    let env = environment(client.clone(), false);
    // A waits on an attribute of B forever: B's type is unknown, so its
    // change is dropped without ever producing state.
    let deployer = deployer_for(
        json!({
            "Resources": {
                "A": {
                    "Type": "Test::Engine::Widget",
                    "Properties": {"Name": "a", "X": {"Fn::GetAtt": ["B", "Arn"]}}
                },
                "B": {"Type": "Test::Unknown::Thing"}
            }
        }),
        &env,
        vec![],
    );

    deployer.deploy_stack().unwrap().join();

    let stack = deployer.stack();
    let stack = stack.lock().unwrap();
    assert_eq!(stack.status, StackStatus::CreateFailed);
    assert!(
        stack
            .status_reason
            .as_deref()
            .unwrap_or("")
            .contains("pending resource changes")
    );
}
