//! Stack controller and deployment loop.
//!
//! The [`TemplateDeployer`] orchestrates a whole deploy/update/delete for
//! one stack: it diffs templates into changes, runs the retry loop that
//! converges pending changes to the target state, and reflects the outcome
//! in stack, resource, and change-set statuses. The loop itself never
//! sleeps: changes whose dependencies are unresolved are deferred to the
//! next pass, and a pass without progress fails the deployment.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::environment::Environment;
use crate::error::{EngineError, EngineResult};
use crate::intrinsics::{self, EvalContext};
use crate::invoker::execute_resource_action;
use crate::planner::{self, ChangeAction, ResourceChange};
use crate::provider::{InvocationContext, ResourceAction};
use crate::stack::{ChangeSet, Stack, StackOutput, StackParameter};
use crate::status::{ChangeSetStatus, ExecutionStatus, ResourceStatus, StackAction, StackStatus};
use crate::template::{OutputDefinition, ParameterDefinition, Resource, Template};
use crate::utils::stringify;

/// Iteration cap of the deployment loop.
pub const MAX_DEPLOY_ITERATIONS: usize = 30;
/// Cycle cap when deleting a stack.
pub const MAX_DELETE_CYCLES: usize = 10;

const SSM_PARAMETER_TYPE: &str = "AWS::SSM::Parameter::Value<String>";

/// Handle to a deployment running on its background worker thread.
pub struct DeploymentHandle {
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for DeploymentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentHandle").finish()
    }
}

impl DeploymentHandle {
    /// Block until the deployment finished; status transitions are visible
    /// on the stack afterwards.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("deployment worker panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Drives deployments of one stack. The stack is owned by whichever worker
/// thread currently deploys it; all access goes through the mutex.
pub struct TemplateDeployer {
    stack: Arc<Mutex<Stack>>,
    env: Arc<Environment>,
}

impl TemplateDeployer {
    pub fn new(stack: Arc<Mutex<Stack>>, env: Arc<Environment>) -> Self {
        Self { stack, env }
    }

    pub fn stack(&self) -> Arc<Mutex<Stack>> {
        Arc::clone(&self.stack)
    }

    fn lock_stack(&self) -> MutexGuard<'_, Stack> {
        match self.stack.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Initial deployment: every resource of the stored template is an Add.
    pub fn deploy_stack(&self) -> EngineResult<DeploymentHandle> {
        {
            let mut stack = self.lock_stack();
            stack.set_stack_status(StackStatus::CreateInProgress);
        }
        let result = self.apply_changes(None, &[], None, true, StackAction::Create);
        if let Err(err) = &result {
            let mut stack = self.lock_stack();
            info!("unable to create stack \"{}\": {err}", stack.stack_name);
            stack.status_reason = Some(err.to_string());
            stack.set_stack_status(StackStatus::CreateFailed);
        }
        result
    }

    /// Update from a full new-template input.
    pub fn update_stack(
        &self,
        new_template: Template,
        parameters: Vec<StackParameter>,
    ) -> EngineResult<DeploymentHandle> {
        let result =
            self.apply_changes(Some(&new_template), &parameters, None, false, StackAction::Update);
        match &result {
            Ok(_) => {
                let mut stack = self.lock_stack();
                stack.last_updated_time = Some(SystemTime::now());
            }
            Err(EngineError::NoStackUpdates) => {}
            Err(err) => {
                let mut stack = self.lock_stack();
                stack.status_reason = Some(err.to_string());
                stack.set_stack_status(StackStatus::UpdateFailed);
            }
        }
        result
    }

    /// Diff a candidate template against the stored one and attach the
    /// result as a change set (a preview; nothing is deployed).
    pub fn create_change_set(
        &self,
        change_set_name: &str,
        template: Template,
        parameters: Vec<StackParameter>,
        capabilities: Vec<String>,
    ) -> EngineResult<String> {
        let mut stack = self.lock_stack();
        let mut change_set = ChangeSet::new(change_set_name, stack.stack_name.clone(), template);
        change_set.parameters = parameters;
        change_set.capabilities = capabilities;

        let initialize = stack.template.resources.is_empty();
        let changes = planner::construct_changes(&stack.template, &change_set.template, initialize);
        let filtered: Vec<ResourceChange> = changes
            .into_iter()
            .filter(|change| {
                if change.action != ChangeAction::Modify {
                    return true;
                }
                match (
                    stack.template.resources.get(&change.logical_resource_id),
                    change_set.template.resources.get(&change.logical_resource_id),
                ) {
                    (Some(old), Some(new)) => planner::resource_config_differs(
                        old,
                        stack.resource_status(&change.logical_resource_id),
                        new,
                    ),
                    _ => true,
                }
            })
            .collect();
        change_set.changes = filtered;
        change_set.status = ChangeSetStatus::CreateComplete;

        let change_set_id = change_set.change_set_id.clone();
        stack.change_sets.push(change_set);
        Ok(change_set_id)
    }

    /// Execute an attached change set against its stack.
    pub fn apply_change_set(&self, name_or_id: &str) -> EngineResult<DeploymentHandle> {
        let (action, template, change_set_id) = {
            let mut stack = self.lock_stack();
            let Some(change_set) = stack.find_change_set(name_or_id) else {
                return Err(EngineError::Deployment(format!(
                    "change set \"{name_or_id}\" not found"
                )));
            };
            let template = change_set.template.clone();
            let capabilities = change_set.capabilities.clone();
            let change_set_id = change_set.change_set_id.clone();
            let action = if matches!(
                stack.status,
                StackStatus::CreateComplete | StackStatus::UpdateComplete
            ) {
                StackAction::Update
            } else {
                StackAction::Create
            };
            // the stack inherits the change set's acknowledged capabilities
            stack.capabilities = capabilities;
            (action, template, change_set_id)
        };

        let result = self.apply_changes(
            Some(&template),
            &[],
            Some(change_set_id.clone()),
            false,
            action,
        );
        if let Err(err) = &result {
            if !matches!(err, EngineError::NoStackUpdates) {
                let mut stack = self.lock_stack();
                info!(
                    "unable to apply change set \"{name_or_id}\" to stack \"{}\": {err}",
                    stack.stack_name
                );
                stack.status_reason = Some(err.to_string());
                stack.set_stack_status(action.failed());
                if let Some(change_set) = stack.find_change_set_mut(&change_set_id) {
                    change_set.status = ChangeSetStatus::ExecuteFailed;
                    change_set.execution_status = ExecutionStatus::ExecuteFailed;
                    change_set.status_reason = Some("Deployment failed".to_string());
                }
            }
        }
        result
    }

    /// Delete the stack synchronously, cycling over remaining resources
    /// until everything reports `DELETE_COMPLETE` or the cycle cap is hit.
    pub fn delete_stack(&self) -> EngineResult<()> {
        let mut stack = self.lock_stack();
        stack.set_stack_status(StackStatus::DeleteInProgress);

        for cycle in 1..=MAX_DELETE_CYCLES {
            let remaining: Vec<String> = stack
                .resources
                .iter()
                .filter(|(id, resource)| {
                    !resource.is_parameter()
                        && stack.resource_status(id).map(|record| record.status)
                            != Some(ResourceStatus::DeleteComplete)
                })
                .map(|(id, _)| id.clone())
                .collect();
            if remaining.is_empty() {
                break;
            }
            for resource_id in remaining {
                match delete_single_resource(&mut stack, &self.env, &resource_id) {
                    Ok(()) => {
                        stack.set_resource_status(&resource_id, ResourceStatus::DeleteComplete);
                    }
                    Err(err) => {
                        if cycle == MAX_DELETE_CYCLES {
                            error!(
                                "last cycle failed to delete resource with id {resource_id}. Final exception: {err}"
                            );
                            stack.set_resource_status(&resource_id, ResourceStatus::DeleteFailed);
                            if let Some(record) = stack.resource_states.get_mut(&resource_id) {
                                record.status_reason = Some(err.to_string());
                            }
                        } else {
                            warn!(
                                "failed delete of resource with id {resource_id} in cycle {cycle}, retrying in next cycle"
                            );
                        }
                    }
                }
            }
        }

        stack.set_stack_status(StackStatus::DeleteComplete);
        stack.deletion_time = Some(SystemTime::now());
        Ok(())
    }

    /// Shared deployment path: merge parameters, diff, merge accepted
    /// definitions, then run the loop on a background worker thread so
    /// clients do not time out. `NoStackUpdates` surfaces synchronously,
    /// before any status transition.
    fn apply_changes(
        &self,
        new_template: Option<&Template>,
        new_parameters: &[StackParameter],
        change_set_id: Option<String>,
        initialize: bool,
        action: StackAction,
    ) -> EngineResult<DeploymentHandle> {
        let changes = {
            let mut stack = self.lock_stack();

            apply_parameter_changes(
                &mut stack,
                &self.env,
                new_template,
                new_parameters,
                change_set_id.as_deref(),
            )?;

            let candidate: Template = match new_template {
                Some(template) => template.clone(),
                None => stack.template.clone(),
            };
            let changes = planner::construct_changes(&stack.template, &candidate, initialize);

            let contains_changes = changes.iter().any(|change| {
                if change.action != ChangeAction::Modify {
                    return true;
                }
                match (
                    stack.template.resources.get(&change.logical_resource_id),
                    candidate.resources.get(&change.logical_resource_id),
                ) {
                    (Some(old), Some(new)) => planner::resource_config_differs(
                        old,
                        stack.resource_status(&change.logical_resource_id),
                        new,
                    ),
                    _ => true,
                }
            });
            if !contains_changes {
                return Err(EngineError::NoStackUpdates);
            }

            if let Some(new) = new_template {
                for change in &changes {
                    if matches!(change.action, ChangeAction::Add | ChangeAction::Modify) {
                        planner::merge_properties(
                            &mut stack.template.resources,
                            &new.resources,
                            &change.logical_resource_id,
                        );
                        // replace the original entry wholesale, so the
                        // dependency walker sees the new literal Refs
                        if let Some(original) = new.resources.get(&change.logical_resource_id) {
                            stack
                                .template_original
                                .resources
                                .insert(change.logical_resource_id.clone(), original.clone());
                        }
                        stack.upsert_resource_from_template(&change.logical_resource_id);
                    }
                }
                for (key, value) in &new.outputs {
                    stack.template.outputs.insert(key.clone(), value.clone());
                }
                for (key, value) in &new.conditions {
                    stack.template.conditions.insert(key.clone(), value.clone());
                }
                for (key, value) in &new.mappings {
                    stack.template.mappings.insert(key.clone(), value.clone());
                }
                for (key, value) in &new.parameters {
                    stack.template.parameters.insert(key.clone(), value.clone());
                }
            }

            stack.set_stack_status(action.in_progress());
            if let Some(id) = change_set_id.as_deref() {
                if let Some(change_set) = stack.find_change_set_mut(id) {
                    change_set.status = ChangeSetStatus::ExecuteInProgress;
                    change_set.execution_status = ExecutionStatus::ExecuteInProgress;
                }
            }
            changes
        };

        let stack = Arc::clone(&self.stack);
        let env = Arc::clone(&self.env);
        let handle = thread::spawn(move || {
            let mut guard = match stack.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let result = do_apply_changes_in_loop(&mut guard, &env, changes);
            let failed = result.is_err();
            match result {
                Ok(_) => guard.set_stack_status(action.complete()),
                Err(err) => {
                    info!(
                        "error applying changes for stack \"{}\": {err}",
                        guard.stack_name
                    );
                    guard.status_reason = Some(err.to_string());
                    guard.set_stack_status(action.failed());
                }
            }
            if let Some(id) = change_set_id {
                if let Some(change_set) = guard.find_change_set_mut(&id) {
                    change_set.status = if failed {
                        ChangeSetStatus::ExecuteFailed
                    } else {
                        ChangeSetStatus::ExecuteComplete
                    };
                    change_set.execution_status = if failed {
                        ExecutionStatus::ExecuteFailed
                    } else {
                        ExecutionStatus::ExecuteComplete
                    };
                    change_set.status_reason = Some(
                        if failed {
                            "Deployment failed"
                        } else {
                            "Deployment succeeded"
                        }
                        .to_string(),
                    );
                }
            }
        });
        Ok(DeploymentHandle { handle })
    }
}

fn eval_context<'a>(stack: &'a Stack, env: &'a Environment) -> EvalContext<'a> {
    EvalContext {
        stack_name: &stack.stack_name,
        conditions: &stack.template.conditions,
        mappings: &stack.template.mappings,
        resources: &stack.resources,
        env,
    }
}

/// Build the effective parameter list: current values, overlaid with the
/// new template's defaults, then with provided and change-set parameters
/// (honoring `UsePreviousValue`), resolving SSM-backed parameter types.
fn apply_parameter_changes(
    stack: &mut Stack,
    env: &Environment,
    new_template: Option<&Template>,
    new_parameters: &[StackParameter],
    change_set_id: Option<&str>,
) -> EngineResult<()> {
    let mut merged: IndexMap<String, StackParameter> = stack
        .parameters
        .iter()
        .map(|parameter| (parameter.key.clone(), parameter.clone()))
        .collect();

    let definitions: Vec<(String, ParameterDefinition)> = new_template
        .unwrap_or(&stack.template)
        .parameters
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for (name, definition) in &definitions {
        let current_value = merged.get(name).and_then(|p| p.value.clone());
        let value = definition.default.clone().or(current_value);
        merged.insert(
            name.clone(),
            StackParameter {
                key: name.clone(),
                value,
                resolved_value: None,
                use_previous_value: false,
            },
        );
    }

    let mut overlay: Vec<StackParameter> = new_parameters.to_vec();
    if let Some(id) = change_set_id {
        if let Some(change_set) = stack.find_change_set(id) {
            overlay.extend(change_set.parameters.iter().cloned());
        }
    }
    for parameter in overlay {
        if parameter.use_previous_value {
            continue;
        }
        merged.insert(parameter.key.clone(), parameter);
    }

    let parameter_types: HashMap<String, String> = definitions
        .iter()
        .filter_map(|(key, definition)| {
            definition
                .parameter_type
                .clone()
                .map(|parameter_type| (key.clone(), parameter_type))
        })
        .collect();
    for parameter in merged.values_mut() {
        if parameter.resolved_value.is_some() {
            continue;
        }
        if parameter_types.get(&parameter.key).map(String::as_str) != Some(SSM_PARAMETER_TYPE) {
            continue;
        }
        if let Some(Value::String(name)) = &parameter.value {
            let resolved = intrinsics::get_ssm_parameter(env, name, false)?;
            parameter.resolved_value = Some(resolved);
        }
    }

    stack.parameters = merged.into_values().collect();
    stack.sync_parameter_resources();
    Ok(())
}

enum Step {
    Apply,
    DropComplete,
    Drop,
    Defer,
}

/// The deployment loop: apply pending changes in order, deferring those
/// whose dependencies are unsatisfied, until the list is empty, a pass
/// makes no progress (failure), or the iteration cap is reached.
fn do_apply_changes_in_loop(
    stack: &mut Stack,
    env: &Environment,
    mut changes: Vec<ResourceChange>,
) -> EngineResult<Vec<ResourceChange>> {
    let stack_name = stack.stack_name.clone();

    // provider defaults before the loop starts
    let resource_ids: Vec<String> = stack.resources.keys().cloned().collect();
    for resource_id in &resource_ids {
        let Some(resource) = stack.resources.get_mut(resource_id) else {
            continue;
        };
        if let Some(provider) = env.registry.get(&resource.resource_type) {
            provider.add_defaults(resource, &stack_name);
        }
    }

    let mut changes_done: Vec<ResourceChange> = Vec::new();
    for iteration in 0..MAX_DEPLOY_ITERATIONS {
        let mut j = 0;
        let mut updated = false;
        while j < changes.len() {
            let action = changes[j].action;
            let resource_id = changes[j].logical_resource_id.clone();

            let step = match prepare_should_deploy_change(stack, env, &mut changes[j]) {
                Ok(true) => {
                    debug!(
                        "handling \"{action}\" for resource \"{resource_id}\" ({}/{}) in loop iteration {}",
                        j + 1,
                        changes.len(),
                        iteration + 1,
                    );
                    match action {
                        ChangeAction::Add | ChangeAction::Modify => {
                            if all_resource_dependencies_satisfied(stack, env, &resource_id) {
                                Step::Apply
                            } else {
                                Step::Defer
                            }
                        }
                        ChangeAction::Remove => Step::Apply,
                    }
                }
                Ok(false) => match action {
                    ChangeAction::Add | ChangeAction::Modify => Step::DropComplete,
                    ChangeAction::Remove => Step::Drop,
                },
                Err(err) if err.is_dependency_not_satisfied() => {
                    debug!(
                        "dependencies for \"{resource_id}\" not yet satisfied, retrying in next loop: {err}"
                    );
                    Step::Defer
                }
                Err(err) => return Err(err),
            };

            match step {
                Step::Apply => match apply_change(stack, env, &changes[j]) {
                    Ok(()) => {
                        changes_done.push(changes.remove(j));
                        updated = true;
                    }
                    Err(err) if err.is_dependency_not_satisfied() => {
                        debug!(
                            "dependencies for \"{resource_id}\" not yet satisfied, retrying in next loop: {err}"
                        );
                        j += 1;
                    }
                    Err(err) => return Err(err),
                },
                Step::DropComplete => {
                    let status = action.stack_action().resource_complete();
                    stack.set_resource_status(&resource_id, status);
                    changes.remove(j);
                }
                Step::Drop => {
                    changes.remove(j);
                }
                Step::Defer => {
                    j += 1;
                }
            }
        }
        if changes.is_empty() {
            break;
        }
        if !updated {
            let pending: Vec<&str> = changes
                .iter()
                .map(|change| change.logical_resource_id.as_str())
                .collect();
            return Err(EngineError::Deployment(format!(
                "resource deployment loop completed, pending resource changes: {pending:?}"
            )));
        }
    }
    if !changes.is_empty() {
        let pending: Vec<&str> = changes
            .iter()
            .map(|change| change.logical_resource_id.as_str())
            .collect();
        warn!("deployment loop reached its iteration cap with pending changes: {pending:?}");
    }

    // clean up references to deleted resources in the stack
    let removed: Vec<String> = changes_done
        .iter()
        .filter(|change| change.action == ChangeAction::Remove)
        .map(|change| change.logical_resource_id.clone())
        .collect();
    for resource_id in removed {
        stack.remove_resource(&resource_id);
    }

    resolve_outputs(stack, env);
    Ok(changes_done)
}

/// Decide whether a pending change should deploy. `Ok(false)` drops the
/// change; dependency errors defer it. As a side effect, intrinsics in the
/// resource properties are resolved and written back, and the observed
/// deployment state is cached on the change.
fn prepare_should_deploy_change(
    stack: &mut Stack,
    env: &Environment,
    change: &mut ResourceChange,
) -> EngineResult<bool> {
    let resource_id = change.logical_resource_id.clone();

    let condition_ok = {
        let ctx = eval_context(stack, env);
        match ctx.resources.get(&resource_id) {
            Some(resource) => intrinsics::evaluate_resource_condition(&ctx, resource)?,
            None => return Ok(false),
        }
    };
    if !condition_ok {
        debug!("skipping deployment of \"{resource_id}\", as resource condition evaluates to false");
        return Ok(false);
    }

    let resolved_properties = {
        let ctx = eval_context(stack, env);
        let Some(resource) = ctx.resources.get(&resource_id) else {
            return Ok(false);
        };
        intrinsics::resolve_refs_recursively(&ctx, &resource.properties)?
    };
    if let Some(resource) = stack.resources.get_mut(&resource_id) {
        resource.properties = resolved_properties;
    }

    match change.action {
        ChangeAction::Add | ChangeAction::Modify => {
            let (deployable, resource_type) = match stack.resources.get(&resource_id) {
                Some(resource) => (
                    is_deployable_resource(env, resource),
                    resource.resource_type.clone(),
                ),
                None => return Ok(false),
            };
            if change.action == ChangeAction::Add && !deployable {
                return Ok(false);
            }
            let deployed = fetch_resource_state(stack, env, &resource_id).is_some();
            change.deployed = Some(deployed);
            if !deployed {
                return Ok(true);
            }
            if change.action == ChangeAction::Add {
                // already deployed; nothing to do
                return Ok(false);
            }
            let updatable = env
                .registry
                .get(&resource_type)
                .map(|provider| provider.is_updatable())
                .unwrap_or(false);
            if !deployable || !updatable {
                debug!("action \"update\" not yet implemented for resource type {resource_type}");
                return Ok(false);
            }
            Ok(true)
        }
        ChangeAction::Remove => {
            let deployable = match stack.resources.get(&resource_id) {
                Some(resource) => is_deployable_resource(env, resource),
                None => false,
            };
            if !deployable {
                debug!(
                    "action \"remove\" not available for resource \"{resource_id}\", skipping"
                );
            }
            Ok(deployable)
        }
    }
}

/// Apply one change through the invoker and record the resulting resource
/// status and physical id.
fn apply_change(stack: &mut Stack, env: &Environment, change: &ResourceChange) -> EngineResult<()> {
    let resource_id = change.logical_resource_id.as_str();

    let condition_ok = {
        let ctx = eval_context(stack, env);
        match ctx.resources.get(resource_id) {
            Some(resource) => intrinsics::evaluate_resource_condition(&ctx, resource)?,
            None => false,
        }
    };
    if !condition_ok {
        return Ok(());
    }

    let stack_action = change.action.stack_action();
    stack.set_resource_status(resource_id, stack_action.resource_in_progress());

    let stack_name = stack.stack_name.clone();
    let outcome = match change.action {
        ChangeAction::Add => execute_resource_action(
            resource_id,
            ResourceAction::Create,
            &stack_name,
            &mut stack.resources,
            env,
        ),
        ChangeAction::Remove => execute_resource_action(
            resource_id,
            ResourceAction::Delete,
            &stack_name,
            &mut stack.resources,
            env,
        ),
        // a Modify of a resource that turned out not to be deployed is a create
        ChangeAction::Modify if change.deployed == Some(false) => execute_resource_action(
            resource_id,
            ResourceAction::Create,
            &stack_name,
            &mut stack.resources,
            env,
        ),
        ChangeAction::Modify => update_resource(stack, env, resource_id),
    };

    match outcome {
        Ok(_) => {
            update_resource_details(stack, env, resource_id, stack_action);
            Ok(())
        }
        Err(err) if err.is_dependency_not_satisfied() => Err(err),
        Err(err) => {
            stack.set_resource_status(resource_id, stack_action.resource_failed());
            if let Some(record) = stack.resource_states.get_mut(resource_id) {
                record.status_reason = Some(err.to_string());
            }
            Err(err)
        }
    }
}

fn update_resource(
    stack: &mut Stack,
    env: &Environment,
    resource_id: &str,
) -> EngineResult<Option<Value>> {
    let Some(resource) = stack.resources.get(resource_id) else {
        return Ok(None);
    };
    let resource_type = resource.resource_type.clone();
    let updatable = env
        .registry
        .get(&resource_type)
        .map(|provider| provider.is_updatable())
        .unwrap_or(false);
    if !updatable {
        warn!("unable to update resource type \"{resource_type}\", id \"{resource_id}\"");
        return Ok(None);
    }
    info!("updating resource {resource_id} of type {resource_type}");
    let stack_name = stack.stack_name.clone();
    let result = execute_resource_action(
        resource_id,
        ResourceAction::Update,
        &stack_name,
        &mut stack.resources,
        env,
    )?;
    fetch_resource_state(stack, env, resource_id);
    Ok(result)
}

/// Record the physical resource id and the `*_COMPLETE` status after a
/// successful action.
fn update_resource_details(
    stack: &mut Stack,
    env: &Environment,
    resource_id: &str,
    stack_action: StackAction,
) {
    let physical_resource_id = stack
        .resources
        .get(resource_id)
        .and_then(|resource| resource.physical_resource_id.clone())
        .or_else(|| determine_physical_resource_id(stack, env, resource_id));

    if let Some(physical_id) = physical_resource_id {
        if let Some(resource) = stack.resources.get_mut(resource_id) {
            if resource.physical_resource_id.is_none() || stack_action == StackAction::Update {
                resource.physical_resource_id = Some(physical_id.clone());
            }
        }
        if let Some(definition) = stack.template.resources.get_mut(resource_id) {
            if definition.physical_resource_id.is_none() || stack_action == StackAction::Update {
                definition.physical_resource_id = Some(physical_id);
            }
        }
    } else {
        info!("unable to determine physical resource id for resource \"{resource_id}\"");
    }
    stack.set_resource_status(resource_id, stack_action.resource_complete());
}

fn determine_physical_resource_id(
    stack: &Stack,
    env: &Environment,
    resource_id: &str,
) -> Option<String> {
    let resource = stack.resources.get(resource_id)?;
    let provider = env.registry.get(&resource.resource_type)?;
    provider.get_physical_resource_id(resource)
}

/// Refresh the resource's runtime state from its provider; `None` means not
/// deployed. Service failures other than not-found are logged and treated
/// as not deployed.
fn fetch_resource_state(
    stack: &mut Stack,
    env: &Environment,
    resource_id: &str,
) -> Option<Value> {
    let resource = stack.resources.get(resource_id)?;
    if resource.is_parameter() {
        return Some(resource.properties.clone());
    }
    let provider = env.registry.get(&resource.resource_type)?;
    let resource_type = resource.resource_type.clone();

    let fetched = {
        let ctx = InvocationContext {
            resource_id,
            resource_type: &resource_type,
            stack_name: &stack.stack_name,
            resources: &stack.resources,
            env,
        };
        provider.fetch_state(&ctx)
    };
    match fetched {
        Ok(Some(state)) => {
            if let Some(resource) = stack.resources.get_mut(resource_id) {
                resource.state = state.clone();
            }
            Some(state)
        }
        Ok(None) => None,
        Err(err) => {
            if !err.is_not_found() {
                warn!("unexpected error fetching state of resource type {resource_type}: {err}");
            }
            None
        }
    }
}

fn is_deployable_resource(env: &Environment, resource: &Resource) -> bool {
    if resource.is_parameter() {
        return false;
    }
    match env.registry.get(&resource.resource_type) {
        Some(provider) => provider
            .get_deploy_templates()
            .contains_key(&ResourceAction::Create),
        None => {
            warn!("unable to deploy resource type \"{}\"", resource.resource_type);
            false
        }
    }
}

/// Logical ids this resource depends on: every id referenced by a literal
/// `Ref` or `Fn::GetAtt` in its original (pre-resolution) definition, plus
/// its explicit `DependsOn`. A textual scan of the serialized original is
/// sufficient.
fn get_resource_dependencies(stack: &Stack, resource_id: &str) -> Vec<String> {
    let raw_resources = &stack.template_original.resources;
    let Some(resource) = raw_resources.get(resource_id) else {
        return Vec::new();
    };
    let Ok(dumped) = serde_json::to_string(resource) else {
        return Vec::new();
    };

    let mut dependencies = Vec::new();
    for other_id in raw_resources.keys() {
        if other_id == resource_id {
            continue;
        }
        let ref_pattern = format!("{{\"Ref\":\"{other_id}\"}}");
        let getatt_pattern = format!("{{\"Fn::GetAtt\":[\"{other_id}\",");
        if dumped.contains(&ref_pattern)
            || dumped.contains(&getatt_pattern)
            || resource.depends_on.iter().any(|dep| dep == other_id)
        {
            dependencies.push(other_id.clone());
        }
    }
    dependencies
}

fn all_resource_dependencies_satisfied(
    stack: &mut Stack,
    env: &Environment,
    resource_id: &str,
) -> bool {
    for dependency_id in get_resource_dependencies(stack, resource_id) {
        let deployable = match stack.resources.get(&dependency_id) {
            Some(dependency) => is_deployable_resource(env, dependency),
            None => false,
        };
        if deployable && fetch_resource_state(stack, env, &dependency_id).is_none() {
            debug!("dependency for resource {resource_id} not yet deployed: {dependency_id}");
            return false;
        }
    }
    true
}

fn delete_single_resource(
    stack: &mut Stack,
    env: &Environment,
    resource_id: &str,
) -> EngineResult<()> {
    let condition_ok = {
        let ctx = eval_context(stack, env);
        match ctx.resources.get(resource_id) {
            Some(resource) => intrinsics::evaluate_resource_condition(&ctx, resource)?,
            None => false,
        }
    };
    if !condition_ok {
        return Ok(());
    }
    stack.set_resource_status(resource_id, ResourceStatus::DeleteInProgress);
    let stack_name = stack.stack_name.clone();
    execute_resource_action(
        resource_id,
        ResourceAction::Delete,
        &stack_name,
        &mut stack.resources,
        env,
    )?;
    Ok(())
}

/// Evaluate every output entry; errors are swallowed per output so one bad
/// output does not fail the stack. Outputs with an export name are
/// published into the cross-stack exports map.
fn resolve_outputs(stack: &mut Stack, env: &Environment) {
    let entries: Vec<(String, OutputDefinition)> = stack
        .template
        .outputs
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut outputs = Vec::new();
    for (key, definition) in entries {
        let value = {
            let ctx = eval_context(stack, env);
            match intrinsics::resolve_refs_recursively(&ctx, &definition.value) {
                Ok(value) => value,
                Err(err) => {
                    debug!("unable to resolve references in stack outputs: {err}");
                    Value::Null
                }
            }
        };
        let export_name = definition.export.as_ref().and_then(|export| {
            let ctx = eval_context(stack, env);
            match intrinsics::resolve_refs_recursively(&ctx, &export.name) {
                Ok(Value::Null) => None,
                Ok(resolved) => Some(stringify(&resolved)),
                Err(_) => None,
            }
        });
        if let Some(name) = &export_name {
            if !value.is_null() {
                env.exports.publish(name.clone(), value.clone());
            }
        }
        outputs.push(StackOutput {
            output_key: key,
            output_value: value,
            description: definition.description.clone(),
            export_name,
        });
    }
    stack.resolved_outputs = outputs;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stack_from(template: Value) -> Stack {
        let template: Template = serde_json::from_value(template).unwrap();
        Stack::new("test-stack", template)
    }

    #[test]
    fn dependencies_are_discovered_from_the_original_template() {
        let stack = stack_from(json!({
            "Resources": {
                "A": {"Type": "T::A"},
                "B": {
                    "Type": "T::B",
                    "Properties": {"X": {"Fn::GetAtt": ["A", "Arn"]}}
                },
                "C": {
                    "Type": "T::C",
                    "Properties": {"Y": {"Ref": "B"}},
                    "DependsOn": "A"
                },
                "D": {"Type": "T::D"}
            }
        }));
        assert_eq!(get_resource_dependencies(&stack, "A"), Vec::<String>::new());
        assert_eq!(get_resource_dependencies(&stack, "B"), vec!["A".to_string()]);
        let mut c_deps = get_resource_dependencies(&stack, "C");
        c_deps.sort();
        assert_eq!(c_deps, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(get_resource_dependencies(&stack, "D"), Vec::<String>::new());
    }

    #[test]
    fn parameter_merge_prefers_new_values_over_defaults() {
        let mut stack = stack_from(json!({
            "Parameters": {"Env": {"Type": "String", "Default": "dev"}},
            "Resources": {}
        }));
        let env = Environment::new(
            crate::provider::ResourceRegistry::new(),
            crate::services::ServiceClientRegistry::new(),
        );
        apply_parameter_changes(
            &mut stack,
            &env,
            None,
            &[StackParameter::new("Env", json!("prod"))],
            None,
        )
        .unwrap();
        let parameter = stack
            .parameters
            .iter()
            .find(|p| p.key == "Env")
            .unwrap();
        assert_eq!(parameter.value, Some(json!("prod")));
        assert_eq!(
            stack.resources["Env"].property("Value"),
            Some(&json!("prod"))
        );
    }

    #[test]
    fn use_previous_value_preserves_the_current_parameter() {
        let mut stack = stack_from(json!({
            "Parameters": {"Env": {"Type": "String"}},
            "Resources": {}
        }));
        stack.parameters = vec![StackParameter::new("Env", json!("prod"))];
        let env = Environment::new(
            crate::provider::ResourceRegistry::new(),
            crate::services::ServiceClientRegistry::new(),
        );
        apply_parameter_changes(
            &mut stack,
            &env,
            None,
            &[StackParameter::use_previous("Env")],
            None,
        )
        .unwrap();
        let parameter = stack.parameters.iter().find(|p| p.key == "Env").unwrap();
        assert_eq!(parameter.value, Some(json!("prod")));
    }
}
