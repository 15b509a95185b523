//! Stack and change-set entities.

use std::collections::HashMap;
use std::time::SystemTime;

use indexmap::IndexMap;
use log::debug;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::planner::ResourceChange;
use crate::status::{ChangeSetStatus, ExecutionStatus, ResourceStatus, StackStatus};
use crate::template::{PARAMETER_TYPE, Resource, Template};

/// One stack parameter, merged from template defaults, stack inputs, and
/// attached change sets.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackParameter {
    pub key: String,
    pub value: Option<Value>,
    /// Present for parameter types resolved through a backing store (SSM);
    /// takes precedence over `value` when referenced.
    pub resolved_value: Option<Value>,
    pub use_previous_value: bool,
}

impl StackParameter {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            resolved_value: None,
            use_previous_value: false,
        }
    }

    pub fn use_previous(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            resolved_value: None,
            use_previous_value: true,
        }
    }
}

/// A resolved stack output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StackOutput {
    pub output_key: String,
    pub output_value: Value,
    pub description: Option<String>,
    pub export_name: Option<String>,
}

/// Status bookkeeping for one resource.
#[derive(Clone, Debug)]
pub struct ResourceStateRecord {
    pub status: ResourceStatus,
    pub previous_status: Option<ResourceStatus>,
    pub physical_resource_id: Option<String>,
    pub status_reason: Option<String>,
}

/// A stack: the stored template, its live resources, and everything the
/// controller tracks across deployments.
pub struct Stack {
    pub stack_id: String,
    pub stack_name: String,
    /// The stored template; mutated as updates are accepted.
    pub template: Template,
    /// Pristine copy used for dependency discovery: literal `Ref`s must
    /// survive resolution.
    pub template_original: Template,
    /// Live resources, including `Parameter` pseudo-resources.
    pub resources: IndexMap<String, Resource>,
    pub resource_states: HashMap<String, ResourceStateRecord>,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    pub parameters: Vec<StackParameter>,
    pub capabilities: Vec<String>,
    pub change_sets: Vec<ChangeSet>,
    pub resolved_outputs: Vec<StackOutput>,
    pub creation_time: SystemTime,
    pub last_updated_time: Option<SystemTime>,
    pub deletion_time: Option<SystemTime>,
}

impl Stack {
    pub fn new(stack_name: impl Into<String>, template: Template) -> Self {
        let stack_name = stack_name.into();
        let resources = template.resources.clone();
        let mut stack = Self {
            stack_id: Uuid::new_v4().to_string(),
            stack_name,
            template_original: template.clone(),
            template,
            resources,
            resource_states: HashMap::new(),
            status: StackStatus::CreateInProgress,
            status_reason: None,
            parameters: Vec::new(),
            capabilities: Vec::new(),
            change_sets: Vec::new(),
            resolved_outputs: Vec::new(),
            creation_time: SystemTime::now(),
            last_updated_time: None,
            deletion_time: None,
        };
        stack.sync_parameter_resources();
        stack
    }

    pub fn with_parameters(mut self, parameters: Vec<StackParameter>) -> Self {
        self.parameters = parameters;
        self.sync_parameter_resources();
        self
    }

    pub fn set_stack_status(&mut self, status: StackStatus) {
        debug!("stack \"{}\": {} -> {}", self.stack_name, self.status, status);
        self.status = status;
    }

    pub fn set_resource_status(&mut self, resource_id: &str, status: ResourceStatus) {
        let physical_resource_id = self
            .resources
            .get(resource_id)
            .and_then(|r| r.physical_resource_id.clone());
        match self.resource_states.get_mut(resource_id) {
            Some(record) => {
                record.previous_status = Some(record.status);
                record.status = status;
                if physical_resource_id.is_some() {
                    record.physical_resource_id = physical_resource_id;
                }
            }
            None => {
                self.resource_states.insert(
                    resource_id.to_string(),
                    ResourceStateRecord {
                        status,
                        previous_status: None,
                        physical_resource_id,
                        status_reason: None,
                    },
                );
            }
        }
    }

    pub fn resource_status(&self, resource_id: &str) -> Option<&ResourceStateRecord> {
        self.resource_states.get(resource_id)
    }

    /// Mirror the stack's parameters into `Parameter` pseudo-resources so
    /// that `Ref` can treat parameters and resources uniformly.
    pub fn sync_parameter_resources(&mut self) {
        let mut effective: IndexMap<String, (Option<Value>, Option<String>)> = IndexMap::new();
        for (name, definition) in &self.template.parameters {
            effective.insert(
                name.clone(),
                (definition.default.clone(), definition.parameter_type.clone()),
            );
        }
        for parameter in &self.parameters {
            let parameter_type = effective
                .get(&parameter.key)
                .and_then(|(_, t)| t.clone());
            let value = parameter
                .resolved_value
                .clone()
                .or_else(|| parameter.value.clone());
            if let Some(value) = value {
                effective.insert(parameter.key.clone(), (Some(value), parameter_type));
            }
        }

        for (name, (value, parameter_type)) in effective {
            let Some(value) = value else { continue };
            let resource = self
                .resources
                .entry(name)
                .or_insert_with(|| Resource::new(PARAMETER_TYPE));
            resource.resource_type = PARAMETER_TYPE.to_string();
            resource.set_property("Value", value);
            match parameter_type {
                Some(t) => resource.set_property("ParameterType", json!(t)),
                None => {}
            }
        }
    }

    /// Copy a merged template definition into the live resources map,
    /// preserving accumulated runtime state.
    pub fn upsert_resource_from_template(&mut self, resource_id: &str) {
        let Some(definition) = self.template.resources.get(resource_id) else {
            return;
        };
        let mut updated = definition.clone();
        if let Some(existing) = self.resources.get(resource_id) {
            updated.state = existing.state.clone();
            if updated.physical_resource_id.is_none() {
                updated.physical_resource_id = existing.physical_resource_id.clone();
            }
        }
        self.resources.insert(resource_id.to_string(), updated);
    }

    /// Remove a deleted resource everywhere.
    pub fn remove_resource(&mut self, resource_id: &str) {
        self.template.resources.shift_remove(resource_id);
        self.template_original.resources.shift_remove(resource_id);
        self.resources.shift_remove(resource_id);
    }

    pub fn find_change_set(&self, name_or_id: &str) -> Option<&ChangeSet> {
        self.change_sets
            .iter()
            .find(|cs| cs.change_set_name == name_or_id || cs.change_set_id == name_or_id)
    }

    pub fn find_change_set_mut(&mut self, name_or_id: &str) -> Option<&mut ChangeSet> {
        self.change_sets
            .iter_mut()
            .find(|cs| cs.change_set_name == name_or_id || cs.change_set_id == name_or_id)
    }
}

/// A named, attachable diff between the stored template and a candidate
/// template. Executing it mutates the owning stack.
pub struct ChangeSet {
    pub change_set_id: String,
    pub change_set_name: String,
    pub stack_name: String,
    /// The candidate template snapshot.
    pub template: Template,
    pub parameters: Vec<StackParameter>,
    pub capabilities: Vec<String>,
    pub status: ChangeSetStatus,
    pub execution_status: ExecutionStatus,
    pub status_reason: Option<String>,
    pub changes: Vec<ResourceChange>,
}

impl ChangeSet {
    pub fn new(
        change_set_name: impl Into<String>,
        stack_name: impl Into<String>,
        template: Template,
    ) -> Self {
        Self {
            change_set_id: Uuid::new_v4().to_string(),
            change_set_name: change_set_name.into(),
            stack_name: stack_name.into(),
            template,
            parameters: Vec::new(),
            capabilities: Vec::new(),
            status: ChangeSetStatus::CreatePending,
            execution_status: ExecutionStatus::Available,
            status_reason: None,
            changes: Vec::new(),
        }
    }
}
