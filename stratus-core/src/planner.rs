//! Change planner: diffs two template snapshots into an ordered list of
//! resource changes and merges accepted properties into the stored stack.

use indexmap::IndexMap;
use serde_json::Value;

use crate::stack::ResourceStateRecord;
use crate::status::StackAction;
use crate::template::{Resource, Template};

/// The kind of change planned for one resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeAction {
    Add,
    Modify,
    Remove,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "Add",
            Self::Modify => "Modify",
            Self::Remove => "Remove",
        }
    }

    /// The stack-level action used for status transitions of this change.
    pub fn stack_action(self) -> StackAction {
        match self {
            Self::Add => StackAction::Create,
            Self::Modify => StackAction::Update,
            Self::Remove => StackAction::Delete,
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned change, as surfaced in change sets.
#[derive(Clone, Debug)]
pub struct ResourceChange {
    pub action: ChangeAction,
    pub logical_resource_id: String,
    pub physical_resource_id: Option<String>,
    pub resource_type: String,
    /// `"False"` for in-place modifies; replacement handling is out of the
    /// engine's scope beyond the flag.
    pub replacement: Option<String>,
    /// Cached deployment state, filled in by the loop's should-deploy check.
    pub deployed: Option<bool>,
}

impl ResourceChange {
    pub fn new(action: ChangeAction, logical_resource_id: &str, resource: &Resource) -> Self {
        Self {
            action,
            logical_resource_id: logical_resource_id.to_string(),
            physical_resource_id: resource.physical_resource_id.clone(),
            resource_type: resource.resource_type.clone(),
            replacement: match action {
                ChangeAction::Modify => Some("False".to_string()),
                _ => None,
            },
            deployed: None,
        }
    }
}

/// Diff two templates into changes, emitted in fixed order: Remove, Add,
/// Modify. With `initialize` every new resource is an Add (initial deploy).
pub fn construct_changes(
    old: &Template,
    new: &Template,
    initialize: bool,
) -> Vec<ResourceChange> {
    let old_resources = &old.resources;
    let new_resources = &new.resources;

    let mut changes = Vec::new();
    for (id, resource) in old_resources {
        if !new_resources.contains_key(id) {
            changes.push(ResourceChange::new(ChangeAction::Remove, id, resource));
        }
    }
    for (id, resource) in new_resources {
        if initialize || !old_resources.contains_key(id) {
            changes.push(ResourceChange::new(ChangeAction::Add, id, resource));
        }
    }
    for (id, resource) in new_resources {
        if !initialize && old_resources.contains_key(id) {
            changes.push(ResourceChange::new(ChangeAction::Modify, id, resource));
        }
    }
    changes
}

/// Whether the new resource definition differs from the currently stored
/// one. Property keysets are compared (ignoring the identifier bookkeeping
/// keys), then values key by key; a previously deleted resource always
/// counts as changed so it can be re-created.
pub fn resource_config_differs(
    old_resource: &Resource,
    state: Option<&ResourceStateRecord>,
    new_resource: &Resource,
) -> bool {
    const IGNORED_KEYS: &[&str] = &["LogicalResourceId", "PhysicalResourceId"];

    let empty = serde_json::Map::new();
    let props_old = old_resource.properties.as_object().unwrap_or(&empty);
    let props_new = new_resource.properties.as_object().unwrap_or(&empty);

    let old_keys: std::collections::HashSet<&str> = props_old
        .keys()
        .map(String::as_str)
        .filter(|key| !IGNORED_KEYS.contains(key))
        .collect();
    let new_keys: std::collections::HashSet<&str> = props_new
        .keys()
        .map(String::as_str)
        .filter(|key| !IGNORED_KEYS.contains(key))
        .collect();
    if old_keys != new_keys {
        return true;
    }
    for key in old_keys {
        if props_old.get(key) != props_new.get(key) {
            return true;
        }
    }

    if let Some(state) = state {
        let previous = state.previous_status.unwrap_or(state.status);
        if previous.is_delete() {
            return true;
        }
    }
    false
}

/// Merge an accepted resource definition into the stored resources: keep
/// existing non-property fields where present, overwrite properties key by
/// key with the new values.
pub fn merge_properties(
    old_resources: &mut IndexMap<String, Resource>,
    new_resources: &IndexMap<String, Resource>,
    resource_id: &str,
) {
    let Some(new_resource) = new_resources.get(resource_id) else {
        return;
    };
    let old_resource = old_resources
        .entry(resource_id.to_string())
        .or_insert_with(|| Resource::new(new_resource.resource_type.clone()));

    if old_resource.condition.is_none() {
        old_resource.condition = new_resource.condition.clone();
    }
    if old_resource.depends_on.is_empty() {
        old_resource.depends_on = new_resource.depends_on.clone();
    }
    if old_resource.metadata.is_none() {
        old_resource.metadata = new_resource.metadata.clone();
    }
    if let Some(new_props) = new_resource.properties.as_object() {
        for (key, value) in new_props {
            old_resource.set_property(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::status::ResourceStatus;

    fn template(resources: Value) -> Template {
        serde_json::from_value(json!({ "Resources": resources })).unwrap()
    }

    #[test]
    fn changes_are_ordered_remove_add_modify() {
        let old = template(json!({
            "Gone": {"Type": "T::A"},
            "Kept": {"Type": "T::B"}
        }));
        let new = template(json!({
            "Kept": {"Type": "T::B"},
            "Fresh": {"Type": "T::C"}
        }));
        let changes = construct_changes(&old, &new, false);
        let summary: Vec<(ChangeAction, &str)> = changes
            .iter()
            .map(|c| (c.action, c.logical_resource_id.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeAction::Remove, "Gone"),
                (ChangeAction::Add, "Fresh"),
                (ChangeAction::Modify, "Kept"),
            ]
        );
    }

    #[test]
    fn initialize_adds_every_resource() {
        let new = template(json!({
            "A": {"Type": "T::A"},
            "B": {"Type": "T::B"}
        }));
        let changes = construct_changes(&new, &new, true);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.action == ChangeAction::Add));
    }

    #[test]
    fn modify_replacement_flag_defaults_to_false() {
        let old = template(json!({"A": {"Type": "T::A"}}));
        let changes = construct_changes(&old, &old, false);
        assert_eq!(changes[0].action, ChangeAction::Modify);
        assert_eq!(changes[0].replacement.as_deref(), Some("False"));
    }

    #[test]
    fn config_differs_on_keyset_and_values() {
        let old = Resource::new("T::A").with_property("X", json!(1));
        let same = Resource::new("T::A").with_property("X", json!(1));
        let different_value = Resource::new("T::A").with_property("X", json!(2));
        let different_keys = Resource::new("T::A").with_property("Y", json!(1));

        assert!(!resource_config_differs(&old, None, &same));
        assert!(resource_config_differs(&old, None, &different_value));
        assert!(resource_config_differs(&old, None, &different_keys));
    }

    #[test]
    fn config_ignores_identifier_keys() {
        let old = Resource::new("T::A").with_property("X", json!(1));
        let new = Resource::new("T::A")
            .with_property("X", json!(1))
            .with_property("PhysicalResourceId", json!("p-1"));
        assert!(!resource_config_differs(&old, None, &new));
    }

    #[test]
    fn previously_deleted_resource_counts_as_changed() {
        let old = Resource::new("T::A").with_property("X", json!(1));
        let new = Resource::new("T::A").with_property("X", json!(1));
        let state = ResourceStateRecord {
            status: ResourceStatus::DeleteComplete,
            previous_status: None,
            physical_resource_id: None,
            status_reason: None,
        };
        assert!(resource_config_differs(&old, Some(&state), &new));
    }

    #[test]
    fn merge_overwrites_properties_but_keeps_existing_fields() {
        let mut old_resources = IndexMap::new();
        old_resources.insert(
            "A".to_string(),
            Resource::new("T::A")
                .with_property("Keep", json!("old"))
                .with_property("Replace", json!("old"))
                .with_condition("ExistingCondition"),
        );
        let mut new_resources = IndexMap::new();
        new_resources.insert(
            "A".to_string(),
            Resource::new("T::A")
                .with_property("Replace", json!("new"))
                .with_property("Added", json!("new"))
                .with_condition("NewCondition"),
        );

        merge_properties(&mut old_resources, &new_resources, "A");
        let merged = &old_resources["A"];
        assert_eq!(merged.condition.as_deref(), Some("ExistingCondition"));
        assert_eq!(merged.property("Keep"), Some(&json!("old")));
        assert_eq!(merged.property("Replace"), Some(&json!("new")));
        assert_eq!(merged.property("Added"), Some(&json!("new")));
    }

    #[test]
    fn merge_inserts_missing_resources() {
        let mut old_resources = IndexMap::new();
        let mut new_resources = IndexMap::new();
        new_resources.insert(
            "A".to_string(),
            Resource::new("T::A").with_property("X", json!(1)),
        );
        merge_properties(&mut old_resources, &new_resources, "A");
        assert_eq!(old_resources["A"].property("X"), Some(&json!(1)));
    }
}
