//! Template model: parsed documents and live resource records.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Reserved resource type for stack parameters, handled by the engine itself
/// rather than a registered provider.
pub const PARAMETER_TYPE: &str = "Parameter";

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A parsed infrastructure template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Template {
    pub parameters: IndexMap<String, ParameterDefinition>,
    pub mappings: IndexMap<String, Value>,
    pub conditions: IndexMap<String, Value>,
    pub resources: IndexMap<String, Resource>,
    pub outputs: IndexMap<String, OutputDefinition>,
}

impl Template {
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }
}

/// A `Parameters` section entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ParameterDefinition {
    #[serde(rename = "Type")]
    pub parameter_type: Option<String>,
    pub default: Option<Value>,
}

/// An `Outputs` section entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct OutputDefinition {
    pub value: Value,
    pub export: Option<ExportDefinition>,
    pub description: Option<String>,
}

/// The `Export` block of an output; the name may itself be an intrinsic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ExportDefinition {
    pub name: Value,
}

/// A resource entry, carrying both its template definition and the live
/// state accumulated during deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(default = "empty_object")]
    pub properties: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_depends_on"
    )]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_resource_id: Option<String>,
    /// Runtime state fetched from the backing service; never part of the
    /// template document itself.
    #[serde(skip, default = "empty_object")]
    pub state: Value,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: empty_object(),
            condition: None,
            depends_on: Vec::new(),
            metadata: None,
            physical_resource_id: None,
            state: empty_object(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set_property(key, value);
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_depends_on(mut self, ids: Vec<String>) -> Self {
        self.depends_on = ids;
        self
    }

    pub fn is_parameter(&self) -> bool {
        self.resource_type == PARAMETER_TYPE
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.as_object().and_then(|map| map.get(key))
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        if !self.properties.is_object() {
            self.properties = empty_object();
        }
        if let Some(map) = self.properties.as_object_mut() {
            map.insert(key.into(), value);
        }
    }

    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.state.as_object().and_then(|map| map.get(key))
    }

    pub fn set_state_value(&mut self, key: impl Into<String>, value: Value) {
        if !self.state.is_object() {
            self.state = empty_object();
        }
        if let Some(map) = self.state.as_object_mut() {
            map.insert(key.into(), value);
        }
    }
}

fn deserialize_depends_on<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(id) => vec![id],
        OneOrMany::Many(ids) => ids,
    })
}
