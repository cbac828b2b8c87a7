//! Resource graph
//!
//! Name-sorted mapping of resource name → {type, properties}. Properties are
//! a typed value tree; intrinsic references (`get_resource`, `get_attr`) are
//! the graph's edges. A graph renders 1:1 to the orchestration service's
//! native JSON template format.
//!
//! Invariants (checked by [`ResourceGraph::validate`]):
//! - every edge resolves within the graph that holds it
//! - the edges form a DAG

use nimbus_core::StackSubmission;
use pathfinding::directed::topological_sort::topological_sort;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{OrchestratorError, Result};

/// Template format version emitted at the top of every rendered graph
pub const TEMPLATE_VERSION: &str = "2013-05-23";

/// One step of a `get_attr` path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttrSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for AttrSegment {
    fn from(s: &str) -> Self {
        Self::Key(s.to_string())
    }
}

impl From<usize> for AttrSegment {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

impl From<AttrSegment> for Value {
    fn from(segment: AttrSegment) -> Self {
        match segment {
            AttrSegment::Key(k) => Value::String(k),
            AttrSegment::Index(i) => Value::from(i),
        }
    }
}

/// Build an attribute path from mixed segments
#[macro_export]
macro_rules! attr_path {
    ($($seg:expr),* $(,)?) => {
        vec![$($crate::graph::AttrSegment::from($seg)),*]
    };
}

/// Property value tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    /// Edge to a whole resource
    GetResource(String),
    /// Edge to an attribute of a resource
    GetAttr {
        resource: String,
        path: Vec<AttrSegment>,
    },
    /// Template parameter (no edge)
    GetParam(String),
}

impl PropertyValue {
    pub fn get_resource(name: impl Into<String>) -> Self {
        Self::GetResource(name.into())
    }

    pub fn get_attr(resource: impl Into<String>, path: Vec<AttrSegment>) -> Self {
        Self::GetAttr {
            resource: resource.into(),
            path,
        }
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, PropertyValue)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Collect names of every resource referenced below this value
    pub fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::GetResource(name) => {
                out.insert(name.clone());
            }
            Self::GetAttr { resource, .. } => {
                out.insert(resource.clone());
            }
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => match intrinsic(&map) {
                Some(reference) => reference,
                None => Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
            },
        }
    }
}

fn intrinsic(map: &Map<String, Value>) -> Option<PropertyValue> {
    if map.len() != 1 {
        return None;
    }
    let (key, arg) = map.iter().next()?;
    match (key.as_str(), arg) {
        ("get_resource", Value::String(name)) => Some(PropertyValue::GetResource(name.clone())),
        ("get_param", Value::String(name)) => Some(PropertyValue::GetParam(name.clone())),
        ("get_attr", Value::Array(items)) => {
            let (resource, rest) = items.split_first()?;
            let resource = resource.as_str()?.to_string();
            let path = rest
                .iter()
                .map(|seg| match seg {
                    Value::String(s) => Some(AttrSegment::Key(s.clone())),
                    Value::Number(n) => n.as_u64().map(|i| AttrSegment::Index(i as usize)),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?;
            Some(PropertyValue::GetAttr { resource, path })
        }
        _ => None,
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(b),
            PropertyValue::Int(i) => Value::from(i),
            PropertyValue::Float(f) => Value::from(f),
            PropertyValue::String(s) => Value::String(s),
            PropertyValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            PropertyValue::Map(entries) => {
                Value::Object(entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
            PropertyValue::GetResource(name) => single("get_resource", Value::String(name)),
            PropertyValue::GetParam(name) => single("get_param", Value::String(name)),
            PropertyValue::GetAttr { resource, path } => {
                let mut args = vec![Value::String(resource)];
                args.extend(path.into_iter().map(Value::from));
                single("get_attr", Value::Array(args))
            }
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// One node of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Set a property (builder style)
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Names of every resource this one references
    pub fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for value in self.properties.values() {
            value.collect_references(&mut out);
        }
        out
    }
}

/// Declared output of a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub resource: String,
    pub path: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Output {
    /// Render as a `get_attr` value
    fn value(&self) -> PropertyValue {
        let path = self
            .path
            .iter()
            .map(|seg| match seg.parse::<usize>() {
                Ok(i) => AttrSegment::Index(i),
                Err(_) => AttrSegment::Key(seg.clone()),
            })
            .collect();
        PropertyValue::get_attr(self.resource.clone(), path)
    }
}

/// Concrete resources and dependency edges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGraph {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    resources: BTreeMap<String, Resource>,
    #[serde(default)]
    outputs: BTreeMap<String, Output>,
    /// Nested templates referenced by file name (scaling group members)
    #[serde(default)]
    files: BTreeMap<String, ResourceGraph>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource; names are unique per graph
    pub fn add_resource(&mut self, name: impl Into<String>, resource: Resource) -> Result<()> {
        let name = name.into();
        if self.resources.contains_key(&name) {
            return Err(OrchestratorError::invalid_graph(format!(
                "duplicate resource name {}",
                name
            )));
        }
        self.resources.insert(name, resource);
        Ok(())
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.get_mut(name)
    }

    pub fn remove_resource(&mut self, name: &str) -> Option<Resource> {
        self.resources.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn resources(&self) -> impl Iterator<Item = (&String, &Resource)> {
        self.resources.iter()
    }

    pub fn resources_mut(&mut self) -> impl Iterator<Item = (&String, &mut Resource)> {
        self.resources.iter_mut()
    }

    /// Resources of one type, in name order
    pub fn resources_of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = (&'a String, &'a Resource)> {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn add_output(&mut self, name: impl Into<String>, output: Output) {
        self.outputs.insert(name.into(), output);
    }

    pub fn remove_output(&mut self, name: &str) -> Option<Output> {
        self.outputs.remove(name)
    }

    pub fn outputs(&self) -> &BTreeMap<String, Output> {
        &self.outputs
    }

    pub fn add_file(&mut self, name: impl Into<String>, graph: ResourceGraph) {
        self.files.insert(name.into(), graph);
    }

    pub fn files(&self) -> &BTreeMap<String, ResourceGraph> {
        &self.files
    }

    pub fn files_mut(&mut self) -> impl Iterator<Item = (&String, &mut ResourceGraph)> {
        self.files.iter_mut()
    }

    /// Copy every resource, output and file of `fragment` into this graph
    pub fn merge(&mut self, fragment: ResourceGraph) -> Result<()> {
        for (name, resource) in fragment.resources {
            self.add_resource(name, resource)?;
        }
        self.outputs.extend(fragment.outputs);
        self.files.extend(fragment.files);
        Ok(())
    }

    /// All (from, to) reference edges, in name order
    pub fn edges(&self) -> Vec<(String, String)> {
        self.resources
            .iter()
            .flat_map(|(name, resource)| {
                resource
                    .references()
                    .into_iter()
                    .map(move |target| (name.clone(), target))
            })
            .collect()
    }

    /// Check edge resolution and acyclicity, here and in every nested file
    pub fn validate(&self) -> Result<()> {
        for (from, to) in self.edges() {
            if !self.resources.contains_key(&to) {
                return Err(OrchestratorError::invalid_graph(format!(
                    "{} references unknown resource {}",
                    from, to
                )));
            }
        }
        for (name, output) in &self.outputs {
            if !self.resources.contains_key(&output.resource) {
                return Err(OrchestratorError::invalid_graph(format!(
                    "output {} sources unknown resource {}",
                    name, output.resource
                )));
            }
        }

        let roots: Vec<String> = self.resources.keys().cloned().collect();
        topological_sort(&roots, |name: &String| {
            self.resources
                .get(name)
                .map(|r| r.references())
                .unwrap_or_default()
        })
        .map_err(|node| {
            OrchestratorError::invalid_graph(format!("reference cycle through {}", node))
        })?;

        for (file, nested) in &self.files {
            nested.validate().map_err(|e| match e {
                OrchestratorError::InvalidGraph(msg) => {
                    OrchestratorError::invalid_graph(format!("{}: {}", file, msg))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Render in the native JSON template format (nested files not included)
    pub fn to_template(&self) -> Value {
        let mut template = Map::new();
        template.insert(
            "heat_template_version".to_string(),
            Value::String(TEMPLATE_VERSION.to_string()),
        );
        if let Some(description) = &self.description {
            template.insert("description".to_string(), Value::String(description.clone()));
        }

        let resources: Map<String, Value> = self
            .resources
            .iter()
            .map(|(name, resource)| {
                let mut body = Map::new();
                body.insert("type".to_string(), Value::String(resource.resource_type.clone()));
                if !resource.properties.is_empty() {
                    let props: Map<String, Value> = resource
                        .properties
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                        .collect();
                    body.insert("properties".to_string(), Value::Object(props));
                }
                (name.clone(), Value::Object(body))
            })
            .collect();
        template.insert("resources".to_string(), Value::Object(resources));

        if !self.outputs.is_empty() {
            let outputs: Map<String, Value> = self
                .outputs
                .iter()
                .map(|(name, output)| {
                    let mut body = Map::new();
                    if let Some(description) = &output.description {
                        body.insert("description".to_string(), Value::String(description.clone()));
                    }
                    body.insert("value".to_string(), Value::from(output.value()));
                    (name.clone(), Value::Object(body))
                })
                .collect();
            template.insert("outputs".to_string(), Value::Object(outputs));
        }

        Value::Object(template)
    }

    /// Build the submission for a stack named `stack_name`
    pub fn to_submission(&self, stack_name: impl Into<String>) -> Result<StackSubmission> {
        let mut files = BTreeMap::new();
        for (name, nested) in &self.files {
            files.insert(name.clone(), serde_json::to_string_pretty(&nested.to_template())?);
        }
        Ok(StackSubmission {
            stack_name: stack_name.into(),
            template: self.to_template(),
            files,
            parameters: BTreeMap::new(),
            timeout_mins: None,
            disable_rollback: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server_with_port() -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(
                "VDU1-net0-port",
                Resource::new("OS::Neutron::Port").with("network", "net0"),
            )
            .unwrap();
        graph
            .add_resource(
                "VDU1",
                Resource::new("OS::Nova::Server").with(
                    "networks",
                    PropertyValue::List(vec![PropertyValue::map([(
                        "port",
                        PropertyValue::get_resource("VDU1-net0-port"),
                    )])]),
                ),
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_edges_follow_references() {
        let graph = server_with_port();
        assert_eq!(
            graph.edges(),
            vec![("VDU1".to_string(), "VDU1-net0-port".to_string())]
        );
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource("a", Resource::new("T").with("x", PropertyValue::get_resource("b")))
            .unwrap();
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidGraph(_)));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource("a", Resource::new("T").with("x", PropertyValue::get_resource("b")))
            .unwrap();
        graph
            .add_resource(
                "b",
                Resource::new("T").with("y", PropertyValue::get_attr("a", attr_path!["id"])),
            )
            .unwrap();
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut graph = server_with_port();
        assert!(graph.add_resource("VDU1", Resource::new("T")).is_err());
    }

    #[test]
    fn test_template_rendering() {
        let mut graph = server_with_port();
        graph.add_output(
            "mgmt_ip-VDU1",
            Output {
                resource: "VDU1-net0-port".to_string(),
                path: vec!["fixed_ips".to_string(), "0".to_string(), "ip_address".to_string()],
                description: Some("management ip address".to_string()),
            },
        );

        let template = graph.to_template();
        assert_eq!(template["heat_template_version"], json!("2013-05-23"));
        assert_eq!(
            template["resources"]["VDU1"]["properties"]["networks"],
            json!([{"port": {"get_resource": "VDU1-net0-port"}}])
        );
        assert_eq!(
            template["outputs"]["mgmt_ip-VDU1"]["value"],
            json!({"get_attr": ["VDU1-net0-port", "fixed_ips", 0, "ip_address"]})
        );
    }

    #[test]
    fn test_property_value_parses_intrinsics() {
        let value: PropertyValue = json!({"get_attr": ["SP1_scale_out", "alarm_url"]}).into();
        assert_eq!(
            value,
            PropertyValue::get_attr("SP1_scale_out", attr_path!["alarm_url"])
        );

        let persisted = serde_json::to_value(&server_with_port()).unwrap();
        let restored: ResourceGraph = serde_json::from_value(persisted).unwrap();
        assert_eq!(restored, server_with_port());
    }

    #[test]
    fn test_nested_files_validated_and_submitted() {
        let mut graph = ResourceGraph::new();
        graph
            .add_resource(
                "SP1_group",
                Resource::new("OS::Heat::AutoScalingGroup")
                    .with("resource", PropertyValue::map([("type", PropertyValue::from("SP1_res.yaml"))])),
            )
            .unwrap();
        graph.add_file("SP1_res.yaml", server_with_port());
        assert!(graph.validate().is_ok());

        let submission = graph.to_submission("stack").unwrap();
        assert!(submission.files["SP1_res.yaml"].contains("VDU1-net0-port"));

        let mut broken = ResourceGraph::new();
        broken
            .add_resource("a", Resource::new("T").with("x", PropertyValue::get_resource("zz")))
            .unwrap();
        graph.add_file("bad.yaml", broken);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("bad.yaml"));
    }
}
