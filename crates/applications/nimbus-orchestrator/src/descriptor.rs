//! Workload descriptor
//!
//! The already-validated, typed tree the compiler consumes. Leaves that may
//! carry `{get_input: <name>}` placeholders are [`DescriptorValue`]s; names
//! that drive resource naming (component names, network names) are plain
//! strings so naming stays deterministic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;

/// Key of the placeholder form in serialized descriptors
pub const INPUT_KEY: &str = "get_input";

/// Descriptor leaf value, possibly an unresolved input placeholder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum DescriptorValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<DescriptorValue>),
    Map(BTreeMap<String, DescriptorValue>),
    /// Reference to a declared input, resolved at compile time
    Input(String),
}

impl DescriptorValue {
    /// Placeholder referencing the input `name`
    pub fn input(name: impl Into<String>) -> Self {
        Self::Input(name.into())
    }

    /// Collect every input name referenced below this value
    pub fn collect_inputs(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Input(name) => {
                out.insert(name.clone());
            }
            Self::List(items) => items.iter().for_each(|v| v.collect_inputs(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_inputs(out)),
            _ => {}
        }
    }
}

impl From<Value> for DescriptorValue {
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
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(name)) = map.get(INPUT_KEY) {
                        return Self::Input(name.clone());
                    }
                }
                Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<DescriptorValue> for Value {
    fn from(value: DescriptorValue) -> Self {
        match value {
            DescriptorValue::Null => Value::Null,
            DescriptorValue::Bool(b) => Value::Bool(b),
            DescriptorValue::Int(i) => Value::from(i),
            DescriptorValue::Float(f) => Value::from(f),
            DescriptorValue::String(s) => Value::String(s),
            DescriptorValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            DescriptorValue::Map(entries) => {
                Value::Object(entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
            DescriptorValue::Input(name) => {
                let mut map = serde_json::Map::new();
                map.insert(INPUT_KEY.to_string(), Value::String(name));
                Value::Object(map)
            }
        }
    }
}

impl From<&str> for DescriptorValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for DescriptorValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

/// Declared descriptor input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputDecl {
    #[serde(default)]
    pub description: Option<String>,
    /// Used when the parameter table has no entry for this input
    #[serde(default)]
    pub default: Option<Value>,
}

/// Declarative description of one deployable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDecl>,
    /// Components keyed by name
    #[serde(default)]
    pub components: BTreeMap<String, Component>,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

impl WorkloadDescriptor {
    /// Create an empty descriptor
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: BTreeMap::new(),
            components: BTreeMap::new(),
            policies: Vec::new(),
        }
    }

    /// Parse a YAML (or JSON) document
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Add a component (builder style)
    pub fn with_component(mut self, name: impl Into<String>, component: Component) -> Self {
        self.components.insert(name.into(), component);
        self
    }

    /// Add a policy (builder style)
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Declare an input with an optional default (builder style)
    pub fn with_input(mut self, name: impl Into<String>, default: Option<Value>) -> Self {
        self.inputs.insert(
            name.into(),
            InputDecl {
                description: None,
                default,
            },
        );
        self
    }

    /// Every input name referenced anywhere in the components
    pub fn referenced_inputs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for component in self.components.values() {
            component.collect_inputs(&mut out);
        }
        out
    }

    /// Compute components in name order
    pub fn computes(&self) -> impl Iterator<Item = (&String, &ComputeNode)> {
        self.components.iter().filter_map(|(name, c)| match c {
            Component::Compute(node) => Some((name, node)),
            _ => None,
        })
    }

    /// Scaling policies in declaration order
    pub fn scaling_policies(&self) -> impl Iterator<Item = &ScalingPolicy> {
        self.policies.iter().filter_map(|p| match p {
            Policy::Scaling(s) => Some(s),
            _ => None,
        })
    }

    pub fn alarm_policies(&self) -> impl Iterator<Item = &AlarmPolicy> {
        self.policies.iter().filter_map(|p| match p {
            Policy::Alarm(a) => Some(a),
            _ => None,
        })
    }
}

/// Closed set of component kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Component {
    Compute(ComputeNode),
    Storage(StorageNode),
    NetworkLink(NetworkLinkNode),
    ConnectionPoint(ConnectionPointNode),
}

impl Component {
    fn collect_inputs(&self, out: &mut BTreeSet<String>) {
        match self {
            Component::Compute(node) => node.collect_inputs(out),
            Component::Storage(node) => {
                node.size.collect_inputs(out);
                if let Some(image) = &node.image {
                    image.collect_inputs(out);
                }
            }
            Component::NetworkLink(node) => node.network_name.collect_inputs(out),
            Component::ConnectionPoint(node) => {
                if let Some(addresses) = &node.addresses {
                    addresses.collect_inputs(out);
                }
                node.properties.values().for_each(|v| v.collect_inputs(out));
            }
        }
    }
}

/// Compute unit (server)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeNode {
    /// Pre-existing image reference
    #[serde(default)]
    pub image: Option<DescriptorValue>,
    /// Image to upload alongside the server
    #[serde(default)]
    pub artifact: Option<ImageArtifact>,
    /// Pre-existing flavor reference
    #[serde(default)]
    pub flavor: Option<DescriptorValue>,
    /// Sizing expressed as capabilities
    #[serde(default)]
    pub capabilities: Option<ComputeCapabilities>,
    #[serde(default)]
    pub networks: Vec<NetworkRequirement>,
    #[serde(default)]
    pub metadata: BTreeMap<String, DescriptorValue>,
    #[serde(default)]
    pub monitoring_policy: Option<MonitoringPolicy>,
    #[serde(default)]
    pub user_data: Option<DescriptorValue>,
    #[serde(default)]
    pub key_name: Option<DescriptorValue>,
    #[serde(default)]
    pub availability_zone: Option<DescriptorValue>,
}

impl ComputeNode {
    fn collect_inputs(&self, out: &mut BTreeSet<String>) {
        let scalars = [
            &self.image,
            &self.flavor,
            &self.user_data,
            &self.key_name,
            &self.availability_zone,
        ];
        for value in scalars.into_iter().flatten() {
            value.collect_inputs(out);
        }
        if let Some(file) = self.artifact.as_ref().and_then(|a| a.file.as_ref()) {
            file.collect_inputs(out);
        }
        if let Some(caps) = &self.capabilities {
            caps.collect_inputs(out);
        }
        for req in &self.networks {
            if let Some(addresses) = &req.addresses {
                addresses.collect_inputs(out);
            }
            req.properties.values().for_each(|v| v.collect_inputs(out));
        }
        self.metadata.values().for_each(|v| v.collect_inputs(out));
        if let Some(policy) = &self.monitoring_policy {
            policy.parameters.values().for_each(|v| v.collect_inputs(out));
        }
    }
}

/// Image artifact shipped with the workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageArtifact {
    /// Location of the image file
    #[serde(default)]
    pub file: Option<DescriptorValue>,
}

/// Abstract sizing of a compute unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputeCapabilities {
    #[serde(default)]
    pub num_cpus: Option<DescriptorValue>,
    /// Integer GB or `"<n> <unit>"`
    #[serde(default)]
    pub disk_size: Option<DescriptorValue>,
    /// Integer MB or `"<n> <unit>"`
    #[serde(default)]
    pub mem_size: Option<DescriptorValue>,
    #[serde(default)]
    pub mem_page_size: Option<DescriptorValue>,
    #[serde(default)]
    pub numa_node_count: Option<DescriptorValue>,
    /// Per-node `{id, vcpus, mem_size}` maps
    #[serde(default)]
    pub numa_nodes: BTreeMap<String, BTreeMap<String, DescriptorValue>>,
    #[serde(default)]
    pub cpu_allocation: BTreeMap<String, DescriptorValue>,
}

impl ComputeCapabilities {
    fn collect_inputs(&self, out: &mut BTreeSet<String>) {
        let scalars = [
            &self.num_cpus,
            &self.disk_size,
            &self.mem_size,
            &self.mem_page_size,
            &self.numa_node_count,
        ];
        for value in scalars.into_iter().flatten() {
            value.collect_inputs(out);
        }
        for node in self.numa_nodes.values() {
            node.values().for_each(|v| v.collect_inputs(out));
        }
        self.cpu_allocation.values().for_each(|v| v.collect_inputs(out));
    }
}

/// Inline network attachment of a compute unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequirement {
    /// Name of the network to attach to
    pub network: String,
    /// Primary management path
    #[serde(default)]
    pub management: bool,
    /// Static addresses; must be a list
    #[serde(default)]
    pub addresses: Option<DescriptorValue>,
    /// Extra port properties passed through verbatim
    #[serde(default)]
    pub properties: BTreeMap<String, DescriptorValue>,
}

impl NetworkRequirement {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ..Default::default()
        }
    }

    pub fn management(mut self) -> Self {
        self.management = true;
        self
    }
}

/// Monitoring policy attached to a compute unit, forwarded to the monitoring dictionary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringPolicy {
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, DescriptorValue>,
    #[serde(default)]
    pub actions: BTreeMap<String, String>,
}

/// Block storage attached to one compute unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNode {
    /// Integer GB or `"<n> <unit>"`
    pub size: DescriptorValue,
    #[serde(default)]
    pub image: Option<DescriptorValue>,
    /// Compute component the volume is attached to
    pub attached_to: String,
    #[serde(default)]
    pub mount_point: Option<String>,
}

/// Pre-existing network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLinkNode {
    pub network_name: DescriptorValue,
}

/// vNIC flavour of a connection point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VnicKind {
    Sriov,
    Vnic,
}

impl VnicKind {
    /// Native `binding:vnic_type` value
    pub fn binding(&self) -> &'static str {
        match self {
            VnicKind::Sriov => "direct",
            VnicKind::Vnic => "normal",
        }
    }
}

/// Port declared as its own component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPointNode {
    /// Compute component the port belongs to
    pub binding: String,
    /// NetworkLink component the port is plugged into
    pub link: String,
    #[serde(default)]
    pub management: bool,
    #[serde(default)]
    pub anti_spoofing_protection: Option<bool>,
    #[serde(default, rename = "type")]
    pub vnic_type: Option<VnicKind>,
    #[serde(default)]
    pub addresses: Option<DescriptorValue>,
    /// Position among the compute's ports; unordered ones follow by name
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub properties: BTreeMap<String, DescriptorValue>,
}

/// Closed set of policy kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    Scaling(ScalingPolicy),
    Alarm(AlarmPolicy),
}

/// Horizontal scaling of a set of compute components
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub name: String,
    /// Compute components that become group members
    pub targets: Vec<String>,
    #[serde(rename = "min")]
    pub min_size: u32,
    #[serde(rename = "max")]
    pub max_size: u32,
    #[serde(rename = "default")]
    pub desired: u32,
    pub increment: u32,
    /// Seconds
    pub cooldown: u32,
}

/// Metric threshold alarm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmPolicy {
    pub name: String,
    /// Compute metadata value the alarm watches
    pub metadata: String,
    pub meter_name: String,
    /// `gt`, `ge`, `lt`, `le`, `eq`, `ne`
    pub comparison_operator: String,
    /// Seconds
    pub period: u64,
    pub evaluation_periods: u32,
    pub statistic: String,
    pub threshold: f64,
    /// Scaling policy names or notification URLs
    #[serde(default)]
    pub actions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholder_round_trips_through_json() {
        let value: DescriptorValue = json!({"get_input": "image_name"}).into();
        assert_eq!(value, DescriptorValue::input("image_name"));

        let back: Value = value.into();
        assert_eq!(back, json!({"get_input": "image_name"}));
    }

    #[test]
    fn test_map_with_extra_keys_is_not_a_placeholder() {
        let value: DescriptorValue = json!({"get_input": "x", "other": 1}).into();
        assert!(matches!(value, DescriptorValue::Map(_)));
    }

    #[test]
    fn test_descriptor_deserializes_tagged_components() {
        let doc = json!({
            "name": "web",
            "inputs": {"flavor": {"default": "m1.small"}},
            "components": {
                "VDU1": {
                    "kind": "compute",
                    "image": "cirros",
                    "flavor": {"get_input": "flavor"},
                    "networks": [{"network": "net_mgmt", "management": true}]
                },
                "VL1": {"kind": "network_link", "network_name": "net0"},
                "CP1": {"kind": "connection_point", "binding": "VDU1", "link": "VL1", "type": "sriov"}
            },
            "policies": [
                {"kind": "scaling", "name": "SP1", "targets": ["VDU1"],
                 "min": 1, "max": 3, "default": 1, "increment": 1, "cooldown": 60}
            ]
        });

        let descriptor: WorkloadDescriptor = serde_json::from_value(doc).unwrap();
        assert_eq!(descriptor.computes().count(), 1);
        assert_eq!(descriptor.scaling_policies().count(), 1);
        assert_eq!(
            descriptor.referenced_inputs(),
            BTreeSet::from(["flavor".to_string()])
        );
        match &descriptor.components["CP1"] {
            Component::ConnectionPoint(cp) => assert_eq!(cp.vnic_type, Some(VnicKind::Sriov)),
            other => panic!("unexpected component {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_from_yaml() {
        let descriptor = WorkloadDescriptor::from_yaml(
            r#"
name: db
components:
  VDU1:
    kind: compute
    image: { get_input: image }
    capabilities:
      num_cpus: 2
      mem_size: 2 GB
  VB1:
    kind: storage
    size: 10 GB
    attached_to: VDU1
"#,
        )
        .unwrap();

        assert_eq!(descriptor.name, "db");
        assert_eq!(descriptor.referenced_inputs(), BTreeSet::from(["image".to_string()]));
        match &descriptor.components["VB1"] {
            Component::Storage(storage) => {
                assert_eq!(storage.size, DescriptorValue::from("10 GB"));
                assert_eq!(storage.attached_to, "VDU1");
            }
            other => panic!("unexpected component {:?}", other),
        }

        assert!(WorkloadDescriptor::from_yaml("components: {}").is_err());
    }

    #[test]
    fn test_referenced_inputs_walks_nested_values() {
        let mut caps = ComputeCapabilities::default();
        caps.cpu_allocation
            .insert("core_count".to_string(), DescriptorValue::input("cores"));
        let compute = ComputeNode {
            capabilities: Some(caps),
            metadata: BTreeMap::from([(
                "tags".to_string(),
                DescriptorValue::List(vec![DescriptorValue::input("tag")]),
            )]),
            ..Default::default()
        };
        let descriptor = WorkloadDescriptor::new("w").with_component("VDU1", Component::Compute(compute));

        let inputs = descriptor.referenced_inputs();
        assert!(inputs.contains("cores"));
        assert!(inputs.contains("tag"));
    }
}
