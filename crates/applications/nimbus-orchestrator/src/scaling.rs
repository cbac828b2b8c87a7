//! Scaling and alarm synthesis
//!
//! ## Scaling
//!
//! At most one scaling policy is honoured per compile (first match wins). For a
//! policy `SP1` targeting `VDU1`:
//!
//! ```text
//! SP1_group      OS::Heat::AutoScalingGroup  resource: {type: SP1_res.yaml}
//! SP1_scale_out  OS::Heat::ScalingPolicy     scaling_adjustment: +increment
//! SP1_scale_in   OS::Heat::ScalingPolicy     scaling_adjustment: -increment
//! SP1_res.yaml   nested template: VDU1 and everything it owns
//! ```
//!
//! ## Alarms
//!
//! One `OS::Aodh::Alarm` per alarm policy. Alarms and the servers they watch
//! are correlated through the `<metadata>-<suffix>` tag, where the suffix is
//! the scaling group name when a scaling policy exists and a per-synthesis
//! workload id otherwise.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compiler::SERVER_TYPE;
use crate::descriptor::{AlarmPolicy, ScalingPolicy, WorkloadDescriptor};
use crate::error::{OrchestratorError, Result};
use crate::graph::{AttrSegment, PropertyValue, Resource, ResourceGraph};

/// Autoscaling group resource type
pub const GROUP_TYPE: &str = "OS::Heat::AutoScalingGroup";
/// Scaling policy resource type
pub const POLICY_TYPE: &str = "OS::Heat::ScalingPolicy";
/// Alarm resource type
pub const ALARM_TYPE: &str = "OS::Aodh::Alarm";

/// Key alarms match server metadata on
pub const SERVER_GROUP_MATCH_KEY: &str = "metadata.user_metadata.server_group";

/// Direction of a scaling signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Out,
    In,
}

impl ScaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Out => "out",
            Self::In => "in",
        }
    }

    /// `gt`/`ge` alarms grow the group, every other operator shrinks it
    pub fn for_comparison(operator: &str) -> Self {
        match operator {
            "gt" | "ge" => Self::Out,
            _ => Self::In,
        }
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScaleDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "out" => Ok(Self::Out),
            "in" => Ok(Self::In),
            other => Err(format!("Unknown scale direction: {} (expected out or in)", other)),
        }
    }
}

/// `<policy>_group`
pub fn group_name(policy: &str) -> String {
    format!("{}_group", policy)
}

/// `<policy>_scale_<out|in>`
pub fn policy_resource_name(policy: &str, direction: ScaleDirection) -> String {
    format!("{}_scale_{}", policy, direction)
}

/// `<policy>_res.yaml`
pub fn member_template_name(policy: &str) -> String {
    format!("{}_res.yaml", policy)
}

/// Policy name → synthesized group resource name
///
/// Produced at compile time; the caller persists it and supplies it again
/// on every scale call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScalingGroupBinding(BTreeMap<String, String>);

impl ScalingGroupBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, policy: impl Into<String>, group: impl Into<String>) {
        self.0.insert(policy.into(), group.into());
    }

    /// Group bound to `policy`
    pub fn group(&self, policy: &str) -> Option<&str> {
        self.0.get(policy).map(String::as_str)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Output of [`synthesize_scaling`]
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingSynthesis {
    pub present: bool,
    /// The honoured policy
    pub policy: Option<ScalingPolicy>,
    pub bindings: ScalingGroupBinding,
    /// Group plus scale-out/scale-in policies
    pub fragment: ResourceGraph,
}

impl ScalingSynthesis {
    fn absent() -> Self {
        Self {
            present: false,
            policy: None,
            bindings: ScalingGroupBinding::new(),
            fragment: ResourceGraph::new(),
        }
    }
}

fn invalid_policy(policy: &ScalingPolicy, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidScalingPolicy {
        policy: policy.name.clone(),
        reason: reason.into(),
    }
}

fn check_bounds(policy: &ScalingPolicy) -> Result<()> {
    if policy.min_size > policy.max_size {
        return Err(invalid_policy(
            policy,
            format!("min {} exceeds max {}", policy.min_size, policy.max_size),
        ));
    }
    if policy.desired < policy.min_size || policy.desired > policy.max_size {
        return Err(invalid_policy(
            policy,
            format!(
                "default {} outside [{}, {}]",
                policy.desired, policy.min_size, policy.max_size
            ),
        ));
    }
    if policy.increment == 0 {
        return Err(invalid_policy(policy, "increment must be positive"));
    }
    if policy.targets.is_empty() {
        return Err(invalid_policy(policy, "no target components"));
    }
    Ok(())
}

/// Derive the autoscaling group and its two signal policies
pub fn synthesize_scaling(descriptor: &WorkloadDescriptor) -> Result<ScalingSynthesis> {
    let mut policies = descriptor.scaling_policies();
    let Some(policy) = policies.next() else {
        return Ok(ScalingSynthesis::absent());
    };
    for ignored in policies {
        warn!(
            policy = %ignored.name,
            honoured = %policy.name,
            "Only one scaling policy is supported, ignoring"
        );
    }

    check_bounds(policy)?;
    for target in &policy.targets {
        if descriptor.computes().all(|(name, _)| name != target) {
            return Err(invalid_policy(
                policy,
                format!("target {} is not a compute component", target),
            ));
        }
    }

    let group = group_name(&policy.name);
    let mut fragment = ResourceGraph::new();
    fragment.add_resource(
        &group,
        Resource::new(GROUP_TYPE)
            .with("min_size", i64::from(policy.min_size))
            .with("max_size", i64::from(policy.max_size))
            .with("desired_capacity", i64::from(policy.desired))
            .with("cooldown", i64::from(policy.cooldown))
            .with(
                "resource",
                PropertyValue::map([("type", PropertyValue::from(member_template_name(&policy.name)))]),
            ),
    )?;

    for (direction, sign) in [(ScaleDirection::Out, 1), (ScaleDirection::In, -1)] {
        fragment.add_resource(
            policy_resource_name(&policy.name, direction),
            Resource::new(POLICY_TYPE)
                .with("adjustment_type", "change_in_capacity")
                .with("scaling_adjustment", sign * i64::from(policy.increment))
                .with("auto_scaling_group_id", PropertyValue::get_resource(group.clone()))
                .with("cooldown", i64::from(policy.cooldown)),
        )?;
    }

    let mut bindings = ScalingGroupBinding::new();
    bindings.insert(policy.name.clone(), group.clone());

    info!(policy = %policy.name, group = %group, "Synthesized scaling group");

    Ok(ScalingSynthesis {
        present: true,
        policy: Some(policy.clone()),
        bindings,
        fragment,
    })
}

/// Move the scaling targets into the member template and add the fragment
///
/// The targets take along everything they reference (ports, flavor, image)
/// and every non-server resource that references them (volume attachments,
/// and through those the volumes). Outputs sourced from moved resources move
/// too, so group members expose them as attributes.
pub fn merge_scaling(base: &ResourceGraph, synthesis: &ScalingSynthesis) -> Result<ResourceGraph> {
    let Some(policy) = synthesis.policy.as_ref().filter(|_| synthesis.present) else {
        return Ok(base.clone());
    };

    let mut moved: BTreeSet<String> = BTreeSet::new();
    for target in &policy.targets {
        if !base.contains(target) {
            return Err(invalid_policy(policy, format!("target {} not in graph", target)));
        }
        moved.insert(target.clone());
    }

    loop {
        let mut grown = moved.clone();
        for name in &moved {
            if let Some(resource) = base.resource(name) {
                grown.extend(resource.references());
            }
        }
        for (name, resource) in base.resources() {
            if resource.resource_type != SERVER_TYPE
                && !resource.references().is_disjoint(&moved)
            {
                grown.insert(name.clone());
            }
        }
        if grown == moved {
            break;
        }
        moved = grown;
    }

    for (name, resource) in base.resources() {
        if moved.contains(name) {
            continue;
        }
        if let Some(shared) = resource.references().intersection(&moved).next() {
            return Err(OrchestratorError::invalid_graph(format!(
                "{} is owned by scaling group {} but also referenced by {}",
                shared,
                group_name(&policy.name),
                name
            )));
        }
    }

    let mut merged = base.clone();
    let mut members = ResourceGraph::new();
    for name in &moved {
        if let Some(resource) = merged.remove_resource(name) {
            members.add_resource(name.clone(), resource)?;
        }
    }
    let moved_outputs: Vec<String> = merged
        .outputs()
        .iter()
        .filter(|(_, output)| moved.contains(&output.resource))
        .map(|(name, _)| name.clone())
        .collect();
    for name in moved_outputs {
        if let Some(output) = merged.remove_output(&name) {
            members.add_output(name, output);
        }
    }

    debug!(
        policy = %policy.name,
        members = ?members.resources().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
        "Moved group members into nested template"
    );

    merged.add_file(member_template_name(&policy.name), members);
    merged.merge(synthesis.fragment.clone())?;
    merged.validate()?;
    Ok(merged)
}

/// Output of [`synthesize_alarms`]
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSynthesis {
    pub present: bool,
    /// Alarm resources only
    pub fragment: ResourceGraph,
    /// Base graph with retagged servers plus the fragment
    pub merged: ResourceGraph,
    /// Alarm name → correlation tag
    pub tags: BTreeMap<String, String>,
}

/// Retag every server whose metadata exposes `metadata`; returns how many matched
fn retag_servers(graph: &mut ResourceGraph, metadata: &str, tag: &str) -> usize {
    let mut matched = 0;
    for (_, resource) in graph.resources_mut() {
        if resource.resource_type != SERVER_TYPE {
            continue;
        }
        let Some(PropertyValue::Map(entries)) = resource.properties.get_mut("metadata") else {
            continue;
        };
        for value in entries.values_mut() {
            if value.as_str() == Some(metadata) || value.as_str() == Some(tag) {
                *value = PropertyValue::from(tag);
                matched += 1;
            }
        }
    }
    for (_, nested) in graph.files_mut() {
        matched += retag_servers(nested, metadata, tag);
    }
    matched
}

fn alarm_actions(alarm: &AlarmPolicy, scaling: Option<&ScalingPolicy>) -> Vec<PropertyValue> {
    let mut actions = Vec::new();
    for action in &alarm.actions {
        if scaling.is_some_and(|p| &p.name == action) {
            let direction = ScaleDirection::for_comparison(&alarm.comparison_operator);
            actions.push(PropertyValue::get_attr(
                policy_resource_name(action, direction),
                vec![AttrSegment::from("alarm_url")],
            ));
        } else if action.starts_with("http://") || action.starts_with("https://") {
            actions.push(PropertyValue::from(action.as_str()));
        } else {
            warn!(alarm = %alarm.name, action = %action, "Ignoring unsupported alarm action");
        }
    }
    actions
}

/// Derive one alarm resource per alarm policy and merge them into `base`
pub fn synthesize_alarms(descriptor: &WorkloadDescriptor, base: &ResourceGraph) -> Result<AlarmSynthesis> {
    let alarms: BTreeMap<&str, &AlarmPolicy> = descriptor
        .alarm_policies()
        .map(|a| (a.name.as_str(), a))
        .collect();
    if alarms.is_empty() {
        return Ok(AlarmSynthesis {
            present: false,
            fragment: ResourceGraph::new(),
            merged: base.clone(),
            tags: BTreeMap::new(),
        });
    }

    let scaling = descriptor.scaling_policies().next();
    let suffix = match scaling {
        Some(policy) => group_name(&policy.name),
        None => Uuid::new_v4().to_string(),
    };

    let mut merged = base.clone();
    let mut fragment = ResourceGraph::new();
    let mut tags = BTreeMap::new();

    for (name, alarm) in alarms {
        let tag = format!("{}-{}", alarm.metadata, suffix);
        if retag_servers(&mut merged, &alarm.metadata, &tag) == 0 {
            return Err(OrchestratorError::MetadataNotMatched {
                alarm: name.to_string(),
                metadata: alarm.metadata.clone(),
            });
        }

        let resource = Resource::new(ALARM_TYPE)
            .with("meter_name", alarm.meter_name.clone())
            .with("comparison_operator", alarm.comparison_operator.clone())
            .with("period", PropertyValue::from(serde_json::Value::from(alarm.period)))
            .with("evaluation_periods", i64::from(alarm.evaluation_periods))
            .with("statistic", alarm.statistic.clone())
            .with("threshold", PropertyValue::Float(alarm.threshold))
            .with(
                "matching_metadata",
                PropertyValue::map([(SERVER_GROUP_MATCH_KEY, PropertyValue::from(tag.clone()))]),
            )
            .with("alarm_actions", PropertyValue::List(alarm_actions(alarm, scaling)));
        fragment.add_resource(name, resource)?;
        tags.insert(name.to_string(), tag);
    }

    merged.merge(fragment.clone())?;
    merged.validate()?;

    info!(alarms = tags.len(), "Synthesized alarms");

    Ok(AlarmSynthesis {
        present: true,
        fragment,
        merged,
        tags,
    })
}
