//! Descriptor compiler
//!
//! Turns a [`WorkloadDescriptor`] plus a parameter table into one resource
//! graph and a monitoring dictionary:
//!
//! 1. **Substitute**: every placeholder is resolved up front
//! 2. **Map**: flavor/image sub-resources from capabilities and artifacts
//! 3. **Connect**: one port per network requirement, management outputs
//! 4. **Attach**: volumes and their attachments
//! 5. **Validate**: no dangling edges, no cycles
//!
//! The only remote call is the property-compatibility lookup, memoized for
//! the duration of one [`DescriptorCompiler::compile`] call.

use nimbus_core::PropertyCatalog;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::descriptor::{Component, ComputeNode, ConnectionPointNode, StorageNode, WorkloadDescriptor};
use crate::error::{OrchestratorError, Result};
use crate::graph::{PropertyValue, Resource, ResourceGraph};
use crate::mapper::{self, CompatibilityCache, FLAVOR_SUFFIX, IMAGE_SUFFIX};
use crate::network::{self, PortRequest};
use crate::params::{ParameterTable, Substitution};
use crate::scaling::{merge_scaling, synthesize_alarms, synthesize_scaling, ScalingGroupBinding};

/// Server resource type
pub const SERVER_TYPE: &str = "OS::Nova::Server";
/// Volume resource type
pub const VOLUME_TYPE: &str = "OS::Cinder::Volume";
/// Volume attachment resource type
pub const VOLUME_ATTACHMENT_TYPE: &str = "OS::Cinder::VolumeAttachment";

/// Component name → monitoring policy name → policy body
pub type MonitoringDict = BTreeMap<String, BTreeMap<String, Value>>;

/// Compiler configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Extra specs added to every generated flavor, overriding derived ones
    #[serde(default)]
    pub flavor_extra_specs: BTreeMap<String, String>,
}

impl CompilerConfig {
    /// Add a flavor extra spec
    pub fn with_flavor_extra_spec(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.flavor_extra_specs.insert(key.into(), value.into());
        self
    }
}

/// Result of one compile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledWorkload {
    pub graph: ResourceGraph,
    pub monitoring: MonitoringDict,
}

/// Deployable graph of one descriptor, scaling and alarms included
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub graph: ResourceGraph,
    pub monitoring: MonitoringDict,
    /// Persist alongside the stack id; every scale call needs it
    pub bindings: ScalingGroupBinding,
    /// Alarm name → correlation tag
    pub alarm_tags: BTreeMap<String, String>,
}

/// Compiles workload descriptors into resource graphs
#[derive(Debug, Clone, Default)]
pub struct DescriptorCompiler {
    config: CompilerConfig,
}

impl DescriptorCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    /// Compile `descriptor` against the endpoint described by `catalog`
    pub async fn compile<C: PropertyCatalog + ?Sized>(
        &self,
        descriptor: &WorkloadDescriptor,
        params: Option<&ParameterTable>,
        catalog: &C,
    ) -> Result<CompiledWorkload> {
        let subst = Substitution::prepare(descriptor, params)?;
        let mut cache = CompatibilityCache::new(catalog);
        let connection_points = connection_points_by_compute(descriptor)?;

        let mut graph = ResourceGraph::new();
        graph.description = descriptor.description.clone();
        let mut monitoring = MonitoringDict::new();

        for (name, compute) in descriptor.computes() {
            let cps = connection_points.get(name.as_str()).map(Vec::as_slice).unwrap_or_default();
            self.compile_compute(name, compute, cps, descriptor, &subst, &mut cache, &mut graph)
                .await?;

            if let Some(policy) = &compute.monitoring_policy {
                let parameters = subst.resolve_map(&policy.parameters)?;
                let body = json!({
                    "parameters": parameters,
                    "actions": policy.actions,
                });
                monitoring
                    .entry(name.clone())
                    .or_default()
                    .insert(policy.name.clone(), body);
            }
        }

        for (name, component) in &descriptor.components {
            if let Component::Storage(storage) = component {
                compile_storage(name, storage, descriptor, &subst, &mut graph)?;
            }
        }

        graph.validate()?;

        info!(
            workload = %descriptor.name,
            resources = graph.len(),
            outputs = graph.outputs().len(),
            compatibility_lookups = cache.lookups(),
            "Compiled workload descriptor"
        );

        Ok(CompiledWorkload { graph, monitoring })
    }

    /// Compile, then fold in the scaling group and alarms
    pub async fn plan<C: PropertyCatalog + ?Sized>(
        &self,
        descriptor: &WorkloadDescriptor,
        params: Option<&ParameterTable>,
        catalog: &C,
    ) -> Result<DeploymentPlan> {
        let compiled = self.compile(descriptor, params, catalog).await?;
        let scaling = synthesize_scaling(descriptor)?;
        let graph = if scaling.present {
            merge_scaling(&compiled.graph, &scaling)?
        } else {
            compiled.graph
        };
        let alarms = synthesize_alarms(descriptor, &graph)?;

        debug!(
            workload = %descriptor.name,
            scaling_groups = scaling.bindings.len(),
            alarms = alarms.tags.len(),
            "Planned deployment"
        );
        Ok(DeploymentPlan {
            graph: alarms.merged,
            monitoring: compiled.monitoring,
            bindings: scaling.bindings,
            alarm_tags: alarms.tags,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn compile_compute<C: PropertyCatalog + ?Sized>(
        &self,
        name: &str,
        compute: &ComputeNode,
        connection_points: &[(&str, &ConnectionPointNode)],
        descriptor: &WorkloadDescriptor,
        subst: &Substitution<'_>,
        cache: &mut CompatibilityCache<'_, C>,
        graph: &mut ResourceGraph,
    ) -> Result<()> {
        let mut server = Resource::new(SERVER_TYPE);

        if let Some(image) = subst.resolve_opt(compute.image.as_ref())? {
            server = server.with("image", PropertyValue::from(image));
        } else if let Some(artifact) = &compute.artifact {
            let image_name = format!("{}{}", name, IMAGE_SUFFIX);
            graph.add_resource(&image_name, mapper::image_resource(name, artifact, subst)?)?;
            server = server.with("image", PropertyValue::get_resource(image_name));
        }

        if let Some(flavor) = subst.resolve_opt(compute.flavor.as_ref())? {
            server = server.with("flavor", PropertyValue::from(flavor));
        } else if let Some(caps) = &compute.capabilities {
            let flavor_name = format!("{}{}", name, FLAVOR_SUFFIX);
            let flavor = mapper::flavor_resource(name, caps, subst, &self.config.flavor_extra_specs)?;
            graph.add_resource(&flavor_name, flavor)?;
            server = server.with("flavor", PropertyValue::get_resource(flavor_name));
        }

        let metadata = subst.resolve_map(&compute.metadata)?;
        if !metadata.is_empty() {
            server = server.with(
                "metadata",
                PropertyValue::map(metadata.into_iter().map(|(k, v)| (k, PropertyValue::from(v)))),
            );
        }
        if let Some(user_data) = subst.resolve_opt(compute.user_data.as_ref())? {
            server = server
                .with("user_data", PropertyValue::from(user_data))
                .with("user_data_format", "RAW");
        }
        if let Some(key_name) = subst.resolve_opt(compute.key_name.as_ref())? {
            server = server.with("key_name", PropertyValue::from(key_name));
        }
        if let Some(zone) = subst.resolve_opt(compute.availability_zone.as_ref())? {
            server = server.with("availability_zone", PropertyValue::from(zone));
        }

        let mut requests = Vec::new();
        for requirement in &compute.networks {
            let mut request = PortRequest::new(
                network::port_name(name, &requirement.network),
                name,
                requirement.network.clone(),
            );
            request.management = requirement.management;
            request.addresses = subst.resolve_opt(requirement.addresses.as_ref())?;
            request.extra = resolved_properties(&requirement.properties, subst)?;
            requests.push(request);
        }
        for (cp_name, cp) in connection_points {
            let network_name = match descriptor.components.get(&cp.link) {
                Some(Component::NetworkLink(link)) => subst.resolve(&link.network_name)?,
                _ => {
                    return Err(OrchestratorError::invalid_capability(
                        *cp_name,
                        format!("link {} is not a network link component", cp.link),
                    ))
                }
            };
            let mut request = PortRequest::new(*cp_name, name, cp.link.clone());
            request.network = PropertyValue::from(network_name);
            request.management = cp.management;
            request.addresses = subst.resolve_opt(cp.addresses.as_ref())?;
            request.anti_spoofing = cp.anti_spoofing_protection;
            request.vnic = cp.vnic_type;
            request.extra = resolved_properties(&cp.properties, subst)?;
            requests.push(request);
        }

        // At most one management output per compute
        if requests.iter().filter(|r| r.management).count() > 1 {
            return Err(OrchestratorError::invalid_capability(
                name,
                "more than one management network",
            ));
        }

        let mut networks = Vec::with_capacity(requests.len());
        for request in requests {
            let mut port = network::synthesize_port(request)?;
            cache.apply(&port.name, &mut port.resource).await?;
            debug!(compute = %name, port = %port.name, "Synthesized port");

            networks.push(PropertyValue::map([(
                "port",
                PropertyValue::get_resource(port.name.clone()),
            )]));
            if let Some((output_name, output)) = port.management_output {
                graph.add_output(output_name, output);
            }
            graph.add_resource(port.name, port.resource)?;
        }
        if !networks.is_empty() {
            server = server.with("networks", PropertyValue::List(networks));
        }

        graph.add_resource(name, server)
    }
}

fn resolved_properties(
    properties: &BTreeMap<String, crate::descriptor::DescriptorValue>,
    subst: &Substitution<'_>,
) -> Result<BTreeMap<String, PropertyValue>> {
    Ok(subst
        .resolve_map(properties)?
        .into_iter()
        .map(|(k, v)| (k, PropertyValue::from(v)))
        .collect())
}

/// Connection points grouped by bound compute, in port order
fn connection_points_by_compute(
    descriptor: &WorkloadDescriptor,
) -> Result<BTreeMap<&str, Vec<(&str, &ConnectionPointNode)>>> {
    let mut grouped: BTreeMap<&str, Vec<(&str, &ConnectionPointNode)>> = BTreeMap::new();
    for (name, component) in &descriptor.components {
        let Component::ConnectionPoint(cp) = component else {
            continue;
        };
        if !matches!(descriptor.components.get(&cp.binding), Some(Component::Compute(_))) {
            return Err(OrchestratorError::invalid_capability(
                name,
                format!("binding {} is not a compute component", cp.binding),
            ));
        }
        grouped.entry(cp.binding.as_str()).or_default().push((name.as_str(), cp));
    }
    for cps in grouped.values_mut() {
        cps.sort_by_key(|(name, cp)| (cp.order.unwrap_or(u32::MAX), *name));
    }
    Ok(grouped)
}

fn compile_storage(
    name: &str,
    storage: &StorageNode,
    descriptor: &WorkloadDescriptor,
    subst: &Substitution<'_>,
    graph: &mut ResourceGraph,
) -> Result<()> {
    if !matches!(descriptor.components.get(&storage.attached_to), Some(Component::Compute(_))) {
        return Err(OrchestratorError::invalid_capability(
            name,
            format!("attached_to {} is not a compute component", storage.attached_to),
        ));
    }

    let size = subst.resolve(&storage.size)?;
    let size_gb = mapper::size_in(&size, mapper::SizeUnit::GB).ok_or_else(|| {
        OrchestratorError::invalid_capability(name, format!("size has unusable value {}", size))
    })?;

    let mut volume = Resource::new(VOLUME_TYPE).with("size", size_gb);
    if let Some(image) = subst.resolve_opt(storage.image.as_ref())? {
        volume = volume.with("image", PropertyValue::from(image));
    }
    graph.add_resource(name, volume)?;

    let mut attachment = Resource::new(VOLUME_ATTACHMENT_TYPE)
        .with("instance_uuid", PropertyValue::get_resource(storage.attached_to.clone()))
        .with("volume_id", PropertyValue::get_resource(name));
    if let Some(mount_point) = &storage.mount_point {
        attachment = attachment.with("mountpoint", mount_point.clone());
    }
    graph.add_resource(format!("{}_attachment", name), attachment)
}
