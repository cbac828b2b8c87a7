//! Resource/property mapper
//!
//! Translates abstract sizing and image requirements into native resource
//! properties, and applies per-endpoint property compatibility fallbacks.
//!
//! ## Flavor mapping
//!
//! | capability   | property | unit | default |
//! |--------------|----------|------|---------|
//! | `num_cpus`   | `vcpus`  |      | 1       |
//! | `disk_size`  | `disk`   | GB   | 1       |
//! | `mem_size`   | `ram`    | MB   | 512     |
//!
//! Units are binary whichever spelling is used: `GB` and `GiB` are both
//! 1024 MB.

use nimbus_core::PropertyCatalog;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::descriptor::{ComputeCapabilities, ImageArtifact};
use crate::error::{OrchestratorError, Result};
use crate::graph::{PropertyValue, Resource};
use crate::params::Substitution;

/// Flavor sub-resource type
pub const FLAVOR_TYPE: &str = "OS::Nova::Flavor";
/// Image sub-resource type
pub const IMAGE_TYPE: &str = "OS::Glance::Image";

/// Suffix of generated flavor resources
pub const FLAVOR_SUFFIX: &str = "_flavor";
/// Suffix of generated image resources
pub const IMAGE_SUFFIX: &str = "_image";

const DEFAULT_VCPUS: i64 = 1;
const DEFAULT_DISK_GB: i64 = 1;
const DEFAULT_RAM_MB: i64 = 512;

/// (resource type, property, passthrough property) for properties that older
/// endpoints do not accept natively
pub const COMPATIBILITY_TABLE: &[(&str, &str, &str)] =
    &[("OS::Neutron::Port", "port_security_enabled", "value_specs")];

/// Size unit accepted in `"<n> <unit>"` strings
///
/// Decimal spellings are aliases of the binary units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Bytes,
    KB,
    KiB,
    MB,
    MiB,
    GB,
    GiB,
    TB,
    TiB,
}

impl SizeUnit {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "B" | "b" => Self::Bytes,
            "kB" | "KB" | "kb" => Self::KB,
            "KiB" | "kiB" => Self::KiB,
            "MB" | "mb" => Self::MB,
            "MiB" => Self::MiB,
            "GB" | "gb" => Self::GB,
            "GiB" => Self::GiB,
            "TB" | "tb" => Self::TB,
            "TiB" => Self::TiB,
            _ => return None,
        })
    }

    fn bytes(&self) -> f64 {
        match self {
            Self::Bytes => 1.0,
            Self::KB | Self::KiB => 1024.0,
            Self::MB | Self::MiB => 1_048_576.0,
            Self::GB | Self::GiB => 1_073_741_824.0,
            Self::TB | Self::TiB => 1_099_511_627_776.0,
        }
    }
}

/// Convert a size to a whole number of `target` units
///
/// Plain numbers are taken as already expressed in `target`.
pub fn size_in(value: &Value, target: SizeUnit) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            let split = s
                .find(|c: char| c.is_ascii_alphabetic())
                .unwrap_or(s.len());
            let (number, unit) = s.split_at(split);
            let number: f64 = number.trim().parse().ok()?;
            if unit.is_empty() {
                return Some(number as i64);
            }
            let unit = SizeUnit::parse(unit.trim())?;
            Some((number * unit.bytes() / target.bytes()) as i64)
        }
        _ => None,
    }
}

fn as_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn spec_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the flavor sub-resource for `compute`
pub fn flavor_resource(
    compute: &str,
    caps: &ComputeCapabilities,
    subst: &Substitution<'_>,
    configured_extra_specs: &BTreeMap<String, String>,
) -> Result<Resource> {
    let invalid = |field: &str, value: &Value| {
        OrchestratorError::invalid_capability(compute, format!("{} has unusable value {}", field, value))
    };

    let vcpus = match subst.resolve_opt(caps.num_cpus.as_ref())? {
        Some(v) => as_count(&v).ok_or_else(|| invalid("num_cpus", &v))?,
        None => DEFAULT_VCPUS,
    };
    let disk = match subst.resolve_opt(caps.disk_size.as_ref())? {
        Some(v) => size_in(&v, SizeUnit::GB).ok_or_else(|| invalid("disk_size", &v))?,
        None => DEFAULT_DISK_GB,
    };
    let ram = match subst.resolve_opt(caps.mem_size.as_ref())? {
        Some(v) => size_in(&v, SizeUnit::MB).ok_or_else(|| invalid("mem_size", &v))?,
        None => DEFAULT_RAM_MB,
    };

    let mut extra_specs = extra_specs(compute, caps, subst)?;
    for (key, value) in configured_extra_specs {
        extra_specs.insert(key.clone(), value.clone());
    }

    let mut flavor = Resource::new(FLAVOR_TYPE)
        .with("vcpus", vcpus)
        .with("disk", disk)
        .with("ram", ram);
    if !extra_specs.is_empty() {
        flavor = flavor.with(
            "extra_specs",
            PropertyValue::map(extra_specs.into_iter().map(|(k, v)| (k, PropertyValue::String(v)))),
        );
    }
    Ok(flavor)
}

/// Flavor extra specs derived from page size, NUMA and CPU pinning capabilities
pub fn extra_specs(
    compute: &str,
    caps: &ComputeCapabilities,
    subst: &Substitution<'_>,
) -> Result<BTreeMap<String, String>> {
    let mut specs = BTreeMap::new();

    if let Some(page) = subst.resolve_opt(caps.mem_page_size.as_ref())? {
        let mapped = match &page {
            Value::String(s) if matches!(s.as_str(), "small" | "large" | "any") => s.clone(),
            other => match as_count(other) {
                Some(mb) => mb
                    .checked_mul(1024)
                    .ok_or_else(|| {
                        OrchestratorError::invalid_capability(
                            compute,
                            format!("mem_page_size {} MB is out of range", mb),
                        )
                    })?
                    .to_string(),
                None => {
                    return Err(OrchestratorError::invalid_capability(
                        compute,
                        format!("mem_page_size must be small, large, any or a number, got {}", page),
                    ))
                }
            },
        };
        specs.insert("hw:mem_page_size".to_string(), mapped);
    }

    if let Some(count) = subst.resolve_opt(caps.numa_node_count.as_ref())? {
        specs.insert("hw:numa_nodes".to_string(), spec_string(&count));
    } else if !caps.numa_nodes.is_empty() {
        for (node_name, node) in &caps.numa_nodes {
            let node = subst.resolve_map(node)?;
            if let Some(unknown) = node
                .keys()
                .find(|k| !matches!(k.as_str(), "id" | "vcpus" | "mem_size"))
            {
                return Err(OrchestratorError::invalid_capability(
                    compute,
                    format!("numa node {} has unsupported key {}", node_name, unknown),
                ));
            }
            let id = node.get("id").map(spec_string).ok_or_else(|| {
                OrchestratorError::invalid_capability(compute, format!("numa node {} has no id", node_name))
            })?;
            if let Some(vcpus) = node.get("vcpus") {
                let cpus = match vcpus {
                    Value::Array(items) => items.iter().map(spec_string).collect::<Vec<_>>().join(","),
                    other => spec_string(other),
                };
                specs.insert(format!("hw:numa_cpus.{}", id), cpus);
            }
            if let Some(mem) = node.get("mem_size") {
                let mb = size_in(mem, SizeUnit::MB).ok_or_else(|| {
                    OrchestratorError::invalid_capability(compute, format!("numa node {} mem_size {}", node_name, mem))
                })?;
                specs.insert(format!("hw:numa_mem.{}", id), mb.to_string());
            }
        }
        specs.insert("hw:numa_nodes".to_string(), caps.numa_nodes.len().to_string());
    }

    for (key, value) in subst.resolve_map(&caps.cpu_allocation)? {
        let spec = match key.as_str() {
            "cpu_affinity" => "hw:cpu_policy",
            "thread_allocation" => "hw:cpu_threads_policy",
            "socket_count" => "hw:cpu_sockets",
            "thread_count" => "hw:cpu_threads",
            "core_count" => "hw:cpu_cores",
            other => {
                return Err(OrchestratorError::invalid_capability(
                    compute,
                    format!("unsupported cpu_allocation key {}", other),
                ))
            }
        };
        specs.insert(spec.to_string(), spec_string(&value));
    }

    Ok(specs)
}

/// Build the image sub-resource for `compute`
pub fn image_resource(compute: &str, artifact: &ImageArtifact, subst: &Substitution<'_>) -> Result<Resource> {
    let location = subst
        .resolve_opt(artifact.file.as_ref())?
        .ok_or_else(|| OrchestratorError::invalid_capability(compute, "image artifact has no file"))?;

    Ok(Resource::new(IMAGE_TYPE)
        .with("location", PropertyValue::from(location))
        .with("container_format", "bare")
        .with("disk_format", "raw")
        .with("name", format!("{}{}", compute, IMAGE_SUFFIX)))
}

/// Per-compile memo of endpoint property support
///
/// Owned by one compile call; answers are endpoint-specific and are never
/// shared across compiles.
pub struct CompatibilityCache<'a, C: PropertyCatalog + ?Sized> {
    catalog: &'a C,
    supported: BTreeMap<String, BTreeSet<String>>,
}

impl<'a, C: PropertyCatalog + ?Sized> CompatibilityCache<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self {
            catalog,
            supported: BTreeMap::new(),
        }
    }

    /// Number of resource types looked up so far
    pub fn lookups(&self) -> usize {
        self.supported.len()
    }

    async fn supports(&mut self, resource_type: &str, property: &str) -> Result<bool> {
        if !self.supported.contains_key(resource_type) {
            let properties = self.catalog.supported_properties(resource_type).await?;
            debug!(
                resource_type = %resource_type,
                properties = properties.len(),
                "Fetched property support"
            );
            self.supported.insert(resource_type.to_string(), properties);
        }
        Ok(self
            .supported
            .get(resource_type)
            .is_some_and(|props| props.contains(property)))
    }

    /// Nest unsupported properties of `resource` under their passthrough property
    pub async fn apply(&mut self, name: &str, resource: &mut Resource) -> Result<()> {
        for (resource_type, property, passthrough) in COMPATIBILITY_TABLE {
            if resource.resource_type != *resource_type || !resource.properties.contains_key(*property) {
                continue;
            }
            if self.supports(resource_type, property).await? {
                continue;
            }
            let Some(value) = resource.properties.remove(*property) else {
                continue;
            };
            debug!(
                resource = %name,
                property = %property,
                passthrough = %passthrough,
                "Property not natively supported, nesting under passthrough"
            );
            match resource
                .properties
                .entry(passthrough.to_string())
                .or_insert_with(|| PropertyValue::Map(BTreeMap::new()))
            {
                PropertyValue::Map(entries) => {
                    entries.insert(property.to_string(), value);
                }
                other => {
                    return Err(OrchestratorError::invalid_capability(
                        name,
                        format!("{} must be a mapping, got {:?}", passthrough, other),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorValue, WorkloadDescriptor};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticCatalog {
        port_properties: BTreeSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PropertyCatalog for StaticCatalog {
        async fn supported_properties(&self, _resource_type: &str) -> nimbus_core::Result<BTreeSet<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.port_properties.clone())
        }
    }

    fn no_inputs() -> WorkloadDescriptor {
        WorkloadDescriptor::new("w")
    }

    #[test]
    fn test_size_conversion() {
        assert_eq!(size_in(&json!(2048), SizeUnit::MB), Some(2048));
        assert_eq!(size_in(&json!("512 MB"), SizeUnit::MB), Some(512));
        assert_eq!(size_in(&json!("2 GiB"), SizeUnit::MB), Some(2048));
        assert_eq!(size_in(&json!("4 GB"), SizeUnit::MB), Some(4096));
        assert_eq!(size_in(&json!("1.5 gb"), SizeUnit::MB), Some(1536));
        assert_eq!(size_in(&json!("10 GB"), SizeUnit::GB), Some(10));
        assert_eq!(size_in(&json!("1TB"), SizeUnit::GB), Some(1024));
        assert_eq!(size_in(&json!("lots"), SizeUnit::GB), None);
        assert_eq!(size_in(&json!("3 parsecs"), SizeUnit::GB), None);
    }

    #[test]
    fn test_flavor_ram_from_gigabytes() {
        let descriptor = no_inputs();
        let subst = Substitution::prepare(&descriptor, None).unwrap();
        let caps = ComputeCapabilities {
            mem_size: Some(DescriptorValue::from("4 GB")),
            ..Default::default()
        };
        let flavor = flavor_resource("VDU1", &caps, &subst, &BTreeMap::new()).unwrap();
        assert_eq!(flavor.properties["ram"], PropertyValue::Int(4096));
    }

    #[test]
    fn test_numeric_mem_page_size() {
        let descriptor = no_inputs();
        let subst = Substitution::prepare(&descriptor, None).unwrap();

        let caps = ComputeCapabilities {
            mem_page_size: Some(DescriptorValue::Int(2)),
            ..Default::default()
        };
        let specs = extra_specs("VDU1", &caps, &subst).unwrap();
        assert_eq!(specs["hw:mem_page_size"], "2048");

        let caps = ComputeCapabilities {
            mem_page_size: Some(DescriptorValue::Int(i64::MAX)),
            ..Default::default()
        };
        assert!(matches!(
            extra_specs("VDU1", &caps, &subst),
            Err(OrchestratorError::InvalidCapability { .. })
        ));
    }

    #[test]
    fn test_flavor_defaults() {
        let descriptor = no_inputs();
        let subst = Substitution::prepare(&descriptor, None).unwrap();
        let flavor =
            flavor_resource("VDU1", &ComputeCapabilities::default(), &subst, &BTreeMap::new()).unwrap();

        assert_eq!(flavor.resource_type, FLAVOR_TYPE);
        assert_eq!(flavor.properties["vcpus"], PropertyValue::Int(1));
        assert_eq!(flavor.properties["disk"], PropertyValue::Int(1));
        assert_eq!(flavor.properties["ram"], PropertyValue::Int(512));
        assert!(!flavor.properties.contains_key("extra_specs"));
    }

    #[test]
    fn test_flavor_extra_specs() {
        let descriptor = no_inputs();
        let subst = Substitution::prepare(&descriptor, None).unwrap();
        let caps = ComputeCapabilities {
            num_cpus: Some(DescriptorValue::Int(8)),
            mem_size: Some(DescriptorValue::from("4096 MB")),
            disk_size: Some(DescriptorValue::from("8 GB")),
            mem_page_size: Some(DescriptorValue::from("large")),
            numa_nodes: BTreeMap::from([(
                "node0".to_string(),
                BTreeMap::from([
                    ("id".to_string(), DescriptorValue::Int(0)),
                    (
                        "vcpus".to_string(),
                        DescriptorValue::List(vec![DescriptorValue::Int(0), DescriptorValue::Int(1)]),
                    ),
                    ("mem_size".to_string(), DescriptorValue::from("1 GB")),
                ]),
            )]),
            cpu_allocation: BTreeMap::from([
                ("cpu_affinity".to_string(), DescriptorValue::from("dedicated")),
                ("core_count".to_string(), DescriptorValue::Int(4)),
            ]),
            ..Default::default()
        };

        let configured = BTreeMap::from([("hw:cpu_policy".to_string(), "shared".to_string())]);
        let specs = extra_specs("VDU1", &caps, &subst).unwrap();
        assert_eq!(specs["hw:mem_page_size"], "large");
        assert_eq!(specs["hw:numa_cpus.0"], "0,1");
        assert_eq!(specs["hw:numa_mem.0"], "1024");
        assert_eq!(specs["hw:numa_nodes"], "1");
        assert_eq!(specs["hw:cpu_policy"], "dedicated");
        assert_eq!(specs["hw:cpu_cores"], "4");

        let flavor = flavor_resource("VDU1", &caps, &subst, &configured).unwrap();
        assert_eq!(flavor.properties["ram"], PropertyValue::Int(4096));
        match &flavor.properties["extra_specs"] {
            PropertyValue::Map(m) => assert_eq!(m["hw:cpu_policy"], PropertyValue::from("shared")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_numa_node_count_wins() {
        let descriptor = no_inputs();
        let subst = Substitution::prepare(&descriptor, None).unwrap();
        let caps = ComputeCapabilities {
            numa_node_count: Some(DescriptorValue::Int(2)),
            numa_nodes: BTreeMap::from([(
                "node0".to_string(),
                BTreeMap::from([("id".to_string(), DescriptorValue::Int(0))]),
            )]),
            ..Default::default()
        };
        let specs = extra_specs("VDU1", &caps, &subst).unwrap();
        assert_eq!(specs["hw:numa_nodes"], "2");
        assert!(!specs.contains_key("hw:numa_cpus.0"));
    }

    #[test]
    fn test_invalid_capabilities() {
        let descriptor = no_inputs();
        let subst = Substitution::prepare(&descriptor, None).unwrap();

        let caps = ComputeCapabilities {
            mem_page_size: Some(DescriptorValue::from("huge")),
            ..Default::default()
        };
        assert!(matches!(
            extra_specs("VDU1", &caps, &subst),
            Err(OrchestratorError::InvalidCapability { .. })
        ));

        let caps = ComputeCapabilities {
            cpu_allocation: BTreeMap::from([("pinning".to_string(), DescriptorValue::from("yes"))]),
            ..Default::default()
        };
        assert!(matches!(
            extra_specs("VDU1", &caps, &subst),
            Err(OrchestratorError::InvalidCapability { .. })
        ));

        let caps = ComputeCapabilities {
            numa_nodes: BTreeMap::from([(
                "node0".to_string(),
                BTreeMap::from([("cores".to_string(), DescriptorValue::Int(2))]),
            )]),
            ..Default::default()
        };
        assert!(matches!(
            extra_specs("VDU1", &caps, &subst),
            Err(OrchestratorError::InvalidCapability { .. })
        ));

        assert!(matches!(
            image_resource("VDU1", &ImageArtifact::default(), &subst),
            Err(OrchestratorError::InvalidCapability { .. })
        ));
    }

    #[test]
    fn test_image_resource() {
        let descriptor = no_inputs();
        let subst = Substitution::prepare(&descriptor, None).unwrap();
        let artifact = ImageArtifact {
            file: Some(DescriptorValue::from("http://images.local/cirros.img")),
        };
        let image = image_resource("VDU1", &artifact, &subst).unwrap();
        assert_eq!(image.resource_type, IMAGE_TYPE);
        assert_eq!(image.properties["disk_format"], PropertyValue::from("raw"));
        assert_eq!(image.properties["container_format"], PropertyValue::from("bare"));
        assert_eq!(image.properties["name"], PropertyValue::from("VDU1_image"));
    }

    #[tokio::test]
    async fn test_unsupported_property_nested_under_passthrough() {
        let catalog = StaticCatalog {
            port_properties: BTreeSet::from(["network".to_string(), "value_specs".to_string()]),
            calls: AtomicUsize::new(0),
        };
        let mut cache = CompatibilityCache::new(&catalog);

        let mut first = Resource::new("OS::Neutron::Port")
            .with("network", "net0")
            .with("port_security_enabled", false);
        let mut second = first.clone();
        cache.apply("p1", &mut first).await.unwrap();
        cache.apply("p2", &mut second).await.unwrap();

        assert!(!first.properties.contains_key("port_security_enabled"));
        assert_eq!(
            first.properties["value_specs"],
            PropertyValue::map([("port_security_enabled", PropertyValue::Bool(false))])
        );
        assert_eq!(first, second);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.lookups(), 1);
    }

    #[tokio::test]
    async fn test_supported_property_left_in_place() {
        let catalog = StaticCatalog {
            port_properties: BTreeSet::from(["network".to_string(), "port_security_enabled".to_string()]),
            calls: AtomicUsize::new(0),
        };
        let mut cache = CompatibilityCache::new(&catalog);
        let mut port = Resource::new("OS::Neutron::Port").with("port_security_enabled", false);
        cache.apply("p1", &mut port).await.unwrap();
        assert_eq!(port.properties["port_security_enabled"], PropertyValue::Bool(false));
        assert!(!port.properties.contains_key("value_specs"));
    }
}
