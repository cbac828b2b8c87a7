//! Network synthesizer
//!
//! One port resource per network requirement per compute component. A
//! requirement flagged as the primary management path also registers an
//! output under the reserved `mgmt_ip-` prefix, keyed by the owning compute,
//! so the driver can find a reachable address without knowing the workload.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::descriptor::VnicKind;
use crate::error::{OrchestratorError, Result};
use crate::graph::{Output, PropertyValue, Resource};

/// Port resource type
pub const PORT_TYPE: &str = "OS::Neutron::Port";

/// Reserved output prefix for management addresses
pub const MGMT_OUTPUT_PREFIX: &str = "mgmt_ip-";

/// Name of the port for an inline network requirement
pub fn port_name(compute: &str, network: &str) -> String {
    format!("{}-{}-port", compute, network)
}

/// Name of the management output of `compute`
pub fn management_output_name(compute: &str) -> String {
    format!("{}{}", MGMT_OUTPUT_PREFIX, compute)
}

/// Strip the reserved prefix, if present
pub fn strip_management_prefix(output: &str) -> Option<&str> {
    output.strip_prefix(MGMT_OUTPUT_PREFIX)
}

/// Everything needed to emit one port
#[derive(Debug, Clone)]
pub struct PortRequest {
    /// Resource name of the port
    pub name: String,
    /// Owning compute component
    pub compute: String,
    /// Network label, used in errors
    pub network_label: String,
    /// Value of the `network` property
    pub network: PropertyValue,
    pub management: bool,
    /// Resolved static addresses
    pub addresses: Option<Value>,
    pub anti_spoofing: Option<bool>,
    pub vnic: Option<VnicKind>,
    /// Extra properties copied verbatim (override defaults)
    pub extra: BTreeMap<String, PropertyValue>,
}

impl PortRequest {
    pub fn new(name: impl Into<String>, compute: impl Into<String>, network: impl Into<String>) -> Self {
        let network = network.into();
        Self {
            name: name.into(),
            compute: compute.into(),
            network_label: network.clone(),
            network: PropertyValue::String(network),
            management: false,
            addresses: None,
            anti_spoofing: None,
            vnic: None,
            extra: BTreeMap::new(),
        }
    }
}

/// A synthesized port plus its management output, if any
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedPort {
    pub name: String,
    pub resource: Resource,
    pub management_output: Option<(String, Output)>,
}

/// Build the port resource for one requirement
pub fn synthesize_port(request: PortRequest) -> Result<SynthesizedPort> {
    let mut port = Resource::new(PORT_TYPE)
        .with("network", request.network)
        .with("port_security_enabled", request.anti_spoofing.unwrap_or(false));

    if let Some(vnic) = request.vnic {
        port = port.with("binding:vnic_type", vnic.binding());
    }

    if let Some(addresses) = request.addresses {
        let Value::Array(addresses) = addresses else {
            return Err(OrchestratorError::InvalidNetworkAddressList {
                component: request.compute,
                network: request.network_label,
            });
        };
        let fixed_ips = addresses
            .into_iter()
            .map(|address| PropertyValue::map([("ip_address", PropertyValue::from(address))]))
            .collect();
        port = port.with("fixed_ips", PropertyValue::List(fixed_ips));
    }

    for (key, value) in request.extra {
        port.properties.insert(key, value);
    }

    let management_output = request.management.then(|| {
        (
            management_output_name(&request.compute),
            Output {
                resource: request.name.clone(),
                path: vec!["fixed_ips".to_string(), "0".to_string(), "ip_address".to_string()],
                description: Some(format!("management ip address of {}", request.compute)),
            },
        )
    });

    Ok(SynthesizedPort {
        name: request.name,
        resource: port,
        management_output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_port_naming() {
        assert_eq!(port_name("VDU1", "net_mgmt"), "VDU1-net_mgmt-port");
        assert_eq!(management_output_name("VDU1"), "mgmt_ip-VDU1");
        assert_eq!(strip_management_prefix("mgmt_ip-VDU1"), Some("VDU1"));
        assert_eq!(strip_management_prefix("other"), None);
    }

    #[test]
    fn test_management_port_registers_output() {
        let mut request = PortRequest::new(port_name("VDU1", "net_mgmt"), "VDU1", "net_mgmt");
        request.management = true;
        let port = synthesize_port(request).unwrap();

        assert_eq!(port.resource.resource_type, PORT_TYPE);
        assert_eq!(
            port.resource.properties["port_security_enabled"],
            PropertyValue::Bool(false)
        );
        let (name, output) = port.management_output.unwrap();
        assert_eq!(name, "mgmt_ip-VDU1");
        assert_eq!(output.resource, "VDU1-net_mgmt-port");
    }

    #[test]
    fn test_static_addresses_expand_to_fixed_ips() {
        let mut request = PortRequest::new("p", "VDU1", "net0");
        request.addresses = Some(json!(["10.0.0.5", "10.0.0.6"]));
        let port = synthesize_port(request).unwrap();
        assert_eq!(
            serde_json::Value::from(port.resource.properties["fixed_ips"].clone()),
            json!([{"ip_address": "10.0.0.5"}, {"ip_address": "10.0.0.6"}])
        );
        assert!(port.management_output.is_none());
    }

    #[test]
    fn test_non_list_addresses_rejected() {
        let mut request = PortRequest::new("p", "VDU1", "net0");
        request.addresses = Some(json!("10.0.0.5"));
        let err = synthesize_port(request).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidNetworkAddressList { ref component, ref network }
                if component == "VDU1" && network == "net0"
        ));
    }

    #[test]
    fn test_connection_point_conversions() {
        let mut request = PortRequest::new("CP1", "VDU1", "net0");
        request.anti_spoofing = Some(true);
        request.vnic = Some(VnicKind::Sriov);
        let port = synthesize_port(request).unwrap();
        assert_eq!(port.resource.properties["port_security_enabled"], PropertyValue::Bool(true));
        assert_eq!(port.resource.properties["binding:vnic_type"], PropertyValue::from("direct"));
    }
}
