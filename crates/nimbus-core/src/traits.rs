//! Core traits for Nimbus
//!
//! The provisioning engine talks to its remote collaborators through these
//! interfaces ONLY. Concrete HTTP adapters and in-memory test doubles both
//! implement them.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::error::ServiceError;
use crate::types::*;

/// Result type for remote calls
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Remote orchestration service (stack engine)
#[async_trait]
pub trait OrchestrationService: Send + Sync {
    /// Submit a graph; returns the remote-assigned id
    async fn submit(&self, submission: &StackSubmission) -> Result<StackId>;

    /// Read the current status and outputs of a stack
    async fn get_stack(&self, id: &StackId) -> Result<DeployedStack>;

    /// List resources of a stack, descending into nested stacks up to `nested_depth`
    async fn list_resources(&self, id: &StackId, nested_depth: u32) -> Result<Vec<ResourceSummary>>;

    /// Read one resource, including its attributes
    async fn get_resource(&self, id: &StackId, resource_name: &str) -> Result<ResourceDetail>;

    /// Read the metadata document attached to a resource
    async fn resource_metadata(
        &self,
        id: &StackId,
        resource_name: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>>;

    /// Send a signal to a resource (e.g. a scaling policy)
    async fn signal_resource(&self, id: &StackId, resource_name: &str) -> Result<()>;

    /// Lifecycle events of one resource, most recent first
    async fn list_events(
        &self,
        id: &StackId,
        resource_name: &str,
        limit: usize,
    ) -> Result<Vec<LifecycleEvent>>;

    /// Request deletion of a stack
    async fn delete_stack(&self, id: &StackId) -> Result<()>;

    /// Describe a resource type as supported by this endpoint
    async fn resource_type_schema(&self, resource_type: &str) -> Result<ResourceTypeSchema>;
}

/// Endpoint-specific answer to "which properties does resource type T accept?"
#[async_trait]
pub trait PropertyCatalog: Send + Sync {
    async fn supported_properties(&self, resource_type: &str) -> Result<BTreeSet<String>>;
}

#[async_trait]
impl<T: OrchestrationService + ?Sized> PropertyCatalog for T {
    async fn supported_properties(&self, resource_type: &str) -> Result<BTreeSet<String>> {
        Ok(self.resource_type_schema(resource_type).await?.properties)
    }
}

/// Identity/access provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve the callable endpoint of a service category (e.g. `orchestration`)
    async fn endpoint(&self, service_type: &str, region: Option<&str>) -> Result<String>;

    /// Issue (or reuse) a short-lived bearer credential
    async fn credential(&self) -> Result<Credential>;
}

/// External workflow engine
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Register a workflow definition (native text format); returns the workflow name
    async fn create_workflow(&self, definition: &str) -> Result<String>;

    /// Start an execution of a registered workflow; returns the execution id
    async fn execute(
        &self,
        workflow_name: &str,
        input: &BTreeMap<String, serde_json::Value>,
    ) -> Result<String>;

    async fn delete_workflow(&self, workflow_name: &str) -> Result<()>;

    /// Execution ids whose workflow name contains `pattern`
    async fn list_executions(&self, pattern: &str) -> Result<Vec<String>>;

    /// Delete every execution whose workflow name contains `pattern`; returns how many
    async fn delete_executions(&self, pattern: &str) -> Result<usize>;
}
