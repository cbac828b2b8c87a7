//! Orchestration service adapter over the Heat REST API
//!
//! Resource-level paths need the canonical `stacks/<name>/<id>` form; the
//! stack name is looked up once per id and cached.

use async_trait::async_trait;
use nimbus_core::{
    DeployedStack, IdentityProvider, LifecycleEvent, OrchestrationService, ResourceDetail,
    ResourceSummary, ResourceTypeSchema, Result, ServiceError, StackId, StackOutput, StackStatus,
    StackSubmission,
};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::http::{build_client, checked, decode, parse_time, transport, AUTH_TOKEN_HEADER};

/// Catalog service type of the orchestration endpoint
pub const ORCHESTRATION_SERVICE: &str = "orchestration";

#[derive(Debug, Deserialize)]
struct CreatedStack {
    stack: CreatedStackBody,
}

#[derive(Debug, Deserialize)]
struct CreatedStackBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StackEnvelope {
    stack: StackBody,
}

#[derive(Debug, Deserialize)]
struct StackBody {
    id: String,
    stack_name: String,
    stack_status: String,
    #[serde(default)]
    stack_status_reason: Option<String>,
    #[serde(default)]
    outputs: Option<Vec<OutputBody>>,
}

#[derive(Debug, Deserialize)]
struct OutputBody {
    output_key: String,
    #[serde(default)]
    output_value: Value,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceList {
    resources: Vec<ResourceBody>,
}

#[derive(Debug, Deserialize)]
struct ResourceEnvelope {
    resource: ResourceBody,
}

#[derive(Debug, Deserialize)]
struct ResourceBody {
    resource_name: String,
    #[serde(default)]
    physical_resource_id: String,
    resource_type: String,
    resource_status: String,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct MetadataEnvelope {
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct EventList {
    events: Vec<EventBody>,
}

#[derive(Debug, Deserialize)]
struct EventBody {
    id: String,
    resource_name: String,
    resource_status: String,
    #[serde(default)]
    resource_status_reason: Option<String>,
    #[serde(default)]
    event_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TypeSchemaBody {
    resource_type: String,
    #[serde(default)]
    properties: Map<String, Value>,
}

impl StackBody {
    fn into_deployed(self) -> Result<DeployedStack> {
        let status: StackStatus = self
            .stack_status
            .parse()
            .map_err(ServiceError::decode)?;
        Ok(DeployedStack {
            id: StackId::new(self.id),
            name: self.stack_name,
            status,
            status_reason: self.stack_status_reason,
            outputs: self
                .outputs
                .unwrap_or_default()
                .into_iter()
                .map(|o| StackOutput {
                    key: o.output_key,
                    value: o.output_value,
                    description: o.description,
                })
                .collect(),
        })
    }
}

impl From<ResourceBody> for ResourceDetail {
    fn from(body: ResourceBody) -> Self {
        Self {
            name: body.resource_name,
            physical_id: body.physical_resource_id,
            resource_type: body.resource_type,
            status: body.resource_status,
            attributes: body.attributes,
        }
    }
}

impl From<EventBody> for LifecycleEvent {
    fn from(body: EventBody) -> Self {
        Self {
            id: body.id,
            resource_name: body.resource_name,
            status: body.resource_status,
            status_reason: body.resource_status_reason,
            event_time: body.event_time.as_deref().and_then(parse_time),
        }
    }
}

fn submission_body(submission: &StackSubmission) -> Value {
    let mut body = json!({
        "stack_name": submission.stack_name,
        "template": submission.template,
        "files": submission.files,
        "parameters": submission.parameters,
        "disable_rollback": submission.disable_rollback,
    });
    if let (Some(mins), Some(map)) = (submission.timeout_mins, body.as_object_mut()) {
        map.insert("timeout_mins".to_string(), json!(mins));
    }
    body
}

/// [`OrchestrationService`] backed by a Heat endpoint
pub struct HeatClient {
    identity: Arc<dyn IdentityProvider>,
    region: Option<String>,
    client: reqwest::Client,
    stack_paths: Mutex<HashMap<StackId, String>>,
}

impl HeatClient {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        Ok(Self {
            identity,
            region: None,
            client: build_client()?,
            stack_paths: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve the endpoint in `region` instead of the session default
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    async fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let endpoint = self
            .identity
            .endpoint(ORCHESTRATION_SERVICE, self.region.as_deref())
            .await?;
        let credential = self.identity.credential().await?;
        let url = format!("{}/{}", endpoint, path.trim_start_matches('/'));
        debug!(method = %method, url = %url, "Orchestration request");
        Ok(self
            .client
            .request(method, url)
            .header(AUTH_TOKEN_HEADER, credential.token))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let response = self
            .request(Method::GET, path)
            .await?
            .send()
            .await
            .map_err(transport)?;
        decode(checked(response, what).await?).await
    }

    async fn fetch_stack(&self, id: &StackId) -> Result<StackBody> {
        let envelope: StackEnvelope = self
            .get_json(&format!("stacks/{}", id), &format!("stack {}", id))
            .await?;
        Ok(envelope.stack)
    }

    /// `stacks/<name>/<id>`
    async fn stack_path(&self, id: &StackId) -> Result<String> {
        if let Some(path) = self.stack_paths.lock().await.get(id) {
            return Ok(path.clone());
        }
        let stack = self.fetch_stack(id).await?;
        let path = format!("stacks/{}/{}", stack.stack_name, stack.id);
        self.stack_paths.lock().await.insert(id.clone(), path.clone());
        Ok(path)
    }
}

#[async_trait]
impl OrchestrationService for HeatClient {
    async fn submit(&self, submission: &StackSubmission) -> Result<StackId> {
        let response = self
            .request(Method::POST, "stacks")
            .await?
            .json(&submission_body(submission))
            .send()
            .await
            .map_err(transport)?;
        let created: CreatedStack = decode(checked(response, "stack create").await?).await?;
        let id = StackId::new(created.stack.id);
        self.stack_paths.lock().await.insert(
            id.clone(),
            format!("stacks/{}/{}", submission.stack_name, id),
        );
        Ok(id)
    }

    async fn get_stack(&self, id: &StackId) -> Result<DeployedStack> {
        self.fetch_stack(id).await?.into_deployed()
    }

    async fn list_resources(&self, id: &StackId, nested_depth: u32) -> Result<Vec<ResourceSummary>> {
        let path = format!("{}/resources?nested_depth={}", self.stack_path(id).await?, nested_depth);
        let list: ResourceList = self.get_json(&path, &format!("resources of {}", id)).await?;
        Ok(list
            .resources
            .into_iter()
            .map(|r| ResourceSummary {
                name: r.resource_name,
                physical_id: r.physical_resource_id,
                resource_type: r.resource_type,
                status: r.resource_status,
            })
            .collect())
    }

    async fn get_resource(&self, id: &StackId, resource_name: &str) -> Result<ResourceDetail> {
        let path = format!("{}/resources/{}", self.stack_path(id).await?, resource_name);
        let envelope: ResourceEnvelope = self
            .get_json(&path, &format!("resource {} of {}", resource_name, id))
            .await?;
        Ok(envelope.resource.into())
    }

    async fn resource_metadata(&self, id: &StackId, resource_name: &str) -> Result<BTreeMap<String, Value>> {
        let path = format!("{}/resources/{}/metadata", self.stack_path(id).await?, resource_name);
        let envelope: MetadataEnvelope = self
            .get_json(&path, &format!("metadata of {} in {}", resource_name, id))
            .await?;
        Ok(envelope.metadata)
    }

    async fn signal_resource(&self, id: &StackId, resource_name: &str) -> Result<()> {
        let path = format!("{}/resources/{}/signal", self.stack_path(id).await?, resource_name);
        let response = self
            .request(Method::POST, &path)
            .await?
            .send()
            .await
            .map_err(transport)?;
        checked(response, &format!("signal {} of {}", resource_name, id)).await?;
        Ok(())
    }

    async fn list_events(&self, id: &StackId, resource_name: &str, limit: usize) -> Result<Vec<LifecycleEvent>> {
        let path = format!(
            "{}/resources/{}/events?sort_keys=event_time&sort_dir=desc&limit={}",
            self.stack_path(id).await?,
            resource_name,
            limit
        );
        let list: EventList = self
            .get_json(&path, &format!("events of {} in {}", resource_name, id))
            .await?;
        Ok(list.events.into_iter().map(Into::into).collect())
    }

    async fn delete_stack(&self, id: &StackId) -> Result<()> {
        let path = self.stack_path(id).await?;
        let response = self
            .request(Method::DELETE, &path)
            .await?
            .send()
            .await
            .map_err(transport)?;
        checked(response, &format!("stack {}", id)).await?;
        Ok(())
    }

    async fn resource_type_schema(&self, resource_type: &str) -> Result<ResourceTypeSchema> {
        let body: TypeSchemaBody = self
            .get_json(
                &format!("resource_types/{}", resource_type),
                &format!("resource type {}", resource_type),
            )
            .await?;
        Ok(ResourceTypeSchema {
            resource_type: body.resource_type,
            properties: body.properties.into_iter().map(|(name, _)| name).collect(),
        })
    }
}
