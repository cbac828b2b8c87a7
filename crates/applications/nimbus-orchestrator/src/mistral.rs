//! Workflow engine adapter over the Mistral v2 REST API

use async_trait::async_trait;
use nimbus_core::{IdentityProvider, Result, ServiceError, WorkflowEngine};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::http::{build_client, checked, decode, transport, AUTH_TOKEN_HEADER};

/// Catalog service type of the workflow endpoint
pub const WORKFLOW_SERVICE: &str = "workflowv2";

#[derive(Debug, Deserialize)]
struct WorkflowList {
    workflows: Vec<WorkflowBody>,
}

#[derive(Debug, Deserialize)]
struct WorkflowBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ExecutionBody {
    id: String,
    #[serde(default)]
    workflow_name: String,
}

#[derive(Debug, Deserialize)]
struct ExecutionList {
    executions: Vec<ExecutionBody>,
}

fn execution_body(workflow_name: &str, input: &BTreeMap<String, Value>) -> Result<Value> {
    // The engine expects the input dictionary as an embedded JSON string
    let input = serde_json::to_string(input).map_err(|e| ServiceError::decode(e.to_string()))?;
    Ok(json!({
        "workflow_name": workflow_name,
        "input": input,
    }))
}

fn matching(executions: Vec<ExecutionBody>, pattern: &str) -> Vec<String> {
    executions
        .into_iter()
        .filter(|e| e.workflow_name.contains(pattern))
        .map(|e| e.id)
        .collect()
}

/// [`WorkflowEngine`] backed by a Mistral endpoint
pub struct MistralClient {
    identity: Arc<dyn IdentityProvider>,
    region: Option<String>,
    client: reqwest::Client,
}

impl MistralClient {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Result<Self> {
        Ok(Self {
            identity,
            region: None,
            client: build_client()?,
        })
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    async fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let endpoint = self
            .identity
            .endpoint(WORKFLOW_SERVICE, self.region.as_deref())
            .await?;
        let credential = self.identity.credential().await?;
        let url = format!("{}/{}", endpoint, path.trim_start_matches('/'));
        debug!(method = %method, url = %url, "Workflow request");
        Ok(self
            .client
            .request(method, url)
            .header(AUTH_TOKEN_HEADER, credential.token))
    }

    async fn executions(&self) -> Result<Vec<ExecutionBody>> {
        let response = self
            .request(Method::GET, "executions")
            .await?
            .send()
            .await
            .map_err(transport)?;
        let list: ExecutionList = decode(checked(response, "executions").await?).await?;
        Ok(list.executions)
    }
}

#[async_trait]
impl WorkflowEngine for MistralClient {
    async fn create_workflow(&self, definition: &str) -> Result<String> {
        let response = self
            .request(Method::POST, "workflows")
            .await?
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(definition.to_string())
            .send()
            .await
            .map_err(transport)?;
        let list: WorkflowList = decode(checked(response, "workflow create").await?).await?;
        let name = list
            .workflows
            .into_iter()
            .next()
            .map(|w| w.name)
            .ok_or_else(|| ServiceError::decode("workflow create returned no workflows"))?;
        info!(workflow = %name, "Registered workflow");
        Ok(name)
    }

    async fn execute(&self, workflow_name: &str, input: &BTreeMap<String, Value>) -> Result<String> {
        let response = self
            .request(Method::POST, "executions")
            .await?
            .json(&execution_body(workflow_name, input)?)
            .send()
            .await
            .map_err(transport)?;
        let execution: ExecutionBody = decode(checked(response, "execution create").await?).await?;
        info!(workflow = %workflow_name, execution_id = %execution.id, "Started execution");
        Ok(execution.id)
    }

    async fn delete_workflow(&self, workflow_name: &str) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("workflows/{}", workflow_name))
            .await?
            .send()
            .await
            .map_err(transport)?;
        checked(response, &format!("workflow {}", workflow_name)).await?;
        Ok(())
    }

    async fn list_executions(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(matching(self.executions().await?, pattern))
    }

    async fn delete_executions(&self, pattern: &str) -> Result<usize> {
        let mut deleted = 0;
        for id in matching(self.executions().await?, pattern) {
            let response = self
                .request(Method::DELETE, &format!("executions/{}", id))
                .await?
                .send()
                .await
                .map_err(transport)?;
            match checked(response, &format!("execution {}", id)).await {
                Ok(_) => deleted += 1,
                Err(e) if e.is_not_found() => {
                    warn!(execution_id = %id, "Execution vanished before deletion");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}
