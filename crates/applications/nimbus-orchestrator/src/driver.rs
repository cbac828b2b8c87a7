//! Orchestration driver
//!
//! Submits resource graphs and drives the resulting stacks through their
//! create/scale/delete lifecycles by polling the remote service.
//!
//! ## State machine
//!
//! ```text
//! SUBMITTED ──► IN_PROGRESS ──► COMPLETE
//!                    │
//!                    └────────► FAILED
//! ```
//!
//! Every transition is observed remotely; the driver keeps no state between
//! calls. Each wait polls on a fixed interval for at most `retries` polls:
//!
//! - a transport error is logged and the poll counts as "still in progress"
//! - budget exhaustion is a `*TimedOut` error carrying the last status seen
//! - a remote-reported failure is a `*Failed` error carrying the remote reason
//!
//! Callers must keep these apart: a timeout may still complete remotely, a
//! failure will not.

use futures::future::join_all;
use futures::{Stream, StreamExt};
use nimbus_core::{
    DeployedStack, LifecycleEvent, OrchestrationService, ServiceError, StackAction, StackId,
    StackState, StackStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::graph::ResourceGraph;
use crate::network::strip_management_prefix;
use crate::scaling::{policy_resource_name, ScaleDirection, ScalingGroupBinding};

/// Default number of polls per wait
pub const DEFAULT_STACK_RETRIES: u32 = 60;

/// Default seconds between polls
pub const DEFAULT_STACK_RETRY_WAIT_SECS: u64 = 10;

/// Event status of a processed scaling signal
pub const SIGNAL_COMPLETE: &str = "SIGNAL_COMPLETE";

/// Event status of a rejected scaling signal
pub const SIGNAL_FAILED: &str = "SIGNAL_FAILED";

/// Metadata flag set on a scaling policy while it is acting
pub const SCALING_IN_PROGRESS_KEY: &str = "scaling_in_progress";

/// Nested depth used for resource inventories
const INVENTORY_NESTED_DEPTH: u32 = 2;

/// Bounded polling budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Maximum number of polls
    pub retries: u32,
    /// Fixed wait between polls
    pub interval: Duration,
}

impl RetryBudget {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(
            DEFAULT_STACK_RETRIES,
            Duration::from_secs(DEFAULT_STACK_RETRY_WAIT_SECS),
        )
    }
}

/// Configuration for the orchestration driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Polls per wait
    pub stack_retries: u32,
    /// Seconds between polls
    pub stack_retry_wait_secs: u64,
    /// Remote-side creation timeout, if any
    pub timeout_mins: Option<u32>,
    /// Keep failed stacks around for inspection
    pub disable_rollback: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            stack_retries: DEFAULT_STACK_RETRIES,
            stack_retry_wait_secs: DEFAULT_STACK_RETRY_WAIT_SECS,
            timeout_mins: None,
            disable_rollback: false,
        }
    }
}

impl DriverConfig {
    /// Set polls per wait
    pub fn with_stack_retries(mut self, retries: u32) -> Self {
        self.stack_retries = retries;
        self
    }

    /// Set seconds between polls
    pub fn with_retry_wait_secs(mut self, secs: u64) -> Self {
        self.stack_retry_wait_secs = secs;
        self
    }

    /// Set remote-side creation timeout
    pub fn with_timeout_mins(mut self, mins: u32) -> Self {
        self.timeout_mins = Some(mins);
        self
    }

    /// Budget derived from this configuration
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(
            self.stack_retries,
            Duration::from_secs(self.stack_retry_wait_secs),
        )
    }
}

/// Request to signal one scaling policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub policy_name: String,
    pub direction: ScaleDirection,
}

impl ScaleRequest {
    pub fn new(policy_name: impl Into<String>, direction: ScaleDirection) -> Self {
        Self {
            policy_name: policy_name.into(),
            direction,
        }
    }
}

/// Id of the latest lifecycle event of a policy resource before signalling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalToken(pub Option<String>);

/// Entry of a resource inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub physical_id: String,
    pub resource_type: String,
}

/// One poll of a stack's status
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// The stack was read
    Status(DeployedStack),
    /// The stack no longer exists
    Gone,
    /// The read failed for another reason
    Unreachable(ServiceError),
}

enum WaitOutcome {
    Settled(DeployedStack),
    Gone,
    Exhausted(Option<StackStatus>),
}

/// Drives stacks through their lifecycles
pub struct OrchestrationDriver {
    service: Arc<dyn OrchestrationService>,
    config: DriverConfig,
}

impl OrchestrationDriver {
    pub fn new(service: Arc<dyn OrchestrationService>, config: DriverConfig) -> Self {
        Self { service, config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Budget from the driver configuration
    pub fn default_budget(&self) -> RetryBudget {
        self.config.budget()
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Submit `graph` as stack `name`
    ///
    /// A synchronous refusal is `SubmissionRejected`; nothing was created.
    pub async fn create(&self, name: &str, graph: &ResourceGraph) -> Result<StackId> {
        let mut submission = graph.to_submission(name)?;
        submission.timeout_mins = self.config.timeout_mins;
        submission.disable_rollback = self.config.disable_rollback;

        info!(
            stack_name = %name,
            resources = graph.len(),
            nested_templates = submission.files.len(),
            "Submitting stack"
        );

        match self.service.submit(&submission).await {
            Ok(stack_id) => {
                info!(stack_id = %stack_id, stack_name = %name, "Stack submitted");
                Ok(stack_id)
            }
            Err(e) => {
                error!(stack_name = %name, error = %e, "Stack submission rejected");
                Err(OrchestratorError::SubmissionRejected {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Wait for creation to finish; returns management outputs, prefix stripped
    pub async fn wait_create(
        &self,
        stack_id: &StackId,
        budget: RetryBudget,
    ) -> Result<BTreeMap<String, Value>> {
        let stack = self.wait_created(stack_id, budget).await?;
        let outputs = management_outputs(&stack);
        info!(
            stack_id = %stack_id,
            endpoints = outputs.len(),
            "Stack created"
        );
        Ok(outputs)
    }

    /// Wait for creation of a stack whose computes live in scaling groups
    ///
    /// Management endpoints are collected from every group member.
    pub async fn wait_create_grouped(
        &self,
        stack_id: &StackId,
        bindings: &ScalingGroupBinding,
        budget: RetryBudget,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let stack = self.wait_created(stack_id, budget).await?;
        let mut endpoints: BTreeMap<String, Vec<Value>> = management_outputs(&stack)
            .into_iter()
            .map(|(k, v)| (k, vec![v]))
            .collect();
        let members = self.member_endpoints(stack_id, bindings.groups()).await?;
        for (component, addresses) in members {
            endpoints.entry(component).or_default().extend(addresses);
        }
        Ok(endpoints)
    }

    async fn wait_created(&self, stack_id: &StackId, budget: RetryBudget) -> Result<DeployedStack> {
        info!(
            stack_id = %stack_id,
            retries = budget.retries,
            interval = ?budget.interval,
            "Waiting for stack creation"
        );

        match self.wait_until_settled(stack_id, budget, |s| !s.is_in_progress()).await {
            WaitOutcome::Settled(stack) if stack.status.is_complete(&StackAction::Create) => Ok(stack),
            WaitOutcome::Settled(stack) => {
                let reason = stack
                    .status_reason
                    .clone()
                    .unwrap_or_else(|| stack.status.to_string());
                error!(stack_id = %stack_id, status = %stack.status, reason = %reason, "Stack creation failed");
                Err(OrchestratorError::CreateFailed {
                    stack_id: stack_id.clone(),
                    reason,
                })
            }
            WaitOutcome::Gone => Err(OrchestratorError::CreateFailed {
                stack_id: stack_id.clone(),
                reason: format!("stack {} disappeared while being created", stack_id),
            }),
            WaitOutcome::Exhausted(last_status) => {
                warn!(stack_id = %stack_id, last_status = ?last_status, "Stack creation timed out");
                Err(OrchestratorError::CreateTimedOut {
                    stack_id: stack_id.clone(),
                    last_status,
                })
            }
        }
    }

    // ========================================================================
    // Scale
    // ========================================================================

    fn policy_resource(&self, bindings: &ScalingGroupBinding, request: &ScaleRequest) -> Result<String> {
        bindings
            .group(&request.policy_name)
            .ok_or_else(|| OrchestratorError::UnknownScalingPolicy(request.policy_name.clone()))?;
        Ok(policy_resource_name(&request.policy_name, request.direction))
    }

    /// Signal the scaling policy named by `request`
    ///
    /// Returns the id of the policy resource's latest event before the signal,
    /// so [`Self::wait_scale`] can tell new events from old ones.
    pub async fn scale(
        &self,
        stack_id: &StackId,
        bindings: &ScalingGroupBinding,
        request: &ScaleRequest,
    ) -> Result<SignalToken> {
        let resource = self.policy_resource(bindings, request)?;

        let events = self.service.list_events(stack_id, &resource, 1).await?;
        let token = SignalToken(events.first().map(|e| e.id.clone()));

        self.service.signal_resource(stack_id, &resource).await?;
        info!(
            stack_id = %stack_id,
            policy = %resource,
            token = ?token.0,
            "Scaling policy signalled"
        );
        Ok(token)
    }

    /// Wait for the signal sent by [`Self::scale`] to be processed
    ///
    /// Returns management endpoints of every member of the scaled group.
    pub async fn wait_scale(
        &self,
        stack_id: &StackId,
        bindings: &ScalingGroupBinding,
        request: &ScaleRequest,
        token: &SignalToken,
        budget: RetryBudget,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let resource = self.policy_resource(bindings, request)?;
        let mut last_status: Option<String> = None;
        let mut completed = false;

        for attempt in 1..=budget.retries {
            match self.service.list_events(stack_id, &resource, 1).await {
                Ok(events) => match events.first().filter(|e| Some(&e.id) != token.0.as_ref()) {
                    Some(event) if event.status == SIGNAL_COMPLETE => {
                        completed = true;
                        break;
                    }
                    Some(event) if event.status == SIGNAL_FAILED => {
                        return Err(scale_failed(stack_id, event));
                    }
                    Some(event) => {
                        debug!(attempt, status = %event.status, "Signal still being processed");
                        last_status = Some(event.status.clone());
                    }
                    None => debug!(attempt, policy = %resource, "No new lifecycle event yet"),
                },
                Err(e) => {
                    warn!(stack_id = %stack_id, attempt, error = %e, "Failed to read lifecycle events, will retry");
                }
            }
            if attempt < budget.retries {
                tokio::time::sleep(budget.interval).await;
            }
        }

        if !completed {
            let in_progress = match self.service.resource_metadata(stack_id, &resource).await {
                Ok(metadata) => metadata
                    .get(SCALING_IN_PROGRESS_KEY)
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
                Err(e) => {
                    warn!(stack_id = %stack_id, error = %e, "Failed to read scaling policy metadata");
                    true
                }
            };
            if in_progress {
                return Err(OrchestratorError::ScaleTimedOut {
                    stack_id: stack_id.clone(),
                    last_status,
                });
            }
            // Heuristic: the remote service coalesced the signal inside its
            // cool-down window and emitted no event for it.
            warn!(
                stack_id = %stack_id,
                policy = %resource,
                "No completion event within budget but policy is idle, treating signal as coalesced"
            );
        }

        let group = bindings
            .group(&request.policy_name)
            .ok_or_else(|| OrchestratorError::UnknownScalingPolicy(request.policy_name.clone()))?;
        let endpoints = self.member_endpoints(stack_id, std::iter::once(group)).await?;
        info!(
            stack_id = %stack_id,
            policy = %resource,
            components = endpoints.len(),
            "Scaling completed"
        );
        Ok(endpoints)
    }

    /// Management attributes of every member of `groups`, aggregated per component
    async fn member_endpoints<'g>(
        &self,
        stack_id: &StackId,
        groups: impl Iterator<Item = &'g str>,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let mut endpoints: BTreeMap<String, Vec<Value>> = BTreeMap::new();

        for group in groups {
            let group_resource = self.service.get_resource(stack_id, group).await?;
            let nested = StackId::new(group_resource.physical_id);
            let members = self.service.list_resources(&nested, 0).await?;
            debug!(group = %group, members = members.len(), "Resolving group members");

            let details = join_all(
                members
                    .iter()
                    .map(|member| self.service.get_resource(&nested, &member.name)),
            )
            .await;

            for detail in details {
                for (key, value) in detail?.attributes {
                    if let Some(component) = strip_management_prefix(&key) {
                        endpoints.entry(component.to_string()).or_default().push(value);
                    }
                }
            }
        }
        Ok(endpoints)
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Request deletion; a stack that is already gone counts as deleted
    pub async fn delete(&self, stack_id: &StackId) -> Result<()> {
        match self.service.delete_stack(stack_id).await {
            Ok(()) => {
                info!(stack_id = %stack_id, "Stack deletion requested");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(stack_id = %stack_id, "Stack already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for deletion to finish; not found at any poll is success
    pub async fn wait_delete(&self, stack_id: &StackId, budget: RetryBudget) -> Result<()> {
        let settled = |s: &StackStatus| s.action == StackAction::Delete && !s.is_in_progress();
        match self.wait_until_settled(stack_id, budget, settled).await {
            WaitOutcome::Gone => {
                info!(stack_id = %stack_id, "Stack deleted");
                Ok(())
            }
            WaitOutcome::Settled(stack) if stack.status.state == StackState::Complete => {
                info!(stack_id = %stack_id, "Stack deleted");
                Ok(())
            }
            WaitOutcome::Settled(stack) => Err(OrchestratorError::DeleteFailed {
                stack_id: stack_id.clone(),
                reason: stack
                    .status_reason
                    .unwrap_or_else(|| stack.status.to_string()),
            }),
            WaitOutcome::Exhausted(last_status) => {
                warn!(stack_id = %stack_id, last_status = ?last_status, "Stack deletion timed out");
                Err(OrchestratorError::DeleteTimedOut {
                    stack_id: stack_id.clone(),
                    last_status,
                })
            }
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Resource name → physical id and type, including nested stacks
    pub async fn resource_inventory(&self, stack_id: &StackId) -> Result<BTreeMap<String, InventoryEntry>> {
        let resources = self
            .service
            .list_resources(stack_id, INVENTORY_NESTED_DEPTH)
            .await?;
        Ok(resources
            .into_iter()
            .map(|r| {
                (
                    r.name,
                    InventoryEntry {
                        physical_id: r.physical_id,
                        resource_type: r.resource_type,
                    },
                )
            })
            .collect())
    }

    /// Stream of stack status observations, at most `budget.retries` of them
    pub fn observe(
        &self,
        stack_id: &StackId,
        budget: RetryBudget,
    ) -> Pin<Box<dyn Stream<Item = Observation> + Send>> {
        let service = Arc::clone(&self.service);
        let stack_id = stack_id.clone();

        Box::pin(async_stream::stream! {
            for attempt in 1..=budget.retries {
                match service.get_stack(&stack_id).await {
                    Ok(stack) => yield Observation::Status(stack),
                    Err(e) if e.is_not_found() => yield Observation::Gone,
                    Err(e) => yield Observation::Unreachable(e),
                }
                if attempt < budget.retries {
                    tokio::time::sleep(budget.interval).await;
                }
            }
        })
    }

    async fn wait_until_settled<F>(&self, stack_id: &StackId, budget: RetryBudget, settled: F) -> WaitOutcome
    where
        F: Fn(&StackStatus) -> bool,
    {
        let mut observations = self.observe(stack_id, budget);
        let mut last_status = None;

        while let Some(observation) = observations.next().await {
            match observation {
                Observation::Status(stack) if settled(&stack.status) => return WaitOutcome::Settled(stack),
                Observation::Status(stack) => {
                    debug!(stack_id = %stack_id, status = %stack.status, "Stack not settled yet");
                    last_status = Some(stack.status);
                }
                Observation::Gone => return WaitOutcome::Gone,
                Observation::Unreachable(e) => {
                    warn!(stack_id = %stack_id, error = %e, "Failed to read stack status, will retry");
                }
            }
        }
        WaitOutcome::Exhausted(last_status)
    }
}

fn scale_failed(stack_id: &StackId, event: &LifecycleEvent) -> OrchestratorError {
    OrchestratorError::ScaleFailed {
        stack_id: stack_id.clone(),
        reason: event
            .status_reason
            .clone()
            .unwrap_or_else(|| event.status.clone()),
    }
}

/// Reserved-prefix outputs of `stack`, prefix stripped, values unmodified
pub fn management_outputs(stack: &DeployedStack) -> BTreeMap<String, Value> {
    stack
        .outputs
        .iter()
        .filter_map(|output| {
            strip_management_prefix(&output.key).map(|component| (component.to_string(), output.value.clone()))
        })
        .collect()
}
