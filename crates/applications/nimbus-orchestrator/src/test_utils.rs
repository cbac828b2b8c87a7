//! In-memory orchestration service for tests
//!
//! [`FakeOrchestrationService`] answers every [`OrchestrationService`] call
//! from scripted state. Stack status reads replay a per-stack script; the last
//! entry repeats once the script is exhausted.

use async_trait::async_trait;
use nimbus_core::{
    DeployedStack, LifecycleEvent, OrchestrationService, ResourceDetail, ResourceSummary,
    ResourceTypeSchema, Result, ServiceError, StackAction, StackId, StackOutput, StackState,
    StackStatus, StackSubmission,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// Properties a current endpoint accepts on ports
const MODERN_PORT_PROPERTIES: &[&str] = &[
    "network",
    "fixed_ips",
    "port_security_enabled",
    "binding:vnic_type",
    "value_specs",
    "security_groups",
    "mac_address",
];

/// One scripted answer to a stack status read
#[derive(Debug, Clone, PartialEq)]
pub enum FakePoll {
    Status(StackStatus, Option<String>),
    TransportError,
    NotFound,
}

impl FakePoll {
    pub fn in_progress(action: StackAction) -> Self {
        Self::Status(StackStatus::new(action, StackState::InProgress), None)
    }

    pub fn complete(action: StackAction) -> Self {
        Self::Status(StackStatus::new(action, StackState::Complete), None)
    }

    pub fn failed(action: StackAction, reason: impl Into<String>) -> Self {
        Self::Status(StackStatus::new(action, StackState::Failed), Some(reason.into()))
    }
}

#[derive(Default)]
struct FakeStack {
    name: String,
    polls: VecDeque<FakePoll>,
    delete_polls: Option<Vec<FakePoll>>,
    poll_count: usize,
    outputs: Vec<StackOutput>,
}

#[derive(Default)]
struct FakeState {
    next_id: u32,
    reject_reason: Option<String>,
    submissions: Vec<StackSubmission>,
    stacks: BTreeMap<StackId, FakeStack>,
    resources: BTreeMap<StackId, BTreeMap<String, ResourceDetail>>,
    metadata: BTreeMap<(StackId, String), BTreeMap<String, Value>>,
    events: BTreeMap<(StackId, String), Vec<LifecycleEvent>>,
    on_signal: BTreeMap<(StackId, String), LifecycleEvent>,
    event_read_failures: usize,
    signals: Vec<(StackId, String)>,
    schemas: BTreeMap<String, BTreeSet<String>>,
    schema_lookups: usize,
}

/// Scripted in-memory [`OrchestrationService`]
#[derive(Default)]
pub struct FakeOrchestrationService {
    state: Mutex<FakeState>,
}

fn event(id: &str, resource: &str, status: &str) -> LifecycleEvent {
    LifecycleEvent {
        id: id.to_string(),
        resource_name: resource.to_string(),
        status: status.to_string(),
        status_reason: Some(format!("{} {}", resource, status)),
        event_time: Some(chrono::Utc::now()),
    }
}

impl FakeOrchestrationService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare the properties `resource_type` supports (builder style)
    pub fn with_schema<I, P>(self, resource_type: &str, properties: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.state().schemas.insert(
            resource_type.to_string(),
            properties.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Refuse every submission with `reason` (builder style)
    pub fn reject_submissions(self, reason: impl Into<String>) -> Self {
        self.state().reject_reason = Some(reason.into());
        self
    }

    /// Replace the status script of `stack`
    pub fn script_polls(&self, stack: &StackId, polls: Vec<FakePoll>) {
        self.state().stacks.entry(stack.clone()).or_default().polls = polls.into();
    }

    /// Status script that takes over once `stack` is deleted
    pub fn script_delete_polls(&self, stack: &StackId, polls: Vec<FakePoll>) {
        self.state().stacks.entry(stack.clone()).or_default().delete_polls = Some(polls);
    }

    pub fn set_outputs(&self, stack: &StackId, outputs: Vec<(&str, Value)>) {
        self.state().stacks.entry(stack.clone()).or_default().outputs = outputs
            .into_iter()
            .map(|(key, value)| StackOutput {
                key: key.to_string(),
                value,
                description: None,
            })
            .collect();
    }

    /// Register a resource of `stack` (or of a nested stack, by its id)
    pub fn add_resource(&self, stack: &StackId, detail: ResourceDetail) {
        self.state()
            .resources
            .entry(stack.clone())
            .or_default()
            .insert(detail.name.clone(), detail);
    }

    pub fn set_resource_metadata(&self, stack: &StackId, resource: &str, metadata: BTreeMap<String, Value>) {
        self.state()
            .metadata
            .insert((stack.clone(), resource.to_string()), metadata);
    }

    /// Record a lifecycle event that already happened
    pub fn push_event(&self, stack: &StackId, resource: &str, id: &str, status: &str) {
        self.state()
            .events
            .entry((stack.clone(), resource.to_string()))
            .or_default()
            .insert(0, event(id, resource, status));
    }

    /// Emit an event when `resource` is signalled
    pub fn on_signal(&self, stack: &StackId, resource: &str, id: &str, status: &str) {
        self.state()
            .on_signal
            .insert((stack.clone(), resource.to_string()), event(id, resource, status));
    }

    /// Fail the next `count` event reads with a transport error
    pub fn fail_event_reads(&self, count: usize) {
        self.state().event_read_failures = count;
    }

    pub fn submissions(&self) -> Vec<StackSubmission> {
        self.state().submissions.clone()
    }

    pub fn signals(&self) -> Vec<(StackId, String)> {
        self.state().signals.clone()
    }

    /// Number of status reads of `stack`
    pub fn polls(&self, stack: &StackId) -> usize {
        self.state().stacks.get(stack).map_or(0, |s| s.poll_count)
    }

    /// Number of resource type schema reads
    pub fn schema_lookups(&self) -> usize {
        self.state().schema_lookups
    }
}

#[async_trait]
impl OrchestrationService for FakeOrchestrationService {
    async fn submit(&self, submission: &StackSubmission) -> Result<StackId> {
        let mut state = self.state();
        if let Some(reason) = &state.reject_reason {
            return Err(ServiceError::rejected(400, reason.clone()));
        }
        state.next_id += 1;
        let id = StackId::new(format!("stack-{}", state.next_id));
        state.submissions.push(submission.clone());
        let stack = state.stacks.entry(id.clone()).or_default();
        stack.name = submission.stack_name.clone();
        Ok(id)
    }

    async fn get_stack(&self, id: &StackId) -> Result<DeployedStack> {
        let mut state = self.state();
        let stack = state
            .stacks
            .get_mut(id)
            .ok_or_else(|| ServiceError::not_found(format!("stack {}", id)))?;
        stack.poll_count += 1;

        let poll = if stack.polls.len() > 1 {
            stack.polls.pop_front()
        } else {
            stack.polls.front().cloned()
        }
        .unwrap_or_else(|| FakePoll::complete(StackAction::Create));

        match poll {
            FakePoll::Status(status, status_reason) => Ok(DeployedStack {
                id: id.clone(),
                name: stack.name.clone(),
                status,
                status_reason,
                outputs: stack.outputs.clone(),
            }),
            FakePoll::TransportError => Err(ServiceError::transport("connection reset by peer")),
            FakePoll::NotFound => Err(ServiceError::not_found(format!("stack {}", id))),
        }
    }

    async fn list_resources(&self, id: &StackId, _nested_depth: u32) -> Result<Vec<ResourceSummary>> {
        let state = self.state();
        let resources = state.resources.get(id);
        if resources.is_none() && !state.stacks.contains_key(id) {
            return Err(ServiceError::not_found(format!("stack {}", id)));
        }
        Ok(resources
            .into_iter()
            .flat_map(|r| r.values())
            .map(|r| ResourceSummary {
                name: r.name.clone(),
                physical_id: r.physical_id.clone(),
                resource_type: r.resource_type.clone(),
                status: r.status.clone(),
            })
            .collect())
    }

    async fn get_resource(&self, id: &StackId, resource_name: &str) -> Result<ResourceDetail> {
        self.state()
            .resources
            .get(id)
            .and_then(|r| r.get(resource_name))
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("resource {} of {}", resource_name, id)))
    }

    async fn resource_metadata(&self, id: &StackId, resource_name: &str) -> Result<BTreeMap<String, Value>> {
        Ok(self
            .state()
            .metadata
            .get(&(id.clone(), resource_name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn signal_resource(&self, id: &StackId, resource_name: &str) -> Result<()> {
        let mut state = self.state();
        let key = (id.clone(), resource_name.to_string());
        state.signals.push(key.clone());
        if let Some(event) = state.on_signal.remove(&key) {
            state.events.entry(key).or_default().insert(0, event);
        }
        Ok(())
    }

    async fn list_events(&self, id: &StackId, resource_name: &str, limit: usize) -> Result<Vec<LifecycleEvent>> {
        let mut state = self.state();
        if state.event_read_failures > 0 {
            state.event_read_failures -= 1;
            return Err(ServiceError::transport("gateway timeout"));
        }
        Ok(state
            .events
            .get(&(id.clone(), resource_name.to_string()))
            .map(|events| events.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_stack(&self, id: &StackId) -> Result<()> {
        let mut state = self.state();
        let Some(stack) = state.stacks.get_mut(id) else {
            return Err(ServiceError::not_found(format!("stack {}", id)));
        };
        match stack.delete_polls.take() {
            Some(polls) => stack.polls = polls.into(),
            None => {
                state.stacks.remove(id);
            }
        }
        Ok(())
    }

    async fn resource_type_schema(&self, resource_type: &str) -> Result<ResourceTypeSchema> {
        let mut state = self.state();
        state.schema_lookups += 1;
        let properties = match state.schemas.get(resource_type) {
            Some(properties) => properties.clone(),
            None if resource_type == "OS::Neutron::Port" => {
                MODERN_PORT_PROPERTIES.iter().map(|p| p.to_string()).collect()
            }
            None => BTreeSet::new(),
        };
        Ok(ResourceTypeSchema {
            resource_type: resource_type.to_string(),
            properties,
        })
    }
}
