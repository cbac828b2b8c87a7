//! Workflow generator
//!
//! Builds task-dependency graphs for a separate workflow engine. Independent
//! of the compiler and the driver: a workflow only names remote actions and
//! how their outcomes chain.
//!
//! Every graph is namespaced by its target so several targets can share one
//! engine:
//!
//! ```text
//! workflow  <target>_<action>        e.g. web01_deploy
//! task      <target>_<task_kind>     e.g. web01_wait_active
//! ```

use pathfinding::directed::topological_sort::topological_sort;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Definition language version
pub const WORKFLOW_VERSION: &str = "2.0";

/// Workflow type: tasks run along `on-success` edges
pub const WORKFLOW_TYPE: &str = "direct";

const DEFAULT_RETRY_COUNT: u64 = 10;
const DEFAULT_RETRY_DELAY: u64 = 10;

/// Kind of automation to generate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Create a workload and wait for it to become active
    Deploy,
    /// Delete a workload
    Teardown,
    /// Probe a management address until it answers
    HealthProbe,
    /// Run ordered maintenance steps
    Maintenance,
}

impl WorkflowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Teardown => "teardown",
            Self::HealthProbe => "health_probe",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "deploy" => Ok(Self::Deploy),
            "teardown" => Ok(Self::Teardown),
            "health_probe" => Ok(Self::HealthProbe),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(format!("Unknown workflow action: {}", other)),
        }
    }
}

/// Retry semantics of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub count: u64,
    /// Seconds between attempts
    pub delay: u64,
    #[serde(rename = "continue-on", default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<String>,
    #[serde(rename = "break-on", default, skip_serializing_if = "Option::is_none")]
    pub break_on: Option<String>,
}

/// Successor of a task, optionally conditioned on a runtime expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Successor {
    Always(String),
    When(BTreeMap<String, String>),
}

impl Successor {
    pub fn when(task: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::When(BTreeMap::from([(task.into(), expression.into())]))
    }

    /// Names of the tasks this successor may start
    pub fn tasks(&self) -> Vec<&str> {
        match self {
            Self::Always(task) => vec![task.as_str()],
            Self::When(conditions) => conditions.keys().map(String::as_str).collect(),
        }
    }
}

/// One remote action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub action: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub publish: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(rename = "on-success", default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<Successor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
}

impl Task {
    fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }
}

/// Named task graph plus the input of its execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    /// `<target>_<action>`
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub workflow_type: String,
    pub input: Vec<String>,
    pub tasks: BTreeMap<String, Task>,
    pub output: BTreeMap<String, String>,
    /// Execution input dictionary
    #[serde(default)]
    pub input_values: BTreeMap<String, Value>,
}

impl WorkflowGraph {
    fn new(name: String) -> Self {
        Self {
            name,
            version: WORKFLOW_VERSION.to_string(),
            workflow_type: WORKFLOW_TYPE.to_string(),
            input: Vec::new(),
            tasks: BTreeMap::new(),
            output: BTreeMap::new(),
            input_values: BTreeMap::new(),
        }
    }

    /// Check that successors resolve and the successor relation is acyclic
    pub fn validate(&self) -> Result<()> {
        for (name, task) in &self.tasks {
            for successor in task.on_success.iter().flat_map(Successor::tasks) {
                if !self.tasks.contains_key(successor) {
                    return Err(OrchestratorError::InvalidWorkflow(format!(
                        "task {} names unknown successor {}",
                        name, successor
                    )));
                }
            }
        }

        let roots: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        topological_sort(&roots, |name: &&str| {
            self.tasks
                .get(*name)
                .map(|task| task.on_success.iter().flat_map(Successor::tasks).collect::<Vec<_>>())
                .unwrap_or_default()
        })
        .map_err(|task| {
            OrchestratorError::InvalidWorkflow(format!("successor cycle through {}", task))
        })?;
        Ok(())
    }

    /// Definition document in the engine's native layout
    pub fn definition(&self) -> Result<Value> {
        let mut body = Map::new();
        body.insert("type".to_string(), Value::String(self.workflow_type.clone()));
        if !self.input.is_empty() {
            body.insert("input".to_string(), serde_json::to_value(&self.input)?);
        }
        body.insert("tasks".to_string(), serde_json::to_value(&self.tasks)?);
        if !self.output.is_empty() {
            body.insert("output".to_string(), serde_json::to_value(&self.output)?);
        }

        let mut definition = Map::new();
        definition.insert("version".to_string(), Value::String(self.version.clone()));
        definition.insert(self.name.clone(), Value::Object(body));
        Ok(Value::Object(definition))
    }

    /// Definition as YAML text, ready to register
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.definition()?)?)
    }
}

fn expr(body: impl fmt::Display) -> String {
    format!("<% {} %>", body)
}

fn param_u64(params: &BTreeMap<String, Value>, key: &str, default: u64) -> Result<u64> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value.as_u64().ok_or_else(|| {
            OrchestratorError::InvalidWorkflow(format!("{} must be a non-negative integer, got {}", key, value))
        }),
    }
}

fn required<'p>(params: &'p BTreeMap<String, Value>, key: &str, action: WorkflowAction) -> Result<&'p Value> {
    params.get(key).ok_or_else(|| {
        OrchestratorError::InvalidWorkflow(format!("{} workflow requires parameter {}", action, key))
    })
}

/// Builds workflow graphs
#[derive(Debug, Clone, Default)]
pub struct WorkflowGenerator;

impl WorkflowGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Build the `action` workflow for `target_id`
    pub fn build(
        &self,
        target_id: &str,
        action: WorkflowAction,
        params: &BTreeMap<String, Value>,
    ) -> Result<WorkflowGraph> {
        let mut graph = WorkflowGraph::new(format!("{}_{}", target_id, action));
        match action {
            WorkflowAction::Deploy => deploy(&mut graph, target_id, params)?,
            WorkflowAction::Teardown => teardown(&mut graph, target_id, params)?,
            WorkflowAction::HealthProbe => health_probe(&mut graph, target_id, params)?,
            WorkflowAction::Maintenance => maintenance(&mut graph, target_id, params)?,
        }
        graph.validate()?;
        debug!(workflow = %graph.name, tasks = graph.tasks.len(), "Built workflow");
        Ok(graph)
    }
}

fn deploy(graph: &mut WorkflowGraph, target: &str, params: &BTreeMap<String, Value>) -> Result<()> {
    let create = format!("{}_create", target);
    let wait = format!("{}_wait_active", target);
    let delete = format!("{}_delete", target);
    let id = format!("id_{}", target);
    let status = format!("status_{}", target);
    let mgmt = format!("mgmt_address_{}", target);

    let mut create_task = Task::new(format!("nimbus.create_workload body={}", expr("$.body")));
    create_task.input.insert("body".to_string(), Value::String(expr("$.body")));
    create_task.publish = BTreeMap::from([
        (id.clone(), expr(format!("task({}).result.workload.id", create))),
        (status.clone(), expr(format!("task({}).result.workload.status", create))),
        (mgmt.clone(), expr(format!("task({}).result.workload.mgmt_address", create))),
    ]);
    create_task.on_success = vec![Successor::Always(wait.clone())];

    let mut wait_task = Task::new(format!("nimbus.show_workload id={}", expr(format!("$.{}", id))));
    wait_task.retry = Some(RetryPolicy {
        count: param_u64(params, "retry_count", DEFAULT_RETRY_COUNT)?,
        delay: param_u64(params, "retry_delay", DEFAULT_RETRY_DELAY)?,
        continue_on: Some(expr(format!("$.{} = \"PENDING_CREATE\"", status))),
        break_on: Some(expr(format!("$.{} = \"ERROR\"", status))),
    });
    wait_task.publish = BTreeMap::from([
        (status.clone(), expr(format!("task({}).result.workload.status", wait))),
        (mgmt.clone(), expr(format!("task({}).result.workload.mgmt_address", wait))),
    ]);
    wait_task.on_success = vec![Successor::when(
        delete.clone(),
        expr(format!("$.{} = \"ERROR\"", status)),
    )];

    let delete_task = Task::new(format!("nimbus.delete_workload id={}", expr(format!("$.{}", id))));

    graph.tasks.insert(create, create_task);
    graph.tasks.insert(wait, wait_task);
    graph.tasks.insert(delete, delete_task);

    graph.input.push("body".to_string());
    graph.input_values.insert(
        "body".to_string(),
        params.get("body").cloned().unwrap_or_else(|| Value::Object(Map::new())),
    );
    for key in [id, status, mgmt] {
        graph.output.insert(key.clone(), expr(format!("$.{}", key)));
    }
    Ok(())
}

fn teardown(graph: &mut WorkflowGraph, target: &str, params: &BTreeMap<String, Value>) -> Result<()> {
    let id = format!("id_{}", target);
    let workload_id = required(params, "workload_id", WorkflowAction::Teardown)?;
    let force = params.get("force").and_then(Value::as_bool).unwrap_or(false);

    let mut delete_task = Task::new(format!("nimbus.delete_workload id={}", expr(format!("$.{}", id))));
    delete_task
        .input
        .insert("force".to_string(), Value::Bool(force));
    graph.tasks.insert(format!("{}_delete", target), delete_task);

    graph.input.push(id.clone());
    graph.input_values.insert(id, workload_id.clone());
    Ok(())
}

fn health_probe(graph: &mut WorkflowGraph, target: &str, params: &BTreeMap<String, Value>) -> Result<()> {
    let probe = format!("{}_probe", target);
    let reachable_task = format!("{}_mark_reachable", target);
    let unreachable_task = format!("{}_mark_unreachable", target);
    let reachable = format!("reachable_{}", target);
    let address = required(params, "address", WorkflowAction::HealthProbe)?;

    let mut probe_task = Task::new(format!("nimbus.probe address={}", expr("$.address")));
    probe_task.retry = Some(RetryPolicy {
        count: param_u64(params, "retry_count", DEFAULT_RETRY_COUNT)?,
        delay: param_u64(params, "retry_delay", DEFAULT_RETRY_DELAY)?,
        continue_on: Some(expr(format!("$.{} = false", reachable))),
        break_on: None,
    });
    probe_task.publish = BTreeMap::from([(
        reachable.clone(),
        expr(format!("task({}).result.reachable", probe)),
    )]);
    probe_task.on_success = vec![
        Successor::when(reachable_task.clone(), expr(format!("$.{} = true", reachable))),
        Successor::when(unreachable_task.clone(), expr(format!("$.{} = false", reachable))),
    ];

    for (name, status) in [(&reachable_task, "ACTIVE"), (&unreachable_task, "ERROR")] {
        let mut mark = Task::new("nimbus.update_status");
        mark.input = BTreeMap::from([
            ("target".to_string(), Value::String(target.to_string())),
            ("status".to_string(), Value::String(status.to_string())),
        ]);
        graph.tasks.insert(name.clone(), mark);
    }
    graph.tasks.insert(probe, probe_task);

    graph.input.push("address".to_string());
    graph.input_values.insert("address".to_string(), address.clone());
    graph.output.insert(reachable.clone(), expr(format!("$.{}", reachable)));
    Ok(())
}

fn maintenance(graph: &mut WorkflowGraph, target: &str, params: &BTreeMap<String, Value>) -> Result<()> {
    let steps = required(params, "steps", WorkflowAction::Maintenance)?
        .as_array()
        .filter(|steps| !steps.is_empty())
        .ok_or_else(|| OrchestratorError::InvalidWorkflow("steps must be a non-empty list".to_string()))?;

    let names: Vec<String> = (1..=steps.len())
        .map(|i| format!("{}_step_{}", target, i))
        .collect();
    for (i, step) in steps.iter().enumerate() {
        let action = step.as_str().ok_or_else(|| {
            OrchestratorError::InvalidWorkflow(format!("step {} must be an action string, got {}", i + 1, step))
        })?;
        let mut task = Task::new(action);
        match names.get(i + 1) {
            Some(next) => task.on_success = vec![Successor::Always(next.clone())],
            None => task.join = Some("all".to_string()),
        }
        graph.tasks.insert(names[i].clone(), task);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_deploy_workflow_shape() {
        let graph = WorkflowGenerator::new()
            .build("web01", WorkflowAction::Deploy, &params(json!({"body": {"name": "web"}})))
            .unwrap();

        assert_eq!(graph.name, "web01_deploy");
        assert_eq!(graph.tasks.len(), 3);
        let wait = &graph.tasks["web01_wait_active"];
        let retry = wait.retry.as_ref().unwrap();
        assert_eq!(retry.count, 10);
        assert_eq!(retry.break_on.as_deref(), Some("<% $.status_web01 = \"ERROR\" %>"));
        assert_eq!(
            wait.on_success,
            vec![Successor::when("web01_delete", "<% $.status_web01 = \"ERROR\" %>")]
        );
        assert_eq!(
            graph.tasks["web01_create"].on_success,
            vec![Successor::Always("web01_wait_active".to_string())]
        );
        assert_eq!(graph.input_values["body"], json!({"name": "web"}));
        assert!(graph.output.contains_key("mgmt_address_web01"));
    }

    #[test]
    fn test_definition_uses_native_keys() {
        let graph = WorkflowGenerator::new()
            .build("web01", WorkflowAction::Deploy, &BTreeMap::new())
            .unwrap();
        let definition = graph.definition().unwrap();

        assert_eq!(definition["version"], json!("2.0"));
        let body = &definition["web01_deploy"];
        assert_eq!(body["type"], json!("direct"));
        assert_eq!(
            body["tasks"]["web01_wait_active"]["retry"]["continue-on"],
            json!("<% $.status_web01 = \"PENDING_CREATE\" %>")
        );
        assert_eq!(
            body["tasks"]["web01_wait_active"]["on-success"],
            json!([{"web01_delete": "<% $.status_web01 = \"ERROR\" %>"}])
        );
        assert!(body["tasks"]["web01_delete"].get("on-success").is_none());

        let yaml = graph.to_yaml().unwrap();
        assert!(yaml.contains("web01_deploy"));
        assert!(yaml.contains("on-success"));
    }

    #[test]
    fn test_teardown_requires_workload_id() {
        let generator = WorkflowGenerator::new();
        let err = generator
            .build("web01", WorkflowAction::Teardown, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflow(_)));

        let graph = generator
            .build("web01", WorkflowAction::Teardown, &params(json!({"workload_id": "abc", "force": true})))
            .unwrap();
        assert_eq!(graph.input, vec!["id_web01".to_string()]);
        assert_eq!(graph.input_values["id_web01"], json!("abc"));
        assert_eq!(graph.tasks["web01_delete"].input["force"], json!(true));
    }

    #[test]
    fn test_health_probe_conditional_successors() {
        let graph = WorkflowGenerator::new()
            .build(
                "web01",
                WorkflowAction::HealthProbe,
                &params(json!({"address": "10.0.0.4", "retry_count": 3, "retry_delay": 5})),
            )
            .unwrap();

        let probe = &graph.tasks["web01_probe"];
        assert_eq!(probe.retry.as_ref().unwrap().count, 3);
        assert_eq!(probe.retry.as_ref().unwrap().delay, 5);
        assert_eq!(probe.on_success.len(), 2);
        assert_eq!(graph.tasks["web01_mark_unreachable"].input["status"], json!("ERROR"));
    }

    #[test]
    fn test_maintenance_steps_chain() {
        let graph = WorkflowGenerator::new()
            .build(
                "web01",
                WorkflowAction::Maintenance,
                &params(json!({"steps": ["nimbus.drain", "nimbus.patch", "nimbus.restore"]})),
            )
            .unwrap();

        assert_eq!(graph.name, "web01_maintenance");
        assert_eq!(
            graph.tasks["web01_step_1"].on_success,
            vec![Successor::Always("web01_step_2".to_string())]
        );
        assert_eq!(graph.tasks["web01_step_3"].join.as_deref(), Some("all"));
        assert!(graph.tasks["web01_step_3"].on_success.is_empty());

        let err = WorkflowGenerator::new()
            .build("web01", WorkflowAction::Maintenance, &params(json!({"steps": []})))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidWorkflow(_)));
    }

    #[test]
    fn test_names_do_not_collide_across_targets() {
        let generator = WorkflowGenerator::new();
        let a = generator.build("a", WorkflowAction::Deploy, &BTreeMap::new()).unwrap();
        let b = generator.build("b", WorkflowAction::Deploy, &BTreeMap::new()).unwrap();
        assert_ne!(a.name, b.name);
        assert!(a.tasks.keys().all(|k| !b.tasks.contains_key(k)));
    }

    #[test]
    fn test_validate_rejects_unknown_successor_and_cycles() {
        let mut graph = WorkflowGraph::new("t_x".to_string());
        let mut task = Task::new("std.noop");
        task.on_success = vec![Successor::Always("missing".to_string())];
        graph.tasks.insert("a".to_string(), task);
        assert!(graph.validate().is_err());

        let mut graph = WorkflowGraph::new("t_x".to_string());
        let mut a = Task::new("std.noop");
        a.on_success = vec![Successor::Always("b".to_string())];
        let mut b = Task::new("std.noop");
        b.on_success = vec![Successor::when("a", "<% true %>")];
        graph.tasks.insert("a".to_string(), a);
        graph.tasks.insert("b".to_string(), b);
        let err = graph.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("health-probe".parse::<WorkflowAction>().unwrap(), WorkflowAction::HealthProbe);
        assert_eq!(WorkflowAction::Maintenance.to_string(), "maintenance");
        assert!("reboot".parse::<WorkflowAction>().is_err());
    }
}
