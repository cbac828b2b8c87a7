//! End-to-end lifecycle against the scripted orchestration service
//!
//! Descriptor YAML -> plan -> create -> (scale) -> delete, observed through
//! what the fake service received.

use nimbus_core::{ResourceDetail, StackAction, StackId};
use nimbus_orchestrator::driver::RetryBudget;
use nimbus_orchestrator::test_utils::{FakeOrchestrationService, FakePoll};
use nimbus_orchestrator::{
    DescriptorCompiler, DriverConfig, OrchestrationDriver, OrchestratorError, ParameterTable,
    ScaleDirection, ScaleRequest, WorkloadDescriptor,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const SINGLE_SERVER: &str = r#"
name: single
inputs:
  image:
    description: Boot image
components:
  VDU1:
    kind: compute
    image: { get_input: image }
    flavor: m1.tiny
    networks:
      - network: net_mgmt
        management: true
"#;

const SCALED_SERVER: &str = r#"
name: scaled
components:
  VDU1:
    kind: compute
    image: cirros
    flavor: m1.tiny
    metadata:
      metering.server_group: SG1
    networks:
      - network: net_mgmt
        management: true
policies:
  - kind: scaling
    name: SP1
    targets: [VDU1]
    min: 1
    max: 3
    default: 1
    increment: 2
    cooldown: 120
  - kind: alarm
    name: vdu_hcpu_usage_scaling_out
    metadata: SG1
    meter_name: cpu_util
    comparison_operator: gt
    period: 600
    evaluation_periods: 1
    statistic: avg
    threshold: 50.0
    actions: [SP1]
"#;

fn fast_budget(retries: u32) -> RetryBudget {
    RetryBudget::new(retries, Duration::from_millis(1))
}

fn driver(fake: &Arc<FakeOrchestrationService>) -> OrchestrationDriver {
    OrchestrationDriver::new(fake.clone(), DriverConfig::default())
}

fn register_member(fake: &FakeOrchestrationService, stack: &StackId, member: &str, ip: &str) {
    fake.add_resource(
        stack,
        ResourceDetail {
            name: "SP1_group".to_string(),
            physical_id: "nested-1".to_string(),
            resource_type: "OS::Heat::AutoScalingGroup".to_string(),
            status: "CREATE_COMPLETE".to_string(),
            attributes: BTreeMap::new(),
        },
    );
    fake.add_resource(
        &StackId::new("nested-1"),
        ResourceDetail {
            name: member.to_string(),
            physical_id: format!("{}-id", member),
            resource_type: "SP1_res.yaml".to_string(),
            status: "CREATE_COMPLETE".to_string(),
            attributes: BTreeMap::from([("mgmt_ip-VDU1".to_string(), json!(ip))]),
        },
    );
}

#[tokio::test]
async fn test_single_server_deploys_and_reports_management_address() {
    let fake = Arc::new(FakeOrchestrationService::new());
    let descriptor = WorkloadDescriptor::from_yaml(SINGLE_SERVER).unwrap();
    let params = ParameterTable::from_yaml("image: cirros").unwrap();

    let plan = DescriptorCompiler::default()
        .plan(&descriptor, Some(&params), fake.as_ref())
        .await
        .unwrap();
    assert!(plan.bindings.is_empty());
    assert!(plan.graph.contains("VDU1"));
    assert!(plan.graph.contains("VDU1-net_mgmt-port"));

    let driver = driver(&fake);
    let id = driver.create("single", &plan.graph).await.unwrap();
    fake.set_outputs(
        &id,
        vec![
            ("mgmt_ip-VDU1", json!("192.168.120.31")),
            ("unrelated", json!("ignored")),
        ],
    );
    fake.script_polls(
        &id,
        vec![
            FakePoll::in_progress(StackAction::Create),
            FakePoll::TransportError,
            FakePoll::complete(StackAction::Create),
        ],
    );

    let endpoints = driver.wait_create(&id, fast_budget(5)).await.unwrap();
    assert_eq!(endpoints, BTreeMap::from([("VDU1".to_string(), json!("192.168.120.31"))]));

    let submitted = &fake.submissions()[0];
    assert_eq!(submitted.stack_name, "single");
    assert_eq!(submitted.template["resources"]["VDU1"]["properties"]["image"], json!("cirros"));
    assert!(submitted.template["outputs"].get("mgmt_ip-VDU1").is_some());

    driver.delete(&id).await.unwrap();
    driver.wait_delete(&id, fast_budget(3)).await.unwrap();
}

#[tokio::test]
async fn test_missing_parameter_table_is_rejected_before_submission() {
    let fake = Arc::new(FakeOrchestrationService::new());
    let descriptor = WorkloadDescriptor::from_yaml(SINGLE_SERVER).unwrap();

    let err = DescriptorCompiler::default()
        .plan(&descriptor, None, fake.as_ref())
        .await
        .unwrap_err();

    assert!(err.is_compilation());
    assert!(matches!(err, OrchestratorError::MissingParameter(ref name) if name == "image"));
    assert!(fake.submissions().is_empty());
}

#[tokio::test]
async fn test_scaled_server_with_alarm_scales_out() {
    let fake = Arc::new(FakeOrchestrationService::new());
    let descriptor = WorkloadDescriptor::from_yaml(SCALED_SERVER).unwrap();

    let plan = DescriptorCompiler::default()
        .plan(&descriptor, None, fake.as_ref())
        .await
        .unwrap();

    assert_eq!(plan.bindings.group("SP1"), Some("SP1_group"));
    assert_eq!(
        plan.alarm_tags,
        BTreeMap::from([(
            "vdu_hcpu_usage_scaling_out".to_string(),
            "SG1-SP1_group".to_string()
        )])
    );
    assert!(!plan.graph.contains("VDU1"));

    let template = plan.graph.to_template();
    let resources = &template["resources"];
    assert_eq!(resources["SP1_scale_out"]["properties"]["scaling_adjustment"], json!(2));
    assert_eq!(resources["SP1_scale_in"]["properties"]["scaling_adjustment"], json!(-2));
    assert_eq!(resources["SP1_group"]["properties"]["resource"], json!({"type": "SP1_res.yaml"}));
    assert_eq!(
        resources["vdu_hcpu_usage_scaling_out"]["properties"]["alarm_actions"],
        json!([{"get_attr": ["SP1_scale_out", "alarm_url"]}])
    );

    let driver = driver(&fake);
    let id = driver.create("scaled", &plan.graph).await.unwrap();

    let submitted = &fake.submissions()[0];
    let member: Value = serde_json::from_str(&submitted.files["SP1_res.yaml"]).unwrap();
    assert_eq!(
        member["resources"]["VDU1"]["properties"]["metadata"]["metering.server_group"],
        json!("SG1-SP1_group")
    );
    assert!(member["outputs"].get("mgmt_ip-VDU1").is_some());

    register_member(&fake, &id, "member-a", "10.0.0.11");
    let created = driver
        .wait_create_grouped(&id, &plan.bindings, fast_budget(3))
        .await
        .unwrap();
    assert_eq!(created["VDU1"], vec![json!("10.0.0.11")]);

    fake.push_event(&id, "SP1_scale_out", "ev-1", "SIGNAL_COMPLETE");
    fake.on_signal(&id, "SP1_scale_out", "ev-2", "SIGNAL_COMPLETE");
    register_member(&fake, &id, "member-b", "10.0.0.12");

    let request = ScaleRequest::new("SP1", ScaleDirection::Out);
    let token = driver.scale(&id, &plan.bindings, &request).await.unwrap();
    assert_eq!(token.0.as_deref(), Some("ev-1"));

    let endpoints = driver
        .wait_scale(&id, &plan.bindings, &request, &token, fast_budget(5))
        .await
        .unwrap();
    assert_eq!(endpoints["VDU1"], vec![json!("10.0.0.11"), json!("10.0.0.12")]);
    assert_eq!(fake.signals(), vec![(id.clone(), "SP1_scale_out".to_string())]);
}

#[tokio::test]
async fn test_coalesced_scale_signal_counts_as_success() {
    let fake = Arc::new(FakeOrchestrationService::new());
    let descriptor = WorkloadDescriptor::from_yaml(SCALED_SERVER).unwrap();
    let plan = DescriptorCompiler::default()
        .plan(&descriptor, None, fake.as_ref())
        .await
        .unwrap();

    let driver = driver(&fake);
    let id = driver.create("scaled", &plan.graph).await.unwrap();
    register_member(&fake, &id, "member-a", "10.0.0.11");

    // The previous signal's event is the only one; the new signal emits none
    fake.push_event(&id, "SP1_scale_in", "ev-7", "SIGNAL_COMPLETE");
    fake.set_resource_metadata(
        &id,
        "SP1_scale_in",
        BTreeMap::from([("scaling_in_progress".to_string(), json!(false))]),
    );

    let request = ScaleRequest::new("SP1", ScaleDirection::In);
    let token = driver.scale(&id, &plan.bindings, &request).await.unwrap();
    let endpoints = driver
        .wait_scale(&id, &plan.bindings, &request, &token, fast_budget(3))
        .await
        .unwrap();

    assert_eq!(endpoints["VDU1"], vec![json!("10.0.0.11")]);
}

#[tokio::test]
async fn test_scale_still_in_progress_times_out() {
    let fake = Arc::new(FakeOrchestrationService::new());
    let descriptor = WorkloadDescriptor::from_yaml(SCALED_SERVER).unwrap();
    let plan = DescriptorCompiler::default()
        .plan(&descriptor, None, fake.as_ref())
        .await
        .unwrap();

    let driver = driver(&fake);
    let id = driver.create("scaled", &plan.graph).await.unwrap();
    fake.set_resource_metadata(
        &id,
        "SP1_scale_out",
        BTreeMap::from([("scaling_in_progress".to_string(), json!(true))]),
    );

    let request = ScaleRequest::new("SP1", ScaleDirection::Out);
    let token = driver.scale(&id, &plan.bindings, &request).await.unwrap();
    let err = driver
        .wait_scale(&id, &plan.bindings, &request, &token, fast_budget(2))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(!err.is_terminal_failure());
}

#[tokio::test]
async fn test_exhausted_create_budget_is_timeout_not_failure() {
    let fake = Arc::new(FakeOrchestrationService::new());
    let descriptor = WorkloadDescriptor::from_yaml(SINGLE_SERVER).unwrap();
    let params = ParameterTable::new().with("image", "cirros");
    let plan = DescriptorCompiler::default()
        .plan(&descriptor, Some(&params), fake.as_ref())
        .await
        .unwrap();

    let driver = driver(&fake);
    let id = driver.create("slow", &plan.graph).await.unwrap();
    fake.script_polls(&id, vec![FakePoll::in_progress(StackAction::Create)]);

    let err = driver.wait_create(&id, fast_budget(4)).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(matches!(
        err,
        OrchestratorError::CreateTimedOut { last_status: Some(ref s), .. } if s.is_in_progress()
    ));
    assert_eq!(fake.polls(&id), 4);
}

#[tokio::test]
async fn test_deleting_a_vanished_stack_succeeds() {
    let fake = Arc::new(FakeOrchestrationService::new());
    let driver = driver(&fake);
    let id = StackId::new("never-existed");

    driver.delete(&id).await.unwrap();
    driver.wait_delete(&id, fast_budget(2)).await.unwrap();
}
