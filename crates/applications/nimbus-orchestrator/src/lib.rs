//! # Nimbus Orchestrator
//!
//! Workload provisioning engine: compiles declarative workload descriptors
//! into resource graphs and drives them through a remote orchestration
//! service.
//!
//! ## Architecture
//!
//! ```text
//! WorkloadDescriptor + ParameterTable
//!        │
//!        ▼
//! DescriptorCompiler ──► ResourceGraph ──► synthesize_scaling / merge_scaling
//!   ├── mapper (flavors, images, property compatibility)     synthesize_alarms
//!   └── network (ports, management outputs)                         │
//!                                                                    ▼
//!                            OrchestrationDriver ──► OrchestrationService (Heat)
//!                              create / wait_create
//!                              scale / wait_scale
//!                              delete / wait_delete
//!
//! WorkflowGenerator ──► WorkflowGraph ──► WorkflowEngine (Mistral)
//! ```
//!
//! ## Lifecycle
//!
//! 1. **Compile**: substitute parameters, map components to resources
//! 2. **Synthesize**: wrap scaled servers into groups, wire alarms to policies
//! 3. **Create**: submit the graph, poll until it settles, collect management addresses
//! 4. **Scale**: signal a policy, wait for its event, re-read member addresses
//! 5. **Delete**: request deletion, poll until the stack is gone
//!
//! The driver holds no state between calls: graphs, bindings and stack ids
//! belong to the caller. See [`locks`] for serializing operations per stack.

#![warn(clippy::all)]

pub mod compiler;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod graph;
pub mod heat;
mod http;
pub mod identity;
pub mod locks;
pub mod mapper;
pub mod mistral;
pub mod network;
pub mod params;
pub mod scaling;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod workflow;

// ============================================================================
// Public exports - Compilation
// ============================================================================

pub use compiler::{
    CompiledWorkload, CompilerConfig, DeploymentPlan, DescriptorCompiler, MonitoringDict,
};
pub use descriptor::{
    AlarmPolicy, Component, ComputeCapabilities, ComputeNode, ConnectionPointNode,
    DescriptorValue, ImageArtifact, MonitoringPolicy, NetworkLinkNode, NetworkRequirement,
    Policy, ScalingPolicy, StorageNode, VnicKind, WorkloadDescriptor,
};
pub use graph::{AttrSegment, Output, PropertyValue, Resource, ResourceGraph};
pub use params::{ParameterTable, Substitution};
pub use scaling::{
    merge_scaling, synthesize_alarms, synthesize_scaling, AlarmSynthesis, ScaleDirection,
    ScalingGroupBinding, ScalingSynthesis,
};

// ============================================================================
// Public exports - Lifecycle
// ============================================================================

pub use driver::{
    DriverConfig, InventoryEntry, Observation, OrchestrationDriver, RetryBudget, ScaleRequest,
    SignalToken,
};
pub use locks::{StackGuard, StackLocks};
pub use workflow::{WorkflowAction, WorkflowGenerator, WorkflowGraph};

// ============================================================================
// Public exports - Infrastructure
// ============================================================================

pub use config::{EngineConfig, IdentityConfig};
pub use error::{OrchestratorError, Result};
pub use heat::HeatClient;
pub use identity::KeystoneSession;
pub use mistral::MistralClient;
