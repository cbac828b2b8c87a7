//! Error types for the provisioning engine

use nimbus_core::{ServiceError, StackId, StackStatus};
use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while compiling, deploying or generating workflows
#[derive(Error, Debug)]
pub enum OrchestratorError {
    // ------------------------------------------------------------------
    // Compilation (input-caused, never retried)
    // ------------------------------------------------------------------
    /// The descriptor has placeholders but no parameter table was supplied
    #[error("Descriptor references inputs but no parameters were supplied (first: {0})")]
    MissingParameter(String),

    /// A placeholder has neither a parameter value nor a declared default
    #[error("Unresolved input reference: {name}")]
    UnresolvedInputReference { name: String },

    /// The parameter table could not be parsed into a name/value mapping
    #[error("Parameter input is not well formed: {0}")]
    MalformedParameterInput(String),

    /// Static addresses of a network requirement are not a list
    #[error("Static addresses for {component}/{network} must be a list")]
    InvalidNetworkAddressList { component: String, network: String },

    /// An alarm references metadata no compute component exposes
    #[error("Alarm {alarm} references metadata {metadata} not exposed by any compute component")]
    MetadataNotMatched { alarm: String, metadata: String },

    /// A capability or artifact of a component cannot be mapped
    #[error("Invalid capability on {component}: {reason}")]
    InvalidCapability { component: String, reason: String },

    /// Scaling bounds are inconsistent
    #[error("Invalid scaling policy {policy}: {reason}")]
    InvalidScalingPolicy { policy: String, reason: String },

    /// The produced graph violates a structural invariant
    #[error("Invalid resource graph: {0}")]
    InvalidGraph(String),

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------
    /// The initial submission was refused; nothing was created
    #[error("Stack submission rejected: {reason}")]
    SubmissionRejected { reason: String },

    /// Retry budget exhausted while the stack was still being created
    #[error("Stack {stack_id} creation not completed within budget (last status: {last_status:?})")]
    CreateTimedOut {
        stack_id: StackId,
        last_status: Option<StackStatus>,
    },

    /// The remote service reported creation failure
    #[error("Stack {stack_id} creation failed: {reason}")]
    CreateFailed { stack_id: StackId, reason: String },

    /// Retry budget exhausted while a scaling signal was still being processed
    #[error("Stack {stack_id} scaling not completed within budget (last event status: {last_status:?})")]
    ScaleTimedOut {
        stack_id: StackId,
        last_status: Option<String>,
    },

    /// The remote service reported a failed scaling signal
    #[error("Stack {stack_id} scaling failed: {reason}")]
    ScaleFailed { stack_id: StackId, reason: String },

    /// Retry budget exhausted while the stack was still being deleted
    #[error("Stack {stack_id} deletion not completed within budget (last status: {last_status:?})")]
    DeleteTimedOut {
        stack_id: StackId,
        last_status: Option<StackStatus>,
    },

    /// The remote service reported deletion failure
    #[error("Stack {stack_id} deletion failed: {reason}")]
    DeleteFailed { stack_id: StackId, reason: String },

    /// A generated workflow is incomplete or not a DAG
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// A scale request names a policy absent from the binding table
    #[error("No scaling group bound to policy {0}")]
    UnknownScalingPolicy(String),

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------
    /// Remote call failed outside a polling loop
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a graph invariant error
    pub fn invalid_graph(msg: impl Into<String>) -> Self {
        Self::InvalidGraph(msg.into())
    }

    /// Create a capability error
    pub fn invalid_capability(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCapability {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Input-caused error raised before any remote call
    pub fn is_compilation(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter(_)
                | Self::UnresolvedInputReference { .. }
                | Self::MalformedParameterInput(_)
                | Self::InvalidNetworkAddressList { .. }
                | Self::MetadataNotMatched { .. }
                | Self::InvalidCapability { .. }
                | Self::InvalidScalingPolicy { .. }
                | Self::InvalidGraph(_)
                | Self::InvalidWorkflow(_)
        )
    }

    /// Retry budget exhausted without a terminal remote state
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::CreateTimedOut { .. } | Self::ScaleTimedOut { .. } | Self::DeleteTimedOut { .. }
        )
    }

    /// The remote service itself reported failure
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::CreateFailed { .. } | Self::ScaleFailed { .. } | Self::DeleteFailed { .. }
        )
    }
}
