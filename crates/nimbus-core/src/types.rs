//! Core types shared between the engine and the service adapters

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Remote-assigned identifier of a deployed stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackId(pub String);

impl StackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle action a stack status refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StackAction {
    Init,
    Create,
    Update,
    Delete,
    Rollback,
    Suspend,
    Resume,
    Check,
    /// Any action this crate has no dedicated variant for
    Other(String),
}

impl StackAction {
    fn parse(s: &str) -> Self {
        match s {
            "INIT" => Self::Init,
            "CREATE" => Self::Create,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            "ROLLBACK" => Self::Rollback,
            "SUSPEND" => Self::Suspend,
            "RESUME" => Self::Resume,
            "CHECK" => Self::Check,
            other => Self::Other(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Self::Init => "INIT",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Rollback => "ROLLBACK",
            Self::Suspend => "SUSPEND",
            Self::Resume => "RESUME",
            Self::Check => "CHECK",
            Self::Other(s) => s.as_str(),
        }
    }
}

/// Progress of the current lifecycle action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackState {
    InProgress,
    Complete,
    Failed,
}

impl StackState {
    fn suffix(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

/// Observed stack status, e.g. `CREATE_IN_PROGRESS`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StackStatus {
    pub action: StackAction,
    pub state: StackState,
}

impl StackStatus {
    pub fn new(action: StackAction, state: StackState) -> Self {
        Self { action, state }
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == StackState::InProgress
    }

    /// Check for `<action>_COMPLETE`
    pub fn is_complete(&self, action: &StackAction) -> bool {
        &self.action == action && self.state == StackState::Complete
    }
}

impl FromStr for StackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for state in [StackState::InProgress, StackState::Complete, StackState::Failed] {
            if let Some(action) = s.strip_suffix(state.suffix()).and_then(|a| a.strip_suffix('_')) {
                if action.is_empty() {
                    break;
                }
                return Ok(Self::new(StackAction::parse(action), state));
            }
        }
        Err(format!("Unrecognised stack status: {}", s))
    }
}

impl TryFrom<String> for StackStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StackStatus> for String {
    fn from(status: StackStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.action.as_str(), self.state.suffix())
    }
}

/// One output value reported by a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackOutput {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
}

/// Snapshot of a deployed stack as last observed from the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployedStack {
    pub id: StackId,
    pub name: String,
    pub status: StackStatus,
    /// Free-text reason reported alongside the status
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub outputs: Vec<StackOutput>,
}

/// Entry of a stack resource listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub name: String,
    pub physical_id: String,
    pub resource_type: String,
    pub status: String,
}

/// Detailed view of one stack resource, including its attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDetail {
    pub name: String,
    pub physical_id: String,
    pub resource_type: String,
    pub status: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Remote-emitted record of a state change on one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: String,
    pub resource_name: String,
    /// Raw status, e.g. `SIGNAL_COMPLETE`
    pub status: String,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
}

/// Properties a resource type natively accepts on one endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeSchema {
    pub resource_type: String,
    pub properties: std::collections::BTreeSet<String>,
}

impl ResourceTypeSchema {
    pub fn supports(&self, property: &str) -> bool {
        self.properties.contains(property)
    }
}

/// Everything needed to create a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSubmission {
    pub stack_name: String,
    /// Top-level template in the service's native JSON format
    pub template: serde_json::Value,
    /// Nested templates referenced by file name from the top-level template
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub timeout_mins: Option<u32>,
    #[serde(default)]
    pub disable_rollback: bool,
}

/// Short-lived bearer credential issued by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A credential is stale once it expires within `skew` of `now`
    pub fn is_stale(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        match self.expires_at {
            Some(expiry) => expiry - skew <= now,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_status_parse() {
        let status: StackStatus = "CREATE_IN_PROGRESS".parse().unwrap();
        assert_eq!(status.action, StackAction::Create);
        assert_eq!(status.state, StackState::InProgress);

        let status: StackStatus = "DELETE_FAILED".parse().unwrap();
        assert_eq!(status.action, StackAction::Delete);
        assert_eq!(status.state, StackState::Failed);

        let status: StackStatus = "SNAPSHOT_COMPLETE".parse().unwrap();
        assert_eq!(status.action, StackAction::Other("SNAPSHOT".to_string()));
        assert!(status.is_complete(&StackAction::Other("SNAPSHOT".to_string())));
    }

    #[test]
    fn test_stack_status_rejects_garbage() {
        assert!("COMPLETE".parse::<StackStatus>().is_err());
        assert!("CREATE_DONE".parse::<StackStatus>().is_err());
    }

    #[test]
    fn test_stack_status_display_matches_wire_format() {
        let status = StackStatus::new(StackAction::Update, StackState::Complete);
        assert_eq!(status.to_string(), "UPDATE_COMPLETE");

        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"UPDATE_COMPLETE\"");
    }

    #[test]
    fn test_credential_staleness() {
        let now = Utc::now();
        let cred = Credential {
            token: "t".to_string(),
            expires_at: Some(now + Duration::seconds(30)),
        };
        assert!(cred.is_stale(now, Duration::seconds(60)));
        assert!(!cred.is_stale(now, Duration::seconds(10)));

        let forever = Credential {
            token: "t".to_string(),
            expires_at: None,
        };
        assert!(!forever.is_stale(now, Duration::seconds(60)));
    }
}
