//! Nimbus Core - Shared types and traits
//!
//! This crate defines the abstractions shared by:
//! - nimbus-orchestrator (provisioning engine + `nimbus` CLI)
//! - the HTTP adapters for the orchestration, identity and workflow services
//!
//! Key types:
//! - OrchestrationService / IdentityProvider / WorkflowEngine traits
//! - Stack status, resources and lifecycle events
//! - ServiceError

pub mod types;
pub mod traits;
pub mod error;

pub use types::*;
pub use traits::*;
pub use error::*;
