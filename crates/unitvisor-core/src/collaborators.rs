//! Contracts for the services the orchestrator coordinates but does not own.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use unitvisor_runtime::ExecutionService;

use crate::model::{BlockReason, Caveat, PermissionMap, UnitManifest};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait PermissionAuthority: Send + Sync {
    async fn has_permission(&self, subject: &str, name: &str) -> bool;

    async fn get_permissions(&self, subject: &str) -> PermissionMap;

    async fn grant(
        &self,
        subject: &str,
        approved: &PermissionMap,
        request_data: &Value,
    ) -> Result<(), CollaboratorError>;

    async fn revoke(&self, subject: &str, names: &[String]) -> Result<(), CollaboratorError>;

    async fn revoke_all(&self, subject: &str) -> Result<(), CollaboratorError>;

    /// Environment names the grant `name` adds to the subject's sandbox.
    async fn get_endowment_values(
        &self,
        subject: &str,
        name: &str,
    ) -> Result<Vec<String>, CollaboratorError>;

    async fn subjects_with_permission(&self, name: &str) -> Vec<String>;

    /// Replaces the caveat of the same type on an existing grant.
    async fn update_caveat(
        &self,
        subject: &str,
        name: &str,
        caveat: Caveat,
    ) -> Result<(), CollaboratorError>;
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Install,
    Update,
    Result,
}

impl ApprovalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalKind::Install => "install",
            ApprovalKind::Update => "update",
            ApprovalKind::Result => "result",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApprovalDecision {
    /// Permissions the user approved; may be narrower than what was shown.
    pub permissions: PermissionMap,
    /// Opaque data handed back to the permission authority on grant.
    pub request_data: Value,
}

/// A request registered with the approval authority. The decision resolves
/// once the user answers.
pub struct PendingApproval {
    pub id: String,
    pub decision: BoxFuture<'static, Result<ApprovalDecision, CollaboratorError>>,
}

pub trait ApprovalAuthority: Send + Sync {
    /// Registers a request so it is visible immediately, before its data is final.
    fn add_request(&self, kind: ApprovalKind, data: Value) -> PendingApproval;

    fn update_request_state(&self, id: &str, state: Value);
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    Verified,
    Blocked,
    Unavailable,
    Unverified,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryQuery {
    pub version: String,
    pub checksum: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryVerdict {
    pub status: RegistryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<BlockReason>,
}

impl RegistryVerdict {
    pub fn new(status: RegistryStatus) -> Self {
        Self {
            status,
            reason: None,
        }
    }
}

#[async_trait]
pub trait RegistryService: Send + Sync {
    async fn get(
        &self,
        query: &BTreeMap<String, RegistryQuery>,
    ) -> Result<BTreeMap<String, RegistryVerdict>, CollaboratorError>;

    async fn get_metadata(&self, id: &str) -> Result<Option<Value>, CollaboratorError>;
}

/// Where a unit's manifest and bundled files come from.
#[async_trait]
pub trait UnitLocation: Send + Sync {
    async fn manifest(&self) -> Result<UnitManifest, CollaboratorError>;

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, CollaboratorError>;

    /// Development locations are reinstalled on every request.
    fn should_always_reload(&self) -> bool {
        false
    }
}

pub trait LocationResolver: Send + Sync {
    fn resolve(
        &self,
        id: &str,
        range: &VersionReq,
    ) -> Result<Arc<dyn UnitLocation>, CollaboratorError>;
}

/// Every collaborator the orchestrator needs, bundled for construction.
#[derive(Clone)]
pub struct Collaborators {
    pub execution: Arc<dyn ExecutionService>,
    pub permissions: Arc<dyn PermissionAuthority>,
    pub approvals: Arc<dyn ApprovalAuthority>,
    pub registry: Arc<dyn RegistryService>,
    pub locations: Arc<dyn LocationResolver>,
}
