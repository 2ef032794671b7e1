//! Installs, runs and retires sandboxed units on behalf of callers.
//!
//! The [`Orchestrator`] owns unit records and their runtime bookkeeping and
//! drives everything else through the collaborator traits in
//! [`collaborators`]: the sandbox, the permission and approval authorities,
//! the registry and the location resolver.

pub mod admission;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod permissions;
pub mod registry;
pub mod rollback;
pub mod state;
pub mod timer;
pub mod util;

#[cfg(any(test, feature = "test_support"))]
pub mod test_support;

pub use collaborators::{
    ApprovalAuthority, ApprovalDecision, ApprovalKind, CollaboratorError, Collaborators,
    LocationResolver, PendingApproval, PermissionAuthority, RegistryQuery, RegistryService,
    RegistryStatus, RegistryVerdict, UnitLocation,
};
pub use config::{
    config_schema_json, load_config, parse_config, Config, OrchestratorConfig,
};
pub use error::{ErrorKind, UnitError};
pub use model::{
    BlockReason, Caveat, OriginPolicy, PermissionMap, PermissionSpec, TruncatedUnit, Unit,
    UnitManifest,
};
pub use orchestrator::{normalize_request, Orchestrator, RequestHandler, PROTOCOL_VERSION};
pub use state::{load_state, save_state, PersistedState};
pub use unitvisor_runtime::{HandlerType, StopReason, UnitStatus};
