use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Entry points a unit can expose. Each one is guarded by its own
/// endowment permission.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    Rpc,
    Keyring,
    Cron,
    Transaction,
    Lifecycle,
}

impl HandlerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerType::Rpc => "rpc",
            HandlerType::Keyring => "keyring",
            HandlerType::Cron => "cron",
            HandlerType::Transaction => "transaction",
            HandlerType::Lifecycle => "lifecycle",
        }
    }

    /// Permission a unit must hold before requests of this type reach it.
    pub fn endowment(&self) -> &'static str {
        match self {
            HandlerType::Rpc => "endowment:rpc",
            HandlerType::Keyring => "endowment:keyring",
            HandlerType::Cron => "endowment:cronjob",
            HandlerType::Transaction => "endowment:transaction-insight",
            HandlerType::Lifecycle => "endowment:lifecycle-hooks",
        }
    }

    /// Handlers that accept requests from arbitrary callers and therefore
    /// consult the unit's origin policy.
    pub fn routes_requests(&self) -> bool {
        matches!(self, HandlerType::Rpc | HandlerType::Keyring)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequest {
    pub origin: String,
    pub handler: HandlerType,
    pub request: Value,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("launch failure: {0}")]
    Launch(String),
    #[error("unit `{0}` is not running")]
    NotRunning(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("terminated: {0}")]
    Terminated(String),
}

/// Out-of-band notifications emitted by the sandbox.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionEvent {
    UnhandledError { unit_id: String, error: Value },
    OutboundRequestStarted { unit_id: String },
    OutboundRequestFinished { unit_id: String },
}

impl ExecutionEvent {
    pub fn unit_id(&self) -> &str {
        match self {
            ExecutionEvent::UnhandledError { unit_id, .. }
            | ExecutionEvent::OutboundRequestStarted { unit_id }
            | ExecutionEvent::OutboundRequestFinished { unit_id } => unit_id,
        }
    }
}

#[async_trait::async_trait]
pub trait ExecutionService: Send + Sync {
    async fn execute(
        &self,
        unit_id: &str,
        source: &str,
        endowments: &[String],
    ) -> Result<(), ExecutionError>;

    async fn terminate(&self, unit_id: &str) -> Result<(), ExecutionError>;

    async fn terminate_all(&self) -> Result<(), ExecutionError>;

    async fn dispatch(
        &self,
        unit_id: &str,
        request: DispatchRequest,
    ) -> Result<Value, ExecutionError>;

    fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent>;
}
