//! In-memory collaborators for exercising the orchestrator without a
//! sandbox, a permission store or a registry behind it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use semver::{Version, VersionReq};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use unitvisor_events::Bus;
use unitvisor_runtime::{DispatchRequest, ExecutionError, ExecutionEvent, ExecutionService};

use crate::collaborators::{
    ApprovalAuthority, ApprovalDecision, ApprovalKind, CollaboratorError, Collaborators,
    LocationResolver, PendingApproval, PermissionAuthority, RegistryQuery, RegistryService,
    RegistryStatus, RegistryVerdict, UnitLocation,
};
use crate::config::OrchestratorConfig;
use crate::model::{
    BlockReason, Caveat, OriginPolicy, PermissionMap, PermissionSpec, UnitManifest,
    ENDOWMENTS_CAVEAT, ORIGINS_CAVEAT,
};
use crate::orchestrator::Orchestrator;
use crate::state::PersistedState;
use crate::util::sha256_hex;

/// Sources containing this marker fail to launch.
pub const CRASH_ON_START: &str = "// crash-on-start";

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug, Default)]
pub enum DispatchBehavior {
    /// Answer with the request that was received.
    #[default]
    Echo,
    Fail(String),
    Hang,
    Delay(Duration),
}

#[derive(Default)]
struct ExecutionState {
    running: BTreeMap<String, Vec<String>>,
    executions: BTreeMap<String, usize>,
    behavior: BTreeMap<String, DispatchBehavior>,
    dispatched: Vec<(String, DispatchRequest)>,
    execute_delay: Duration,
}

pub struct FakeExecution {
    state: Mutex<ExecutionState>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl Default for FakeExecution {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(ExecutionState::default()),
            events,
        }
    }
}

impl FakeExecution {
    pub fn set_execute_delay(&self, delay: Duration) {
        locked(&self.state).execute_delay = delay;
    }

    pub fn set_behavior(&self, unit_id: &str, behavior: DispatchBehavior) {
        locked(&self.state)
            .behavior
            .insert(unit_id.to_string(), behavior);
    }

    pub fn is_running(&self, unit_id: &str) -> bool {
        locked(&self.state).running.contains_key(unit_id)
    }

    /// How many times the unit has been launched.
    pub fn execute_count(&self, unit_id: &str) -> usize {
        locked(&self.state)
            .executions
            .get(unit_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn endowments(&self, unit_id: &str) -> Option<Vec<String>> {
        locked(&self.state).running.get(unit_id).cloned()
    }

    pub fn dispatched(&self) -> Vec<(String, DispatchRequest)> {
        locked(&self.state).dispatched.clone()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ExecutionService for FakeExecution {
    async fn execute(
        &self,
        unit_id: &str,
        source: &str,
        endowments: &[String],
    ) -> Result<(), ExecutionError> {
        let delay = {
            let mut state = locked(&self.state);
            *state.executions.entry(unit_id.to_string()).or_default() += 1;
            state.execute_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if source.contains(CRASH_ON_START) {
            return Err(ExecutionError::Launch(format!(
                "unit `{unit_id}` threw during evaluation"
            )));
        }
        locked(&self.state)
            .running
            .insert(unit_id.to_string(), endowments.to_vec());
        Ok(())
    }

    async fn terminate(&self, unit_id: &str) -> Result<(), ExecutionError> {
        locked(&self.state).running.remove(unit_id);
        Ok(())
    }

    async fn terminate_all(&self) -> Result<(), ExecutionError> {
        locked(&self.state).running.clear();
        Ok(())
    }

    async fn dispatch(
        &self,
        unit_id: &str,
        request: DispatchRequest,
    ) -> Result<Value, ExecutionError> {
        let behavior = {
            let mut state = locked(&self.state);
            if !state.running.contains_key(unit_id) {
                return Err(ExecutionError::NotRunning(unit_id.to_string()));
            }
            state
                .dispatched
                .push((unit_id.to_string(), request.clone()));
            state.behavior.get(unit_id).cloned().unwrap_or_default()
        };
        let echo = json!({ "unit_id": unit_id, "origin": request.origin, "request": request.request });
        match behavior {
            DispatchBehavior::Echo => Ok(echo),
            DispatchBehavior::Fail(message) => Err(ExecutionError::Rejected(message)),
            DispatchBehavior::Hang => std::future::pending().await,
            DispatchBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(echo)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub struct FakePermissions {
    grants: Mutex<BTreeMap<String, PermissionMap>>,
}

impl FakePermissions {
    pub fn set(&self, subject: &str, name: &str, spec: PermissionSpec) {
        locked(&self.grants)
            .entry(subject.to_string())
            .or_default()
            .insert(name.to_string(), spec);
    }

    pub fn permissions(&self, subject: &str) -> PermissionMap {
        locked(&self.grants)
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PermissionAuthority for FakePermissions {
    async fn has_permission(&self, subject: &str, name: &str) -> bool {
        locked(&self.grants)
            .get(subject)
            .is_some_and(|grants| grants.contains_key(name))
    }

    async fn get_permissions(&self, subject: &str) -> PermissionMap {
        self.permissions(subject)
    }

    async fn grant(
        &self,
        subject: &str,
        approved: &PermissionMap,
        _request_data: &Value,
    ) -> Result<(), CollaboratorError> {
        let mut grants = locked(&self.grants);
        let entry = grants.entry(subject.to_string()).or_default();
        for (name, spec) in approved {
            entry.insert(name.clone(), spec.clone());
        }
        Ok(())
    }

    async fn revoke(&self, subject: &str, names: &[String]) -> Result<(), CollaboratorError> {
        let mut grants = locked(&self.grants);
        if let Some(entry) = grants.get_mut(subject) {
            for name in names {
                entry.remove(name);
            }
            if entry.is_empty() {
                grants.remove(subject);
            }
        }
        Ok(())
    }

    async fn revoke_all(&self, subject: &str) -> Result<(), CollaboratorError> {
        locked(&self.grants).remove(subject);
        Ok(())
    }

    async fn get_endowment_values(
        &self,
        subject: &str,
        name: &str,
    ) -> Result<Vec<String>, CollaboratorError> {
        let grants = locked(&self.grants);
        let values = grants
            .get(subject)
            .and_then(|entry| entry.get(name))
            .and_then(|spec| spec.caveat(ENDOWMENTS_CAVEAT))
            .and_then(|caveat| serde_json::from_value(caveat.value.clone()).ok())
            .unwrap_or_default();
        Ok(values)
    }

    async fn subjects_with_permission(&self, name: &str) -> Vec<String> {
        locked(&self.grants)
            .iter()
            .filter(|(_, entry)| entry.contains_key(name))
            .map(|(subject, _)| subject.clone())
            .collect()
    }

    async fn update_caveat(
        &self,
        subject: &str,
        name: &str,
        caveat: Caveat,
    ) -> Result<(), CollaboratorError> {
        let mut grants = locked(&self.grants);
        let spec = grants
            .get_mut(subject)
            .and_then(|entry| entry.get_mut(name))
            .ok_or_else(|| CollaboratorError::NotFound(format!("{subject} holds no `{name}`")))?;
        spec.caveats.retain(|existing| existing.kind != caveat.kind);
        spec.caveats.push(caveat);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ApprovalRecord {
    pub id: String,
    pub kind: ApprovalKind,
    pub data: Value,
    pub updates: Vec<Value>,
}

impl ApprovalRecord {
    pub fn last_update(&self) -> Option<&Value> {
        self.updates.last()
    }
}

#[derive(Default)]
struct ApprovalState {
    next_id: u64,
    records: Vec<ApprovalRecord>,
    rejected_units: BTreeSet<String>,
}

/// Approves whatever permissions were last shown to the user, unless the
/// unit was marked for rejection. Decisions can be held back with [`hold`].
///
/// [`hold`]: FakeApprovals::hold
pub struct FakeApprovals {
    state: Arc<Mutex<ApprovalState>>,
    gate: watch::Sender<bool>,
}

impl Default for FakeApprovals {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::default(),
            gate,
        }
    }
}

impl FakeApprovals {
    pub fn reject(&self, unit_id: &str) {
        locked(&self.state)
            .rejected_units
            .insert(unit_id.to_string());
    }

    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn records(&self) -> Vec<ApprovalRecord> {
        locked(&self.state).records.clone()
    }

    pub fn records_of(&self, kind: ApprovalKind) -> Vec<ApprovalRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.kind == kind)
            .collect()
    }
}

impl ApprovalAuthority for FakeApprovals {
    fn add_request(&self, kind: ApprovalKind, data: Value) -> PendingApproval {
        let id = {
            let mut state = locked(&self.state);
            state.next_id += 1;
            let id = format!("approval-{}", state.next_id);
            state.records.push(ApprovalRecord {
                id: id.clone(),
                kind,
                data: data.clone(),
                updates: Vec::new(),
            });
            id
        };
        let state = Arc::clone(&self.state);
        let mut gate = self.gate.subscribe();
        let approval_id = id.clone();
        let decision = async move {
            gate.wait_for(|open| *open)
                .await
                .map_err(|_| CollaboratorError::Unavailable("approvals closed".into()))?;
            let state = locked(&state);
            let unit_id = data.get("unit_id").and_then(Value::as_str).unwrap_or_default();
            if state.rejected_units.contains(unit_id) {
                return Err(CollaboratorError::Rejected(format!(
                    "user rejected the request for `{unit_id}`"
                )));
            }
            let permissions = state
                .records
                .iter()
                .find(|record| record.id == approval_id)
                .and_then(|record| {
                    record
                        .updates
                        .iter()
                        .rev()
                        .find_map(|update| update.get("permissions").cloned())
                })
                .and_then(|value| serde_json::from_value::<PermissionMap>(value).ok())
                .unwrap_or_default();
            Ok(ApprovalDecision {
                permissions,
                request_data: json!({ "approval_id": approval_id }),
            })
        }
        .boxed();
        PendingApproval { id, decision }
    }

    fn update_request_state(&self, id: &str, state: Value) {
        let mut approvals = locked(&self.state);
        if let Some(record) = approvals.records.iter_mut().find(|record| record.id == id) {
            record.updates.push(state);
        }
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    verdicts: Mutex<BTreeMap<String, RegistryVerdict>>,
    metadata: Mutex<BTreeMap<String, Value>>,
    unavailable: AtomicBool,
}

impl FakeRegistry {
    pub fn set_verdict(&self, unit_id: &str, verdict: RegistryVerdict) {
        locked(&self.verdicts).insert(unit_id.to_string(), verdict);
    }

    pub fn block(&self, unit_id: &str, explanation: &str) {
        self.set_verdict(
            unit_id,
            RegistryVerdict {
                status: RegistryStatus::Blocked,
                reason: Some(BlockReason {
                    explanation: Some(explanation.to_string()),
                    url: None,
                }),
            },
        );
    }

    pub fn set_metadata(&self, unit_id: &str, metadata: Value) {
        locked(&self.metadata).insert(unit_id.to_string(), metadata);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistryService for FakeRegistry {
    async fn get(
        &self,
        query: &BTreeMap<String, RegistryQuery>,
    ) -> Result<BTreeMap<String, RegistryVerdict>, CollaboratorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("registry offline".into()));
        }
        let verdicts = locked(&self.verdicts);
        Ok(query
            .keys()
            .map(|id| {
                let verdict = verdicts
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| RegistryVerdict::new(RegistryStatus::Verified));
                (id.clone(), verdict)
            })
            .collect())
    }

    async fn get_metadata(&self, id: &str) -> Result<Option<Value>, CollaboratorError> {
        Ok(locked(&self.metadata).get(id).cloned())
    }
}

pub const ENTRY_POINT: &str = "dist/bundle.js";

/// Manifest whose checksum matches `source`.
pub fn manifest_for(version: &str, source: &str, permissions: PermissionMap) -> UnitManifest {
    UnitManifest {
        version: Version::parse(version).unwrap_or_else(|_| Version::new(0, 0, 0)),
        proposed_name: None,
        entry_point: ENTRY_POINT.to_string(),
        checksum: sha256_hex(source.as_bytes()),
        initial_permissions: permissions,
    }
}

/// `endowment:rpc` accepting calls from every non-unit caller.
pub fn rpc_permissions() -> PermissionMap {
    let policy = OriginPolicy {
        allowed_origins: Vec::new(),
        units: false,
        callers: true,
    };
    PermissionMap::from([(
        "endowment:rpc".to_string(),
        PermissionSpec::with_caveat(
            ORIGINS_CAVEAT,
            serde_json::to_value(policy).unwrap_or_default(),
        ),
    )])
}

#[derive(Clone)]
struct Release {
    manifest: UnitManifest,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct FakeLocations {
    releases: Mutex<BTreeMap<String, Vec<Release>>>,
    always_reload: Mutex<BTreeSet<String>>,
}

impl FakeLocations {
    pub fn publish(&self, id: &str, version: &str, source: &str, permissions: PermissionMap) {
        self.publish_manifest(id, manifest_for(version, source, permissions), source);
    }

    /// Publishes `source` under an arbitrary manifest, checksum included.
    pub fn publish_manifest(&self, id: &str, manifest: UnitManifest, source: &str) {
        let files = BTreeMap::from([(manifest.entry_point.clone(), source.as_bytes().to_vec())]);
        let mut releases = locked(&self.releases);
        let entry = releases.entry(id.to_string()).or_default();
        entry.retain(|release| release.manifest.version != manifest.version);
        entry.push(Release { manifest, files });
        entry.sort_by(|a, b| a.manifest.version.cmp(&b.manifest.version));
    }

    pub fn set_always_reload(&self, id: &str) {
        locked(&self.always_reload).insert(id.to_string());
    }
}

impl LocationResolver for FakeLocations {
    fn resolve(
        &self,
        id: &str,
        range: &VersionReq,
    ) -> Result<Arc<dyn UnitLocation>, CollaboratorError> {
        let releases = locked(&self.releases);
        let candidates = releases
            .get(id)
            .ok_or_else(|| CollaboratorError::NotFound(format!("no releases for `{id}`")))?;
        let release = candidates
            .iter()
            .rev()
            .find(|release| range.matches(&release.manifest.version))
            .or_else(|| candidates.last())
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("no releases for `{id}`")))?;
        let always_reload = locked(&self.always_reload).contains(id);
        Ok(Arc::new(FakeLocation {
            release,
            always_reload,
        }))
    }
}

struct FakeLocation {
    release: Release,
    always_reload: bool,
}

#[async_trait]
impl UnitLocation for FakeLocation {
    async fn manifest(&self) -> Result<UnitManifest, CollaboratorError> {
        Ok(self.release.manifest.clone())
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, CollaboratorError> {
        self.release
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(path.to_string()))
    }

    fn should_always_reload(&self) -> bool {
        self.always_reload
    }
}

/// An orchestrator wired to fresh fakes.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub execution: Arc<FakeExecution>,
    pub permissions: Arc<FakePermissions>,
    pub approvals: Arc<FakeApprovals>,
    pub registry: Arc<FakeRegistry>,
    pub locations: Arc<FakeLocations>,
    pub bus: Bus,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self::with_state(config, PersistedState::default())
    }

    pub fn with_state(config: OrchestratorConfig, persisted: PersistedState) -> Self {
        let execution = Arc::new(FakeExecution::default());
        let permissions = Arc::new(FakePermissions::default());
        let approvals = Arc::new(FakeApprovals::default());
        let registry = Arc::new(FakeRegistry::default());
        let locations = Arc::new(FakeLocations::default());
        let bus = Bus::new(256);
        let services = Collaborators {
            execution: execution.clone(),
            permissions: permissions.clone(),
            approvals: approvals.clone(),
            registry: registry.clone(),
            locations: locations.clone(),
        };
        let orchestrator = Orchestrator::new(config, services, bus.clone(), persisted);
        Self {
            orchestrator,
            execution,
            permissions,
            approvals,
            registry,
            locations,
            bus,
        }
    }

    pub fn location(&self, id: &str, range: &str) -> Arc<dyn UnitLocation> {
        let range = VersionReq::parse(range).unwrap_or(VersionReq::STAR);
        match self.locations.resolve(id, &range) {
            Ok(location) => location,
            Err(err) => panic!("no location for {id}: {err}"),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
