//! Lifecycle orchestration for sandboxed units.
//!
//! All in-memory state sits behind one short-lived mutex that is never held
//! across an `.await`; the suspension points are collaborator calls and
//! waits on shared start/install futures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use unitvisor_events::{topics, Bus};
use unitvisor_runtime::{StatusEvent, StopReason, TransitionGuard, UnitStatus};

use crate::admission::RequestAdmissionQueue;
use crate::collaborators::Collaborators;
use crate::config::OrchestratorConfig;
use crate::error::UnitError;
use crate::model::{TruncatedUnit, Unit};
use crate::registry::RuntimeRegistry;
use crate::rollback::RollbackLedger;
use crate::state::{decode_state_blob, encode_state_blob, PersistedState};

mod background;
mod lifecycle;
mod requests;
mod rollback;

pub use requests::{normalize_request, RequestHandler, PROTOCOL_VERSION};

/// Shared start of one unit; every caller waiting for it awaits a clone.
type StartFuture = Shared<BoxFuture<'static, Result<(), UnitError>>>;

struct Inner {
    units: BTreeMap<String, Unit>,
    unit_states: BTreeMap<String, String>,
    runtime: RuntimeRegistry,
    rollbacks: RollbackLedger,
    admission: RequestAdmissionQueue,
    starts: HashMap<String, StartFuture>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    services: Collaborators,
    bus: Bus,
    inner: Mutex<Inner>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Builds the orchestrator from persisted state and spawns the execution
    /// event listener and the idle reaper. Must be called inside a tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        services: Collaborators,
        bus: Bus,
        persisted: PersistedState,
    ) -> Arc<Self> {
        let (mut units, unit_states, mut sources) = persisted.into_parts();
        let mut runtime = RuntimeRegistry::new();
        for (id, unit) in units.iter_mut() {
            unit.status = UnitStatus::Stopped;
            let data = runtime.setup(id, unit.status);
            data.source_code = sources.remove(id).flatten();
        }
        let loaded = units.len();

        let orchestrator = Arc::new(Self {
            inner: Mutex::new(Inner {
                units,
                unit_states,
                runtime,
                rollbacks: RollbackLedger::new(),
                admission: RequestAdmissionQueue::new(config.max_admission_queue),
                starts: HashMap::new(),
            }),
            config,
            services,
            bus,
            cancel: CancellationToken::new(),
        });
        orchestrator.spawn_event_listener();
        orchestrator.spawn_idle_reaper();
        info!(
            target: "unitvisor::orchestrator",
            units = loaded,
            "orchestrator ready"
        );
        orchestrator
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn has(&self, id: &str) -> bool {
        self.lock().units.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Unit> {
        self.lock().units.get(id).cloned()
    }

    pub fn get_truncated(&self, id: &str) -> Option<TruncatedUnit> {
        self.lock().units.get(id).map(TruncatedUnit::from)
    }

    pub fn all_units(&self) -> Vec<Unit> {
        self.lock().units.values().cloned().collect()
    }

    /// Units that are enabled and not blocked.
    pub fn runnable_units(&self) -> Vec<Unit> {
        self.lock()
            .units
            .values()
            .filter(|unit| unit.is_runnable())
            .cloned()
            .collect()
    }

    pub fn status(&self, id: &str) -> Option<UnitStatus> {
        self.lock().units.get(id).map(|unit| unit.status)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.status(id) == Some(UnitStatus::Running)
    }

    pub fn pending_request_count(&self, id: &str) -> usize {
        self.lock()
            .runtime
            .get(id)
            .map(|data| data.pending_inbound().len())
            .unwrap_or(0)
    }

    pub fn active_references(&self, id: &str) -> usize {
        self.lock()
            .runtime
            .get(id)
            .map(|data| data.active_references())
            .unwrap_or(0)
    }

    pub async fn registry_metadata(&self, id: &str) -> Result<Option<Value>, UnitError> {
        Ok(self.services.registry.get_metadata(id).await?)
    }

    fn get_expect(&self, id: &str) -> Result<Unit, UnitError> {
        self.get(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))
    }

    fn cached_source(&self, id: &str) -> Option<String> {
        self.lock()
            .runtime
            .get(id)
            .and_then(|data| data.source_code.clone())
    }

    /// Feeds `event` to the unit's interpreter and mirrors the result into
    /// its record.
    fn transition(&self, id: &str, event: StatusEvent) -> Result<UnitStatus, UnitError> {
        let mut inner = self.lock();
        let Inner { units, runtime, .. } = &mut *inner;
        let unit = units
            .get_mut(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
        let data = runtime
            .get_mut(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
        let status = data
            .interpreter
            .send(event, TransitionGuard::enabled(unit.enabled))?;
        unit.status = status;
        Ok(status)
    }

    fn publish_unit(&self, topic: &str, unit: &TruncatedUnit) {
        self.bus.publish(topic, &json!({ "unit": unit }));
    }

    /// Starts an enabled unit with its cached source. Joins a start of the
    /// same unit that is already under way.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<(), UnitError> {
        let unit = self.get_expect(id)?;
        if !unit.enabled {
            return Err(UnitError::Disabled(id.to_string()));
        }
        self.run_start(id).await
    }

    /// The start of `id` that has not completed yet, if any.
    fn in_flight_start(inner: &Inner, id: &str) -> Option<StartFuture> {
        inner
            .starts
            .get(id)
            .filter(|start| start.peek().is_none())
            .cloned()
    }

    /// Spawns `start_unit` and records it as the unit's shared start.
    fn begin_start(self: &Arc<Self>, inner: &mut Inner, id: &str) -> StartFuture {
        let orchestrator = Arc::clone(self);
        let unit_id = id.to_string();
        let task = tokio::spawn(async move { orchestrator.start_unit(&unit_id).await });
        let unit_id = id.to_string();
        let start = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(UnitError::Crashed {
                    id: unit_id,
                    message: format!("start task failed: {err}"),
                }),
            }
        }
        .boxed()
        .shared();
        inner.starts.insert(id.to_string(), start.clone());
        start
    }

    /// Drops the shared start entry once `start` has completed.
    fn release_start(inner: &mut Inner, id: &str, start: &StartFuture) {
        let current = inner
            .starts
            .get(id)
            .is_some_and(|entry| entry.ptr_eq(start));
        if current && start.peek().is_some() {
            inner.starts.remove(id);
        }
    }

    /// Starts the unit through its shared start entry so that at most one
    /// `start_unit` runs per unit.
    pub(super) async fn run_start(self: &Arc<Self>, id: &str) -> Result<(), UnitError> {
        let start = {
            let mut inner = self.lock();
            let in_flight = Self::in_flight_start(&inner, id);
            match in_flight {
                Some(start) => start,
                None => self.begin_start(&mut inner, id),
            }
        };
        let outcome = start.clone().await;
        Self::release_start(&mut self.lock(), id, &start);
        outcome
    }

    async fn start_unit(&self, id: &str) -> Result<(), UnitError> {
        if self.is_running(id) {
            return Err(UnitError::AlreadyRunning(id.to_string()));
        }
        let source = self.cached_source(id).ok_or_else(|| {
            UnitError::Validation(format!("no source code is cached for unit `{id}`"))
        })?;
        let endowments = self.endowments(id).await?;

        if let Err(err) = self
            .services
            .execution
            .execute(id, &source, &endowments)
            .await
        {
            self.terminate(id).await;
            return Err(err.into());
        }
        if let Err(err) = self.transition(id, StatusEvent::Start) {
            // Another start already owns the live instance.
            if self.status(id) == Some(UnitStatus::Running) {
                return Err(UnitError::AlreadyRunning(id.to_string()));
            }
            self.terminate(id).await;
            return Err(err);
        }
        let truncated = {
            let mut inner = self.lock();
            if let Some(data) = inner.runtime.get_mut(id) {
                data.last_request_finished_at = Some(Instant::now());
            }
            inner.units.get(id).map(TruncatedUnit::from)
        };
        if let Some(unit) = truncated {
            self.publish_unit(topics::TOPIC_UNIT_STARTED, &unit);
        }
        info!(target: "unitvisor::orchestrator", unit = %id, "unit started");
        Ok(())
    }

    async fn terminate(&self, id: &str) {
        if let Err(err) = self.services.execution.terminate(id).await {
            warn!(
                target: "unitvisor::orchestrator",
                unit = %id,
                error = %err,
                "execution service failed to terminate unit"
            );
        }
    }

    /// Default endowments plus whatever the unit's environment grants add.
    async fn endowments(&self, id: &str) -> Result<Vec<String>, UnitError> {
        let mut granted = Vec::new();
        for permission in &self.config.environment_endowment_permissions {
            if self.services.permissions.has_permission(id, permission).await {
                granted.extend(
                    self.services
                        .permissions
                        .get_endowment_values(id, permission)
                        .await?,
                );
            }
        }
        let total = self.config.default_endowments.len() + granted.len();
        let mut seen = HashSet::new();
        let endowments: Vec<String> = self
            .config
            .default_endowments
            .iter()
            .chain(granted.iter())
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect();
        if endowments.len() < total {
            debug!(
                target: "unitvisor::orchestrator",
                unit = %id,
                "duplicate endowments requested; keeping one of each"
            );
        }
        Ok(endowments)
    }

    /// Stops a running unit. Fails if the unit is not running.
    pub async fn stop(&self, id: &str, reason: StopReason) -> Result<(), UnitError> {
        if !self.has(id) {
            return Err(UnitError::NotFound(id.to_string()));
        }
        if !self.stop_unit(id, reason).await? {
            return Err(UnitError::NotRunning(id.to_string()));
        }
        Ok(())
    }

    /// Stops the unit if it is running. Returns whether it was.
    async fn stop_unit(&self, id: &str, reason: StopReason) -> Result<bool, UnitError> {
        let (abandoned, truncated) = {
            let mut inner = self.lock();
            let Inner { units, runtime, .. } = &mut *inner;
            let (Some(unit), Some(data)) = (units.get_mut(id), runtime.get_mut(id)) else {
                return Ok(false);
            };
            if unit.status != UnitStatus::Running {
                return Ok(false);
            }
            let status = data
                .interpreter
                .send(reason.event(), TransitionGuard::enabled(unit.enabled))?;
            unit.status = status;
            (data.clear_pending(), TruncatedUnit::from(&*unit))
        };

        self.terminate(id).await;
        for timer in abandoned {
            timer.finish();
        }
        let topic = match reason {
            StopReason::Stop => topics::TOPIC_UNIT_STOPPED,
            StopReason::Crash => topics::TOPIC_UNIT_CRASHED,
        };
        self.publish_unit(topic, &truncated);
        info!(
            target: "unitvisor::orchestrator",
            unit = %id,
            reason = reason.event().as_str(),
            "unit stopped"
        );
        Ok(true)
    }

    /// Stops the unit after a failure, logging instead of propagating.
    async fn crash(&self, id: &str) {
        if let Err(err) = self.stop_unit(id, StopReason::Crash).await {
            warn!(
                target: "unitvisor::orchestrator",
                unit = %id,
                error = %err,
                "failed to stop crashed unit"
            );
        }
    }

    pub async fn stop_all(&self, reason: StopReason) {
        let running: Vec<String> = self
            .lock()
            .units
            .values()
            .filter(|unit| unit.status == UnitStatus::Running)
            .map(|unit| unit.id.clone())
            .collect();
        for id in running {
            if let Err(err) = self.stop_unit(&id, reason).await {
                warn!(
                    target: "unitvisor::orchestrator",
                    unit = %id,
                    error = %err,
                    "failed to stop unit"
                );
            }
        }
    }

    pub fn enable(&self, id: &str) -> Result<(), UnitError> {
        let truncated = {
            let mut inner = self.lock();
            let unit = inner
                .units
                .get_mut(id)
                .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
            if unit.blocked {
                return Err(UnitError::Blocked(id.to_string()));
            }
            unit.enabled = true;
            TruncatedUnit::from(&*unit)
        };
        self.publish_unit(topics::TOPIC_UNIT_ENABLED, &truncated);
        Ok(())
    }

    /// Clears `enabled` and stops the unit if it is running. Idempotent.
    pub async fn disable(&self, id: &str) -> Result<(), UnitError> {
        {
            let mut inner = self.lock();
            let unit = inner
                .units
                .get_mut(id)
                .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
            unit.enabled = false;
        }
        self.stop_unit(id, StopReason::Stop).await?;
        if let Some(unit) = self.get_truncated(id) {
            self.publish_unit(topics::TOPIC_UNIT_DISABLED, &unit);
        }
        Ok(())
    }

    pub fn increment_active_references(&self, id: &str) -> Result<usize, UnitError> {
        let mut inner = self.lock();
        let data = inner
            .runtime
            .get_mut(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
        data.active_references += 1;
        Ok(data.active_references)
    }

    pub fn decrement_active_references(&self, id: &str) -> Result<usize, UnitError> {
        let mut inner = self.lock();
        let data = inner
            .runtime
            .get_mut(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
        if data.active_references == 0 {
            return Err(UnitError::References(id.to_string()));
        }
        data.active_references -= 1;
        Ok(data.active_references)
    }

    /// The unit's own state, decoded once and then served from memory.
    pub fn get_unit_state(&self, id: &str) -> Result<Option<Value>, UnitError> {
        let mut inner = self.lock();
        let Inner {
            runtime,
            unit_states,
            ..
        } = &mut *inner;
        let data = runtime
            .get_mut(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
        if let Some(state) = &data.decrypted_state {
            return Ok(Some(state.clone()));
        }
        let Some(blob) = unit_states.get(id) else {
            return Ok(None);
        };
        let state = decode_state_blob(blob)?;
        data.decrypted_state = Some(state.clone());
        Ok(Some(state))
    }

    pub fn update_unit_state(&self, id: &str, state: Value) -> Result<(), UnitError> {
        let blob = encode_state_blob(&state)?;
        {
            let mut inner = self.lock();
            let Inner {
                runtime,
                unit_states,
                ..
            } = &mut *inner;
            let data = runtime
                .get_mut(id)
                .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
            data.decrypted_state = Some(state);
            unit_states.insert(id.to_string(), blob);
        }
        self.bus
            .publish(topics::TOPIC_UNIT_STATE_CHANGED, &json!({ "unit_id": id }));
        Ok(())
    }

    pub fn clear_unit_state(&self, id: &str) -> Result<(), UnitError> {
        {
            let mut inner = self.lock();
            let data = inner
                .runtime
                .get_mut(id)
                .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
            data.decrypted_state = None;
            inner.unit_states.remove(id);
        }
        self.bus
            .publish(topics::TOPIC_UNIT_STATE_CHANGED, &json!({ "unit_id": id }));
        Ok(())
    }

    /// What should be written to disk right now.
    pub fn persisted_state(&self) -> PersistedState {
        let inner = self.lock();
        PersistedState::capture(inner.units.values(), &inner.unit_states, |id| {
            inner
                .runtime
                .get(id)
                .and_then(|data| data.source_code.clone())
        })
    }

    /// Stops every unit, revokes their permissions and forgets them.
    pub async fn clear_state(&self) {
        self.stop_all(StopReason::Stop).await;
        let ids: Vec<String> = self.lock().units.keys().cloned().collect();
        for id in &ids {
            if let Err(err) = self.services.permissions.revoke_all(id).await {
                warn!(
                    target: "unitvisor::orchestrator",
                    unit = %id,
                    error = %err,
                    "failed to revoke permissions while clearing state"
                );
            }
        }
        if let Err(err) = self.services.execution.terminate_all().await {
            warn!(
                target: "unitvisor::orchestrator",
                error = %err,
                "execution service failed to terminate all units"
            );
        }
        {
            let mut inner = self.lock();
            inner.units.clear();
            inner.unit_states.clear();
            inner.runtime.clear();
            inner.rollbacks.clear();
            inner.starts.clear();
        }
        info!(
            target: "unitvisor::orchestrator",
            units = ids.len(),
            "cleared all units"
        );
    }

    /// Cancels background tasks and stops everything that is running.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.stop_all(StopReason::Stop).await;
        if let Err(err) = self.services.execution.terminate_all().await {
            warn!(
                target: "unitvisor::orchestrator",
                error = %err,
                "execution service failed to terminate all units"
            );
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
