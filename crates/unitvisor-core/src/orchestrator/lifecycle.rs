use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use semver::{Version, VersionReq};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use unitvisor_events::topics;
use unitvisor_runtime::{StatusEvent, StopReason, UnitStatus};

use super::{Inner, Orchestrator};
use crate::collaborators::{
    ApprovalKind, PendingApproval, RegistryQuery, RegistryStatus, RegistryVerdict, UnitLocation,
};
use crate::error::UnitError;
use crate::model::{
    parse_version_range, validate_unit_id, BlockReason, Caveat, PermissionMap, TruncatedUnit,
    Unit, UnitManifest, VersionHistoryEntry, UNIT_ACCESS_PERMISSION, UNIT_IDS_CAVEAT,
};
use crate::permissions::PermissionDiff;
use crate::util::sha256_hex;

/// Manifest and source as fetched from a location, checksum verified.
struct FetchedUnit {
    manifest: UnitManifest,
    source: String,
}

async fn fetch_unit(id: &str, location: &dyn UnitLocation) -> Result<FetchedUnit, UnitError> {
    let manifest = location.manifest().await?;
    manifest.validate().into_result(id)?;
    let bytes = location.fetch(&manifest.entry_point).await?;
    let checksum = sha256_hex(&bytes);
    if !checksum.eq_ignore_ascii_case(manifest.checksum.trim()) {
        return Err(UnitError::Validation(format!(
            "checksum mismatch for unit `{id}`: manifest declares {}, source hashes to {checksum}",
            manifest.checksum
        )));
    }
    let source = String::from_utf8(bytes).map_err(|err| {
        UnitError::Validation(format!("source of unit `{id}` is not valid UTF-8: {err}"))
    })?;
    if source.trim().is_empty() {
        return Err(UnitError::Validation(format!(
            "source of unit `{id}` is empty"
        )));
    }
    Ok(FetchedUnit { manifest, source })
}

/// Ids touched by an install batch, for cleanup if the batch fails.
#[derive(Default)]
struct BatchProgress {
    installed: Vec<String>,
    updated: Vec<String>,
}

impl Orchestrator {
    /// Installs or updates every requested unit (id to version range). Units
    /// are processed in id order. Either the whole batch succeeds or new and
    /// force-reinstalled units are removed and updated units are rolled back.
    pub async fn install(
        self: &Arc<Self>,
        origin: &str,
        requested: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, TruncatedUnit>, UnitError> {
        let mut progress = BatchProgress::default();
        match self.install_batch(origin, requested, &mut progress).await {
            Ok(results) => {
                for id in &progress.installed {
                    if let Some(unit) = self.get_truncated(id) {
                        self.bus.publish(
                            topics::TOPIC_UNIT_INSTALLED,
                            &json!({ "unit": unit, "origin": origin }),
                        );
                    }
                }
                let updated: Vec<(String, Version)> = {
                    let inner = self.lock();
                    progress
                        .updated
                        .iter()
                        .filter_map(|id| {
                            inner
                                .rollbacks
                                .get(id)
                                .filter(|snapshot| snapshot.is_dirty())
                                .map(|snapshot| (id.clone(), snapshot.prior.version.clone()))
                        })
                        .collect()
                };
                for (id, previous) in &updated {
                    if let Some(unit) = self.get_truncated(id) {
                        self.publish_updated(origin, &unit, previous);
                    }
                }
                self.lock().rollbacks.discard(&progress.updated);
                Ok(results)
            }
            Err(err) => {
                error!(
                    target: "unitvisor::orchestrator",
                    origin = %origin,
                    error = %err,
                    "install batch failed; reverting"
                );
                if let Err(cleanup) = self.remove(&progress.installed).await {
                    warn!(
                        target: "unitvisor::orchestrator",
                        error = %cleanup,
                        "failed to remove units from failed batch"
                    );
                }
                self.rollback_all(&progress.updated).await;
                Err(err)
            }
        }
    }

    async fn install_batch(
        self: &Arc<Self>,
        origin: &str,
        requested: &BTreeMap<String, String>,
        progress: &mut BatchProgress,
    ) -> Result<BTreeMap<String, TruncatedUnit>, UnitError> {
        let mut results = BTreeMap::new();
        for (id, raw_range) in requested {
            validate_unit_id(id)?;
            let range = parse_version_range(raw_range)?;
            let location = self.services.locations.resolve(id, &range)?;
            let existing = self.get_truncated(id);

            if let Some(existing) = existing.as_ref() {
                if !location.should_always_reload() {
                    if range.matches(&existing.version) {
                        results.insert(id.clone(), existing.clone());
                        continue;
                    }
                    self.create_snapshot(id)?;
                    progress.updated.push(id.clone());
                    let updated = self
                        .update_unit(origin, id, location, range.clone(), true)
                        .await?
                        .ok_or_else(|| UnitError::NoSatisfyingVersion {
                            id: id.clone(),
                            installed: existing.version.to_string(),
                            range: range.to_string(),
                        })?;
                    results.insert(id.clone(), updated);
                    continue;
                }
            }
            // Forced reinstalls count as new: a failed batch removes them.
            progress.installed.push(id.clone());

            let unit = self.install_unit(origin, id, location, range).await?;
            results.insert(id.clone(), unit);
        }
        Ok(results)
    }

    /// Fresh install, or forced reinstall from an always-reload location.
    async fn install_unit(
        self: &Arc<Self>,
        origin: &str,
        id: &str,
        location: Arc<dyn UnitLocation>,
        range: VersionReq,
    ) -> Result<TruncatedUnit, UnitError> {
        if self.has(id) {
            self.stop_unit(id, StopReason::Stop).await?;
            self.services.permissions.revoke_all(id).await?;
        }

        let approval = self.services.approvals.add_request(
            ApprovalKind::Install,
            json!({ "origin": origin, "unit_id": id, "loading": true }),
        );
        self.bus.publish(
            topics::TOPIC_UNIT_INSTALL_STARTED,
            &json!({ "unit_id": id, "origin": origin }),
        );
        let mut current_approval = approval.id.clone();

        let outcome = async {
            self.add(origin, id, location, range).await?;
            self.authorize(id, approval).await?;

            let result_approval = self.services.approvals.add_request(
                ApprovalKind::Result,
                json!({ "origin": origin, "unit_id": id, "loading": true }),
            );
            current_approval = result_approval.id;
            self.run_start(id).await?;
            self.get_truncated(id)
                .ok_or_else(|| UnitError::NotFound(id.to_string()))
        }
        .await;

        match outcome {
            Ok(unit) => {
                self.services.approvals.update_request_state(
                    &current_approval,
                    json!({ "loading": false, "type": ApprovalKind::Install.as_str() }),
                );
                info!(
                    target: "unitvisor::orchestrator",
                    unit = %id,
                    version = %unit.version,
                    "unit installed"
                );
                Ok(unit)
            }
            Err(err) => {
                error!(
                    target: "unitvisor::orchestrator",
                    unit = %id,
                    error = %err,
                    "failed to install unit"
                );
                self.services.approvals.update_request_state(
                    &current_approval,
                    json!({
                        "loading": false,
                        "type": ApprovalKind::Install.as_str(),
                        "error": err.to_string(),
                    }),
                );
                self.bus.publish(
                    topics::TOPIC_UNIT_INSTALL_FAILED,
                    &json!({ "unit_id": id, "origin": origin, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Fetches and registers the unit. Concurrent installs of the same id
    /// share one in-flight future until authorization finishes.
    async fn add(
        self: &Arc<Self>,
        origin: &str,
        id: &str,
        location: Arc<dyn UnitLocation>,
        range: VersionReq,
    ) -> Result<(), UnitError> {
        let install = {
            let mut inner = self.lock();
            let data = inner.runtime.setup(id, UnitStatus::Installing);
            if let Some(install) = data.install_in_flight.clone() {
                install
            } else {
                let orchestrator = Arc::clone(self);
                let origin = origin.to_string();
                let unit_id = id.to_string();
                let install = async move {
                    orchestrator
                        .fetch_and_register(&origin, &unit_id, location.as_ref(), &range)
                        .await
                }
                .boxed()
                .shared();
                data.install_in_flight = Some(install.clone());
                install
            }
        };
        let result = install.await;
        if result.is_err() {
            self.clear_install_in_flight(id);
            let orphaned = !self.has(id);
            if orphaned {
                self.lock().runtime.remove(id);
            }
        }
        result
    }

    fn clear_install_in_flight(&self, id: &str) {
        if let Some(data) = self.lock().runtime.get_mut(id) {
            data.install_in_flight = None;
        }
    }

    async fn fetch_and_register(
        &self,
        origin: &str,
        id: &str,
        location: &dyn UnitLocation,
        range: &VersionReq,
    ) -> Result<(), UnitError> {
        let fetched = fetch_unit(id, location).await?;
        if !range.matches(&fetched.manifest.version) {
            return Err(UnitError::Validation(format!(
                "version mismatch for unit `{id}`: fetched {} which is outside `{range}`",
                fetched.manifest.version
            )));
        }
        self.assert_install_allowed(id, &fetched.manifest).await?;
        self.set_unit(origin, id, fetched, false);
        Ok(())
    }

    /// Rejects excluded permissions, blocked versions and, when configured,
    /// units that are not on the registry allow-list.
    async fn assert_install_allowed(
        &self,
        id: &str,
        manifest: &UnitManifest,
    ) -> Result<(), UnitError> {
        for name in manifest.initial_permissions.keys() {
            if let Some(reason) = self.config.excluded_permissions.get(name) {
                return Err(UnitError::Unauthorized(format!(
                    "unit `{id}` requests `{name}`, which is not available: {reason}"
                )));
            }
        }

        let query = BTreeMap::from([(
            id.to_string(),
            RegistryQuery {
                version: manifest.version.to_string(),
                checksum: manifest.checksum.clone(),
            },
        )]);
        let verdicts = self
            .services
            .registry
            .get(&query)
            .await
            .map_err(|err| UnitError::Registry(format!("registry lookup failed: {err}")))?;
        let verdict = verdicts
            .get(id)
            .cloned()
            .unwrap_or_else(|| RegistryVerdict::new(RegistryStatus::Unavailable));

        if verdict.status == RegistryStatus::Blocked {
            let explanation = verdict
                .reason
                .and_then(|reason| reason.explanation)
                .unwrap_or_default();
            return Err(UnitError::Registry(
                format!(
                    "cannot install version {} of unit `{id}`: the version is blocked. {explanation}",
                    manifest.version
                )
                .trim_end()
                .to_string(),
            ));
        }

        let needs_allowlist = manifest.initial_permissions.keys().any(|name| {
            !self
                .config
                .allowlist_exempt_permissions
                .iter()
                .any(|exempt| exempt == name)
        });
        if self.config.require_allowlist
            && needs_allowlist
            && verdict.status != RegistryStatus::Verified
        {
            let detail = if verdict.status == RegistryStatus::Unavailable {
                "the allow-list is temporarily unavailable; try again later"
            } else {
                "the version is not on the allow-list"
            };
            return Err(UnitError::Registry(format!(
                "cannot install version {} of unit `{id}`: {detail}",
                manifest.version
            )));
        }
        Ok(())
    }

    /// Writes the unit record and caches its source.
    fn set_unit(&self, origin: &str, id: &str, fetched: FetchedUnit, is_update: bool) {
        let FetchedUnit { manifest, source } = fetched;
        let mut inner = self.lock();
        let existing = inner.units.get(id);
        let mut version_history = existing
            .map(|unit| unit.version_history.clone())
            .unwrap_or_default();
        version_history.push(VersionHistoryEntry {
            version: manifest.version.clone(),
            origin: origin.to_string(),
            date: Utc::now(),
        });
        let status = match existing {
            Some(unit) if is_update => unit.status,
            _ => UnitStatus::Installing,
        };
        let unit = Unit {
            id: id.to_string(),
            version: manifest.version.clone(),
            manifest,
            status,
            enabled: true,
            blocked: false,
            block_reason: None,
            version_history,
        };
        inner.units.insert(id.to_string(), unit);
        let data = inner.runtime.setup(id, status);
        data.interpreter.reset(status);
        data.source_code = Some(source);
    }

    /// Shows the requested permissions to the user and grants what they approve.
    async fn authorize(&self, id: &str, approval: PendingApproval) -> Result<(), UnitError> {
        let result = async {
            let unit = self.get_expect(id)?;
            let PendingApproval { id: approval_id, decision } = approval;
            self.services.approvals.update_request_state(
                &approval_id,
                json!({
                    "loading": false,
                    "unit_id": id,
                    "version": unit.version.to_string(),
                    "permissions": unit.manifest.initial_permissions,
                }),
            );
            let decision = decision.await?;
            if !decision.permissions.is_empty() {
                self.services
                    .permissions
                    .grant(id, &decision.permissions, &decision.request_data)
                    .await?;
            }
            Ok::<(), UnitError>(())
        }
        .await;
        self.clear_install_in_flight(id);
        result
    }

    /// Replaces an installed unit with a newer version from `location`.
    /// Returns `None` if the location offers nothing newer.
    pub async fn update(
        self: &Arc<Self>,
        origin: &str,
        id: &str,
        location: Arc<dyn UnitLocation>,
        version_range: Option<&str>,
    ) -> Result<Option<TruncatedUnit>, UnitError> {
        let range = parse_version_range(version_range.unwrap_or_default())?;
        self.update_unit(origin, id, location, range, false).await
    }

    pub(super) async fn update_unit(
        self: &Arc<Self>,
        origin: &str,
        id: &str,
        location: Arc<dyn UnitLocation>,
        range: VersionReq,
        in_batch: bool,
    ) -> Result<Option<TruncatedUnit>, UnitError> {
        let previous = self.get_expect(id)?;
        let fetched = fetch_unit(id, location.as_ref()).await?;
        if fetched.manifest.version <= previous.version {
            warn!(
                target: "unitvisor::orchestrator",
                unit = %id,
                installed = %previous.version,
                candidate = %fetched.manifest.version,
                range = %range,
                "update skipped; installed version is not older than the candidate"
            );
            return Ok(None);
        }

        let approval = self.services.approvals.add_request(
            ApprovalKind::Update,
            json!({ "origin": origin, "unit_id": id, "loading": true }),
        );
        self.bus.publish(
            topics::TOPIC_UNIT_INSTALL_STARTED,
            &json!({ "unit_id": id, "origin": origin, "update": true }),
        );
        let mut current_approval = approval.id.clone();

        let outcome = self
            .apply_update(
                origin,
                id,
                fetched,
                &range,
                approval,
                &mut current_approval,
                in_batch,
            )
            .await;

        match outcome {
            Ok(unit) => {
                self.services.approvals.update_request_state(
                    &current_approval,
                    json!({ "loading": false, "type": ApprovalKind::Update.as_str() }),
                );
                if !in_batch {
                    self.publish_updated(origin, &unit, &previous.version);
                }
                info!(
                    target: "unitvisor::orchestrator",
                    unit = %id,
                    from = %previous.version,
                    to = %unit.version,
                    "unit updated"
                );
                Ok(Some(unit))
            }
            Err(err) => {
                error!(
                    target: "unitvisor::orchestrator",
                    unit = %id,
                    error = %err,
                    "failed to update unit"
                );
                self.services.approvals.update_request_state(
                    &current_approval,
                    json!({
                        "loading": false,
                        "type": ApprovalKind::Update.as_str(),
                        "error": err.to_string(),
                    }),
                );
                self.bus.publish(
                    topics::TOPIC_UNIT_INSTALL_FAILED,
                    &json!({ "unit_id": id, "origin": origin, "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_update(
        self: &Arc<Self>,
        origin: &str,
        id: &str,
        fetched: FetchedUnit,
        range: &VersionReq,
        approval: PendingApproval,
        current_approval: &mut String,
        in_batch: bool,
    ) -> Result<TruncatedUnit, UnitError> {
        let new_version = fetched.manifest.version.clone();
        if !range.matches(&new_version) {
            return Err(UnitError::Validation(format!(
                "version mismatch for unit `{id}`: fetched {new_version} which is outside `{range}`"
            )));
        }
        self.assert_install_allowed(id, &fetched.manifest).await?;

        let granted = self.services.permissions.get_permissions(id).await;
        let diff = PermissionDiff::compute(&fetched.manifest.initial_permissions, &granted);
        let PendingApproval {
            id: approval_id,
            decision,
        } = approval;
        self.services.approvals.update_request_state(
            &approval_id,
            json!({
                "loading": false,
                "unit_id": id,
                "new_version": new_version.to_string(),
                "permissions": diff.new,
                "new_permissions": diff.new,
                "approved_permissions": diff.approved,
                "unused_permissions": diff.unused,
            }),
        );
        let decision = decision.await?;

        let result_approval = self.services.approvals.add_request(
            ApprovalKind::Result,
            json!({ "origin": origin, "unit_id": id, "loading": true }),
        );
        *current_approval = result_approval.id;

        if in_batch {
            self.mark_snapshot_dirty(id, &new_version);
        }
        self.stop_unit(id, StopReason::Stop).await?;
        self.transition(id, StatusEvent::Update)?;
        self.set_unit(origin, id, fetched, true);

        self.update_permissions(id, &diff.unused, &decision.permissions, &decision.request_data)
            .await?;
        if in_batch {
            self.record_snapshot_permissions(
                id,
                diff.unused.clone(),
                decision.permissions.clone(),
                decision.request_data.clone(),
            );
        }

        if let Err(err) = self.run_start(id).await {
            error!(
                target: "unitvisor::orchestrator",
                unit = %id,
                error = %err,
                "updated unit failed to start"
            );
            self.mark_crashed(id);
            return Err(UnitError::CrashedWithUpdatedSource(id.to_string()));
        }
        self.get_truncated(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))
    }

    /// Leaves a unit whose new source failed to start as `Crashed`, so the
    /// next request starts it again.
    fn mark_crashed(&self, id: &str) {
        let truncated = {
            let mut inner = self.lock();
            let Inner { units, runtime, .. } = &mut *inner;
            let (Some(unit), Some(data)) = (units.get_mut(id), runtime.get_mut(id)) else {
                return;
            };
            data.interpreter.reset(UnitStatus::Crashed);
            unit.status = UnitStatus::Crashed;
            TruncatedUnit::from(&*unit)
        };
        self.publish_unit(topics::TOPIC_UNIT_CRASHED, &truncated);
    }

    fn publish_updated(&self, origin: &str, unit: &TruncatedUnit, previous: &Version) {
        self.bus.publish(
            topics::TOPIC_UNIT_UPDATED,
            &json!({
                "unit": unit,
                "previous_version": previous.to_string(),
                "origin": origin,
            }),
        );
    }

    /// Revokes `revoke` and grants `grant` on the unit.
    pub(super) async fn update_permissions(
        &self,
        id: &str,
        revoke: &PermissionMap,
        grant: &PermissionMap,
        request_data: &Value,
    ) -> Result<(), UnitError> {
        if !revoke.is_empty() {
            let names: Vec<String> = revoke.keys().cloned().collect();
            self.services.permissions.revoke(id, &names).await?;
        }
        if !grant.is_empty() {
            self.services
                .permissions
                .grant(id, grant, request_data)
                .await?;
        }
        Ok(())
    }

    /// Removes each unit independently. Every id is attempted; the first
    /// failure is returned once all have finished.
    pub async fn remove(&self, ids: &[String]) -> Result<(), UnitError> {
        let outcomes = join_all(ids.iter().map(|id| self.remove_unit(id))).await;
        outcomes.into_iter().collect()
    }

    async fn remove_unit(&self, id: &str) -> Result<(), UnitError> {
        let unit = self.get_expect(id)?;
        let truncated = TruncatedUnit::from(&unit);

        self.disable(id).await?;
        self.services.permissions.revoke_all(id).await?;
        self.remove_unit_access(id).await?;
        {
            let mut inner = self.lock();
            inner.runtime.remove(id);
            inner.units.remove(id);
            inner.unit_states.remove(id);
            inner.starts.remove(id);
        }

        if unit.status != UnitStatus::Installing {
            self.publish_unit(topics::TOPIC_UNIT_UNINSTALLED, &truncated);
        }
        self.publish_unit(topics::TOPIC_UNIT_REMOVED, &truncated);
        info!(target: "unitvisor::orchestrator", unit = %id, "unit removed");
        Ok(())
    }

    /// Drops `id` from every other subject's grant to use units.
    async fn remove_unit_access(&self, id: &str) -> Result<(), UnitError> {
        let subjects = self
            .services
            .permissions
            .subjects_with_permission(UNIT_ACCESS_PERMISSION)
            .await;
        for subject in subjects {
            let granted = self.services.permissions.get_permissions(&subject).await;
            let Some(units) = granted
                .get(UNIT_ACCESS_PERMISSION)
                .and_then(|spec| spec.caveat(UNIT_IDS_CAVEAT))
                .and_then(|caveat| caveat.value.as_object())
            else {
                continue;
            };
            if !units.contains_key(id) {
                continue;
            }
            let mut remaining = units.clone();
            remaining.remove(id);
            if remaining.is_empty() {
                self.services
                    .permissions
                    .revoke(&subject, &[UNIT_ACCESS_PERMISSION.to_string()])
                    .await?;
            } else {
                self.services
                    .permissions
                    .update_caveat(
                        &subject,
                        UNIT_ACCESS_PERMISSION,
                        Caveat::new(UNIT_IDS_CAVEAT, Value::Object(remaining)),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Asks the registry about every installed unit and blocks or unblocks
    /// them accordingly.
    pub async fn update_blocked_units(&self) -> Result<(), UnitError> {
        let query: BTreeMap<String, RegistryQuery> = self
            .lock()
            .units
            .values()
            .map(|unit| {
                (
                    unit.id.clone(),
                    RegistryQuery {
                        version: unit.version.to_string(),
                        checksum: unit.manifest.checksum.clone(),
                    },
                )
            })
            .collect();
        if query.is_empty() {
            return Ok(());
        }
        let verdicts = self
            .services
            .registry
            .get(&query)
            .await
            .map_err(|err| UnitError::Registry(format!("registry lookup failed: {err}")))?;

        join_all(verdicts.into_iter().map(|(id, verdict)| async move {
            if verdict.status == RegistryStatus::Blocked {
                self.block_unit(&id, verdict.reason.unwrap_or_default())
                    .await;
            } else {
                self.unblock_unit(&id);
            }
        }))
        .await;
        Ok(())
    }

    async fn block_unit(&self, id: &str, reason: BlockReason) {
        {
            let mut inner = self.lock();
            let Some(unit) = inner.units.get_mut(id) else {
                return;
            };
            unit.blocked = true;
            unit.block_reason = Some(reason.clone());
        }
        match self.disable(id).await {
            Ok(()) | Err(UnitError::NotFound(_)) => {}
            Err(err) => error!(
                target: "unitvisor::orchestrator",
                unit = %id,
                error = %err,
                "failed to disable blocked unit"
            ),
        }
        let Some(unit) = self.get_truncated(id) else {
            return;
        };
        self.bus.publish(
            topics::TOPIC_UNIT_BLOCKED,
            &json!({ "unit": unit, "reason": reason }),
        );
        warn!(target: "unitvisor::orchestrator", unit = %id, "unit blocked");
    }

    fn unblock_unit(&self, id: &str) {
        let truncated = {
            let mut inner = self.lock();
            let Some(unit) = inner.units.get_mut(id) else {
                return;
            };
            if !unit.blocked {
                return;
            }
            unit.blocked = false;
            unit.block_reason = None;
            TruncatedUnit::from(&*unit)
        };
        self.publish_unit(topics::TOPIC_UNIT_UNBLOCKED, &truncated);
        info!(target: "unitvisor::orchestrator", unit = %id, "unit unblocked");
    }
}
