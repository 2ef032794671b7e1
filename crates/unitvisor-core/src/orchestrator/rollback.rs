use std::sync::Arc;

use semver::Version;
use serde_json::{json, Value};
use tracing::{error, info};
use unitvisor_events::topics;
use unitvisor_runtime::{StopReason, UnitStatus};

use super::Orchestrator;
use crate::error::UnitError;
use crate::model::PermissionMap;
use crate::rollback::RollbackSnapshot;

impl Orchestrator {
    /// Records the unit as it is now so a failed batch can put it back.
    pub(super) fn create_snapshot(&self, id: &str) -> Result<(), UnitError> {
        let mut inner = self.lock();
        let prior = inner
            .units
            .get(id)
            .cloned()
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
        let source = inner
            .runtime
            .get(id)
            .and_then(|data| data.source_code.clone());
        inner
            .rollbacks
            .create(id, RollbackSnapshot::new(prior, source))
    }

    /// Called right before an update starts changing the unit. Refreshes the
    /// saved record in case it moved since the snapshot was taken.
    pub(super) fn mark_snapshot_dirty(&self, id: &str, version: &Version) {
        let mut inner = self.lock();
        let prior = inner.units.get(id).cloned();
        let source = inner
            .runtime
            .get(id)
            .and_then(|data| data.source_code.clone());
        if let Some(snapshot) = inner.rollbacks.get_mut(id) {
            if let Some(prior) = prior {
                snapshot.prior = prior;
            }
            snapshot.prior_source = source;
            snapshot.new_version = Some(version.clone());
        }
    }

    pub(super) fn record_snapshot_permissions(
        &self,
        id: &str,
        revoked: PermissionMap,
        granted: PermissionMap,
        request_data: Value,
    ) {
        if let Some(snapshot) = self.lock().rollbacks.get_mut(id) {
            snapshot.revoked = revoked;
            snapshot.granted = granted;
            snapshot.request_data = request_data;
        }
    }

    pub fn has_snapshot(&self, id: &str) -> bool {
        self.lock().rollbacks.contains(id)
    }

    /// Restores the unit recorded in its snapshot: record, source and
    /// permissions. A unit that was running before is started again.
    pub async fn rollback_unit(self: &Arc<Self>, id: &str) -> Result<(), UnitError> {
        let snapshot = self
            .lock()
            .rollbacks
            .get(id)
            .cloned()
            .ok_or_else(|| UnitError::SnapshotMissing(id.to_string()))?;
        if !snapshot.is_dirty() {
            self.lock().rollbacks.remove(id);
            return Ok(());
        }

        self.stop_unit(id, StopReason::Stop).await?;
        if matches!(
            self.status(id),
            Some(UnitStatus::Updating | UnitStatus::Crashed)
        ) {
            self.terminate(id).await;
        }

        let from_version = self.get(id).map(|unit| unit.version.to_string());
        let RollbackSnapshot {
            prior,
            prior_source,
            revoked,
            granted,
            request_data,
            ..
        } = snapshot;
        let was_running = prior.status == UnitStatus::Running;
        {
            let mut inner = self.lock();
            let mut restored = prior;
            if was_running {
                restored.status = UnitStatus::Stopped;
            }
            let status = restored.status;
            let data = inner.runtime.setup(id, status);
            data.interpreter.reset(status);
            data.source_code = prior_source;
            inner.units.insert(id.to_string(), restored);
        }

        self.update_permissions(id, &granted, &revoked, &request_data)
            .await?;

        let enabled = self.get(id).is_some_and(|unit| unit.enabled);
        if was_running && enabled {
            if let Err(err) = self.run_start(id).await {
                error!(
                    target: "unitvisor::rollback",
                    unit = %id,
                    error = %err,
                    "failed to restart unit after rollback"
                );
            }
        }

        let unit = self.get_truncated(id);
        self.bus.publish(
            topics::TOPIC_UNIT_ROLLED_BACK,
            &json!({ "unit": unit, "from_version": from_version }),
        );
        self.lock().rollbacks.remove(id);
        info!(target: "unitvisor::rollback", unit = %id, "unit rolled back");
        Ok(())
    }

    /// Rolls back every unit that has a snapshot, logging failures.
    pub async fn rollback_all(self: &Arc<Self>, ids: &[String]) {
        for id in ids {
            if !self.has_snapshot(id) {
                continue;
            }
            if let Err(err) = self.rollback_unit(id).await {
                error!(
                    target: "unitvisor::rollback",
                    unit = %id,
                    error = %err,
                    "failed to roll back unit"
                );
                self.lock().rollbacks.remove(id);
            }
        }
    }
}
