use std::collections::HashMap;

use semver::Version;
use serde_json::Value;

use crate::error::UnitError;
use crate::model::{PermissionMap, Unit};

/// Everything needed to put a unit back the way it was before a batch
/// touched it.
#[derive(Clone, Debug)]
pub struct RollbackSnapshot {
    pub prior: Unit,
    pub prior_source: Option<String>,
    /// Permissions the update revoked; re-granted on rollback.
    pub revoked: PermissionMap,
    /// Permissions the update granted; revoked on rollback.
    pub granted: PermissionMap,
    pub request_data: Value,
    /// Set once the update starts mutating the unit.
    pub new_version: Option<Version>,
}

impl RollbackSnapshot {
    pub fn new(prior: Unit, prior_source: Option<String>) -> Self {
        Self {
            prior,
            prior_source,
            revoked: PermissionMap::new(),
            granted: PermissionMap::new(),
            request_data: Value::Null,
            new_version: None,
        }
    }

    /// True when the unit was actually changed after the snapshot was taken.
    pub fn is_dirty(&self) -> bool {
        self.new_version.is_some()
    }
}

#[derive(Debug, Default)]
pub struct RollbackLedger {
    snapshots: HashMap<String, RollbackSnapshot>,
}

impl RollbackLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, id: &str, snapshot: RollbackSnapshot) -> Result<(), UnitError> {
        if self.snapshots.contains_key(id) {
            return Err(UnitError::SnapshotExists(id.to_string()));
        }
        self.snapshots.insert(id.to_string(), snapshot);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshots.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&RollbackSnapshot> {
        self.snapshots.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RollbackSnapshot> {
        self.snapshots.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<RollbackSnapshot> {
        self.snapshots.remove(id)
    }

    pub fn discard<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        for id in ids {
            self.snapshots.remove(id);
        }
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
