//! Persisted unit records plus the opaque per-unit state blobs.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use unitvisor_runtime::UnitStatus;

use crate::error::UnitError;
use crate::model::Unit;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersistedUnit {
    #[serde(flatten)]
    pub unit: Unit,
    /// Bundled source, carried beside the record so a reload can start the
    /// unit without fetching it again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    #[serde(default)]
    pub units: BTreeMap<String, PersistedUnit>,
    #[serde(default)]
    pub unit_states: BTreeMap<String, String>,
}

impl PersistedState {
    /// Builds the on-disk view: units still installing are left out and
    /// every written unit is marked stopped.
    pub fn capture<'a>(
        units: impl IntoIterator<Item = &'a Unit>,
        unit_states: &BTreeMap<String, String>,
        source_of: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut state = PersistedState::default();
        for unit in units {
            if unit.status == UnitStatus::Installing {
                continue;
            }
            let mut unit = unit.clone();
            unit.status = UnitStatus::Stopped;
            let source_code = source_of(&unit.id);
            if let Some(blob) = unit_states.get(&unit.id) {
                state.unit_states.insert(unit.id.clone(), blob.clone());
            }
            state
                .units
                .insert(unit.id.clone(), PersistedUnit { unit, source_code });
        }
        state
    }

    /// Splits into in-memory records and the source companions keyed by id.
    pub fn into_parts(
        self,
    ) -> (
        BTreeMap<String, Unit>,
        BTreeMap<String, String>,
        BTreeMap<String, Option<String>>,
    ) {
        let mut units = BTreeMap::new();
        let mut sources = BTreeMap::new();
        for (id, persisted) in self.units {
            sources.insert(id.clone(), persisted.source_code);
            units.insert(id, persisted.unit);
        }
        let unit_states = self
            .unit_states
            .into_iter()
            .filter(|(id, _)| units.contains_key(id))
            .collect();
        (units, unit_states, sources)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, UnitError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, UnitError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

pub fn load_state(path: impl AsRef<Path>) -> Result<PersistedState> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(PersistedState::default());
    }
    let bytes =
        std::fs::read(path).with_context(|| format!("reading state {}", path.display()))?;
    PersistedState::decode(&bytes).with_context(|| format!("decoding state {}", path.display()))
}

/// Writes through a sibling temp file and renames it into place.
pub fn save_state(path: impl AsRef<Path>, state: &PersistedState) -> Result<()> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let bytes = state.encode()?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("persisting state {}", path.display()))?;
    Ok(())
}

pub fn encode_state_blob(value: &Value) -> Result<String, UnitError> {
    let json = serde_json::to_vec(value)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}

pub fn decode_state_blob(blob: &str) -> Result<Value, UnitError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(blob.trim())
        .map_err(|err| UnitError::Codec(format!("state blob is not base64: {err}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}
