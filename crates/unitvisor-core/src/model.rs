use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use unitvisor_runtime::UnitStatus;

use crate::error::UnitError;

/// Grant other subjects hold to talk to a unit; its caveat lists unit ids.
pub const UNIT_ACCESS_PERMISSION: &str = "unit_access";
pub const UNIT_IDS_CAVEAT: &str = "unit_ids";
/// Units holding this grant are never bounded by a request timer.
pub const LONG_RUNNING_PERMISSION: &str = "endowment:long-running";
pub const MAX_REQUEST_TIME_CAVEAT: &str = "max_request_time";
pub const ORIGINS_CAVEAT: &str = "origins";
pub const ENDOWMENTS_CAVEAT: &str = "endowments";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Caveat {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
}

impl Caveat {
    pub fn new(kind: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caveats: Vec<Caveat>,
}

impl PermissionSpec {
    pub fn with_caveat(kind: impl Into<String>, value: Value) -> Self {
        Self {
            caveats: vec![Caveat::new(kind, value)],
        }
    }

    pub fn caveat(&self, kind: &str) -> Option<&Caveat> {
        self.caveats.iter().find(|caveat| caveat.kind == kind)
    }
}

/// Permission name to its caveats. Ordered so diffs and approvals render stably.
pub type PermissionMap = BTreeMap<String, PermissionSpec>;

/// Which callers a request-routing handler accepts.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OriginPolicy {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Any installed unit may call.
    #[serde(default)]
    pub units: bool,
    /// Any caller that is not a unit may call.
    #[serde(default)]
    pub callers: bool,
}

impl OriginPolicy {
    pub fn allows(&self, origin: &str, origin_is_unit: bool) -> bool {
        if self.allowed_origins.iter().any(|allowed| allowed == origin) {
            return true;
        }
        if origin_is_unit {
            self.units
        } else {
            self.callers
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UnitManifest {
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_name: Option<String>,
    /// Path of the bundled source, fetched through the unit's location.
    pub entry_point: String,
    /// Lowercase hex SHA-256 of the bundled source.
    pub checksum: String,
    #[serde(default)]
    pub initial_permissions: PermissionMap,
}

impl UnitManifest {
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.entry_point.trim().is_empty() {
            report.push_error("entry_point", "entry point is required");
        }
        if self.checksum.trim().is_empty() {
            report.push_error("checksum", "checksum is required");
        } else if self.checksum.len() != 64
            || !self.checksum.chars().all(|c| c.is_ascii_hexdigit())
        {
            report.push_error("checksum", "checksum must be a hex encoded SHA-256 digest");
        }
        for name in self.initial_permissions.keys() {
            if name.trim().is_empty() {
                report.push_error("initial_permissions", "permission names cannot be empty");
            }
        }

        report
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push_error<S: Into<String>>(&mut self, field: S, message: S) {
        self.errors.push(ValidationIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn into_result(self, subject: &str) -> Result<(), UnitError> {
        if self.is_success() {
            return Ok(());
        }
        let details: Vec<String> = self
            .errors
            .iter()
            .map(|issue| format!("{}: {}", issue.field, issue.message))
            .collect();
        Err(UnitError::Validation(format!(
            "invalid manifest for `{subject}`: {}",
            details.join(", ")
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockReason {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VersionHistoryEntry {
    pub version: Version,
    pub origin: String,
    pub date: DateTime<Utc>,
}

/// Persisted record of an installed unit. Source code is kept out of the
/// record and lives with the unit's runtime data.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Unit {
    pub id: String,
    pub version: Version,
    pub manifest: UnitManifest,
    pub status: UnitStatus,
    pub enabled: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,
    #[serde(default)]
    pub version_history: Vec<VersionHistoryEntry>,
}

impl Unit {
    pub fn is_runnable(&self) -> bool {
        self.enabled && !self.blocked
    }
}

/// Caller-facing view of a unit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TruncatedUnit {
    pub id: String,
    pub version: Version,
    pub enabled: bool,
    pub blocked: bool,
    pub initial_permissions: PermissionMap,
}

impl From<&Unit> for TruncatedUnit {
    fn from(unit: &Unit) -> Self {
        Self {
            id: unit.id.clone(),
            version: unit.version.clone(),
            enabled: unit.enabled,
            blocked: unit.blocked,
            initial_permissions: unit.manifest.initial_permissions.clone(),
        }
    }
}

/// Unit ids take the form `<scheme>:<name>`, e.g. `registry:weather` or
/// `local:http://localhost:8080`.
pub fn validate_unit_id(id: &str) -> Result<(), UnitError> {
    let Some((scheme, rest)) = id.split_once(':') else {
        return Err(UnitError::Validation(format!(
            "invalid unit id `{id}`: expected `<scheme>:<name>`"
        )));
    };
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(UnitError::Validation(format!(
            "invalid unit id `{id}`: scheme must be lowercase ASCII letters"
        )));
    }
    if rest.is_empty() || rest.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(UnitError::Validation(format!(
            "invalid unit id `{id}`: name must be non-empty and contain no whitespace"
        )));
    }
    Ok(())
}

/// Parses a requested version range; blank means any version.
pub fn parse_version_range(raw: &str) -> Result<VersionReq, UnitError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "latest" {
        return Ok(VersionReq::STAR);
    }
    VersionReq::parse(trimmed)
        .map_err(|err| UnitError::Validation(format!("invalid version range `{raw}`: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> UnitManifest {
        UnitManifest {
            version: Version::new(1, 0, 0),
            proposed_name: Some("Demo".into()),
            entry_point: "dist/bundle.js".into(),
            checksum: "a".repeat(64),
            initial_permissions: PermissionMap::new(),
        }
    }

    #[test]
    fn unit_ids_need_scheme_and_name() {
        validate_unit_id("registry:weather").expect("registry id");
        validate_unit_id("local:http://localhost:8080").expect("local id");
        assert!(validate_unit_id("weather").is_err());
        assert!(validate_unit_id(":weather").is_err());
        assert!(validate_unit_id("Local:weather").is_err());
        assert!(validate_unit_id("local:").is_err());
        assert!(validate_unit_id("local:two words").is_err());
    }

    #[test]
    fn version_ranges_default_to_any() {
        let any = parse_version_range("").expect("blank range");
        assert!(any.matches(&Version::new(3, 1, 4)));
        let latest = parse_version_range("latest").expect("latest tag");
        assert_eq!(latest, VersionReq::STAR);
        let bounded = parse_version_range(">=1.0.1").expect("bounded range");
        assert!(!bounded.matches(&Version::new(1, 0, 0)));
        assert!(parse_version_range("not a range").is_err());
    }

    #[test]
    fn manifest_validation_reports_each_problem() {
        let mut broken = manifest();
        broken.entry_point = " ".into();
        broken.checksum = "xyz".into();
        let report = broken.validate();
        assert_eq!(report.errors.len(), 2);
        let err = report
            .into_result("local:demo")
            .expect_err("invalid manifest");
        assert!(err.to_string().contains("entry_point"));
        assert!(err.to_string().contains("checksum"));

        manifest()
            .validate()
            .into_result("local:demo")
            .expect("valid manifest");
    }

    #[test]
    fn origin_policy_distinguishes_units_from_callers() {
        let policy = OriginPolicy {
            allowed_origins: vec!["https://dapp.example".into()],
            units: true,
            callers: false,
        };
        assert!(policy.allows("https://dapp.example", false));
        assert!(policy.allows("local:other", true));
        assert!(!policy.allows("https://elsewhere.example", false));
        assert!(!OriginPolicy::default().allows("local:other", true));
    }

    #[test]
    fn caveats_use_type_key_on_the_wire() {
        let spec = PermissionSpec::with_caveat(MAX_REQUEST_TIME_CAVEAT, json!(1500));
        let encoded = serde_json::to_value(&spec).expect("encode spec");
        assert_eq!(encoded["caveats"][0]["type"], "max_request_time");
        assert_eq!(spec.caveat(MAX_REQUEST_TIME_CAVEAT).map(|c| &c.value), Some(&json!(1500)));
        assert!(spec.caveat(ORIGINS_CAVEAT).is_none());
    }
}
