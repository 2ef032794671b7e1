use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::util::{env_bool, env_u64};

pub const ENV_MAX_IDLE_MS: &str = "UNITVISOR_MAX_IDLE_MS";
pub const ENV_IDLE_CHECK_INTERVAL_MS: &str = "UNITVISOR_IDLE_CHECK_INTERVAL_MS";
pub const ENV_MAX_REQUEST_MS: &str = "UNITVISOR_MAX_REQUEST_MS";
pub const ENV_MAX_QUEUE: &str = "UNITVISOR_MAX_QUEUE";
pub const ENV_REQUIRE_ALLOWLIST: &str = "UNITVISOR_REQUIRE_ALLOWLIST";

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Idle time after which a unit with no holds and no pending requests is stopped.
    pub max_idle_time_ms: u64,
    /// Interval between idle sweeps.
    pub idle_check_interval_ms: u64,
    /// Default time a unit gets to answer a single request.
    pub max_request_time_ms: u64,
    /// Callers per origin allowed to wait on a unit that is still starting.
    pub max_admission_queue: usize,
    /// Require a `verified` registry verdict for units asking for non-exempt permissions.
    pub require_allowlist: bool,
    pub allowlist_exempt_permissions: Vec<String>,
    /// Permissions no unit may request, with the reason shown to the caller.
    pub excluded_permissions: BTreeMap<String, String>,
    /// Permissions whose endowment values are added to the unit's environment.
    pub environment_endowment_permissions: Vec<String>,
    pub default_endowments: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_idle_time_ms: 30_000,
            idle_check_interval_ms: 5_000,
            max_request_time_ms: 60_000,
            max_admission_queue: 5,
            require_allowlist: false,
            allowlist_exempt_permissions: vec![
                "endowment:rpc".into(),
                "endowment:lifecycle-hooks".into(),
                "unit_dialog".into(),
                "manage_state".into(),
            ],
            excluded_permissions: BTreeMap::new(),
            environment_endowment_permissions: vec![
                "endowment:network-access".into(),
                "endowment:webassembly".into(),
            ],
            default_endowments: [
                "console",
                "crypto",
                "Date",
                "Math",
                "setTimeout",
                "clearTimeout",
                "TextDecoder",
                "TextEncoder",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults with `UNITVISOR_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(ms) = env_u64(ENV_MAX_IDLE_MS) {
            self.max_idle_time_ms = ms;
        }
        if let Some(ms) = env_u64(ENV_IDLE_CHECK_INTERVAL_MS).filter(|ms| *ms > 0) {
            self.idle_check_interval_ms = ms;
        }
        if let Some(ms) = env_u64(ENV_MAX_REQUEST_MS) {
            self.max_request_time_ms = ms;
        }
        if let Some(max) = env_u64(ENV_MAX_QUEUE) {
            self.max_admission_queue = max as usize;
        }
        if let Some(flag) = env_bool(ENV_REQUIRE_ALLOWLIST) {
            self.require_allowlist = flag;
        }
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms.max(1))
    }

    pub fn max_request_time(&self) -> Duration {
        Duration::from_millis(self.max_request_time_ms)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

/// Validates TOML text against the schema and deserializes it. Environment
/// overrides are not applied.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut cfg =
        parse_config(&content).with_context(|| format!("invalid config {}", path.display()))?;
    cfg.orchestrator.apply_env_overrides();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard(&'static str);

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            std::env::set_var(key, value);
            Self(key)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var(self.0);
        }
    }

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.max_idle_time(), Duration::from_secs(30));
        assert_eq!(cfg.idle_check_interval(), Duration::from_secs(5));
        assert_eq!(cfg.max_request_time(), Duration::from_secs(60));
        assert_eq!(cfg.max_admission_queue, 5);
        assert!(!cfg.require_allowlist);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = parse_config(
            r#"
            [orchestrator]
            max_request_time_ms = 1500
            excluded_permissions = { "endowment:raw-keys" = "key access is not offered" }
            "#,
        )
        .expect("config parses");
        assert_eq!(cfg.orchestrator.max_request_time_ms, 1500);
        assert_eq!(cfg.orchestrator.max_idle_time_ms, 30_000);
        assert_eq!(
            cfg.orchestrator
                .excluded_permissions
                .get("endowment:raw-keys")
                .map(String::as_str),
            Some("key access is not offered")
        );
    }

    #[test]
    fn schema_rejects_unknown_and_mistyped_fields() {
        let err = parse_config("[orchestrator]\nmax_idle_ms = 10\n").expect_err("unknown key");
        assert!(err.to_string().contains("max_idle_ms"), "{err}");

        parse_config("[orchestrator]\nmax_admission_queue = \"five\"\n")
            .expect_err("string where integer expected");
    }

    #[test]
    fn schema_json_describes_orchestrator_section() {
        let schema = config_schema_json();
        let text = schema.to_string();
        assert!(text.contains("max_request_time_ms"));
        assert!(text.contains("OrchestratorConfig"));
    }

    #[test]
    #[serial]
    fn env_overrides_apply_on_load() {
        let mut file = tempfile::NamedTempFile::new().expect("temp config");
        writeln!(file, "[orchestrator]\nmax_idle_time_ms = 1000").expect("write config");
        let _idle = EnvGuard::set(ENV_MAX_IDLE_MS, "2500");
        let _allow = EnvGuard::set(ENV_REQUIRE_ALLOWLIST, "yes");
        let _queue = EnvGuard::set(ENV_MAX_QUEUE, "not-a-number");

        let cfg = load_config(file.path()).expect("load config");
        assert_eq!(cfg.orchestrator.max_idle_time_ms, 2500);
        assert!(cfg.orchestrator.require_allowlist);
        assert_eq!(cfg.orchestrator.max_admission_queue, 5);
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config("/nonexistent/unitvisor.toml").expect_err("missing file");
        assert!(err.to_string().contains("reading config"));
    }
}
