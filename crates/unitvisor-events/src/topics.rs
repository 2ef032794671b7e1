//! Canonical event topic constants for unit lifecycle notifications.
//!
//! Keep this list grouped by concern and favor dot.case names.

// Install / update
pub const TOPIC_UNIT_INSTALL_STARTED: &str = "unit.install.started";
pub const TOPIC_UNIT_INSTALL_FAILED: &str = "unit.install.failed";
pub const TOPIC_UNIT_INSTALLED: &str = "unit.installed";
pub const TOPIC_UNIT_UPDATED: &str = "unit.updated";
pub const TOPIC_UNIT_ROLLED_BACK: &str = "unit.rolled_back";

// Removal
pub const TOPIC_UNIT_REMOVED: &str = "unit.removed";
pub const TOPIC_UNIT_UNINSTALLED: &str = "unit.uninstalled";

// Registry verdicts
pub const TOPIC_UNIT_BLOCKED: &str = "unit.blocked";
pub const TOPIC_UNIT_UNBLOCKED: &str = "unit.unblocked";

// Enablement / execution
pub const TOPIC_UNIT_ENABLED: &str = "unit.enabled";
pub const TOPIC_UNIT_DISABLED: &str = "unit.disabled";
pub const TOPIC_UNIT_STARTED: &str = "unit.started";
pub const TOPIC_UNIT_STOPPED: &str = "unit.stopped";
pub const TOPIC_UNIT_CRASHED: &str = "unit.crashed";
pub const TOPIC_UNIT_UNHANDLED_ERROR: &str = "unit.unhandled_error";

// Unit-owned state
pub const TOPIC_UNIT_STATE_CHANGED: &str = "unit.state.changed";
