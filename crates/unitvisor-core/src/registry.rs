use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::time::Instant;
use unitvisor_runtime::{StatusMachine, UnitStatus};

use crate::error::UnitError;
use crate::orchestrator::RequestHandler;
use crate::timer::{Timer, TimerStatus};

/// Memoized fetch-and-register work shared by concurrent installs of one unit.
pub(crate) type InstallFuture = Shared<BoxFuture<'static, Result<(), UnitError>>>;

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    /// `None` for units allowed to run without a deadline.
    pub timer: Option<Timer>,
}

/// Ephemeral bookkeeping for one installed unit. Never persisted.
pub struct RuntimeData {
    pub(crate) source_code: Option<String>,
    pub(crate) decrypted_state: Option<Value>,
    pub(crate) active_references: usize,
    pub(crate) pending_inbound: Vec<PendingRequest>,
    pub(crate) pending_outbound: usize,
    pub(crate) last_request_finished_at: Option<Instant>,
    pub(crate) install_in_flight: Option<InstallFuture>,
    pub(crate) request_handler: Option<Arc<RequestHandler>>,
    pub(crate) interpreter: StatusMachine,
}

impl RuntimeData {
    pub fn new(status: UnitStatus) -> Self {
        Self {
            source_code: None,
            decrypted_state: None,
            active_references: 0,
            pending_inbound: Vec::new(),
            pending_outbound: 0,
            last_request_finished_at: None,
            install_in_flight: None,
            request_handler: None,
            interpreter: StatusMachine::with_state(status),
        }
    }

    pub fn status(&self) -> UnitStatus {
        self.interpreter.state()
    }

    pub fn active_references(&self) -> usize {
        self.active_references
    }

    pub fn pending_inbound(&self) -> &[PendingRequest] {
        &self.pending_inbound
    }

    pub fn pending_outbound(&self) -> usize {
        self.pending_outbound
    }

    pub fn last_request_finished_at(&self) -> Option<Instant> {
        self.last_request_finished_at
    }

    pub fn record_request_started(&mut self, request_id: String, timer: Option<Timer>) {
        self.pending_inbound.push(PendingRequest { request_id, timer });
        self.last_request_finished_at = None;
    }

    /// Returns false when the request was already cleared, e.g. by a stop.
    pub fn record_request_finished(&mut self, request_id: &str) -> bool {
        let Some(index) = self
            .pending_inbound
            .iter()
            .position(|pending| pending.request_id == request_id)
        else {
            return false;
        };
        self.pending_inbound.remove(index);
        if self.pending_inbound.is_empty() {
            self.last_request_finished_at = Some(Instant::now());
        }
        true
    }

    /// Pauses every running request timer. Returns how many were paused.
    pub fn record_outbound_started(&mut self) -> usize {
        self.pending_outbound += 1;
        self.timers()
            .filter(|timer| timer.status() == TimerStatus::Running)
            .filter(|timer| timer.pause().is_ok())
            .count()
    }

    /// Resumes paused timers once the last outbound request finishes.
    /// Returns `None` if no outbound request was outstanding.
    pub fn record_outbound_finished(&mut self) -> Option<usize> {
        if self.pending_outbound == 0 {
            return None;
        }
        self.pending_outbound -= 1;
        if self.pending_outbound > 0 {
            return Some(0);
        }
        Some(
            self.timers()
                .filter(|timer| timer.status() == TimerStatus::Paused)
                .filter(|timer| timer.resume().is_ok())
                .count(),
        )
    }

    /// Drops all request bookkeeping and hands back the timers of the
    /// abandoned requests so their callers can be released.
    pub fn clear_pending(&mut self) -> Vec<Timer> {
        self.pending_outbound = 0;
        self.last_request_finished_at = None;
        self.pending_inbound
            .drain(..)
            .filter_map(|pending| pending.timer)
            .collect()
    }

    pub fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        if self.active_references > 0 || !self.pending_inbound.is_empty() {
            return false;
        }
        self.last_request_finished_at
            .map(|finished| now.saturating_duration_since(finished) > max_idle)
            .unwrap_or(false)
    }

    fn timers(&self) -> impl Iterator<Item = &Timer> {
        self.pending_inbound
            .iter()
            .filter_map(|pending| pending.timer.as_ref())
    }
}

#[derive(Default)]
pub struct RuntimeRegistry {
    entries: HashMap<String, RuntimeData>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unit's runtime data, creating it in `status` if missing.
    pub fn setup(&mut self, id: &str, status: UnitStatus) -> &mut RuntimeData {
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| RuntimeData::new(status))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&RuntimeData> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut RuntimeData> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<RuntimeData> {
        self.entries.remove(id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Running units that have sat idle for longer than `max_idle`.
    pub fn idle_units(&self, now: Instant, max_idle: Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, data)| data.status() == UnitStatus::Running)
            .filter(|(_, data)| data.is_idle(now, max_idle))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> RuntimeData {
        RuntimeData::new(UnitStatus::Running)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_requires_no_references_and_no_pending_requests() {
        let max_idle = Duration::from_secs(30);
        let mut data = running();
        assert!(!data.is_idle(Instant::now(), max_idle), "never served a request");

        data.record_request_started("1".into(), None);
        assert!(data.record_request_finished("1"));
        let later = Instant::now() + Duration::from_secs(31);
        assert!(data.is_idle(later, max_idle));

        data.active_references = 1;
        assert!(!data.is_idle(later, max_idle));
        data.active_references = 0;

        data.record_request_started("2".into(), None);
        assert!(!data.is_idle(later, max_idle));
        assert!(data.last_request_finished_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_requests_pause_and_resume_running_timers() {
        let mut data = running();
        let first = Timer::new(Duration::from_secs(1));
        let second = Timer::new(Duration::from_secs(1));
        first.start().expect("start first");
        second.start().expect("start second");
        data.record_request_started("a".into(), Some(first.clone()));
        data.record_request_started("b".into(), Some(second.clone()));
        data.record_request_started("c".into(), None);

        assert_eq!(data.record_outbound_started(), 2);
        assert_eq!(data.record_outbound_started(), 0, "already paused");
        assert_eq!(first.status(), TimerStatus::Paused);

        assert_eq!(data.record_outbound_finished(), Some(0), "one still outstanding");
        assert_eq!(second.status(), TimerStatus::Paused);
        assert_eq!(data.record_outbound_finished(), Some(2));
        assert_eq!(first.status(), TimerStatus::Running);
        assert_eq!(second.status(), TimerStatus::Running);
        assert_eq!(data.record_outbound_finished(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_pending_returns_abandoned_timers() {
        let mut data = running();
        let timer = Timer::new(Duration::from_secs(5));
        data.record_request_started("a".into(), Some(timer));
        data.record_request_started("b".into(), None);
        data.record_outbound_started();

        let abandoned = data.clear_pending();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(data.pending_outbound(), 0);
        assert!(data.pending_inbound().is_empty());
        assert!(!data.record_request_finished("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn registry_reports_only_idle_running_units() {
        let mut registry = RuntimeRegistry::new();
        for id in ["local:b", "local:a"] {
            let data = registry.setup(id, UnitStatus::Running);
            data.record_request_started("x".into(), None);
            data.record_request_finished("x");
        }
        registry
            .setup("local:stopped", UnitStatus::Stopped)
            .last_request_finished_at = Some(Instant::now());

        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(
            registry.idle_units(later, Duration::from_secs(5)),
            vec!["local:a".to_string(), "local:b".to_string()]
        );
        assert!(registry.idle_units(later, Duration::from_secs(60)).is_empty());
        assert_eq!(registry.ids().len(), 3);
    }
}
