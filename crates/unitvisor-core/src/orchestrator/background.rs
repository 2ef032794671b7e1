use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use unitvisor_events::topics;
use unitvisor_runtime::{ExecutionEvent, StopReason};

use super::Orchestrator;

impl Orchestrator {
    pub(super) fn spawn_event_listener(self: &Arc<Self>) {
        let mut events = self.services.execution.subscribe();
        let orchestrator = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => {
                            let Some(orchestrator) = orchestrator.upgrade() else {
                                break;
                            };
                            orchestrator.handle_execution_event(event).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                target: "unitvisor::orchestrator",
                                skipped,
                                "execution event listener lagged"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!(target: "unitvisor::orchestrator", "execution event listener stopped");
        });
    }

    pub(super) fn spawn_idle_reaper(self: &Arc<Self>) {
        let orchestrator = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.config.idle_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(orchestrator) = orchestrator.upgrade() else {
                            break;
                        };
                        orchestrator.reap_idle_units().await;
                    }
                }
            }
            debug!(target: "unitvisor::reaper", "idle reaper stopped");
        });
    }

    /// Applies one sandbox notification. The listener task calls this for
    /// every event it receives.
    pub async fn handle_execution_event(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::UnhandledError { unit_id, error } => {
                error!(
                    target: "unitvisor::orchestrator",
                    unit = %unit_id,
                    error = %error,
                    "unhandled error in unit"
                );
                self.bus.publish(
                    topics::TOPIC_UNIT_UNHANDLED_ERROR,
                    &json!({ "unit_id": unit_id, "error": error }),
                );
                if let Err(err) = self.stop_unit(&unit_id, StopReason::Crash).await {
                    warn!(
                        target: "unitvisor::orchestrator",
                        unit = %unit_id,
                        error = %err,
                        "failed to stop unit after unhandled error"
                    );
                }
            }
            ExecutionEvent::OutboundRequestStarted { unit_id } => {
                let paused = self
                    .lock()
                    .runtime
                    .get_mut(&unit_id)
                    .map(|data| data.record_outbound_started());
                debug!(
                    target: "unitvisor::requests",
                    unit = %unit_id,
                    paused = paused.unwrap_or(0),
                    "outbound request started"
                );
            }
            ExecutionEvent::OutboundRequestFinished { unit_id } => {
                let resumed = self
                    .lock()
                    .runtime
                    .get_mut(&unit_id)
                    .map(|data| data.record_outbound_finished());
                match resumed {
                    Some(Some(resumed)) => debug!(
                        target: "unitvisor::requests",
                        unit = %unit_id,
                        resumed,
                        "outbound request finished"
                    ),
                    Some(None) => warn!(
                        target: "unitvisor::requests",
                        unit = %unit_id,
                        "outbound request finished without a matching start"
                    ),
                    None => {}
                }
            }
        }
    }

    /// Stops every running unit that has been idle for longer than the
    /// configured limit. Returns the ids it stopped.
    pub async fn reap_idle_units(&self) -> Vec<String> {
        let idle = self
            .lock()
            .runtime
            .idle_units(Instant::now(), self.config.max_idle_time());
        let mut stopped = Vec::with_capacity(idle.len());
        for id in idle {
            match self.stop_unit(&id, StopReason::Stop).await {
                Ok(true) => {
                    debug!(target: "unitvisor::reaper", unit = %id, "stopped idle unit");
                    stopped.push(id);
                }
                Ok(false) => {}
                Err(err) => warn!(
                    target: "unitvisor::reaper",
                    unit = %id,
                    error = %err,
                    "failed to stop idle unit"
                ),
            }
        }
        stopped
    }
}
