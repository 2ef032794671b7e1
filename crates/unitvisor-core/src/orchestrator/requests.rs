use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use unitvisor_runtime::{DispatchRequest, ExecutionError, HandlerType, UnitStatus};
use uuid::Uuid;

use super::{Orchestrator, StartFuture};
use crate::error::UnitError;
use crate::model::{OriginPolicy, LONG_RUNNING_PERMISSION, MAX_REQUEST_TIME_CAVEAT, ORIGINS_CAVEAT};
use crate::timer::Timer;

pub const PROTOCOL_VERSION: &str = "2.0";

/// Request entry point bound to one unit. Cached per unit and shared by
/// every caller that talks to it.
pub struct RequestHandler {
    unit_id: String,
    orchestrator: Weak<Orchestrator>,
}

impl RequestHandler {
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub async fn handle(
        &self,
        origin: &str,
        handler: HandlerType,
        request: Value,
    ) -> Result<Value, UnitError> {
        let orchestrator = self
            .orchestrator
            .upgrade()
            .ok_or_else(|| UnitError::NotFound(self.unit_id.clone()))?;
        orchestrator
            .dispatch_request(&self.unit_id, origin, handler, request)
            .await
    }
}

/// Fills in the protocol version and request id, rejecting envelopes that
/// claim a different protocol.
pub fn normalize_request(request: Value) -> Result<Value, UnitError> {
    let Value::Object(mut envelope) = request else {
        return Err(UnitError::Validation(
            "request must be a JSON object".into(),
        ));
    };
    match envelope.get("jsonrpc") {
        None => {
            envelope.insert("jsonrpc".into(), Value::String(PROTOCOL_VERSION.into()));
        }
        Some(Value::String(version)) if version == PROTOCOL_VERSION => {}
        Some(other) => {
            return Err(UnitError::Validation(format!(
                "unsupported protocol version {other}; expected \"{PROTOCOL_VERSION}\""
            )));
        }
    }
    if !envelope.get("method").is_some_and(Value::is_string) {
        return Err(UnitError::Validation(
            "request method must be a string".into(),
        ));
    }
    match envelope.get("id") {
        None | Some(Value::Null) => {
            envelope.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        Some(Value::String(_)) | Some(Value::Number(_)) => {}
        Some(other) => {
            return Err(UnitError::Validation(format!(
                "request id must be a string or number, got {other}"
            )));
        }
    }
    Ok(Value::Object(envelope))
}

fn request_id(envelope: &Map<String, Value>) -> String {
    match envelope.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(other) => other.to_string(),
        None => Uuid::new_v4().to_string(),
    }
}

/// Keeps the origin's admission slot and the shared start entry accounted
/// for even if the waiting caller is dropped.
struct StartWaiter<'a> {
    orchestrator: &'a Orchestrator,
    unit_id: &'a str,
    origin: &'a str,
    start: StartFuture,
}

impl Drop for StartWaiter<'_> {
    fn drop(&mut self) {
        let mut inner = self.orchestrator.lock();
        inner.admission.decrement(self.origin);
        Orchestrator::release_start(&mut inner, self.unit_id, &self.start);
    }
}

impl Orchestrator {
    /// Routes a request from `origin` to the unit's `handler` entry point,
    /// starting the unit on demand.
    pub async fn handle_request(
        self: &Arc<Self>,
        id: &str,
        origin: &str,
        handler: HandlerType,
        request: Value,
    ) -> Result<Value, UnitError> {
        self.get_expect(id)?;
        let permission = handler.endowment();
        if !self
            .services
            .permissions
            .has_permission(id, permission)
            .await
        {
            return Err(UnitError::Unauthorized(format!(
                "unit `{id}` does not hold `{permission}` and cannot handle {} requests",
                handler.as_str()
            )));
        }
        if handler.routes_requests() {
            self.assert_origin_allowed(id, origin, permission).await?;
        }
        let request_handler = self.request_handler(id)?;
        request_handler.handle(origin, handler, request).await
    }

    /// The unit's shared request entry point, created on first use.
    pub fn request_handler(self: &Arc<Self>, id: &str) -> Result<Arc<RequestHandler>, UnitError> {
        let mut inner = self.lock();
        let data = inner
            .runtime
            .get_mut(id)
            .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
        let handler = data.request_handler.get_or_insert_with(|| {
            Arc::new(RequestHandler {
                unit_id: id.to_string(),
                orchestrator: Arc::downgrade(self),
            })
        });
        Ok(Arc::clone(handler))
    }

    async fn assert_origin_allowed(
        &self,
        id: &str,
        origin: &str,
        permission: &str,
    ) -> Result<(), UnitError> {
        let granted = self.services.permissions.get_permissions(id).await;
        let policy = granted
            .get(permission)
            .and_then(|spec| spec.caveat(ORIGINS_CAVEAT))
            .and_then(|caveat| serde_json::from_value::<OriginPolicy>(caveat.value.clone()).ok());
        let origin_is_unit = self.has(origin);
        if policy.is_some_and(|policy| policy.allows(origin, origin_is_unit)) {
            return Ok(());
        }
        Err(UnitError::Unauthorized(format!(
            "unit `{id}` is not permitted to handle requests from `{origin}`"
        )))
    }

    /// `None` when the unit may run without a deadline.
    async fn request_timeout(&self, id: &str, handler: HandlerType) -> Option<Duration> {
        if self
            .services
            .permissions
            .has_permission(id, LONG_RUNNING_PERMISSION)
            .await
        {
            return None;
        }
        let granted = self.services.permissions.get_permissions(id).await;
        let ms = granted
            .get(handler.endowment())
            .and_then(|spec| spec.caveat(MAX_REQUEST_TIME_CAVEAT))
            .and_then(|caveat| caveat.value.as_u64())
            .unwrap_or(self.config.max_request_time_ms);
        Some(Duration::from_millis(ms))
    }

    pub(super) async fn dispatch_request(
        self: &Arc<Self>,
        id: &str,
        origin: &str,
        handler: HandlerType,
        request: Value,
    ) -> Result<Value, UnitError> {
        let unit = self.get_expect(id)?;
        if !unit.enabled {
            return Err(UnitError::Disabled(id.to_string()));
        }
        if matches!(unit.status, UnitStatus::Installing | UnitStatus::Updating) {
            return Err(UnitError::Installing(id.to_string()));
        }

        let request = normalize_request(request)?;
        let timeout = self.request_timeout(id, handler).await;
        if !self.is_running(id) {
            self.await_start(id, origin, timeout).await?;
        }

        let request_id = request
            .as_object()
            .map(request_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let timer = timeout.map(Timer::new);
        {
            let mut inner = self.lock();
            let data = inner
                .runtime
                .get_mut(id)
                .ok_or_else(|| UnitError::NotFound(id.to_string()))?;
            data.record_request_started(request_id.clone(), timer.clone());
        }
        if let Some(timer) = &timer {
            // A fresh timer always starts.
            let _ = timer.start();
        }

        let dispatch = self.services.execution.dispatch(
            id,
            DispatchRequest {
                origin: origin.to_string(),
                handler,
                request,
            },
        );
        let outcome = match &timer {
            Some(timer) => tokio::select! {
                result = dispatch => Some(result),
                _ = timer.expired() => None,
            },
            None => Some(dispatch.await),
        };

        let still_pending = self
            .lock()
            .runtime
            .get_mut(id)
            .is_some_and(|data| data.record_request_finished(&request_id));

        match outcome {
            Some(Ok(response)) => Ok(response),
            Some(Err(err)) => {
                warn!(
                    target: "unitvisor::requests",
                    unit = %id,
                    origin = %origin,
                    error = %err,
                    "unit failed to handle request"
                );
                if still_pending {
                    self.crash(id).await;
                }
                Err(crashed(id, err))
            }
            None => {
                warn!(
                    target: "unitvisor::requests",
                    unit = %id,
                    origin = %origin,
                    "unit failed to respond in time"
                );
                if still_pending {
                    self.crash(id).await;
                }
                Err(UnitError::Timeout(id.to_string()))
            }
        }
    }

    /// Starts the unit, or joins a start already under way, subject to the
    /// per-origin admission cap.
    async fn await_start(
        self: &Arc<Self>,
        id: &str,
        origin: &str,
        timeout: Option<Duration>,
    ) -> Result<(), UnitError> {
        let start = {
            let mut inner = self.lock();
            let in_flight = Self::in_flight_start(&inner, id);
            let start = match in_flight {
                Some(start) => {
                    if inner.admission.is_full(origin) {
                        debug!(
                            target: "unitvisor::requests",
                            unit = %id,
                            origin = %origin,
                            "admission queue full"
                        );
                        return Err(UnitError::AdmissionRejected(origin.to_string()));
                    }
                    start
                }
                None => self.begin_start(&mut inner, id),
            };
            inner.admission.increment(origin);
            start
        };
        let waiter = StartWaiter {
            orchestrator: self,
            unit_id: id,
            origin,
            start: start.clone(),
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, start).await {
                Ok(result) => result,
                Err(_) => Err(UnitError::Timeout(id.to_string())),
            },
            None => start.await,
        };
        drop(waiter);
        match outcome {
            Err(UnitError::AlreadyRunning(_)) => Ok(()),
            other => other,
        }
    }
}

fn crashed(id: &str, err: ExecutionError) -> UnitError {
    UnitError::Crashed {
        id: id.to_string(),
        message: err.to_string(),
    }
}
