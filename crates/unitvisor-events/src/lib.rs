use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub mod topics;

/// One lifecycle notification as subscribers receive it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    /// Publication time, RFC 3339 with millisecond precision.
    pub time: String,
    /// One of the [`topics`] constants.
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    fn stamped(kind: &str, payload: Value) -> Self {
        Self {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.to_string(),
            payload,
        }
    }
}

/// Fans unit lifecycle notifications out to every subscriber. Notifications
/// published while nobody is subscribed are dropped.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes `payload` under the `kind` topic. A payload that cannot be
    /// serialized is replaced by an object carrying the serializer error.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let payload = serde_json::to_value(payload)
            .unwrap_or_else(|err| json!({ "error": format!("unserializable payload: {err}") }));
        let _ = self.tx.send(Envelope::stamped(kind, payload));
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}
