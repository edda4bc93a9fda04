use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// A simple broadcast bus for JSON-serializable events.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// only kept in the optional replay ring.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    replay: Option<Arc<Mutex<VecDeque<Envelope>>>>,
    replay_cap: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            replay: None,
            replay_cap: 0,
        }
    }

    /// Bus that also retains the last `replay` envelopes for late subscribers.
    pub fn new_with_replay(capacity: usize, replay: usize) -> Self {
        let mut bus = Self::new(capacity);
        if replay > 0 {
            bus.replay = Some(Arc::new(Mutex::new(VecDeque::with_capacity(replay))));
            bus.replay_cap = replay;
        }
        bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let env = Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        };
        if let Some(ring) = &self.replay {
            let mut ring = ring.lock();
            if ring.len() >= self.replay_cap {
                ring.pop_front();
            }
            ring.push_back(env.clone());
        }
        if self.tx.send(env).is_err() {
            tracing::trace!(target: "conduit::bus", kind, "no bus subscribers");
        }
    }

    /// Most recent envelopes, oldest first, optionally filtered by kind prefix.
    pub fn replay(&self, prefix: Option<&str>) -> Vec<Envelope> {
        let Some(ring) = &self.replay else {
            return Vec::new();
        };
        ring.lock()
            .iter()
            .filter(|env| prefix.map(|p| env.kind.starts_with(p)).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new_with_replay(256, 64)
    }
}
