//! Event bus feeding the management subscription streams.
//!
//! Topics carry RS-delimited JSON records (`\x1e` + JSON + `\n`). Exactly
//! one subscriber per topic: a newcomer replaces the previous stream, which
//! receives a final `{"event":"replacing"}` record and closes. Everything
//! published anywhere is mirrored onto `debug`.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// Per-subscriber queue depth; a stalled consumer loses records rather
/// than stalling the datapath.
const SUBSCRIBER_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Debug,
    Peer,
    Test,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Debug, Topic::Peer, Topic::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Debug => "debug",
            Topic::Peer => "peer",
            Topic::Test => "test",
        }
    }
}

impl FromStr for Topic {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Topic::Debug),
            "peer" => Ok(Topic::Peer),
            "test" => Ok(Topic::Test),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<Topic, mpsc::Sender<String>>>>,
}

fn record(value: &Value) -> String {
    format!("\x1e{value}\n")
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish onto `topic` (and mirror onto `debug`). Callable from sync
    /// context; full or vanished subscribers are dropped silently.
    pub fn emit(&self, topic: Topic, mut value: Value) {
        if let Value::Object(ref mut map) = value {
            map.insert("topic".into(), Value::String(topic.as_str().into()));
        }
        trace!("event {}: {}", topic.as_str(), value);
        let line = record(&value);
        let mut targets = vec![topic];
        if topic != Topic::Debug {
            targets.push(Topic::Debug);
        }
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        for t in targets {
            let Some(tx) = subscribers.get(&t) else {
                continue;
            };
            if tx.is_closed() {
                subscribers.remove(&t);
                continue;
            }
            let _ = tx.try_send(line.clone());
        }
    }

    /// Take over a topic. The previous subscriber (if any) is told it is
    /// being replaced, then its stream closes.
    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let previous = self
            .subscribers
            .lock()
            .expect("subscriber lock")
            .insert(topic, tx);
        if let Some(old) = previous {
            let _ = old.try_send(record(&json!({ "event": "replacing" })));
        }
        rx
    }

    pub fn has_subscriber(&self, topic: Topic) -> bool {
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .get(&topic)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parse() {
        assert_eq!("peer".parse::<Topic>(), Ok(Topic::Peer));
        assert!("nope".parse::<Topic>().is_err());
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Topic::Peer);
        bus.emit(Topic::Peer, json!({"action": "join"}));
        let line = rx.recv().await.unwrap();
        assert!(line.starts_with('\x1e'));
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim_start_matches('\x1e').trim()).unwrap();
        assert_eq!(value["action"], "join");
        assert_eq!(value["topic"], "peer");
    }

    #[tokio::test]
    async fn test_debug_mirrors_every_topic() {
        let bus = EventBus::new();
        let mut debug = bus.subscribe(Topic::Debug);
        bus.emit(Topic::Test, json!({"event": "test"}));
        let line = debug.recv().await.unwrap();
        assert!(line.contains("\"test\""));
    }

    #[tokio::test]
    async fn test_second_subscriber_replaces_first() {
        let bus = EventBus::new();
        let mut first = bus.subscribe(Topic::Peer);
        let mut second = bus.subscribe(Topic::Peer);

        let line = first.recv().await.unwrap();
        assert!(line.contains("replacing"));
        // First channel is now closed from the sender side.
        assert!(first.recv().await.is_none());

        bus.emit(Topic::Peer, json!({"action": "join"}));
        assert!(second.recv().await.unwrap().contains("join"));
    }

    #[tokio::test]
    async fn test_emit_without_subscriber_is_noop() {
        let bus = EventBus::new();
        bus.emit(Topic::Peer, json!({"action": "join"}));
        assert!(!bus.has_subscriber(Topic::Peer));
    }
}
