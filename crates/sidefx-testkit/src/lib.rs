//! Minimal fake broker used ONLY for tests.
//!
//! Enforces idempotency by idempotency_key the same way the real driftq
//! service does: a second `produce` with a key already seen on that topic is
//! a silent no-op. `consume_one` never blocks — an empty queue returns
//! `Ok(None)` immediately, so test code drives the "lazy sequence" itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sidefx_broker::{BrokerAdapter, Delivery};

#[derive(Default)]
struct FakeBrokerInner {
    topics: HashSet<String>,
    queues: HashMap<String, VecDeque<(i64, i64, Value)>>,
    next_offset: HashMap<String, i64>,
    seen_idempotency_keys: HashMap<String, HashSet<String>>,
    produced: Vec<(String, Value)>,
    acked: Vec<(String, i64, i64)>,
}

#[derive(Default)]
pub struct FakeBroker {
    inner: Mutex<FakeBrokerInner>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every value ever produced, in produce order, across all topics.
    pub fn produced(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().produced.clone()
    }

    pub fn produced_on(&self, topic: &str) -> Vec<Value> {
        self.inner
            .lock()
            .unwrap()
            .produced
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn ack_count(&self) -> usize {
        self.inner.lock().unwrap().acked.len()
    }

    /// Number of distinct event `type` values produced on `topic`.
    pub fn event_types_on(&self, topic: &str) -> Vec<String> {
        self.produced_on(topic)
            .iter()
            .filter_map(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl BrokerAdapter for FakeBroker {
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        self.inner.lock().unwrap().topics.insert(topic.to_string());
        Ok(())
    }

    async fn produce(&self, topic: &str, value: &Value, idempotency_key: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(key) = idempotency_key {
            let seen = inner
                .seen_idempotency_keys
                .entry(topic.to_string())
                .or_default();
            if !seen.insert(key.to_string()) {
                return Ok(());
            }
        }

        let offset = {
            let next = inner.next_offset.entry(topic.to_string()).or_insert(0);
            let o = *next;
            *next += 1;
            o
        };

        inner
            .queues
            .entry(topic.to_string())
            .or_default()
            .push_back((0, offset, value.clone()));
        inner.produced.push((topic.to_string(), value.clone()));
        Ok(())
    }

    async fn consume_one(
        &self,
        topic: &str,
        _group: &str,
        _owner: &str,
        _lease_ms: u64,
    ) -> Result<Option<Delivery>> {
        let mut inner = self.inner.lock().unwrap();
        let popped = inner.queues.entry(topic.to_string()).or_default().pop_front();
        Ok(popped.map(|(partition, offset, value)| Delivery {
            partition,
            offset,
            value,
        }))
    }

    async fn ack(
        &self,
        topic: &str,
        _group: &str,
        _owner: &str,
        partition: i64,
        offset: i64,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .acked
            .push((topic.to_string(), partition, offset));
        Ok(())
    }

    async fn healthz(&self) -> Result<Value> {
        Ok(serde_json::json!({"status": "ok", "fake": true}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produce_dedupes_by_idempotency_key() {
        let broker = FakeBroker::new();
        broker
            .produce("t", &serde_json::json!({"a": 1}), Some("k1"))
            .await
            .unwrap();
        broker
            .produce("t", &serde_json::json!({"a": 2}), Some("k1"))
            .await
            .unwrap();
        assert_eq!(broker.produced_on("t").len(), 1);
    }

    #[tokio::test]
    async fn consume_one_returns_none_on_empty_queue() {
        let broker = FakeBroker::new();
        let d = broker.consume_one("t", "g", "o", 1000).await.unwrap();
        assert!(d.is_none());
    }

    #[tokio::test]
    async fn consume_one_returns_messages_in_fifo_order() {
        let broker = FakeBroker::new();
        broker
            .produce("t", &serde_json::json!({"n": 1}), None)
            .await
            .unwrap();
        broker
            .produce("t", &serde_json::json!({"n": 2}), None)
            .await
            .unwrap();

        let first = broker.consume_one("t", "g", "o", 1000).await.unwrap().unwrap();
        let second = broker.consume_one("t", "g", "o", 1000).await.unwrap().unwrap();
        assert_eq!(first.value["n"], 1);
        assert_eq!(second.value["n"], 2);
    }
}
