//! HTTP adapter over the external at-least-once broker.
//!
//! This is the only place that speaks the broker's wire protocol. Everything
//! above this crate — the worker's consume loop, the ingress API's produce
//! calls — goes through the [`BrokerAdapter`] trait, so a test double can be
//! swapped in without touching call sites (see `sidefx-testkit`).
//!
//! The broker exposes two historically divergent HTTP shapes; this adapter
//! implements the NDJSON-streaming-consume / query-parameter-produce variant,
//! matching the original ingress client (`driftq_client.py`) rather than the
//! alternate single-message-GET worker client: `produce`/`ensure_topic`/`ack`
//! all go over query parameters (not a JSON body), and `value`s are
//! JSON-stringified into the `value` param; `consume` reads one HTTP response
//! whose body is newline-delimited JSON, one object per leased message.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// One delivery handed back by `consume_one`: a leased message plus enough
/// coordinates (`partition`, `offset`) to ack it later.
#[derive(Debug, Clone, Deserialize)]
pub struct Delivery {
    pub partition: i64,
    pub offset: i64,
    pub value: Value,
}

/// Broker capabilities, surfaced verbatim. Implementations must not buffer or
/// reorder — callers rely on `ack` being the only acknowledgement mechanism.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn ensure_topic(&self, topic: &str) -> Result<()>;

    /// `idempotency_key`, if set and previously seen on this topic, causes the
    /// broker to silently drop the duplicate.
    async fn produce(&self, topic: &str, value: &Value, idempotency_key: Option<&str>) -> Result<()>;

    /// Long-polls for a single delivery leased to `owner` for `lease_ms`.
    /// Returns `None` on a poll that timed out with nothing available — the
    /// caller is expected to call again (this is the "lazy sequence").
    async fn consume_one(
        &self,
        topic: &str,
        group: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Option<Delivery>>;

    /// Releases the lease. A lease-lost response is not an error — callers
    /// should treat any `Ok(())` as "no further action needed".
    async fn ack(
        &self,
        topic: &str,
        group: &str,
        owner: &str,
        partition: i64,
        offset: i64,
    ) -> Result<()>;

    async fn healthz(&self) -> Result<Value>;
}

/// Concrete broker adapter talking to a driftq-protocol HTTP service.
///
/// `consume_one`'s underlying wire call reads a whole NDJSON response body,
/// which may carry more than one leased message; the surplus lines are
/// buffered per `(topic, group)` so later `consume_one` calls drain them
/// before issuing another HTTP request, mirroring the original client's
/// `aiter_lines()` generator without requiring a long-lived connection.
pub struct HttpBrokerAdapter {
    base: String,
    http: reqwest::Client,
    pending: Mutex<HashMap<(String, String), VecDeque<Delivery>>>,
}

impl HttpBrokerAdapter {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(65))
            .build()
            .context("failed to build broker http client")?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
            pending: Mutex::new(HashMap::new()),
        })
    }
}

/// One line of the NDJSON consume response. `value` arrives as a
/// JSON-stringified scalar, matching `produce`'s own JSON-stringified
/// `value` query param; `decode_value` reverses that encoding.
#[derive(Debug, Deserialize)]
struct RawDelivery {
    partition: i64,
    offset: i64,
    value: Value,
}

/// Mirrors the original client's `extract_value`: if `value` arrived as a
/// JSON-object/array string, parse it back into structured JSON; otherwise
/// leave it as whatever scalar the broker sent.
fn decode_value(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            let looks_like_json = (trimmed.starts_with('{') && trimmed.ends_with('}'))
                || (trimmed.starts_with('[') && trimmed.ends_with(']'));
            if looks_like_json {
                serde_json::from_str(trimmed).unwrap_or(Value::String(s))
            } else {
                Value::String(s)
            }
        }
        other => other,
    }
}

#[async_trait]
impl BrokerAdapter for HttpBrokerAdapter {
    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/v1/topics", self.base))
            .query(&[("name", topic), ("partitions", "1")])
            .send()
            .await
            .with_context(|| format!("ensure_topic({topic}) request failed"))?;

        let status = resp.status();
        if !(status.is_success() || status.as_u16() == 409) {
            anyhow::bail!("ensure_topic({topic}) failed: {status}");
        }
        Ok(())
    }

    async fn produce(&self, topic: &str, value: &Value, idempotency_key: Option<&str>) -> Result<()> {
        let value_str = serde_json::to_string(value).context("failed to encode produce value")?;
        let mut query = vec![("topic", topic), ("value", value_str.as_str())];
        if let Some(key) = idempotency_key {
            query.push(("idempotency_key", key));
        }

        let resp = self
            .http
            .post(format!("{}/v1/produce", self.base))
            .query(&query)
            .send()
            .await
            .with_context(|| format!("produce(topic={topic}) request failed"))?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            anyhow::bail!("produce(topic={topic}) failed: {status}");
        }
        Ok(())
    }

    async fn consume_one(
        &self,
        topic: &str,
        group: &str,
        owner: &str,
        lease_ms: u64,
    ) -> Result<Option<Delivery>> {
        let key = (topic.to_string(), group.to_string());

        if let Some(delivery) = self
            .pending
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Ok(Some(delivery));
        }

        let resp = self
            .http
            .get(format!("{}/v1/consume", self.base))
            .query(&[
                ("topic", topic),
                ("group", group),
                ("owner", owner),
                ("lease_ms", &lease_ms.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("consume(topic={topic}, group={group}) request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("consume(topic={topic}, group={group}) failed: {status}");
        }

        let body = resp
            .text()
            .await
            .context("consume response body was not readable")?;

        // NDJSON: one JSON object per non-blank line, same shape the original
        // `aiter_lines()` generator yields.
        let mut deliveries = VecDeque::new();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let raw: RawDelivery = serde_json::from_str(line)
                .with_context(|| format!("consume(topic={topic}, group={group}) yielded malformed NDJSON line"))?;
            deliveries.push_back(Delivery {
                partition: raw.partition,
                offset: raw.offset,
                value: decode_value(raw.value),
            });
        }

        let first = deliveries.pop_front();
        if !deliveries.is_empty() {
            self.pending.lock().unwrap().insert(key, deliveries);
        }
        Ok(first)
    }

    async fn ack(
        &self,
        topic: &str,
        group: &str,
        owner: &str,
        partition: i64,
        offset: i64,
    ) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/v1/ack", self.base))
            .query(&[
                ("topic", topic),
                ("group", group),
                ("owner", owner),
                ("partition", &partition.to_string()),
                ("offset", &offset.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("ack(topic={topic}, group={group}) request failed"))?;

        let status = resp.status();
        // 409 == lease lost: broker already redelivered this message to
        // someone else. Logged, not fatal — see sidefx-worker's consume loop.
        if status.as_u16() == 409 {
            tracing::warn!(topic, group, partition, offset, "ack: lease lost (409)");
            return Ok(());
        }
        if !status.is_success() && status.as_u16() != 204 {
            anyhow::bail!("ack(topic={topic}, group={group}) failed: {status}");
        }
        Ok(())
    }

    async fn healthz(&self) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/v1/healthz", self.base))
            .send()
            .await
            .context("healthz request failed")?;
        resp.json().await.context("healthz response was not valid json")
    }
}

/// Fire-and-forget event emission. Swallows errors with a warning log: the
/// event stream is observability, not control, and must never abort a step.
pub async fn emit(
    broker: &dyn BrokerAdapter,
    events_topic: &str,
    event: &Value,
    idempotency_key: Option<&str>,
) {
    if let Err(e) = broker.produce(events_topic, event, idempotency_key).await {
        tracing::warn!(events_topic, error = %e, "failed to emit event");
    }
}
