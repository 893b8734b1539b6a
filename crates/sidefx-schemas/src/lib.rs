//! Wire types shared between the ingress API, the worker, and the CLI.
//!
//! These mirror the JSON shapes produced on the broker's topics; keeping them
//! in one crate means the API and worker can never drift on a field name or
//! an idempotency-key template.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMMANDS_TOPIC: &str = "sidefx.commands";
pub const DLQ_TOPIC: &str = "sidefx.dlq";
pub const EVENTS_TOPIC_PREFIX: &str = "sidefx.events.";
pub const STEP_CHARGE_CARD: &str = "charge_card";

pub fn events_topic_for(run_id: &str) -> String {
    format!("{EVENTS_TOPIC_PREFIX}{run_id}")
}

/// The stable deduplication key identifying one intended real-world effect.
pub fn effect_id_for(run_id: &str, step_id: &str, business_key: &str) -> String {
    format!("{run_id}:{step_id}:{business_key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    None,
    CrashAfterEffectBeforeAck,
}

impl Default for FailMode {
    fn default() -> Self {
        FailMode::None
    }
}

/// The value carried on `sidefx.commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub run_id: String,
    pub events_topic: String,
    pub step_id: String,
    pub business_key: String,
    pub amount: f64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub fail_before_effect_n: u32,
    pub fail_mode: FailMode,
}

impl Command {
    pub fn effect_id(&self) -> String {
        effect_id_for(&self.run_id, &self.step_id, &self.business_key)
    }

    pub fn command_idempotency_key(&self) -> String {
        format!(
            "cmd:{}:{}:{}:a{}",
            self.run_id, self.step_id, self.business_key, self.attempt
        )
    }

    /// Produce the retry message for the next attempt. `ts` is supplied by the
    /// caller (handlers must not call wall-clock time internally so recovery
    /// remains deterministic to reconstruct in tests).
    pub fn with_next_attempt(&self, ts: i64) -> Command {
        Command {
            ts,
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// The value carried on `sidefx.dlq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub run_id: String,
    pub step_id: String,
    pub business_key: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub error: String,
    pub command: Command,
}

impl DlqRecord {
    pub fn idempotency_key(run_id: &str, step_id: &str, business_key: &str) -> String {
        format!("dlq:{run_id}:{step_id}:{business_key}")
    }
}

/// Every lifecycle event that can appear on a run's events topic.
///
/// The `type` tag uses dotted names (`run.created`, `side_effect.done`, ...)
/// because that is the wire contract clients subscribe against; `serde`'s
/// `rename_all` can't produce dots, so each variant is renamed explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "run.created")]
    RunCreated {
        ts: i64,
        run_id: String,
        business_key: String,
        amount: f64,
    },
    #[serde(rename = "command.enqueued")]
    CommandEnqueued { ts: i64, run_id: String, attempt: u32 },
    #[serde(rename = "step.started")]
    StepStarted {
        ts: i64,
        run_id: String,
        step_id: String,
        attempt: u32,
    },
    #[serde(rename = "step.failed")]
    StepFailed {
        ts: i64,
        run_id: String,
        step_id: String,
        attempt: u32,
        reason: String,
    },
    #[serde(rename = "side_effect.executing")]
    SideEffectExecuting {
        ts: i64,
        run_id: String,
        step_id: String,
        business_key: String,
        effect_id: String,
        amount: f64,
    },
    #[serde(rename = "side_effect.done")]
    SideEffectDone {
        ts: i64,
        run_id: String,
        step_id: String,
        business_key: String,
        effect_id: String,
        artifact_ref: String,
    },
    #[serde(rename = "side_effect.skipped")]
    SideEffectSkipped {
        ts: i64,
        run_id: String,
        step_id: String,
        business_key: String,
        effect_id: String,
        reason: String,
    },
    #[serde(rename = "side_effect.healed")]
    SideEffectHealed {
        ts: i64,
        run_id: String,
        step_id: String,
        effect_id: String,
    },
    #[serde(rename = "chaos.crash_now")]
    ChaosCrashNow {
        ts: i64,
        run_id: String,
        step_id: String,
        note: String,
    },
    #[serde(rename = "step.completed")]
    StepCompleted {
        ts: i64,
        run_id: String,
        step_id: String,
        attempt: u32,
    },
    #[serde(rename = "run.completed")]
    RunCompleted { ts: i64, run_id: String },
    #[serde(rename = "retry.considered")]
    RetryConsidered {
        ts: i64,
        run_id: String,
        step_id: String,
        attempt: u32,
        next_attempt: u32,
        max_attempts: u32,
        error: String,
        backoff_s: f64,
    },
    #[serde(rename = "retry.scheduled")]
    RetryScheduled {
        ts: i64,
        run_id: String,
        step_id: String,
        attempt: u32,
    },
    #[serde(rename = "run.dlq")]
    RunDlq {
        ts: i64,
        run_id: String,
        step_id: String,
        error: String,
    },
    #[serde(rename = "sse.connected")]
    SseConnected { run_id: String },
}

impl Event {
    /// The idempotency key template from the event-type table. `run_id` and
    /// `step_id` are read off the event itself; `RunDlq`/`RunCompleted` don't
    /// carry a per-attempt suffix because they're terminal, one-shot events.
    pub fn idempotency_key(&self) -> Option<String> {
        match self {
            Event::RunCreated { run_id, .. } => Some(format!("evt:{run_id}:created")),
            Event::CommandEnqueued { run_id, attempt, .. } => {
                Some(format!("evt:{run_id}:enq:a{attempt}"))
            }
            Event::StepStarted {
                run_id,
                step_id,
                attempt,
                ..
            } => Some(format!("evt:{run_id}:{step_id}:started:a{attempt}")),
            Event::StepFailed {
                run_id,
                step_id,
                attempt,
                ..
            } => Some(format!("evt:{run_id}:{step_id}:failed_before:a{attempt}")),
            Event::SideEffectExecuting {
                run_id, step_id, ..
            } => Some(format!("evt:{run_id}:{step_id}:effect:exec")),
            Event::SideEffectDone {
                run_id, step_id, ..
            } => Some(format!("evt:{run_id}:{step_id}:effect:done")),
            Event::SideEffectSkipped {
                run_id,
                step_id,
                reason,
                ..
            } => {
                let suffix = if reason == "already_in_progress" {
                    "skipped_in_progress"
                } else {
                    "skipped"
                };
                Some(format!("evt:{run_id}:{step_id}:effect:{suffix}"))
            }
            Event::SideEffectHealed {
                run_id, step_id, ..
            } => Some(format!("evt:{run_id}:{step_id}:effect:healed")),
            Event::ChaosCrashNow {
                run_id, step_id, ..
            } => Some(format!("evt:{run_id}:{step_id}:chaos:crash")),
            Event::StepCompleted {
                run_id,
                step_id,
                attempt,
                ..
            } => Some(format!("evt:{run_id}:{step_id}:completed:a{attempt}")),
            Event::RunCompleted { run_id, .. } => Some(format!("evt:{run_id}:completed")),
            Event::RetryConsidered {
                run_id,
                step_id,
                attempt,
                ..
            } => Some(format!(
                "evt:{run_id}:{step_id}:retry:considered:a{attempt}"
            )),
            Event::RetryScheduled {
                run_id,
                step_id,
                attempt,
                ..
            } => Some(format!(
                "evt:{run_id}:{step_id}:retry:scheduled:a{attempt}"
            )),
            Event::RunDlq {
                run_id, step_id, ..
            } => Some(format!("evt:{run_id}:{step_id}:dlq")),
            Event::SseConnected { .. } => None,
        }
    }
}

/// Canonicalize a JSON value by recursively sorting object keys, so the same
/// logical payload always hashes/serializes identically regardless of
/// construction order. Used to snapshot the originating command into the
/// ledger's `payload_snapshot` column.
pub fn canonicalize_json(v: &Value) -> String {
    serde_json::to_string(&sort_keys(v)).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
