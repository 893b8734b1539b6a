//! Retry/DLQ scheduler: turns a handler failure into either a new command
//! message (attempt+1) or a DLQ record, always followed by an ack of the
//! original delivery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use sidefx_broker::BrokerAdapter;
use sidefx_schemas::{Command, DlqRecord, Event, COMMANDS_TOPIC, DLQ_TOPIC};

/// `min(2^attempt, 10) + U[0, 1)` seconds, matching the original worker's
/// "quick and dirty" backoff curve.
pub fn backoff_seconds(attempt: u32) -> f64 {
    let capped = 2u64.saturating_pow(attempt).min(10) as f64;
    capped + rand::thread_rng().gen::<f64>()
}

/// Handle a failed delivery: emit `retry.considered`, then either schedule a
/// retry or write a DLQ record, emitting the corresponding terminal event.
/// Does not ack; the caller's consume loop acks after this returns.
pub async fn schedule_after_failure(
    broker: &Arc<dyn BrokerAdapter>,
    cmd: &Command,
    error: &str,
    now_ms: i64,
) -> Result<()> {
    let next_attempt = cmd.attempt + 1;
    let backoff_s = backoff_seconds(cmd.attempt);

    emit(
        broker,
        &cmd.events_topic,
        Event::RetryConsidered {
            ts: now_ms,
            run_id: cmd.run_id.clone(),
            step_id: cmd.step_id.clone(),
            attempt: cmd.attempt,
            next_attempt,
            max_attempts: cmd.max_attempts,
            error: error.to_string(),
            backoff_s,
        },
    )
    .await;

    if next_attempt >= cmd.max_attempts {
        let dlq = DlqRecord {
            ts: now_ms,
            kind: "sidefx.dlq".to_string(),
            run_id: cmd.run_id.clone(),
            step_id: cmd.step_id.clone(),
            business_key: cmd.business_key.clone(),
            attempt: cmd.attempt,
            max_attempts: cmd.max_attempts,
            error: error.to_string(),
            command: cmd.clone(),
        };
        let idem = DlqRecord::idempotency_key(&cmd.run_id, &cmd.step_id, &cmd.business_key);
        let value = serde_json::to_value(&dlq)?;
        if let Err(e) = broker.produce(DLQ_TOPIC, &value, Some(&idem)).await {
            tracing::warn!(run_id = %cmd.run_id, error = %e, "failed to write DLQ record");
        }

        emit(
            broker,
            &cmd.events_topic,
            Event::RunDlq {
                ts: now_ms,
                run_id: cmd.run_id.clone(),
                step_id: cmd.step_id.clone(),
                error: error.to_string(),
            },
        )
        .await;

        return Ok(());
    }

    // Backoff is advisory per the spec's design notes; this implementation
    // actually sleeps before producing the retry rather than just passing the
    // hint through.
    tokio::time::sleep(Duration::from_secs_f64(backoff_s)).await;

    let retry_cmd = cmd.with_next_attempt(now_ms);
    let idem = retry_cmd.command_idempotency_key();
    let value = serde_json::to_value(&retry_cmd)?;
    if let Err(e) = broker.produce(COMMANDS_TOPIC, &value, Some(&idem)).await {
        tracing::warn!(run_id = %cmd.run_id, error = %e, "failed to schedule retry");
    }

    emit(
        broker,
        &cmd.events_topic,
        Event::RetryScheduled {
            ts: now_ms,
            run_id: cmd.run_id.clone(),
            step_id: cmd.step_id.clone(),
            attempt: next_attempt,
        },
    )
    .await;

    Ok(())
}

async fn emit(broker: &Arc<dyn BrokerAdapter>, events_topic: &str, event: Event) {
    let idem = event.idempotency_key();
    let value = match serde_json::to_value(&event) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(events_topic, error = %e, "failed to serialize event");
            return;
        }
    };
    sidefx_broker::emit(broker.as_ref(), events_topic, &value, idem.as_deref()).await;
}
