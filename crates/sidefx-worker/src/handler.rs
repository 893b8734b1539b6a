//! The command handler: the state machine in charge of performing the
//! protected side effect at most once per `effect_id` and narrating every
//! phase onto the run's events topic.

use std::sync::Arc;

use sidefx_artifacts::{ArtifactOutcome, ArtifactSink};
use sidefx_broker::BrokerAdapter;
use sidefx_schemas::{Command, Event, FailMode};
use sqlx::PgPool;

use crate::errors::HandlerFailure;

/// The action taken for the injected post-effect chaos crash. Diverges, same
/// as the production default (`std::process::exit`); tests substitute a
/// panic with a recognizable payload so the crash point is observable without
/// tearing down the test binary.
pub type CrashHook = Arc<dyn Fn() -> std::convert::Infallible + Send + Sync>;

pub struct HandlerContext {
    pub broker: Arc<dyn BrokerAdapter>,
    pub ledger: PgPool,
    pub artifacts: ArtifactSink,
    pub crash_hook: CrashHook,
}

impl HandlerContext {
    pub fn new(broker: Arc<dyn BrokerAdapter>, ledger: PgPool, artifacts: ArtifactSink) -> Self {
        Self {
            broker,
            ledger,
            artifacts,
            crash_hook: Arc::new(|| std::process::exit(137)),
        }
    }
}

/// Run one delivery's worth of business logic. `now_ms` is threaded in by the
/// caller rather than read from the wall clock here, so tests can replay a
/// scenario deterministically.
pub async fn handle_command(
    ctx: &HandlerContext,
    cmd: &Command,
    now_ms: i64,
) -> Result<(), HandlerFailure> {
    let events_topic = cmd.events_topic.clone();
    ctx.broker
        .ensure_topic(&events_topic)
        .await
        .map_err(HandlerFailure::Transient)?;

    emit(
        ctx,
        &events_topic,
        Event::StepStarted {
            ts: now_ms,
            run_id: cmd.run_id.clone(),
            step_id: cmd.step_id.clone(),
            attempt: cmd.attempt,
        },
    )
    .await;

    // Phase 2: injected pre-effect failure. Never touches the ledger or the
    // artifact sink — this failure must look indistinguishable from a real
    // transient fault to everything downstream of the handler.
    if cmd.attempt < cmd.fail_before_effect_n {
        emit(
            ctx,
            &events_topic,
            Event::StepFailed {
                ts: now_ms,
                run_id: cmd.run_id.clone(),
                step_id: cmd.step_id.clone(),
                attempt: cmd.attempt,
                reason: "forced_failure_before_side_effect".to_string(),
            },
        )
        .await;
        return Err(HandlerFailure::Transient(anyhow::anyhow!(
            "forced failure before side effect"
        )));
    }

    let effect_id = cmd.effect_id();

    // Phase 3: status probe.
    let status = sidefx_ledger::get_status(&ctx.ledger, &effect_id)
        .await
        .map_err(HandlerFailure::Transient)?;

    // `failed` is treated as `done` for the purposes of not re-acting: a
    // permanently failed effect is still a terminal state this handler must
    // not attempt to resurrect.
    let already_settled = matches!(
        status.as_ref().map(|r| r.status),
        Some(sidefx_ledger::EffectStatus::Done) | Some(sidefx_ledger::EffectStatus::Failed)
    );

    if already_settled {
        emit(
            ctx,
            &events_topic,
            Event::SideEffectSkipped {
                ts: now_ms,
                run_id: cmd.run_id.clone(),
                step_id: cmd.step_id.clone(),
                business_key: cmd.business_key.clone(),
                effect_id: effect_id.clone(),
                reason: "already_done".to_string(),
            },
        )
        .await;
    } else {
        // Phase 4: guarded critical section.
        let payload = serde_json::to_value(cmd).map_err(|e| HandlerFailure::Poison(e.to_string()))?;
        let won = sidefx_ledger::claim(
            &ctx.ledger,
            &effect_id,
            &cmd.run_id,
            &cmd.step_id,
            &cmd.business_key,
            &payload,
        )
        .await
        .map_err(HandlerFailure::Transient)?;

        if !won {
            if ctx.artifacts.exists(&cmd.business_key) {
                let artifact_ref = ctx.artifacts.path_for(&cmd.business_key).display().to_string();
                sidefx_ledger::mark_done(&ctx.ledger, &effect_id, &artifact_ref)
                    .await
                    .map_err(HandlerFailure::Transient)?;
                emit(
                    ctx,
                    &events_topic,
                    Event::SideEffectHealed {
                        ts: now_ms,
                        run_id: cmd.run_id.clone(),
                        step_id: cmd.step_id.clone(),
                        effect_id: effect_id.clone(),
                    },
                )
                .await;
            } else {
                emit(
                    ctx,
                    &events_topic,
                    Event::SideEffectSkipped {
                        ts: now_ms,
                        run_id: cmd.run_id.clone(),
                        step_id: cmd.step_id.clone(),
                        business_key: cmd.business_key.clone(),
                        effect_id: effect_id.clone(),
                        reason: "already_in_progress".to_string(),
                    },
                )
                .await;
            }
        } else {
            emit(
                ctx,
                &events_topic,
                Event::SideEffectExecuting {
                    ts: now_ms,
                    run_id: cmd.run_id.clone(),
                    step_id: cmd.step_id.clone(),
                    business_key: cmd.business_key.clone(),
                    effect_id: effect_id.clone(),
                    amount: cmd.amount,
                },
            )
            .await;

            let ticket = serde_json::json!({
                "created_ms": now_ms,
                "run_id": cmd.run_id,
                "step_id": cmd.step_id,
                "business_key": cmd.business_key,
                "amount": cmd.amount,
                "note": "fake external side effect (ticket/webhook/charge)",
            });
            let bytes = serde_json::to_vec_pretty(&ticket)
                .map_err(|e| HandlerFailure::Poison(e.to_string()))?;

            // `create` is a blocking filesystem call; ferry it to the
            // blocking pool so a slow disk never stalls the runtime.
            let artifacts = ctx.artifacts.clone();
            let business_key = cmd.business_key.clone();
            let (outcome, path) =
                tokio::task::spawn_blocking(move || artifacts.create(&business_key, &bytes))
                    .await
                    .map_err(|e| HandlerFailure::Transient(e.into()))?
                    .map_err(HandlerFailure::Transient)?;
            // `already_existed` is still a success signal: claim already won
            // the race, and a concurrent artifact write (or a prior crash
            // between create and mark_done) must not be treated as an error.
            let _ = outcome == ArtifactOutcome::AlreadyExisted;

            let artifact_ref = path.display().to_string();
            sidefx_ledger::mark_done(&ctx.ledger, &effect_id, &artifact_ref)
                .await
                .map_err(HandlerFailure::Transient)?;

            emit(
                ctx,
                &events_topic,
                Event::SideEffectDone {
                    ts: now_ms,
                    run_id: cmd.run_id.clone(),
                    step_id: cmd.step_id.clone(),
                    business_key: cmd.business_key.clone(),
                    effect_id: effect_id.clone(),
                    artifact_ref,
                },
            )
            .await;

            // Phase 5: injected post-effect crash. No ack, no further
            // events — redelivery after lease expiry drives recovery via the
            // heal path above.
            if cmd.fail_mode == FailMode::CrashAfterEffectBeforeAck {
                emit(
                    ctx,
                    &events_topic,
                    Event::ChaosCrashNow {
                        ts: now_ms,
                        run_id: cmd.run_id.clone(),
                        step_id: cmd.step_id.clone(),
                        note: "crashing worker on purpose after side effect, before ack".to_string(),
                    },
                )
                .await;
                tracing::warn!(run_id = %cmd.run_id, "chaos: crashing worker now (after side effect, before ack)");
                (ctx.crash_hook)();
            }
        }
    }

    emit(
        ctx,
        &events_topic,
        Event::StepCompleted {
            ts: now_ms,
            run_id: cmd.run_id.clone(),
            step_id: cmd.step_id.clone(),
            attempt: cmd.attempt,
        },
    )
    .await;
    emit(
        ctx,
        &events_topic,
        Event::RunCompleted {
            ts: now_ms,
            run_id: cmd.run_id.clone(),
        },
    )
    .await;

    Ok(())
}

async fn emit(ctx: &HandlerContext, events_topic: &str, event: Event) {
    let idem = event.idempotency_key();
    let value = match serde_json::to_value(&event) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(events_topic, error = %e, "failed to serialize event");
            return;
        }
    };
    sidefx_broker::emit(ctx.broker.as_ref(), events_topic, &value, idem.as_deref()).await;
}
