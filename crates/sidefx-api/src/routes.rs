//! Axum router and HTTP handlers for sidefx-api.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware. Handlers are `pub(crate)` so scenario tests can drive the
//! router directly via `tower::ServiceExt::oneshot`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use sidefx_schemas::{events_topic_for, Command, Event, COMMANDS_TOPIC, DLQ_TOPIC, STEP_CHARGE_CARD};
use uuid::Uuid;

use crate::api_types::{
    DebugArtifactEntry, DebugArtifactsResponse, DebugDlqResponse, DebugEffectRow,
    DebugEffectsResponse, ErrorResponse, HealthResponse, RunCreateRequest, RunCreateResponse,
};
use crate::state::{AppState, RunMeta};

/// Inactivity timeout for an events SSE relay: if nothing arrives for this
/// long, the stream closes. A client that wants to keep listening simply
/// reconnects; the broker's consumer group remembers progress.
const EVENTS_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
const EVENTS_POLL_IDLE_SLEEP: Duration = Duration::from_millis(250);
const DLQ_PEEK_WINDOW: Duration = Duration::from_secs(3);

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/runs", post(create_run))
        .route("/v1/runs/:run_id/events", get(stream_events))
        .route("/v1/debug/side-effects", get(debug_side_effects))
        .route("/v1/debug/artifacts", get(debug_artifacts))
        .route("/v1/debug/dlq", get(debug_dlq))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/healthz
// ---------------------------------------------------------------------------

pub(crate) async fn healthz(State(st): State<Arc<AppState>>) -> Response {
    match st.broker.healthz().await {
        Ok(broker) => (StatusCode::OK, Json(HealthResponse { ok: true, broker })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: format!("broker unhealthy: {e}"),
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/runs
// ---------------------------------------------------------------------------

pub(crate) async fn create_run(
    State(st): State<Arc<AppState>>,
    Json(req): Json<RunCreateRequest>,
) -> Response {
    if req.business_key.trim().is_empty() {
        return bad_request("business_key must not be empty");
    }
    if req.amount < 0.0 {
        return bad_request("amount must not be negative");
    }

    let run_id = Uuid::new_v4().to_string();
    let events_topic = events_topic_for(&run_id);
    let max_attempts = req.max_attempts.unwrap_or(st.max_attempts_default).max(1);
    let now_ms = Utc::now().timestamp_millis();

    for topic in [COMMANDS_TOPIC, DLQ_TOPIC, events_topic.as_str()] {
        if let Err(e) = st.broker.ensure_topic(topic).await {
            return server_error(format!("ensure_topic({topic}) failed: {e}"));
        }
    }

    emit(
        &st,
        &events_topic,
        Event::RunCreated {
            ts: now_ms,
            run_id: run_id.clone(),
            business_key: req.business_key.clone(),
            amount: req.amount,
        },
    )
    .await;

    let cmd = Command {
        ts: now_ms,
        kind: "run.command".to_string(),
        run_id: run_id.clone(),
        events_topic: events_topic.clone(),
        step_id: STEP_CHARGE_CARD.to_string(),
        business_key: req.business_key.clone(),
        amount: req.amount,
        attempt: 0,
        max_attempts,
        fail_before_effect_n: req.fail_before_effect_n,
        fail_mode: req.fail_mode,
    };

    let idem = cmd.command_idempotency_key();
    let value = match serde_json::to_value(&cmd) {
        Ok(v) => v,
        Err(e) => return server_error(format!("failed to encode command: {e}")),
    };
    if let Err(e) = st.broker.produce(COMMANDS_TOPIC, &value, Some(&idem)).await {
        return server_error(format!("failed to enqueue command: {e}"));
    }

    emit(
        &st,
        &events_topic,
        Event::CommandEnqueued {
            ts: now_ms,
            run_id: run_id.clone(),
            attempt: 0,
        },
    )
    .await;

    let meta = RunMeta {
        run_id: run_id.clone(),
        business_key: req.business_key,
        amount: req.amount,
        fail_before_effect_n: req.fail_before_effect_n,
        fail_mode: req.fail_mode,
        max_attempts,
        created_ms: now_ms,
        events_topic: events_topic.clone(),
    };
    st.runs.write().await.insert(run_id.clone(), meta);

    (StatusCode::OK, Json(RunCreateResponse { run_id, events_topic })).into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/runs/:run_id/events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    client_id: Option<String>,
}

pub(crate) async fn stream_events(
    State(st): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Query(params): Query<EventsQuery>,
) -> Response {
    let events_topic = {
        let runs = st.runs.read().await;
        match runs.get(&run_id) {
            Some(meta) => meta.events_topic.clone(),
            None => return not_found("run not found"),
        }
    };

    let client_id: String = params
        .client_id
        .unwrap_or_else(|| "default".to_string())
        .chars()
        .take(32)
        .collect();
    let group = format!("events-{run_id}-{client_id}");

    let connected = futures_util::stream::once({
        let run_id = run_id.clone();
        async move {
            let data = serde_json::json!({"type": "sse.connected", "run_id": run_id}).to_string();
            Ok(SseEvent::default().data(data))
        }
    });

    let polled = poll_events(st.clone(), events_topic, group);
    let stream = connected.chain(polled);

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Long-polls the run's events topic under a per-client consumer group and
/// relays each delivery as an SSE frame, acking best-effort after relaying.
/// Stops after `EVENTS_INACTIVITY_TIMEOUT` with nothing delivered; the client
/// is expected to reconnect (the consumer group remembers its place).
fn poll_events(
    st: Arc<AppState>,
    events_topic: String,
    group: String,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    futures_util::stream::unfold(Instant::now(), move |last_activity| {
        let st = st.clone();
        let events_topic = events_topic.clone();
        let group = group.clone();
        async move {
            loop {
                if last_activity.elapsed() > EVENTS_INACTIVITY_TIMEOUT {
                    return None;
                }
                match st
                    .broker
                    .consume_one(&events_topic, &group, &st.owner, st.events_lease_ms)
                    .await
                {
                    Ok(Some(delivery)) => {
                        if let Err(e) = st
                            .broker
                            .ack(&events_topic, &group, &st.owner, delivery.partition, delivery.offset)
                            .await
                        {
                            tracing::warn!(events_topic, error = %e, "best-effort ack failed on events stream");
                        }
                        let data = serde_json::to_string(&delivery.value).unwrap_or_else(|_| "{}".to_string());
                        return Some((Ok(SseEvent::default().data(data)), Instant::now()));
                    }
                    Ok(None) => {
                        tokio::time::sleep(EVENTS_POLL_IDLE_SLEEP).await;
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(events_topic, error = %e, "consume failed on events stream");
                        tokio::time::sleep(EVENTS_POLL_IDLE_SLEEP).await;
                        continue;
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// GET /v1/debug/side-effects
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct LimitQuery {
    limit: Option<i64>,
}

pub(crate) async fn debug_side_effects(
    State(st): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Response {
    let Some(pool) = st.ledger.as_ref() else {
        return service_unavailable("ledger not configured (SIDEFX_DATABASE_URL unset)");
    };
    let limit = q.limit.unwrap_or(50);

    match sidefx_ledger::list_effects(pool, limit).await {
        Ok(rows) => {
            let items: Vec<DebugEffectRow> = rows
                .into_iter()
                .map(|r| DebugEffectRow {
                    effect_id: r.effect_id,
                    run_id: r.run_id,
                    step_id: r.step_id,
                    business_key: r.business_key,
                    status: r.status.as_str().to_string(),
                    artifact_ref: r.artifact_ref,
                    created_ms: r.created_ms,
                    updated_ms: r.updated_ms,
                    payload: r.payload_snapshot,
                })
                .collect();
            (
                StatusCode::OK,
                Json(DebugEffectsResponse {
                    count: items.len(),
                    items,
                }),
            )
                .into_response()
        }
        Err(e) => server_error(format!("list_effects failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/debug/artifacts
// ---------------------------------------------------------------------------

pub(crate) async fn debug_artifacts(State(st): State<Arc<AppState>>) -> Response {
    match st.artifacts.list() {
        Ok(entries) => {
            let items: Vec<DebugArtifactEntry> = entries
                .into_iter()
                .rev()
                .take(50)
                .map(|(name, bytes)| DebugArtifactEntry { name, bytes })
                .collect();
            (
                StatusCode::OK,
                Json(DebugArtifactsResponse {
                    artifacts_dir: st.artifacts.root().display().to_string(),
                    count: items.len(),
                    items,
                }),
            )
                .into_response()
        }
        Err(e) => server_error(format!("list artifacts failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/debug/dlq
// ---------------------------------------------------------------------------

pub(crate) async fn debug_dlq(State(st): State<Arc<AppState>>, Query(q): Query<LimitQuery>) -> Response {
    let limit = q.limit.unwrap_or(5).max(0) as usize;
    // A fresh, disposable group per call: this is a peek, not a real
    // consumer, so it must not perturb any real DLQ consumer's offsets.
    let group = format!("debug-dlq-{}", Uuid::new_v4().simple());
    let deadline = Instant::now() + DLQ_PEEK_WINDOW;
    let mut items = Vec::new();

    while items.len() < limit && Instant::now() < deadline {
        match st.broker.consume_one(DLQ_TOPIC, &group, &st.owner, 30_000).await {
            Ok(Some(delivery)) => items.push(delivery.value),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "debug dlq peek failed");
                break;
            }
        }
    }

    (
        StatusCode::OK,
        Json(DebugDlqResponse {
            count: items.len(),
            items,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

async fn emit(st: &AppState, events_topic: &str, event: Event) {
    let idem = event.idempotency_key();
    let value = match serde_json::to_value(&event) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(events_topic, error = %e, "failed to serialize event");
            return;
        }
    };
    sidefx_broker::emit(st.broker.as_ref(), events_topic, &value, idem.as_deref()).await;
}

fn bad_request(msg: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: msg.to_string() })).into_response()
}

fn not_found(msg: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: msg.to_string() })).into_response()
}

fn service_unavailable(msg: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse { error: msg.to_string() }),
    )
        .into_response()
}

fn server_error(msg: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: msg })).into_response()
}
