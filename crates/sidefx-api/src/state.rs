//! Shared runtime state for sidefx-api.
//!
//! Handlers receive `State<Arc<AppState>>`. The run registry is the only
//! mutable in-process state; everything else (broker, ledger, artifacts) is
//! a handle onto durable, shared-across-process storage.

use std::collections::HashMap;
use std::sync::Arc;

use sidefx_artifacts::ArtifactSink;
use sidefx_broker::BrokerAdapter;
use tokio::sync::RwLock;

/// Process-local record of a run created through this ingress instance.
///
/// Advisory only: used to 404 unknown runs before ever touching the broker.
/// If the API is horizontally scaled this index becomes eventually
/// inconsistent across instances; the events topic remains the source of
/// truth regardless (see `sidefx-worker`'s design notes).
#[derive(Debug, Clone)]
pub struct RunMeta {
    pub run_id: String,
    pub business_key: String,
    pub amount: f64,
    pub fail_before_effect_n: u32,
    pub fail_mode: sidefx_schemas::FailMode,
    pub max_attempts: u32,
    pub created_ms: i64,
    pub events_topic: String,
}

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn BrokerAdapter>,
    /// `None` when `SIDEFX_DATABASE_URL` was not configured; in that case the
    /// ledger debug readout degrades to a 503 rather than the whole process
    /// refusing to start. Run creation and event streaming never need it.
    pub ledger: Option<sqlx::PgPool>,
    pub artifacts: ArtifactSink,
    pub runs: Arc<RwLock<HashMap<String, RunMeta>>>,
    pub owner: String,
    pub max_attempts_default: u32,
    pub events_lease_ms: u64,
}

impl AppState {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        ledger: Option<sqlx::PgPool>,
        artifacts: ArtifactSink,
        owner: String,
        max_attempts_default: u32,
        events_lease_ms: u64,
    ) -> Self {
        Self {
            broker,
            ledger,
            artifacts,
            runs: Arc::new(RwLock::new(HashMap::new())),
            owner,
            max_attempts_default,
            events_lease_ms,
        }
    }
}
