//! Request and response bodies for the sidefx-api HTTP surface.
//!
//! No business logic lives here; these are purely wire shapes so `routes.rs`
//! and tests can both construct/decode them without duplicating field names.

use serde::{Deserialize, Serialize};
use sidefx_schemas::FailMode;

#[derive(Debug, Deserialize)]
pub struct RunCreateRequest {
    pub business_key: String,
    pub amount: f64,
    #[serde(default)]
    pub fail_before_effect_n: u32,
    #[serde(default)]
    pub fail_mode: FailMode,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RunCreateResponse {
    pub run_id: String,
    pub events_topic: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub broker: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct DebugEffectsResponse {
    pub count: usize,
    pub items: Vec<DebugEffectRow>,
}

#[derive(Debug, Serialize)]
pub struct DebugEffectRow {
    pub effect_id: String,
    pub run_id: String,
    pub step_id: String,
    pub business_key: String,
    pub status: String,
    pub artifact_ref: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct DebugArtifactsResponse {
    pub artifacts_dir: String,
    pub count: usize,
    pub items: Vec<DebugArtifactEntry>,
}

#[derive(Debug, Serialize)]
pub struct DebugArtifactEntry {
    pub name: String,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct DebugDlqResponse {
    pub count: usize,
    pub items: Vec<serde_json::Value>,
}
