use std::sync::Arc;

use sidefx_artifacts::ArtifactSink;
use sidefx_schemas::{Command, FailMode};
use sidefx_testkit::FakeBroker;
use sidefx_worker::{handle_command, HandlerContext};

fn test_command(run_id: &str) -> Command {
    Command {
        ts: 0,
        kind: "run.command".to_string(),
        run_id: run_id.to_string(),
        events_topic: format!("sidefx.events.{run_id}"),
        step_id: "charge_card".to_string(),
        business_key: format!("order-{run_id}"),
        amount: 11.0,
        attempt: 0,
        max_attempts: 5,
        fail_before_effect_n: 0,
        fail_mode: FailMode::None,
    }
}

/// An artifact file exists on disk for `business_key` (e.g. left over from a
/// manual operator intervention) but no ledger row has ever been claimed.
/// The first delivery wins the claim, `artifact.create` reports
/// `already_existed`, and the handler still calls `mark_done` and emits
/// `side_effect.done` rather than treating the pre-existing file as an error.
#[tokio::test]
async fn claim_wins_but_artifact_preexists_still_marks_done() -> anyhow::Result<()> {
    let url = match std::env::var(sidefx_ledger::ENV_DATABASE_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: SIDEFX_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sidefx_ledger::connect(&url).await?;
    sidefx_ledger::migrate(&pool).await?;

    let dir = tempfile::tempdir()?;
    let artifacts = ArtifactSink::new(dir.path())?;
    let broker: Arc<FakeBroker> = Arc::new(FakeBroker::new());

    let cmd = test_command("run-orphan-1");

    // Pre-existing artifact, orphaned with respect to the ledger: no claim
    // has ever happened for this effect_id.
    let (outcome, _) = artifacts.create(&cmd.business_key, b"{\"note\":\"pre-existing ticket\"}")?;
    assert_eq!(outcome, sidefx_artifacts::ArtifactOutcome::Created);
    assert!(sidefx_ledger::get_status(&pool, &cmd.effect_id()).await?.is_none());

    let ctx = HandlerContext::new(broker.clone(), pool.clone(), artifacts.clone());
    handle_command(&ctx, &cmd, 3_000).await.expect("handler must succeed");

    let record = sidefx_ledger::get_status(&pool, &cmd.effect_id())
        .await?
        .expect("claim must have inserted a row");
    assert_eq!(record.status, sidefx_ledger::EffectStatus::Done);

    let types = broker.event_types_on(&cmd.events_topic);
    assert!(types.contains(&"side_effect.done".to_string()));
    assert!(types.contains(&"side_effect.executing".to_string()));
    assert!(!types.iter().any(|t| t == "side_effect.healed"));

    // The pre-existing bytes were never clobbered.
    let bytes = std::fs::read(artifacts.path_for(&cmd.business_key))?;
    assert_eq!(bytes, b"{\"note\":\"pre-existing ticket\"}");

    Ok(())
}
