use std::sync::Arc;

use sidefx_artifacts::ArtifactSink;
use sidefx_schemas::{Command, FailMode};
use sidefx_testkit::FakeBroker;
use sidefx_worker::{handle_command, schedule_after_failure, HandlerContext, HandlerFailure};

fn test_command(run_id: &str) -> Command {
    Command {
        ts: 0,
        kind: "run.command".to_string(),
        run_id: run_id.to_string(),
        events_topic: format!("sidefx.events.{run_id}"),
        step_id: "charge_card".to_string(),
        business_key: format!("order-{run_id}"),
        amount: 5.0,
        attempt: 0,
        max_attempts: 5,
        fail_before_effect_n: 2,
        fail_mode: FailMode::None,
    }
}

#[tokio::test]
async fn retries_then_succeeds_exactly_once() -> anyhow::Result<()> {
    let url = match std::env::var(sidefx_ledger::ENV_DATABASE_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: SIDEFX_DATABASE_URL not set");
            return Ok(());
        }
    };

    tokio::time::pause();

    let pool = sidefx_ledger::connect(&url).await?;
    sidefx_ledger::migrate(&pool).await?;

    let dir = tempfile::tempdir()?;
    let artifacts = ArtifactSink::new(dir.path())?;
    let broker: Arc<FakeBroker> = Arc::new(FakeBroker::new());
    let ctx = HandlerContext::new(broker.clone(), pool.clone(), artifacts);

    let mut cmd = test_command("run-retry-1");

    // Attempts 0 and 1 are forced to fail before the side effect ever runs.
    for _ in 0..2 {
        match handle_command(&ctx, &cmd, 1_000).await {
            Err(HandlerFailure::Transient(e)) => {
                schedule_after_failure(&broker, &cmd, &e.to_string(), 1_000).await?;
            }
            other => panic!("expected a transient failure, got {other:?}"),
        }
        cmd = cmd.with_next_attempt(1_000);
    }

    // Attempt 2 clears fail_before_effect_n and must perform the effect.
    handle_command(&ctx, &cmd, 1_000).await.expect("third attempt must succeed");

    let retry_considered = broker
        .event_types_on(&cmd.events_topic)
        .iter()
        .filter(|t| *t == "retry.considered")
        .count();
    assert_eq!(retry_considered, 2);

    let record = sidefx_ledger::get_status(&pool, &cmd.effect_id())
        .await?
        .expect("effect record must exist after eventual success");
    assert_eq!(record.status, sidefx_ledger::EffectStatus::Done);

    // Only one artifact was ever created for this business key, regardless of
    // how many attempts preceded it.
    assert!(ctx.artifacts.exists(&cmd.business_key));

    Ok(())
}
