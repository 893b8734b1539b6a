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
        amount: 19.99,
        attempt: 0,
        max_attempts: 5,
        fail_before_effect_n: 0,
        fail_mode: FailMode::None,
    }
}

#[tokio::test]
async fn clean_happy_path_produces_full_event_lifecycle() -> anyhow::Result<()> {
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
    let ctx = HandlerContext::new(broker.clone(), pool.clone(), artifacts);

    let cmd = test_command("run-happy-1");
    handle_command(&ctx, &cmd, 1_000).await.expect("handler must succeed");

    let types = broker.event_types_on(&cmd.events_topic);
    assert_eq!(
        types,
        vec![
            "step.started",
            "side_effect.executing",
            "side_effect.done",
            "step.completed",
            "run.completed",
        ]
    );

    let record = sidefx_ledger::get_status(&pool, &cmd.effect_id())
        .await?
        .expect("effect record must exist");
    assert_eq!(record.status, sidefx_ledger::EffectStatus::Done);
    assert!(record.artifact_ref.is_some());
    assert!(ctx.artifacts.exists(&cmd.business_key));

    Ok(())
}
