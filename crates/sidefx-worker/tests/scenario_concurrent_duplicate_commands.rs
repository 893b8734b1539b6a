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
        amount: 7.5,
        attempt: 0,
        max_attempts: 5,
        fail_before_effect_n: 0,
        fail_mode: FailMode::None,
    }
}

/// Two deliveries racing for the same effect_id (e.g. a redelivered duplicate
/// arriving while the first attempt is still in flight) must not perform the
/// side effect twice: exactly one wins the ledger claim and executes; the
/// other observes `already_in_progress` or heals, never both executing.
#[tokio::test]
async fn concurrent_duplicates_perform_the_effect_at_most_once() -> anyhow::Result<()> {
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
    let ctx = Arc::new(HandlerContext::new(broker.clone(), pool.clone(), artifacts));

    let cmd = Arc::new(test_command("run-dup-1"));

    let (a, b) = tokio::join!(
        handle_command(&ctx, &cmd, 1_000),
        handle_command(&ctx, &cmd, 1_000),
    );
    a.expect("first delivery must succeed");
    b.expect("second delivery must succeed");

    let executing_count = broker
        .event_types_on(&cmd.events_topic)
        .iter()
        .filter(|t| *t == "side_effect.executing")
        .count();
    assert_eq!(executing_count, 1, "exactly one caller must win the claim and execute");

    let record = sidefx_ledger::get_status(&pool, &cmd.effect_id())
        .await?
        .expect("effect record must exist");
    assert_eq!(record.status, sidefx_ledger::EffectStatus::Done);

    Ok(())
}
