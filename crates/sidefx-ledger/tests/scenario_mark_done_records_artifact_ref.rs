use serde_json::json;

#[tokio::test]
async fn mark_done_records_artifact_ref() -> anyhow::Result<()> {
    let url = match std::env::var(sidefx_ledger::ENV_DATABASE_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: SIDEFX_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sidefx_ledger::connect(&url).await?;
    sidefx_ledger::migrate(&pool).await?;

    let effect_id = format!("test-effect-{}", uuid::Uuid::new_v4());
    let payload = json!({"amount_cents": 1200});

    sidefx_ledger::claim(&pool, &effect_id, "run-2", "step-1", "order-7", &payload).await?;
    sidefx_ledger::mark_done(&pool, &effect_id, "artifacts/order-7.receipt").await?;

    let record = sidefx_ledger::get_status(&pool, &effect_id)
        .await?
        .expect("record must exist after claim");
    assert_eq!(record.status, sidefx_ledger::EffectStatus::Done);
    assert_eq!(
        record.artifact_ref.as_deref(),
        Some("artifacts/order-7.receipt")
    );

    Ok(())
}

#[tokio::test]
async fn mark_failed_transitions_status() -> anyhow::Result<()> {
    let url = match std::env::var(sidefx_ledger::ENV_DATABASE_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: SIDEFX_DATABASE_URL not set");
            return Ok(());
        }
    };

    let pool = sidefx_ledger::connect(&url).await?;
    sidefx_ledger::migrate(&pool).await?;

    let effect_id = format!("test-effect-{}", uuid::Uuid::new_v4());
    let payload = json!({"amount_cents": 1200});

    sidefx_ledger::claim(&pool, &effect_id, "run-3", "step-1", "order-8", &payload).await?;
    sidefx_ledger::mark_failed(&pool, &effect_id, "exhausted retries").await?;

    let record = sidefx_ledger::get_status(&pool, &effect_id)
        .await?
        .expect("record must exist after claim");
    assert_eq!(record.status, sidefx_ledger::EffectStatus::Failed);

    Ok(())
}
