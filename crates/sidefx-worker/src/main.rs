use std::sync::Arc;

use anyhow::{Context, Result};
use sidefx_artifacts::ArtifactSink;
use sidefx_broker::{BrokerAdapter, HttpBrokerAdapter};
use sidefx_schemas::{Command, COMMANDS_TOPIC, DLQ_TOPIC};
use sidefx_worker::{handle_command, schedule_after_failure, HandlerContext, HandlerFailure};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const MAX_CONCURRENT_DELIVERIES: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    sidefx_config::bootstrap_dotenv();
    sidefx_config::init_tracing();

    let config = sidefx_config::WorkerConfig::from_env()?;

    let ledger = sidefx_ledger::connect(&config.database_url).await?;
    sidefx_ledger::migrate(&ledger).await?;

    let broker: Arc<dyn BrokerAdapter> =
        Arc::new(HttpBrokerAdapter::new(&config.broker_url).context("build broker adapter")?);
    let artifacts = ArtifactSink::new(&config.artifacts_dir).context("open artifact sink")?;

    broker.ensure_topic(COMMANDS_TOPIC).await?;
    broker.ensure_topic(DLQ_TOPIC).await?;

    tracing::info!(
        topic = COMMANDS_TOPIC,
        group = %config.worker_group,
        "starting consume loop"
    );

    let ctx = Arc::new(HandlerContext::new(broker.clone(), ledger, artifacts));

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES));
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, draining in-flight deliveries");
                break;
            }

            delivery = broker.consume_one(COMMANDS_TOPIC, &config.worker_group, &config.owner, config.lease_ms) => {
                let delivery = match delivery {
                    Ok(Some(d)) => d,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "consume_one failed, backing off");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let cmd: Command = match serde_json::from_value(delivery.value.clone()) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping poison message: not a valid Command");
                        let _ = broker
                            .ack(COMMANDS_TOPIC, &config.worker_group, &config.owner, delivery.partition, delivery.offset)
                            .await;
                        continue;
                    }
                };

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let ctx = ctx.clone();
                let broker = broker.clone();
                let group = config.worker_group.clone();
                let owner = config.owner.clone();

                inflight.spawn(async move {
                    let _permit = permit;
                    let now_ms = chrono::Utc::now().timestamp_millis();

                    match handle_command(&ctx, &cmd, now_ms).await {
                        Ok(()) => {
                            let _ = broker
                                .ack(COMMANDS_TOPIC, &group, &owner, delivery.partition, delivery.offset)
                                .await;
                        }
                        Err(HandlerFailure::Poison(reason)) => {
                            tracing::warn!(run_id = %cmd.run_id, reason, "poison command, acking and dropping");
                            let _ = broker
                                .ack(COMMANDS_TOPIC, &group, &owner, delivery.partition, delivery.offset)
                                .await;
                        }
                        Err(HandlerFailure::Transient(e)) => {
                            if let Err(se) = schedule_after_failure(&broker, &cmd, &e.to_string(), now_ms).await {
                                tracing::warn!(run_id = %cmd.run_id, error = %se, "scheduler failed");
                            }
                            let _ = broker
                                .ack(COMMANDS_TOPIC, &group, &owner, delivery.partition, delivery.offset)
                                .await;
                        }
                    }
                });

                // Reap finished tasks so the set doesn't grow unbounded under load.
                while inflight.try_join_next().is_some() {}
            }
        }
    }

    while inflight.join_next().await.is_some() {}
    tracing::info!("consume loop stopped");
    Ok(())
}
