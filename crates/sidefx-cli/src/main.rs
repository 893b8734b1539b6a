use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sidefx_broker::{BrokerAdapter, HttpBrokerAdapter};
use sidefx_schemas::{Command as SideEffectCommand, Event, FailMode, COMMANDS_TOPIC, DLQ_TOPIC};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sidefx")]
#[command(about = "Side-effect worker fleet CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ledger database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Broker topic commands
    Topics {
        #[command(subcommand)]
        cmd: TopicsCmd,
    },

    /// Run lifecycle commands
    Runs {
        #[command(subcommand)]
        cmd: RunsCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Report connectivity and whether the effect_records table exists
    Status,
    /// Apply embedded sqlx migrations
    Migrate,
}

#[derive(Subcommand)]
enum TopicsCmd {
    /// Create the commands, DLQ, and (optionally) a run's events topic
    Ensure {
        /// Also ensure sidefx.events.<run_id>
        #[arg(long)]
        run_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum RunsCmd {
    /// Submit a new run directly onto the broker, bypassing the HTTP ingress
    Submit {
        #[arg(long)]
        business_key: String,

        #[arg(long)]
        amount: f64,

        #[arg(long, default_value_t = 0)]
        fail_before_effect_n: u32,

        /// none | crash_after_effect_before_ack
        #[arg(long, default_value = "none")]
        fail_mode: String,

        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    sidefx_config::bootstrap_dotenv();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = sidefx_ledger::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = sidefx_ledger::status(&pool).await?;
                    println!("db_ok={} has_effect_records_table={}", s.ok, s.has_effect_records_table);
                }
                DbCmd::Migrate => {
                    sidefx_ledger::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Topics { cmd } => match cmd {
            TopicsCmd::Ensure { run_id } => {
                let broker = broker_from_env()?;
                broker.ensure_topic(COMMANDS_TOPIC).await?;
                broker.ensure_topic(DLQ_TOPIC).await?;
                println!("ensured {COMMANDS_TOPIC}");
                println!("ensured {DLQ_TOPIC}");
                if let Some(run_id) = run_id {
                    let events_topic = sidefx_schemas::events_topic_for(&run_id);
                    broker.ensure_topic(&events_topic).await?;
                    println!("ensured {events_topic}");
                }
            }
        },

        Commands::Runs { cmd } => match cmd {
            RunsCmd::Submit {
                business_key,
                amount,
                fail_before_effect_n,
                fail_mode,
                max_attempts,
            } => {
                let fail_mode = parse_fail_mode(&fail_mode)?;
                let broker = broker_from_env()?;
                let config = sidefx_config::ApiConfig::from_env()?;

                let run_id = Uuid::new_v4().to_string();
                let events_topic = sidefx_schemas::events_topic_for(&run_id);
                let ts = Utc::now().timestamp_millis();

                broker.ensure_topic(COMMANDS_TOPIC).await?;
                broker.ensure_topic(DLQ_TOPIC).await?;
                broker.ensure_topic(&events_topic).await?;

                let created = Event::RunCreated {
                    ts,
                    run_id: run_id.clone(),
                    business_key: business_key.clone(),
                    amount,
                };
                emit(&*broker, &events_topic, &created).await;

                let command = SideEffectCommand {
                    ts,
                    kind: "run.command".to_string(),
                    run_id: run_id.clone(),
                    events_topic: events_topic.clone(),
                    step_id: sidefx_schemas::STEP_CHARGE_CARD.to_string(),
                    business_key,
                    amount,
                    attempt: 0,
                    max_attempts: max_attempts.unwrap_or(config.max_attempts_default),
                    fail_before_effect_n,
                    fail_mode,
                };
                let idempotency_key = command.command_idempotency_key();
                broker
                    .produce(
                        COMMANDS_TOPIC,
                        &serde_json::to_value(&command)?,
                        Some(&idempotency_key),
                    )
                    .await?;

                let enqueued = Event::CommandEnqueued {
                    ts,
                    run_id: run_id.clone(),
                    attempt: 0,
                };
                emit(&*broker, &events_topic, &enqueued).await;

                println!("run_id={run_id}");
                println!("events_topic={events_topic}");
            }
        },
    }

    Ok(())
}

fn broker_from_env() -> Result<HttpBrokerAdapter> {
    let config = sidefx_config::ApiConfig::from_env()?;
    HttpBrokerAdapter::new(&config.broker_url)
}

fn parse_fail_mode(s: &str) -> Result<FailMode> {
    match s {
        "none" => Ok(FailMode::None),
        "crash_after_effect_before_ack" => Ok(FailMode::CrashAfterEffectBeforeAck),
        other => anyhow::bail!("invalid --fail-mode: {other} (expected none | crash_after_effect_before_ack)"),
    }
}

async fn emit(broker: &dyn BrokerAdapter, events_topic: &str, event: &Event) {
    let idempotency_key = event.idempotency_key();
    let value = match serde_json::to_value(event) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize event for emit");
            return;
        }
    };
    sidefx_broker::emit(broker, events_topic, &value, idempotency_key.as_deref()).await;
}
