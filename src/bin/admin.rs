use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use planting_verifier::anomaly::assess_threat;
use planting_verifier::domain::{AdminId, EvidenceId, Severity};
use planting_verifier::infra::{
    EvidenceStore, PgSecurityEventStore, PgStore, SecurityEventStore, ShutdownCoordinator,
    VerificationLogStore,
};
use planting_verifier::pipeline::OverrideRequest;
use planting_verifier::server::{assemble, Assembled, Config, StorageBackend};
use planting_verifier::telemetry::{init_telemetry, TelemetryConfig};

fn print_help() {
    eprintln!(
        "\
planting-verifier-admin

USAGE:
  planting-verifier-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  verify                          Run (or return) the automated decision for a submission
  override                        Record a manual decision
  pending                         List submissions awaiting a decision
  history                         Print the full decision history of a submission
  security-events                 List recent security events
  threat-level                    Print the threat level over the last hour

COMMON OPTIONS:
  --database-url <postgres_url>    (defaults to env DATABASE_URL)

verify OPTIONS:
  --evidence-id <uuid>            (required)

override OPTIONS:
  --evidence-id <uuid>            (required)
  --verified <true|false>         (required)
  --reason <text>                 (required)
  --admin-id <id>                 (required)
  --adjusted-trees <n>            (optional; only with --verified true)

pending OPTIONS:
  --limit <n>                     (default: 50)
  --offset <n>                    (default: 0)

history OPTIONS:
  --evidence-id <uuid>            (required)

security-events OPTIONS:
  --since-hours <n>               (default: 24)
  --severity <low|medium|high|critical>
  --limit <n>                     (default: 100)

ENV:
  verify and override use the same collaborator endpoints as the server
  (ELEVATION_API_URL, WEATHER_API_URL, IMAGERY_API_URL, INFERENCE_API_URL,
  STORAGE_GATEWAY_URL, REWARD_WEBHOOK_URL, ...)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn parse_evidence_id(raw: &str) -> anyhow::Result<EvidenceId> {
    Ok(EvidenceId::from_uuid(Uuid::parse_str(raw)?))
}

async fn connect(database_url: Option<String>) -> anyhow::Result<PgPool> {
    let database_url = require_database_url(database_url)?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    Ok(pool)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wire the full service against Postgres, run `op`, then drain the monitor.
async fn with_service<F, Fut, T>(database_url: Option<String>, op: F) -> anyhow::Result<T>
where
    F: FnOnce(Arc<planting_verifier::VerificationService>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut config = Config::from_env()?;
    config.database_url = require_database_url(database_url)?;
    config.backend = StorageBackend::Postgres;

    let coordinator = ShutdownCoordinator::new();
    let Assembled {
        state,
        monitor_task,
    } = assemble(&config, coordinator.signal()).await?;

    let result = op(state.service.clone()).await;
    state.service.flush_notifications().await;

    coordinator.shutdown();
    if let Err(e) = monitor_task.await {
        eprintln!("warning: security monitor task failed: {e}");
    }
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    // Command output owns stdout.
    let telemetry = TelemetryConfig {
        log_to_stderr: true,
        log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string()),
        ..TelemetryConfig::default()
    };
    init_telemetry(&telemetry)?;

    match command.as_str() {
        "migrate" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let pool = connect(database_url).await?;
            planting_verifier::migrations::run_postgres(&pool).await?;
            println!("ok: migrations applied");
            Ok(())
        }
        "verify" => {
            let mut database_url: Option<String> = None;
            let mut evidence_id: Option<EvidenceId> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--evidence-id" => {
                        evidence_id = Some(parse_evidence_id(&value(&mut args, &arg)?)?)
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }
            let evidence_id =
                evidence_id.ok_or_else(|| anyhow::anyhow!("--evidence-id is required"))?;

            let log = with_service(database_url, |service| async move {
                Ok(service.verify(evidence_id).await?)
            })
            .await?;
            print_json(&log)
        }
        "override" => {
            let mut database_url: Option<String> = None;
            let mut evidence_id: Option<EvidenceId> = None;
            let mut verified: Option<bool> = None;
            let mut reason: Option<String> = None;
            let mut admin_id: Option<String> = None;
            let mut adjusted_trees: Option<u32> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--evidence-id" => {
                        evidence_id = Some(parse_evidence_id(&value(&mut args, &arg)?)?)
                    }
                    "--verified" => verified = Some(value(&mut args, &arg)?.parse()?),
                    "--reason" => reason = Some(value(&mut args, &arg)?),
                    "--admin-id" => admin_id = Some(value(&mut args, &arg)?),
                    "--adjusted-trees" => adjusted_trees = Some(value(&mut args, &arg)?.parse()?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let request = OverrideRequest {
                evidence_id: evidence_id
                    .ok_or_else(|| anyhow::anyhow!("--evidence-id is required"))?,
                verified: verified.ok_or_else(|| anyhow::anyhow!("--verified is required"))?,
                reason: reason.ok_or_else(|| anyhow::anyhow!("--reason is required"))?,
                adjusted_trees,
                admin_id: AdminId::new(
                    admin_id.ok_or_else(|| anyhow::anyhow!("--admin-id is required"))?,
                ),
            };

            let log = with_service(database_url, |service| async move {
                Ok(service.override_decision(request).await?)
            })
            .await?;
            print_json(&log)
        }
        "pending" => {
            let mut database_url: Option<String> = None;
            let mut limit: u32 = 50;
            let mut offset: u32 = 0;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--limit" => limit = value(&mut args, &arg)?.parse()?,
                    "--offset" => offset = value(&mut args, &arg)?.parse()?,
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let store = PgStore::new(connect(database_url).await?);
            let pending = store.list_pending(limit.clamp(1, 500), offset).await?;
            print_json(&pending)
        }
        "history" => {
            let mut database_url: Option<String> = None;
            let mut evidence_id: Option<EvidenceId> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--evidence-id" => {
                        evidence_id = Some(parse_evidence_id(&value(&mut args, &arg)?)?)
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }
            let evidence_id =
                evidence_id.ok_or_else(|| anyhow::anyhow!("--evidence-id is required"))?;

            let store = PgStore::new(connect(database_url).await?);
            let logs = store.history(evidence_id).await?;
            if logs.is_empty() && store.get(evidence_id).await?.is_none() {
                anyhow::bail!("evidence not found: {evidence_id}");
            }
            print_json(&logs)
        }
        "security-events" => {
            let mut database_url: Option<String> = None;
            let mut since_hours: i64 = 24;
            let mut severity: Option<Severity> = None;
            let mut limit: u32 = 100;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--since-hours" => since_hours = value(&mut args, &arg)?.parse()?,
                    "--severity" => {
                        severity = Some(
                            value(&mut args, &arg)?
                                .parse()
                                .map_err(|e: String| anyhow::anyhow!(e))?,
                        )
                    }
                    "--limit" => limit = value(&mut args, &arg)?.parse()?,
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let store = PgSecurityEventStore::new(connect(database_url).await?);
            let since = Utc::now() - Duration::hours(since_hours.max(0));
            let events = store.since(since, severity, limit.clamp(1, 1000)).await?;
            print_json(&events)
        }
        "threat-level" => {
            let mut database_url: Option<String> = None;
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let store = PgSecurityEventStore::new(connect(database_url).await?);
            let events = store
                .since(Utc::now() - Duration::hours(1), None, 10_000)
                .await?;
            let critical = events
                .iter()
                .filter(|e| e.severity == Severity::Critical)
                .count();
            let high = events
                .iter()
                .filter(|e| e.severity == Severity::High)
                .count();
            let level = assess_threat(critical, high, events.len());

            print_json(&serde_json::json!({
                "threat_level": level,
                "value": level.as_gauge(),
                "critical_last_hour": critical,
                "high_last_hour": high,
                "events_last_hour": events.len(),
            }))
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
