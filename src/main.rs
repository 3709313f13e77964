//! One-shot lifecycle sweep job. Run daily by an external scheduler (cron,
//! systemd timer): settles every elapsed reservation, sanctions no-shows,
//! prints a JSON summary to stdout, and compacts the WAL when it has grown.

use std::path::PathBuf;
use std::sync::Arc;

use aula::config::Config;
use aula::engine::Engine;
use aula::notify::NotifyHub;
use aula::observability;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let wal_path: PathBuf = env_parse("AULA_WAL", PathBuf::from("aula.wal"));
    let metrics_port: Option<u16> = std::env::var("AULA_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    let compact_threshold: u64 = env_parse("AULA_COMPACT_THRESHOLD", 10_000);
    let config = Config::from_env();

    observability::init(metrics_port);
    tracing::info!(wal = %wal_path.display(), "opening reservation ledger");

    let engine = Engine::open(&wal_path, config.clone(), Arc::new(NotifyHub::new()))?;

    let local = chrono::Local::now();
    let today = local.date_naive();
    let now = local.time();

    let summary = engine.run_sweep(today, now, config.sanction_days).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let backlog = engine.replayed_events() + engine.wal_appends_since_compact().await;
    if backlog > compact_threshold {
        tracing::info!(backlog, "compacting WAL");
        engine.compact_wal().await?;
    }

    Ok(())
}
