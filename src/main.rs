use clap::{Args, Parser, Subcommand};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod conversation;
mod delivery;
mod error;
mod events;
mod generation;
mod geo;
mod intent;
mod models;
mod orchestrator;
mod parsing;
mod prompts;
mod recommendation;
mod rerank;
mod server;
mod service;
mod session;
mod settings;
mod storage;

use delivery::{DeadLetterQueue, DeadLetterSink, LogSink};
use settings::{AppConfig, DeliverySettings, GenerationPolicies, GlobalConfigDefaults};
use storage::{RepositorySink, SqliteRepository, TravelRepository};

#[derive(Debug, Parser)]
#[command(name = "travel_relay")]
#[command(about = "Streaming travel recommendation service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start(StartArgs),
}

#[derive(Debug, Args)]
struct StartArgs {
    #[arg(long, env = "TRAVEL_RELAY_LISTEN", default_value = "127.0.0.1:7171")]
    listen: String,
    /// SQLite URL; defaults to a file under the XDG data directory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, env = "TRAVEL_RELAY_MODEL")]
    model: Option<String>,
    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "TRAVEL_RELAY_METRICS_LISTEN")]
    metrics_listen: Option<SocketAddr>,
    #[arg(long, default_value_t = 100)]
    channel_capacity: usize,
    #[arg(long, default_value_t = 2000)]
    send_timeout_ms: u64,
    #[arg(long, default_value_t = 100)]
    retry_backoff_ms: u64,
    #[arg(long, default_value_t = 3)]
    max_send_attempts: u32,
    #[arg(long, default_value_t = 24)]
    session_ttl_hours: i64,
    /// Cancel a turn that runs longer than this.
    #[arg(long, env = "TRAVEL_RELAY_TURN_TIMEOUT_SECS", default_value_t = 180)]
    turn_timeout_secs: u64,
    #[arg(long)]
    stream_chunks: Option<bool>,
}

impl StartArgs {
    fn app_config(&self) -> AppConfig {
        AppConfig {
            defaults: GlobalConfigDefaults {
                default_model: self.model.clone(),
                model_params: None,
                policies: Some(GenerationPolicies { stream_chunks: self.stream_chunks, max_itinerary_pois: None }),
            },
            delivery: DeliverySettings {
                capacity: self.channel_capacity.max(1),
                send_timeout: Duration::from_millis(self.send_timeout_ms),
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
                max_attempts: self.max_send_attempts.max(1),
            },
            session_ttl: chrono::Duration::hours(self.session_ttl_hours.max(1)),
            turn_timeout: Duration::from_secs(self.turn_timeout_secs.max(1)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => start(args).await?,
    }
    Ok(())
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let addr: SocketAddr = args.listen.parse()?;
    if let Some(metrics_addr) = args.metrics_listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()?;
        info!(%metrics_addr, "metrics exporter installed");
    }

    let config = args.app_config();
    let repo: Arc<dyn TravelRepository> = Arc::new(SqliteRepository::initialize(args.database_url.clone()).await?);
    let sinks: Vec<Arc<dyn DeadLetterSink>> = vec![Arc::new(LogSink), Arc::new(RepositorySink(repo.clone()))];
    let (dead_letters, drain) = DeadLetterQueue::spawn(sinks);

    let model = Arc::new(models::OpenAICompatible::from_env(config.turn_timeout)?);
    let generator = generation::Generator::new(model, repo.clone());
    let orchestrator = orchestrator::Orchestrator::new(generator, repo, Arc::new(geo::Haversine), config);
    let state = server::AppState { turns: service::TurnService::new(Arc::new(orchestrator), dead_letters) };

    server::serve(addr, state).await?;

    match tokio::time::timeout(Duration::from_secs(5), drain).await {
        Ok(Ok(drained)) => info!(drained, "dead letters flushed"),
        Ok(Err(e)) => warn!(error = %e, "dead-letter drain panicked"),
        Err(_) => warn!("turns still running at shutdown, dead-letter drain abandoned"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_flags_build_config() {
        let cli = Cli::try_parse_from([
            "travel_relay",
            "start",
            "--channel-capacity",
            "8",
            "--send-timeout-ms",
            "500",
            "--max-send-attempts",
            "0",
            "--session-ttl-hours",
            "2",
            "--turn-timeout-secs",
            "30",
            "--stream-chunks",
            "false",
            "--model",
            "local-model",
        ])
        .unwrap();
        let Commands::Start(args) = cli.command;
        let config = args.app_config();
        assert_eq!(config.delivery.capacity, 8);
        assert_eq!(config.delivery.send_timeout, Duration::from_millis(500));
        assert_eq!(config.delivery.max_attempts, 1);
        assert_eq!(config.session_ttl, chrono::Duration::hours(2));
        assert_eq!(config.turn_timeout, Duration::from_secs(30));
        assert_eq!(config.defaults.default_model.as_deref(), Some("local-model"));
        assert_eq!(config.defaults.policies.and_then(|p| p.stream_chunks), Some(false));
    }
}
