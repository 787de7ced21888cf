use clap::Parser;
use env_logger::Env;
use log::{error, info};
use server::config::PipelineConfig;
use server::game::GameMap;
use server::game_session::{GameSession, SessionOptions};
use server::network::Server;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Simulation turns per second
    #[arg(short, long, default_value = "1.4")]
    turns_per_second: f64,

    /// How long a turn may wait on a producer before it is forced closed
    #[arg(long, default_value = "5000")]
    stall_timeout_ms: u64,

    /// Per-client send timeout
    #[arg(long, default_value = "250")]
    send_timeout_ms: u64,

    /// Maximum number of connected clients
    #[arg(short = 'm', long, default_value = "16")]
    max_clients: usize,

    /// Consecutive failed sends before a client is disconnected
    #[arg(long, default_value = "5")]
    max_send_failures: u32,

    /// Unacknowledged records before a client is marked lagging
    #[arg(long, default_value = "256")]
    lag_threshold: usize,

    /// Unacknowledged records before a client is disconnected
    #[arg(long, default_value = "4096")]
    disconnect_threshold: usize,

    /// Only count a notification as delivered once the client acknowledges it
    #[arg(long)]
    require_acks: bool,

    /// Hold the turn advance while the slowest client trails by more than this
    #[arg(long)]
    max_client_turn_lag: Option<u64>,

    /// Width and height of the generated map
    #[arg(long, default_value = "32")]
    map_size: i32,

    /// Seed for the creature AI
    #[arg(long)]
    ai_seed: Option<u64>,

    /// Run without the creature AI producer
    #[arg(long)]
    no_creature_ai: bool,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        let backpressure_timeout = defaults.backpressure_timeout;
        defaults
            .with_turns_per_second(self.turns_per_second)
            .with_stall_timeout(Duration::from_millis(self.stall_timeout_ms))
            .with_send_timeout(Duration::from_millis(self.send_timeout_ms))
            .with_max_send_failures(self.max_send_failures)
            .with_lag_thresholds(self.lag_threshold, self.disconnect_threshold)
            .with_require_acks(self.require_acks)
            .with_max_client_turn_lag(self.max_client_turn_lag, backpressure_timeout)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let options = SessionOptions {
        max_sessions: args.max_clients,
        creature_ai: !args.no_creature_ai,
        ai_seed: args.ai_seed,
    };
    let map = GameMap::with_starting_dungeon(args.map_size, args.map_size, 1);
    let mut session = GameSession::start(args.pipeline_config(), map, options)?;

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, &session).await?;
    let network = tokio::spawn(server.run(session.shutdown_signal()));

    let reason = tokio::select! {
        result = session.driver_stopped() => {
            if let Err(e) = &result {
                error!("Turn driver stopped: {}", e);
            }
            "turn driver stopped"
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            "server shutting down"
        }
    };

    let stats = session.shutdown(reason).await?;
    if let Err(e) = network.await {
        error!("Network task panicked: {}", e);
    }

    info!(
        "Dispatched {} records ({} deliveries, {} failures, {} disconnects)",
        stats.records, stats.deliveries, stats.failures, stats.disconnects
    );
    Ok(())
}
