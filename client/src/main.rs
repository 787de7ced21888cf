use clap::Parser;
use client::network::Client;
use env_logger::Env;
use log::info;
use shared::PlayerCommand;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name shown to other players
    #[arg(short = 'n', long, default_value = "keeper")]
    nick: String,

    /// Chat message to send once connected
    #[arg(short = 'c', long)]
    chat: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    info!("Connecting to: {}", args.server);

    let mut client = Client::new(&args.server, &args.nick).await?;
    client.connect().await?;
    if let Some(message) = args.chat {
        client.send_action(PlayerCommand::Chat { message }).await?;
    }

    let result = tokio::select! {
        result = client.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, disconnecting...");
            Ok(())
        }
    };
    client.disconnect().await?;

    let mirror = client.mirror();
    info!(
        "Stopped at turn {}: {} tiles, {} creatures, {} chat messages",
        mirror.current_turn(),
        mirror.tile_count(),
        mirror.creatures().count(),
        mirror.chat_log().len()
    );
    result
}
