use clap::Parser;
use log::{error, info};
use server::collab::{DirFileSystem, StaticLevelSource};
use server::network::NetworkServer;
use server::server::Server;
use server::settings::ServerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, loads the configuration and runs the network loop.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "14900")]
        port: u16,
        /// Main loop wakeups per second
        #[clap(short, long, default_value = "20")]
        tick_rate: u32,
        /// JSON server configuration; defaults apply when omitted
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Directory holding levels and downloadable files
        #[clap(short, long, default_value = "world")]
        root: PathBuf,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServerConfig::load(path).map_err(|e| {
            error!("Failed to load {}: {}", path.display(), e);
            e
        })?,
        None => ServerConfig::default(),
    };
    info!("Starting {}", config.name);

    let files = DirFileSystem::new(&args.root)?;
    let levels = StaticLevelSource::new(Box::new(DirFileSystem::new(&args.root)?));
    let core = Server::new(config, Box::new(files), Box::new(levels));

    let address = format!("{}:{}", args.host, args.port);
    let tick_duration = Duration::from_secs_f32(1.0 / args.tick_rate.max(1) as f32);
    let mut server = NetworkServer::new(&address, core, tick_duration).await?;

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
