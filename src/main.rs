use clap::Parser;
use lns_link::{config, udp};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lns-link")]
#[command(about = "LoRaWAN network server link control: gateway selection, ADR and LinkCheck")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        config::Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("lns-link v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Installation margin {} dB, RX1 delay {} s, RX2 {} MHz DR{}",
        config.network_server.installation_margin,
        config.network_server.rx1_delay,
        config.network_server.rx2_frequency,
        config.network_server.rx2_data_rate,
    );

    tokio::select! {
        result = udp::run_server(&config) => {
            if let Err(e) = result {
                error!("UDP server failed: {:#}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
