use clap::Parser;
use tracing::info;

use apiary_core::HubConfig;
use apiary_hub::Hub;

#[derive(Parser, Debug)]
#[command(author, version, about = "Apiary: message-routing hub for agent swarms", long_about = None)]
struct Args {
    /// Path to TOML config file
    #[arg(short, long, default_value = "apiary.toml")]
    config: String,

    /// Agent endpoint port (overrides config file)
    #[arg(long)]
    port: Option<u16>,

    /// Client endpoint port (overrides config file)
    #[arg(long)]
    client_port: Option<u16>,

    /// Service endpoint port (overrides config file)
    #[arg(long)]
    service_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Log file path (additional to stderr)
    #[arg(long)]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists
    dotenv::dotenv().ok();

    let args = Args::parse();

    // Configurable tracing subscriber
    {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

        if let Some(ref log_path) = args.log_file {
            let file_appender = tracing_appender::rolling::daily(
                std::path::Path::new(log_path)
                    .parent()
                    .unwrap_or(std::path::Path::new(".")),
                std::path::Path::new(log_path)
                    .file_name()
                    .unwrap_or(std::ffi::OsStr::new("apiary.log")),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leak the guard so it lives for the program's lifetime
            std::mem::forget(guard);

            if args.log_json {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .with(fmt::layer().json().with_writer(non_blocking))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking))
                    .init();
            }
        } else if args.log_json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .init();
        }
    }

    // Load unified config (file + env overrides), then CLI overrides
    let mut config = HubConfig::load_or_default(&args.config);
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(port) = args.client_port {
        config.client_port = port;
    }
    if let Some(port) = args.service_port {
        config.service_port = port;
    }

    info!("Starting Apiary hub...");
    let hub = Hub::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    match tokio::time::timeout(std::time::Duration::from_secs(5), hub.stop()).await {
        Ok(()) => info!("Graceful shutdown completed"),
        Err(_) => tracing::warn!("Shutdown timed out after 5s, forcing exit"),
    }
    Ok(())
}
