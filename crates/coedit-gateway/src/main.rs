//! coedit: block lock coordination gateway

use clap::{Parser, Subcommand};
use coedit_core::{BindMode, CoordinatorConfig};
use coedit_gateway::start_gateway;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "coedit.toml";

#[derive(Parser)]
#[command(
    name = "coedit",
    about = "Collaborative editing coordinator: block locks, edit intents, analysis pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Overrides `[gateway] port`
        #[arg(short, long)]
        port: Option<u16>,
        /// `loopback` or `lan`; overrides `[gateway] bind`
        #[arg(short, long)]
        bind: Option<String>,
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { port, bind, config }) => {
            init_tracing();
            let mut config = CoordinatorConfig::load(&config);
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(bind) = bind {
                config.gateway.bind = parse_bind(&bind);
            }
            start_gateway(config).await?;
        }

        Some(Commands::Config { config }) => {
            print!("{}", CoordinatorConfig::load(&config).to_toml());
        }

        Some(Commands::Version) => {
            println!("coedit v{}", env!("CARGO_PKG_VERSION"));
        }

        None => {
            init_tracing();
            start_gateway(CoordinatorConfig::load(&PathBuf::from(DEFAULT_CONFIG))).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coedit=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_bind(bind: &str) -> BindMode {
    match bind {
        "lan" | "0.0.0.0" => BindMode::Lan,
        _ => BindMode::Loopback,
    }
}
