use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::Arc};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use polychat::cli::ChatRepl;
use polychat::server::{self, AppState};
use polychat::settings::AppConfig;
use polychat::ChatService;

#[derive(Debug, Parser)]
#[command(name = "polychat")]
#[command(about = "Multi-model AI chat with persistent sessions", long_about = None)]
struct Cli {
    /// SQLite URL, or "memory" for a throwaway store
    #[arg(long, global = true, env = "POLYCHAT_DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, global = true, env = "POLYCHAT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, global = true, env = "POLYCHAT_BASE_URL")]
    base_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the JSON API
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
    },
    /// Chat in the terminal
    Chat {
        /// Model for a new chat when none is active
        #[arg(long)]
        model: Option<String>,
    },
}

impl Cli {
    fn config(&self) -> AppConfig {
        let mut cfg = AppConfig::from_env();
        if let Some(url) = &self.database_url {
            cfg.database_url = Some(url.clone());
        }
        if let Some(key) = &self.api_key {
            cfg.api_key = Some(key.clone());
        }
        if let Some(url) = &self.base_url {
            cfg.base_url = url.clone();
        }
        cfg
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = cli.config();
    match cli.command {
        Commands::Serve { listen } => {
            let addr: SocketAddr = listen.parse()?;
            let handle = PrometheusBuilder::new().install_recorder()?;
            let service = Arc::new(ChatService::connect(&cfg).await?);
            info!(model = %cfg.default_model, "chat service ready");
            server::serve(addr, AppState::new(service).with_metrics(handle)).await?;
        }
        Commands::Chat { model } => {
            let service = Arc::new(ChatService::connect(&cfg).await?);
            if let Some(model) = model {
                if service.current_session().await.is_none() {
                    service.create_session(Some(&model), None).await?;
                }
            }
            ChatRepl::new(service, cfg.reveal_delay).run().await?;
        }
    }
    Ok(())
}
