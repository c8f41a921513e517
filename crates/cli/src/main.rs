use std::path::PathBuf;

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    hana_config::HanaConfig,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "hana", about = "HANA: HTTP API for Neon Applications")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to load instead of searching the standard locations.
    #[arg(long, short, global = true, env = "HANA_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway {
        /// Overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,
        /// Disable credential checks (rate limits still apply).
        #[arg(long, default_value_t = false)]
        disable_auth: bool,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration with secrets redacted.
    Show {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the directory searched for `hana.toml`.
    Path,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<HanaConfig> {
    match &cli.config {
        Some(path) => hana_config::load_config(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(hana_config::discover_and_load()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let mut config = load(&cli)?;

    match cli.command {
        Commands::Gateway {
            bind,
            port,
            disable_auth,
        } => {
            info!(version = env!("CARGO_PKG_VERSION"), "hana starting");
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.auth.disable_auth |= disable_auth;
            hana_gateway::start_gateway(config).await
        },
        Commands::Config { action } => match action {
            ConfigAction::Show { json } => {
                let rendered = if json {
                    serde_json::to_string_pretty(&config)?
                } else {
                    toml::to_string_pretty(&config)?
                };
                println!("{rendered}");
                Ok(())
            },
            ConfigAction::Path => {
                match hana_config::config_dir() {
                    Some(dir) => println!("{}", dir.display()),
                    None => eprintln!("no home directory found"),
                }
                Ok(())
            },
        },
    }
}
