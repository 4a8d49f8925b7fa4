//! fisk scheduler entrypoint.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use fisk::config::EffectiveConfig;
use fisk::{server, Shared};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fisk-scheduler")]
#[command(about = "Match compile jobs to fisk builders", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler (default)
    Serve,

    /// Print the effective configuration as JSON and exit
    Config,
}

#[derive(Args)]
struct Settings {
    /// Path to the config file (TOML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, global = true)]
    bind: Option<IpAddr>,

    /// Listener port
    #[arg(long, short = 'p', global = true)]
    port: Option<u16>,

    /// State directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Events buffered per monitor
    #[arg(long, global = true)]
    monitor_buffer: Option<usize>,
}

impl Settings {
    /// Flags given on the command line, as a config layer.
    fn overrides(&self) -> Option<Value> {
        let mut layer = Map::new();
        if let Some(bind) = self.bind {
            layer.insert("bind".into(), json!(bind.to_string()));
        }
        if let Some(port) = self.port {
            layer.insert("port".into(), json!(port));
        }
        if let Some(root) = &self.root {
            layer.insert("root".into(), json!(root));
        }
        if let Some(buffer) = self.monitor_buffer {
            layer.insert("monitor_buffer".into(), json!(buffer));
        }
        (!layer.is_empty()).then_some(Value::Object(layer))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "scheduler panicked, exiting");
        default_hook(info);
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(1));
            std::process::exit(101);
        });
    }));
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    install_panic_hook();

    let cli = Cli::parse();
    let effective = match EffectiveConfig::build(cli.settings.config.as_deref(), cli.settings.overrides()) {
        Ok(effective) => effective,
        Err(e) => {
            tracing::error!(error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => match serde_json::to_string_pretty(&effective) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot render configuration");
                ExitCode::FAILURE
            }
        },
        Commands::Serve => serve(effective).await,
    }
}

async fn serve(effective: EffectiveConfig) -> ExitCode {
    let config = effective.config;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        port = config.port,
        root = %config.root.display(),
        "starting fisk scheduler"
    );

    let shared = match Shared::open(config) {
        Ok(shared) => shared,
        Err(e) => {
            tracing::error!(error = %e, "cannot start scheduler");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            trigger.cancel();
        }
    });

    match server::run(shared, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "scheduler stopped");
            ExitCode::FAILURE
        }
    }
}
