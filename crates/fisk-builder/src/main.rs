//! fisk builder entrypoint.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use fisk_builder::{BuilderConfig, BuilderState};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fisk-builder")]
#[command(about = "Compile jobs for the fisk network", version)]
struct Cli {
    /// Path to the builder config file (TOML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Scheduler address (host:port)
    #[arg(long, short = 's')]
    scheduler: Option<String>,

    /// Address to bind listeners to
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Job listener port
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Object cache HTTP port
    #[arg(long)]
    cache_port: Option<u16>,

    /// Disable the object cache HTTP endpoint
    #[arg(long, conflicts_with = "cache_port")]
    no_cache_endpoint: bool,

    /// Concurrent compile jobs
    #[arg(long, short = 'j')]
    slots: Option<u32>,

    /// Display name
    #[arg(long)]
    name: Option<String>,

    /// State directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Disable the object cache
    #[arg(long)]
    no_object_cache: bool,

    /// Object cache size in bytes
    #[arg(long)]
    object_cache_size: Option<u64>,

    /// Chroot compilers into their environment
    #[arg(long)]
    isolate: bool,

    /// User to run compilers as (implies --isolate)
    #[arg(long)]
    user: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut BuilderConfig) {
        if let Some(scheduler) = self.scheduler {
            config.scheduler = scheduler;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.no_cache_endpoint {
            config.cache_port = None;
        } else if let Some(port) = self.cache_port {
            config.cache_port = Some(port);
        }
        if let Some(slots) = self.slots {
            config.slots = slots;
        }
        if let Some(name) = self.name {
            config.name = Some(name);
        }
        if let Some(root) = self.root {
            config.root = root;
        }
        if self.no_object_cache {
            config.object_cache.enabled = false;
        }
        if let Some(size) = self.object_cache_size {
            config.object_cache.max_size = size;
        }
        if self.isolate || self.user.is_some() {
            config.isolation.enabled = true;
        }
        if let Some(user) = self.user {
            config.isolation.user = Some(user);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Log panics and take the whole process down shortly after, so a wedged
/// task never leaves a half-working builder registered.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "builder panicked, exiting");
        default_hook(info);
        std::thread::spawn(|| {
            std::thread::sleep(Duration::from_secs(1));
            std::process::exit(101);
        });
    }));
}

#[cfg(unix)]
fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}

#[cfg(not(unix))]
fn local_hostname() -> Option<String> {
    None
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    install_panic_hook();

    let cli = Cli::parse();
    let mut config = match BuilderConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);
    if config.hostname.is_none() {
        config.hostname = local_hostname();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        scheduler = %config.scheduler,
        port = config.port,
        slots = config.slots,
        root = %config.root.display(),
        "starting fisk builder"
    );

    let state = match BuilderState::open(config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "cannot start builder");
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

    match fisk_builder::run(state, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "builder stopped");
            ExitCode::FAILURE
        }
    }
}
