//! Builder service wiring: shared state, the job listener and startup.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fisk_protocol::{Connection, ErrorCode, ProtocolError, Role};
use fisk_store::{ensure_version, VersionCheck, STATE_VERSION};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::BuilderConfig;
use crate::environments::Environments;
use crate::error::BuilderResult;
use crate::executor::Executor;
use crate::handlers;
use crate::link::{self, SchedulerLink};
use crate::object_cache::{self, ObjectCache, ObjectCacheConfig};
use crate::queue::{JobId, SharedQueue};

/// State shared by every connection task.
#[derive(Debug)]
pub struct BuilderState {
    pub config: BuilderConfig,
    pub environments: Environments,
    pub executor: Executor,
    pub queue: SharedQueue,
    pub cache: Option<Mutex<ObjectCache>>,
    pub link: SchedulerLink,
    next_job: AtomicU64,
}

impl BuilderState {
    /// Prepare the state root and load everything in it.
    ///
    /// A root written by an incompatible version is wiped first.
    pub async fn open(config: BuilderConfig) -> BuilderResult<Arc<Self>> {
        config.validate()?;
        match ensure_version(&config.root, STATE_VERSION)? {
            VersionCheck::Reset { previous } => tracing::warn!(
                root = %config.root.display(),
                ?previous,
                "state root from another version discarded"
            ),
            VersionCheck::Created => tracing::info!(root = %config.root.display(), "state root created"),
            VersionCheck::Current => {}
        }

        let environments = Environments::open(&config.packages_dir(), &config.environments_dir())?;
        environments.extract_missing().await;

        let executor = Executor::new(
            config.jobs_dir(),
            config.isolation.enabled,
            config.compile_user()?,
        )?;

        let cache = if config.object_cache.enabled {
            let (tx, rx) = object_cache::channel();
            tokio::spawn(object_cache::log_events(rx));
            let cache = ObjectCache::open(
                ObjectCacheConfig {
                    dir: config.object_cache_dir(),
                    max_size: config.object_cache.max_size,
                    purge_size: config.object_cache.purge_size(),
                },
                Some(tx),
            )?;
            Some(Mutex::new(cache))
        } else {
            None
        };

        Ok(Arc::new(Self {
            queue: SharedQueue::new(config.slots as usize),
            config,
            environments,
            executor,
            cache,
            link: SchedulerLink::default(),
            next_job: AtomicU64::new(1),
        }))
    }

    pub fn next_job_id(&self) -> JobId {
        self.next_job.fetch_add(1, Ordering::Relaxed)
    }

    /// Lock the object cache, if enabled. Never hold the guard across an
    /// `.await`.
    pub fn cache(&self) -> Option<MutexGuard<'_, ObjectCache>> {
        self.cache
            .as_ref()
            .map(|cache| cache.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Accept job connections until `shutdown` fires.
pub async fn serve_jobs(
    state: Arc<BuilderState>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> BuilderResult<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "accepting jobs");
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            dispatch(state, Connection::accept(stream), peer).await;
        });
    }
}

async fn dispatch(state: Arc<BuilderState>, mut conn: Connection, peer: SocketAddr) {
    let handshake = match conn.accept_handshake().await {
        Ok(handshake) => handshake,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "handshake failed");
            return;
        }
    };
    match handshake.role {
        Role::Job => handlers::job::handle(state, conn, peer, handshake).await,
        other => {
            let error = ProtocolError::new(
                ErrorCode::InvalidRequest,
                format!("builders accept job connections, not {}", other),
            );
            conn.fail(&error).await;
        }
    }
}

/// Run the builder: job listener, object cache endpoint and scheduler
/// link, until `shutdown` fires or a listener fails.
pub async fn run(state: Arc<BuilderState>, shutdown: CancellationToken) -> BuilderResult<()> {
    let job_listener = TcpListener::bind((state.config.bind, state.config.port)).await?;

    let http = match state.config.cache_port {
        Some(port) if state.cache.is_some() => {
            let listener = TcpListener::bind((state.config.bind, port)).await?;
            Some(tokio::spawn(handlers::objectcache::serve(
                Arc::clone(&state),
                listener,
                shutdown.clone(),
            )))
        }
        _ => None,
    };

    let link = tokio::spawn(link::run(Arc::clone(&state), shutdown.clone()));
    let result = serve_jobs(Arc::clone(&state), job_listener, shutdown.clone()).await;

    shutdown.cancel();
    let _ = link.await;
    if let Some(http) = http {
        match http.await {
            Ok(Err(e)) => tracing::error!(error = %e, "object cache endpoint failed"),
            Ok(Ok(())) | Err(_) => {}
        }
    }
    result
}
