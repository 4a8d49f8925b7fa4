//! Scheduler service: connection dispatch and the sessions behind it.
//!
//! ```text
//! builder  --handshake{role: builder}-->  register, push environments
//!          <--environment + payload---
//!          --environments{hashes}----->  ack, push the next one
//!          --jobStarted/jobFinished--->  update load, notify monitors
//!
//! client   --handshake{role: client}-->  placement or needsEnvironment
//!          --requestBuilder----------->  another placement
//!          --uploadEnvironment+bytes-->  store, distribute
//!
//! monitor  --handshake{role: monitor}->  builderAdded snapshot, then events
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use fisk_protocol::message::decode;
use fisk_protocol::{
    BuilderHeaders, BuilderMessage, ClientHeaders, ClientIdentity, ClientMessage, Connection,
    ErrorCode, FrameSender, Handshake, Inbound, MonitorEvent, ProtocolError, Role, SchedulerMessage,
    SchedulerReply,
};
use fisk_store::{ensure_version, EnvironmentStore, Prepared, StoreError, VersionCheck, STATE_VERSION};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{ServerError, ServerResult};
use crate::monitor::{self, MonitorFeed};
use crate::scheduler::{BuilderId, PlacementRequest, ReservationId, Scheduler, Transfer};

/// Outbound side of a registered builder.
///
/// The lock keeps an environment payload from interleaving with other
/// messages to the same builder. Cancelling `broken` ends the session.
#[derive(Debug, Clone)]
struct BuilderLink {
    sender: FrameSender,
    order: Arc<tokio::sync::Mutex<()>>,
    broken: CancellationToken,
}

/// State shared by every connection task.
#[derive(Debug)]
pub struct Shared {
    pub config: SchedulerConfig,
    pub store: EnvironmentStore,
    pub monitor: MonitorFeed,
    scheduler: Mutex<Scheduler>,
    links: Mutex<HashMap<BuilderId, BuilderLink>>,
}

impl Shared {
    /// Prepare the state root and load stored environments.
    pub fn open(config: SchedulerConfig) -> ServerResult<Arc<Self>> {
        match ensure_version(&config.root, STATE_VERSION)? {
            VersionCheck::Reset { previous } => tracing::warn!(
                root = %config.root.display(),
                ?previous,
                "state root from another version discarded"
            ),
            VersionCheck::Created => tracing::info!(root = %config.root.display(), "state root created"),
            VersionCheck::Current => {}
        }
        let store = EnvironmentStore::load(config.environments_dir())?;
        Ok(Arc::new(Self {
            monitor: MonitorFeed::new(config.monitor_buffer),
            config,
            store,
            scheduler: Mutex::new(Scheduler::new()),
            links: Mutex::new(HashMap::new()),
        }))
    }

    /// Lock the scheduler. Never hold the guard across an `.await`.
    pub fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn links(&self) -> MutexGuard<'_, HashMap<BuilderId, BuilderLink>> {
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn link(&self, builder: BuilderId) -> Option<BuilderLink> {
        self.links().get(&builder).cloned()
    }

    /// Start a push to every idle builder missing an environment it can run.
    pub fn distribute(self: &Arc<Self>) {
        let environments = self.store.list();
        let transfers = self.scheduler().plan_transfers(&environments);
        for transfer in transfers {
            tracing::info!(builder = transfer.builder, hash = %transfer.hash, "pushing environment");
            tokio::spawn(push(Arc::clone(self), transfer));
        }
    }

    /// Delete `hash` from the store and from every builder holding it.
    pub async fn purge_environment(&self, hash: &str) -> ServerResult<Vec<BuilderId>> {
        let removed = self.store.remove(hash)?;
        let holders = self.scheduler().purge_environment(hash);
        tracing::info!(%hash, removed, builders = holders.len(), "purging environment");

        let message = SchedulerMessage::DropEnvironments {
            hashes: vec![hash.to_string()],
        };
        for &builder in &holders {
            let Some(link) = self.link(builder) else {
                continue;
            };
            let _order = link.order.lock().await;
            if let Err(e) = link.sender.send_json(&message).await {
                tracing::warn!(builder, error = %e, "cannot tell builder to drop environment");
            }
        }
        Ok(holders)
    }
}

/// Push one environment. Success is confirmed by the builder's next
/// `environments` message; a failed send frees the builder for another.
///
/// A push that dies after announcing its payload leaves the builder
/// waiting for bytes that never come, so that builder is disconnected
/// instead.
async fn push(shared: Arc<Shared>, transfer: Transfer) {
    let Some(link) = shared.link(transfer.builder) else {
        return;
    };
    let result = {
        let _order = link.order.lock().await;
        shared.store.send(&transfer.hash, &link.sender).await
    };
    match result {
        Ok(()) => {}
        Err(e @ StoreError::Interrupted { .. }) => {
            tracing::warn!(builder = transfer.builder, hash = %transfer.hash, error = %e, "environment push broke the builder link");
            shared.scheduler().transfer_failed(transfer.builder, &transfer.hash);
            link.broken.cancel();
        }
        Err(e) => {
            tracing::warn!(builder = transfer.builder, hash = %transfer.hash, error = %e, "environment push failed");
            shared.scheduler().transfer_failed(transfer.builder, &transfer.hash);
            shared.distribute();
        }
    }
}

/// Accept connections until `shutdown` fires.
pub async fn serve(shared: Arc<Shared>, listener: TcpListener, shutdown: CancellationToken) -> ServerResult<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "scheduler listening");
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            dispatch(shared, Connection::accept(stream), peer).await;
        });
    }
}

/// Bind the configured address and serve.
pub async fn run(shared: Arc<Shared>, shutdown: CancellationToken) -> ServerResult<()> {
    let listener = TcpListener::bind((shared.config.bind, shared.config.port)).await?;
    serve(shared, listener, shutdown).await
}

async fn dispatch(shared: Arc<Shared>, mut conn: Connection, peer: SocketAddr) {
    let handshake = match conn.accept_handshake().await {
        Ok(handshake) => handshake,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "handshake failed");
            return;
        }
    };
    match handshake.role {
        Role::Builder => builder_session(shared, conn, peer, handshake).await,
        Role::Client => client_session(shared, conn, peer, handshake).await,
        Role::Monitor => {
            let (snapshot, events) = {
                let scheduler = shared.scheduler();
                (scheduler.summaries(), shared.monitor.subscribe())
            };
            tracing::debug!(%peer, builders = snapshot.len(), "monitor attached");
            monitor::stream(conn, snapshot, events).await;
        }
        Role::Job => {
            conn.fail(&ProtocolError::invalid_request(
                "jobs go to builders, not the scheduler",
            ))
            .await;
        }
    }
}

// =============================================================================
// Builders
// =============================================================================

async fn builder_session(shared: Arc<Shared>, mut conn: Connection, peer: SocketAddr, handshake: Handshake) {
    let headers = match BuilderHeaders::parse(&handshake.headers) {
        Ok(headers) => headers,
        Err(error) => {
            tracing::info!(%peer, error = %error, "rejecting builder");
            conn.fail(&error).await;
            return;
        }
    };

    let id = {
        let mut scheduler = shared.scheduler();
        let id = scheduler.add_builder(peer.ip().to_string(), &headers);
        if let Some(record) = scheduler.builder(id) {
            shared.monitor.publish(MonitorEvent::BuilderAdded {
                builder: record.summary(),
            });
        }
        id
    };
    let broken = CancellationToken::new();
    shared.links().insert(
        id,
        BuilderLink {
            sender: conn.sender(),
            order: Arc::new(tokio::sync::Mutex::new(())),
            broken: broken.clone(),
        },
    );
    shared.distribute();

    let served = tokio::select! {
        served = serve_builder(&shared, &mut conn, id) => served,
        _ = broken.cancelled() => Err(ServerError::Protocol(ProtocolError::new(
            ErrorCode::EnvironmentTransferFailed,
            "environment transfer interrupted",
        ))),
    };
    if let Err(e) = served {
        tracing::warn!(builder = id, error = %e, "builder connection failed");
        conn.fail(&e.to_protocol()).await;
    }

    shared.links().remove(&id);
    {
        let mut scheduler = shared.scheduler();
        if scheduler.remove_builder(id).is_some() {
            shared.monitor.publish(MonitorEvent::BuilderRemoved { id });
        }
    }
    conn.close().await;
}

async fn serve_builder(shared: &Arc<Shared>, conn: &mut Connection, id: BuilderId) -> ServerResult<()> {
    loop {
        let value = match conn.recv().await {
            None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Inbound::Message(value))) => value,
            Some(Ok(_)) => {
                return Err(ProtocolError::violation("builders do not send payloads").into())
            }
        };

        match decode::<BuilderMessage>(value)? {
            BuilderMessage::Environments { hashes } => {
                tracing::debug!(builder = id, count = hashes.len(), "environments reported");
                if let Err(e) = shared.scheduler().environments_ack(id, hashes) {
                    tracing::error!(builder = id, error = %e, "environment report for missing builder");
                }
                shared.distribute();
            }
            BuilderMessage::JobStarted(report) => {
                let mut scheduler = shared.scheduler();
                match scheduler.job_started(id, &report) {
                    Ok(job) => shared.monitor.publish(MonitorEvent::JobStarted { job }),
                    Err(e) => tracing::warn!(builder = id, error = %e, "ignoring job start"),
                }
            }
            BuilderMessage::JobFinished(report) => {
                let mut scheduler = shared.scheduler();
                match scheduler.job_finished(id, &report) {
                    Ok(job) => shared.monitor.publish(MonitorEvent::JobFinished { job }),
                    Err(e) => tracing::warn!(builder = id, error = %e, "ignoring job finish"),
                }
            }
            BuilderMessage::JobAborted(report) => {
                let mut scheduler = shared.scheduler();
                match scheduler.job_aborted(id, &report) {
                    Ok(job) => shared.monitor.publish(MonitorEvent::JobAborted { job }),
                    Err(e) => tracing::warn!(builder = id, error = %e, "ignoring job abort"),
                }
            }
        }
    }
}

// =============================================================================
// Clients
// =============================================================================

async fn client_session(shared: Arc<Shared>, mut conn: Connection, peer: SocketAddr, handshake: Handshake) {
    let headers = match ClientHeaders::parse(&handshake.headers) {
        Ok(headers) => headers,
        Err(error) => {
            tracing::info!(%peer, error = %error, "rejecting client");
            conn.fail(&error).await;
            return;
        }
    };
    let client = ClientIdentity {
        ip: peer.ip().to_string(),
        hostname: headers.hostname.clone(),
        user: headers.user.clone(),
        name: headers.name.clone(),
    };

    let mut reservations = Vec::new();
    let result = serve_client(&shared, &mut conn, &client, &headers, &mut reservations).await;
    if let Err(e) = result {
        tracing::info!(%peer, error = %e, "client connection failed");
        conn.fail(&e.to_protocol()).await;
    }

    let released = shared.scheduler().client_closed(&reservations);
    if !released.is_empty() {
        tracing::debug!(%peer, released = released.len(), "unused reservations released");
    }
    conn.close().await;
}

async fn serve_client(
    shared: &Arc<Shared>,
    conn: &mut Connection,
    client: &ClientIdentity,
    headers: &ClientHeaders,
    reservations: &mut Vec<ReservationId>,
) -> ServerResult<()> {
    let sender = conn.sender();
    let reply = place(shared, client, headers.environments.clone(), headers.preferred_builder.clone(), reservations);
    sender.send_json(&reply).await?;

    loop {
        let value = match conn.recv().await {
            None => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Inbound::Message(value))) => value,
            Some(Ok(_)) => return Err(ProtocolError::violation("payload without upload").into()),
        };

        let reply = match decode::<ClientMessage>(value)? {
            ClientMessage::RequestBuilder {
                environments,
                preferred,
            } => {
                if environments.is_empty() {
                    return Err(ProtocolError::invalid_request("no environments requested").into());
                }
                place(shared, client, environments, preferred, reservations)
            }
            ClientMessage::UploadEnvironment { hash, host, bytes } => {
                receive_upload(shared, conn, &hash, &host, bytes).await?;
                shared.distribute();
                SchedulerReply::EnvironmentUploaded { hash }
            }
            ClientMessage::DropEnvironment { hash } => {
                let builders = shared.purge_environment(&hash).await?;
                SchedulerReply::EnvironmentDropped { hash, builders }
            }
        };
        sender.send_json(&reply).await?;
    }
}

fn place(
    shared: &Shared,
    client: &ClientIdentity,
    environments: Vec<String>,
    preferred: Option<String>,
    reservations: &mut Vec<ReservationId>,
) -> SchedulerReply {
    let request = PlacementRequest {
        environments,
        preferred,
        client: client.clone(),
    };
    match shared.scheduler().place(&request) {
        Some(placement) => {
            reservations.push(placement.reservation);
            SchedulerReply::Builder(placement)
        }
        None => {
            tracing::debug!(client = %client.ip, environments = ?request.environments, "no builder has the environment");
            SchedulerReply::NeedsEnvironment {
                environments: request.environments,
            }
        }
    }
}

/// Store an uploaded environment. A hash already stored is drained and
/// reported as uploaded.
async fn receive_upload(
    shared: &Shared,
    conn: &mut Connection,
    hash: &str,
    host: &str,
    bytes: u64,
) -> ServerResult<()> {
    let mut pending = match shared.store.prepare_blocking(hash, host, bytes).await? {
        Prepared::AlreadyHave(_) => {
            tracing::debug!(%hash, "upload of known environment skipped");
            if bytes > 0 {
                while !conn.recv_data().await?.1 {}
            }
            return Ok(());
        }
        Prepared::Write(pending) => pending,
    };

    let mut remaining = bytes;
    while remaining > 0 {
        let (data, last) = conn.recv_data().await?;
        remaining = remaining.saturating_sub(data.len() as u64);
        pending = pending.write_blocking(data).await?;
        if last {
            break;
        }
    }
    shared.store.complete_blocking(pending).await?;
    Ok(())
}
