//! Job connection handler.
//!
//! ```text
//! client                          builder
//!   handshake {role: job} ------>
//!   JobStart {wait: true} ------>
//!                                 (slot acquired)
//!                        <------ resume
//!   source bytes --------------->
//!                        <------ heartbeat ...
//!                        <------ response + output bytes
//! ```
//!
//! Without `wait` the source follows `JobStart` directly and admission
//! happens afterwards. The slot is held until the job is finished or
//! aborted and released exactly once.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use fisk_compiler::{ProcessError, ABNORMAL_EXIT_CODE};
use fisk_protocol::headers::HEADER_DIGEST;
use fisk_protocol::message::decode;
use fisk_protocol::{
    BuilderMessage, BuilderReply, Connection, ConnectionError, ErrorCode, Handshake, JobHeaders,
    JobResponse, JobStart, ProtocolError, PAYLOAD_CHUNK_SIZE,
};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{BuilderError, BuilderResult};
use crate::executor::Compiled;
use crate::job::{Job, JobState};
use crate::object_cache::{is_valid_digest, CacheHeader, CacheState, ObjectCache};
use crate::queue::Slot;
use crate::server::BuilderState;

/// Serve one job connection whose handshake has been accepted.
pub async fn handle(
    state: Arc<BuilderState>,
    mut conn: Connection,
    peer: SocketAddr,
    handshake: Handshake,
) {
    let headers = match JobHeaders::parse(&handshake.headers) {
        Ok(headers) => headers,
        Err(error) => {
            conn.fail(&error).await;
            return;
        }
    };
    if let Some(digest) = headers.digest.as_deref() {
        if !is_valid_digest(digest) {
            conn.fail(&ProtocolError::invalid_header(
                HEADER_DIGEST,
                digest,
                "must be alphanumeric",
            ))
            .await;
            return;
        }
    }

    let start: JobStart = match conn.recv_message().await {
        Ok(value) => match decode(value) {
            Ok(start) => start,
            Err(error) => {
                conn.fail(&error).await;
                return;
            }
        },
        Err(e) => {
            tracing::debug!(%peer, error = %e, "job connection ended before start");
            return;
        }
    };

    if !state.environments.is_ready(&headers.environment) {
        tracing::info!(%peer, environment = %headers.environment, "job for unknown environment");
        conn.fail(&ProtocolError::environment_missing(&headers.environment))
            .await;
        return;
    }

    let job = Job::new(state.next_job_id(), peer.ip().to_string(), &headers, &start);
    tracing::debug!(
        job = job.id,
        %peer,
        source = job.source_file.as_deref().unwrap_or(""),
        wait = start.wait,
        "job accepted"
    );

    let mut session = JobSession { state, conn, job };
    if let Err(e) = session.run(start.wait).await {
        session.abort(e).await;
    }
}

struct JobSession {
    state: Arc<BuilderState>,
    conn: Connection,
    job: Job,
}

impl JobSession {
    async fn run(&mut self, wait: bool) -> BuilderResult<()> {
        let (slot, source) = if wait {
            let slot = self.admit().await?;
            self.conn.sender().send_json(&BuilderReply::Resume).await?;
            let source = self.conn.recv_payload(self.job.source_len).await?;
            (slot, source)
        } else {
            let source = self.conn.recv_payload(self.job.source_len).await?;
            (self.admit().await?, source)
        };
        let digest = self.job.ensure_digest(&source).to_string();

        if let Some((header, contents)) = self.lookup_cache(&digest).await {
            self.job.transition(JobState::CacheHit)?;
            tracing::info!(job = self.job.id, %digest, "served from object cache");
            self.report_started().await;
            return self.finish(slot, header.response, contents.into()).await;
        }

        self.job.transition(JobState::Running)?;
        self.report_started().await;

        let compiled = match self.compile(&digest, source).await {
            Ok(compiled) => compiled,
            Err(BuilderError::Process(ProcessError::Spawn { compiler, source })) => Compiled {
                response: JobResponse::failure(
                    digest.clone(),
                    ABNORMAL_EXIT_CODE,
                    format!("cannot run {}: {}", compiler, source),
                ),
                contents: Vec::new(),
            },
            Err(e) => return Err(e),
        };

        let contents = Bytes::from(compiled.contents);
        if compiled.response.success {
            store_in_cache(
                Arc::clone(&self.state),
                CacheHeader::new(compiled.response.clone(), self.job.source_file.clone()),
                contents.clone(),
            );
        }
        self.finish(slot, compiled.response, contents).await
    }

    /// Wait for a slot, giving up if the client goes away.
    async fn admit(&mut self) -> BuilderResult<Slot> {
        let queue = self.state.queue.clone();
        tokio::select! {
            slot = queue.acquire(self.job.id) => Ok(slot?),
            error = watch_peer(&mut self.conn) => Err(error),
        }
    }

    /// Look `digest` up. An object that fails validation is evicted and
    /// treated as a miss.
    async fn lookup_cache(&self, digest: &str) -> Option<(CacheHeader, Vec<u8>)> {
        let path = {
            let mut cache = self.state.cache()?;
            cache.get(digest)?;
            cache.object_path(digest)
        };

        let owned = digest.to_string();
        let loaded =
            tokio::task::spawn_blocking(move || ObjectCache::load_object(&path, &owned)).await;
        match loaded {
            Ok(Ok(object)) => Some(object),
            Ok(Err(e)) => {
                tracing::warn!(%digest, error = %e, "evicting corrupt cached object");
                if let Some(mut cache) = self.state.cache() {
                    cache.remove(digest);
                }
                None
            }
            Err(e) => {
                tracing::error!(%digest, error = %e, "cache read task failed");
                None
            }
        }
    }

    /// Compile with heartbeats; a client disconnect kills the compiler.
    async fn compile(&mut self, digest: &str, source: Vec<u8>) -> BuilderResult<Compiled> {
        let root = self.state.environments.root_of(&self.job.environment);
        let cancel = CancellationToken::new();
        let sender = self.conn.sender();
        let period = self.state.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let compile = self
            .state
            .executor
            .compile(&self.job, digest, &root, source, cancel.clone());
        tokio::pin!(compile);

        loop {
            tokio::select! {
                result = &mut compile => return result,
                _ = heartbeat.tick() => {
                    let _ = sender.send_json(&BuilderReply::Heartbeat).await;
                }
                error = watch_peer(&mut self.conn) => {
                    tracing::info!(job = self.job.id, "client went away, cancelling compile");
                    cancel.cancel();
                    let _ = (&mut compile).await;
                    return Err(error);
                }
            }
        }
    }

    /// Send the response and its payload, then release the slot and report.
    ///
    /// `bytes` is recomputed from the index so a stored response can never
    /// announce a different payload than the one that follows.
    async fn finish(&mut self, slot: Slot, mut response: JobResponse, contents: Bytes) -> BuilderResult<()> {
        response.bytes = response.payload_len();
        if response.bytes != contents.len() as u64 {
            return Err(BuilderError::Protocol(ProtocolError::new(
                ErrorCode::Internal,
                format!(
                    "response for {} indexes {} bytes but has {}",
                    response.digest,
                    response.bytes,
                    contents.len()
                ),
            )));
        }
        let sender = self.conn.sender();
        sender.send_json(&BuilderReply::Response(response)).await?;
        let mut offset = 0;
        while offset < contents.len() {
            let end = (offset + PAYLOAD_CHUNK_SIZE).min(contents.len());
            sender.send_binary(contents.slice(offset..end)).await?;
            offset = end;
        }

        self.job.transition(JobState::Finished)?;
        slot.release();
        self.state
            .link
            .report(&BuilderMessage::JobFinished(self.job.report()))
            .await;
        self.conn.close().await;
        Ok(())
    }

    async fn report_started(&self) {
        self.state
            .link
            .report(&BuilderMessage::JobStarted(self.job.report()))
            .await;
    }

    async fn abort(&mut self, error: BuilderError) {
        match &error {
            BuilderError::Connection(ConnectionError::Closed) => {
                tracing::info!(job = self.job.id, "client disconnected")
            }
            other => tracing::warn!(job = self.job.id, error = %other, "job aborted"),
        }
        if self.job.abort() {
            self.state
                .link
                .report(&BuilderMessage::JobAborted(self.job.report()))
                .await;
        }
        self.conn.fail(&error.to_protocol()).await;
    }
}

/// Resolves when the client closes or sends something it should not.
async fn watch_peer(conn: &mut Connection) -> BuilderError {
    match conn.recv().await {
        None => ConnectionError::Closed.into(),
        Some(Err(e)) => e.into(),
        Some(Ok(_)) => BuilderError::Protocol(ProtocolError::violation(
            "unexpected message while the job is in progress",
        )),
    }
}

/// Store a successful result without delaying the client.
fn store_in_cache(state: Arc<BuilderState>, header: CacheHeader, contents: Bytes) {
    if state.cache.is_none() {
        return;
    }
    tokio::task::spawn_blocking(move || {
        let digest = header.digest().to_string();
        let mut pending = {
            let Some(mut cache) = state.cache() else {
                return;
            };
            if cache.state(&digest) != CacheState::None {
                return;
            }
            match cache.begin(&header) {
                Ok(pending) => pending,
                Err(e) if e.is_logic_error() => {
                    tracing::error!(%digest, error = %e, "cache store raced");
                    return;
                }
                Err(e) => {
                    tracing::warn!(%digest, error = %e, "cache store failed");
                    return;
                }
            }
        };

        if let Err(e) = pending.write(&contents) {
            tracing::warn!(%digest, error = %e, "cache write failed");
            if let Some(mut cache) = state.cache() {
                cache.abandon(pending);
            }
            return;
        }
        if let Some(mut cache) = state.cache() {
            if let Err(e) = cache.commit(pending) {
                tracing::warn!(%digest, error = %e, "cache commit failed");
            }
        }
    });
}
