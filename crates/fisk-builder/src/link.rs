//! Connection to the scheduler.
//!
//! The builder registers with its headers, installs pushed environments,
//! answers every push or drop with its full environment list and reports
//! job lifecycle events. A lost connection is retried after
//! `reconnect_delay`.

use std::sync::{Arc, Mutex};

use fisk_protocol::message::decode;
use fisk_protocol::{BuilderMessage, Connection, ConnectionError, FrameSender, SchedulerMessage};
use tokio_util::sync::CancellationToken;

use crate::error::{BuilderError, BuilderResult};
use crate::server::BuilderState;

/// Outbound handle to the current scheduler session, if any.
#[derive(Debug, Default)]
pub struct SchedulerLink {
    sender: Mutex<Option<FrameSender>>,
}

impl SchedulerLink {
    fn attach(&self, sender: FrameSender) {
        *self.sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
    }

    fn detach(&self) {
        *self.sender.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_connected(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    /// Send `message` if a session is up. Reports made while disconnected
    /// are dropped; the scheduler forgets this builder's jobs on
    /// disconnect anyway.
    pub async fn report(&self, message: &BuilderMessage) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match sender {
            Some(sender) => {
                if let Err(e) = sender.send_json(message).await {
                    tracing::debug!(error = %e, "scheduler report lost");
                }
            }
            None => tracing::debug!("not connected to scheduler, report dropped"),
        }
    }
}

struct Attached<'a>(&'a SchedulerLink);

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.0.detach();
    }
}

/// Keep a scheduler session up until `shutdown` fires.
pub async fn run(state: Arc<BuilderState>, shutdown: CancellationToken) {
    loop {
        let result = tokio::select! {
            result = session(&state) => result,
            _ = shutdown.cancelled() => return,
        };
        match result {
            Ok(()) => tracing::warn!(scheduler = %state.config.scheduler, "scheduler closed the connection"),
            Err(e) => tracing::warn!(scheduler = %state.config.scheduler, error = %e, "scheduler connection lost"),
        }
        tokio::select! {
            _ = tokio::time::sleep(state.config.reconnect_delay()) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn session(state: &BuilderState) -> BuilderResult<()> {
    let headers = state.config.headers(state.environments.hashes());
    let mut conn = Connection::connect(state.config.scheduler.as_str(), headers.to_handshake()).await?;
    tracing::info!(
        scheduler = %state.config.scheduler,
        environments = headers.environments.len(),
        "registered with scheduler"
    );
    state.link.attach(conn.sender());
    let _attached = Attached(&state.link);

    loop {
        let value = match conn.recv_message().await {
            Ok(value) => value,
            Err(ConnectionError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match decode::<SchedulerMessage>(value) {
            Ok(SchedulerMessage::Environment { hash, host, bytes }) => {
                tracing::info!(%hash, %host, bytes, "receiving environment");
                match state.environments.receive(&mut conn, &hash, &host, bytes).await {
                    Ok(_) => {}
                    Err(BuilderError::Connection(e)) => return Err(e.into()),
                    Err(e) => tracing::warn!(%hash, error = %e, "environment push failed"),
                }
            }
            Ok(SchedulerMessage::DropEnvironments { hashes }) => {
                for hash in &hashes {
                    match state.environments.remove(hash).await {
                        Ok(true) => tracing::info!(%hash, "environment dropped"),
                        Ok(false) => {}
                        Err(e) => tracing::warn!(%hash, error = %e, "failed to drop environment"),
                    }
                }
            }
            Err(error) => {
                conn.fail(&error).await;
                return Err(BuilderError::Protocol(error));
            }
        }

        conn.sender()
            .send_json(&BuilderMessage::Environments {
                hashes: state.environments.hashes(),
            })
            .await?;
    }
}
