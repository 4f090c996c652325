//! Unix socket front end of the Conductor
//!
//! What the accept loop does:
//! - Accepts connections on a Unix socket (owner-only permissions)
//! - Spawns a handler task per connection
//! - Spawns a task per `Ask`, so one connection can run several requests
//! - Answers `Abort` with `Aborted` or `Rejected`
//! - Stops accepting on shutdown and removes the socket file
//!
//! # Connection Layout
//!
//! ```text
//!   client ──frames──► reader loop ──Ask──► tokio::spawn(conductor.handle)
//!                           │                          │
//!                           └─Abort─► conductor.abort  │
//!                                          │           │
//!   client ◄──frames── writer task ◄──mpsc─┴───────────┘
//! ```
//!
//! Messages of concurrent requests interleave on the connection; clients tell
//! them apart by message IDs.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

use conductor_core::transport::{read_frame, write_frame, TransportError};
use conductor_core::{
    ChatBackend, ClientEvent, Conductor, ConductorError, ConductorMessage, ConversationStore,
};

/// Conductor type hosted by the daemon
pub type SharedConductor = Arc<Conductor<dyn ChatBackend, dyn ConversationStore>>;

/// Connection identifier, unique within one daemon process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state tracking
struct ConnectionState {
    /// Accept time
    connected_at: std::time::Instant,
    /// Remote peer UID
    peer_uid: Option<u32>,
    /// Aborts the handler task on shutdown
    abort_handle: tokio::task::AbortHandle,
}

/// Connection limits
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Connections accepted at once
    pub max_connections: usize,
    /// Per-connection outbound channel capacity
    pub connection_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection_channel_capacity: 256,
        }
    }
}

/// Accepts clients and forwards their events to the Conductor
pub struct DaemonServer {
    /// Where the listener binds
    socket_path: PathBuf,
    /// Server configuration
    server_config: ServerConfig,
    /// The hosted Conductor
    conductor: SharedConductor,
    /// Live connections by ID
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Server with default limits
    pub fn new(socket_path: PathBuf, conductor: SharedConductor) -> Self {
        Self {
            socket_path,
            server_config: ServerConfig::default(),
            conductor,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Make sure the parent directory exists and no stale socket blocks the bind
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket: {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Bind the socket and serve until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be prepared or bound.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;

        // Owner-only
        let owner_uid = {
            use std::os::unix::fs::{MetadataExt, PermissionsExt};
            fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o600))?;
            fs::metadata(&self.socket_path)?.uid()
        };

        info!(path = ?self.socket_path, "Listening for connections");

        tokio::pin!(shutdown);
        loop {
            let stream = tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if self.connections.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                continue;
            }

            let peer_uid = stream.peer_cred().ok().map(|cred| cred.uid());
            if let Some(uid) = peer_uid {
                if uid != owner_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        owner_uid,
                        "Rejecting connection from different user"
                    );
                    continue;
                }
            }

            let conn_id = ConnectionId::next();
            info!(
                conn_id = %conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connections.len() + 1,
                "New connection accepted"
            );

            let task = tokio::spawn(
                handle_connection(
                    conn_id,
                    stream,
                    Arc::clone(&self.conductor),
                    self.server_config.connection_channel_capacity,
                    Arc::clone(&self.connections),
                )
                .instrument(tracing::info_span!("connection", %conn_id)),
            );

            self.connections.insert(
                conn_id,
                ConnectionState {
                    connected_at: std::time::Instant::now(),
                    peer_uid,
                    abort_handle: task.abort_handle(),
                },
            );
        }

        self.shutdown().await
    }

    /// Abort running requests and connection handlers, then remove the socket
    ///
    /// Each running request is aborted through the Conductor, which returns
    /// once its cancelled reply is persisted.
    async fn shutdown(&mut self) -> Result<()> {
        info!(
            active_requests = self.conductor.active_count(),
            "Initiating graceful shutdown"
        );

        for key in self.conductor.active_keys() {
            match self.conductor.abort(&key).await {
                Ok(response) => debug!(
                    abort_key = %key,
                    message_id = %response.response_message.message_id,
                    "Request aborted for shutdown"
                ),
                // Finished on its own in the meantime
                Err(ConductorError::NotFound { .. }) => {}
                Err(e) => warn!(abort_key = %key, error = %e, "Failed to abort request"),
            }
        }

        let conn_ids: Vec<ConnectionId> = self.connections.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connections.remove(&conn_id) {
                debug!(
                    conn_id = %conn_id,
                    peer_uid = ?state.peer_uid,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                state.abort_handle.abort();
            }
        }

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Serve one client connection
///
/// Reads `ClientEvent` frames until EOF or a framing error. Outbound
/// messages go through a channel drained by a dedicated writer task, so
/// concurrent requests never interleave partial frames.
async fn handle_connection(
    conn_id: ConnectionId,
    stream: UnixStream,
    conductor: SharedConductor,
    capacity: usize,
    connections: Arc<DashMap<ConnectionId, ConnectionState>>,
) {
    debug!("Connection handler started");

    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<ConductorMessage>(capacity);

    let writer = tokio::spawn(
        async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut write_half, &message).await {
                    warn!(error = %e, "Write error");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    loop {
        match read_frame::<_, ClientEvent>(&mut read_half).await {
            Ok(Some(event)) => dispatch(event, &conductor, &out_tx),
            Ok(None) => {
                info!("Client disconnected (EOF)");
                break;
            }
            Err(TransportError::Io(e)) => {
                warn!(error = %e, "Read error");
                break;
            }
            Err(e) => {
                // A bad frame leaves the stream unsynchronized
                warn!(error = %e, "Failed to decode event frame");
                let _ = out_tx
                    .send(ConductorMessage::Rejected {
                        abort_key: None,
                        reason: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }

    // The writer drains until every in-flight request dropped its sender
    drop(out_tx);
    if writer.await.is_err() {
        debug!("Writer task aborted");
    }

    connections.remove(&conn_id);
    info!(
        active_connections = connections.len(),
        "Connection handler finished"
    );
}

/// Start the work for one inbound event
fn dispatch(event: ClientEvent, conductor: &SharedConductor, out_tx: &mpsc::Sender<ConductorMessage>) {
    let conductor = Arc::clone(conductor);
    let out_tx = out_tx.clone();

    match event {
        ClientEvent::Ask(request) => {
            debug!(abort_key = ?request.abort_key, "Received ask");
            tokio::spawn(
                async move {
                    let abort_key = request.abort_key.clone();
                    if let Err(e) = conductor.handle(request, out_tx.clone()).await {
                        warn!(error = %e, "Request rejected");
                        let _ = out_tx
                            .send(ConductorMessage::Rejected {
                                abort_key,
                                reason: e.to_string(),
                            })
                            .await;
                    }
                }
                .in_current_span(),
            );
        }
        ClientEvent::Abort { abort_key } => {
            debug!(abort_key = %abort_key, "Received abort");
            tokio::spawn(
                async move {
                    let reply = match conductor.abort(&abort_key).await {
                        Ok(response) => ConductorMessage::Aborted(Box::new(response)),
                        Err(e) => ConductorMessage::Rejected {
                            abort_key: Some(abort_key),
                            reason: e.to_string(),
                        },
                    };
                    let _ = out_tx.send(reply).await;
                }
                .in_current_span(),
            );
        }
    }
}
