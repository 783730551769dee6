//! # Socket Server
//!
//! Listens for connections, optionally negotiates TLS per accepted socket,
//! assigns each connection a fresh [`ClientUid`], and produces a
//! [`ClientHandler`] from the same [`HandlerOptions`] strategy the client
//! side uses.
//!
//! The server keeps a `ClientUid -> handler` registry for its lifetime:
//! accept inserts, handler closure removes, `send_to` looks up. Collaborators
//! take ownership of per-client handlers through [`SocketServer::accept`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TransportError;
use crate::handler::{ClientHandler, HandlerOptions};
use crate::message::{ClientUid, Message};
use crate::stream::TransportStream;
use crate::tls::{TlsServerConfig, TLS_HANDSHAKE_TIMEOUT};

type Registry = Arc<RwLock<HashMap<ClientUid, Arc<ClientHandler>>>>;

/// A listening socket server and its registry of connected clients.
pub struct SocketServer {
    local_addr: SocketAddr,
    registry: Registry,
    incoming: Mutex<mpsc::UnboundedReceiver<(ClientUid, Arc<ClientHandler>)>>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketServer {
    /// Bind `port` (0 picks a free one) and start accepting connections in a
    /// background task. Every accepted client is framed with `options`;
    /// when `tls` is given, a server-side handshake precedes handler
    /// creation and a failed handshake drops the connection without ever
    /// producing a handler.
    pub async fn listen(
        port: u16,
        tls: Option<TlsServerConfig>,
        options: HandlerOptions,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("🔌 server listening on {}", local_addr);

        let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            tls,
            options,
            registry.clone(),
            incoming_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            registry,
            incoming: Mutex::new(incoming_rx),
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next client to finish connecting (including its TLS
    /// handshake) and take its identifier and handler.
    pub async fn accept(&self) -> Result<(ClientUid, Arc<ClientHandler>), TransportError> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => Err(TransportError::ServerClosed),
            next = incoming.recv() => next.ok_or(TransportError::ServerClosed),
        }
    }

    /// Send one message to a connected client.
    ///
    /// # Returns
    /// - `Err(UnknownClient)`: no handler is registered for `client_uid`
    /// - otherwise, the handler's own send outcome
    pub async fn send_to(
        &self,
        client_uid: ClientUid,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let handler = {
            let registry = self.registry.read().await;
            registry
                .get(&client_uid)
                .cloned()
                .ok_or(TransportError::UnknownClient(client_uid))?
        };
        handler.send(message, timeout).await
    }

    /// Handler for one connected client, if still registered.
    pub async fn handler(&self, client_uid: ClientUid) -> Option<Arc<ClientHandler>> {
        self.registry.read().await.get(&client_uid).cloned()
    }

    /// Snapshot of the currently connected client identifiers.
    pub async fn clients(&self) -> Vec<ClientUid> {
        self.registry.read().await.keys().copied().collect()
    }

    /// Stop accepting and close every registered handler. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("🛑 shutting down server on {}", self.local_addr);
        self.shutdown.cancel();

        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let handlers: Vec<Arc<ClientHandler>> =
            self.registry.write().await.drain().map(|(_, h)| h).collect();
        for handler in handlers {
            handler.close().await;
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(mut task) = self.accept_task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Accept connections until shutdown, spawning per-connection setup so a
/// slow TLS handshake never stalls the listener.
async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsServerConfig>,
    options: HandlerOptions,
    registry: Registry,
    incoming_tx: mpsc::UnboundedSender<(ClientUid, Arc<ClientHandler>)>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((tcp, peer_addr)) => {
                tokio::spawn(setup_connection(
                    tcp,
                    peer_addr,
                    tls.clone(),
                    options.clone(),
                    registry.clone(),
                    incoming_tx.clone(),
                ));
            }
            Err(e) => {
                // Transient accept failures (e.g. fd exhaustion) should not
                // kill the listener.
                warn!("failed to accept incoming connection: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Per-connection setup: optional TLS handshake, fresh client UID, handler
/// creation, registry insert, and a watcher that removes the entry once the
/// handler reports closure.
async fn setup_connection(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsServerConfig>,
    options: HandlerOptions,
    registry: Registry,
    incoming_tx: mpsc::UnboundedSender<(ClientUid, Arc<ClientHandler>)>,
) {
    let stream = match tls {
        Some(config) => {
            let acceptor = config.acceptor();
            match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(tls_stream)) => TransportStream::Tls(Box::new(tls_stream.into())),
                Ok(Err(e)) => {
                    error!("❌ TLS handshake with {} failed: {}", peer_addr, e);
                    return;
                }
                Err(_) => {
                    error!("❌ TLS handshake with {} timed out", peer_addr);
                    return;
                }
            }
        }
        None => TransportStream::Plain(tcp),
    };

    let client_uid = Uuid::new_v4();
    let handler = Arc::new(ClientHandler::new(client_uid, stream, options));
    info!("✅ accepted client {} from {}", client_uid, peer_addr);

    registry.write().await.insert(client_uid, handler.clone());

    // Remove the registry entry as soon as the handler closes, whichever
    // side initiates it.
    let watcher_registry = registry.clone();
    let watcher_handler = handler.clone();
    tokio::spawn(async move {
        watcher_handler.closed().await;
        if watcher_registry.write().await.remove(&client_uid).is_some() {
            info!("client {} removed from registry", client_uid);
        }
    });

    if incoming_tx.send((client_uid, handler)).is_err() {
        // Server already shut down; the watcher will clean the entry up.
        warn!("server stopped before client {} was delivered", client_uid);
    }
}
