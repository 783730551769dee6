//! # Socket Client
//!
//! Initiates outbound connections, optionally negotiates TLS, and wraps the
//! resulting stream in a [`ClientHandler`] built from the same
//! [`HandlerOptions`] strategy the server uses - both sides frame
//! identically by construction.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::net::TcpStream;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::TransportError;
use crate::handler::{ClientHandler, HandlerOptions};
use crate::message::{ClientUid, Message};
use crate::stream::TransportStream;
use crate::tls::{TlsClientConfig, TLS_HANDSHAKE_TIMEOUT};

/// Deadline for establishing the TCP connection.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An outbound connection to a socket server.
pub struct SocketClient {
    handler: Arc<ClientHandler>,
}

impl SocketClient {
    /// Connect to `host:port`, performing a client-side TLS handshake first
    /// when `tls` is given. Handshake failure aborts the whole attempt - no
    /// handler is produced.
    ///
    /// # Example
    /// ```ignore
    /// let client = SocketClient::connect("127.0.0.1", 9000, None, HandlerOptions::direct()).await?;
    /// client.send(&Message::new(client.client_uid(), b"ping".to_vec()), Duration::from_secs(1)).await?;
    /// ```
    pub async fn connect(
        host: &str,
        port: u16,
        tls: Option<TlsClientConfig>,
        options: HandlerOptions,
    ) -> Result<Self, TransportError> {
        let addr = format!("{}:{}", host, port);
        let tcp = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "TCP connect",
            })??;

        let stream = match tls {
            Some(config) => {
                let connector = config.connector();
                let tls_stream = timeout(
                    TLS_HANDSHAKE_TIMEOUT,
                    connector.connect(config.server_name(), tcp),
                )
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "TLS handshake",
                })?
                .map_err(|e| {
                    error!("❌ TLS handshake with {} failed: {}", addr, e);
                    TransportError::Handshake(format!("TLS handshake failed: {}", e))
                })?;
                TransportStream::Tls(Box::new(tls_stream.into()))
            }
            None => TransportStream::Plain(tcp),
        };

        let client_uid = Uuid::new_v4();
        info!("🔌 connected to {} as client {}", addr, client_uid);
        Ok(Self {
            handler: Arc::new(ClientHandler::new(client_uid, stream, options)),
        })
    }

    /// Identifier assigned to this connection at connect time.
    pub fn client_uid(&self) -> ClientUid {
        self.handler.client_uid()
    }

    /// The handler owning this connection, for collaborators that want to
    /// hold it directly.
    pub fn handler(&self) -> Arc<ClientHandler> {
        self.handler.clone()
    }

    /// Send one message, completing within `timeout`.
    pub async fn send(&self, message: &Message, timeout: Duration) -> Result<(), TransportError> {
        self.handler.send(message, timeout).await
    }

    /// Receive the next message per the handler's delivery mode.
    pub async fn receive(&self) -> Result<Message, TransportError> {
        self.handler.receive().await
    }

    /// Close the connection. Idempotent.
    pub async fn disconnect(&self) {
        self.handler.close().await;
    }
}
