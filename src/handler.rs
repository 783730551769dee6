//! # Client Handler
//!
//! A [`ClientHandler`] owns exactly one connection's stream and turns its
//! bytes into framed [`Message`]s. The same type serves both delivery
//! disciplines:
//!
//! - **Direct**: `receive()` blocks the caller until one full frame is read
//!   off the stream or the connection closes. One caller execution context
//!   per connection is the natural model.
//! - **Queued**: construction spawns a background read task that frames
//!   inbound bytes continuously and enqueues them; `receive()` dequeues
//!   instead of touching the stream, decoupling arrival from consumption.
//!
//! `send()` is shared across modes. `close()` is idempotent and unblocks any
//! pending receive, whether it is parked on the socket or on the queue.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{is_disconnect, TransportError};
use crate::message::{
    BasicHeaderCodec, ClientUid, HeaderCodec, Message, DEFAULT_MAX_BODY_LEN,
};
use crate::queue::{receive_queue, QueueProducer, ReceiveQueue};
use crate::stream::TransportStream;

/// How inbound messages reach the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The caller of `receive()` reads the stream synchronously.
    Direct,
    /// A background task reads the stream and feeds a receive queue.
    Queued,
}

/// Lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// The connection is up.
    Connected,
    /// `close()` has started tearing the handler down.
    Closing,
    /// The connection is gone; sends and receives report `ConnectionClosed`.
    Closed,
}

const STATE_CONNECTED: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Strategy values fixed at client/server setup and shared by every handler
/// either side produces. Replaces subclass-based factory hooks: a deployment
/// picks its wire schema and delivery discipline here.
#[derive(Clone)]
pub struct HandlerOptions {
    /// Direct or queued delivery.
    pub delivery: DeliveryMode,
    /// Wire layout for message headers. Client and server must agree.
    pub codec: Arc<dyn HeaderCodec>,
    /// Upper bound on accepted body sizes.
    pub max_body_len: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Direct,
            codec: Arc::new(BasicHeaderCodec),
            max_body_len: DEFAULT_MAX_BODY_LEN,
        }
    }
}

impl HandlerOptions {
    /// Direct delivery with the reference codec.
    pub fn direct() -> Self {
        Self::default()
    }

    /// Queued delivery with the reference codec.
    pub fn queued() -> Self {
        Self {
            delivery: DeliveryMode::Queued,
            ..Self::default()
        }
    }
}

/// State shared with the background read task.
struct Shared {
    client_uid: ClientUid,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl Shared {
    /// Record that the connection is gone and wake anything blocked on it.
    fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

/// Owns one connection's read/write lifecycle and framing.
pub struct ClientHandler {
    shared: Arc<Shared>,
    peer_addr: Option<SocketAddr>,
    codec: Arc<dyn HeaderCodec>,
    max_body_len: usize,
    delivery: DeliveryMode,
    /// Present in direct mode; the queued read task owns the half otherwise.
    reader: Mutex<Option<ReadHalf<TransportStream>>>,
    writer: Mutex<WriteHalf<TransportStream>>,
    queue: Option<ReceiveQueue>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientHandler {
    /// Wrap an established stream. In queued mode this spawns the background
    /// read task, so it must run inside a tokio runtime.
    pub fn new(client_uid: ClientUid, stream: TransportStream, options: HandlerOptions) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            client_uid,
            state: AtomicU8::new(STATE_CONNECTED),
            shutdown: CancellationToken::new(),
        });

        let (reader, queue, read_task) = match options.delivery {
            DeliveryMode::Direct => (Some(read_half), None, None),
            DeliveryMode::Queued => {
                let (producer, queue) = receive_queue();
                let task = tokio::spawn(read_loop(
                    read_half,
                    options.codec.clone(),
                    options.max_body_len,
                    producer,
                    shared.clone(),
                ));
                (None, Some(queue), Some(task))
            }
        };

        Self {
            shared,
            peer_addr,
            codec: options.codec,
            max_body_len: options.max_body_len,
            delivery: options.delivery,
            reader: Mutex::new(reader),
            writer: Mutex::new(write_half),
            queue,
            read_task: Mutex::new(read_task),
        }
    }

    /// Connection identifier, stable for the handler's lifetime.
    pub fn client_uid(&self) -> ClientUid {
        self.shared.client_uid
    }

    /// Remote endpoint, if it could be resolved at construction.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The handler's delivery discipline.
    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandlerState {
        match self.shared.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => HandlerState::Connected,
            STATE_CLOSING => HandlerState::Closing,
            _ => HandlerState::Closed,
        }
    }

    /// Wait until the handler has closed, for any reason.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }

    /// Serialize one message and write the frame to the stream, completing
    /// within `timeout`.
    ///
    /// # Returns
    /// - `Ok(())`: the full frame was written and flushed
    /// - `Err(SendTimeout)`: the write did not finish in time; the handler
    ///   is unchanged and the caller decides whether to retry or close
    /// - `Err(ConnectionClosed)`: the peer is gone; the handler is Closed
    pub async fn send(&self, message: &Message, timeout: Duration) -> Result<(), TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = encode_frame(self.codec.as_ref(), message, self.max_body_len)?;
        debug!(
            "sending message {} ({} body bytes) to client {}",
            message.message_uid(),
            message.body_len(),
            self.shared.client_uid
        );

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok::<(), io::Error>(())
        };
        match tokio::time::timeout(timeout, write).await {
            Err(_) => {
                warn!(
                    "send of message {} timed out after {:?}",
                    message.message_uid(),
                    timeout
                );
                Err(TransportError::SendTimeout(timeout))
            }
            Ok(Err(e)) if is_disconnect(&e) => {
                self.shared.mark_closed();
                Err(TransportError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Receive the next message, blocking until one full frame is available
    /// (direct mode) or one has been queued (queued mode).
    ///
    /// Reports `ConnectionClosed` exactly once per pending call when the
    /// peer disconnects or the handler is closed locally.
    pub async fn receive(&self) -> Result<Message, TransportError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        match &self.queue {
            Some(queue) => queue.recv(&self.shared.shutdown).await,
            None => self.receive_direct().await,
        }
    }

    async fn receive_direct(&self) -> Result<Message, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        tokio::select! {
            biased;
            () = self.shared.shutdown.cancelled() => Err(TransportError::ConnectionClosed),
            res = read_frame(reader, self.codec.as_ref(), self.max_body_len) => match res {
                Ok(message) => {
                    debug!(
                        "received message {} ({} body bytes)",
                        message.message_uid(),
                        message.body_len()
                    );
                    Ok(message)
                }
                Err(e) => {
                    // A partial frame at closure is fatal only to that one
                    // undelivered message; the stream position is untrusted
                    // either way, so the handler goes down with it.
                    self.shared.mark_closed();
                    Err(e)
                }
            },
        }
    }

    /// Release the connection. Stops the background read task, discards any
    /// unread queued messages, unblocks pending receives, and shuts the
    /// stream down. Repeated calls are no-ops.
    pub async fn close(&self) {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_CONNECTED,
                STATE_CLOSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        info!("closing handler for client {}", self.shared.client_uid);
        self.shared.shutdown.cancel();

        let task = self.read_task.lock().await.take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        // Best effort: a send stuck mid-write keeps the lock, in which case
        // the stream is released when the handler is dropped.
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
        self.shared.state.store(STATE_CLOSED, Ordering::SeqCst);
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        if let Ok(mut task) = self.read_task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl fmt::Display for ClientHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "ClientHandler({}, peer = {})", self.shared.client_uid, addr),
            None => write!(f, "ClientHandler({}, peer = none)", self.shared.client_uid),
        }
    }
}

/// Background read path for queued delivery: frame inbound bytes until the
/// stream ends, enqueuing each completed message.
async fn read_loop(
    mut reader: ReadHalf<TransportStream>,
    codec: Arc<dyn HeaderCodec>,
    max_body_len: usize,
    producer: QueueProducer,
    shared: Arc<Shared>,
) {
    loop {
        match read_frame(&mut reader, codec.as_ref(), max_body_len).await {
            Ok(message) => {
                debug!(
                    "queued message {} from client {}",
                    message.message_uid(),
                    message.client_uid()
                );
                if !producer.push(message) {
                    break;
                }
            }
            Err(TransportError::ConnectionClosed) => {
                info!("client {} disconnected", shared.client_uid);
                break;
            }
            Err(e) => {
                warn!(
                    "closing connection to client {} after read error: {}",
                    shared.client_uid, e
                );
                break;
            }
        }
    }
    shared.mark_closed();
}

/// Serialize one message into a single wire frame.
pub(crate) fn encode_frame(
    codec: &dyn HeaderCodec,
    message: &Message,
    max_body_len: usize,
) -> Result<Vec<u8>, TransportError> {
    if message.body_len() > max_body_len {
        return Err(TransportError::BodyTooLarge {
            size: message.body_len(),
            max: max_body_len,
        });
    }
    let mut frame = Vec::with_capacity(codec.header_len() + message.body_len());
    codec.encode(message.header(), &mut frame);
    frame.extend_from_slice(message.body());
    Ok(frame)
}

/// Blocking-read one full frame: the fixed-size header region first, then
/// exactly `body_len` body bytes.
///
/// End-of-stream on a frame boundary is a clean `ConnectionClosed`;
/// end-of-stream mid-frame is a framing error, since the partial frame can
/// never be delivered.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    codec: &dyn HeaderCodec,
    max_body_len: usize,
) -> Result<Message, TransportError> {
    let mut header_buf = vec![0u8; codec.header_len()];
    let mut filled = 0;
    while filled < header_buf.len() {
        let n = reader
            .read(&mut header_buf[filled..])
            .await
            .map_err(map_read_err)?;
        if n == 0 {
            if filled == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            return Err(TransportError::Framing("stream ended mid-header".into()));
        }
        filled += n;
    }

    let header = codec.decode(&header_buf)?;
    if header.body_len > max_body_len {
        return Err(TransportError::BodyTooLarge {
            size: header.body_len,
            max: max_body_len,
        });
    }

    let mut body = vec![0u8; header.body_len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::Framing("stream ended mid-body".into())
        } else {
            map_read_err(e)
        }
    })?;
    Ok(Message::from_parts(header, body))
}

fn map_read_err(e: io::Error) -> TransportError {
    if is_disconnect(&e) {
        TransportError::ConnectionClosed
    } else {
        TransportError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BasicHeaderCodec;
    use uuid::Uuid;

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let codec = BasicHeaderCodec;
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let msg = Message::new(Uuid::new_v4(), b"payload".to_vec());

        let frame = encode_frame(&codec, &msg, DEFAULT_MAX_BODY_LEN).unwrap();
        tx.write_all(&frame).await.unwrap();

        let read = read_frame(&mut rx, &codec, DEFAULT_MAX_BODY_LEN)
            .await
            .unwrap();
        assert_eq!(read.body(), b"payload");
        assert_eq!(read.message_uid(), msg.message_uid());
        assert_eq!(read.client_uid(), msg.client_uid());
    }

    #[tokio::test]
    async fn two_frames_back_to_back_stay_ordered() {
        let codec = BasicHeaderCodec;
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let client = Uuid::new_v4();

        let mut bytes = Vec::new();
        bytes.extend(encode_frame(&codec, &Message::new(client, b"one".to_vec()), 1024).unwrap());
        bytes.extend(encode_frame(&codec, &Message::new(client, b"two".to_vec()), 1024).unwrap());
        tx.write_all(&bytes).await.unwrap();

        let first = read_frame(&mut rx, &codec, 1024).await.unwrap();
        let second = read_frame(&mut rx, &codec, 1024).await.unwrap();
        assert_eq!(first.body(), b"one");
        assert_eq!(second.body(), b"two");
    }

    #[tokio::test]
    async fn eof_on_frame_boundary_is_connection_closed() {
        let codec = BasicHeaderCodec;
        let (tx, mut rx) = tokio::io::duplex(1024);
        drop(tx);

        let result = read_frame(&mut rx, &codec, 1024).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn eof_mid_header_is_framing_error() {
        let codec = BasicHeaderCodec;
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        tx.write_all(&[0x01, 0xFF, 0x00]).await.unwrap();
        drop(tx);

        let result = read_frame(&mut rx, &codec, 1024).await;
        assert!(matches!(result, Err(TransportError::Framing(_))));
    }

    #[tokio::test]
    async fn eof_mid_body_is_framing_error() {
        let codec = BasicHeaderCodec;
        let (mut tx, mut rx) = tokio::io::duplex(1024);
        let msg = Message::new(Uuid::new_v4(), vec![0u8; 64]);
        let frame = encode_frame(&codec, &msg, 1024).unwrap();
        tx.write_all(&frame[..frame.len() - 10]).await.unwrap();
        drop(tx);

        let result = read_frame(&mut rx, &codec, 1024).await;
        assert!(matches!(result, Err(TransportError::Framing(_))));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_on_read() {
        let codec = BasicHeaderCodec;
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let msg = Message::new(Uuid::new_v4(), vec![0u8; 512]);
        let frame = encode_frame(&codec, &msg, 1024).unwrap();
        tx.write_all(&frame).await.unwrap();

        let result = read_frame(&mut rx, &codec, 256).await;
        assert!(matches!(
            result,
            Err(TransportError::BodyTooLarge { size: 512, max: 256 })
        ));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_on_send() {
        let codec = BasicHeaderCodec;
        let msg = Message::new(Uuid::new_v4(), vec![0u8; 64]);
        let result = encode_frame(&codec, &msg, 32);
        assert!(matches!(result, Err(TransportError::BodyTooLarge { .. })));
    }
}
