//! Per-handler receive queue for queued delivery.
//!
//! Single producer (the handler's background read task), serialized
//! consumers. Unbounded, so the producer never blocks; consumers block until
//! a message is available or the handler closes.

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::message::Message;

/// Create a connected producer/queue pair.
pub(crate) fn receive_queue() -> (QueueProducer, ReceiveQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueProducer { tx }, ReceiveQueue { rx: Mutex::new(rx) })
}

/// Producer half, owned by the background read task.
pub(crate) struct QueueProducer {
    tx: mpsc::UnboundedSender<Message>,
}

impl QueueProducer {
    /// Enqueue a completed message. Returns false once the queue is gone.
    pub(crate) fn push(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Ordered FIFO buffer of inbound messages feeding queued-delivery handlers.
pub struct ReceiveQueue {
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl ReceiveQueue {
    /// Dequeue the next message, waiting until one arrives.
    ///
    /// Returns `ConnectionClosed` once the handler is closing (`shutdown`
    /// cancelled, unread messages discarded) or the producer is gone and the
    /// queue has drained.
    pub(crate) async fn recv(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Message, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            () = shutdown.cancelled() => Err(TransportError::ConnectionClosed),
            msg = rx.recv() => msg.ok_or(TransportError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (tx, queue) = receive_queue();
        let shutdown = CancellationToken::new();
        let client = Uuid::new_v4();

        for i in 0..5u8 {
            assert!(tx.push(Message::new(client, vec![i])));
        }
        for i in 0..5u8 {
            let msg = queue.recv(&shutdown).await.unwrap();
            assert_eq!(msg.body(), &[i]);
        }
    }

    #[tokio::test]
    async fn cancelled_shutdown_reports_closed() {
        let (tx, queue) = receive_queue();
        let shutdown = CancellationToken::new();
        tx.push(Message::new(Uuid::new_v4(), b"pending".to_vec()));

        shutdown.cancel();
        let result = queue.recv(&shutdown).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn dropped_producer_drains_then_closes() {
        let (tx, queue) = receive_queue();
        let shutdown = CancellationToken::new();
        let client = Uuid::new_v4();

        tx.push(Message::new(client, b"last".to_vec()));
        drop(tx);

        let msg = queue.recv(&shutdown).await.unwrap();
        assert_eq!(msg.body(), b"last");
        let result = queue.recv(&shutdown).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    }
}
