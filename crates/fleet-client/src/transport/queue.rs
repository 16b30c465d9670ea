//! Inbound message queue shared by a channel and its readers

use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use super::TransportError;

/// Unbounded queue of inbound payloads
///
/// A `None` entry is the stop sentinel: it wakes a parked receiver and makes
/// it return without a payload.
pub struct InboundQueue {
    tx: mpsc::UnboundedSender<Option<Vec<u8>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Option<Vec<u8>>>>,
}

impl InboundQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, payload: Vec<u8>) {
        // The receiver lives as long as the queue, so sending cannot fail
        let _ = self.tx.send(Some(payload));
    }

    pub fn push_sentinel(&self) {
        let _ = self.tx.send(None);
    }

    /// Wait for the next entry, forever when `timeout` is `None`
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError> {
        let mut rx = self.rx.lock().await;
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
                Ok(entry) => Ok(entry.flatten()),
                Err(_) => Err(TransportError::ChannelTimeout(limit)),
            },
            None => Ok(rx.recv().await.flatten()),
        }
    }

    /// Discard everything queued so far, sentinels included
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recv_returns_payload_then_sentinel() {
        let queue = InboundQueue::new();
        queue.push(b"one".to_vec());
        queue.push_sentinel();

        let first = queue.recv(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(first, Some(b"one".to_vec()));
        let second = queue.recv(None).await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let queue = InboundQueue::new();
        let result = queue.recv(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(TransportError::ChannelTimeout(_))));
    }

    #[tokio::test]
    async fn test_drain_discards_stale_entries() {
        let queue = InboundQueue::new();
        queue.push(b"stale".to_vec());
        queue.push_sentinel();
        assert_eq!(queue.drain().await, 2);

        queue.push(b"fresh".to_vec());
        let entry = queue.recv(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(entry, Some(b"fresh".to_vec()));
    }
}
