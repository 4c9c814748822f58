//! Mock transport for testing
//!
//! Provides an in-memory [`Transport`] that can be scripted from a test:
//! the paired [`MockHandle`] observes every write and injects inbound
//! chunks, and write errors can be queued to simulate link failures at a
//! chosen point in a transfer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::Transport;

#[derive(Default)]
struct Shared {
    written: Vec<Vec<u8>>,
    write_errors: VecDeque<TransportError>,
}

/// Scriptable in-memory transport.
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    mtu: usize,
    closed: bool,
}

/// Test-side handle paired with a [`MockTransport`].
pub struct MockHandle {
    shared: Arc<Mutex<Shared>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockTransport {
    /// Creates a transport and its controlling handle.
    pub fn pair() -> (MockTransport, MockHandle) {
        Self::pair_with_mtu(244)
    }

    pub fn pair_with_mtu(mtu: usize) -> (MockTransport, MockHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            MockTransport {
                shared: shared.clone(),
                inbound: in_rx,
                outbound: out_tx,
                mtu,
                closed: false,
            },
            MockHandle {
                shared,
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        {
            let mut shared = self.shared.lock().unwrap();
            if let Some(err) = shared.write_errors.pop_front() {
                return Err(err);
            }
            shared.written.push(data.to_vec());
        }
        let _ = self.outbound.send(data.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.inbound.recv().await {
            Some(chunk) => Ok(Bytes::from(chunk)),
            None => Err(TransportError::LinkLost),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

impl MockHandle {
    /// Injects an inbound chunk, as if a notification arrived.
    pub fn inject(&self, chunk: &[u8]) {
        let _ = self.inbound.send(chunk.to_vec());
    }

    /// Simulates link loss: the transport's next `recv` fails.
    pub fn drop_link(&mut self) {
        // Replacing the sender closes the channel observed by the transport.
        let (tx, _) = mpsc::unbounded_channel();
        self.inbound = tx;
    }

    /// Queues an error for an upcoming write.
    pub fn fail_next_write(&self, err: TransportError) {
        self.shared.lock().unwrap().write_errors.push_back(err);
    }

    /// Everything the transport has written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared.lock().unwrap().written.clone()
    }

    /// Awaits the next write made by the transport.
    pub async fn next_write(&mut self) -> Option<Vec<u8>> {
        self.outbound.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_writes_and_injects_reads() {
        let (mut transport, handle) = MockTransport::pair();
        transport.write(&[0x01, 0x0C]).await.unwrap();
        assert_eq!(handle.written(), vec![vec![0x01, 0x0C]]);

        handle.inject(&[0x41, 0x0C]);
        let chunk = transport.recv().await.unwrap();
        assert_eq!(&chunk[..], &[0x41, 0x0C]);
    }

    #[tokio::test]
    async fn queued_error_fails_one_write() {
        let (mut transport, handle) = MockTransport::pair();
        handle.fail_next_write(TransportError::LinkLost);
        assert_eq!(
            transport.write(&[0x00]).await.unwrap_err(),
            TransportError::LinkLost
        );
        transport.write(&[0x01]).await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut transport, _handle) = MockTransport::pair();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(
            transport.recv().await.unwrap_err(),
            TransportError::Closed
        );
    }
}
