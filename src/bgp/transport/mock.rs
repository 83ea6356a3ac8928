//! In-memory transport for tests.
//!
//! Each `MockConnector::connect` call hands the session one end of a duplex
//! pipe and returns the other end, which the test drives as the remote peer.

use std::io;

use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportResult};

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct MockTransport {
    pending: mpsc::UnboundedReceiver<TransportResult<DuplexStream>>,
    attempts: usize,
}

/// Test-side handle feeding connection outcomes to a `MockTransport`.
#[derive(Clone)]
pub struct MockConnector {
    tx: mpsc::UnboundedSender<TransportResult<DuplexStream>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: rx,
                attempts: 0,
            },
            MockConnector { tx },
        )
    }

    /// Number of completed `establish` calls.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl MockConnector {
    /// Queue a successful connection and return the remote peer's end.
    pub fn connect(&self) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let _ = self.tx.send(Ok(local));
        remote
    }

    /// Queue a failed connection attempt.
    pub fn fail(&self) {
        let _ = self.tx.send(Err(TransportError::ConnectionFailed(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "mock connection refused",
        ))));
    }
}

impl Transport for MockTransport {
    type Stream = DuplexStream;

    async fn establish(&mut self) -> TransportResult<DuplexStream> {
        let outcome = self.pending.recv().await.unwrap_or(Err(TransportError::Closed));
        self.attempts += 1;
        outcome
    }
}
