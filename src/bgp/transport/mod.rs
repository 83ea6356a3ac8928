//! Transport abstraction: how a session obtains its byte stream.
//!
//! Active peers dial, passive peers accept. The session only needs a stream it
//! can split into a read half (owned by the reader task) and a write half.

pub mod mock;
pub mod tcp;

use std::future::Future;
use std::io;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use mock::{MockConnector, MockTransport};
pub use tcp::TcpTransport;

/// Which side opens the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Dial the peer.
    Active,
    /// Wait for the peer to dial in.
    Passive,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("no remote address known for active peer")]
    NoRemoteAddress,

    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Supplies connected byte streams for one peer.
///
/// `establish` is called once per connection attempt; it may be called again
/// after a failure or when the session is restarted.
pub trait Transport: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn establish(&mut self) -> impl Future<Output = TransportResult<Self::Stream>> + Send;
}
