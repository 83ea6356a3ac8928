use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

use super::{SessionMode, Transport, TransportError, TransportResult};

/// Default BGP port.
pub const BGP_PORT: u16 = 179;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP transport for one directly attached peer.
///
/// Active mode binds the local interface address and dials the peer. Passive
/// mode listens on the local interface address and accepts only the peer.
pub struct TcpTransport {
    mode: SessionMode,
    local_addr: Ipv4Addr,
    peer_addr: Option<Ipv4Addr>,
    port: u16,
    connect_timeout: Duration,
    listener: Option<TcpListener>,
}

impl TcpTransport {
    pub fn new(mode: SessionMode, local_addr: Ipv4Addr, peer_addr: Option<Ipv4Addr>) -> Self {
        Self {
            mode,
            local_addr,
            peer_addr,
            port: BGP_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            listener: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn dial(&self) -> TransportResult<TcpStream> {
        let peer_addr = self.peer_addr.ok_or(TransportError::NoRemoteAddress)?;
        let remote = SocketAddr::new(peer_addr.into(), self.port);

        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::new(self.local_addr.into(), 0))?;

        debug!(peer = %remote, local = %self.local_addr, "Connecting to {}", remote);
        match tokio::time::timeout(self.connect_timeout, socket.connect(remote)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(e)),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn accept(&mut self) -> TransportResult<TcpStream> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                let local = SocketAddr::new(self.local_addr.into(), self.port);
                debug!(local = %local, "Listening on {}", local);
                TcpListener::bind(local).await?
            }
        };

        let result = loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(TransportError::Io(e)),
            };
            match self.peer_addr {
                Some(expected) if remote.ip() != expected => {
                    warn!(remote = %remote, expected = %expected, "Rejecting connection from unexpected address");
                }
                _ => {
                    debug!(peer = %remote, "Accepted connection from {}", remote);
                    break Ok(stream);
                }
            }
        };

        self.listener = Some(listener);
        result
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    async fn establish(&mut self) -> TransportResult<TcpStream> {
        let stream = match self.mode {
            SessionMode::Active => self.dial().await?,
            SessionMode::Passive => self.accept().await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_tcp_transport_new() {
        let transport = TcpTransport::new(
            SessionMode::Active,
            Ipv4Addr::new(10, 0, 0, 1),
            Some(Ipv4Addr::new(10, 0, 0, 2)),
        );
        assert_eq!(transport.port, BGP_PORT);
        assert_eq!(transport.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(transport.listener.is_none());
    }

    #[tokio::test]
    async fn test_active_without_remote_address() {
        let mut transport = TcpTransport::new(SessionMode::Active, Ipv4Addr::LOCALHOST, None);
        assert!(matches!(
            transport.establish().await,
            Err(TransportError::NoRemoteAddress)
        ));
    }

    #[tokio::test]
    async fn test_active_dials_passive() {
        // Reserve a free port, then hand it to the passive side.
        let port = {
            let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut passive =
            TcpTransport::new(SessionMode::Passive, Ipv4Addr::LOCALHOST, Some(Ipv4Addr::LOCALHOST))
                .with_port(port);
        let accept = tokio::spawn(async move { passive.establish().await });

        let mut active =
            TcpTransport::new(SessionMode::Active, Ipv4Addr::LOCALHOST, Some(Ipv4Addr::LOCALHOST))
                .with_port(port)
                .with_connect_timeout(Duration::from_secs(5));

        // The listener may not be bound yet on the first attempt.
        let mut client = None;
        for _ in 0..50 {
            match active.establish().await {
                Ok(stream) => {
                    client = Some(stream);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let mut client = client.expect("active side never connected");
        let mut server = accept.await.unwrap().unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
