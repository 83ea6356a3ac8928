//! Per-peer session driver.
//!
//! A `Session` walks one peer through Idle, Connect/Active, OpenSent,
//! OpenConfirm and Established. Reads happen on a dedicated reader task that
//! frames the stream with [`MessageCodec`] and forwards each decoded message
//! on a bounded channel; the session task itself only writes, waits on that
//! channel, and talks to the RIB engine.
//!
//! One call to [`Session::run`] is one session instance. Any error ends it:
//! the connection is torn down rather than resynchronized, and restarting is
//! left to the caller.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::fsm::{
    keepalive_time, negotiate_hold_time, validate_open, FsmState, NotificationError,
};
use super::message::{DecodeError, Message, MessageCodec, MessageType, Notification, OpenMessage};
use super::transport::{SessionMode, Transport, TransportError};
use crate::error::RibError;
use crate::rib::{diff_updates, AdjRib, ExportPolicy, LocRib, RibHandle};

/// Hold timer armed while waiting for the peer's OPEN.
pub const OPEN_HOLD_TIME: Duration = Duration::from_secs(240);

pub const DEFAULT_HOLD_TIME: u16 = 180;
pub const DEFAULT_CONNECT_RETRY_TIME: Duration = Duration::from_secs(120);
pub const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Upper bound on the final NOTIFICATION write during teardown.
const NOTIFICATION_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a session needs to know about itself and its peer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Tag used for this peer in RIB commands.
    pub peer_idx: usize,
    /// Name used in logs, usually the interface.
    pub name: String,
    pub mode: SessionMode,
    pub local_asn: u16,
    pub router_id: Ipv4Addr,
    /// Our address on the link; advertised as NEXT_HOP.
    pub local_addr: Ipv4Addr,
    /// When set, the peer's OPEN must carry this AS.
    pub peer_asn: Option<u16>,
    pub hold_time: u16,
    pub connect_retry_time: Duration,
    /// Reject anything but OPEN in OpenSent instead of treating it as the OPEN.
    pub strict_open: bool,
    /// Capacity of the reader task's message channel.
    pub channel_size: usize,
}

impl SessionConfig {
    pub fn new(
        peer_idx: usize,
        name: impl Into<String>,
        mode: SessionMode,
        local_asn: u16,
        router_id: Ipv4Addr,
        local_addr: Ipv4Addr,
    ) -> Self {
        Self {
            peer_idx,
            name: name.into(),
            mode,
            local_asn,
            router_id,
            local_addr,
            peer_asn: None,
            hold_time: DEFAULT_HOLD_TIME,
            connect_retry_time: DEFAULT_CONNECT_RETRY_TIME,
            strict_open: true,
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

/// What the peer told us in its OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub asn: u16,
    pub router_id: Ipv4Addr,
    pub hold_time: u16,
}

/// Why a session instance ended.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to send: {0}")]
    Send(#[source] io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("unexpected {msg_type} in {state}")]
    UnexpectedMessage { state: FsmState, msg_type: MessageType },

    #[error("rejected peer OPEN ({:?}, subcode {})", .0.code, .0.subcode)]
    OpenRejected(NotificationError),

    #[error("peer sent NOTIFICATION {0}")]
    NotificationReceived(Notification),

    #[error("hold timer expired")]
    HoldTimerExpired,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error(transparent)]
    Rib(#[from] RibError),
}

impl SessionError {
    /// The NOTIFICATION to send the peer before closing, if any.
    pub fn notification(&self) -> Option<NotificationError> {
        match self {
            SessionError::Decode(err) => NotificationError::from_decode_error(err),
            SessionError::UnexpectedMessage { state, .. } => Some(NotificationError::fsm_error(
                state.unexpected_message_subcode(),
            )),
            SessionError::OpenRejected(err) => Some(err.clone()),
            SessionError::HoldTimerExpired => Some(NotificationError::hold_timer_expired()),
            SessionError::Rib(_) => Some(NotificationError::cease()),
            SessionError::Transport(_)
            | SessionError::Send(_)
            | SessionError::NotificationReceived(_)
            | SessionError::ConnectionClosed => None,
        }
    }
}

/// Write half plus the channel fed by the reader task.
///
/// The reader has its own token so it keeps running until [`Connection::close`],
/// after the session has sent its last NOTIFICATION.
struct Connection<S> {
    writer: WriteHalf<S>,
    write_buf: BytesMut,
    messages: mpsc::Receiver<Result<Message, DecodeError>>,
    reader_cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn start(stream: S, channel_size: usize, peer: String) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let (tx, messages) = mpsc::channel(channel_size.max(1));
        let reader_cancel = CancellationToken::new();
        let reader = tokio::spawn(read_messages(read_half, tx, reader_cancel.clone(), peer));
        Self {
            writer,
            write_buf: BytesMut::new(),
            messages,
            reader_cancel,
            reader,
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        self.write_buf.clear();
        MessageCodec.encode(message, &mut self.write_buf)?;
        self.writer
            .write_all(&self.write_buf)
            .await
            .map_err(SessionError::Send)?;
        self.writer.flush().await.map_err(SessionError::Send)
    }

    async fn recv(&mut self) -> Result<Message, SessionError> {
        match self.messages.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(err)) => Err(err.into()),
            None => Err(SessionError::ConnectionClosed),
        }
    }

    /// Stop the reader task, shut down the write side and wait for the reader.
    async fn close(mut self) {
        self.reader_cancel.cancel();
        let _ = self.writer.shutdown().await;
        drop(self.messages);
        let _ = self.reader.await;
    }
}

/// Reader task: decode frames until EOF, the first decode error, or cancellation.
async fn read_messages<R>(
    reader: R,
    tx: mpsc::Sender<Result<Message, DecodeError>>,
    cancel: CancellationToken,
    peer: String,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, MessageCodec);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        let Some(result) = frame else {
            debug!(peer = %peer, "Peer closed the connection");
            break;
        };

        let failed = match &result {
            Ok(message) => {
                trace!(peer = %peer, msg_type = %message.message_type(), "Received {}", message.message_type());
                false
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to decode message: {}", e);
                true
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(result) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        if failed {
            break;
        }
    }
}

enum Event {
    KeepaliveDue,
    LocRibChanged,
    Message(Result<Message, SessionError>),
}

/// The per-peer session state machine.
pub struct Session<T: Transport> {
    config: SessionConfig,
    transport: T,
    rib: RibHandle,
    export: ExportPolicy,
    state: FsmState,
    state_tx: watch::Sender<FsmState>,
    connection: Option<Connection<T::Stream>>,
    peer: Option<PeerInfo>,
    hold_time: Duration,
    hold_deadline: Option<Instant>,
    adj_rib_out: AdjRib,
    deconfigured: CancellationToken,
}

impl<T: Transport> Session<T> {
    pub fn new(config: SessionConfig, transport: T, rib: RibHandle) -> Self {
        let export = ExportPolicy {
            local_asn: config.local_asn,
            next_hop: config.local_addr,
        };
        let (state_tx, _) = watch::channel(FsmState::Idle);
        Self {
            config,
            transport,
            rib,
            export,
            state: FsmState::Idle,
            state_tx,
            connection: None,
            peer: None,
            hold_time: Duration::ZERO,
            hold_deadline: None,
            adj_rib_out: AdjRib::new(),
            deconfigured: CancellationToken::new(),
        }
    }

    /// Token the owner cancels before the run token when the peer is removed
    /// for good. A cancelled run then closes with Cease 6/3 instead of 6/2.
    pub fn with_deconfigure_token(mut self, token: CancellationToken) -> Self {
        self.deconfigured = token;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Follow this session's state across runs.
    pub fn state_watch(&self) -> watch::Receiver<FsmState> {
        self.state_tx.subscribe()
    }

    /// The peer's OPEN parameters, once received.
    pub fn peer(&self) -> Option<PeerInfo> {
        self.peer
    }

    /// Run one session instance until `cancel` fires or an error ends it.
    ///
    /// Returns `Ok(())` only on cancellation. Either way the connection is
    /// closed, the reader task has stopped, and the state is back to Idle.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), SessionError> {
        let session_token = cancel.child_token();
        self.peer = None;
        self.hold_time = Duration::ZERO;
        self.hold_deadline = None;
        self.adj_rib_out.clear();

        info!(peer = %self.config.name, mode = ?self.config.mode, "Starting session");
        let result = self.drive(&session_token).await;

        let notification = match &result {
            Ok(()) if self.deconfigured.is_cancelled() => {
                Some(NotificationError::peer_deconfigured())
            }
            Ok(()) => Some(NotificationError::cease()),
            Err(e) => e.notification(),
        };
        if let (Some(notification), Some(connection)) = (notification, self.connection.as_mut()) {
            let message = Message::Notification(notification.into());
            match tokio::time::timeout(NOTIFICATION_SEND_TIMEOUT, connection.send(&message)).await {
                Ok(Ok(())) => debug!(peer = %self.config.name, "Sent {}", message.message_type()),
                Ok(Err(e)) => debug!(peer = %self.config.name, error = %e, "Failed to send NOTIFICATION"),
                Err(_) => debug!(peer = %self.config.name, "Timed out sending NOTIFICATION"),
            }
        }

        session_token.cancel();
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.transition(FsmState::Idle);

        match &result {
            Ok(()) => info!(peer = %self.config.name, "Session stopped"),
            Err(e) => warn!(peer = %self.config.name, error = %e, "Session failed: {}", e),
        }
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.state {
                FsmState::Idle => {
                    let next = match self.config.mode {
                        SessionMode::Active => FsmState::Connect,
                        SessionMode::Passive => FsmState::Active,
                    };
                    self.transition(next);
                }
                FsmState::Connect | FsmState::Active => self.connect(cancel).await?,
                FsmState::OpenSent => self.open_sent(cancel).await?,
                FsmState::OpenConfirm => self.open_confirm(cancel).await?,
                FsmState::Established => return self.established(cancel).await,
            }
        }
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = self.transport.establish() => result,
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e @ (TransportError::NoRemoteAddress | TransportError::Closed)) => {
                return Err(e.into());
            }
            Err(e) => {
                warn!(peer = %self.config.name, error = %e, "Connection attempt failed: {}", e);
                if self.state == FsmState::Connect {
                    self.transition(FsmState::Idle);
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.connect_retry_time) => {}
                }
                return Ok(());
            }
        };

        info!(peer = %self.config.name, "Connection established");
        self.connection = Some(Connection::start(
            stream,
            self.config.channel_size,
            self.config.name.clone(),
        ));

        let open = OpenMessage::new(
            self.config.local_asn,
            self.config.hold_time,
            self.config.router_id,
        );
        self.send(&Message::Open(open)).await?;
        self.hold_deadline = Some(Instant::now() + OPEN_HOLD_TIME);
        self.transition(FsmState::OpenSent);
        Ok(())
    }

    async fn open_sent(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let Some(message) = self.next_message(cancel).await? else {
            return Ok(());
        };

        match message {
            Message::Open(open) => {
                validate_open(&open, self.config.peer_asn).map_err(SessionError::OpenRejected)?;
                self.hold_time = negotiate_hold_time(self.config.hold_time, open.hold_time);
                info!(
                    peer = %self.config.name,
                    peer_asn = open.asn,
                    router_id = %open.router_id,
                    hold_time = ?self.hold_time,
                    "Received OPEN from AS{}",
                    open.asn
                );
                self.peer = Some(PeerInfo {
                    asn: open.asn,
                    router_id: open.router_id,
                    hold_time: open.hold_time,
                });
            }
            Message::Notification(notification) => {
                return Err(SessionError::NotificationReceived(notification));
            }
            other if self.config.strict_open => {
                return Err(SessionError::UnexpectedMessage {
                    state: self.state,
                    msg_type: other.message_type(),
                });
            }
            other => {
                warn!(
                    peer = %self.config.name,
                    msg_type = %other.message_type(),
                    "Expected OPEN, got {}; continuing",
                    other.message_type()
                );
                self.hold_time = negotiate_hold_time(self.config.hold_time, self.config.hold_time);
            }
        }

        self.restart_hold_timer();
        self.transition(FsmState::OpenConfirm);
        Ok(())
    }

    async fn open_confirm(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.send(&Message::Keepalive).await?;

        let Some(message) = self.next_message(cancel).await? else {
            return Ok(());
        };
        match message {
            Message::Keepalive => {
                self.restart_hold_timer();
                self.transition(FsmState::Established);
                Ok(())
            }
            Message::Notification(notification) => {
                Err(SessionError::NotificationReceived(notification))
            }
            other => Err(SessionError::UnexpectedMessage {
                state: self.state,
                msg_type: other.message_type(),
            }),
        }
    }

    async fn established(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.rib.peer_up(self.config.peer_idx).await?;

        let mut loc_rib = self.rib.subscribe();
        let snapshot = loc_rib.borrow_and_update().clone();
        self.advertise(&snapshot).await?;

        let mut keepalive = self.keepalive_interval();
        loop {
            let connection = self
                .connection
                .as_mut()
                .ok_or(SessionError::ConnectionClosed)?;

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = wait_for_deadline(self.hold_deadline) => return Err(SessionError::HoldTimerExpired),
                _ = tick(&mut keepalive) => Event::KeepaliveDue,
                changed = loc_rib.changed() => match changed {
                    Ok(()) => Event::LocRibChanged,
                    Err(_) => return Err(RibError::EngineClosed.into()),
                },
                message = connection.recv() => Event::Message(message),
            };

            match event {
                Event::KeepaliveDue => self.send(&Message::Keepalive).await?,
                Event::LocRibChanged => {
                    let snapshot = loc_rib.borrow_and_update().clone();
                    self.advertise(&snapshot).await?;
                }
                Event::Message(message) => self.handle_message(message?).await?,
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), SessionError> {
        match message {
            Message::Update(update) => {
                self.restart_hold_timer();
                debug!(
                    peer = %self.config.name,
                    withdrawn = update.withdrawn.len(),
                    announced = update.nlri.len(),
                    "Received UPDATE"
                );
                self.rib.update(self.config.peer_idx, update).await?;
                Ok(())
            }
            Message::Keepalive => {
                self.restart_hold_timer();
                Ok(())
            }
            Message::Notification(notification) => {
                Err(SessionError::NotificationReceived(notification))
            }
            Message::Open(_) => Err(SessionError::UnexpectedMessage {
                state: self.state,
                msg_type: MessageType::Open,
            }),
        }
    }

    /// Send whatever moves the peer from our Adj-RIB-Out to the exported `loc_rib`.
    async fn advertise(&mut self, loc_rib: &LocRib) -> Result<(), SessionError> {
        let desired = self.export.export_table(loc_rib);
        let updates = diff_updates(&self.adj_rib_out, &desired);
        if updates.is_empty() {
            return Ok(());
        }

        debug!(
            peer = %self.config.name,
            updates = updates.len(),
            routes = desired.len(),
            "Advertising {} UPDATEs",
            updates.len()
        );
        for update in updates {
            self.send(&Message::Update(update)).await?;
        }
        self.adj_rib_out = desired;
        Ok(())
    }

    /// Next message from the reader, or `None` if cancelled first.
    async fn next_message(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, SessionError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(SessionError::ConnectionClosed)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            _ = wait_for_deadline(self.hold_deadline) => Err(SessionError::HoldTimerExpired),
            message = connection.recv() => message.map(Some),
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(SessionError::ConnectionClosed)?;
        trace!(peer = %self.config.name, msg_type = %message.message_type(), "Sending {}", message.message_type());
        connection.send(message).await
    }

    fn restart_hold_timer(&mut self) {
        self.hold_deadline = if self.hold_time.is_zero() {
            None
        } else {
            Some(Instant::now() + self.hold_time)
        };
    }

    fn keepalive_interval(&self) -> Option<Interval> {
        if self.hold_time.is_zero() {
            return None;
        }
        let period = keepalive_time(self.hold_time);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }

    fn transition(&mut self, next: FsmState) {
        if self.state == next {
            return;
        }
        info!(
            peer = %self.config.name,
            from = %self.state,
            to = %next,
            "Session state {} -> {}",
            self.state,
            next
        );
        self.state = next;
        self.state_tx.send_replace(next);
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
