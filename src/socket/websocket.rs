use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::engineio::{
    DEFAULT_NAMESPACE, EnginePacket, SocketPacket, connect_frame, event_frame, socket_io_url,
};
use super::error::{Result, SocketError};
use crate::calls::SignalingEvent;
use crate::config::RelayConfig;
use crate::transport::{RelayChannel, RelayChannelFactory, RelayEvent};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;

/// Time allowed for the server's `open` packet before the first ping interval is known.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug)]
enum Command {
    Emit(Outbound),
    Reconnect,
    Close,
}

/// An encoded emit, tagged with its event name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Outbound {
    event: String,
    frame: String,
}

enum SessionEnd {
    Closed,
    Lost,
    Reconnect,
}

/// Relay channel speaking Socket.IO over a WebSocket.
///
/// The connection itself is owned by a background task; this handle only
/// queues commands for it.
pub struct WebSocketRelayChannel {
    commands: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
}

#[async_trait]
impl RelayChannel for WebSocketRelayChannel {
    async fn send(&self, event: &str, payload: Value) -> std::result::Result<(), anyhow::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::SocketClosed.into());
        }
        trace!("--> Emitting {event}");
        self.commands
            .send(Command::Emit(Outbound {
                event: event.to_string(),
                frame: event_frame(event, payload),
            }))
            .map_err(|_| SocketError::SocketClosed.into())
    }

    async fn reconnect(&self) -> std::result::Result<(), anyhow::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::SocketClosed.into());
        }
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| SocketError::SocketClosed.into())
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Close);
        }
    }
}

/// Factory dialing the configured signaling server.
pub struct WebSocketRelayFactory {
    config: RelayConfig,
}

impl WebSocketRelayFactory {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RelayChannelFactory for WebSocketRelayFactory {
    async fn create_channel(
        &self,
    ) -> std::result::Result<(Arc<dyn RelayChannel>, mpsc::Receiver<RelayEvent>), anyhow::Error>
    {
        let url = socket_io_url(&self.config.url)?;
        info!("Dialing {url}");
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (event_tx, event_rx) = mpsc::channel(100);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let connection = Connection::new(url, self.config.clone(), event_tx, command_rx);
        tokio::task::spawn(connection.run(ws));

        let channel = Arc::new(WebSocketRelayChannel {
            commands: command_tx,
            closed: AtomicBool::new(false),
        });
        Ok((channel, event_rx))
    }
}

/// Per-connection bookkeeping, reset on every dial.
struct Link {
    joined: bool,
    ping_deadline: Duration,
    last_seen: Instant,
}

impl Link {
    fn new() -> Self {
        Self {
            joined: false,
            ping_deadline: HANDSHAKE_TIMEOUT,
            last_seen: Instant::now(),
        }
    }
}

struct Connection {
    url: String,
    config: RelayConfig,
    events: mpsc::Sender<RelayEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Emits waiting for the namespace join.
    pending: VecDeque<Outbound>,
    /// Set once any session joined; later joins come with a new identity.
    joined_before: bool,
}

impl Connection {
    fn new(
        url: String,
        config: RelayConfig,
        events: mpsc::Sender<RelayEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            url,
            config,
            events,
            commands,
            pending: VecDeque::new(),
            joined_before: false,
        }
    }

    async fn run(mut self, first: RawWs) {
        let mut next = Some(first);
        let mut immediate = false;
        loop {
            let ws = match next.take() {
                Some(ws) => ws,
                None => match self.redial(immediate).await {
                    Some(ws) => ws,
                    None => break,
                },
            };

            match self.drive(ws).await {
                SessionEnd::Closed => break,
                SessionEnd::Reconnect => immediate = true,
                SessionEnd::Lost => {
                    if !self.config.reconnect.enabled {
                        info!("Relay connection lost; reconnect disabled");
                        break;
                    }
                    immediate = false;
                }
            }
            if self.events.is_closed() {
                break;
            }
        }
        debug!("Relay connection task finished");
    }

    /// Dials until a connection is up, backing off between attempts.
    /// Returns `None` when closed or out of attempts.
    async fn redial(&mut self, immediate: bool) -> Option<RawWs> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let skip_delay = immediate && attempt == 1;
            if !skip_delay {
                if !self.config.reconnect.allows(attempt) {
                    warn!("Giving up on relay after {} attempts", attempt - 1);
                    return None;
                }
                let delay = self.config.reconnect.delay_for(attempt);
                debug!("Reconnecting to relay in {delay:?} (attempt {attempt})");
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        command = self.commands.recv() => match command {
                            None | Some(Command::Close) => return None,
                            Some(Command::Emit(outbound)) => self.queue(outbound),
                            Some(Command::Reconnect) => break,
                        },
                    }
                }
            }

            match connect_async(self.url.as_str()).await {
                Ok((ws, _response)) => {
                    info!("Reconnected to {}", self.url);
                    return Some(ws);
                }
                Err(e) => warn!("Relay dial failed: {e}"),
            }
        }
    }

    async fn drive(&mut self, ws: RawWs) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut link = Link::new();

        let end = loop {
            let deadline = link.last_seen + link.ping_deadline;
            tokio::select! {
                message = stream.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!("Relay read error: {e}");
                            break SessionEnd::Lost;
                        }
                        None => {
                            info!("Relay closed the connection");
                            break SessionEnd::Lost;
                        }
                    };
                    link.last_seen = Instant::now();
                    match message {
                        Message::Text(text) => {
                            match self.on_text(text.as_str(), &mut sink, &mut link).await {
                                Ok(()) => {}
                                Err(
                                    e @ (SocketError::MalformedPacket(_)
                                    | SocketError::BinaryUnsupported
                                    | SocketError::Json(_)),
                                ) => warn!("Dropping relay packet: {e}"),
                                Err(e) => {
                                    info!("Relay session ended: {e}");
                                    break SessionEnd::Lost;
                                }
                            }
                        }
                        Message::Binary(data) => {
                            warn!("Ignoring binary frame of {} bytes", data.len());
                        }
                        Message::Close(frame) => {
                            debug!("Received close frame: {frame:?}");
                            break SessionEnd::Lost;
                        }
                        _ => {}
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => {
                        let _ = sink.send(Message::text(EnginePacket::Close.encode())).await;
                        let _ = sink.close().await;
                        break SessionEnd::Closed;
                    }
                    Some(Command::Reconnect) => {
                        info!("Reconnecting to relay on request");
                        let _ = sink.close().await;
                        break SessionEnd::Reconnect;
                    }
                    Some(Command::Emit(outbound)) => {
                        if !link.joined {
                            self.queue(outbound);
                        } else if let Err(e) = sink.send(Message::text(outbound.frame.clone())).await {
                            warn!("Relay write failed: {e}");
                            self.queue(outbound);
                            break SessionEnd::Lost;
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("No ping from relay within {:?}", link.ping_deadline);
                    break SessionEnd::Lost;
                }
            }
        };

        if link.joined {
            let _ = self.events.send(RelayEvent::Disconnected).await;
        }
        end
    }

    async fn on_text(&mut self, text: &str, sink: &mut WsSink, link: &mut Link) -> Result<()> {
        match EnginePacket::decode(text)? {
            EnginePacket::Open(handshake) => {
                debug!(
                    "Engine open: sid={} ping every {}ms",
                    handshake.sid, handshake.ping_interval
                );
                link.ping_deadline = handshake.ping_deadline();
                sink.send(Message::text(connect_frame())).await?;
            }
            EnginePacket::Ping(data) => {
                trace!("<-- ping");
                sink.send(Message::text(EnginePacket::Pong(data).encode()))
                    .await?;
            }
            EnginePacket::Close => return Err(SocketError::SocketClosed),
            EnginePacket::Message(data) => self.on_socket_packet(&data, sink, link).await?,
            EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => {}
        }
        Ok(())
    }

    async fn on_socket_packet(
        &mut self,
        data: &str,
        sink: &mut WsSink,
        link: &mut Link,
    ) -> Result<()> {
        match SocketPacket::decode(data)? {
            SocketPacket::Connect { namespace, .. } if namespace == DEFAULT_NAMESPACE => {
                info!("Joined relay");
                link.joined = true;
                if self.joined_before {
                    self.drop_stale_emits();
                }
                self.joined_before = true;
                if self.events.send(RelayEvent::Connected).await.is_err() {
                    return Err(SocketError::SocketClosed);
                }
                while let Some(outbound) = self.pending.pop_front() {
                    if let Err(e) = sink.send(Message::text(outbound.frame.clone())).await {
                        self.pending.push_front(outbound);
                        return Err(e.into());
                    }
                }
            }
            SocketPacket::Event { event, args, .. } => {
                debug!("<-- {event}");
                let payload = args.into_iter().next().unwrap_or(Value::Null);
                if self
                    .events
                    .send(RelayEvent::Message { event, payload })
                    .await
                    .is_err()
                {
                    return Err(SocketError::SocketClosed);
                }
            }
            SocketPacket::Disconnect { namespace } => {
                info!("Relay dropped us from namespace {namespace}");
                return Err(SocketError::SocketClosed);
            }
            SocketPacket::ConnectError { namespace, data } => {
                warn!("Relay refused namespace {namespace}: {data:?}");
                return Err(SocketError::SocketClosed);
            }
            other => debug!("Ignoring socket packet {other:?}"),
        }
        Ok(())
    }

    /// Call offers name the sender's old id; after a rejoin the relay would
    /// route the answer to a connection that no longer exists.
    fn drop_stale_emits(&mut self) {
        let before = self.pending.len();
        self.pending
            .retain(|outbound| outbound.event != SignalingEvent::CallUser.name());
        let dropped = before - self.pending.len();
        if dropped > 0 {
            warn!("Dropping {dropped} call offer(s) queued under the previous relay identity");
        }
    }

    fn queue(&mut self, outbound: Outbound) {
        if self.config.outbound_buffer == 0 {
            warn!("Relay not joined; dropping emit");
            return;
        }
        if self.pending.len() >= self.config.outbound_buffer {
            warn!("Outbound buffer full; dropping oldest emit");
            self.pending.pop_front();
        }
        self.pending.push_back(outbound);
    }
}
