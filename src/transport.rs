//! WebSocket transport layer
//!
//! Owns the raw connection and nothing else: no message semantics live
//! here. The [`Transport`] trait is the seam the session is written
//! against, so tests can script a transport without a network.
//!
//! [`WsTransport`] is the production implementation. A single I/O task is
//! the sole reader of the socket and the sole writer, so outbound sends are
//! serialized (no interleaved partial writes) and inbound frames arrive in
//! wire order. The same task runs the keepalive: periodic pings, and a
//! missed pong within the window tears the connection down exactly like a
//! network-level disconnect.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::error::{ConnectError, TransportError};

/// Default interval between keepalive pings
pub const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Default window in which a pong must arrive
pub const PONG_TIMEOUT: Duration = Duration::from_secs(45);

/// Capacity of the inbound frame channel
const INBOUND_BUFFER: usize = 64;

/// Capacity of the outbound frame channel
const OUTBOUND_BUFFER: usize = 32;

/// Raw frame connection, independent of message semantics
///
/// `recv` follows the channel convention: `Some(Ok(frame))` for a text
/// frame, `Some(Err(_))` for an abnormal failure, `None` once the
/// connection is cleanly closed.
#[async_trait]
pub trait Transport: Send {
    /// Send one text frame
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next inbound frame
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the connection cleanly
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory producing connected transports
///
/// The session goes through this for every (re)connect attempt, which is
/// also what makes reconnect logic testable with scripted failures.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The transport type this connector produces
    type Transport: Transport;

    /// Open a new connection
    async fn connect(&self) -> Result<Self::Transport, ConnectError>;
}

// A shared connector connects like the connector it wraps; the facade
// hands one clone to each session task it spawns.
#[async_trait]
impl<C: Connector> Connector for std::sync::Arc<C> {
    type Transport = C::Transport;

    async fn connect(&self) -> Result<Self::Transport, ConnectError> {
        (**self).connect().await
    }
}

/// Commands from the transport handle to its I/O task
enum Outbound {
    Text(String),
    Close,
}

/// Production websocket transport over tokio-tungstenite
pub struct WsTransport {
    outbound_tx: mpsc::Sender<Outbound>,
    inbound_rx: mpsc::Receiver<Result<String, TransportError>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound_tx
            .send(Outbound::Text(text))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound_rx.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound_tx
            .send(Outbound::Close)
            .await
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Connector for [`WsTransport`]
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// WebSocket URL of the service gateway
    pub url: String,
    /// Timeout for the TCP connect + websocket handshake
    pub connect_timeout: Duration,
    /// Interval between keepalive pings
    pub ping_interval: Duration,
    /// Window in which a pong must arrive
    pub pong_timeout: Duration,
}

impl WsConnector {
    /// Create a connector with default keepalive settings
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            ping_interval: PING_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self) -> Result<WsTransport, ConnectError> {
        debug!("connecting to {}", self.url);

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(&self.url))
                .await
                .map_err(|_| ConnectError::Timeout(self.connect_timeout))??;

        debug!("websocket connected to {}", self.url);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        tokio::spawn(io_loop(
            ws_stream,
            outbound_rx,
            inbound_tx,
            self.ping_interval,
            self.pong_timeout,
        ));

        Ok(WsTransport {
            outbound_tx,
            inbound_rx,
        })
    }
}

/// I/O task: sole reader and writer of the socket
///
/// Ends on clean close (local or remote), abnormal error, or keepalive
/// timeout; dropping `inbound_tx` is what signals `recv` callers.
async fn io_loop<S>(
    ws_stream: WebSocketStream<S>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    inbound_tx: mpsc::Sender<Result<String, TransportError>>,
    ping_interval: Duration,
    pong_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut ping_timer = tokio::time::interval(ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    warn!("no pong within {:?}, failing connection", pong_timeout);
                    let _ = inbound_tx.send(Err(TransportError::KeepaliveTimeout)).await;
                    break;
                }
                if let Err(e) = ws_sender.send(WsMessage::Ping(Vec::new().into())).await {
                    let _ = inbound_tx.send(Err(e.into())).await;
                    break;
                }
            }

            out = outbound_rx.recv() => {
                match out {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                            let _ = inbound_tx.send(Err(e.into())).await;
                            break;
                        }
                    }
                    // Close requested, or the handle was dropped.
                    Some(Outbound::Close) | None => {
                        debug!("closing websocket");
                        let _ = ws_sender.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }

            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if inbound_tx.send(Ok(text.to_string())).await.is_err() {
                            // Receiver gone; nothing left to deliver to.
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_sender.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("server sent close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary and other frame types - ignore.
                    }
                    Some(Err(e)) => {
                        warn!("websocket error: {}", e);
                        let _ = inbound_tx.send(Err(e.into())).await;
                        break;
                    }
                    None => {
                        debug!("websocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    debug!("transport I/O task ended");
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport and connector for exercising the session engine
    //! without a network.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A transport that replays scripted inbound frames and records sends.
    ///
    /// Script entries follow the `recv` convention: `Some(Ok(frame))`,
    /// `Some(Err(_))` for an abnormal failure, `None` for a clean close.
    /// Once the script is exhausted `recv` hangs, so a stop request is what
    /// ends the session.
    pub(crate) struct MockTransport {
        incoming: VecDeque<Option<Result<String, TransportError>>>,
        pub(crate) sent: Arc<Mutex<Vec<String>>>,
        pub(crate) closed: Arc<AtomicBool>,
    }

    impl MockTransport {
        pub(crate) fn new(
            incoming: Vec<Option<Result<String, TransportError>>>,
        ) -> (Self, Arc<Mutex<Vec<String>>>, Arc<AtomicBool>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let transport = Self {
                incoming: VecDeque::from(incoming),
                sent: Arc::clone(&sent),
                closed: Arc::clone(&closed),
            };
            (transport, sent, closed)
        }

        /// Script that delivers the given frames and then hangs.
        pub(crate) fn scripted(frames: Vec<&str>) -> (Self, Arc<Mutex<Vec<String>>>, Arc<AtomicBool>) {
            Self::new(frames.into_iter().map(|f| Some(Ok(f.to_string()))).collect())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            match self.incoming.pop_front() {
                Some(item) => item,
                // Script exhausted - stay alive until the session stops.
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    /// A connector that hands out pre-built transports, then fails.
    pub(crate) struct MockConnector {
        outcomes: Mutex<VecDeque<Result<MockTransport, ()>>>,
        pub(crate) attempts: AtomicU32,
    }

    impl MockConnector {
        pub(crate) fn new(outcomes: Vec<Result<MockTransport, ()>>) -> Self {
            Self {
                outcomes: Mutex::new(VecDeque::from(outcomes)),
                attempts: AtomicU32::new(0),
            }
        }

        pub(crate) fn connect_attempts(&self) -> u32 {
            self.attempts.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn connect(&self) -> Result<MockTransport, ConnectError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            match self.outcomes.lock().unwrap().pop_front() {
                Some(Ok(transport)) => Ok(transport),
                _ => Err(ConnectError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "scripted refusal",
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn spawn_io_loop(
        io: tokio::io::DuplexStream,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) -> (
        mpsc::Sender<Outbound>,
        mpsc::Receiver<Result<String, TransportError>>,
    ) {
        let ws = WebSocketStream::from_raw_socket(io, Role::Client, None).await;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(io_loop(ws, outbound_rx, inbound_tx, ping_interval, pong_timeout));
        (outbound_tx, inbound_rx)
    }

    #[tokio::test]
    async fn test_missed_pong_fails_connection() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        // Never poll the peer side, so pings go unanswered.
        let _server_io = server_io;
        let (_outbound_tx, mut inbound_rx) =
            spawn_io_loop(client_io, Duration::from_millis(20), Duration::from_millis(50)).await;

        let failure = tokio::time::timeout(Duration::from_secs(2), inbound_rx.recv())
            .await
            .expect("keepalive never tripped")
            .expect("channel closed without an error");
        assert!(matches!(failure, Err(TransportError::KeepaliveTimeout)));
        // The I/O task ends after reporting, closing the channel.
        assert!(inbound_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_outbound_frames_arrive_in_order() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let (outbound_tx, _inbound_rx) =
            spawn_io_loop(client_io, Duration::from_secs(60), Duration::from_secs(120)).await;

        for text in ["one", "two", "three"] {
            outbound_tx.send(Outbound::Text(text.to_string())).await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(1), server_ws.next())
                .await
                .expect("no frame from peer")
                .expect("peer stream ended")
                .unwrap();
            // Keepalive pings may interleave with the text frames.
            if let WsMessage::Text(text) = frame {
                seen.push(text.to_string());
            }
        }
        assert_eq!(seen, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_inbound_frames_forwarded_until_close() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let (_outbound_tx, mut inbound_rx) =
            spawn_io_loop(client_io, Duration::from_secs(60), Duration::from_secs(120)).await;

        server_ws.send(WsMessage::Text("hello".into())).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), inbound_rx.recv())
            .await
            .expect("frame never forwarded")
            .expect("channel closed early")
            .unwrap();
        assert_eq!(frame, "hello");

        server_ws.send(WsMessage::Close(None)).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(1), inbound_rx.recv())
                .await
                .expect("close never observed")
                .is_none()
        );
    }
}
