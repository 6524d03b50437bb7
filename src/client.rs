//! Client facade
//!
//! The single entry point for applications: configure, start, subscribe,
//! act, stop. Everything else in the crate sits behind it. The facade owns
//! the session task's lifecycle and talks to it through an action channel
//! and a stop signal; room state is read through snapshot copies only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec::Command;
use crate::error::{ActionError, HandlerError, PermissionError, SessionError};
use crate::event::{Dispatcher, ErrorSink, Event, EventKind};
use crate::room::RoomState;
use crate::session::{
    SessionConfig, SessionManager, SessionState, BASE_RECONNECT_DELAY, MAX_RECONNECT_DELAY,
};
use crate::transport::{Connector, WsConnector};
use crate::types::{random_guest_nick, Handle, HandlerId};

/// Capacity of the outbound action channel
const ACTION_BUFFER: usize = 32;

/// Default timeout for the connect + websocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the login handshake
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default reconnect attempt budget
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Connection and identity settings for one client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the service gateway
    pub url: String,
    /// Room to join
    pub room: String,
    /// Nick to enter with; a random guest nick is generated when None
    pub nick: Option<String>,
    /// Account name + password; None logs in as a guest
    pub account: Option<(String, String)>,
    /// Whether to reconnect after abnormal connection loss
    pub reconnect: bool,
    /// Reconnect attempts allowed before giving up
    pub max_reconnect_attempts: u32,
    /// Bound on the connect + websocket handshake
    pub connect_timeout: Duration,
    /// Bound on the login handshake
    pub auth_timeout: Duration,
}

impl ClientConfig {
    /// Settings for joining `room` through the gateway at `url`
    pub fn new(url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room: room.into(),
            nick: None,
            account: None,
            reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    /// Enter with this nick instead of a generated guest nick
    pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = Some(nick.into());
        self
    }

    /// Log in with an account instead of as a guest
    pub fn with_account(
        mut self,
        account: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.account = Some((account.into(), password.into()));
        self
    }

    /// Enable or disable reconnecting after abnormal connection loss
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the reconnect attempt budget
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the login handshake timeout
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }
}

/// Handles to a live session task
struct Running {
    actions_tx: mpsc::Sender<Command>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A chat-room client
///
/// One value per session; multiple independent clients can coexist in a
/// process. Subscriptions survive across stop/start cycles, room state
/// does not.
pub struct Client<C: Connector = WsConnector> {
    connector: Arc<C>,
    config: ClientConfig,
    /// Resolved nick (generated when the config left it unset)
    nick: String,
    dispatcher: Arc<Dispatcher>,
    room: Arc<Mutex<RoomState>>,
    state: Arc<Mutex<SessionState>>,
    running: Option<Running>,
}

impl Client<WsConnector> {
    /// Create a client talking to the service gateway in `config`
    pub fn new(config: ClientConfig) -> Self {
        let connector = WsConnector::new(config.url.clone(), config.connect_timeout);
        Self::with_connector(connector, config)
    }
}

impl<C> Client<C>
where
    C: Connector + 'static,
    C::Transport: Send + 'static,
{
    /// Create a client over a custom [`Connector`]
    pub fn with_connector(connector: C, config: ClientConfig) -> Self {
        let nick = config
            .nick
            .clone()
            .unwrap_or_else(random_guest_nick);
        Self {
            connector: Arc::new(connector),
            room: Arc::new(Mutex::new(RoomState::new(config.room.clone()))),
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            dispatcher: Arc::new(Dispatcher::new()),
            nick,
            config,
            running: None,
        }
    }

    /// Begin the session state machine on a background task
    ///
    /// Fails with [`SessionError::AlreadyRunning`] while a previous start
    /// is still live.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if let Some(running) = &self.running {
            if !running.task.is_finished() {
                return Err(SessionError::AlreadyRunning);
            }
        }

        let (actions_tx, actions_rx) = mpsc::channel(ACTION_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let session_config = SessionConfig {
            room: self.config.room.clone(),
            nick: self.nick.clone(),
            account: self.config.account.clone(),
            auth_timeout: self.config.auth_timeout,
            reconnect: self.config.reconnect,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
            base_delay: BASE_RECONNECT_DELAY,
            max_delay: MAX_RECONNECT_DELAY,
        };

        debug!("starting session for `{}` in `{}`", self.nick, self.config.room);
        let manager = SessionManager::new(
            Arc::clone(&self.connector),
            session_config,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.room),
            Arc::clone(&self.state),
            actions_rx,
            stop_rx,
        );
        let task = tokio::spawn(manager.run());

        self.running = Some(Running {
            actions_tx,
            stop_tx,
            task,
        });
        Ok(())
    }

    /// Stop the session and wait for the task to wind down
    ///
    /// Cancels a pending reconnect backoff or an in-flight connect/auth
    /// attempt immediately.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        let running = self.running.take().ok_or(SessionError::NotRunning)?;
        let _ = running.stop_tx.send(true);
        let _ = running.task.await;
        Ok(())
    }

    /// Register a handler for an event kind; usable before `start`
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.dispatcher.on(kind, handler)
    }

    /// Remove a previously registered handler
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.dispatcher.off(kind, id)
    }

    /// Replace the sink receiving handler failures
    pub fn set_error_sink(&self, sink: ErrorSink) {
        self.dispatcher.set_error_sink(sink)
    }

    /// Where the session is in its lifecycle
    pub fn session_state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot copy of the current room state
    ///
    /// Never a live reference; the session keeps mutating its own copy.
    pub fn room_snapshot(&self) -> RoomState {
        self.room.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The nick this client enters rooms with
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Send a chat message to the room
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), ActionError> {
        self.queue(Command::Msg { text: text.into() }).await
    }

    /// Send a private message to a user
    pub async fn send_private(
        &self,
        text: impl Into<String>,
        handle: Handle,
    ) -> Result<(), ActionError> {
        self.queue(Command::Pvtmsg {
            text: text.into(),
            handle,
        })
        .await
    }

    /// Change nick
    pub async fn set_nick(&self, nick: impl Into<String>) -> Result<(), ActionError> {
        self.queue(Command::Nick { nick: nick.into() }).await
    }

    /// Answer a room password challenge
    pub async fn send_room_password(
        &self,
        password: impl Into<String>,
    ) -> Result<(), ActionError> {
        self.queue(Command::Password {
            password: password.into(),
        })
        .await
    }

    /// Kick a user out of the room; requires moderator rights
    pub async fn kick(&self, handle: Handle) -> Result<(), ActionError> {
        self.require_moderator("kick")?;
        self.queue(Command::Kick { handle }).await
    }

    /// Ban a user from the room; requires moderator rights
    pub async fn ban(&self, handle: Handle) -> Result<(), ActionError> {
        self.require_moderator("ban")?;
        self.queue(Command::Ban { handle }).await
    }

    /// Lift a ban by its ban id; requires moderator rights
    pub async fn unban(&self, ban_id: u64) -> Result<(), ActionError> {
        self.require_moderator("unban")?;
        self.queue(Command::Unban { id: ban_id }).await
    }

    /// Request the ban list; requires moderator rights
    pub async fn request_banlist(&self) -> Result<(), ActionError> {
        self.require_moderator("banlist")?;
        self.queue(Command::Banlist).await
    }

    /// Allow a green-room broadcast; requires moderator rights
    pub async fn approve_broadcast(&self, handle: Handle) -> Result<(), ActionError> {
        self.require_moderator("approve broadcast")?;
        self.queue(Command::StreamModerAllow { handle }).await
    }

    /// Close a user's broadcast; requires moderator rights
    pub async fn close_broadcast(&self, handle: Handle) -> Result<(), ActionError> {
        self.require_moderator("close broadcast")?;
        self.queue(Command::StreamModerClose { handle }).await
    }

    /// Validate and hand a command to the session task
    ///
    /// Validation runs first, so an invalid request fails synchronously and
    /// nothing reaches the wire regardless of session state.
    async fn queue(&self, cmd: Command) -> Result<(), ActionError> {
        cmd.validate()?;
        let running = self.running.as_ref().ok_or(SessionError::NotRunning)?;
        running
            .actions_tx
            .send(cmd)
            .await
            .map_err(|_| SessionError::NotRunning)?;
        Ok(())
    }

    /// Client-side permission pre-check against the last-known roster
    ///
    /// Saves a round trip for an action the server is guaranteed to
    /// reject.
    fn require_moderator(&self, action: &'static str) -> Result<(), PermissionError> {
        let room = self.room.lock().unwrap_or_else(|e| e.into_inner());
        match room.self_user() {
            Some(user) if user.level.is_mod() => Ok(()),
            _ => Err(PermissionError { action }),
        }
    }
}
