//! Session state machine
//!
//! Orchestrates one connection lifecycle end to end: connect, authenticate,
//! join the room, then run the receive loop. Per inbound frame the order is
//! fixed: decode, apply to [`RoomState`], translate, dispatch. State update
//! strictly precedes dispatch, so handlers always observe the post-update
//! roster.
//!
//! On abnormal connection loss the manager reconnects with jittered
//! exponential backoff; an explicit stop request cancels a pending backoff
//! or an in-flight connect/auth attempt immediately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::auth::{self, AuthConfig};
use crate::codec::{self, Command, Message};
use crate::error::{AuthFailure, SessionError};
use crate::event::{self, DisconnectReason, Dispatcher, Event};
use crate::room::RoomState;
use crate::transport::{Connector, Transport};

/// Default first reconnect delay
pub const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for the reconnect delay, jitter included
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection; the machine is idle or between reconnect attempts
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Running the login handshake
    Authenticating,
    /// Logged in, waiting for the room snapshot
    JoiningRoom,
    /// In the room; the receive loop is live
    Joined,
    /// Tearing the connection down
    Disconnecting,
}

/// Everything the session task needs to run
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Room to join after login
    pub room: String,
    /// Nick to enter with
    pub nick: String,
    /// Account credentials; None logs in as a guest
    pub account: Option<(String, String)>,
    /// Bound on the login handshake
    pub auth_timeout: Duration,
    /// Whether to reconnect after abnormal connection loss
    pub reconnect: bool,
    /// Reconnect attempts allowed before giving up
    pub max_reconnect_attempts: u32,
    /// First reconnect delay; doubles per consecutive failure
    pub base_delay: Duration,
    /// Ceiling for the reconnect delay
    pub max_delay: Duration,
}

/// Why one connection's lifecycle ended
enum SessionEnd {
    /// stop() was requested; terminal
    Stopped,
    /// Abnormal connection loss; eligible for reconnect
    Lost,
    /// The login handshake failed; terminal, never auto-retried
    AuthFailed(AuthFailure),
}

/// Drives the session state machine on its own task
///
/// Owns the transport and the sole mutation path into the shared
/// [`RoomState`]; the facade communicates through the action channel, the
/// stop signal, and snapshot reads.
pub struct SessionManager<C: Connector> {
    connector: C,
    config: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    room: Arc<Mutex<RoomState>>,
    state: Arc<Mutex<SessionState>>,
    actions_rx: mpsc::Receiver<Command>,
    stop_rx: watch::Receiver<bool>,
    /// Outbound frame sequence counter, monotonic across reconnects
    req: u64,
    /// Consecutive failed connection lifecycles; reset once Joined
    attempts: u32,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(
        connector: C,
        config: SessionConfig,
        dispatcher: Arc<Dispatcher>,
        room: Arc<Mutex<RoomState>>,
        state: Arc<Mutex<SessionState>>,
        actions_rx: mpsc::Receiver<Command>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connector,
            config,
            dispatcher,
            room,
            state,
            actions_rx,
            stop_rx,
            req: 1,
            attempts: 0,
        }
    }

    /// Run the state machine to completion
    ///
    /// Returns when stopped, when the login handshake fails, or when the
    /// reconnect budget is exhausted. Always emits a final
    /// [`Event::Disconnected`] naming which of the three it was.
    pub async fn run(mut self) {
        loop {
            let end = self.run_session().await;
            self.set_state(SessionState::Disconnected);
            // Snapshots taken while disconnected must not show a roster
            // from the previous connection.
            {
                let mut room = self.room.lock().unwrap_or_else(|e| e.into_inner());
                *room = RoomState::new(self.config.room.clone());
            }

            match end {
                SessionEnd::Stopped => {
                    info!("session stopped");
                    self.emit_disconnected(DisconnectReason::Stopped).await;
                    return;
                }
                SessionEnd::AuthFailed(reason) => {
                    warn!("authentication failed: {}", reason);
                    self.emit_disconnected(DisconnectReason::AuthFailed(reason)).await;
                    return;
                }
                SessionEnd::Lost => {
                    if !self.config.reconnect {
                        info!("connection lost, reconnect disabled");
                        self.emit_disconnected(DisconnectReason::GaveUp { attempts: 0 }).await;
                        return;
                    }
                    if self.attempts >= self.config.max_reconnect_attempts {
                        let fatal = SessionError::ReconnectExhausted {
                            attempts: self.attempts,
                        };
                        warn!("{}", fatal);
                        self.emit_disconnected(DisconnectReason::GaveUp {
                            attempts: self.attempts,
                        })
                        .await;
                        return;
                    }

                    self.attempts += 1;
                    let delay = backoff_delay(
                        self.config.base_delay,
                        self.config.max_delay,
                        self.attempts,
                    );
                    info!(
                        "connection lost, reconnecting in {:?} (attempt {}/{})",
                        delay, self.attempts, self.config.max_reconnect_attempts
                    );
                    self.emit_disconnected(DisconnectReason::Retrying {
                        attempt: self.attempts,
                        delay,
                    })
                    .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop_requested(&mut self.stop_rx) => {
                            info!("stop requested during backoff");
                            self.emit_disconnected(DisconnectReason::Stopped).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One full connection lifecycle: connect, authenticate, join, receive
    async fn run_session(&mut self) -> SessionEnd {
        self.set_state(SessionState::Connecting);
        let mut transport = tokio::select! {
            result = self.connector.connect() => match result {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("connect failed: {}", e);
                    return SessionEnd::Lost;
                }
            },
            _ = stop_requested(&mut self.stop_rx) => return SessionEnd::Stopped,
        };

        self.set_state(SessionState::Authenticating);
        let auth_config = AuthConfig {
            nick: self.config.nick.clone(),
            account: self.config.account.clone(),
            timeout: self.config.auth_timeout,
        };
        let identity = tokio::select! {
            result = auth::authenticate(&mut transport, &mut self.req, &auth_config) => {
                match result {
                    Ok(identity) => identity,
                    Err(e) => {
                        let _ = transport.close().await;
                        return SessionEnd::AuthFailed(e.reason);
                    }
                }
            }
            _ = stop_requested(&mut self.stop_rx) => {
                let _ = transport.close().await;
                return SessionEnd::Stopped;
            }
        };
        debug!(
            "logged in as `{}`{}",
            identity.nick,
            if identity.is_guest() { " (guest)" } else { "" }
        );

        // Fresh roster per connection; nothing carries over a reconnect.
        self.set_state(SessionState::JoiningRoom);
        {
            let mut room = self.room.lock().unwrap_or_else(|e| e.into_inner());
            *room = RoomState::new(self.config.room.clone());
        }
        let join = Command::Join {
            room: self.config.room.clone(),
        };
        match codec::encode(&join, self.req) {
            Ok(frame) => {
                self.req += 1;
                if let Err(e) = transport.send(frame).await {
                    warn!("join send failed: {}", e);
                    return SessionEnd::Lost;
                }
            }
            Err(e) => {
                warn!("join command failed to encode: {}", e);
                return SessionEnd::Lost;
            }
        }

        loop {
            tokio::select! {
                _ = stop_requested(&mut self.stop_rx) => {
                    self.set_state(SessionState::Disconnecting);
                    let _ = transport.close().await;
                    return SessionEnd::Stopped;
                }
                action = self.actions_rx.recv() => {
                    let Some(cmd) = action else {
                        // Facade dropped; nothing can drive this session.
                        let _ = transport.close().await;
                        return SessionEnd::Stopped;
                    };
                    match codec::encode(&cmd, self.req) {
                        Ok(frame) => {
                            self.req += 1;
                            if let Err(e) = transport.send(frame).await {
                                warn!("send failed: {}", e);
                                return SessionEnd::Lost;
                            }
                        }
                        // The facade validates before queueing, so this
                        // only fires if an action raced a config change.
                        Err(e) => warn!("dropping invalid queued action: {}", e),
                    }
                }
                frame = transport.recv() => {
                    match frame {
                        Some(Ok(text)) => {
                            if let Some(end) = self.handle_frame(&mut transport, &text).await {
                                return end;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("transport failed: {}", e);
                            return SessionEnd::Lost;
                        }
                        None => {
                            info!("connection closed by server");
                            return SessionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Process one inbound frame: decode, apply, translate, dispatch
    ///
    /// Returns Some when the frame ends the connection lifecycle.
    async fn handle_frame(
        &mut self,
        transport: &mut C::Transport,
        text: &str,
    ) -> Option<SessionEnd> {
        let msg = match codec::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("skipping malformed frame: {}", e);
                return None;
            }
        };

        match &msg {
            Message::Ping => {
                if let Ok(pong) = codec::encode(&Command::Pong, self.req) {
                    self.req += 1;
                    if let Err(e) = transport.send(pong).await {
                        warn!("pong send failed: {}", e);
                        return Some(SessionEnd::Lost);
                    }
                }
                return None;
            }
            Message::Closed { code } => {
                info!("server closed the session: {} (code {})", close_reason(*code), code);
                return Some(SessionEnd::Lost);
            }
            Message::Unknown { kind, .. } => {
                debug!("ignoring unknown opcode `{}`", kind);
                return None;
            }
            _ => {}
        }

        let applied = {
            let mut room = self.room.lock().unwrap_or_else(|e| e.into_inner());
            room.apply(&msg)
        };

        if matches!(msg, Message::Joined { .. }) {
            self.set_state(SessionState::Joined);
            self.attempts = 0;
            info!("joined `{}`", self.config.room);
        }

        if let Some(event) = event::translate(&msg, applied) {
            self.dispatcher.dispatch(event).await;
        }
        None
    }

    async fn emit_disconnected(&self, reason: DisconnectReason) {
        self.dispatcher.dispatch(Event::Disconnected { reason }).await;
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!("session state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }
}

/// Resolve until a stop has been requested
///
/// A dropped sender counts as a stop request.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

/// Delay before reconnect attempt `attempt` (1-based)
///
/// Exponential in the attempt number, jittered by ±50% so simultaneous
/// clients do not reconnect in lockstep, and never above `max`.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    let exponential = base.saturating_mul(1 << doublings).min(max);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    exponential.mul_f64(jitter).min(max)
}

/// Human-readable meaning of a server close code
fn close_reason(code: u8) -> &'static str {
    match code {
        4 => "banned",
        8 => "timed out",
        12 => "kicked",
        _ => "unspecified",
    }
}
