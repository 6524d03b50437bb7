//! Application-facing events and their dispatcher
//!
//! A decoded message becomes an [`Event`] carrying resolved room state
//! (full [`UserRecord`]s rather than bare handles). The [`Dispatcher`]
//! delivers events to registered async handlers with two guarantees:
//!
//! - Events derived from one connection are delivered in decode order, and
//!   handlers for a kind run sequentially in registration order.
//! - A failing handler is reported to the error sink and never blocks the
//!   remaining handlers or later events.
//!
//! Registrations made while a dispatch is in flight take effect from the
//! next dispatch: the handler list is snapshotted under a short-lived lock
//! before any handler runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::codec::{BanInfo, Message};
use crate::error::{AuthFailure, HandlerError};
use crate::room::{Applied, UserRecord};
use crate::types::HandlerId;

/// Why the session left the Joined state
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// stop() was called; no reconnect follows
    Stopped,
    /// Abnormal connection loss; a reconnect attempt follows after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// The reconnect budget is exhausted; the session stays down
    GaveUp { attempts: u32 },
    /// The login handshake was rejected; not retried automatically
    AuthFailed(AuthFailure),
}

/// An application-facing notification
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The session reached the Joined state
    SessionJoined { user: UserRecord, room: String },
    /// The initial roster arrived
    Roster { users: Vec<UserRecord> },
    /// A user joined the room
    UserJoined { user: UserRecord },
    /// A user left the room
    UserLeft { user: UserRecord },
    /// A user was kicked out of the room
    UserKicked { user: UserRecord },
    /// A user changed nick
    NickChanged { user: UserRecord, old_nick: String },
    /// Public chat message
    ChatMessage { user: UserRecord, text: String },
    /// Private message to this client
    PrivateMessage { user: UserRecord, text: String },
    /// A user started broadcasting
    BroadcastStarted { user: UserRecord },
    /// A user stopped broadcasting
    BroadcastStopped { user: UserRecord },
    /// A user is waiting for broadcast approval
    PendingModeration { user: UserRecord },
    /// A waiting broadcast was approved
    BroadcastAllowed { user: UserRecord },
    /// A broadcast was closed by a moderator
    BroadcastClosed { user: UserRecord },
    /// A user was banned
    BanAdded { ban: BanInfo },
    /// A ban was lifted
    BanRemoved { id: u64 },
    /// The requested ban list arrived
    Banlist { items: Vec<BanInfo> },
    /// Server-wide notification text
    SystemMessage { text: String },
    /// Room flags or metadata changed
    RoomSettingsChanged,
    /// The room wants a password before completing the join
    PasswordRequired,
    /// The session left the Joined state; the reason distinguishes a clean
    /// stop, a pending retry, and giving up
    Disconnected { reason: DisconnectReason },
}

/// Field-less discriminant of [`Event`], used as the registration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionJoined,
    Roster,
    UserJoined,
    UserLeft,
    UserKicked,
    NickChanged,
    ChatMessage,
    PrivateMessage,
    BroadcastStarted,
    BroadcastStopped,
    PendingModeration,
    BroadcastAllowed,
    BroadcastClosed,
    BanAdded,
    BanRemoved,
    Banlist,
    SystemMessage,
    RoomSettingsChanged,
    PasswordRequired,
    Disconnected,
}

impl Event {
    /// The registration key for this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SessionJoined { .. } => EventKind::SessionJoined,
            Event::Roster { .. } => EventKind::Roster,
            Event::UserJoined { .. } => EventKind::UserJoined,
            Event::UserLeft { .. } => EventKind::UserLeft,
            Event::UserKicked { .. } => EventKind::UserKicked,
            Event::NickChanged { .. } => EventKind::NickChanged,
            Event::ChatMessage { .. } => EventKind::ChatMessage,
            Event::PrivateMessage { .. } => EventKind::PrivateMessage,
            Event::BroadcastStarted { .. } => EventKind::BroadcastStarted,
            Event::BroadcastStopped { .. } => EventKind::BroadcastStopped,
            Event::PendingModeration { .. } => EventKind::PendingModeration,
            Event::BroadcastAllowed { .. } => EventKind::BroadcastAllowed,
            Event::BroadcastClosed { .. } => EventKind::BroadcastClosed,
            Event::BanAdded { .. } => EventKind::BanAdded,
            Event::BanRemoved { .. } => EventKind::BanRemoved,
            Event::Banlist { .. } => EventKind::Banlist,
            Event::SystemMessage { .. } => EventKind::SystemMessage,
            Event::RoomSettingsChanged => EventKind::RoomSettingsChanged,
            Event::PasswordRequired => EventKind::PasswordRequired,
            Event::Disconnected { .. } => EventKind::Disconnected,
        }
    }
}

/// Translate a decoded message plus its roster outcome into an event
///
/// Returns None for messages the application never sees (pings, login
/// frames, no-ops). State update strictly precedes this call, so events
/// always carry post-update records.
pub(crate) fn translate(msg: &Message, applied: Applied) -> Option<Event> {
    match applied {
        Applied::SelfJoined(user) => {
            let room = match msg {
                Message::Joined { room, .. } if !room.name.is_empty() => room.name.clone(),
                _ => String::new(),
            };
            Some(Event::SessionJoined { user, room })
        }
        Applied::Roster(users) => Some(Event::Roster { users }),
        Applied::UserJoined(user) => Some(Event::UserJoined { user }),
        Applied::UserLeft(user) => Some(Event::UserLeft { user }),
        Applied::UserKicked(user) => Some(Event::UserKicked { user }),
        Applied::NickChanged { user, old_nick } => Some(Event::NickChanged { user, old_nick }),
        Applied::ChatFrom(user) => match msg {
            Message::Msg { text, .. } => Some(Event::ChatMessage {
                user,
                text: text.clone(),
            }),
            _ => None,
        },
        Applied::PrivateFrom(user) => match msg {
            Message::Pvtmsg { text, .. } => Some(Event::PrivateMessage {
                user,
                text: text.clone(),
            }),
            _ => None,
        },
        Applied::BroadcastStarted(user) => Some(Event::BroadcastStarted { user }),
        Applied::BroadcastStopped(user) => Some(Event::BroadcastStopped { user }),
        Applied::PendingModeration(user) => Some(Event::PendingModeration { user }),
        Applied::BroadcastAllowed(user) => Some(Event::BroadcastAllowed { user }),
        Applied::BroadcastClosed(user) => Some(Event::BroadcastClosed { user }),
        Applied::SettingsChanged => Some(Event::RoomSettingsChanged),
        Applied::None => match msg {
            Message::Ban { success: true, banned } => Some(Event::BanAdded {
                ban: banned.clone(),
            }),
            Message::Unban { success: true, id } => Some(Event::BanRemoved { id: *id }),
            Message::Banlist { items } => Some(Event::Banlist {
                items: items.clone(),
            }),
            Message::Sysmsg { text } => Some(Event::SystemMessage { text: text.clone() }),
            Message::Password { .. } => Some(Event::PasswordRequired),
            _ => None,
        },
    }
}

/// Boxed async event handler
pub type BoxedHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Sink receiving handler failures; defaults to a tracing warning
pub type ErrorSink = Arc<dyn Fn(EventKind, HandlerError) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    handler: BoxedHandler,
}

/// Ordered, isolated event delivery
///
/// The handlers table is behind a std mutex that is only held to snapshot
/// or mutate the registration lists, never across an await.
pub struct Dispatcher {
    handlers: Mutex<HashMap<EventKind, Vec<Registration>>>,
    error_sink: Mutex<ErrorSink>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with the default (logging) error sink
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            error_sink: Mutex::new(Arc::new(|kind, err| {
                warn!("handler for {:?} failed: {}", kind, err);
            })),
        }
    }

    /// Register a handler for an event kind
    ///
    /// Handlers for the same kind run sequentially in registration order.
    /// Returns the token to pass to [`Dispatcher::off`].
    pub fn on<F, Fut>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let id = HandlerId::new();
        let boxed: BoxedHandler = Arc::new(move |event| Box::pin(handler(event)));
        let mut table = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        table.entry(kind).or_default().push(Registration { id, handler: boxed });
        id
    }

    /// Remove a previously registered handler
    ///
    /// Returns false if the token was not registered for that kind.
    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut table = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        match table.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|r| r.id != id);
                list.len() < before
            }
            None => false,
        }
    }

    /// Replace the handler error sink
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.error_sink.lock().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    /// Number of handlers registered for a kind
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver one event to all handlers registered for its kind
    ///
    /// Awaits each handler in turn; a failure goes to the error sink and
    /// delivery continues with the next handler.
    pub async fn dispatch(&self, event: Event) {
        let kind = event.kind();
        let snapshot: Vec<Registration> = {
            let table = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            table.get(&kind).cloned().unwrap_or_default()
        };

        if snapshot.is_empty() {
            debug!("no handlers for {:?}", kind);
            return;
        }

        for registration in snapshot {
            if let Err(err) = (registration.handler)(event.clone()).await {
                let sink = self
                    .error_sink
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                sink(kind, err);
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Dispatcher")
            .field("kinds", &table.len())
            .finish()
    }
}
