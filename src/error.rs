//! Error types for the chat client
//!
//! Mirrors the propagation policy of the session engine: transient
//! transport and decode errors are absorbed into state transitions, while
//! `EncodeError`, `PermissionError` and `SessionError` surface synchronously
//! from facade calls. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Errors establishing the websocket connection (network-level, retryable)
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The connect attempt did not complete within the configured timeout
    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The websocket handshake or underlying TCP connect failed
    #[error("websocket connect failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error while connecting
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reason the login handshake was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Account name or password was not accepted
    InvalidCredentials,
    /// The requested nick is already in use
    NickTaken,
    /// The server is rate limiting login attempts
    RateLimited,
    /// No login response within the auth timeout
    Timeout,
    /// The server sent something other than a login response
    Protocol,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthFailure::InvalidCredentials => "invalid credentials",
            AuthFailure::NickTaken => "nick taken",
            AuthFailure::RateLimited => "rate limited",
            AuthFailure::Timeout => "timeout",
            AuthFailure::Protocol => "protocol error",
        };
        f.write_str(s)
    }
}

/// Login handshake failure (not auto-retried)
#[derive(Debug, Error)]
#[error("authentication failed: {reason}")]
pub struct AuthError {
    /// Why the handshake failed
    pub reason: AuthFailure,
}

impl AuthError {
    /// Create an auth error with the given reason
    pub fn new(reason: AuthFailure) -> Self {
        Self { reason }
    }
}

/// Malformed inbound frame (logged and skipped, non-fatal)
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame was not valid JSON
    #[error("invalid JSON frame: {0}")]
    BadJson(#[from] serde_json::Error),

    /// The frame had no string `tc` opcode field
    #[error("frame has no opcode field")]
    MissingOpcode,

    /// The payload did not match the shape expected for its opcode
    #[error("bad payload for `{opcode}`: {source}")]
    BadPayload {
        /// The opcode whose payload failed to parse
        opcode: String,
        /// The underlying deserialization error
        source: serde_json::Error,
    },
}

/// Invalid outbound request (surfaced to the caller, nothing sent)
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A nick must not be empty
    #[error("nick must not be empty")]
    EmptyNick,

    /// Nick exceeds the protocol limit
    #[error("nick exceeds {0} characters")]
    NickTooLong(usize),

    /// A chat or private message must carry text
    #[error("message text must not be empty")]
    EmptyText,

    /// Message text exceeds the protocol limit
    #[error("message text exceeds {0} characters")]
    TextTooLong(usize),

    /// A room password must not be empty
    #[error("password must not be empty")]
    EmptyPassword,

    /// JSON serialization failed
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Client-side permission pre-check failure
///
/// Raised before anything is sent when the authenticated identity's
/// last-known role does not allow a moderation action.
#[derive(Debug, Error)]
#[error("action `{action}` requires moderator rights")]
pub struct PermissionError {
    /// The action that was refused
    pub action: &'static str,
}

/// Transport-level failures after the connection is established
#[derive(Debug, Error)]
pub enum TransportError {
    /// Send attempted while the connection is not open
    #[error("not connected")]
    NotConnected,

    /// No pong arrived within the keepalive window
    #[error("keepalive timed out")]
    KeepaliveTimeout,

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Fatal session failures surfaced to the client facade
#[derive(Debug, Error)]
pub enum SessionError {
    /// The reconnect budget was exhausted
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Number of failed attempts made
        attempts: u32,
    },

    /// start() called while a session task is already running
    #[error("session already running")]
    AlreadyRunning,

    /// An action was attempted with no session task running
    #[error("session not running")]
    NotRunning,
}

/// Error returned by a user-registered event handler
///
/// Opaque to the engine: it is reported to the error sink and never
/// propagates into the session state machine.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error from any displayable value
    pub fn new(msg: impl std::fmt::Display) -> Self {
        Self(msg.to_string())
    }
}

/// Errors returned by facade action methods
#[derive(Debug, Error)]
pub enum ActionError {
    /// The request failed validation before encoding
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The identity lacks rights for the action
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// The session is not in a state that can carry the action
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_display() {
        let err = AuthError::new(AuthFailure::NickTaken);
        assert_eq!(err.to_string(), "authentication failed: nick taken");
    }

    #[test]
    fn test_permission_error_display() {
        let err = PermissionError { action: "kick" };
        assert!(err.to_string().contains("kick"));
    }

    #[test]
    fn test_action_error_from_encode() {
        let err: ActionError = EncodeError::EmptyText.into();
        assert!(matches!(err, ActionError::Encode(EncodeError::EmptyText)));
    }
}
