//! Login handshake
//!
//! Runs the fixed message exchange on top of an open transport: send one
//! `login` command, then read frames until the server accepts or rejects
//! it, bounded by the configured timeout. Retry policy deliberately lives
//! in the session, never here.

use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::{self, Command, Message};
use crate::error::{AuthError, AuthFailure};
use crate::transport::Transport;

/// Credentials and bounds for one handshake attempt
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Nick to enter with
    pub nick: String,
    /// Account name + password; None logs in as a guest
    pub account: Option<(String, String)>,
    /// How long to wait for a login response
    pub timeout: Duration,
}

/// The identity the server acknowledged
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// Nick the session entered with
    pub nick: String,
    /// Account name, once the server confirmed it; None for guests
    pub account: Option<String>,
}

impl Identity {
    /// Whether this is a guest identity
    pub fn is_guest(&self) -> bool {
        self.account.is_none()
    }
}

/// Perform the login handshake on an open transport
///
/// `req` is the session-owned outbound sequence counter. Fails with
/// [`AuthError`] carrying one of the handshake failure reasons; the caller
/// decides whether and how to retry.
pub async fn authenticate<T: Transport>(
    transport: &mut T,
    req: &mut u64,
    config: &AuthConfig,
) -> Result<Identity, AuthError> {
    let (account, password) = match &config.account {
        Some((account, password)) => (Some(account.clone()), Some(password.clone())),
        None => (None, None),
    };

    let login = Command::Login {
        nick: config.nick.clone(),
        account,
        password,
    };

    let frame = codec::encode(&login, *req).map_err(|e| {
        warn!("login command failed to encode: {}", e);
        AuthError::new(AuthFailure::Protocol)
    })?;
    *req += 1;

    transport.send(frame).await.map_err(|e| {
        warn!("login send failed: {}", e);
        AuthError::new(AuthFailure::Protocol)
    })?;

    debug!("login sent for nick `{}`, awaiting response", config.nick);

    match tokio::time::timeout(config.timeout, await_response(transport, req, config)).await {
        Ok(result) => result,
        Err(_) => Err(AuthError::new(AuthFailure::Timeout)),
    }
}

/// Read frames until a login response arrives
async fn await_response<T: Transport>(
    transport: &mut T,
    req: &mut u64,
    config: &AuthConfig,
) -> Result<Identity, AuthError> {
    loop {
        let frame = match transport.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("transport failed during handshake: {}", e);
                return Err(AuthError::new(AuthFailure::Protocol));
            }
            None => {
                warn!("connection closed during handshake");
                return Err(AuthError::new(AuthFailure::Protocol));
            }
        };

        let msg = match codec::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("skipping malformed frame during handshake: {}", e);
                continue;
            }
        };

        match msg {
            Message::LoginOk { account } => {
                debug!("login accepted");
                return Ok(Identity {
                    nick: config.nick.clone(),
                    account,
                });
            }
            Message::LoginError { reason } => {
                return Err(AuthError::new(failure_from_reason(&reason)));
            }
            Message::Ping => {
                // Keep the connection alive even mid-handshake.
                if let Ok(pong) = codec::encode(&Command::Pong, *req) {
                    *req += 1;
                    let _ = transport.send(pong).await;
                }
            }
            // Frames from a future protocol revision are harmless here.
            Message::Unknown { kind, .. } => {
                debug!("ignoring `{}` during handshake", kind);
            }
            other => {
                warn!("unexpected frame during handshake: {:?}", other);
                return Err(AuthError::new(AuthFailure::Protocol));
            }
        }
    }
}

/// Map the server's rejection reason string to a typed failure
fn failure_from_reason(reason: &str) -> AuthFailure {
    match reason {
        "invalid_credentials" | "bad_password" => AuthFailure::InvalidCredentials,
        "nick_taken" => AuthFailure::NickTaken,
        "rate_limited" => AuthFailure::RateLimited,
        other => {
            warn!("unrecognized login rejection `{}`", other);
            AuthFailure::Protocol
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    fn guest_config() -> AuthConfig {
        AuthConfig {
            nick: "guest42".into(),
            account: None,
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_guest_login_accepted() {
        let (mut transport, sent, _) = MockTransport::scripted(vec![r#"{"tc":"login_ok"}"#]);
        let mut req = 1;

        let identity = authenticate(&mut transport, &mut req, &guest_config())
            .await
            .unwrap();

        assert_eq!(identity.nick, "guest42");
        assert!(identity.is_guest());
        assert_eq!(req, 2);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"tc\":\"login\""));
        assert!(sent[0].contains("\"nick\":\"guest42\""));
    }

    #[tokio::test]
    async fn test_account_login_carries_credentials() {
        let (mut transport, sent, _) =
            MockTransport::scripted(vec![r#"{"tc":"login_ok","account":"bob"}"#]);
        let mut req = 1;
        let config = AuthConfig {
            nick: "bob".into(),
            account: Some(("bob".into(), "secret".into())),
            timeout: Duration::from_millis(200),
        };

        let identity = authenticate(&mut transport, &mut req, &config)
            .await
            .unwrap();

        assert_eq!(identity.account.as_deref(), Some("bob"));
        assert!(sent.lock().unwrap()[0].contains("\"password\":\"secret\""));
    }

    #[tokio::test]
    async fn test_rejection_reasons_are_mapped() {
        for (reason, expected) in [
            ("invalid_credentials", AuthFailure::InvalidCredentials),
            ("nick_taken", AuthFailure::NickTaken),
            ("rate_limited", AuthFailure::RateLimited),
            ("something_new", AuthFailure::Protocol),
        ] {
            let frame = format!(r#"{{"tc":"login_error","reason":"{}"}}"#, reason);
            let (mut transport, _, _) = MockTransport::scripted(vec![&frame]);
            let mut req = 1;

            let err = authenticate(&mut transport, &mut req, &guest_config())
                .await
                .unwrap_err();
            assert_eq!(err.reason, expected);
        }
    }

    #[tokio::test]
    async fn test_no_response_times_out() {
        // Empty script: recv hangs until the timeout fires.
        let (mut transport, _, _) = MockTransport::scripted(vec![]);
        let mut req = 1;

        let err = authenticate(&mut transport, &mut req, &guest_config())
            .await
            .unwrap_err();
        assert_eq!(err.reason, AuthFailure::Timeout);
    }

    #[tokio::test]
    async fn test_ping_and_unknown_frames_are_tolerated() {
        let (mut transport, sent, _) = MockTransport::scripted(vec![
            r#"{"tc":"ping"}"#,
            r#"{"tc":"motd","text":"welcome"}"#,
            r#"{"tc":"login_ok"}"#,
        ]);
        let mut req = 1;

        assert!(authenticate(&mut transport, &mut req, &guest_config())
            .await
            .is_ok());

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("\"tc\":\"pong\""));
    }

    #[tokio::test]
    async fn test_closed_connection_is_protocol_error() {
        let (mut transport, _, _) = MockTransport::new(vec![None]);
        let mut req = 1;

        let err = authenticate(&mut transport, &mut req, &guest_config())
            .await
            .unwrap_err();
        assert_eq!(err.reason, AuthFailure::Protocol);
    }
}
