//! Basic type definitions for the chat client
//!
//! Provides newtype wrappers for type safety:
//! - `Handle`: server-assigned unique user identifier within a room
//! - `HandlerId`: UUID-based token identifying an event handler registration

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned user handle (newtype pattern)
///
/// Every user in a room is identified by a numeric handle issued by the
/// server for the duration of the session. Distinct from an account name.
/// Implements Ord and Hash for use as map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event handler registration token (newtype pattern)
///
/// Returned by `Client::on` and accepted by `Client::off` to remove a
/// previously registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub Uuid);

impl HandlerId {
    /// Create a new random handler ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permission level of a room user
///
/// Owners implicitly hold moderator rights; `is_mod` is the gate used for
/// client-side permission pre-checks on moderation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserLevel {
    /// Regular user with no special rights
    #[default]
    Default,
    /// Room moderator (can kick, ban, manage broadcasts)
    Moderator,
    /// Room owner
    Owner,
}

impl UserLevel {
    /// Whether this level grants moderation rights
    pub fn is_mod(self) -> bool {
        matches!(self, UserLevel::Moderator | UserLevel::Owner)
    }
}

/// Generate a random guest nick of the form `guest-xxxxxx`
///
/// Used when a client is constructed without an explicit nick.
pub fn random_guest_nick() -> String {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("guest-{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_id_unique() {
        let id1 = HandlerId::new();
        let id2 = HandlerId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_handle_ordering() {
        assert!(Handle(1) < Handle(2));
        assert_eq!(Handle(7), Handle(7));
    }

    #[test]
    fn test_user_level_is_mod() {
        assert!(!UserLevel::Default.is_mod());
        assert!(UserLevel::Moderator.is_mod());
        assert!(UserLevel::Owner.is_mod());
    }

    #[test]
    fn test_guest_nick_format() {
        let nick = random_guest_nick();
        assert!(nick.starts_with("guest-"));
        assert_eq!(nick.len(), "guest-".len() + 6);
    }
}
