//! Room state container
//!
//! Holds the client's local view of the room: user roster, broadcast
//! status, moderation flags and room metadata. State is mutated only by
//! applying decoded messages ([`RoomState::apply`]); the session owns the
//! single mutation path and external readers get snapshot clones.
//!
//! A mutation for a handle that is not in the roster inserts a defaulted
//! record instead of failing. This is a deliberate liveness-over-strictness
//! choice: the service tolerates partially ordered events, and dropping the
//! connection over a stale handle would be worse than carrying a
//! placeholder. Removals for absent handles are plain no-ops.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::codec::{Message, RoomInfo, UserInfo};
use crate::types::{Handle, UserLevel};

/// A user currently in the room
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    /// Server-assigned handle (roster key)
    pub handle: Handle,
    /// Current nick
    pub nick: String,
    /// Account name; None for guests
    pub account: Option<String>,
    /// Permission level
    pub level: UserLevel,
    /// Whether the user has an active broadcast
    pub broadcasting: bool,
    /// Whether the user is waiting in the green room
    pub waiting: bool,
    /// When this client first observed the user
    pub joined_at: Instant,
}

impl UserRecord {
    fn from_info(info: &UserInfo) -> Self {
        Self {
            handle: info.handle,
            nick: info.nick.clone(),
            account: info.account.clone(),
            level: info.level(),
            broadcasting: false,
            waiting: false,
            joined_at: Instant::now(),
        }
    }

    /// Defaulted record for a handle observed only through a mutation
    fn placeholder(handle: Handle) -> Self {
        Self {
            handle,
            nick: String::new(),
            account: None,
            level: UserLevel::Default,
            broadcasting: false,
            waiting: false,
            joined_at: Instant::now(),
        }
    }
}

/// Roster-level outcome of applying one message
///
/// Tells the session which record a message touched, with roster lookups
/// already resolved, so events can carry full [`UserRecord`]s instead of
/// bare handles.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Nothing the roster cares about
    None,
    /// The client's own record was seeded from the room snapshot
    SelfJoined(UserRecord),
    /// The initial roster arrived (client's own record excluded)
    Roster(Vec<UserRecord>),
    /// A user joined
    UserJoined(UserRecord),
    /// A user left
    UserLeft(UserRecord),
    /// A user was kicked (record already removed)
    UserKicked(UserRecord),
    /// A user changed nick
    NickChanged {
        user: UserRecord,
        old_nick: String,
    },
    /// A chat message sender, resolved
    ChatFrom(UserRecord),
    /// A private message sender, resolved
    PrivateFrom(UserRecord),
    /// A user started broadcasting
    BroadcastStarted(UserRecord),
    /// A user stopped broadcasting
    BroadcastStopped(UserRecord),
    /// A user entered the green-room wait queue
    PendingModeration(UserRecord),
    /// A waiting broadcast was approved
    BroadcastAllowed(UserRecord),
    /// A broadcast was closed by a moderator
    BroadcastClosed(UserRecord),
    /// Room flags or metadata changed
    SettingsChanged,
}

/// Local view of the joined room
///
/// Created empty at room-join, updated incrementally for the session
/// lifetime, discarded on disconnect and rebuilt fresh on reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomState {
    /// Room name the session joined
    pub room: String,
    /// Room topic
    pub topic: String,
    /// Green-room (broadcast approval) mode
    pub greenroom: bool,
    /// Whether the room requires a password
    pub password_protected: bool,
    /// Ordered roster: handle -> record
    users: BTreeMap<Handle, UserRecord>,
    /// The client's own handle, once the snapshot arrived
    self_handle: Option<Handle>,
}

impl RoomState {
    /// Create an empty state for the given room
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            topic: String::new(),
            greenroom: false,
            password_protected: false,
            users: BTreeMap::new(),
            self_handle: None,
        }
    }

    /// The full roster, ordered by handle
    pub fn users(&self) -> &BTreeMap<Handle, UserRecord> {
        &self.users
    }

    /// Look up a user by handle
    pub fn user(&self, handle: Handle) -> Option<&UserRecord> {
        self.users.get(&handle)
    }

    /// Look up a user by nick
    pub fn user_by_nick(&self, nick: &str) -> Option<&UserRecord> {
        self.users.values().find(|u| u.nick == nick)
    }

    /// The client's own record, once joined
    pub fn self_user(&self) -> Option<&UserRecord> {
        self.self_handle.and_then(|h| self.users.get(&h))
    }

    /// All users with an active broadcast
    pub fn broadcasters(&self) -> Vec<&UserRecord> {
        self.users.values().filter(|u| u.broadcasting).collect()
    }

    /// All moderators (owner included)
    pub fn moderators(&self) -> Vec<&UserRecord> {
        self.users.values().filter(|u| u.level.is_mod()).collect()
    }

    fn update_room_info(&mut self, info: &RoomInfo) {
        if !info.name.is_empty() {
            self.room = info.name.clone();
        }
        self.topic = info.topic.clone();
        self.greenroom = info.greenroom;
        self.password_protected = info.password_protected;
    }

    /// Resolve a handle, inserting a defaulted record if it is missing
    fn resolve_or_insert(&mut self, handle: Handle) -> &mut UserRecord {
        if !self.users.contains_key(&handle) {
            warn!("mutation for unknown handle {}, inserting placeholder", handle);
        }
        self.users
            .entry(handle)
            .or_insert_with(|| UserRecord::placeholder(handle))
    }

    /// Apply a decoded message to the state
    ///
    /// Unknown and irrelevant message kinds are no-ops. Returns what the
    /// message touched so the caller can build resolved events.
    pub fn apply(&mut self, msg: &Message) -> Applied {
        match msg {
            Message::Joined { user, room } => {
                let record = UserRecord::from_info(user);
                self.self_handle = Some(user.handle);
                self.users.insert(user.handle, record.clone());
                self.update_room_info(room);
                Applied::SelfJoined(record)
            }
            Message::Userlist { users } => {
                let mut roster = Vec::with_capacity(users.len());
                for info in users {
                    let record = UserRecord::from_info(info);
                    // The client's own record is already seeded by `joined`.
                    if Some(info.handle) != self.self_handle {
                        roster.push(record.clone());
                    }
                    self.users.insert(info.handle, record);
                }
                Applied::Roster(roster)
            }
            Message::Join(info) => {
                let record = UserRecord::from_info(info);
                // A re-join replaces any stale record wholesale.
                self.users.insert(info.handle, record.clone());
                Applied::UserJoined(record)
            }
            Message::Quit { handle } => match self.users.remove(handle) {
                Some(record) => Applied::UserLeft(record),
                None => Applied::None,
            },
            Message::Kick { handle } => match self.users.remove(handle) {
                Some(record) => Applied::UserKicked(record),
                None => Applied::None,
            },
            Message::Nick { handle, nick } => {
                let user = self.resolve_or_insert(*handle);
                let old_nick = std::mem::replace(&mut user.nick, nick.clone());
                Applied::NickChanged {
                    user: user.clone(),
                    old_nick,
                }
            }
            Message::Msg { handle, .. } => {
                let user = self.resolve_or_insert(*handle);
                Applied::ChatFrom(user.clone())
            }
            Message::Pvtmsg { handle, .. } => {
                let user = self.resolve_or_insert(*handle);
                Applied::PrivateFrom(user.clone())
            }
            Message::Publish { handle } => {
                let user = self.resolve_or_insert(*handle);
                user.broadcasting = true;
                user.waiting = false;
                Applied::BroadcastStarted(user.clone())
            }
            Message::Unpublish { handle } => match self.users.get_mut(handle) {
                Some(user) => {
                    user.broadcasting = false;
                    Applied::BroadcastStopped(user.clone())
                }
                // Ending a broadcast for a user we never saw is a no-op.
                None => Applied::None,
            },
            Message::PendingModeration { handle } => {
                self.greenroom = true;
                let user = self.resolve_or_insert(*handle);
                user.waiting = true;
                Applied::PendingModeration(user.clone())
            }
            Message::StreamModerAllow { handle, success } => {
                if !success {
                    return Applied::None;
                }
                let user = self.resolve_or_insert(*handle);
                user.waiting = false;
                Applied::BroadcastAllowed(user.clone())
            }
            Message::StreamModerClose { handle, success } => {
                if !success {
                    return Applied::None;
                }
                match self.users.get_mut(handle) {
                    Some(user) => {
                        user.broadcasting = false;
                        Applied::BroadcastClosed(user.clone())
                    }
                    None => Applied::None,
                }
            }
            Message::Ban { success, banned } => {
                if !success {
                    return Applied::None;
                }
                // The ban entry itself lives in the event stream; the roster
                // removal happens here when the server names the handle.
                if let Some(handle) = banned.handle {
                    if self.users.remove(&handle).is_some() {
                        debug!("removed banned handle {} from roster", handle);
                    }
                }
                Applied::None
            }
            Message::RoomSettings(info) => {
                self.update_room_info(info);
                Applied::SettingsChanged
            }
            Message::Sysmsg { text } => {
                // The service announces green-room toggles only in prose.
                if text.contains("green room enabled") {
                    self.greenroom = true;
                } else if text.contains("green room disabled") {
                    self.greenroom = false;
                }
                Applied::None
            }
            _ => Applied::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BanInfo;

    fn info(handle: u64, nick: &str) -> UserInfo {
        UserInfo {
            handle: Handle(handle),
            nick: nick.to_string(),
            account: None,
            moderator: false,
            owner: false,
            lurker: false,
        }
    }

    fn joined_msg(handle: u64, nick: &str, room: &str) -> Message {
        Message::Joined {
            user: info(handle, nick),
            room: RoomInfo {
                name: room.to_string(),
                ..RoomInfo::default()
            },
        }
    }

    #[test]
    fn test_joined_seeds_self() {
        let mut state = RoomState::new("testroom");
        let applied = state.apply(&joined_msg(1, "guest42", "testroom"));

        assert!(matches!(applied, Applied::SelfJoined(_)));
        assert_eq!(state.users().len(), 1);
        assert_eq!(state.self_user().unwrap().nick, "guest42");
    }

    #[test]
    fn test_userlist_excludes_self_from_roster() {
        let mut state = RoomState::new("testroom");
        state.apply(&joined_msg(1, "me", "testroom"));

        let applied = state.apply(&Message::Userlist {
            users: vec![info(1, "me"), info(2, "alice"), info(3, "bob")],
        });

        match applied {
            Applied::Roster(roster) => {
                assert_eq!(roster.len(), 2);
                assert!(roster.iter().all(|u| u.handle != Handle(1)));
            }
            other => panic!("wrong outcome: {:?}", other),
        }
        assert_eq!(state.users().len(), 3);
    }

    #[test]
    fn test_leave_then_join_yields_fresh_record() {
        let mut state = RoomState::new("testroom");
        state.apply(&Message::Join(info(5, "alice")));
        state.apply(&Message::Publish { handle: Handle(5) });
        assert!(state.user(Handle(5)).unwrap().broadcasting);

        state.apply(&Message::Quit { handle: Handle(5) });
        assert!(state.user(Handle(5)).is_none());

        state.apply(&Message::Join(info(5, "alice")));
        let user = state.user(Handle(5)).unwrap();
        // Exactly one record, with no stale fields from before the leave.
        assert_eq!(state.users().len(), 1);
        assert!(!user.broadcasting);
    }

    #[test]
    fn test_kick_removes_user() {
        let mut state = RoomState::new("testroom");
        state.apply(&Message::Join(info(7, "alice")));

        let applied = state.apply(&Message::Kick { handle: Handle(7) });
        match applied {
            Applied::UserKicked(user) => assert_eq!(user.nick, "alice"),
            other => panic!("wrong outcome: {:?}", other),
        }
        assert!(state.user(Handle(7)).is_none());
    }

    #[test]
    fn test_removal_for_absent_handle_is_noop() {
        let mut state = RoomState::new("testroom");
        let before = state.clone();

        assert_eq!(state.apply(&Message::Quit { handle: Handle(9) }), Applied::None);
        assert_eq!(state.apply(&Message::Kick { handle: Handle(9) }), Applied::None);
        assert_eq!(
            state.apply(&Message::Unpublish { handle: Handle(9) }),
            Applied::None
        );
        assert_eq!(state, before);
    }

    #[test]
    fn test_mutation_for_absent_handle_inserts_placeholder() {
        let mut state = RoomState::new("testroom");

        let applied = state.apply(&Message::Nick {
            handle: Handle(4),
            nick: "newnick".into(),
        });

        match applied {
            Applied::NickChanged { user, old_nick } => {
                assert_eq!(user.nick, "newnick");
                assert_eq!(old_nick, "");
            }
            other => panic!("wrong outcome: {:?}", other),
        }
        let user = state.user(Handle(4)).unwrap();
        assert_eq!(user.level, UserLevel::Default);
    }

    #[test]
    fn test_noop_messages_do_not_change_state() {
        let mut state = RoomState::new("testroom");
        state.apply(&Message::Join(info(2, "alice")));
        let before = state.clone();

        state.apply(&Message::Ping);
        state.apply(&Message::Unknown {
            kind: "yut_play".into(),
            raw: serde_json::json!({"tc": "yut_play"}),
        });
        state.apply(&Message::Sysmsg { text: "hello".into() });

        assert_eq!(state, before);
    }

    #[test]
    fn test_broadcast_lifecycle() {
        let mut state = RoomState::new("testroom");
        state.apply(&Message::Join(info(3, "bob")));

        state.apply(&Message::PendingModeration { handle: Handle(3) });
        assert!(state.greenroom);
        assert!(state.user(Handle(3)).unwrap().waiting);

        state.apply(&Message::Publish { handle: Handle(3) });
        let user = state.user(Handle(3)).unwrap();
        assert!(user.broadcasting);
        assert!(!user.waiting);
        assert_eq!(state.broadcasters().len(), 1);

        state.apply(&Message::Unpublish { handle: Handle(3) });
        assert!(state.broadcasters().is_empty());
    }

    #[test]
    fn test_failed_moderation_result_is_noop() {
        let mut state = RoomState::new("testroom");
        state.apply(&Message::Join(info(3, "bob")));
        let before = state.clone();

        let applied = state.apply(&Message::StreamModerAllow {
            handle: Handle(3),
            success: false,
        });
        assert_eq!(applied, Applied::None);
        assert_eq!(state, before);
    }

    #[test]
    fn test_ban_with_handle_removes_from_roster() {
        let mut state = RoomState::new("testroom");
        state.apply(&Message::Join(info(6, "troll")));

        state.apply(&Message::Ban {
            success: true,
            banned: BanInfo {
                id: 100,
                handle: Some(Handle(6)),
                nick: "troll".into(),
                account: None,
                banned_by: None,
            },
        });
        assert!(state.user(Handle(6)).is_none());
    }

    #[test]
    fn test_sysmsg_toggles_greenroom() {
        let mut state = RoomState::new("testroom");
        state.apply(&Message::Sysmsg {
            text: "green room enabled".into(),
        });
        assert!(state.greenroom);

        state.apply(&Message::Sysmsg {
            text: "green room disabled".into(),
        });
        assert!(!state.greenroom);
    }

    #[test]
    fn test_room_settings_update_flags() {
        let mut state = RoomState::new("testroom");
        state.apply(&Message::RoomSettings(RoomInfo {
            name: String::new(),
            topic: "welcome".into(),
            greenroom: true,
            password_protected: true,
        }));

        assert_eq!(state.room, "testroom");
        assert_eq!(state.topic, "welcome");
        assert!(state.greenroom);
        assert!(state.password_protected);
    }
}
