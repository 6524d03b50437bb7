//! Wire protocol codec
//!
//! JSON-based message protocol: every frame is an object tagged by a `tc`
//! opcode field. Outbound commands additionally carry a client-side `req`
//! sequence number injected at encode time, so the codec itself stays pure
//! and reentrant (the counter is owned by the session).
//!
//! Decoding never fails on an unrecognized opcode: such frames become
//! [`Message::Unknown`] carrying the raw payload, so the receive pipeline
//! can log and continue instead of dropping the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, EncodeError};
use crate::types::{Handle, UserLevel};

/// Maximum length of a chat or private message, in bytes
pub const MAX_TEXT_LEN: usize = 4096;

/// Maximum length of a nick, in bytes
pub const MAX_NICK_LEN: usize = 32;

/// Client → Server command
///
/// One variant per protocol opcode. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tc", rename_all = "snake_case")]
pub enum Command {
    /// Log in, either as a guest (nick only) or with an account
    Login {
        nick: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        account: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Join a room after a successful login
    Join { room: String },
    /// Change nick
    Nick { nick: String },
    /// Send a chat message to the room
    Msg { text: String },
    /// Send a private message to a user
    Pvtmsg { text: String, handle: Handle },
    /// Kick a user out of the room (moderators only)
    Kick { handle: Handle },
    /// Ban a user from the room (moderators only)
    Ban { handle: Handle },
    /// Lift a ban by its ban id (moderators only)
    Unban { id: u64 },
    /// Request the ban list (moderators only)
    Banlist,
    /// Answer a room password challenge
    Password { password: String },
    /// Allow a green-room broadcast (moderators only)
    StreamModerAllow { handle: Handle },
    /// Close a user's broadcast (moderators only)
    StreamModerClose { handle: Handle },
    /// Answer a server ping
    Pong,
}

impl Command {
    /// Validate the command without encoding it
    ///
    /// The facade calls this before queueing an action so that an invalid
    /// request fails synchronously and nothing reaches the wire.
    pub fn validate(&self) -> Result<(), EncodeError> {
        match self {
            Command::Login { nick, account, password } => {
                validate_nick(nick)?;
                if account.is_some() {
                    match password {
                        Some(p) if !p.is_empty() => {}
                        _ => return Err(EncodeError::EmptyPassword),
                    }
                }
                Ok(())
            }
            Command::Nick { nick } => validate_nick(nick),
            Command::Msg { text } | Command::Pvtmsg { text, .. } => validate_text(text),
            Command::Password { password } => {
                if password.is_empty() {
                    return Err(EncodeError::EmptyPassword);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn validate_nick(nick: &str) -> Result<(), EncodeError> {
    if nick.is_empty() {
        return Err(EncodeError::EmptyNick);
    }
    if nick.len() > MAX_NICK_LEN {
        return Err(EncodeError::NickTooLong(MAX_NICK_LEN));
    }
    Ok(())
}

fn validate_text(text: &str) -> Result<(), EncodeError> {
    if text.is_empty() {
        return Err(EncodeError::EmptyText);
    }
    if text.len() > MAX_TEXT_LEN {
        return Err(EncodeError::TextTooLong(MAX_TEXT_LEN));
    }
    Ok(())
}

/// Encode a command into a wire frame with the given `req` sequence number
///
/// Fails with [`EncodeError`] if the command does not validate; nothing is
/// produced in that case.
pub fn encode(cmd: &Command, req: u64) -> Result<String, EncodeError> {
    cmd.validate()?;

    #[derive(Serialize)]
    struct Wire<'a> {
        #[serde(flatten)]
        cmd: &'a Command,
        req: u64,
    }

    Ok(serde_json::to_string(&Wire { cmd, req })?)
}

/// User record as carried by `joined`, `join` and `userlist` frames
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserInfo {
    pub handle: Handle,
    pub nick: String,
    /// Account name; absent for guests
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default, rename = "mod")]
    pub moderator: bool,
    #[serde(default)]
    pub owner: bool,
    #[serde(default)]
    pub lurker: bool,
}

impl UserInfo {
    /// Permission level implied by the role flags
    pub fn level(&self) -> UserLevel {
        if self.owner {
            UserLevel::Owner
        } else if self.moderator {
            UserLevel::Moderator
        } else {
            UserLevel::Default
        }
    }
}

/// Room metadata as carried by `joined` and `room_settings` frames
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RoomInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub greenroom: bool,
    #[serde(default)]
    pub password_protected: bool,
}

/// A ban list entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BanInfo {
    /// Server-issued ban id, used for unbanning
    pub id: u64,
    /// Roster handle of the banned user, when the server names it
    #[serde(default)]
    pub handle: Option<Handle>,
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub banned_by: Option<String>,
}

/// Server → Client message
///
/// Produced by [`decode`] and consumed immediately by the session; frames
/// are not retained. [`Message::Unknown`] covers opcodes this client does
/// not understand.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tc", rename_all = "snake_case")]
pub enum Message {
    /// Login accepted
    LoginOk {
        #[serde(default)]
        account: Option<String>,
    },
    /// Login rejected
    LoginError { reason: String },
    /// Room joined; carries the client's own record and the room snapshot
    Joined {
        #[serde(rename = "self")]
        user: UserInfo,
        #[serde(default)]
        room: RoomInfo,
    },
    /// Roster of users already in the room, sent after `joined`
    Userlist { users: Vec<UserInfo> },
    /// A user joined the room
    Join(UserInfo),
    /// A user left the room
    Quit { handle: Handle },
    /// A user changed nick
    Nick { handle: Handle, nick: String },
    /// Public chat message
    Msg { handle: Handle, text: String },
    /// Private message to the client
    Pvtmsg { handle: Handle, text: String },
    /// A user was kicked out of the room
    Kick { handle: Handle },
    /// A user started broadcasting
    Publish { handle: Handle },
    /// A user stopped broadcasting
    Unpublish { handle: Handle },
    /// A user is waiting in the green room for broadcast approval
    PendingModeration { handle: Handle },
    /// A green-room broadcast was allowed
    StreamModerAllow {
        handle: Handle,
        #[serde(default)]
        success: bool,
    },
    /// A broadcast was closed by a moderator
    StreamModerClose {
        handle: Handle,
        #[serde(default)]
        success: bool,
    },
    /// A user was banned
    Ban {
        #[serde(default)]
        success: bool,
        #[serde(flatten)]
        banned: BanInfo,
    },
    /// A ban was lifted
    Unban {
        #[serde(default)]
        success: bool,
        id: u64,
    },
    /// The requested ban list
    Banlist { items: Vec<BanInfo> },
    /// Server-wide notification text
    Sysmsg { text: String },
    /// Room settings changed
    RoomSettings(RoomInfo),
    /// The room is password protected; answer with `Command::Password`
    Password {
        #[serde(default)]
        req: u64,
    },
    /// Server keepalive; answer with `Command::Pong`
    Ping,
    /// The server closed the session
    Closed {
        #[serde(rename = "error")]
        code: u8,
    },
    /// Opcode this client does not understand; raw payload preserved
    #[serde(skip)]
    Unknown { kind: String, raw: Value },
}

/// Whether `decode` has a typed mapping for this opcode
fn is_known_opcode(opcode: &str) -> bool {
    matches!(
        opcode,
        "login_ok"
            | "login_error"
            | "joined"
            | "userlist"
            | "join"
            | "quit"
            | "nick"
            | "msg"
            | "pvtmsg"
            | "kick"
            | "publish"
            | "unpublish"
            | "pending_moderation"
            | "stream_moder_allow"
            | "stream_moder_close"
            | "ban"
            | "unban"
            | "banlist"
            | "sysmsg"
            | "room_settings"
            | "password"
            | "ping"
            | "closed"
    )
}

/// Decode an inbound frame into a typed [`Message`]
///
/// Malformed JSON or a bad payload for a known opcode is a [`DecodeError`]
/// (the session logs and skips those). A well-formed frame with an
/// unrecognized opcode decodes to [`Message::Unknown`].
pub fn decode(raw: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    let opcode = value
        .get("tc")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingOpcode)?
        .to_string();

    if !is_known_opcode(&opcode) {
        return Ok(Message::Unknown { kind: opcode, raw: value });
    }

    serde_json::from_value::<Message>(value)
        .map_err(|source| DecodeError::BadPayload { opcode, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_injects_opcode_and_req() {
        let json = encode(&Command::Msg { text: "hello".into() }, 7).unwrap();
        assert!(json.contains("\"tc\":\"msg\""));
        assert!(json.contains("\"req\":7"));
        assert!(json.contains("\"text\":\"hello\""));
    }

    #[test]
    fn test_encode_guest_login_omits_account() {
        let cmd = Command::Login {
            nick: "guest42".into(),
            account: None,
            password: None,
        };
        let json = encode(&cmd, 1).unwrap();
        assert!(!json.contains("account"));
        assert!(!json.contains("password"));
    }

    #[test]
    fn test_encode_empty_text_fails() {
        let err = encode(&Command::Msg { text: String::new() }, 1).unwrap_err();
        assert!(matches!(err, EncodeError::EmptyText));
    }

    #[test]
    fn test_encode_oversized_text_fails() {
        let text = "x".repeat(MAX_TEXT_LEN + 1);
        let err = encode(&Command::Msg { text }, 1).unwrap_err();
        assert!(matches!(err, EncodeError::TextTooLong(_)));
    }

    #[test]
    fn test_encode_empty_nick_fails() {
        let err = encode(&Command::Nick { nick: String::new() }, 1).unwrap_err();
        assert!(matches!(err, EncodeError::EmptyNick));
    }

    #[test]
    fn test_encode_account_without_password_fails() {
        let cmd = Command::Login {
            nick: "bob".into(),
            account: Some("bob".into()),
            password: None,
        };
        assert!(matches!(
            cmd.validate().unwrap_err(),
            EncodeError::EmptyPassword
        ));
    }

    #[test]
    fn test_decode_chat_message() {
        let msg = decode(r#"{"tc":"msg","handle":12,"text":"hi there"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Msg {
                handle: Handle(12),
                text: "hi there".into()
            }
        );
    }

    #[test]
    fn test_decode_joined_snapshot() {
        let raw = r#"{
            "tc": "joined",
            "self": {"handle": 3, "nick": "guest42", "mod": false},
            "room": {"name": "testroom", "greenroom": true}
        }"#;
        match decode(raw).unwrap() {
            Message::Joined { user, room } => {
                assert_eq!(user.handle, Handle(3));
                assert_eq!(user.nick, "guest42");
                assert_eq!(user.level(), UserLevel::Default);
                assert_eq!(room.name, "testroom");
                assert!(room.greenroom);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_owner_level() {
        let raw = r#"{"tc":"join","handle":9,"nick":"boss","owner":true}"#;
        match decode(raw).unwrap() {
            Message::Join(user) => assert_eq!(user.level(), UserLevel::Owner),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_opcode_is_not_an_error() {
        let msg = decode(r#"{"tc":"yut_play","item":{"id":"abc"}}"#).unwrap();
        match msg {
            Message::Unknown { kind, raw } => {
                assert_eq!(kind, "yut_play");
                assert_eq!(raw["item"]["id"], "abc");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_json_fails() {
        assert!(matches!(decode("not json"), Err(DecodeError::BadJson(_))));
    }

    #[test]
    fn test_decode_missing_opcode_fails() {
        assert!(matches!(
            decode(r#"{"text":"hi"}"#),
            Err(DecodeError::MissingOpcode)
        ));
    }

    #[test]
    fn test_decode_bad_payload_for_known_opcode_fails() {
        let err = decode(r#"{"tc":"msg","handle":"not-a-number"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::BadPayload { .. }));
    }

    #[test]
    fn test_round_trip_symmetric_commands() {
        // Kinds whose outbound and inbound payloads share a shape must be
        // value-preserving across encode -> decode.
        let json = encode(&Command::Kick { handle: Handle(5) }, 2).unwrap();
        assert_eq!(decode(&json).unwrap(), Message::Kick { handle: Handle(5) });

        let json = encode(
            &Command::Pvtmsg {
                text: "psst".into(),
                handle: Handle(8),
            },
            3,
        )
        .unwrap();
        assert_eq!(
            decode(&json).unwrap(),
            Message::Pvtmsg {
                handle: Handle(8),
                text: "psst".into()
            }
        );

        let json = encode(&Command::Unban { id: 44 }, 4).unwrap();
        match decode(&json).unwrap() {
            Message::Unban { id, .. } => assert_eq!(id, 44),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_decode_closed_code() {
        let msg = decode(r#"{"tc":"closed","error":12}"#).unwrap();
        assert_eq!(msg, Message::Closed { code: 12 });
    }

    #[test]
    fn test_decode_ping() {
        assert_eq!(decode(r#"{"tc":"ping"}"#).unwrap(), Message::Ping);
    }
}
