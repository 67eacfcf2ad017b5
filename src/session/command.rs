//! Outgoing command documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::endpoint::sha1_hex;

/// Server operations this client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Api {
    /// `user.authenticate`
    Authenticate,
    /// `presence.update`
    PresenceUpdate,
    /// `room.register`
    RoomRegister,
    /// `room.deregister`
    RoomDeregister,
    /// `room.speak`
    RoomSpeak,
    /// `room.vote`
    RoomVote,
    /// `room.add_dj`
    AddDj,
    /// `room.rem_dj`
    RemoveDj,
    /// `room.add_moderator`
    AddModerator,
    /// `room.rem_moderator`
    RemoveModerator,
    /// `room.boot_user`
    BootUser,
    /// `room.list_rooms`
    ListRooms,
    /// `room.info`
    RoomInfo,
    /// `room.now`
    RoomNow,
    /// `user.modify`
    UserModify,
    /// `user.set_avatar`
    SetAvatar,
    /// `user.modify_profile`
    ModifyProfile,
    /// `user.info`
    UserInfo,
    /// `user.get_profile`
    UserProfile,
    /// `user.become_fan`
    BecomeFan,
    /// `user.remove_fan`
    RemoveFan,
}

impl Api {
    /// Wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Api::Authenticate => "user.authenticate",
            Api::PresenceUpdate => "presence.update",
            Api::RoomRegister => "room.register",
            Api::RoomDeregister => "room.deregister",
            Api::RoomSpeak => "room.speak",
            Api::RoomVote => "room.vote",
            Api::AddDj => "room.add_dj",
            Api::RemoveDj => "room.rem_dj",
            Api::AddModerator => "room.add_moderator",
            Api::RemoveModerator => "room.rem_moderator",
            Api::BootUser => "room.boot_user",
            Api::ListRooms => "room.list_rooms",
            Api::RoomInfo => "room.info",
            Api::RoomNow => "room.now",
            Api::UserModify => "user.modify",
            Api::SetAvatar => "user.set_avatar",
            Api::ModifyProfile => "user.modify_profile",
            Api::UserInfo => "user.info",
            Api::UserProfile => "user.get_profile",
            Api::BecomeFan => "user.become_fan",
            Api::RemoveFan => "user.remove_fan",
        }
    }
}

/// Who is sending: stamped onto every envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Per-session client id, fixed at construction
    pub client_id: String,
    /// Account id
    pub user_id: String,
    /// Auth token
    pub auth_token: String,
}

impl Identity {
    /// Derive a client id from the current time and a random salt.
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Identity {
            client_id: format!("{}-{}", millis, rand::random::<f64>()),
            user_id: user_id.into(),
            auth_token: auth_token.into(),
        }
    }
}

/// One command before correlation.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    api: Api,
    fields: Map<String, Value>,
}

impl Command {
    /// Start a command for `api` with no fields.
    pub fn new(api: Api) -> Self {
        Command {
            api,
            fields: Map::new(),
        }
    }

    /// Add an operation-specific field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// The operation.
    pub fn api(&self) -> Api {
        self.api
    }

    /// Look up a field set on this command.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Build the wire document with correlation id and identity.
    ///
    /// A `userid` already present (profile and info lookups for another
    /// user) is kept.
    pub fn into_envelope(self, msgid: u64, identity: &Identity) -> Value {
        let mut document = self.fields;
        document.insert("api".to_string(), Value::from(self.api.as_str()));
        document.insert("msgid".to_string(), Value::from(msgid));
        document.insert("clientid".to_string(), Value::from(identity.client_id.as_str()));
        document
            .entry("userid")
            .or_insert_with(|| Value::from(identity.user_id.as_str()));
        document.insert("userauth".to_string(), Value::from(identity.auth_token.as_str()));
        Value::Object(document)
    }
}

/// Vote direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    /// Awesome
    Up,
    /// Lame
    Down,
}

impl VoteDirection {
    /// Wire value (`up` / `down`).
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteDirection::Up => "up",
            VoteDirection::Down => "down",
        }
    }
}

/// Build a `room.vote` command.
///
/// `vh`, `th` and `ph` are digests the server expects to be present; only
/// `vh` depends on the vote itself.
pub fn vote_command(room_id: &str, track_id: &str, direction: VoteDirection) -> Command {
    let value = direction.as_str();
    Command::new(Api::RoomVote)
        .with("roomid", room_id)
        .with("val", value)
        .with("vh", sha1_hex(&format!("{room_id}{value}{track_id}")))
        .with("th", sha1_hex(&rand::random::<f64>().to_string()))
        .with("ph", sha1_hex(&rand::random::<f64>().to_string()))
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(|s| s.trim().is_empty())
}

/// Public profile fields for `user.modify_profile`.
///
/// Only fields holding non-blank text are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Display name
    #[serde(skip_serializing_if = "is_blank")]
    pub name: Option<String>,
    /// Twitter handle
    #[serde(skip_serializing_if = "is_blank")]
    pub twitter: Option<String>,
    /// Facebook page
    #[serde(skip_serializing_if = "is_blank")]
    pub facebook: Option<String>,
    /// Website URL
    #[serde(skip_serializing_if = "is_blank")]
    pub website: Option<String>,
    /// Free-form about text
    #[serde(skip_serializing_if = "is_blank")]
    pub about: Option<String>,
    /// Favourite artists
    #[serde(skip_serializing_if = "is_blank")]
    pub topartists: Option<String>,
    /// Hang-out spots
    #[serde(skip_serializing_if = "is_blank")]
    pub hangout: Option<String>,
}

/// Build a `user.modify_profile` command.
pub fn profile_command(profile: &Profile) -> Command {
    let mut command = Command::new(Api::ModifyProfile);
    if let Ok(Value::Object(fields)) = serde_json::to_value(profile) {
        command.fields.extend(fields);
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity {
            client_id: "1300000000000-0.5".to_string(),
            user_id: "u1".to_string(),
            auth_token: "auth+live+x".to_string(),
        }
    }

    #[test]
    fn test_envelope_injects_shared_fields() {
        let envelope = Command::new(Api::RoomSpeak)
            .with("roomid", "r1")
            .with("text", "hi")
            .into_envelope(3, &identity());

        assert_eq!(
            envelope,
            json!({
                "api": "room.speak",
                "msgid": 3,
                "clientid": "1300000000000-0.5",
                "userid": "u1",
                "userauth": "auth+live+x",
                "roomid": "r1",
                "text": "hi",
            })
        );
    }

    #[test]
    fn test_envelope_keeps_explicit_userid() {
        let envelope = Command::new(Api::UserProfile)
            .with("userid", "someone-else")
            .into_envelope(0, &identity());
        assert_eq!(envelope["userid"], "someone-else");
    }

    #[test]
    fn test_client_id_shape() {
        let a = Identity::new("u", "t");
        let (millis, salt) = a.client_id.split_once('-').unwrap();
        assert!(millis.parse::<u128>().is_ok());
        assert!(salt.parse::<f64>().is_ok());
    }

    #[test]
    fn test_vote_fields() {
        let command = vote_command("r1", "t1", VoteDirection::Up);
        assert_eq!(command.api(), Api::RoomVote);
        assert_eq!(command.field("val"), Some(&json!("up")));
        assert_eq!(command.field("vh"), Some(&json!(sha1_hex("r1upt1"))));
        for key in ["th", "ph"] {
            let digest = command.field(key).and_then(Value::as_str).unwrap();
            assert_eq!(digest.len(), 40);
            assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_profile_sends_only_filled_fields() {
        let profile = Profile {
            name: Some("DJ Rust".to_string()),
            website: Some("https://example.org".to_string()),
            about: Some("   ".to_string()),
            ..Profile::default()
        };
        let envelope = profile_command(&profile).into_envelope(1, &identity());

        assert_eq!(envelope["api"], "user.modify_profile");
        assert_eq!(envelope["name"], "DJ Rust");
        assert_eq!(envelope["website"], "https://example.org");
        assert!(envelope.get("about").is_none());
        assert!(envelope.get("twitter").is_none());
    }

    #[test]
    fn test_vote_direction_serde() {
        assert_eq!(serde_json::to_value(VoteDirection::Down).unwrap(), json!("down"));
    }
}
