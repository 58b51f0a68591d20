use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Locally-unique identifier of one connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub const ROOM_NAME_MAX_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidRoomName {
    #[error("room name is empty")]
    Empty,
    #[error("room name exceeds {ROOM_NAME_MAX_LEN} bytes")]
    TooLong,
    #[error("room name contains {0:?}")]
    BadChar(char),
}

/// Stable room identifier, unique across the service. Lowercase ASCII
/// alphanumerics plus `-` and `_`, at most [`ROOM_NAME_MAX_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomName {
    type Error = InvalidRoomName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(InvalidRoomName::Empty);
        }
        if value.len() > ROOM_NAME_MAX_LEN {
            return Err(InvalidRoomName::TooLong);
        }
        if let Some(c) = value
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_'))
        {
            return Err(InvalidRoomName::BadChar(c));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }
}

impl std::str::FromStr for RoomName {
    type Err = InvalidRoomName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

impl From<RoomName> for String {
    fn from(value: RoomName) -> Self {
        value.0
    }
}

impl Display for RoomName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Authority levels in ascending order. The derived `Ord` is the authority
/// ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    UnregisteredUser,
    RegisteredUser,
    TrustedUser,
    Moderator,
    Administrator,
    Owner,
}

impl Role {
    pub const COUNT: usize = 6;

    pub const ALL: [Role; Self::COUNT] = [
        Role::UnregisteredUser,
        Role::RegisteredUser,
        Role::TrustedUser,
        Role::Moderator,
        Role::Administrator,
        Role::Owner,
    ];

    /// Roles that are tracked as explicit membership sets on a room.
    pub const ELEVATED: [Role; 3] = [Role::TrustedUser, Role::Moderator, Role::Administrator];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A named capability gated by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    PlaybackPlayPause,
    PlaybackSkip,
    PlaybackSeek,
    ManageQueueAdd,
    ManageQueueRemove,
    ManageQueueOrder,
    ManageQueueVote,
    Chat,
    ManageUsersPromoteTrustedUser,
    ManageUsersPromoteModerator,
    ManageUsersPromoteAdmin,
    ManageUsersDemoteTrustedUser,
    ManageUsersDemoteModerator,
    ManageUsersDemoteAdmin,
}

impl Permission {
    pub const fn bit(self) -> u64 {
        1 << (self as u64)
    }

    pub fn name(self) -> &'static str {
        match self {
            Permission::PlaybackPlayPause => "playback.play-pause",
            Permission::PlaybackSkip => "playback.skip",
            Permission::PlaybackSeek => "playback.seek",
            Permission::ManageQueueAdd => "manage-queue.add",
            Permission::ManageQueueRemove => "manage-queue.remove",
            Permission::ManageQueueOrder => "manage-queue.order",
            Permission::ManageQueueVote => "manage-queue.vote",
            Permission::Chat => "chat",
            Permission::ManageUsersPromoteTrustedUser => "manage-users.promote-trusted-user",
            Permission::ManageUsersPromoteModerator => "manage-users.promote-moderator",
            Permission::ManageUsersPromoteAdmin => "manage-users.promote-admin",
            Permission::ManageUsersDemoteTrustedUser => "manage-users.demote-trusted-user",
            Permission::ManageUsersDemoteModerator => "manage-users.demote-moderator",
            Permission::ManageUsersDemoteAdmin => "manage-users.demote-admin",
        }
    }

    /// Permission required to assign the given role to somebody.
    pub fn promote_to(role: Role) -> Option<Permission> {
        match role {
            Role::TrustedUser => Some(Permission::ManageUsersPromoteTrustedUser),
            Role::Moderator => Some(Permission::ManageUsersPromoteModerator),
            Role::Administrator => Some(Permission::ManageUsersPromoteAdmin),
            _ => None,
        }
    }

    /// Permission required to take the given role away from somebody.
    pub fn demote_from(role: Role) -> Option<Permission> {
        match role {
            Role::TrustedUser => Some(Permission::ManageUsersDemoteTrustedUser),
            Role::Moderator => Some(Permission::ManageUsersDemoteModerator),
            Role::Administrator => Some(Permission::ManageUsersDemoteAdmin),
            _ => None,
        }
    }
}

/// A video's identity within its hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoId {
    pub service: String,
    pub id: String,
}

impl VideoId {
    /// Key used for the vote map.
    pub fn key(&self) -> String {
        format!("{}{}", self.service, self.id)
    }
}

impl Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub service: String,
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Length in seconds.
    pub length: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl Video {
    pub fn video_id(&self) -> VideoId {
        VideoId {
            service: self.service.clone(),
            id: self.id.clone(),
        }
    }

    pub fn matches(&self, id: &VideoId) -> bool {
        self.service == id.service && self.id == id.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayerStatus {
    #[default]
    None,
    Ready,
    Buffering,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    #[default]
    Manual,
    Vote,
}

/// Identity attributes a gateway knows about one socket, attached to join
/// and update-user requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PlayerStatus>,
}

/// One participant as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUserInfo {
    pub id: ClientId,
    pub name: String,
    pub is_logged_in: bool,
    pub role: Role,
    pub status: PlayerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_you: Option<bool>,
}

/// Out-of-band authenticated session carried by the upgrade cookie. Stored
/// under the bus key [`session_key`](crate::session_key) as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// The opaque token the cookie carried; empty for fallback sessions.
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_name_rejects_bad_input() {
        assert_eq!(
            RoomName::try_from(String::new()),
            Err(InvalidRoomName::Empty)
        );
        assert_eq!(
            RoomName::try_from("a".repeat(ROOM_NAME_MAX_LEN + 1)),
            Err(InvalidRoomName::TooLong)
        );
        assert_eq!(
            RoomName::try_from("no spaces".to_owned()),
            Err(InvalidRoomName::BadChar(' '))
        );
    }

    #[test]
    fn room_name_is_lowercased() {
        let name: RoomName = "MovieNight".parse().unwrap();
        assert_eq!(name.as_str(), "movienight");
    }

    #[test]
    fn role_order_is_authority_order() {
        assert!(Role::UnregisteredUser < Role::RegisteredUser);
        assert!(Role::Moderator < Role::Administrator);
        assert!(Role::Administrator < Role::Owner);
    }

    #[test]
    fn permission_bits_are_distinct() {
        let perms = [
            Permission::PlaybackPlayPause,
            Permission::PlaybackSkip,
            Permission::PlaybackSeek,
            Permission::ManageQueueAdd,
            Permission::ManageQueueRemove,
            Permission::ManageQueueOrder,
            Permission::ManageQueueVote,
            Permission::Chat,
            Permission::ManageUsersPromoteTrustedUser,
            Permission::ManageUsersPromoteModerator,
            Permission::ManageUsersPromoteAdmin,
            Permission::ManageUsersDemoteTrustedUser,
            Permission::ManageUsersDemoteModerator,
            Permission::ManageUsersDemoteAdmin,
        ];
        let mut seen = 0u64;
        for p in perms {
            assert_eq!(seen & p.bit(), 0, "{} reuses a bit", p.name());
            seen |= p.bit();
        }
    }

    #[test]
    fn vote_key_concatenates_service_and_id() {
        let id = VideoId {
            service: "youtube".into(),
            id: "dQw4w9WgXcQ".into(),
        };
        assert_eq!(id.key(), "youtubedQw4w9WgXcQ");
    }
}
