use crate::{ClientId, PlayerStatus, Role, RoomUserInfo, Video, VideoId};
use serde::{Deserialize, Serialize};

/// Application close codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Unknown = 4000,
    InvalidConnectionUrl = 4001,
    RoomNotFound = 4002,
    RoomUnloaded = 4003,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        self as u16
    }
}

/// Messages a client sends over its socket, tagged by `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ClientMessage {
    Play,
    Pause,
    Skip,
    Seek {
        value: f64,
    },
    #[serde(rename_all = "camelCase")]
    QueueMove {
        from_idx: usize,
        to_idx: usize,
    },
    Chat {
        text: String,
    },
    Status {
        status: PlayerStatus,
    },
    #[serde(rename_all = "camelCase")]
    SetRole {
        client_id: ClientId,
        role: Role,
    },
    Kickme,
}

/// Messages the server pushes, over both the room bus channel and client
/// sockets. `sync` carries a partial room state keyed by field name: full on
/// join, deltas thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ServerMessage {
    Sync {
        #[serde(flatten)]
        state: serde_json::Map<String, serde_json::Value>,
    },
    Event {
        #[serde(flatten)]
        event: RoomEvent,
    },
    Chat {
        from: RoomUserInfo,
        text: String,
    },
    Unload,
    User {
        user: RoomUserInfo,
    },
}

/// A completed state-changing request as published on the room channel.
///
/// Clients echo these back verbatim to request an undo; the server keeps no
/// history of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    pub request: EventRequest,
    pub user: RoomUserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional: Option<EventContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventRequest {
    Playback { state: bool },
    Skip,
    Seek { value: f64 },
    Add,
    Remove { video: VideoId },
    Join,
    Leave,
}

/// Side data attached to an event, enough to invert it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<Video>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub videos: Option<Vec<Video>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_idx: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_actions_use_wire_names() {
        let msg: ClientMessage = serde_json::from_value(json!({"action": "play"})).unwrap();
        assert!(matches!(msg, ClientMessage::Play));

        let msg: ClientMessage =
            serde_json::from_value(json!({"action": "seek", "value": 42.5})).unwrap();
        assert!(matches!(msg, ClientMessage::Seek { value } if value == 42.5));

        let msg: ClientMessage =
            serde_json::from_value(json!({"action": "queue-move", "fromIdx": 2, "toIdx": 0}))
                .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::QueueMove {
                from_idx: 2,
                to_idx: 0
            }
        ));
    }

    #[test]
    fn unknown_action_fails_to_parse() {
        assert!(serde_json::from_value::<ClientMessage>(json!({"action": "dance"})).is_err());
    }

    #[test]
    fn sync_flattens_state_fields() {
        let mut state = serde_json::Map::new();
        state.insert("isPlaying".into(), json!(true));
        let text = serde_json::to_string(&ServerMessage::Sync { state }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["action"], "sync");
        assert_eq!(value["isPlaying"], true);
    }

    #[test]
    fn event_round_trips_through_client_echo() {
        let event = RoomEvent {
            request: EventRequest::Seek { value: 10.0 },
            user: RoomUserInfo {
                id: ClientId::new(),
                name: "ada".into(),
                is_logged_in: true,
                role: Role::Moderator,
                status: PlayerStatus::Ready,
                is_you: None,
            },
            additional: Some(EventContext {
                prev_position: Some(3.5),
                ..Default::default()
            }),
        };
        let text = serde_json::to_string(&ServerMessage::Event {
            event: event.clone(),
        })
        .unwrap();
        let parsed: ServerMessage = serde_json::from_str(&text).unwrap();
        let ServerMessage::Event { event: echoed } = parsed else {
            panic!("expected event");
        };
        assert!(matches!(
            echoed.request,
            EventRequest::Seek { value } if value == 10.0
        ));
        assert_eq!(echoed.additional.unwrap().prev_position, Some(3.5));
    }
}
