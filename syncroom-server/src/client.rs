use crate::{RequestBody, RoomDirectory, RoomRequest};
use std::fmt;
use std::sync::Arc;
use syncroom_common::{
    ClientId, ClientInfo, ClientMessage, CloseCode, RoomName, ServerMessage, Session,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// One frame queued for a client's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Close(CloseCode),
}

/// One connected socket: session identity plus translation between the wire
/// protocol and room requests. Owned by the [`ClientManager`]; rooms refer to
/// it only by id.
///
/// [`ClientManager`]: crate::ClientManager
pub struct Client {
    pub id: ClientId,
    session: RwLock<Session>,
    room: RwLock<Option<RoomName>>,
    outbox: mpsc::Sender<Frame>,
    rooms: Arc<dyn RoomDirectory>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("id", &self.id).finish()
    }
}

impl Client {
    pub fn new(session: Session, outbox: mpsc::Sender<Frame>, rooms: Arc<dyn RoomDirectory>) -> Self {
        Self {
            id: ClientId::new(),
            session: RwLock::new(session),
            room: RwLock::new(None),
            outbox,
            rooms,
        }
    }

    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }

    pub async fn set_session(&self, session: Session) {
        *self.session.write().await = session;
    }

    pub async fn room(&self) -> Option<RoomName> {
        self.room.read().await.clone()
    }

    pub async fn set_room(&self, name: RoomName) {
        *self.room.write().await = Some(name);
    }

    /// Identity attached to join/update requests: registered user id, then
    /// the session's display name, then a generated one.
    pub async fn client_info(&self) -> ClientInfo {
        let mut session = self.session.write().await;
        if let Some(user_id) = session.user_id {
            return ClientInfo {
                id: self.id,
                user_id: Some(user_id),
                username: None,
                status: None,
            };
        }
        if session.username.is_none() {
            let name = generate_username();
            warn!(client = %self.id, name, "session has no identity, generated a name");
            session.username = Some(name);
        }
        ClientInfo {
            id: self.id,
            user_id: None,
            username: session.username.clone(),
            status: None,
        }
    }

    /// Translate one wire message and route it to the joined room.
    pub async fn on_message(&self, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(client = %self.id, "malformed message, ignoring: {err}");
                return;
            }
        };
        let body = match msg {
            ClientMessage::Play => RequestBody::Playback { state: true },
            ClientMessage::Pause => RequestBody::Playback { state: false },
            ClientMessage::Skip => RequestBody::Skip,
            ClientMessage::Seek { value } => RequestBody::Seek { value: Some(value) },
            ClientMessage::QueueMove { from_idx, to_idx } => {
                RequestBody::Order { from_idx, to_idx }
            }
            ClientMessage::Chat { text } => RequestBody::Chat { text },
            ClientMessage::Status { status } => RequestBody::UpdateUser {
                info: ClientInfo {
                    id: self.id,
                    user_id: None,
                    username: None,
                    status: Some(status),
                },
            },
            ClientMessage::SetRole { client_id, role } => RequestBody::Promote {
                target: client_id,
                role,
            },
            ClientMessage::Kickme => {
                self.close(CloseCode::Unknown).await;
                return;
            }
        };
        self.make_room_request(body).await;
    }

    /// Errors abort the request, never the socket.
    pub async fn make_room_request(&self, body: RequestBody) {
        let Some(name) = self.room().await else {
            warn!(client = %self.id, "message before join, ignoring");
            return;
        };
        match self.rooms.get_room(&name).await {
            Ok(room) => {
                if let Err(err) = room
                    .process_request(RoomRequest {
                        client: self.id,
                        body,
                    })
                    .await
                {
                    warn!(client = %self.id, room = %name, "request failed: {err}");
                }
            }
            Err(err) => warn!(client = %self.id, "room lookup failed: {err}"),
        }
    }

    pub async fn try_send_text(&self, text: String) {
        if self.outbox.send(Frame::Text(text)).await.is_err() {
            debug!(client = %self.id, "socket writer gone, dropping frame");
        }
    }

    pub async fn try_send(&self, msg: &ServerMessage) {
        let text = serde_json::to_string(msg).expect("message serialization cannot fail");
        self.try_send_text(text).await;
    }

    pub async fn ping(&self) {
        let _ = self.outbox.send(Frame::Ping).await;
    }

    pub async fn close(&self, code: CloseCode) {
        let _ = self.outbox.send(Frame::Close(code)).await;
    }
}

/// Pronounceable throwaway display name for sessions with no identity.
fn generate_username() -> String {
    use rand::seq::SliceRandom;

    const ONSETS: &[&str] = &[
        "b", "d", "f", "g", "k", "l", "m", "n", "p", "r", "s", "t", "v", "z", "br", "st", "tr",
    ];
    const VOWELS: &[&str] = &["a", "e", "i", "o", "u"];

    let mut rng = rand::thread_rng();
    let mut name = String::new();
    for _ in 0..3 {
        name.push_str(ONSETS.choose(&mut rng).unwrap());
        name.push_str(VOWELS.choose(&mut rng).unwrap());
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_alternate_consonants_and_vowels() {
        for _ in 0..32 {
            let name = generate_username();
            assert!(!name.is_empty());
            assert!(name.chars().all(|c| c.is_ascii_lowercase()));
            assert!(name.chars().any(|c| "aeiou".contains(c)));
        }
    }
}
