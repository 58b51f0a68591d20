use crate::{Client, Frame, MessageBus, RequestBody, Room, RoomDirectory, RoomError, SafeMap};
use serde_json::{Map, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use syncroom_common::{
    room_channel, room_sync_key, session_key, CloseCode, RoomName, ServerMessage, Session,
    ANNOUNCEMENT_CHANNEL, KEEPALIVE_INTERVAL,
};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{info, warn};

/// Process-wide registry of client sockets: membership bookkeeping per room,
/// cached room snapshots for full-sync-on-join, and fan-out of bus messages
/// to local sockets.
pub struct ClientManager {
    rooms: Arc<dyn RoomDirectory>,
    bus: Arc<dyn MessageBus>,

    connections: RwLock<Vec<Arc<Client>>>,
    room_joins: SafeMap<RoomName, Vec<Arc<Client>>>,
    room_states: SafeMap<RoomName, Map<String, Value>>,
    subscribed: Mutex<HashSet<String>>,
}

impl ClientManager {
    pub fn new(rooms: Arc<dyn RoomDirectory>, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        Arc::new(Self {
            rooms,
            bus,
            connections: RwLock::new(Vec::new()),
            room_joins: SafeMap::new(HashMap::new()),
            room_states: SafeMap::new(HashMap::new()),
            subscribed: Mutex::new(HashSet::new()),
        })
    }

    /// Subscribes the service-wide announcement channel.
    pub async fn start(self: &Arc<Self>) {
        self.ensure_subscribed(ANNOUNCEMENT_CHANNEL.to_owned()).await;
    }

    /// Resolves the upgrade request's cookie token against the bus KV. A
    /// missing or unknown token yields an anonymous session; the client gets
    /// a generated display name on first use.
    pub async fn resolve_session(&self, token: Option<&str>) -> Session {
        let Some(token) = token else {
            return Session::default();
        };
        let anonymous = Session {
            id: token.to_owned(),
            ..Default::default()
        };
        match self.bus.kv_get(&session_key(token)).await {
            Ok(Some(raw)) => match serde_json::from_str::<Session>(&raw) {
                Ok(mut session) => {
                    if session.id.is_empty() {
                        session.id = token.to_owned();
                    }
                    session
                }
                Err(err) => {
                    warn!("malformed session record, treating as anonymous: {err}");
                    anonymous
                }
            },
            Ok(None) => anonymous,
            Err(err) => {
                warn!("failed to resolve session: {err}");
                anonymous
            }
        }
    }

    /// Registers a freshly-upgraded socket and joins it to `name`. On a
    /// failed join the socket is closed with `ROOM_NOT_FOUND`.
    pub async fn connect(
        self: &Arc<Self>,
        session: Session,
        outbox: mpsc::Sender<Frame>,
        name: RoomName,
    ) -> Result<Arc<Client>, RoomError> {
        let client = Arc::new(Client::new(session, outbox, Arc::clone(&self.rooms)));
        self.connections.write().await.push(Arc::clone(&client));
        info!(client = %client.id, room = %name, "client connected");
        if let Err(err) = self.join_room(&client, name).await {
            warn!(client = %client.id, "join failed: {err}");
            client.close(CloseCode::RoomNotFound).await;
            self.connections.write().await.retain(|c| c.id != client.id);
            return Err(err);
        }
        Ok(client)
    }

    async fn join_room(self: &Arc<Self>, client: &Arc<Client>, name: RoomName) -> Result<(), RoomError> {
        let room = self.rooms.get_room(&name).await?;
        client.set_room(name.clone()).await;

        // The joiner gets the complete snapshot before it can observe any
        // delta; registration below is what makes deltas reach it.
        let snapshot = self.full_snapshot(&room, &name).await;
        client.try_send(&ServerMessage::Sync { state: snapshot }).await;

        self.ensure_subscribed(room_channel(&name)).await;
        self.room_joins
            .write()
            .await
            .entry(name.clone())
            .or_default()
            .push(Arc::clone(client));

        let info = client.client_info().await;
        room.process_request(crate::RoomRequest {
            client: client.id,
            body: RequestBody::Join { info },
        })
        .await
    }

    /// Last-known full state of a room, from the local cache or the bus.
    async fn full_snapshot(&self, room: &Arc<Room>, name: &RoomName) -> Map<String, Value> {
        if let Some(state) = self.room_states.read().await.get(name) {
            return state.clone();
        }
        let mut raw = self.bus.kv_get(&room_sync_key(name)).await.ok().flatten();
        if raw.is_none() {
            // freshly created room that has never synced; make it
            room.publish_full_sync().await;
            raw = self.bus.kv_get(&room_sync_key(name)).await.ok().flatten();
        }
        let snapshot = raw
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        self.room_states
            .write()
            .await
            .insert(name.clone(), snapshot.clone());
        snapshot
    }

    /// Fan a message received from the bus out to the local sockets it
    /// concerns.
    pub async fn on_bus_message(&self, channel: &str, text: &str) {
        if channel == ANNOUNCEMENT_CHANNEL {
            for client in self.connections.read().await.iter() {
                client.try_send_text(text.to_owned()).await;
            }
            return;
        }
        let Some(name) = channel.strip_prefix("room:") else {
            warn!(channel, "message on unexpected channel, ignoring");
            return;
        };
        let Ok(name) = name.parse::<RoomName>() else {
            warn!(channel, "unparsable room channel, ignoring");
            return;
        };
        let msg: ServerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(channel, "malformed bus message, ignoring: {err}");
                return;
            }
        };
        match msg {
            ServerMessage::Sync { state } => {
                self.merge_room_state(&name, state).await;
                self.broadcast_to_room(&name, text).await;
            }
            ServerMessage::Chat { .. } | ServerMessage::Event { .. } => {
                self.broadcast_to_room(&name, text).await;
            }
            ServerMessage::Unload => {
                let clients = self
                    .room_joins
                    .write()
                    .await
                    .remove(&name)
                    .unwrap_or_default();
                self.room_states.write().await.remove(&name);
                info!(room = %name, clients = clients.len(), "room unloaded, disconnecting");
                for client in clients {
                    client.close(CloseCode::RoomUnloaded).await;
                }
            }
            ServerMessage::User { mut user } => {
                let target = self
                    .room_joins
                    .read()
                    .await
                    .get(&name)
                    .and_then(|clients| clients.iter().find(|c| c.id == user.id).cloned());
                if let Some(client) = target {
                    user.is_you = Some(true);
                    client.try_send(&ServerMessage::User { user }).await;
                }
            }
        }
    }

    async fn merge_room_state(&self, name: &RoomName, delta: Map<String, Value>) {
        let mut states = self.room_states.write().await;
        if let Some(existing) = states.get_mut(name) {
            for (key, value) in delta {
                existing.insert(key, value);
            }
            return;
        }
        drop(states);
        let mut base = self
            .bus
            .kv_get(&room_sync_key(name))
            .await
            .ok()
            .flatten()
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        for (key, value) in delta {
            base.insert(key, value);
        }
        self.room_states.write().await.insert(name.clone(), base);
    }

    async fn broadcast_to_room(&self, name: &RoomName, text: &str) {
        let clients = match self.room_joins.read().await.get(name) {
            Some(clients) => clients.clone(),
            None => return,
        };
        for client in clients {
            client.try_send_text(text.to_owned()).await;
        }
    }

    /// Socket closed: deregister and let the room clean the participant up.
    pub async fn on_close(&self, client: &Arc<Client>) {
        info!(client = %client.id, "client disconnected");
        self.connections.write().await.retain(|c| c.id != client.id);
        if let Some(name) = client.room().await {
            if let Some(clients) = self.room_joins.write().await.get_mut(&name) {
                clients.retain(|c| c.id != client.id);
            }
            client.make_room_request(RequestBody::Leave).await;
        }
    }

    /// An account changed: refresh every connection carrying its session.
    pub async fn on_user_modified(&self, session: &Session) {
        let connections = self.connections.read().await.clone();
        for client in connections {
            if client.session().await.id != session.id {
                continue;
            }
            client.set_session(session.clone()).await;
            if client.room().await.is_some() {
                let info = client.client_info().await;
                client.make_room_request(RequestBody::UpdateUser { info }).await;
            }
        }
    }

    pub fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                interval.tick().await;
                for client in manager.connections.read().await.iter() {
                    client.ping().await;
                }
            }
        })
    }

    async fn ensure_subscribed(self: &Arc<Self>, channel: String) {
        {
            let mut subscribed = self.subscribed.lock().await;
            if !subscribed.insert(channel.clone()) {
                return;
            }
        }
        match self.bus.subscribe(&channel).await {
            Ok(mut sub) => {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    while let Some(text) = sub.receive().await {
                        manager.on_bus_message(&channel, &text).await;
                    }
                });
            }
            Err(err) => {
                warn!(channel, "failed to subscribe: {err}");
                self.subscribed.lock().await.remove(&channel);
            }
        }
    }
}
