use crate::{
    InfoExtractor, MessageBus, Room, RoomError, RoomOptions, SafeMap, UserDirectory,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use syncroom_common::{room_sync_key, RoomName};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cadence of the per-room periodic update.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Room lookup capability handed to the client gateway.
#[async_trait]
pub trait RoomDirectory: Send + Sync + 'static {
    /// The room named `name` if this node can serve it. Returns the same
    /// instance for the same name for as long as the room stays loaded.
    async fn get_room(&self, name: &RoomName) -> Result<Arc<Room>, RoomError>;
}

/// Owns the in-process room table and the eviction loop. Each room is owned
/// by exactly one process; a name that is neither loaded here nor present in
/// the shared cache is not found.
pub struct RoomManager {
    rooms: SafeMap<RoomName, Arc<Room>>,
    bus: Arc<dyn MessageBus>,
    extractor: Arc<dyn InfoExtractor>,
    users: Arc<dyn UserDirectory>,
}

impl RoomManager {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        extractor: Arc<dyn InfoExtractor>,
        users: Arc<dyn UserDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: SafeMap::new(HashMap::new()),
            bus,
            extractor,
            users,
        })
    }

    /// Creates and loads a room. Returns the already-loaded instance if the
    /// name is taken on this node.
    pub async fn create_room(&self, name: RoomName, options: RoomOptions) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;
        if let Some(existing) = rooms.get(&name) {
            return Arc::clone(existing);
        }
        info!(room = %name, "creating room");
        let room = Room::new(
            name.clone(),
            options,
            Arc::clone(&self.bus),
            Arc::clone(&self.extractor),
            Arc::clone(&self.users),
        );
        rooms.insert(name, Arc::clone(&room));
        room
    }

    /// Best-effort reload of a previously-synced room from the shared cache.
    async fn recover_room(&self, name: &RoomName) -> Option<Arc<Room>> {
        let raw = match self.bus.kv_get(&room_sync_key(name)).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(room = %name, "failed to read snapshot: {err}");
                return None;
            }
        };
        let snapshot = match serde_json::from_str(&raw) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => {
                warn!(room = %name, "discarding malformed snapshot");
                return None;
            }
        };
        info!(room = %name, "recovering room from snapshot");
        Some(Room::from_snapshot(
            name.clone(),
            &snapshot,
            Arc::clone(&self.bus),
            Arc::clone(&self.extractor),
            Arc::clone(&self.users),
        ))
    }

    /// Ticks every room and drops the stale ones.
    pub fn spawn_update_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                let rooms: Vec<Arc<Room>> = manager.rooms.read().await.values().cloned().collect();
                for room in rooms {
                    room.tick().await;
                    if room.is_stale().await {
                        info!(room = %room.name, "room is stale, unloading");
                        room.on_before_unload().await;
                        manager.rooms.write().await.remove(&room.name);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl RoomDirectory for RoomManager {
    async fn get_room(&self, name: &RoomName) -> Result<Arc<Room>, RoomError> {
        if let Some(room) = self.rooms.read().await.get(name) {
            return Ok(Arc::clone(room));
        }
        // Cold miss: the room may have been synced by a previous owner.
        let recovered = self.recover_room(name).await;
        let mut rooms = self.rooms.write().await;
        match recovered {
            Some(room) => match rooms.get(name) {
                // lost the race to another recovery
                Some(existing) => Ok(Arc::clone(existing)),
                None => {
                    rooms.insert(name.clone(), Arc::clone(&room));
                    Ok(room)
                }
            },
            None => {
                debug!(room = %name, "room not found");
                Err(RoomError::RoomNotFound(name.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FixedExtractor, FixedUserDirectory, LocalBus};

    fn manager_with_bus(bus: Arc<LocalBus>) -> Arc<RoomManager> {
        RoomManager::new(
            bus,
            Arc::new(FixedExtractor::default()),
            Arc::new(FixedUserDirectory::default()),
        )
    }

    #[tokio::test]
    async fn get_room_returns_the_same_instance() {
        let manager = manager_with_bus(LocalBus::new());
        let name: RoomName = "movies".parse().unwrap();
        let created = manager.create_room(name.clone(), RoomOptions::default()).await;
        let looked_up = manager.get_room(&name).await.unwrap();
        assert!(Arc::ptr_eq(&created, &looked_up));
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let manager = manager_with_bus(LocalBus::new());
        let name: RoomName = "nowhere".parse().unwrap();
        let err = manager.get_room(&name).await.unwrap_err();
        assert!(matches!(err, RoomError::RoomNotFound(n) if n == name));
    }

    #[tokio::test]
    async fn cold_miss_recovers_from_the_snapshot_key() {
        let bus = LocalBus::new();
        let name: RoomName = "movies".parse().unwrap();

        // a previous owner synced this room
        let previous = manager_with_bus(bus.clone());
        let room = previous
            .create_room(name.clone(), RoomOptions {
                title: "movie night".into(),
                ..Default::default()
            })
            .await;
        room.publish_full_sync().await;

        let fresh = manager_with_bus(bus);
        let recovered = fresh.get_room(&name).await.unwrap();
        assert!(!Arc::ptr_eq(&room, &recovered));
        let second = fresh.get_room(&name).await.unwrap();
        assert!(Arc::ptr_eq(&recovered, &second));
    }
}
