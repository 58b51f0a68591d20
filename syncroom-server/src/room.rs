use crate::{Grants, InfoExtractor, MessageBus, User, UserDirectory};
use serde_json::{json, Map, Value};
use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use syncroom_common::{
    room_channel, room_sync_key, ClientId, ClientInfo, EventContext, EventRequest, Permission,
    PlayerStatus, QueueMode, Role, RoomEvent, RoomName, RoomUserInfo, ServerMessage, Video,
    VideoId, Visibility,
};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

/// Trailing-edge coalescing window for sync publication.
pub const SYNC_DEBOUNCE: Duration = Duration::from_millis(50);

/// A room with no participants for this long is unloaded.
pub const UNLOAD_AFTER: Duration = Duration::from_secs(240);

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    #[error("video is already queued")]
    VideoAlreadyQueued,
    #[error("video not found")]
    VideoNotFound,
    #[error("impossible promotion")]
    ImpossiblePromotion,
    #[error("room {0} not found")]
    RoomNotFound(RoomName),
    #[error("client {0} is not in the room")]
    ClientNotFoundInRoom(ClientId),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("failed to fetch video info: {0}")]
    Metadata(#[source] anyhow::Error),
}

/// A request submitted to a room on behalf of one client.
#[derive(Debug, Clone)]
pub struct RoomRequest {
    pub client: ClientId,
    pub body: RequestBody,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Playback { state: bool },
    Skip,
    Seek { value: Option<f64> },
    Add(AddPayload),
    Remove { video: VideoId },
    Order { from_idx: usize, to_idx: usize },
    Vote { video: VideoId, add: bool },
    Join { info: ClientInfo },
    Leave,
    UpdateUser { info: ClientInfo },
    Chat { text: String },
    Promote { target: ClientId, role: Role },
    Undo { event: RoomEvent },
}

impl RequestBody {
    fn required_permission(&self) -> Option<Permission> {
        match self {
            RequestBody::Playback { .. } => Some(Permission::PlaybackPlayPause),
            RequestBody::Skip => Some(Permission::PlaybackSkip),
            RequestBody::Seek { .. } => Some(Permission::PlaybackSeek),
            RequestBody::Add(_) => Some(Permission::ManageQueueAdd),
            RequestBody::Remove { .. } => Some(Permission::ManageQueueRemove),
            RequestBody::Order { .. } => Some(Permission::ManageQueueOrder),
            RequestBody::Vote { .. } => Some(Permission::ManageQueueVote),
            RequestBody::Chat { .. } => Some(Permission::Chat),
            RequestBody::Join { .. }
            | RequestBody::Leave
            | RequestBody::UpdateUser { .. }
            | RequestBody::Promote { .. }
            | RequestBody::Undo { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AddPayload {
    Url(String),
    One(VideoId),
    Many(Vec<VideoId>),
}

/// One participant inside a room.
#[derive(Debug, Clone)]
pub struct RoomUser {
    pub id: ClientId,
    pub user_id: Option<u64>,
    pub unregistered_username: String,
    pub player_status: PlayerStatus,
    pub cached_user: Option<User>,
}

impl RoomUser {
    fn new(id: ClientId) -> Self {
        Self {
            id,
            user_id: None,
            unregistered_username: String::new(),
            player_status: PlayerStatus::None,
            cached_user: None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn username(&self) -> &str {
        self.cached_user
            .as_ref()
            .map(|u| u.username.as_str())
            .unwrap_or(&self.unregistered_username)
    }

    async fn update_info(&mut self, info: &ClientInfo, users: &dyn UserDirectory) {
        if let Some(user_id) = info.user_id {
            self.user_id = Some(user_id);
            match users.get_user(user_id).await {
                Ok(Some(user)) => self.cached_user = Some(user),
                Ok(None) => warn!(user_id, "account not found"),
                Err(err) => warn!(user_id, "failed to fetch account: {err:?}"),
            }
            self.unregistered_username.clear();
        } else if let Some(username) = &info.username {
            self.unregistered_username = username.clone();
            self.user_id = None;
            self.cached_user = None;
        }
        if let Some(status) = info.status {
            self.player_status = status;
        }
    }
}

/// Syncable state fields for dirty tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Name,
    Title,
    Description,
    IsTemporary,
    Visibility,
    QueueMode,
    CurrentSource,
    Queue,
    IsPlaying,
    PlaybackPosition,
    Users,
    VoteCounts,
    Grants,
}

impl Field {
    const ALL: [Field; 13] = [
        Field::Name,
        Field::Title,
        Field::Description,
        Field::IsTemporary,
        Field::Visibility,
        Field::QueueMode,
        Field::CurrentSource,
        Field::Queue,
        Field::IsPlaying,
        Field::PlaybackPosition,
        Field::Users,
        Field::VoteCounts,
        Field::Grants,
    ];

    fn key(self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Title => "title",
            Field::Description => "description",
            Field::IsTemporary => "isTemporary",
            Field::Visibility => "visibility",
            Field::QueueMode => "queueMode",
            Field::CurrentSource => "currentSource",
            Field::Queue => "queue",
            Field::IsPlaying => "isPlaying",
            Field::PlaybackPosition => "playbackPosition",
            Field::Users => "users",
            Field::VoteCounts => "voteCounts",
            Field::Grants => "grants",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    pub title: String,
    pub description: String,
    pub visibility: Visibility,
    pub is_temporary: bool,
    pub queue_mode: QueueMode,
    pub owner: Option<User>,
}

struct RoomState {
    title: String,
    description: String,
    visibility: Visibility,
    is_temporary: bool,
    queue_mode: QueueMode,

    current_source: Option<Video>,
    queue: Vec<Video>,
    is_playing: bool,
    playback_position: f64,
    /// Set while playing; the zero point of the logical clock.
    playback_start: Option<Instant>,

    realusers: Vec<RoomUser>,
    owner: Option<User>,
    user_roles: HashMap<Role, HashSet<u64>>,
    grants: Grants,

    votes: HashMap<String, HashSet<ClientId>>,
    dirty: HashSet<Field>,
    keep_alive_ping: Instant,
}

impl RoomState {
    fn new(options: RoomOptions) -> Self {
        Self {
            title: options.title,
            description: options.description,
            visibility: options.visibility,
            is_temporary: options.is_temporary,
            queue_mode: options.queue_mode,
            current_source: None,
            queue: Vec::new(),
            is_playing: false,
            playback_position: 0.0,
            playback_start: None,
            realusers: Vec::new(),
            owner: options.owner,
            user_roles: HashMap::new(),
            grants: Grants::default(),
            votes: HashMap::new(),
            dirty: Field::ALL.into_iter().collect(),
            keep_alive_ping: Instant::now(),
        }
    }

    fn mark_dirty(&mut self, field: Field) {
        self.dirty.insert(field);
    }

    fn effective_position(&self) -> f64 {
        match self.playback_start {
            Some(start) => self.playback_position + start.elapsed().as_secs_f64(),
            None => self.playback_position,
        }
    }

    fn contains_video(&self, id: &VideoId) -> bool {
        self.current_source
            .as_ref()
            .is_some_and(|v| v.matches(id))
            || self.queue.iter().any(|v| v.matches(id))
    }

    fn role_of(&self, user: &RoomUser) -> Role {
        let Some(user_id) = user.user_id else {
            return Role::UnregisteredUser;
        };
        if self.owner.as_ref().is_some_and(|o| o.id == user_id) {
            return Role::Owner;
        }
        for role in [Role::Administrator, Role::Moderator, Role::TrustedUser] {
            if self
                .user_roles
                .get(&role)
                .is_some_and(|set| set.contains(&user_id))
            {
                return role;
            }
        }
        Role::RegisteredUser
    }

    fn user_info(&self, client: ClientId) -> Option<RoomUserInfo> {
        self.realusers
            .iter()
            .find(|u| u.id == client)
            .map(|u| self.info_of(u))
    }

    fn info_of(&self, user: &RoomUser) -> RoomUserInfo {
        RoomUserInfo {
            id: user.id,
            name: user.username().to_owned(),
            is_logged_in: user.is_logged_in(),
            role: self.role_of(user),
            status: user.player_status,
            is_you: None,
        }
    }

    /// Acting-user view for event publication; requests can legitimately
    /// arrive for clients no longer in the room.
    fn actor_info(&self, client: ClientId) -> RoomUserInfo {
        self.user_info(client).unwrap_or(RoomUserInfo {
            id: client,
            name: String::new(),
            is_logged_in: false,
            role: Role::UnregisteredUser,
            status: PlayerStatus::None,
            is_you: None,
        })
    }

    fn dequeue_next(&mut self) {
        if !self.queue.is_empty() {
            let video = self.queue.remove(0);
            debug!(video = %video.video_id(), "dequeued next video");
            self.current_source = Some(video);
            self.playback_position = 0.0;
            if self.is_playing {
                self.playback_start = Some(Instant::now());
            }
            self.mark_dirty(Field::Queue);
            self.mark_dirty(Field::CurrentSource);
            self.mark_dirty(Field::PlaybackPosition);
        } else if self.current_source.is_some() {
            if self.is_playing {
                self.is_playing = false;
                self.playback_start = None;
                self.mark_dirty(Field::IsPlaying);
            }
            self.playback_position = 0.0;
            self.current_source = None;
            self.mark_dirty(Field::CurrentSource);
            self.mark_dirty(Field::PlaybackPosition);
        }
    }

    fn snapshot(&self, name: &RoomName) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("name".into(), json!(name.as_str()));
        map.insert("title".into(), json!(self.title));
        map.insert("description".into(), json!(self.description));
        map.insert("isTemporary".into(), json!(self.is_temporary));
        map.insert("visibility".into(), json!(self.visibility));
        map.insert("queueMode".into(), json!(self.queue_mode));
        map.insert("currentSource".into(), json!(self.current_source));
        map.insert("queue".into(), json!(self.queue));
        map.insert("isPlaying".into(), json!(self.is_playing));
        map.insert("playbackPosition".into(), json!(self.playback_position));
        let users: Vec<RoomUserInfo> = self.realusers.iter().map(|u| self.info_of(u)).collect();
        map.insert("users".into(), json!(users));
        let vote_counts: Map<String, Value> = self
            .votes
            .iter()
            .map(|(key, set)| (key.clone(), json!(set.len())))
            .collect();
        map.insert("voteCounts".into(), Value::Object(vote_counts));
        map.insert("grants".into(), json!(self.grants.get_mask(Role::Owner)));
        map
    }
}

/// The authoritative, in-memory state machine for one room. All request
/// handling is serialized behind one lock; the lock is held across the
/// handler's suspension points.
pub struct Room {
    pub name: RoomName,
    channel: String,
    sync_key: String,
    state: Mutex<RoomState>,
    sync_armed: AtomicBool,

    bus: Arc<dyn MessageBus>,
    extractor: Arc<dyn InfoExtractor>,
    users: Arc<dyn UserDirectory>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room").field("name", &self.name).finish()
    }
}

impl Room {
    pub fn new(
        name: RoomName,
        options: RoomOptions,
        bus: Arc<dyn MessageBus>,
        extractor: Arc<dyn InfoExtractor>,
        users: Arc<dyn UserDirectory>,
    ) -> Arc<Self> {
        let room = Arc::new(Self {
            channel: room_channel(&name),
            sync_key: room_sync_key(&name),
            name,
            state: Mutex::new(RoomState::new(options)),
            sync_armed: AtomicBool::new(false),
            bus,
            extractor,
            users,
        });
        room.arm_sync();
        room
    }

    /// Best-effort rebuild from a bus snapshot. Participants, votes and
    /// grants are not recovered; clients rejoin and re-vote.
    pub fn from_snapshot(
        name: RoomName,
        snapshot: &Map<String, Value>,
        bus: Arc<dyn MessageBus>,
        extractor: Arc<dyn InfoExtractor>,
        users: Arc<dyn UserDirectory>,
    ) -> Arc<Self> {
        fn get<T: serde::de::DeserializeOwned>(map: &Map<String, Value>, key: &str) -> Option<T> {
            map.get(key)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
        }

        let options = RoomOptions {
            title: get(snapshot, "title").unwrap_or_default(),
            description: get(snapshot, "description").unwrap_or_default(),
            visibility: get(snapshot, "visibility").unwrap_or_default(),
            is_temporary: get(snapshot, "isTemporary").unwrap_or_default(),
            queue_mode: get(snapshot, "queueMode").unwrap_or_default(),
            owner: None,
        };
        let room = Self::new(name, options, bus, extractor, users);
        {
            let mut state = room.state.try_lock().expect("fresh room state is unlocked");
            state.current_source = get(snapshot, "currentSource").unwrap_or_default();
            state.queue = get(snapshot, "queue").unwrap_or_default();
            state.playback_position = get(snapshot, "playbackPosition").unwrap_or_default();
        }
        room
    }

    pub async fn process_request(self: &Arc<Self>, req: RoomRequest) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;

        if let Some(permission) = req.body.required_permission() {
            let role = state
                .user_info(req.client)
                .map(|u| u.role)
                .unwrap_or(Role::UnregisteredUser);
            state.grants.check(role, permission)?;
        }

        match req.body {
            RequestBody::Playback { state: playing } => {
                self.handle_playback(&mut state, req.client, playing).await
            }
            RequestBody::Skip => self.handle_skip(&mut state, req.client).await,
            RequestBody::Seek { value } => self.handle_seek(&mut state, req.client, value).await?,
            RequestBody::Add(payload) => self.handle_add(&mut state, req.client, payload).await?,
            RequestBody::Remove { video } => {
                self.handle_remove(&mut state, req.client, video).await?
            }
            RequestBody::Order { from_idx, to_idx } => {
                Self::handle_order(&mut state, from_idx, to_idx)
            }
            RequestBody::Vote { video, add } => Self::handle_vote(&mut state, req.client, video, add),
            RequestBody::Join { info } => self.handle_join(&mut state, info).await,
            RequestBody::Leave => self.handle_leave(&mut state, req.client).await,
            RequestBody::UpdateUser { info } => self.handle_update_user(&mut state, info).await,
            RequestBody::Chat { text } => self.handle_chat(&state, req.client, text).await,
            RequestBody::Promote { target, role } => {
                Self::handle_promote(&mut state, req.client, target, role)?
            }
            RequestBody::Undo { event } => self.handle_undo(&mut state, req.client, event).await?,
        }

        let dirty = !state.dirty.is_empty();
        drop(state);
        if dirty {
            self.arm_sync();
        }
        Ok(())
    }

    async fn handle_playback(&self, state: &mut RoomState, client: ClientId, playing: bool) {
        if playing && !state.is_playing {
            state.is_playing = true;
            state.playback_start = Some(Instant::now());
            state.mark_dirty(Field::IsPlaying);
        } else if !playing && state.is_playing {
            state.playback_position = state.effective_position();
            state.playback_start = None;
            state.is_playing = false;
            state.mark_dirty(Field::IsPlaying);
            state.mark_dirty(Field::PlaybackPosition);
        }
        let actor = state.actor_info(client);
        self.publish_event(actor, EventRequest::Playback { state: playing }, None)
            .await;
    }

    async fn handle_skip(&self, state: &mut RoomState, client: ClientId) {
        let video = state.current_source.clone();
        let prev = state.effective_position();
        state.dequeue_next();
        let actor = state.actor_info(client);
        self.publish_event(
            actor,
            EventRequest::Skip,
            Some(EventContext {
                video,
                prev_position: Some(prev),
                ..Default::default()
            }),
        )
        .await;
    }

    async fn handle_seek(
        &self,
        state: &mut RoomState,
        client: ClientId,
        value: Option<f64>,
    ) -> Result<(), RoomError> {
        let Some(value) = value else {
            return Err(RoomError::InvalidRequest("seek requires a position"));
        };
        let prev = state.playback_position;
        state.playback_position = value;
        state.mark_dirty(Field::PlaybackPosition);
        let actor = state.actor_info(client);
        self.publish_event(
            actor,
            EventRequest::Seek { value },
            Some(EventContext {
                prev_position: Some(prev),
                ..Default::default()
            }),
        )
        .await;
        Ok(())
    }

    async fn handle_add(
        &self,
        state: &mut RoomState,
        client: ClientId,
        payload: AddPayload,
    ) -> Result<(), RoomError> {
        match payload {
            AddPayload::Url(url) => {
                let id = self
                    .extractor
                    .resolve_url(&url)
                    .await
                    .map_err(RoomError::Metadata)?;
                self.add_one(state, client, id).await
            }
            AddPayload::One(id) => self.add_one(state, client, id).await,
            AddPayload::Many(ids) => self.add_many(state, client, ids).await,
        }
    }

    async fn add_one(
        &self,
        state: &mut RoomState,
        client: ClientId,
        id: VideoId,
    ) -> Result<(), RoomError> {
        if state.contains_video(&id) {
            return Err(RoomError::VideoAlreadyQueued);
        }
        let video = self.extractor.fetch(&id).await.map_err(RoomError::Metadata)?;
        state.queue.push(video.clone());
        state.mark_dirty(Field::Queue);
        info!(room = %self.name, video = %id, "video added to queue");
        let actor = state.actor_info(client);
        self.publish_event(
            actor,
            EventRequest::Add,
            Some(EventContext {
                video: Some(video),
                ..Default::default()
            }),
        )
        .await;
        Ok(())
    }

    async fn add_many(
        &self,
        state: &mut RoomState,
        client: ClientId,
        ids: Vec<VideoId>,
    ) -> Result<(), RoomError> {
        let mut videos = self
            .extractor
            .fetch_many(&ids)
            .await
            .map_err(RoomError::Metadata)?;
        videos.retain(|v| !state.contains_video(&v.video_id()));
        if videos.is_empty() {
            return Err(RoomError::VideoAlreadyQueued);
        }
        state.queue.extend(videos.iter().cloned());
        state.mark_dirty(Field::Queue);
        info!(room = %self.name, count = videos.len(), "videos added to queue");
        let actor = state.actor_info(client);
        self.publish_event(
            actor,
            EventRequest::Add,
            Some(EventContext {
                videos: Some(videos),
                ..Default::default()
            }),
        )
        .await;
        Ok(())
    }

    async fn handle_remove(
        &self,
        state: &mut RoomState,
        client: ClientId,
        id: VideoId,
    ) -> Result<(), RoomError> {
        let Some(queue_idx) = state.queue.iter().position(|v| v.matches(&id)) else {
            return Err(RoomError::VideoNotFound);
        };
        let video = state.queue.remove(queue_idx);
        state.mark_dirty(Field::Queue);
        let actor = state.actor_info(client);
        self.publish_event(
            actor,
            EventRequest::Remove { video: id },
            Some(EventContext {
                video: Some(video),
                queue_idx: Some(queue_idx),
                ..Default::default()
            }),
        )
        .await;
        Ok(())
    }

    fn handle_order(state: &mut RoomState, from_idx: usize, to_idx: usize) {
        if from_idx >= state.queue.len() {
            warn!(from_idx, to_idx, "queue-move out of range, ignoring");
            return;
        }
        let video = state.queue.remove(from_idx);
        state.queue.insert(to_idx.min(state.queue.len()), video);
        state.mark_dirty(Field::Queue);
    }

    fn handle_vote(state: &mut RoomState, client: ClientId, video: VideoId, add: bool) {
        let key = video.key();
        if add {
            state.votes.entry(key).or_default().insert(client);
        } else if let Some(set) = state.votes.get_mut(&key) {
            set.remove(&client);
            if set.is_empty() {
                state.votes.remove(&key);
            }
        }
        state.mark_dirty(Field::VoteCounts);
    }

    async fn handle_join(&self, state: &mut RoomState, info: ClientInfo) {
        let mut user = RoomUser::new(info.id);
        user.update_info(&info, self.users.as_ref()).await;
        info!(room = %self.name, client = %info.id, name = user.username(), "user joined");
        state.realusers.push(user);
        state.mark_dirty(Field::Users);
        let actor = state.actor_info(info.id);
        self.publish(&ServerMessage::User {
            user: actor.clone(),
        })
        .await;
        self.publish_event(actor, EventRequest::Join, None).await;
    }

    async fn handle_leave(&self, state: &mut RoomState, client: ClientId) {
        let Some(idx) = state.realusers.iter().position(|u| u.id == client) else {
            // leave can race the disconnect cleanup; nothing to do
            return;
        };
        let actor = state.info_of(&state.realusers[idx]);
        state.realusers.remove(idx);
        state.mark_dirty(Field::Users);
        info!(room = %self.name, client = %client, "user left");
        self.publish_event(actor, EventRequest::Leave, None).await;
    }

    async fn handle_update_user(&self, state: &mut RoomState, info: ClientInfo) {
        let Some(idx) = state.realusers.iter().position(|u| u.id == info.id) else {
            warn!(client = %info.id, "update for unknown participant, ignoring");
            return;
        };
        let mut user = state.realusers[idx].clone();
        user.update_info(&info, self.users.as_ref()).await;
        state.realusers[idx] = user;
        state.mark_dirty(Field::Users);
        let updated = state.info_of(&state.realusers[idx]);
        self.publish(&ServerMessage::User { user: updated }).await;
    }

    async fn handle_chat(&self, state: &RoomState, client: ClientId, text: String) {
        let Some(from) = state.user_info(client) else {
            warn!(client = %client, "chat from non-participant, ignoring");
            return;
        };
        self.publish(&ServerMessage::Chat { from, text }).await;
    }

    fn handle_promote(
        state: &mut RoomState,
        promoter: ClientId,
        target: ClientId,
        role: Role,
    ) -> Result<(), RoomError> {
        if matches!(role, Role::Owner | Role::UnregisteredUser) {
            return Err(RoomError::ImpossiblePromotion);
        }
        let promoter_role = state
            .user_info(promoter)
            .map(|u| u.role)
            .unwrap_or(Role::UnregisteredUser);
        let target_user = state
            .realusers
            .iter()
            .find(|u| u.id == target)
            .ok_or(RoomError::ClientNotFoundInRoom(target))?;
        let Some(target_user_id) = target_user.user_id else {
            return Err(RoomError::ImpossiblePromotion);
        };
        let target_role = state.role_of(target_user);

        if let Some(permission) = Permission::promote_to(role) {
            state.grants.check(promoter_role, permission)?;
        }
        if target_role > role {
            let Some(demote) = Permission::demote_from(target_role) else {
                return Err(RoomError::ImpossiblePromotion);
            };
            if !state.grants.granted(promoter_role, demote) {
                return Err(RoomError::ImpossiblePromotion);
            }
        }

        for elevated in Role::ELEVATED {
            if let Some(set) = state.user_roles.get_mut(&elevated) {
                set.remove(&target_user_id);
            }
        }
        if role >= Role::TrustedUser {
            state
                .user_roles
                .entry(role)
                .or_default()
                .insert(target_user_id);
        }
        info!(target = %target, ?role, "role assigned");
        state.mark_dirty(Field::Users);
        Ok(())
    }

    async fn handle_undo(
        &self,
        state: &mut RoomState,
        client: ClientId,
        event: RoomEvent,
    ) -> Result<(), RoomError> {
        let additional = event.additional.unwrap_or_default();
        match event.request {
            EventRequest::Seek { .. } => {
                let Some(prev) = additional.prev_position else {
                    return Err(RoomError::InvalidRequest("seek undo lacks prevPosition"));
                };
                self.handle_seek(state, client, Some(prev)).await
            }
            EventRequest::Skip => {
                if let Some(current) = state.current_source.take() {
                    state.queue.insert(0, current);
                    state.mark_dirty(Field::Queue);
                }
                state.current_source = additional.video;
                state.playback_position = additional.prev_position.unwrap_or(0.0);
                if state.is_playing {
                    state.playback_start = Some(Instant::now());
                }
                state.mark_dirty(Field::CurrentSource);
                state.mark_dirty(Field::PlaybackPosition);
                Ok(())
            }
            EventRequest::Add => {
                if state.queue.is_empty() {
                    state.current_source = None;
                    state.mark_dirty(Field::CurrentSource);
                    return Ok(());
                }
                let Some(video) = additional.video else {
                    warn!("batch add is not undoable, ignoring");
                    return Ok(());
                };
                self.handle_remove(state, client, video.video_id()).await
            }
            EventRequest::Remove { .. } => {
                let (Some(video), Some(queue_idx)) = (additional.video, additional.queue_idx)
                else {
                    return Err(RoomError::InvalidRequest("remove undo lacks context"));
                };
                let queue_idx = queue_idx.min(state.queue.len());
                state.queue.insert(queue_idx, video);
                state.mark_dirty(Field::Queue);
                Ok(())
            }
            other => {
                warn!(?other, "request type is not undoable, ignoring");
                Ok(())
            }
        }
    }

    /// Periodic update, invoked by the room manager on a cadence.
    pub async fn tick(self: &Arc<Self>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let ended = match &state.current_source {
            None => true,
            Some(current) => state.effective_position() > current.length,
        };
        if ended {
            state.dequeue_next();
        }

        if !state.realusers.is_empty() {
            state.keep_alive_ping = Instant::now();
        }

        if state.queue_mode == QueueMode::Vote {
            let counts: HashMap<String, usize> = state
                .votes
                .iter()
                .map(|(key, set)| (key.clone(), set.len()))
                .collect();
            let before: Vec<VideoId> = state.queue.iter().map(Video::video_id).collect();
            state
                .queue
                .sort_by_key(|v| Reverse(counts.get(&v.video_id().key()).copied().unwrap_or(0)));
            let changed = state
                .queue
                .iter()
                .map(Video::video_id)
                .ne(before.into_iter());
            if changed {
                state.mark_dirty(Field::Queue);
            }
        }

        let dirty = !state.dirty.is_empty();
        drop(guard);
        if dirty {
            self.arm_sync();
        }
    }

    /// Arms the trailing-edge sync timer unless one is already pending.
    fn arm_sync(self: &Arc<Self>) {
        if self.sync_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let room = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(SYNC_DEBOUNCE).await;
            room.sync().await;
        });
    }

    /// Publishes the delta of all dirty fields and refreshes the snapshot
    /// key. On bus failure the dirty set is retained so the fields are
    /// re-sent by the next sync.
    pub async fn sync(&self) {
        self.sync_armed.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.dirty.is_empty() {
            return;
        }

        let snapshot = state.snapshot(&self.name);
        let mut delta = Map::new();
        for field in &state.dirty {
            if let Some(value) = snapshot.get(field.key()) {
                delta.insert(field.key().to_owned(), value.clone());
            }
        }

        let full = Value::Object(snapshot).to_string();
        if let Err(err) = self.bus.kv_set(&self.sync_key, &full).await {
            warn!(room = %self.name, "failed to write snapshot: {err}");
            return;
        }
        let msg = ServerMessage::Sync { state: delta };
        let text = serde_json::to_string(&msg).expect("sync serialization cannot fail");
        if let Err(err) = self.bus.publish(&self.channel, &text).await {
            warn!(room = %self.name, "failed to publish sync: {err}");
            return;
        }
        state.dirty.clear();
    }

    /// Marks every field dirty and syncs immediately; used to seed the
    /// snapshot key for a room that has never synced.
    pub async fn publish_full_sync(&self) {
        {
            let mut state = self.state.lock().await;
            state.dirty = Field::ALL.into_iter().collect();
        }
        self.sync().await;
    }

    /// True when no participant refreshed the keepalive within
    /// [`UNLOAD_AFTER`].
    pub async fn is_stale(&self) -> bool {
        self.state.lock().await.keep_alive_ping.elapsed() > UNLOAD_AFTER
    }

    /// Tells every peer process to disconnect this room's clients; called by
    /// the manager right before dropping the room.
    pub async fn on_before_unload(&self) {
        info!(room = %self.name, "unloading");
        self.publish(&ServerMessage::Unload).await;
    }

    pub async fn set_title(self: &Arc<Self>, title: String) {
        let mut state = self.state.lock().await;
        state.title = title;
        state.mark_dirty(Field::Title);
        drop(state);
        self.arm_sync();
    }

    pub async fn set_description(self: &Arc<Self>, description: String) {
        let mut state = self.state.lock().await;
        state.description = description;
        state.mark_dirty(Field::Description);
        drop(state);
        self.arm_sync();
    }

    pub async fn set_visibility(self: &Arc<Self>, visibility: Visibility) {
        let mut state = self.state.lock().await;
        state.visibility = visibility;
        state.mark_dirty(Field::Visibility);
        drop(state);
        self.arm_sync();
    }

    pub async fn set_queue_mode(self: &Arc<Self>, queue_mode: QueueMode) {
        let mut state = self.state.lock().await;
        state.queue_mode = queue_mode;
        state.mark_dirty(Field::QueueMode);
        drop(state);
        self.arm_sync();
    }

    pub async fn current_source(&self) -> Option<Video> {
        self.state.lock().await.current_source.clone()
    }

    pub async fn queue(&self) -> Vec<Video> {
        self.state.lock().await.queue.clone()
    }

    pub async fn is_playing(&self) -> bool {
        self.state.lock().await.is_playing
    }

    pub async fn playback_position(&self) -> f64 {
        self.state.lock().await.playback_position
    }

    pub async fn effective_position(&self) -> f64 {
        self.state.lock().await.effective_position()
    }

    pub async fn participants(&self) -> Vec<RoomUserInfo> {
        let state = self.state.lock().await;
        state.realusers.iter().map(|u| state.info_of(u)).collect()
    }

    async fn publish_event(
        &self,
        user: RoomUserInfo,
        request: EventRequest,
        additional: Option<EventContext>,
    ) {
        self.publish(&ServerMessage::Event {
            event: RoomEvent {
                request,
                user,
                additional,
            },
        })
        .await;
    }

    async fn publish(&self, msg: &ServerMessage) {
        let text = serde_json::to_string(msg).expect("message serialization cannot fail");
        if let Err(err) = self.bus.publish(&self.channel, &text).await {
            warn!(room = %self.name, "failed to publish to bus: {err}");
        }
    }
}
