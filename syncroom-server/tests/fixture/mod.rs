use std::{sync::Arc, time::Duration};
use syncroom_common::Video;
use syncroom_server::{
    ClientManager, FixedExtractor, FixedUserDirectory, Frame, LocalBus, RoomManager, User,
};
use tokio::sync::mpsc;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn video(id: &str, length: f64) -> Video {
    Video {
        service: "youtube".into(),
        id: id.into(),
        title: format!("video {id}"),
        description: String::new(),
        length,
        thumbnail: None,
    }
}

pub fn room_manager(
    bus: Arc<LocalBus>,
    videos: Vec<Video>,
    users: Vec<User>,
) -> Arc<RoomManager> {
    RoomManager::new(
        bus,
        Arc::new(FixedExtractor::with(videos)),
        Arc::new(FixedUserDirectory::with(users)),
    )
}

/// One gateway process attached to the shared room table and bus.
pub async fn gateway(rooms: Arc<RoomManager>, bus: Arc<LocalBus>) -> Arc<ClientManager> {
    let manager = ClientManager::new(rooms, bus);
    manager.start().await;
    manager
}

/// A channel standing in for one client's socket.
pub fn socket() -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(64)
}

/// Next text frame on the socket, parsed.
pub async fn recv_json(rx: &mut mpsc::Receiver<Frame>) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed");
        match frame {
            Frame::Text(text) => return serde_json::from_str(&text).unwrap(),
            Frame::Ping => continue,
            Frame::Close(code) => panic!("unexpected close: {code:?}"),
        }
    }
}

/// Next text frame with the given action, skipping the others.
pub async fn recv_action(rx: &mut mpsc::Receiver<Frame>, action: &str) -> serde_json::Value {
    loop {
        let value = recv_json(rx).await;
        if value["action"] == action {
            return value;
        }
    }
}

/// Next close frame, skipping anything still queued before it.
pub async fn recv_close(rx: &mut mpsc::Receiver<Frame>) -> syncroom_common::CloseCode {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for a close")
            .expect("socket closed");
        if let Frame::Close(code) = frame {
            return code;
        }
    }
}
