use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use syncroom_common::RoomName;
use syncroom_server::{accept_connection, ClientManager, LocalBus, RoomOptions};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub mod fixture;
use fixture::{gateway, room_manager, video};

async fn serve() -> (SocketAddr, Arc<ClientManager>) {
    let bus = LocalBus::new();
    let rooms = room_manager(bus.clone(), vec![video("a", 100.0)], vec![]);
    rooms
        .create_room("lobby".parse::<RoomName>().unwrap(), RoomOptions::default())
        .await;
    let manager = gateway(rooms, bus).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_manager = Arc::clone(&manager);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(accept_connection(Arc::clone(&accept_manager), stream));
        }
    });
    (addr, manager)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_text(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket errored");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn websocket_join_syncs_then_chats() {
    let (addr, _manager) = serve().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/room/lobby"))
        .await
        .unwrap();

    let first = next_text(&mut ws).await;
    assert_eq!(first["action"], "sync");
    assert_eq!(first["name"], "lobby");

    ws.send(Message::Text(
        r#"{"action":"chat","text":"first!"}"#.to_owned(),
    ))
    .await
    .unwrap();
    loop {
        let value = next_text(&mut ws).await;
        if value["action"] == "chat" {
            assert_eq!(value["text"], "first!");
            break;
        }
    }
}

#[tokio::test]
async fn invalid_connection_url_closes_with_4001() {
    let (addr, _manager) = serve().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/elsewhere"))
        .await
        .unwrap();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for the close")
            .expect("socket closed without a close frame")
            .expect("socket errored");
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame carries a code");
            assert_eq!(u16::from(frame.code), 4001);
            break;
        }
    }
}

#[tokio::test]
async fn unknown_room_closes_with_4002() {
    let (addr, _manager) = serve().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/room/nowhere"))
        .await
        .unwrap();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for the close")
            .expect("socket closed without a close frame")
            .expect("socket errored");
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame carries a code");
            assert_eq!(u16::from(frame.code), 4002);
            break;
        }
    }
}

#[tokio::test]
async fn kickme_closes_the_socket() {
    let (addr, _manager) = serve().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/room/lobby"))
        .await
        .unwrap();
    let first = next_text(&mut ws).await;
    assert_eq!(first["action"], "sync");

    ws.send(Message::Text(r#"{"action":"kickme"}"#.to_owned()))
        .await
        .unwrap();
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for the close")
            .expect("socket closed without a close frame")
            .expect("socket errored");
        if let Message::Close(frame) = msg {
            let frame = frame.expect("close frame carries a code");
            assert_eq!(u16::from(frame.code), 4000);
            break;
        }
    }
}
