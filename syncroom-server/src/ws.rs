use crate::{ClientManager, Frame};
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use syncroom_common::{CloseCode, RoomName};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::tungstenite::{
    handshake::server::{Request, Response},
    protocol::{frame::coding, CloseFrame},
    Message,
};
use tracing::{debug, warn};

const OUTBOX_BUFFER: usize = 64;

/// Connection URL prefix; the rest of the path names the room.
const ROOM_PATH_PREFIX: &str = "/api/room/";

/// Upgrades one accepted TCP stream to a websocket, wires it to a [`Client`]
/// and pumps frames both ways until the socket closes.
///
/// [`Client`]: crate::Client
pub async fn accept_connection(manager: Arc<ClientManager>, stream: TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut path = String::new();
    let mut token = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        path = req.uri().path().to_owned();
        token = req
            .headers()
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(session_token);
        Ok(resp)
    })
    .await?;

    let (mut sink, mut stream) = ws.split();
    let (outbox, mut outbox_rx) = mpsc::channel::<Frame>(OUTBOX_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            let result = match frame {
                Frame::Text(text) => sink.send(Message::Text(text)).await,
                Frame::Ping => sink.send(Message::Ping(Vec::new())).await,
                Frame::Close(code) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: coding::CloseCode::from(code.code()),
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            };
            if let Err(err) = result {
                debug!("socket write failed: {err}");
                break;
            }
        }
    });

    let Some(name) = room_name_of(&path) else {
        warn!(path, "invalid connection url");
        let _ = outbox
            .send(Frame::Close(CloseCode::InvalidConnectionUrl))
            .await;
        drop(outbox);
        let _ = writer.await;
        return Ok(());
    };

    let session = manager.resolve_session(token.as_deref()).await;
    let Ok(client) = manager.connect(session, outbox, name).await else {
        // connect already closed the socket with the right code
        let _ = writer.await;
        return Ok(());
    };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => client.on_message(&text).await,
            // pings are answered by the protocol layer
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {}
            Ok(Message::Close(_)) => break,
            Ok(Message::Frame(_)) => {}
            Err(err) => {
                debug!(client = %client.id, "socket read failed: {err}");
                break;
            }
        }
    }
    manager.on_close(&client).await;
    Ok(())
}

fn room_name_of(path: &str) -> Option<RoomName> {
    let rest = path.strip_prefix(ROOM_PATH_PREFIX)?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    rest.parse().ok()
}

fn session_token(cookies: &str) -> Option<String> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == "token").then(|| value.to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_names_come_from_the_connection_url() {
        assert_eq!(
            room_name_of("/api/room/movies").unwrap().as_str(),
            "movies"
        );
        assert!(room_name_of("/api/room/").is_none());
        assert!(room_name_of("/api/room/a/b").is_none());
        assert!(room_name_of("/somewhere/else").is_none());
        assert!(room_name_of("/api/room/bad name").is_none());
    }

    #[test]
    fn session_token_is_read_from_the_cookie_header() {
        assert_eq!(
            session_token("theme=dark; token=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(session_token("theme=dark"), None);
    }
}
