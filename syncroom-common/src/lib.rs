mod protocol;
pub use protocol::*;

mod types;
pub use types::*;

use std::time::Duration;

/// Cadence at which the gateway pings every open socket.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Bus channel carrying service-wide broadcasts.
pub const ANNOUNCEMENT_CHANNEL: &str = "announcement";

/// Bus channel a room publishes its sync deltas and events on.
pub fn room_channel(name: &RoomName) -> String {
    format!("room:{name}")
}

/// Bus key holding the most recent full snapshot of a room.
pub fn room_sync_key(name: &RoomName) -> String {
    format!("room-sync:{name}")
}

/// Bus key a session token resolves through.
pub fn session_key(token: &str) -> String {
    format!("session:{token}")
}
