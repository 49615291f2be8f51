//! Mesh wire protocol.
//!
//! JSON text frames over a WebSocket, discriminated by a `type` field:
//!
//! ```text
//! client → server   {"type":"join","node_id":..,"token":..,"capabilities":[..],"name":..}
//! server → client   {"type":"joined","mesh":{..}}
//! server → client   {"type":"ping","timestamp":..}      (auto-answered with pong)
//! either            {"type":"llm_request","request_id":"req-1",..}
//! either            {"type":"gossip","topic":"endpoint_update","data":{..}}
//! either            {"type":"message","from":..,"payload":{..inner frame..}}
//! ```
//!
//! Also holds the out-of-band encodings: signed and legacy join tokens,
//! candidate endpoint sets and invite URIs.

mod address;
mod invite;
mod message;
mod token;

pub use address::{classify_address, normalize_ws_url};
pub use invite::{MeshEndpoints, MeshInvite, INVITE_SCHEME};
pub use message::{MeshMessage, PeerInfo, Relayed, KNOWN_TYPES, MAX_ENVELOPE_DEPTH};
pub use token::{JoinToken, LegacyToken, MeshToken};

/// Path appended to addresses that do not already name a WebSocket route.
pub const DEFAULT_WS_PATH: &str = "/api/ws";

/// Gossip topics that carry a peer's [`MeshEndpoints`].
pub const ENDPOINT_TOPICS: [&str; 2] = ["endpoint_update", "announce"];

/// Topic used when announcing our own endpoints.
pub const ENDPOINT_UPDATE_TOPIC: &str = "endpoint_update";
