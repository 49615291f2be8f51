//! # meshconn
//!
//! Multi-transport resilient mesh connectivity.
//!
//! meshconn keeps a device connected to its mesh peers over whatever media
//! are available (LAN WebSocket, cloud relay WebSocket, Wi-Fi Direct, BLE),
//! scoring each transport, failing over at send time and reconnecting in
//! the background.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                UI / service layer (status + events)             │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │  TransportProber               │  ResilientTransportManager     │
//! │  race endpoints, keep winner   │  keep all, health loop,        │
//! │  re-probe with hysteresis      │  backoff reconnects            │
//! ├────────────────────────────────┼────────────────────────────────┤
//! │  MeshLink                      │  ConnectionPool (per peer)     │
//! │  join handshake, dispatch,     │  preferred pointer, fallback   │
//! │  request correlation           │  chain, scored selection       │
//! ├────────────────────────────────┴────────────────────────────────┤
//! │           Transport + TransportMetrics (scoring)                │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐         │
//! │  │   LAN    │  │  Relay   │  │Wi-Fi Dir.│  │   BLE    │         │
//! │  │   (ws)   │  │  (wss)   │  │ (driver) │  │ (driver) │         │
//! │  └──────────┘  └──────────┘  └──────────┘  └──────────┘         │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)]  // Intentional score calculations
#![allow(clippy::cast_sign_loss)]            // Scores are always positive
#![allow(clippy::cast_precision_loss)]       // Acceptable for stats
#![allow(clippy::suboptimal_flops)]          // Clarity over micro-optimization
#![allow(clippy::similar_names)]             // peer/pool are intentionally named
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::cognitive_complexity)]      // Complex state machines
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::future_not_send)]           // Async internals
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod config;
pub mod error;
pub mod link;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod probe;
pub mod protocol;
pub mod transport;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::link::{LinkCredentials, LinkEvent, MeshLink, NodeIdentity};
    pub use crate::manager::{ManagerConfig, ManagerEvent, ResilientTransportManager};
    pub use crate::metrics::TransportMetrics;
    pub use crate::pool::ConnectionPool;
    pub use crate::probe::{EndpointConnector, ProbeEvent, TransportProber, WebSocketConnector};
    pub use crate::protocol::{MeshEndpoints, MeshInvite, MeshMessage, MeshToken};
    pub use crate::transport::{Transport, TransportConfig, TransportFactory};
    pub use crate::types::*;
}
