//! # Zonecast
//!
//! Peers on a LAN pool their music catalogs, group themselves into zones with
//! a shared play queue, and stream the current track of a zone from whichever
//! peer holds it to every peer in that zone.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               NODE (zonecastd)                           │
//! │                                                                          │
//! │   GroupTransport events                      Local control (WebSocket)   │
//! │          │                                             │                 │
//! │          ▼                                             ▼                 │
//! │  ┌────────────────┐   view change   ┌──────────────────────────────────┐ │
//! │  │ MembershipTrack│───────────────▶ │           PeerRegistry           │ │
//! │  │ er (peers::)   │  DISCOVERY ───▶ │  ordered peers, catalogs, zones  │ │
//! │  └────────────────┘                 └──────────────────────────────────┘ │
//! │          │ message (one task each)                  ▲                    │
//! │          ▼                                          │ source lookup      │
//! │  ┌────────────────┐  queue edits    ┌──────────────────────────────────┐ │
//! │  │  Node dispatch │───────────────▶ │  ZoneDirectory (tail = current)  │ │
//! │  └────────────────┘                 └──────────────────────────────────┘ │
//! │          │ PLAY / PAUSE / NEXT / TEARDOWN / ACK                          │
//! │          ▼                                                               │
//! │  ┌──────────────────────────────────────────────────────────────────┐    │
//! │  │        SessionCoordinator (bounded pool, one task per session)   │    │
//! │  │  ┌───────────────┐   ┌───────────────┐   ┌───────────────┐       │    │
//! │  │  │ Publisher     │   │ Receiver      │   │ ...           │       │    │
//! │  │  │ alloc + acks  │   │ listen + ack  │   │               │       │    │
//! │  │  └──────┬────────┘   └──────▲────────┘   └───────────────┘       │    │
//! │  └─────────┼───────────────────┼────────────────────────────────────┘    │
//! └────────────┼───────────────────┼─────────────────────────────────────────┘
//!              │  UDP multicast    │
//!              └──▶ [TrackID|Seq|Timestamp|Payload] ──▶ every peer in zone
//! ```

pub mod audio;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod streaming;
pub mod ui;
pub mod zones;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default number of concurrent streaming sessions
    pub const DEFAULT_MAX_SESSIONS: usize = 6;

    /// Hard ceiling on concurrent streaming sessions
    pub const MAX_SESSIONS_CEILING: usize = 10;

    /// UDP port carrying audio frames for every stream
    pub const DEFAULT_STREAM_PORT: u16 = 5005;

    /// UDP port of the external device protocol
    pub const DEFAULT_EXTERNAL_PORT: u16 = 9997;

    /// Default HTTP/WebSocket port of the local control channel
    pub const DEFAULT_UI_PORT: u16 = 9998;

    /// Multicast group and port of the peer group transport
    pub const DEFAULT_GROUP_ADDRESS: &str = "239.255.42.99";
    pub const DEFAULT_GROUP_PORT: u16 = 45600;

    /// First multicast address publishers try for a stream
    pub const STARTING_MCAST_ADDRESS: &str = "226.0.0.0";

    /// How long a candidate address must stay silent to be considered free
    pub const DEFAULT_LISTEN_WINDOW_MS: u64 = 500;

    /// Bound on scan attempts before allocation fails
    pub const DEFAULT_MAX_SCAN_ATTEMPTS: u32 = 32;

    /// How long a publisher waits for its receivers to acknowledge setup
    pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5_000;

    /// Delay between removing the current track and starting the next one
    pub const DEFAULT_NEXT_SETTLE_MS: u64 = 10;

    /// Maximum datagram size for stream frames
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Maximum datagram size for group messages
    pub const MAX_GROUP_DATAGRAM: usize = 65_000;

    /// Member name fragment identifying mobile clients
    pub const DEFAULT_MOBILE_MARKER: &str = "localhost";
}
