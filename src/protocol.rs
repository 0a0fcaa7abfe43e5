//! Shared data model and message definitions
//!
//! Group messages travel between nodes (bincode over the group transport);
//! control messages travel between the node and its local UI (JSON over the
//! control WebSocket).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::NetworkError;
use crate::zones::ZoneProperties;

/// Track identifier, unique within one peer's catalog only
pub type TrackId = u32;

/// Peer identifier, unique within the registry
pub type PeerId = String;

/// Stable zone identity. Created once, never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(Uuid);

impl ZoneId {
    /// Create a fresh, isolated zone
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Address of a group member as handed out by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberAddress {
    /// Logical member name
    pub name: String,
    /// Unicast endpoint of the member
    pub addr: SocketAddr,
}

impl MemberAddress {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }
}

impl fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

/// A track in some peer's catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub title: String,
    pub artist: String,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Local file, only known on the owning peer
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Track {
    pub fn new(id: TrackId, title: impl Into<String>, artist: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            id,
            title: title.into(),
            artist: artist.into(),
            duration_ms,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

// Queue entries arrive without a path, so identity ignores it.
impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.artist == other.artist
            && self.duration_ms == other.duration_ms
    }
}

impl Eq for Track {}

/// A participating node (or external pseudo-peer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    /// Transport address; `None` for datagram pseudo-peers
    pub address: Option<MemberAddress>,
    pub ip: Option<IpAddr>,
    /// Visibility flag, false when the peer has gone private
    pub online: bool,
    pub zone: ZoneId,
    /// Remote controls and other non-member devices
    pub external: bool,
    pub catalog: Vec<Track>,
}

impl Peer {
    /// Create a visible peer in its own fresh zone
    pub fn new(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: None,
            ip: None,
            online: true,
            zone: ZoneId::new(),
            external: false,
            catalog: Vec::new(),
        }
    }

    /// Find a track of this peer's catalog equal to `track`
    pub fn holds(&self, track: &Track) -> Option<&Track> {
        self.catalog.iter().find(|t| *t == track)
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.catalog.iter().find(|t| t.id == id)
    }
}

/// Role of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Publisher,
    Receiver,
}

/// Stream control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamCommand {
    Setup,
    Play,
    Pause,
    Next,
    Teardown,
}

impl StreamCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamCommand::Setup => "setup",
            StreamCommand::Play => "play",
            StreamCommand::Pause => "pause",
            StreamCommand::Next => "next",
            StreamCommand::Teardown => "teardown",
        }
    }
}

/// Everything a peer needs to publish or receive one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub track_id: TrackId,
    pub title: String,
    /// Peer holding the file
    pub source: PeerId,
    pub duration_ms: u64,
    pub role: Role,
    /// Multicast group, set once the publisher has allocated it
    pub group: Option<Ipv4Addr>,
    pub port: u16,
    /// Where receivers send their setup acknowledgment
    pub publisher: Option<MemberAddress>,
}

impl StreamDescriptor {
    /// Descriptor asking `source` to publish `track`
    pub fn publish(track: &Track, source: impl Into<PeerId>, port: u16) -> Self {
        Self {
            track_id: track.id,
            title: track.title.clone(),
            source: source.into(),
            duration_ms: track.duration_ms,
            role: Role::Publisher,
            group: None,
            port,
            publisher: None,
        }
    }

    /// Receiver-facing copy of this descriptor
    pub fn for_receivers(&self) -> Self {
        Self {
            role: Role::Receiver,
            ..self.clone()
        }
    }
}

/// Edits to a zone's play queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueueChange {
    Front(Track),
    Back(Track),
    Remove(Track),
    Replace(Vec<Track>),
}

/// Messages exchanged between nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GroupMessage {
    /// Ask the elected member for its zone map
    StateRequest,
    /// Serialized zone map answering a state request
    StateTransfer(Vec<u8>),
    /// Ask a member to describe itself
    Discovery,
    /// Full descriptor of a peer, in reply to discovery or on change
    PeerData(Peer),
    PeerEdit { id: PeerId, name: String },
    PeerStatus { id: PeerId, online: bool, zone: ZoneId },
    PeerZone(Vec<(PeerId, ZoneId)>),
    ZoneMapping { zone: ZoneId, properties: ZoneProperties },
    QueueChange { zone: ZoneId, change: QueueChange },
    Stream {
        command: StreamCommand,
        descriptor: StreamDescriptor,
        zone: ZoneId,
    },
    StreamAck { track_id: TrackId, peer: PeerId, zone: ZoneId },
    Catalog { peer: PeerId, tracks: Vec<Track> },
    /// Ask every node to push fresh state to its local UI
    Update,
}

impl GroupMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            GroupMessage::StateRequest => "STATE_REQUEST",
            GroupMessage::StateTransfer(_) => "STATE_TRANSFER",
            GroupMessage::Discovery => "DISCOVERY",
            GroupMessage::PeerData(_) => "PEER_DATA",
            GroupMessage::PeerEdit { .. } => "PEER_EDIT",
            GroupMessage::PeerStatus { .. } => "PEER_STATUS",
            GroupMessage::PeerZone(_) => "PEER_ZONE",
            GroupMessage::ZoneMapping { .. } => "ZONE_MAPPING",
            GroupMessage::QueueChange { .. } => "QUEUE_CHANGE",
            GroupMessage::Stream { .. } => "STREAMING",
            GroupMessage::StreamAck { .. } => "STREAMING_ACK",
            GroupMessage::Catalog { .. } => "CATALOG",
            GroupMessage::Update => "UPDATE",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        bincode::serialize(self).map_err(|e| NetworkError::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, NetworkError> {
        bincode::deserialize(data).map_err(|e| NetworkError::Serialization(e.to_string()))
    }
}

/// Peer/zone pair of a zone reassignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerZone {
    pub peer: PeerId,
    pub zone: ZoneId,
}

/// Zone map entry as shown to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneEntry {
    pub zone: ZoneId,
    pub properties: ZoneProperties,
}

/// Messages on the local control channel, in both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlMessage {
    // UI -> node
    RequestUpdate,
    GetLocalPeer,
    Rename { name: String },
    SetCatalog { tracks: Vec<Track> },
    PeerZoneChange { peers: Vec<PeerZone> },
    PeerStatusChange { online: bool },
    NewZone { zone: ZoneId, properties: ZoneProperties },
    QueueFront { zone: ZoneId, track: Track },
    QueueBack { zone: ZoneId, track: Track },
    QueueRemove { zone: ZoneId, track: Track },
    NewQueue { zone: ZoneId, tracks: Vec<Track> },
    SetPassword { zone: ZoneId, password: Option<String> },
    Authorize { zone: ZoneId, password: String },
    Stream { zone: ZoneId, action: StreamCommand },

    // node -> UI
    PeerList { peers: Vec<Peer> },
    ZoneMap { zones: Vec<ZoneEntry> },
    Library { tracks: Vec<Track> },
    LocalPeer { peer: Peer },
    StreamEvent {
        zone: ZoneId,
        action: StreamCommand,
        descriptor: StreamDescriptor,
    },
    AuthResult { zone: ZoneId, granted: bool },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_identity_ignores_path() {
        let queued = Track::new(3, "Song", "Band", 180_000);
        let local = queued.clone().with_path("/music/song.mp3");
        assert_eq!(queued, local);
        assert_ne!(queued, Track::new(4, "Song", "Band", 180_000));
    }

    #[test]
    fn test_group_message_survives_the_wire() {
        let mut peer = Peer::new("T1", "Kitchen");
        peer.catalog.push(Track::new(1, "A", "B", 1000).with_path("/a.mp3"));
        let encoded = GroupMessage::PeerData(peer.clone()).encode().unwrap();

        match GroupMessage::decode(&encoded).unwrap() {
            GroupMessage::PeerData(decoded) => {
                assert_eq!(decoded.id, "T1");
                assert_eq!(decoded.zone, peer.zone);
                assert_eq!(decoded.catalog[0].path, peer.catalog[0].path);
            }
            other => panic!("unexpected message {}", other.kind()),
        }
    }

    #[test]
    fn test_control_message_json_shape() {
        let zone = ZoneId::new();
        let msg = ControlMessage::Stream {
            zone,
            action: StreamCommand::Next,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["command"], "stream");
        assert_eq!(json["action"], "next");
        assert_eq!(json["zone"], zone.to_string());

        let parsed: ControlMessage =
            serde_json::from_str(r#"{"command":"request_update"}"#).unwrap();
        assert!(matches!(parsed, ControlMessage::RequestUpdate));
    }
}
