//! Error types for the zonecast service

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::protocol::{TrackId, ZoneId};

/// Main error type for the service
#[derive(Error, Debug)]
pub enum Error {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Zone error: {0}")]
    Zone(#[from] ZoneError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer not found: {0}")]
    UnknownPeer(String),

    #[error("No peer holds track {0}")]
    NoSource(TrackId),
}

/// Zone directory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZoneError {
    #[error("Zone not found: {0}")]
    UnknownZone(ZoneId),

    #[error("Track {1} is not queued in zone {0}")]
    NotQueued(ZoneId, TrackId),

    #[error("Zone state could not be decoded: {0}")]
    State(String),
}

/// Streaming session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Session for track {0} not found")]
    NotFound(TrackId),

    #[error("Invalid transition: {command} while {state}")]
    InvalidTransition { state: &'static str, command: &'static str },

    #[error("Queue of zone {0} is empty")]
    EmptyQueue(ZoneId),

    #[error("Session pool is full ({0} sessions)")]
    PoolFull(usize),

    #[error("Invalid pool size: {0}")]
    InvalidPoolSize(usize),

    #[error("Track {0} has no local file")]
    MissingFile(TrackId),

    #[error("Session task for track {0} has stopped")]
    TaskGone(TrackId),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Invalid packet format")]
    InvalidPacket,

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("No free multicast address after {attempts} attempts from {start}")]
    NoFreeAddress { start: Ipv4Addr, attempts: u32 },

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Transport closed")]
    Closed,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to open source {path}: {reason}")]
    SourceOpen { path: String, reason: String },

    #[error("Failed to open sink: {0}")]
    SinkOpen(String),

    #[error("Reading frame failed: {0}")]
    ReadFailed(String),

    #[error("Writing frame failed: {0}")]
    WriteFailed(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type alias for the service
pub type Result<T> = std::result::Result<T, Error>;
