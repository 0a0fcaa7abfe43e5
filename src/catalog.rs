//! Track catalogs
//!
//! Each peer publishes its own catalog. The library shown to users is the
//! union of all of them with duplicates collapsed; playing a track means
//! finding a peer whose catalog holds it with a local file.

use std::path::Path;

use crate::protocol::{Peer, Track};
use crate::Result;

/// Union of every peer's catalog, first occurrence wins, without file paths
pub fn merged_library(peers: &[Peer]) -> Vec<Track> {
    let mut library: Vec<Track> = Vec::new();
    for track in peers.iter().flat_map(|p| p.catalog.iter()) {
        if !library.contains(track) {
            library.push(Track {
                path: None,
                ..track.clone()
            });
        }
    }
    library
}

/// Peer able to publish `track`, together with its own catalog entry.
/// Peers whose entry has no file are skipped.
pub fn locate_source(peers: &[Peer], track: &Track) -> Option<(Peer, Track)> {
    peers.iter().find_map(|peer| {
        peer.holds(track)
            .filter(|t| t.path.is_some())
            .map(|t| (peer.clone(), t.clone()))
    })
}

/// Read a catalog file produced by the tag scanner: a JSON array of tracks
pub fn load_catalog(path: &Path) -> Result<Vec<Track>> {
    let text = std::fs::read_to_string(path)?;
    let tracks: Vec<Track> = serde_json::from_str(&text)?;
    tracing::info!("Loaded {} tracks from {}", tracks.len(), path.display());
    Ok(tracks)
}
