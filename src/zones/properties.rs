//! Zone metadata and play queue
//!
//! The queue is consumed from its tail: the last element is the track that is
//! currently playing, the element before it plays next, and index 0 plays
//! last.

use serde::{Deserialize, Serialize};

use crate::protocol::Track;

/// Human-readable properties and play queue of one zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneProperties {
    pub name: String,
    pub password: Option<String>,
    pub queue: Vec<Track>,
}

impl ZoneProperties {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            queue: Vec::new(),
        }
    }

    /// Track at the tail of the queue
    pub fn current(&self) -> Option<&Track> {
        self.queue.last()
    }

    /// "Play now": the track becomes the tail. An earlier entry of the same
    /// track moves rather than duplicates.
    pub fn add_front(&mut self, track: Track) {
        if let Some(pos) = self.queue.iter().position(|t| *t == track) {
            self.queue.remove(pos);
        }
        self.queue.push(track);
    }

    /// Enqueue: the track plays after everything already queued.
    /// On an empty queue it becomes current.
    pub fn add_back(&mut self, track: Track) {
        self.queue.insert(0, track);
    }

    /// Remove the tail-most entry equal to `track`
    pub fn remove(&mut self, track: &Track) -> bool {
        match self.queue.iter().rposition(|t| t == track) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Replace the whole queue; the new list's tail is current
    pub fn replace(&mut self, tracks: Vec<Track>) {
        self.queue = tracks;
    }

    /// Check a supplied password. Zones without one are open.
    pub fn authorize(&self, supplied: &str) -> bool {
        match &self.password {
            Some(password) => password == supplied,
            None => true,
        }
    }
}
