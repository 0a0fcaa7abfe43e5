//! Best-effort change notifications for the local consumer
//!
//! Registries publish here after every mutation, outside their critical
//! section. Nobody listening is the normal state when no UI is connected.

use tokio::sync::broadcast;

use crate::protocol::{StreamCommand, StreamDescriptor, ZoneId};

/// Capacity of the notification channel; slow consumers skip ahead
const NOTIFICATION_CAPACITY: usize = 256;

/// What changed
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PeersChanged,
    ZonesChanged,
    LibraryChanged,
    /// A stream command addressed to this node's local playback
    Stream {
        zone: ZoneId,
        command: StreamCommand,
        descriptor: StreamDescriptor,
    },
}

/// Fan-out handle shared by every registry
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { tx }
    }

    /// Publish a notification, never blocking and never failing
    pub fn publish(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::trace!("No local consumer connected, notification dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn consumer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
