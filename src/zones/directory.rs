//! Zone directory
//!
//! Owns every zone's properties and play queue. All access goes through one
//! lock per directory; notifications are published after it is released.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::ZoneError;
use crate::events::{Notification, Notifier};
use crate::protocol::{QueueChange, Track, ZoneEntry, ZoneId};
use crate::zones::ZoneProperties;

/// Zone map shared by the whole node
pub struct ZoneDirectory {
    zones: RwLock<HashMap<ZoneId, ZoneProperties>>,
    notifier: Notifier,
}

impl ZoneDirectory {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            zones: RwLock::new(HashMap::new()),
            notifier,
        }
    }

    /// Unconditional upsert, last writer wins
    pub fn put(&self, zone: ZoneId, properties: ZoneProperties) {
        tracing::trace!("Putting zone {} ({})", zone, properties.name);
        self.zones.write().insert(zone, properties);
        self.notifier.publish(Notification::ZonesChanged);
    }

    /// Insert a zone only if it is not known yet. Returns true if inserted.
    pub fn ensure(&self, zone: ZoneId, name: &str) -> bool {
        let inserted = {
            let mut zones = self.zones.write();
            if zones.contains_key(&zone) {
                false
            } else {
                zones.insert(zone, ZoneProperties::new(name));
                true
            }
        };
        if inserted {
            self.notifier.publish(Notification::ZonesChanged);
        }
        inserted
    }

    pub fn queue_add_front(&self, zone: ZoneId, track: Track) -> Result<(), ZoneError> {
        self.mutate(zone, |props| props.add_front(track))
    }

    pub fn queue_add_back(&self, zone: ZoneId, track: Track) -> Result<(), ZoneError> {
        self.mutate(zone, |props| props.add_back(track))
    }

    /// Remove a queued track. Removing a track that is not queued is not an
    /// error; the result says whether anything changed.
    pub fn queue_remove(&self, zone: ZoneId, track: &Track) -> Result<bool, ZoneError> {
        self.mutate(zone, |props| props.remove(track))
    }

    pub fn queue_replace(&self, zone: ZoneId, tracks: Vec<Track>) -> Result<(), ZoneError> {
        self.mutate(zone, |props| props.replace(tracks))
    }

    /// Apply a queue edit received from the group
    pub fn apply(&self, zone: ZoneId, change: QueueChange) -> Result<(), ZoneError> {
        match change {
            QueueChange::Front(track) => self.queue_add_front(zone, track),
            QueueChange::Back(track) => self.queue_add_back(zone, track),
            QueueChange::Remove(track) => self.queue_remove(zone, &track).map(|_| ()),
            QueueChange::Replace(tracks) => self.queue_replace(zone, tracks),
        }
    }

    /// Track currently playing in the zone
    pub fn current(&self, zone: ZoneId) -> Option<Track> {
        self.zones.read().get(&zone).and_then(|p| p.current().cloned())
    }

    pub fn properties_of(&self, zone: ZoneId) -> Result<ZoneProperties, ZoneError> {
        self.zones
            .read()
            .get(&zone)
            .cloned()
            .ok_or(ZoneError::UnknownZone(zone))
    }

    /// Password check. No lockout on repeated failures.
    pub fn authorize(&self, zone: ZoneId, password: &str) -> bool {
        self.zones
            .read()
            .get(&zone)
            .map(|p| p.authorize(password))
            .unwrap_or(false)
    }

    pub fn set_password(&self, zone: ZoneId, password: Option<String>) -> Result<(), ZoneError> {
        self.mutate(zone, |props| props.password = password)
    }

    pub fn contains(&self, zone: ZoneId) -> bool {
        self.zones.read().contains_key(&zone)
    }

    pub fn len(&self) -> usize {
        self.zones.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.read().is_empty()
    }

    /// Every zone, ordered by name
    pub fn snapshot(&self) -> Vec<ZoneEntry> {
        let mut entries: Vec<ZoneEntry> = self
            .zones
            .read()
            .iter()
            .map(|(zone, properties)| ZoneEntry {
                zone: *zone,
                properties: properties.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.properties.name.cmp(&b.properties.name));
        entries
    }

    /// Serialize the whole map for a joining node
    pub fn provide_state(&self) -> Result<Vec<u8>, ZoneError> {
        let zones = self.zones.read();
        bincode::serialize(&*zones).map_err(|e| ZoneError::State(e.to_string()))
    }

    /// Merge a map received at join time. Returns the number of zones merged.
    pub fn adopt_state(&self, state: &[u8]) -> Result<usize, ZoneError> {
        let zones: HashMap<ZoneId, ZoneProperties> =
            bincode::deserialize(state).map_err(|e| ZoneError::State(e.to_string()))?;
        let count = zones.len();
        for (zone, properties) in zones {
            self.put(zone, properties);
        }
        tracing::debug!("Adopted {} zones from the group", count);
        Ok(count)
    }

    fn mutate<T>(
        &self,
        zone: ZoneId,
        f: impl FnOnce(&mut ZoneProperties) -> T,
    ) -> Result<T, ZoneError> {
        let result = {
            let mut zones = self.zones.write();
            let props = zones.get_mut(&zone).ok_or(ZoneError::UnknownZone(zone))?;
            f(props)
        };
        self.notifier.publish(Notification::ZonesChanged);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn track(id: u32) -> Track {
        Track::new(id, format!("Song {}", id), "Artist", 1000)
    }

    fn directory_with_zone() -> (ZoneDirectory, ZoneId) {
        let directory = ZoneDirectory::new(Notifier::new());
        let zone = ZoneId::new();
        directory.put(zone, ZoneProperties::new("Living Room"));
        (directory, zone)
    }

    #[test]
    fn test_put_is_last_writer_wins() {
        let (directory, zone) = directory_with_zone();
        directory.put(zone, ZoneProperties::new("Den"));
        assert_eq!(directory.properties_of(zone).unwrap().name, "Den");
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_unknown_zone_is_an_error() {
        let directory = ZoneDirectory::new(Notifier::new());
        let zone = ZoneId::new();
        assert_eq!(
            directory.queue_add_back(zone, track(1)),
            Err(ZoneError::UnknownZone(zone))
        );
        assert!(directory.current(zone).is_none());
        assert!(!directory.authorize(zone, ""));
    }

    #[test]
    fn test_remove_current_advances() {
        let (directory, zone) = directory_with_zone();
        directory.queue_add_back(zone, track(1)).unwrap();
        directory.queue_add_back(zone, track(2)).unwrap();
        assert_eq!(directory.current(zone), Some(track(1)));

        assert!(directory.queue_remove(zone, &track(1)).unwrap());
        assert_eq!(directory.current(zone), Some(track(2)));
        assert!(directory.queue_remove(zone, &track(2)).unwrap());
        assert_eq!(directory.current(zone), None);
    }

    #[test]
    fn test_state_round_trip_merges() {
        let (provider, zone) = directory_with_zone();
        provider.queue_add_back(zone, track(7)).unwrap();
        let state = provider.provide_state().unwrap();

        let (joiner, own_zone) = directory_with_zone();
        assert_eq!(joiner.adopt_state(&state).unwrap(), 1);
        assert_eq!(joiner.len(), 2);
        assert_eq!(joiner.current(zone), Some(track(7)));
        assert!(joiner.contains(own_zone));
    }

    #[test]
    fn test_password() {
        let (directory, zone) = directory_with_zone();
        directory.set_password(zone, Some("pw".into())).unwrap();
        assert!(directory.authorize(zone, "pw"));
        assert!(!directory.authorize(zone, "nope"));
    }

    #[test]
    fn test_mutation_notifies() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        let directory = ZoneDirectory::new(notifier);
        directory.put(ZoneId::new(), ZoneProperties::new("A"));
        assert_eq!(rx.try_recv().unwrap(), Notification::ZonesChanged);
    }

    proptest! {
        #[test]
        fn prop_tail_is_current(ops in proptest::collection::vec((any::<bool>(), 0u32..8), 1..40)) {
            let (directory, zone) = directory_with_zone();
            for (front, id) in ops {
                if front {
                    directory.queue_add_front(zone, track(id)).unwrap();
                    prop_assert_eq!(directory.current(zone), Some(track(id)));
                } else {
                    directory.queue_add_back(zone, track(id)).unwrap();
                }
                let props = directory.properties_of(zone).unwrap();
                let current = directory.current(zone);
                prop_assert_eq!(current.as_ref(), props.queue.last());
            }
        }
    }
}
