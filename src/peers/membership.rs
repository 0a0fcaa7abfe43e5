//! Membership tracking
//!
//! Reacts to transport view changes: peers whose address left the view are
//! dropped, and every newly seen address gets one discovery request. There is
//! no retry; a missed reply is picked up again by the next view change.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::network::messenger::Messenger;
use crate::network::transport::View;
use crate::peers::PeerRegistry;
use crate::protocol::{GroupMessage, MemberAddress, PeerId};

/// Result of diffing a view against the registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDiff {
    pub left: Vec<MemberAddress>,
    pub joined: Vec<MemberAddress>,
}

/// Keeps the peer registry in step with the transport view
pub struct MembershipTracker {
    registry: Arc<PeerRegistry>,
    messenger: Messenger,
    mobile_marker: String,
    /// View handlers run one at a time, in no guaranteed order
    serial: Mutex<()>,
}

impl MembershipTracker {
    pub fn new(registry: Arc<PeerRegistry>, messenger: Messenger, mobile_marker: impl Into<String>) -> Self {
        Self {
            registry,
            messenger,
            mobile_marker: mobile_marker.into(),
            serial: Mutex::new(()),
        }
    }

    /// `left = known - current`, `joined = current - known`
    pub fn diff(known: &[MemberAddress], view: &View) -> ViewDiff {
        let left = known
            .iter()
            .filter(|a| !view.contains(a))
            .cloned()
            .collect();
        let joined = view
            .members
            .iter()
            .filter(|m| !known.contains(m))
            .cloned()
            .collect();
        ViewDiff { left, joined }
    }

    /// Handle one view change
    pub async fn on_view_changed(&self, view: View) -> ViewDiff {
        let _guard = self.serial.lock().await;
        tracing::trace!("Detected change in peers ({} members)", view.len());

        let known = self.registry.addresses();
        let diff = Self::diff(&known, &view);

        if !diff.left.is_empty() {
            let dead: Vec<PeerId> = self
                .registry
                .all()
                .into_iter()
                .filter(|p| p.address.as_ref().map_or(false, |a| diff.left.contains(a)))
                .map(|p| {
                    tracing::trace!("Removing peer {} ({})", p.name, p.id);
                    p.id
                })
                .collect();
            self.registry.remove_all(&dead);
        }

        let external = self.messenger.external();
        for address in external.list() {
            if !view.contains(&address) && external.remove(&address) {
                tracing::debug!("Mobile member {} left the group", address);
            }
        }

        for address in &diff.joined {
            tracing::trace!("Detected new peer at {}", address);
            self.messenger.send_logged(address, &GroupMessage::Discovery);
        }

        diff
    }

    /// Record the source of a discovery request if it looks like a mobile
    /// client. Returns true when newly registered.
    pub fn on_discovery_request(&self, from: &MemberAddress) -> bool {
        if !from.name.contains(&self.mobile_marker) {
            return false;
        }
        let added = self.messenger.external().insert(from.clone());
        if added {
            tracing::debug!("Registered mobile member {}", from);
        }
        added
    }
}
