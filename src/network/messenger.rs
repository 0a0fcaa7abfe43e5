//! Outbound messaging with mobile fan-out
//!
//! Mobile clients join the group but do not receive group broadcasts
//! reliably, so every broadcast is also unicast to each registered mobile
//! member address.

use dashmap::DashSet;
use std::sync::Arc;

use crate::error::NetworkError;
use crate::network::transport::GroupTransport;
use crate::protocol::{GroupMessage, MemberAddress};

/// Set of member addresses known to be mobile/remote clients
#[derive(Default)]
pub struct ExternalMembers {
    addresses: DashSet<MemberAddress>,
}

impl ExternalMembers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the address was not registered yet
    pub fn insert(&self, address: MemberAddress) -> bool {
        self.addresses.insert(address)
    }

    pub fn remove(&self, address: &MemberAddress) -> bool {
        self.addresses.remove(address).is_some()
    }

    pub fn contains(&self, address: &MemberAddress) -> bool {
        self.addresses.contains(address)
    }

    pub fn list(&self) -> Vec<MemberAddress> {
        self.addresses.iter().map(|a| a.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Handle used by every component that talks to the group
#[derive(Clone)]
pub struct Messenger {
    transport: Arc<dyn GroupTransport>,
    external: Arc<ExternalMembers>,
}

impl Messenger {
    pub fn new(transport: Arc<dyn GroupTransport>, external: Arc<ExternalMembers>) -> Self {
        Self {
            transport,
            external,
        }
    }

    pub fn local_address(&self) -> MemberAddress {
        self.transport.local_address()
    }

    pub fn external(&self) -> &Arc<ExternalMembers> {
        &self.external
    }

    /// Send to one member
    pub fn send(&self, dest: &MemberAddress, message: &GroupMessage) -> Result<(), NetworkError> {
        tracing::trace!("Sending {} packet to {}", message.kind(), dest);
        self.transport.send(dest, message)
    }

    /// Broadcast to the group and every mobile member
    pub fn broadcast(&self, message: &GroupMessage) -> Result<(), NetworkError> {
        tracing::trace!("Sending {} packet to everyone", message.kind());
        self.transport.broadcast(message)?;

        for address in self.external.list() {
            if let Err(e) = self.transport.send(&address, message) {
                tracing::warn!("Failed to forward {} to mobile member {}: {}", message.kind(), address, e);
            }
        }
        Ok(())
    }

    /// Send, logging instead of propagating failures. Control messages are
    /// not retried beyond what the transport itself does.
    pub fn send_logged(&self, dest: &MemberAddress, message: &GroupMessage) {
        if let Err(e) = self.send(dest, message) {
            tracing::warn!("Failed to send {} to {}: {}", message.kind(), dest, e);
        }
    }

    pub fn broadcast_logged(&self, message: &GroupMessage) {
        if let Err(e) = self.broadcast(message) {
            tracing::warn!("Failed to broadcast {}: {}", message.kind(), e);
        }
    }
}
