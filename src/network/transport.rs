//! Group transport contract
//!
//! The node only needs unicast send, broadcast, and a stream of inbound
//! messages and view changes. Delivery is per-sender FIFO at best; there is
//! no total order across senders.

use tokio::sync::mpsc;

use crate::error::NetworkError;
use crate::protocol::{GroupMessage, MemberAddress};

/// Transport-reported snapshot of reachable members.
/// Ordered; the first member is the oldest and acts as state provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct View {
    pub members: Vec<MemberAddress>,
}

impl View {
    pub fn new(members: Vec<MemberAddress>) -> Self {
        Self { members }
    }

    pub fn contains(&self, address: &MemberAddress) -> bool {
        self.members.contains(address)
    }

    /// Oldest member of the view
    pub fn coordinator(&self) -> Option<&MemberAddress> {
        self.members.first()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Inbound transport events
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message {
        from: MemberAddress,
        message: GroupMessage,
    },
    ViewChanged(View),
}

/// Narrow interface over the group communication mechanism
pub trait GroupTransport: Send + Sync {
    /// This node's own member address
    fn local_address(&self) -> MemberAddress;

    /// Send to one member
    fn send(&self, dest: &MemberAddress, message: &GroupMessage) -> Result<(), NetworkError>;

    /// Send to every member, including this node
    fn broadcast(&self, message: &GroupMessage) -> Result<(), NetworkError>;

    /// Take the inbound event stream. Only the first call gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
