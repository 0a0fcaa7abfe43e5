//! Peer presence: the registry and the membership tracker feeding it

pub mod membership;
pub mod registry;

pub use membership::{MembershipTracker, ViewDiff};
pub use registry::PeerRegistry;
