//! Streaming sessions
//!
//! A publisher session streams one track of its own catalog to a multicast
//! group; receiver sessions on every peer of the zone listen to it.

pub mod allocator;
pub mod coordinator;
pub mod session;
pub mod worker;

pub use allocator::{AddressAllocator, MulticastScanner};
pub use coordinator::{AddOutcome, SessionInfo, StreamSessionCoordinator};
pub use session::{Effect, Input, Session, SessionState};
pub use worker::{SessionContext, SessionKey, StreamSettings};
