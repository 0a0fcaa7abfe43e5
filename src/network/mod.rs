//! Network subsystem: group messaging, stream links and the external
//! device gateway

pub mod external;
pub mod group;
pub mod link;
pub mod memory;
pub mod messenger;
pub mod packet;
pub mod transport;
pub mod udp;

pub use external::{ExternalDeviceGateway, ZoneRequest};
pub use group::UdpGroupTransport;
pub use link::{FrameListener, FrameTransmitter, StreamLinks, UdpLinks};
pub use memory::{MemoryHub, MemoryLinks, MemoryTransport};
pub use messenger::{ExternalMembers, Messenger};
pub use packet::StreamPacket;
pub use transport::{GroupTransport, TransportEvent, View};
