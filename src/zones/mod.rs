//! Zones and their shared play queues

pub mod directory;
pub mod properties;

pub use directory::ZoneDirectory;
pub use properties::ZoneProperties;
