//! Receiver-side audio handling

pub mod buffer;

pub use buffer::{JitterBuffer, JitterBufferStats};
