//! Audio codec contract
//!
//! Publishers pull frames from a [`FrameSource`]; receivers push them into a
//! [`FrameSink`]. The codec never paces itself: each frame carries its
//! playback duration and the session sleeps for it.

pub mod chunked;
pub mod sink;

use bytes::Bytes;
use std::path::Path;
use std::time::Duration;

use crate::error::CodecError;
use crate::protocol::StreamDescriptor;

pub use chunked::{ChunkedFileCodec, ChunkedSource};
pub use sink::{NullSink, PipeSink};

/// One encoded unit of audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    /// Playback time covered by this frame
    pub duration: Duration,
}

impl Frame {
    pub fn new(payload: Bytes, duration: Duration) -> Self {
        Self { payload, duration }
    }
}

/// Publisher side of the codec
pub trait FrameSource: Send {
    /// Next frame, or `None` at the end of the track
    fn produce_frame(&mut self) -> Result<Option<Frame>, CodecError>;

    fn close(&mut self);
}

/// Receiver side of the codec
pub trait FrameSink: Send {
    fn consume_frame(&mut self, frame: &Frame) -> Result<(), CodecError>;

    fn close(&mut self);
}

/// Opens sources and sinks for sessions
pub trait AudioCodec: Send + Sync {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, CodecError>;

    fn open_sink(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn FrameSink>, CodecError>;
}

/// Codec statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecStats {
    pub frames: u64,
    pub bytes: u64,
    pub errors: u64,
}
