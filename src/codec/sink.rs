//! Receiver sinks

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec::{CodecStats, Frame, FrameSink};
use crate::error::CodecError;

/// Appends every frame to a file or named pipe for an external player
pub struct PipeSink {
    file: Option<File>,
    path: PathBuf,
    stats: CodecStats,
}

impl PipeSink {
    pub fn open(path: &Path) -> Result<Self, CodecError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CodecError::SinkOpen(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            stats: CodecStats::default(),
        })
    }

    pub fn stats(&self) -> &CodecStats {
        &self.stats
    }
}

impl FrameSink for PipeSink {
    fn consume_frame(&mut self, frame: &Frame) -> Result<(), CodecError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CodecError::WriteFailed(format!("{} is closed", self.path.display())))?;

        if let Err(e) = file.write_all(&frame.payload) {
            self.stats.errors += 1;
            return Err(CodecError::WriteFailed(e.to_string()));
        }
        self.stats.frames += 1;
        self.stats.bytes += frame.payload.len() as u64;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}

/// Discards frames, counting them
#[derive(Default)]
pub struct NullSink {
    stats: CodecStats,
}

impl NullSink {
    pub fn stats(&self) -> &CodecStats {
        &self.stats
    }
}

impl FrameSink for NullSink {
    fn consume_frame(&mut self, frame: &Frame) -> Result<(), CodecError> {
        self.stats.frames += 1;
        self.stats.bytes += frame.payload.len() as u64;
        Ok(())
    }

    fn close(&mut self) {}
}
