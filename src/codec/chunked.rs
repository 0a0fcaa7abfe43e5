//! Chunked file codec
//!
//! Streams a file as fixed-size chunks without decoding it. Each chunk's
//! duration is derived from a nominal bitrate, which is enough to pace
//! compressed audio at roughly real time.

use bytes::Bytes;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::sink::{NullSink, PipeSink};
use crate::codec::{AudioCodec, CodecStats, Frame, FrameSink, FrameSource};
use crate::config::StreamingConfig;
use crate::error::CodecError;
use crate::protocol::StreamDescriptor;

/// Duration of `bytes` at `bitrate_kbps`
pub fn chunk_duration(bytes: usize, bitrate_kbps: u32) -> Duration {
    if bitrate_kbps == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(bytes as u64 * 8_000 / bitrate_kbps as u64)
}

/// Source reading a file in fixed-size chunks
pub struct ChunkedSource {
    file: Option<File>,
    path: PathBuf,
    buffer: Vec<u8>,
    bitrate_kbps: u32,
    stats: CodecStats,
}

impl ChunkedSource {
    pub fn open(path: &Path, frame_bytes: usize, bitrate_kbps: u32) -> Result<Self, CodecError> {
        let file = File::open(path).map_err(|e| CodecError::SourceOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            buffer: vec![0u8; frame_bytes.max(1)],
            bitrate_kbps,
            stats: CodecStats::default(),
        })
    }

    pub fn stats(&self) -> &CodecStats {
        &self.stats
    }
}

impl FrameSource for ChunkedSource {
    fn produce_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(None),
        };

        // Fill the chunk unless the file ends first
        let mut filled = 0;
        while filled < self.buffer.len() {
            match file.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.stats.errors += 1;
                    return Err(CodecError::ReadFailed(format!("{}: {}", self.path.display(), e)));
                }
            }
        }

        if filled == 0 {
            return Ok(None);
        }

        self.stats.frames += 1;
        self.stats.bytes += filled as u64;
        Ok(Some(Frame::new(
            Bytes::copy_from_slice(&self.buffer[..filled]),
            chunk_duration(filled, self.bitrate_kbps),
        )))
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            tracing::debug!(
                "Closed {} after {} frames ({} bytes)",
                self.path.display(),
                self.stats.frames,
                self.stats.bytes
            );
        }
    }
}

/// Codec pairing [`ChunkedSource`] with a pipe or null sink
#[derive(Debug, Clone)]
pub struct ChunkedFileCodec {
    frame_bytes: usize,
    bitrate_kbps: u32,
    output: Option<PathBuf>,
}

impl ChunkedFileCodec {
    pub fn new(frame_bytes: usize, bitrate_kbps: u32, output: Option<PathBuf>) -> Self {
        Self {
            frame_bytes,
            bitrate_kbps,
            output,
        }
    }

    pub fn from_config(config: &StreamingConfig) -> Self {
        Self::new(config.frame_bytes, config.bitrate_kbps, config.output.clone())
    }
}

impl AudioCodec for ChunkedFileCodec {
    fn open_source(&self, path: &Path) -> Result<Box<dyn FrameSource>, CodecError> {
        Ok(Box::new(ChunkedSource::open(path, self.frame_bytes, self.bitrate_kbps)?))
    }

    fn open_sink(&self, descriptor: &StreamDescriptor) -> Result<Box<dyn FrameSink>, CodecError> {
        match &self.output {
            Some(path) => {
                tracing::debug!("Writing track {} to {}", descriptor.track_id, path.display());
                Ok(Box::new(PipeSink::open(path)?))
            }
            None => Ok(Box::new(NullSink::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_chunk_duration() {
        // 1024 bytes at 320 kbit/s
        assert_eq!(chunk_duration(1024, 320), Duration::from_micros(25_600));
        assert_eq!(chunk_duration(1024, 0), Duration::ZERO);
    }

    #[test]
    fn test_source_splits_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 2500]).unwrap();

        let mut source = ChunkedSource::open(file.path(), 1000, 128).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| source.produce_frame().unwrap())
            .map(|f| f.payload.len())
            .collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(source.stats().bytes, 2500);

        source.close();
        assert!(source.produce_frame().unwrap().is_none());
    }

    #[test]
    fn test_missing_file() {
        let result = ChunkedSource::open(Path::new("/nonexistent/track.mp3"), 1000, 128);
        assert!(matches!(result, Err(CodecError::SourceOpen { .. })));
    }
}
