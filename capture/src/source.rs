//! I/O seams of a stream worker: where frames come from and where clips go.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use image::RgbImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("cannot connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("cannot probe {url}: {reason}")]
    Probe { url: String, reason: String },
    #[error("stream ended")]
    EndOfStream,
    #[error("read failed: {0}")]
    Read(String),
    #[error("clip writer: {0}")]
    Writer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Geometry and native rate of an open stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// Native frame rate.
    pub fps: f64,
}

/// An open stream connection.
pub trait FrameReader: Send {
    fn info(&self) -> StreamInfo;

    /// Block until the next decoded frame.  Any error ends the connection.
    fn read_frame(&mut self) -> Result<RgbImage, StreamError>;

    /// Release the connection.  Called exactly once.
    fn close(&mut self);
}

/// Opens connections for a stream worker.
pub trait StreamConnector: Send {
    fn connect(&mut self, url: &str) -> Result<Box<dyn FrameReader>, StreamError>;
}

/// An open clip file.
pub trait ClipWriter: Send {
    fn write(&mut self, frame: &RgbImage) -> Result<(), StreamError>;

    /// Flush and close.  Returns the path of the finished clip.
    fn finish(self: Box<Self>) -> Result<PathBuf, StreamError>;
}

/// Creates clip writers.
pub trait ClipWriterFactory: Send {
    fn open(
        &mut self,
        source: &str,
        started: DateTime<Utc>,
        info: StreamInfo,
    ) -> Result<Box<dyn ClipWriter>, StreamError>;
}
