//! Stream ingestion: one [`worker::StreamWorker`] per camera connects,
//! samples frames into the shared queue, buffers pre-roll and records
//! clips on command.

pub mod capture;
pub mod preroll;
pub mod producer;
pub mod recorder;
pub mod source;
pub mod worker;

pub use capture::{FfmpegClipWriters, FfmpegConnector};
pub use producer::FrameProducer;
pub use source::{ClipWriter, ClipWriterFactory, FrameReader, StreamConnector, StreamError, StreamInfo};
pub use worker::{StreamWorker, WorkerExit};
