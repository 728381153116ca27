//! Types and pure algorithms shared by the capture and processing crates.

pub mod config;
pub mod detection;
pub mod discovery;
pub mod protocol;
pub mod runtime;
pub mod similarity;
pub mod tiling;
