//! Streaming write path.
//!
//! Kernel writes land in [`block`]s packed by the [`writer`] front door
//! and stream, strictly in order, through the [`uploader`]'s single
//! worker into a resumable store upload.

pub mod block;
pub mod uploader;
pub mod writer;

pub use writer::{BufferedWriter, WriteFileInfo};
