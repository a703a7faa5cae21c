//! Conversion between captured media and its wire representation.
//!
//! Video frames are JPEG-compressed and length-prefixed; audio is raw PCM
//! passed through untouched in fixed-size chunks.

pub mod framing;
pub mod jpeg;

pub use framing::{FrameReader, Inbound};
