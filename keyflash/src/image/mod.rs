//! Firmware image formats.

pub mod hex;

pub use hex::{HexImage, HexSegment};
