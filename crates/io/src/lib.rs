//! # Tensile I/O
//!
//! Binary serialization primitives used by the persisted artifact format
//! and the executable payload encoders: a little-endian [`BinaryWriter`],
//! a bounds-checked [`MemoryReader`], and the [`Serializable`] trait that
//! ties the two together.
//!
//! All read failures surface as [`IoError`] values; nothing in this crate
//! panics on malformed input.

/// I/O error types and result handling
pub mod error;
/// Bounds-checked reader over an in-memory byte span
pub mod reader;
/// Serialization traits and array helpers
pub mod serializable;
/// Little-endian binary writer
pub mod writer;

pub use error::{IoError, IoResult};
pub use reader::MemoryReader;
pub use serializable::{Serializable, SerializableExt};
pub use writer::BinaryWriter;
