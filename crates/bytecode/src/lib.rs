//! Fugue bytecode front end.
//!
//! A compact little-endian binary format: header cookie, flag word,
//! extension list, a recursive root scope record, the global init block
//! and per-extension data buffers. The loader decodes it in two passes
//! (declare, then build); the writer is its exact inverse and
//! round-trips loader output byte-for-byte.

pub mod loader;
pub mod opcodes;
pub mod reader;
pub mod writer;

pub use loader::{load, load_with_extensions};
pub use reader::{ByteReader, LoadError};
pub use writer::write;
