//! Byte stream adapters.
//!
//! - [`SeekableStream`]: makes a forward-only source seekable by spooling
//! - [`DigestReader`]: size and MD5 computed while the bytes pass through

pub mod digest;
pub mod seekable;

pub use digest::DigestReader;
pub use seekable::{CHUNK_SIZE, SeekOrigin, SeekableStream};
