//! Content-addressable storage.
//!
//! Immutable blobs keyed by the SHA-256 of their uncompressed bytes:
//! - `digest`: the [`Digest`] identity type.
//! - `compress`: the [`Compressor`] seam and its built-in codecs.
//! - `store`: the on-disk [`ContentStore`].

pub mod compress;
pub mod digest;
pub mod store;

pub use compress::{Compressor, Uncompressed, ZstdCompressor};
pub use digest::Digest;
pub use store::ContentStore;
