//! Remote tier.
//!
//! Submodules:
//! - `client`: the `RemoteBackend` trait seam and the caching/retrying client
//! - `s3`: S3-compatible backend (production)
//! - `memfs`: in-memory backend with fault injection (tests/dev)

pub mod client;
pub mod memfs;
pub mod s3;

pub use client::{CacheMode, RemoteBackend, RemoteClient, RemoteTuning};
