//! # Arbor Core
//!
//! Content-addressing substrate for the arbor data structures.
//!
//! This crate provides:
//! - `ContentId`: CIDv1 block identity (SHA2-256 multihash + multicodec)
//! - Block-store trait interfaces (`BlockRead`, `BlockWrite`, `BlockStore`)
//! - `MemoryBlockstore`: in-memory reference implementation
//! - Canonical CBOR encode/decode helpers
//!
//! ## Design Principles
//!
//! 1. **Async at the I/O seam only**: the store traits are the sole
//!    suspension points; everything above them is synchronous in-memory work
//! 2. **Canonical bytes**: equal logical content encodes to identical bytes
//!    and therefore identical ids
//! 3. **Typed absence**: a missing block is `Error::NotFound`, never a
//!    generic failure
//!
//! ## Example
//!
//! ```ignore
//! use arbor_core::{cbor, BlockStore, MemoryBlockstore, DAG_CBOR};
//!
//! let store = MemoryBlockstore::new();
//! let id = cbor::put_cbor(&store, DAG_CBOR, &record).await?;
//! let loaded: Record = cbor::get_cbor(&store, &id).await?;
//! ```

pub mod cbor;
pub mod content_id;
pub mod error;
pub mod store;

pub use content_id::{ContentId, DAG_CBOR};
pub use error::{Error, Result};
pub use store::{BlockRead, BlockStore, BlockWrite, MemoryBlockstore};
