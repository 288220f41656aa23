//! Block-store traits for reading and writing content-addressed blocks.
//!
//! This module defines the storage seam the data structures are written
//! against. The traits are runtime-agnostic and use `async_trait` for async
//! support; the only suspension points in the whole system are behind them.
//!
//! ## Traits
//!
//! - `BlockRead`: read-only access (get, has)
//! - `BlockWrite`: content-addressed writes (put by hash)
//! - `BlockStore`: marker trait combining both
//!
//! ## Contract
//!
//! `put_block` is idempotent by hash: writing bytes that already exist is a
//! no-op returning the same id. `get_block` fails with the typed
//! [`Error::NotFound`](crate::Error::NotFound) when the block is absent, so
//! callers can distinguish absence from real I/O failure. `put_block` must
//! be safe to call concurrently; content addressing makes ordering between
//! concurrent puts of the same block irrelevant.

use crate::content_id::ContentId;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Read-only block access
#[async_trait]
pub trait BlockRead: Debug + Send + Sync {
    /// Read the raw bytes of the block named by `id`.
    ///
    /// Returns `Error::NotFound` if the block doesn't exist.
    async fn get_block(&self, id: &ContentId) -> Result<Vec<u8>>;

    /// Check whether a block exists for `id`.
    async fn has_block(&self, id: &ContentId) -> Result<bool>;
}

/// Content-addressed block writes
#[async_trait]
pub trait BlockWrite: Debug + Send + Sync {
    /// Store `bytes`, naming the block by its content hash tagged with
    /// `codec`. Returns the id. Idempotent.
    async fn put_block(&self, codec: u64, bytes: &[u8]) -> Result<ContentId>;
}

/// Full block-store capability marker
///
/// Single bound for backends that support all operations.
pub trait BlockStore: BlockRead + BlockWrite {}
impl<T: BlockRead + BlockWrite> BlockStore for T {}

/// A simple in-memory block store for tests and examples
///
/// Stores blocks in a HashMap behind `Arc<RwLock<...>>`; cloning shares the
/// map. Counts gets and puts so tests can assert that re-flushing a clean
/// tree performs no new writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockstore {
    data: Arc<RwLock<HashMap<ContentId, Vec<u8>>>>,
    gets: Arc<AtomicU64>,
    puts: Arc<AtomicU64>,
}

impl MemoryBlockstore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blocks held
    pub fn len(&self) -> usize {
        self.data.read().expect("RwLock poisoned").len()
    }

    /// Whether the store holds no blocks
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total `get_block` calls observed
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Total `put_block` calls observed
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlockRead for MemoryBlockstore {
    async fn get_block(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.data
            .read()
            .expect("RwLock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id.to_string()))
    }

    async fn has_block(&self, id: &ContentId) -> Result<bool> {
        Ok(self.data.read().expect("RwLock poisoned").contains_key(id))
    }
}

#[async_trait]
impl BlockWrite for MemoryBlockstore {
    async fn put_block(&self, codec: u64, bytes: &[u8]) -> Result<ContentId> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        let id = ContentId::new(codec, bytes);
        self.data
            .write()
            .expect("RwLock poisoned")
            .insert(id, bytes.to_vec());
        Ok(id)
    }
}
