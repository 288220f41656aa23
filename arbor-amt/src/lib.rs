//! # Arbor AMT
//!
//! A persistent array-mapped trie: a sparse array of byte-string values
//! indexed by `u64` keys, serialized as an immutable DAG of
//! content-addressed CBOR blocks.
//!
//! Each level of the trie consumes `bit_width` bits of the key, giving a
//! branching factor of `W = 2^bit_width`. Every write produces a new root;
//! roots are named by the hash of their serialized bytes, so equal logical
//! contents always share one id regardless of the order of operations that
//! produced them.
//!
//! # Design
//!
//! - **Lazy overlay**: a loaded tree materializes children from the store
//!   only when first touched; mutation dirties the path back to the root
//!   and [`Amt::flush`] persists exactly the dirty nodes
//! - **Canonical shape**: growth adds levels only when a key demands it and
//!   deletion collapses single-child chains at the top, so the flushed id
//!   is a pure function of the key-value contents
//! - **Shared-subtree diff**: [`diff`] walks two roots in lock-step and
//!   prunes every subtree pair with equal ids; [`diff_parallel`] fans the
//!   walk out across tasks
//!
//! # Example
//!
//! ```ignore
//! use arbor_amt::Amt;
//! use arbor_core::MemoryBlockstore;
//!
//! let mut amt = Amt::new(MemoryBlockstore::new());
//! amt.set(37, b"thing").await?;
//! let id = amt.flush().await?;
//!
//! let mut loaded = Amt::load(store.clone(), &id).await?;
//! assert_eq!(loaded.get(37).await?, Some(b"thing".to_vec()));
//! ```

mod amt;
mod diff;
mod error;
mod height;
mod node;
mod parallel;
mod wire;

pub use amt::Amt;
pub use diff::{diff, Change};
pub use error::{AmtError, Result};
pub use parallel::{diff_parallel, par_for_each};

/// Maximum addressable index. One less than `u64::MAX` so the count can
/// never overflow when every index is occupied.
pub const MAX_INDEX: u64 = u64::MAX - 1;

/// Bit width used by [`Amt::new`] (branching factor 8).
pub const DEFAULT_BIT_WIDTH: u32 = 3;

/// Upper bound on the persisted root height accepted at load.
pub const MAX_HEIGHT: u32 = 64;
