//! Root controller: height growth and collapse, count maintenance, and the
//! public operation surface over one in-memory tree.

use crate::error::{AmtError, Result};
use crate::height::nodes_for_height;
use crate::node::{Link, Node};
use crate::wire;
use crate::{DEFAULT_BIT_WIDTH, MAX_HEIGHT, MAX_INDEX};
use arbor_core::{BlockRead, BlockStore, ContentId, DAG_CBOR};

/// A persistent array-mapped trie over a content-addressed block store.
///
/// Values are opaque byte strings indexed by `u64` keys up to
/// [`MAX_INDEX`]. Mutations touch only the in-memory overlay; [`flush`]
/// persists every dirty node and returns the root id, which names an
/// immutable snapshot. A loaded tree is lazy: children exist as ids until
/// first touched.
///
/// A single tree is single-writer; separate loaded trees are independent
/// and may be used in parallel.
///
/// [`flush`]: Amt::flush
#[derive(Debug)]
pub struct Amt<S> {
    bit_width: u32,
    height: u32,
    count: u64,
    node: Node,
    store: S,
}

fn check_bit_width(bit_width: u32) -> Result<()> {
    if !(1..=18).contains(&bit_width) {
        return Err(AmtError::InvalidBitWidth(bit_width));
    }
    Ok(())
}

/// Fetch and validate a persisted root record, returning
/// `(height, count, node)`.
pub(crate) async fn load_root<S: BlockRead>(
    store: &S,
    id: &ContentId,
    bit_width: u32,
) -> Result<(u32, u64, Node)> {
    check_bit_width(bit_width)?;

    let bytes = store.get_block(id).await?;
    let root: wire::Root =
        arbor_core::cbor::from_slice(&bytes).map_err(|e| AmtError::decode(e.to_string()))?;

    if root.height > u64::from(MAX_HEIGHT) {
        return Err(AmtError::invalid_shape(format!(
            "height greater than {MAX_HEIGHT}: {}",
            root.height
        )));
    }
    let height = root.height as u32;

    // nodes_for_height saturates. If the capacity one level up is already
    // saturated, the capacity at this height must not be; otherwise the
    // height is implausible for any real tree.
    let max_nodes = nodes_for_height(bit_width, height + 1);
    if max_nodes == u64::MAX && nodes_for_height(bit_width, height) == u64::MAX {
        return Err(AmtError::invalid_shape(format!(
            "height {height} out of bounds for bit width {bit_width}"
        )));
    }
    if max_nodes < root.count {
        return Err(AmtError::invalid_shape(format!(
            "not tall enough ({height}) for count ({})",
            root.count
        )));
    }

    let node = Node::from_wire(root.node, bit_width, height == 0, height == 0)?;
    Ok((height, root.count, node))
}

impl<S: BlockStore> Amt<S> {
    /// Create an empty tree with the default bit width.
    pub fn new(store: S) -> Self {
        Self::new_with_bit_width(store, DEFAULT_BIT_WIDTH)
            .expect("default bit width is always valid")
    }

    /// Create an empty tree with an explicit bit width (`1..=18`).
    pub fn new_with_bit_width(store: S, bit_width: u32) -> Result<Self> {
        check_bit_width(bit_width)?;
        Ok(Self {
            bit_width,
            height: 0,
            count: 0,
            node: Node::default(),
            store,
        })
    }

    /// Load a tree from a flushed root id, using the default bit width.
    pub async fn load(store: S, id: &ContentId) -> Result<Self> {
        Self::load_with_bit_width(store, id, DEFAULT_BIT_WIDTH).await
    }

    /// Load a tree from a flushed root id.
    ///
    /// The bit width must be the one used when the tree was created; the
    /// persisted form carries no bit-width tag. A mismatch fails as soon as
    /// a node's bitmap length disagrees with the expected `⌈W/8⌉`.
    pub async fn load_with_bit_width(store: S, id: &ContentId, bit_width: u32) -> Result<Self> {
        let (height, count, node) = load_root(&store, id, bit_width).await?;
        Ok(Self {
            bit_width,
            height,
            count,
            node,
            store,
        })
    }

    /// Build a tree from consecutive values at indices `0..n` and flush it.
    pub async fn from_values<I>(store: S, values: I) -> Result<ContentId>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut amt = Self::new(store);
        amt.batch_set(values).await?;
        amt.flush().await
    }

    /// Store `value` at index `i`.
    pub async fn set(&mut self, i: u64, value: impl AsRef<[u8]>) -> Result<()> {
        if i > MAX_INDEX {
            return Err(AmtError::IndexOutOfRange { index: i });
        }

        // Grow only when the key is out of range, inserting exactly enough
        // single-child levels: the previous root becomes slot 0 of each new
        // level. An empty root grows by height alone.
        while i >= nodes_for_height(self.bit_width, self.height + 1) {
            if !self.node.is_empty() {
                let prev = std::mem::take(&mut self.node);
                self.node
                    .set_link(self.bit_width, 0, Link::Dirty(Box::new(prev)));
            }
            self.height += 1;
        }

        let added = self
            .node
            .set(
                &self.store,
                self.bit_width,
                self.height,
                i,
                value.as_ref().to_vec(),
            )
            .await?;

        if added {
            if self.count >= MAX_INDEX - 1 {
                return Err(AmtError::InvalidCount);
            }
            self.count += 1;
        }
        Ok(())
    }

    /// Set consecutive values at indices `0..n`.
    pub async fn batch_set<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        for (i, value) in values.into_iter().enumerate() {
            self.set(i as u64, value).await?;
        }
        Ok(())
    }

    /// Read the value at index `i`, if present.
    pub async fn get(&mut self, i: u64) -> Result<Option<Vec<u8>>> {
        if i > MAX_INDEX {
            return Err(AmtError::IndexOutOfRange { index: i });
        }
        if i >= nodes_for_height(self.bit_width, self.height + 1) {
            return Ok(None);
        }
        self.node
            .get(&self.store, self.bit_width, self.height, i)
            .await
    }

    /// Remove the value at index `i`, reporting whether it was present.
    pub async fn delete(&mut self, i: u64) -> Result<bool> {
        if i > MAX_INDEX {
            return Err(AmtError::IndexOutOfRange { index: i });
        }
        if i >= nodes_for_height(self.bit_width, self.height + 1) {
            return Ok(false);
        }
        if !self
            .node
            .delete(&self.store, self.bit_width, self.height, i)
            .await?
        {
            return Ok(false);
        }

        self.collapse().await?;

        if self.count == 0 {
            return Err(AmtError::InvalidCount);
        }
        self.count -= 1;
        Ok(true)
    }

    /// Delete a batch of indices.
    ///
    /// When `strict`, every index is verified present before the first
    /// deletion; a missing one surfaces as `NotFound` with the tree
    /// untouched. When not strict, absent indices are skipped and the
    /// return value reports whether anything was deleted.
    pub async fn batch_delete(&mut self, indices: &[u64], strict: bool) -> Result<bool> {
        let mut indices = indices.to_vec();
        indices.sort_unstable();
        indices.dedup();

        if strict {
            for &i in &indices {
                if self.get(i).await?.is_none() {
                    return Err(AmtError::NotFound { index: i });
                }
            }
        }

        let mut modified = false;
        for &i in &indices {
            modified |= self.delete(i).await?;
        }
        Ok(modified)
    }

    /// Delete from `self` every index present in `other`. Indices absent
    /// from `self` are skipped.
    pub async fn subtract<S2: BlockStore>(&mut self, other: &mut Amt<S2>) -> Result<()> {
        let mut indices = Vec::new();
        other
            .for_each(|i, _| {
                indices.push(i);
                Ok(())
            })
            .await?;
        for i in indices {
            self.delete(i).await?;
        }
        Ok(())
    }

    /// Visit every occupied index in ascending order.
    ///
    /// The visitor may stop the walk by returning an error, which surfaces
    /// unchanged.
    pub async fn for_each<F>(&mut self, f: F) -> Result<()>
    where
        F: FnMut(u64, &[u8]) -> Result<()> + Send,
    {
        self.for_each_from(0, f).await
    }

    /// Visit occupied indices `>= start` in ascending order.
    pub async fn for_each_from<F>(&mut self, start: u64, mut f: F) -> Result<()>
    where
        F: FnMut(u64, &[u8]) -> Result<()> + Send,
    {
        self.node
            .for_each_from(&self.store, self.bit_width, self.height, start, 0, &mut f)
            .await
    }

    /// The smallest occupied index, or `None` for an empty tree.
    pub async fn first_set_index(&mut self) -> Result<Option<u64>> {
        self.node
            .first_set_index(&self.store, self.bit_width, self.height)
            .await
    }

    /// Persist every dirty node and the root record, returning the root id.
    ///
    /// Flushing a clean tree re-puts only the (identical) root record, so
    /// the returned id is stable.
    pub async fn flush(&mut self) -> Result<ContentId> {
        let node = self
            .node
            .flush(&self.store, self.bit_width, self.height)
            .await?;
        let root = wire::Root {
            height: u64::from(self.height),
            count: self.count,
            node,
        };
        let bytes = arbor_core::cbor::to_vec(&root)?;
        let id = self.store.put_block(DAG_CBOR, &bytes).await?;
        tracing::debug!(height = self.height, count = self.count, id = %id, "flushed amt root");
        Ok(id)
    }

    /// Number of occupied indices.
    pub fn len(&self) -> u64 {
        self.count
    }

    /// Whether the tree holds no values.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current height of the root (leaves are at height 0).
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The configured bit width.
    pub fn bit_width(&self) -> u32 {
        self.bit_width
    }

    /// Restore the minimal-height invariant after a deletion: while the
    /// root's only occupied slot is 0, replace it with that child. A fully
    /// drained tree resets to height 0.
    async fn collapse(&mut self) -> Result<()> {
        while self.height > 0 {
            if self.node.has_links_beyond_first() {
                break;
            }
            match self.node.take_link(0) {
                None => {
                    self.node = Node::default();
                    self.height = 0;
                }
                Some(link) => {
                    let child = link
                        .take_node(&self.store, self.bit_width, self.height - 1)
                        .await?;
                    self.node = child;
                    self.height -= 1;
                }
            }
        }
        Ok(())
    }
}
