//! Structural diff between two persisted roots.
//!
//! The walk descends both DAGs in lock-step and prunes any subtree pair
//! whose child ids are equal. The encoding is canonical, so byte-equal
//! blocks are logically equal and equal ids prove equal subtrees.

use crate::amt::load_root;
use crate::error::Result;
use crate::height::nodes_for_height;
use crate::node::Node;
use arbor_core::{BlockRead, ContentId};
use futures::future::BoxFuture;
use futures::FutureExt;

/// One record of the transformation of a previous tree into a current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The key is occupied in the current tree only.
    Add {
        /// Logical index of the entry
        key: u64,
        /// Value in the current tree
        after: Vec<u8>,
    },
    /// The key is occupied in the previous tree only.
    Remove {
        /// Logical index of the entry
        key: u64,
        /// Value in the previous tree
        before: Vec<u8>,
    },
    /// The key is occupied in both trees with different bytes.
    Modify {
        /// Logical index of the entry
        key: u64,
        /// Value in the previous tree
        before: Vec<u8>,
        /// Value in the current tree
        after: Vec<u8>,
    },
}

impl Change {
    /// The logical index this change applies to.
    pub fn key(&self) -> u64 {
        match self {
            Change::Add { key, .. } | Change::Remove { key, .. } | Change::Modify { key, .. } => {
                *key
            }
        }
    }

    pub(crate) fn add(key: u64, after: Vec<u8>) -> Self {
        Change::Add { key, after }
    }

    pub(crate) fn remove(key: u64, before: Vec<u8>) -> Self {
        Change::Remove { key, before }
    }
}

/// Compute the changes that transform the tree at `prev` into the tree at
/// `cur`.
///
/// Both roots must have been written with the same `bit_width` (the
/// persisted form carries no tag; this is the caller's contract). The two
/// stores may be distinct. Output order is not guaranteed.
pub async fn diff<P, C>(
    prev_store: &P,
    cur_store: &C,
    prev: &ContentId,
    cur: &ContentId,
    bit_width: u32,
) -> Result<Vec<Change>>
where
    P: BlockRead,
    C: BlockRead,
{
    let (prev_height, prev_count, prev_node) = load_root(prev_store, prev, bit_width).await?;
    let (cur_height, cur_count, cur_node) = load_root(cur_store, cur, bit_width).await?;

    let mut changes = Vec::new();
    let mut emit = |change| changes.push(change);

    if prev_count == 0 && cur_count != 0 {
        walk_all(
            cur_store, cur_node, bit_width, cur_height, 0, Change::add, &mut emit,
        )
        .await?;
    } else if prev_count != 0 && cur_count == 0 {
        walk_all(
            prev_store,
            prev_node,
            bit_width,
            prev_height,
            0,
            Change::remove,
            &mut emit,
        )
        .await?;
    } else {
        diff_node(
            prev_store, cur_store, bit_width, prev_node, prev_height, cur_node, cur_height, 0,
            &mut emit,
        )
        .await?;
    }

    Ok(changes)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn diff_node<'a, P, C>(
    prev_store: &'a P,
    cur_store: &'a C,
    bit_width: u32,
    mut prev: Node,
    prev_height: u32,
    mut cur: Node,
    cur_height: u32,
    offset: u64,
    emit: &'a mut (dyn FnMut(Change) + Send),
) -> BoxFuture<'a, Result<()>>
where
    P: BlockRead,
    C: BlockRead,
{
    async move {
        if prev_height == 0 && cur_height == 0 {
            diff_leaves(&prev, &cur, bit_width, offset, emit);
            return Ok(());
        }

        // Unequal heights: the growth rule puts the shorter tree's whole
        // range under the taller root's slot 0, so that slot pairs with the
        // shorter root (even when it is unoccupied) and every other slot is
        // a pure add or remove walk.
        if cur_height > prev_height {
            let sub_count = nodes_for_height(bit_width, cur_height);
            match cur.take_link(0) {
                Some(link) => {
                    let child = link.take_node(cur_store, bit_width, cur_height - 1).await?;
                    diff_node(
                        prev_store,
                        cur_store,
                        bit_width,
                        prev,
                        prev_height,
                        child,
                        cur_height - 1,
                        offset,
                        emit,
                    )
                    .await?;
                }
                None => {
                    walk_all(
                        prev_store,
                        prev,
                        bit_width,
                        prev_height,
                        offset,
                        Change::remove,
                        emit,
                    )
                    .await?;
                }
            }
            for (slot, link) in cur.into_links() {
                let child = link.take_node(cur_store, bit_width, cur_height - 1).await?;
                let offs = offset + slot as u64 * sub_count;
                walk_all(
                    cur_store,
                    child,
                    bit_width,
                    cur_height - 1,
                    offs,
                    Change::add,
                    emit,
                )
                .await?;
            }
            return Ok(());
        }

        if prev_height > cur_height {
            let sub_count = nodes_for_height(bit_width, prev_height);
            match prev.take_link(0) {
                Some(link) => {
                    let child = link
                        .take_node(prev_store, bit_width, prev_height - 1)
                        .await?;
                    diff_node(
                        prev_store,
                        cur_store,
                        bit_width,
                        child,
                        prev_height - 1,
                        cur,
                        cur_height,
                        offset,
                        emit,
                    )
                    .await?;
                }
                None => {
                    walk_all(
                        cur_store, cur, bit_width, cur_height, offset, Change::add, emit,
                    )
                    .await?;
                }
            }
            for (slot, link) in prev.into_links() {
                let child = link
                    .take_node(prev_store, bit_width, prev_height - 1)
                    .await?;
                let offs = offset + slot as u64 * sub_count;
                walk_all(
                    prev_store,
                    child,
                    bit_width,
                    prev_height - 1,
                    offs,
                    Change::remove,
                    emit,
                )
                .await?;
            }
            return Ok(());
        }

        // Equal interior heights: pair the child slots.
        let sub_count = nodes_for_height(bit_width, prev_height);
        for slot in 0..1usize << bit_width {
            let offs = offset + slot as u64 * sub_count;
            match (prev.take_link(slot), cur.take_link(slot)) {
                (None, None) => {}
                (Some(link), None) => {
                    let child = link
                        .take_node(prev_store, bit_width, prev_height - 1)
                        .await?;
                    walk_all(
                        prev_store,
                        child,
                        bit_width,
                        prev_height - 1,
                        offs,
                        Change::remove,
                        emit,
                    )
                    .await?;
                }
                (None, Some(link)) => {
                    let child = link.take_node(cur_store, bit_width, cur_height - 1).await?;
                    walk_all(
                        cur_store,
                        child,
                        bit_width,
                        cur_height - 1,
                        offs,
                        Change::add,
                        emit,
                    )
                    .await?;
                }
                (Some(prev_link), Some(cur_link)) => {
                    // Equal ids prove equal subtrees: skip the whole pair.
                    if prev_link.id().is_some() && prev_link.id() == cur_link.id() {
                        continue;
                    }
                    let prev_child = prev_link
                        .take_node(prev_store, bit_width, prev_height - 1)
                        .await?;
                    let cur_child = cur_link
                        .take_node(cur_store, bit_width, cur_height - 1)
                        .await?;
                    diff_node(
                        prev_store,
                        cur_store,
                        bit_width,
                        prev_child,
                        prev_height - 1,
                        cur_child,
                        cur_height - 1,
                        offs,
                        emit,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Emit one change per occupied leaf of `node`, built with `ctor`.
pub(crate) async fn walk_all<S: BlockRead>(
    store: &S,
    mut node: Node,
    bit_width: u32,
    height: u32,
    offset: u64,
    ctor: fn(u64, Vec<u8>) -> Change,
    emit: &mut (dyn FnMut(Change) + Send),
) -> Result<()> {
    node.for_each_from(store, bit_width, height, 0, offset, &mut |key, value| {
        emit(ctor(key, value.to_vec()));
        Ok(())
    })
    .await
}

/// Slot-aligned byte comparison of two leaves at the same height.
pub(crate) fn diff_leaves(
    prev: &Node,
    cur: &Node,
    bit_width: u32,
    offset: u64,
    emit: &mut (dyn FnMut(Change) + Send),
) {
    for slot in 0..1u64 << bit_width {
        let key = offset + slot;
        match (prev.value(slot), cur.value(slot)) {
            (None, None) => {}
            (None, Some(after)) => emit(Change::add(key, after.clone())),
            (Some(before), None) => emit(Change::remove(key, before.clone())),
            (Some(before), Some(after)) => {
                if before != after {
                    emit(Change::Modify {
                        key,
                        before: before.clone(),
                        after: after.clone(),
                    });
                }
            }
        }
    }
}
