//! In-memory node overlay: lazily loaded children above the persisted DAG.
//!
//! A [`Node`] holds width-`W` slot vectors for values (leaves) and links
//! (interior nodes); both stay unallocated until first touched, so an empty
//! node costs nothing. A [`Link`] tracks the overlay state of one child:
//!
//! - `Stored { cached: None }` — persisted only, the child exists as an id
//! - `Stored { cached: Some }` — materialized and clean, id still valid
//! - `Dirty` — materialized and mutated, id stale until the next flush
//!
//! Mutation marks links dirty bottom-up only after the recursive step has
//! succeeded, so a failed load leaves the overlay exactly as it was. Flush
//! walks post-order, re-encoding and putting every dirty child, and turns
//! each `Dirty` link back into a clean `Stored` one.

use crate::error::{AmtError, Result};
use crate::height::nodes_for_height;
use crate::wire;
use arbor_core::{BlockRead, BlockWrite, ContentId, DAG_CBOR};
use futures::future::BoxFuture;
use futures::FutureExt;

/// One child slot of an interior node.
#[derive(Debug)]
pub(crate) enum Link {
    /// Child known by id; `cached` holds the materialized node once loaded.
    Stored {
        id: ContentId,
        cached: Option<Box<Node>>,
    },
    /// Child mutated since the last flush; the persisted id is stale.
    Dirty(Box<Node>),
}

impl Link {
    /// The persisted id, if this link is clean.
    pub(crate) fn id(&self) -> Option<&ContentId> {
        match self {
            Link::Stored { id, .. } => Some(id),
            Link::Dirty(_) => None,
        }
    }

    /// Return the materialized child, fetching and caching it on first use.
    pub(crate) async fn load<S: BlockRead>(
        &mut self,
        store: &S,
        bit_width: u32,
        height: u32,
    ) -> Result<&mut Node> {
        match self {
            Link::Dirty(node) => Ok(node),
            Link::Stored { id, cached } => {
                if cached.is_none() {
                    let node = Node::load_block(store, id, bit_width, height).await?;
                    *cached = Some(Box::new(node));
                }
                Ok(cached.as_mut().expect("cached child was just populated"))
            }
        }
    }

    /// Consume the link, yielding its child by value.
    pub(crate) async fn take_node<S: BlockRead>(
        self,
        store: &S,
        bit_width: u32,
        height: u32,
    ) -> Result<Node> {
        match self {
            Link::Dirty(node) => Ok(*node),
            Link::Stored {
                cached: Some(node), ..
            } => Ok(*node),
            Link::Stored { id, cached: None } => {
                Node::load_block(store, &id, bit_width, height).await
            }
        }
    }

    /// Convert into the dirty state, invalidating the persisted id.
    ///
    /// The child must already be materialized; mutation paths guarantee this
    /// by loading before they descend.
    pub(crate) fn mark_dirty(&mut self) -> Result<()> {
        match self {
            Link::Dirty(_) => Ok(()),
            Link::Stored { cached, .. } => match cached.take() {
                Some(node) => {
                    *self = Link::Dirty(node);
                    Ok(())
                }
                None => Err(AmtError::invalid_shape("cannot mark an unloaded link dirty")),
            },
        }
    }
}

/// An in-memory trie node: parallel slot vectors for values and links.
///
/// Exactly one of the two is populated for any non-empty node; the root of
/// an empty tree has both unallocated.
#[derive(Debug, Default)]
pub(crate) struct Node {
    values: Vec<Option<Vec<u8>>>,
    links: Vec<Option<Link>>,
}

impl Node {
    /// Decode and validate a persisted node.
    ///
    /// `allow_empty` is true only for a height-0 root; `expect_leaf` says
    /// whether the caller's height puts this node at the leaf level. Every
    /// structural invariant of the wire format is checked here.
    pub(crate) fn from_wire(
        nd: wire::Node,
        bit_width: u32,
        allow_empty: bool,
        expect_leaf: bool,
    ) -> Result<Node> {
        let wire::Node {
            bitmap,
            links,
            values,
        } = nd;

        if !links.is_empty() && !values.is_empty() {
            return Err(AmtError::invalid_shape("node has both links and values"));
        }
        wire::check_bitmap(&bitmap, bit_width)?;

        let width = 1usize << bit_width;
        let mut node = Node::default();

        if !values.is_empty() {
            if !expect_leaf {
                return Err(AmtError::invalid_shape("leaf node not expected at this height"));
            }
            node.values = (0..width).map(|_| None).collect();
            let mut entries = values.into_iter();
            let mut taken = 0usize;
            for slot in 0..width {
                if wire::get_bit(&bitmap, slot) {
                    match entries.next() {
                        Some(v) => {
                            node.values[slot] = Some(v);
                            taken += 1;
                        }
                        None => {
                            return Err(AmtError::invalid_shape(format!(
                                "expected at least {} values, found {taken}",
                                taken + 1
                            )));
                        }
                    }
                }
            }
            if entries.next().is_some() {
                return Err(AmtError::invalid_shape(format!(
                    "more values than set bitmap bits ({taken} expected)"
                )));
            }
        } else if !links.is_empty() {
            if expect_leaf {
                return Err(AmtError::invalid_shape("expected leaf node at this height"));
            }
            node.links = (0..width).map(|_| None).collect();
            let mut entries = links.into_iter();
            let mut taken = 0usize;
            for slot in 0..width {
                if wire::get_bit(&bitmap, slot) {
                    match entries.next() {
                        Some(id) => {
                            if id.codec() != DAG_CBOR {
                                return Err(AmtError::invalid_shape(format!(
                                    "internal amt nodes must be dag-cbor, found codec {:#x}",
                                    id.codec()
                                )));
                            }
                            node.links[slot] = Some(Link::Stored { id, cached: None });
                            taken += 1;
                        }
                        None => {
                            return Err(AmtError::invalid_shape(format!(
                                "expected at least {} links, found {taken}",
                                taken + 1
                            )));
                        }
                    }
                }
            }
            if entries.next().is_some() {
                return Err(AmtError::invalid_shape(format!(
                    "more links than set bitmap bits ({taken} expected)"
                )));
            }
        } else if !allow_empty {
            return Err(AmtError::invalid_shape("unexpected empty amt node"));
        }

        Ok(node)
    }

    /// Fetch, decode, and validate the node block named by `id`.
    pub(crate) async fn load_block<S: BlockRead>(
        store: &S,
        id: &ContentId,
        bit_width: u32,
        height: u32,
    ) -> Result<Node> {
        let bytes = store.get_block(id).await?;
        let nd: wire::Node =
            arbor_core::cbor::from_slice(&bytes).map_err(|e| AmtError::decode(e.to_string()))?;
        Node::from_wire(nd, bit_width, false, height == 0)
    }

    /// Whether no slot is occupied.
    pub(crate) fn is_empty(&self) -> bool {
        self.links.iter().all(|l| l.is_none()) && self.values.iter().all(|v| v.is_none())
    }

    /// Whether any slot other than 0 holds a link. Collapse stops here.
    pub(crate) fn has_links_beyond_first(&self) -> bool {
        self.links.iter().skip(1).any(|l| l.is_some())
    }

    pub(crate) fn value(&self, i: u64) -> Option<&Vec<u8>> {
        self.values.get(i as usize).and_then(|v| v.as_ref())
    }

    fn set_value(&mut self, bit_width: u32, i: u64, v: Option<Vec<u8>>) {
        if self.values.is_empty() {
            if v.is_none() {
                return;
            }
            self.values = (0..1usize << bit_width).map(|_| None).collect();
        }
        self.values[i as usize] = v;
    }

    fn link_mut(&mut self, slot: usize) -> Option<&mut Link> {
        self.links.get_mut(slot).and_then(|l| l.as_mut())
    }

    pub(crate) fn set_link(&mut self, bit_width: u32, slot: usize, link: Link) {
        if self.links.is_empty() {
            self.links = (0..1usize << bit_width).map(|_| None).collect();
        }
        self.links[slot] = Some(link);
    }

    pub(crate) fn take_link(&mut self, slot: usize) -> Option<Link> {
        self.links.get_mut(slot).and_then(Option::take)
    }

    /// Iterate the occupied link slots by value, ascending.
    pub(crate) fn into_links(self) -> impl Iterator<Item = (usize, Link)> {
        self.links
            .into_iter()
            .enumerate()
            .filter_map(|(slot, link)| Some((slot, link?)))
    }

    /// Iterate the occupied value slots, ascending.
    pub(crate) fn occupied_values(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(slot, v)| v.as_deref().map(|v| (slot as u64, v)))
    }

    pub(crate) fn get<'a, S: BlockRead>(
        &'a mut self,
        store: &'a S,
        bit_width: u32,
        height: u32,
        i: u64,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        async move {
            if height == 0 {
                return Ok(self.value(i).cloned());
            }
            let sub_count = nodes_for_height(bit_width, height);
            let Some(link) = self.link_mut((i / sub_count) as usize) else {
                return Ok(None);
            };
            let child = link.load(store, bit_width, height - 1).await?;
            child.get(store, bit_width, height - 1, i % sub_count).await
        }
        .boxed()
    }

    pub(crate) fn set<'a, S: BlockRead>(
        &'a mut self,
        store: &'a S,
        bit_width: u32,
        height: u32,
        i: u64,
        value: Vec<u8>,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            if height == 0 {
                let already_set = self.value(i).is_some();
                self.set_value(bit_width, i, Some(value));
                return Ok(!already_set);
            }

            let sub_count = nodes_for_height(bit_width, height);
            let slot = (i / sub_count) as usize;

            // Take the link out of the slot (or start a fresh empty subtree)
            // and reinstall it only once the recursive set has succeeded, so
            // a failed load leaves the overlay unchanged.
            let existed = self.link_mut(slot).is_some();
            let mut link = self
                .take_link(slot)
                .unwrap_or_else(|| Link::Dirty(Box::new(Node::default())));

            match set_through(&mut link, store, bit_width, height - 1, i % sub_count, value).await {
                Ok(added) => {
                    link.mark_dirty()?;
                    self.set_link(bit_width, slot, link);
                    Ok(added)
                }
                Err(e) => {
                    if existed {
                        self.set_link(bit_width, slot, link);
                    }
                    Err(e)
                }
            }
        }
        .boxed()
    }

    pub(crate) fn delete<'a, S: BlockRead>(
        &'a mut self,
        store: &'a S,
        bit_width: u32,
        height: u32,
        i: u64,
    ) -> BoxFuture<'a, Result<bool>> {
        async move {
            if height == 0 {
                if self.value(i).is_none() {
                    return Ok(false);
                }
                self.set_value(bit_width, i, None);
                return Ok(true);
            }

            let sub_count = nodes_for_height(bit_width, height);
            let slot = (i / sub_count) as usize;
            let Some(mut link) = self.take_link(slot) else {
                return Ok(false);
            };

            match delete_through(&mut link, store, bit_width, height - 1, i % sub_count).await {
                Ok(None) => {
                    self.set_link(bit_width, slot, link);
                    Ok(false)
                }
                // Child drained entirely: the slot is cleared with it.
                Ok(Some(true)) => Ok(true),
                Ok(Some(false)) => {
                    link.mark_dirty()?;
                    self.set_link(bit_width, slot, link);
                    Ok(true)
                }
                Err(e) => {
                    self.set_link(bit_width, slot, link);
                    Err(e)
                }
            }
        }
        .boxed()
    }

    /// Visit occupied leaves in ascending key order, skipping keys below
    /// `start`. Subtrees whose whole key interval lies below `start` are
    /// never loaded. A visitor error stops the walk and surfaces unchanged.
    pub(crate) fn for_each_from<'a, S, F>(
        &'a mut self,
        store: &'a S,
        bit_width: u32,
        height: u32,
        start: u64,
        offset: u64,
        f: &'a mut F,
    ) -> BoxFuture<'a, Result<()>>
    where
        S: BlockRead,
        F: FnMut(u64, &[u8]) -> Result<()> + Send,
    {
        async move {
            if height == 0 {
                for (slot, v) in self.values.iter().enumerate() {
                    if let Some(v) = v {
                        let key = offset + slot as u64;
                        if key < start {
                            continue;
                        }
                        f(key, v)?;
                    }
                }
                return Ok(());
            }

            let sub_count = nodes_for_height(bit_width, height);
            for slot in 0..self.links.len() {
                let offs = offset + slot as u64 * sub_count;
                if start >= offs.saturating_add(sub_count) {
                    continue;
                }
                let Some(link) = self.links[slot].as_mut() else {
                    continue;
                };
                let child = link.load(store, bit_width, height - 1).await?;
                child
                    .for_each_from(store, bit_width, height - 1, start, offs, &mut *f)
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// The smallest occupied key, or `None` for an empty subtree.
    pub(crate) fn first_set_index<'a, S: BlockRead>(
        &'a mut self,
        store: &'a S,
        bit_width: u32,
        height: u32,
    ) -> BoxFuture<'a, Result<Option<u64>>> {
        async move {
            if height == 0 {
                return Ok(self
                    .values
                    .iter()
                    .position(|v| v.is_some())
                    .map(|slot| slot as u64));
            }

            let sub_count = nodes_for_height(bit_width, height);
            for slot in 0..self.links.len() {
                let Some(link) = self.links[slot].as_mut() else {
                    continue;
                };
                let child = link.load(store, bit_width, height - 1).await?;
                let ix = child.first_set_index(store, bit_width, height - 1).await?;
                return Ok(ix.map(|ix| ix + slot as u64 * sub_count));
            }
            Ok(None)
        }
        .boxed()
    }

    /// Post-order flush: re-encode and put every dirty child, then return
    /// this node's persisted form. Clean links are passed through untouched.
    pub(crate) fn flush<'a, S: BlockWrite>(
        &'a mut self,
        store: &'a S,
        bit_width: u32,
        height: u32,
    ) -> BoxFuture<'a, Result<wire::Node>> {
        async move {
            let mut out = wire::Node::empty(bit_width);

            if height == 0 {
                for (slot, v) in self.values.iter().enumerate() {
                    if let Some(v) = v {
                        out.values.push(v.clone());
                        wire::set_bit(&mut out.bitmap, slot);
                    }
                }
                return Ok(out);
            }

            for slot in 0..self.links.len() {
                let Some(link) = self.links[slot].as_mut() else {
                    continue;
                };
                let id = match link {
                    Link::Dirty(child) => {
                        let wire_child = child.flush(store, bit_width, height - 1).await?;
                        let bytes = arbor_core::cbor::to_vec(&wire_child)?;
                        let id = store.put_block(DAG_CBOR, &bytes).await?;
                        let cached = std::mem::take(child);
                        *link = Link::Stored {
                            id,
                            cached: Some(cached),
                        };
                        id
                    }
                    Link::Stored { id, .. } => *id,
                };
                out.links.push(id);
                wire::set_bit(&mut out.bitmap, slot);
            }

            Ok(out)
        }
        .boxed()
    }
}

async fn set_through<S: BlockRead>(
    link: &mut Link,
    store: &S,
    bit_width: u32,
    height: u32,
    i: u64,
    value: Vec<u8>,
) -> Result<bool> {
    let child = link.load(store, bit_width, height).await?;
    child.set(store, bit_width, height, i, value).await
}

/// `Ok(None)` if nothing was deleted, otherwise whether the child emptied.
async fn delete_through<S: BlockRead>(
    link: &mut Link,
    store: &S,
    bit_width: u32,
    height: u32,
    i: u64,
) -> Result<Option<bool>> {
    let child = link.load(store, bit_width, height).await?;
    if !child.delete(store, bit_width, height, i).await? {
        return Ok(None);
    }
    Ok(Some(child.is_empty()))
}
