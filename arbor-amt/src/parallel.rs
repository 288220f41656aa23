//! Parallel diff and parallel iteration.
//!
//! Recursive sub-problems are spawned as tasks onto the runtime's
//! work-stealing scheduler. Results drain concurrently through an unbounded
//! channel while the task tree completes. The first error wins: remaining
//! tasks are aborted and stop at their next suspension point, so a failing
//! walk never leaks work. Correctness is independent of worker count;
//! output order is nondeterministic.

use crate::amt::load_root;
use crate::diff::{diff_leaves, walk_all, Change};
use crate::error::{AmtError, Result};
use crate::height::nodes_for_height;
use crate::node::Node;
use arbor_core::{BlockRead, ContentId};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

/// Parallel variant of [`diff`](crate::diff()): same contract, with
/// recursive subtree comparisons running as concurrent tasks.
///
/// The stores are shared across tasks, so they are taken as `Arc`s.
pub async fn diff_parallel<P, C>(
    prev_store: Arc<P>,
    cur_store: Arc<C>,
    prev: &ContentId,
    cur: &ContentId,
    bit_width: u32,
) -> Result<Vec<Change>>
where
    P: BlockRead + 'static,
    C: BlockRead + 'static,
{
    let started = Instant::now();
    let (prev_height, prev_count, prev_node) = load_root(&*prev_store, prev, bit_width).await?;
    let (cur_height, cur_count, cur_node) = load_root(&*cur_store, cur, bit_width).await?;

    let mut changes = Vec::new();

    // Diffing against an empty tree is a single full walk; nothing to fan
    // out.
    if prev_count == 0 && cur_count != 0 {
        let mut emit = |change| changes.push(change);
        walk_all(
            &*cur_store,
            cur_node,
            bit_width,
            cur_height,
            0,
            Change::add,
            &mut emit,
        )
        .await?;
        return Ok(changes);
    }
    if prev_count != 0 && cur_count == 0 {
        let mut emit = |change| changes.push(change);
        walk_all(
            &*prev_store,
            prev_node,
            bit_width,
            prev_height,
            0,
            Change::remove,
            &mut emit,
        )
        .await?;
        return Ok(changes);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let root = tokio::spawn(diff_node_par(
        prev_store,
        cur_store,
        bit_width,
        prev_node,
        prev_height,
        cur_node,
        cur_height,
        0,
        tx,
    ));

    // Drain until every task has dropped its sender.
    while let Some(change) = rx.recv().await {
        changes.push(change);
    }
    match root.await {
        Ok(result) => result?,
        Err(e) => return Err(AmtError::Task(e.to_string())),
    }

    tracing::debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        changes = changes.len(),
        "parallel diff complete"
    );
    Ok(changes)
}

fn sink(tx: UnboundedSender<Change>) -> impl FnMut(Change) + Send {
    // A receiver dropped after an error just discards late changes.
    move |change| {
        let _ = tx.send(change);
    }
}

#[allow(clippy::too_many_arguments)]
fn diff_node_par<P, C>(
    prev_store: Arc<P>,
    cur_store: Arc<C>,
    bit_width: u32,
    mut prev: Node,
    prev_height: u32,
    mut cur: Node,
    cur_height: u32,
    offset: u64,
    tx: UnboundedSender<Change>,
) -> BoxFuture<'static, Result<()>>
where
    P: BlockRead + 'static,
    C: BlockRead + 'static,
{
    async move {
        if prev_height == 0 && cur_height == 0 {
            let mut emit = sink(tx);
            diff_leaves(&prev, &cur, bit_width, offset, &mut emit);
            return Ok(());
        }

        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();

        if cur_height > prev_height {
            let sub_count = nodes_for_height(bit_width, cur_height);
            match cur.take_link(0) {
                Some(link) => {
                    let ps = prev_store.clone();
                    let cs = cur_store.clone();
                    let txc = tx.clone();
                    handles.push(tokio::spawn(async move {
                        let child = link.take_node(&*cs, bit_width, cur_height - 1).await?;
                        diff_node_par(
                            ps,
                            cs.clone(),
                            bit_width,
                            prev,
                            prev_height,
                            child,
                            cur_height - 1,
                            offset,
                            txc,
                        )
                        .await
                    }));
                }
                None => {
                    let mut emit = sink(tx.clone());
                    walk_all(
                        &*prev_store,
                        prev,
                        bit_width,
                        prev_height,
                        offset,
                        Change::remove,
                        &mut emit,
                    )
                    .await?;
                }
            }
            for (slot, link) in cur.into_links() {
                let cs = cur_store.clone();
                let txc = tx.clone();
                let offs = offset + slot as u64 * sub_count;
                handles.push(tokio::spawn(async move {
                    let child = link.take_node(&*cs, bit_width, cur_height - 1).await?;
                    let mut emit = sink(txc);
                    walk_all(
                        &*cs,
                        child,
                        bit_width,
                        cur_height - 1,
                        offs,
                        Change::add,
                        &mut emit,
                    )
                    .await
                }));
            }
            drop(tx);
            return join_aborting(handles).await;
        }

        if prev_height > cur_height {
            let sub_count = nodes_for_height(bit_width, prev_height);
            match prev.take_link(0) {
                Some(link) => {
                    let ps = prev_store.clone();
                    let cs = cur_store.clone();
                    let txc = tx.clone();
                    handles.push(tokio::spawn(async move {
                        let child = link.take_node(&*ps, bit_width, prev_height - 1).await?;
                        diff_node_par(
                            ps.clone(),
                            cs,
                            bit_width,
                            child,
                            prev_height - 1,
                            cur,
                            cur_height,
                            offset,
                            txc,
                        )
                        .await
                    }));
                }
                None => {
                    let mut emit = sink(tx.clone());
                    walk_all(
                        &*cur_store,
                        cur,
                        bit_width,
                        cur_height,
                        offset,
                        Change::add,
                        &mut emit,
                    )
                    .await?;
                }
            }
            for (slot, link) in prev.into_links() {
                let ps = prev_store.clone();
                let txc = tx.clone();
                let offs = offset + slot as u64 * sub_count;
                handles.push(tokio::spawn(async move {
                    let child = link.take_node(&*ps, bit_width, prev_height - 1).await?;
                    let mut emit = sink(txc);
                    walk_all(
                        &*ps,
                        child,
                        bit_width,
                        prev_height - 1,
                        offs,
                        Change::remove,
                        &mut emit,
                    )
                    .await
                }));
            }
            drop(tx);
            return join_aborting(handles).await;
        }

        // Equal interior heights: pair the child slots, one task per
        // differing pair.
        let sub_count = nodes_for_height(bit_width, prev_height);
        for slot in 0..1usize << bit_width {
            let offs = offset + slot as u64 * sub_count;
            match (prev.take_link(slot), cur.take_link(slot)) {
                (None, None) => {}
                (Some(link), None) => {
                    let ps = prev_store.clone();
                    let txc = tx.clone();
                    handles.push(tokio::spawn(async move {
                        let child = link.take_node(&*ps, bit_width, prev_height - 1).await?;
                        let mut emit = sink(txc);
                        walk_all(
                            &*ps,
                            child,
                            bit_width,
                            prev_height - 1,
                            offs,
                            Change::remove,
                            &mut emit,
                        )
                        .await
                    }));
                }
                (None, Some(link)) => {
                    let cs = cur_store.clone();
                    let txc = tx.clone();
                    handles.push(tokio::spawn(async move {
                        let child = link.take_node(&*cs, bit_width, cur_height - 1).await?;
                        let mut emit = sink(txc);
                        walk_all(
                            &*cs,
                            child,
                            bit_width,
                            cur_height - 1,
                            offs,
                            Change::add,
                            &mut emit,
                        )
                        .await
                    }));
                }
                (Some(prev_link), Some(cur_link)) => {
                    if prev_link.id().is_some() && prev_link.id() == cur_link.id() {
                        continue;
                    }
                    let ps = prev_store.clone();
                    let cs = cur_store.clone();
                    let txc = tx.clone();
                    handles.push(tokio::spawn(async move {
                        let prev_child = prev_link
                            .take_node(&*ps, bit_width, prev_height - 1)
                            .await?;
                        let cur_child =
                            cur_link.take_node(&*cs, bit_width, cur_height - 1).await?;
                        diff_node_par(
                            ps.clone(),
                            cs.clone(),
                            bit_width,
                            prev_child,
                            prev_height - 1,
                            cur_child,
                            cur_height - 1,
                            offs,
                            txc,
                        )
                        .await
                    }));
                }
            }
        }
        drop(tx);
        join_aborting(handles).await
    }
    .boxed()
}

/// Walk a persisted root, visiting every occupied index with one task per
/// loaded subtree.
///
/// The visitor is shared across workers. The first visitor or load error
/// wins; every other task is aborted and terminates at its next suspension
/// point. Visit order is nondeterministic.
pub async fn par_for_each<S, F>(
    store: Arc<S>,
    root: &ContentId,
    bit_width: u32,
    visitor: F,
) -> Result<()>
where
    S: BlockRead + 'static,
    F: Fn(u64, &[u8]) -> Result<()> + Send + Sync + 'static,
{
    let (height, _count, node) = load_root(&*store, root, bit_width).await?;
    par_walk(store, node, bit_width, height, 0, Arc::new(visitor)).await
}

fn par_walk<S, F>(
    store: Arc<S>,
    node: Node,
    bit_width: u32,
    height: u32,
    offset: u64,
    visitor: Arc<F>,
) -> BoxFuture<'static, Result<()>>
where
    S: BlockRead + 'static,
    F: Fn(u64, &[u8]) -> Result<()> + Send + Sync + 'static,
{
    async move {
        if height == 0 {
            for (slot, value) in node.occupied_values() {
                visitor(offset + slot, value)?;
            }
            return Ok(());
        }

        let sub_count = nodes_for_height(bit_width, height);
        let mut handles = Vec::new();
        for (slot, link) in node.into_links() {
            let store = store.clone();
            let visitor = visitor.clone();
            let offs = offset + slot as u64 * sub_count;
            handles.push(tokio::spawn(async move {
                let child = link.take_node(&*store, bit_width, height - 1).await?;
                par_walk(store.clone(), child, bit_width, height - 1, offs, visitor).await
            }));
        }
        join_aborting(handles).await
    }
    .boxed()
}

/// Await every handle; on the first failure, abort the rest and surface
/// that error. Abort-induced cancellations are not errors themselves.
async fn join_aborting(handles: Vec<JoinHandle<Result<()>>>) -> Result<()> {
    let mut first_err: Option<AmtError> = None;
    for handle in handles {
        if first_err.is_some() {
            handle.abort();
            continue;
        }
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => first_err = Some(e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => first_err = Some(AmtError::Task(e.to_string())),
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
