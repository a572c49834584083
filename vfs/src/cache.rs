//! A bounded ring of recently closed nodes.
//!
//! Closing the last handle on a mount-backed leaf does not tear the node
//! down; it is parked here instead, still attached to the graph, so a
//! re-open finds its metadata without going back to the driver. Each insert
//! displaces the slot's previous occupant, which is then reclaimed unless
//! it picked up a new reference in the meantime.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::graph::{self, DeleteFlags};
use crate::node::Node;

/// Slots in the default cache ring.
pub(crate) const NODE_CACHE_SIZE: usize = 1024;

pub(crate) struct NodeCache {
    ring: Mutex<Ring>,
}

struct Ring {
    slots: Vec<Option<Arc<Node>>>,
    idx: usize,
}

impl NodeCache {
    pub fn new(size: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: alloc::vec![None; size],
                idx: 0,
            }),
        }
    }

    /// Parks a node that just lost its last reference. Pinned nodes,
    /// directories, and memory-backed nodes are not cacheable; the latter
    /// hold the only copy of their data.
    pub fn offer(&self, node: Arc<Node>) {
        if node.ref_count() > 0 || !node.kind().is_leaf() || node.mount().is_none() {
            return;
        }

        // The displaced occupant is reclaimed outside the ring lock; the
        // delete pipeline takes branch locks of its own.
        let displaced = {
            let mut ring = self.ring.lock();
            let idx = ring.idx;
            ring.idx = (idx + 1) % ring.slots.len();
            core::mem::replace(&mut ring.slots[idx], Some(node))
        };

        if let Some(old) = displaced {
            Self::reclaim(old);
        }
    }

    fn reclaim(node: Arc<Node>) {
        if node.ref_count() > 0 {
            // re-opened since it was parked
            return;
        }

        // Drops the cached copy only; the backing object stays
        let _ = graph::delete_node(&node, DeleteFlags::empty());
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Weak;

    use super::*;
    use crate::graph::attach;
    use crate::node::{NodeKind, NodeRef};
    use crate::stat::{S_IFDIR, S_IFREG, Stat};

    fn tree() -> (Arc<Node>, Arc<Node>, Arc<Node>) {
        let root = Node::new(
            NodeKind::Dir,
            Stat::with_mode(S_IFDIR | 0o755),
            None,
            Weak::new(),
        );

        // a stand-in mount so the leaves count as backed
        let mount = Node::new(
            NodeKind::Mount,
            Stat::with_mode(S_IFDIR | 0o755),
            None,
            Weak::new(),
        );
        attach(&root, &mount, "m").unwrap();

        let leaf = Node::new(
            NodeKind::File,
            Stat::with_mode(S_IFREG | 0o644),
            None,
            Arc::downgrade(&mount),
        );
        attach(&mount, &leaf, "f").unwrap();

        (root, mount, leaf)
    }

    #[test]
    fn displaced_nodes_are_detached() {
        let (_root, mount, leaf) = tree();

        let cache = NodeCache::new(1);
        cache.offer(leaf.clone());
        assert_eq!(mount.children().len(), 1);

        let other = Node::new(
            NodeKind::File,
            Stat::with_mode(S_IFREG | 0o644),
            None,
            Arc::downgrade(&mount),
        );
        attach(&mount, &other, "g").unwrap();

        // the second offer displaces the first occupant
        cache.offer(other);
        assert!(leaf.parent().is_none());
        assert_eq!(mount.children().len(), 1);
    }

    #[test]
    fn referenced_nodes_are_never_parked_or_reclaimed() {
        let (_root, mount, leaf) = tree();
        let cache = NodeCache::new(1);

        let held = NodeRef::acquire(&leaf);
        cache.offer(leaf.clone());

        // parked nothing, so a later offer displaces nothing
        drop(held);
        let other = Node::new(
            NodeKind::File,
            Stat::with_mode(S_IFREG | 0o644),
            None,
            Arc::downgrade(&mount),
        );
        attach(&mount, &other, "g").unwrap();
        cache.offer(other);

        assert!(leaf.parent().is_some());
    }

    #[test]
    fn memory_backed_nodes_are_not_cacheable() {
        let root = Node::new(
            NodeKind::Dir,
            Stat::with_mode(S_IFDIR | 0o755),
            None,
            Weak::new(),
        );
        let buffer = Node::new(
            NodeKind::Buffer,
            Stat::with_mode(S_IFREG | 0o600),
            None,
            Weak::new(),
        );
        attach(&root, &buffer, "b").unwrap();

        // both offers are rejected, so the node is never displaced
        let cache = NodeCache::new(1);
        cache.offer(buffer.clone());
        cache.offer(buffer.clone());
        assert!(buffer.parent().is_some());
    }
}
