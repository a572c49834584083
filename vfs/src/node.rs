//! One vertex of the name graph.
//!
//! Structure is owned exclusively by the parent/child edges: a parent's
//! child list holds the only strong `Arc`s, everything else (`parent`,
//! `mount`, `link`) is weak. The per-node branch lock is the mutex around
//! the child list; the property lock is the mutex around [`NodeProps`].

use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::fmt::Display;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard, RwLock};

use crate::resource::Resource;
use crate::stat::{self, Stat};

/// The type of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeKind {
    #[default]
    Null,
    File,
    Dir,
    /// A directory elevated to host a backing resource.
    Mount,
    Root,
    Link,
    /// A memory-backed file living below no mount.
    Buffer,
    Fifo,
    Dev,
}

impl NodeKind {
    /// Maps the type bits of a mode to a kind.
    pub fn from_mode(mode: u32) -> Self {
        match mode & stat::S_IFMT {
            stat::S_IFDIR => Self::Dir,
            stat::S_IFREG => Self::File,
            stat::S_IFLNK => Self::Link,
            stat::S_IFBLK | stat::S_IFCHR => Self::Dev,
            stat::S_IFIFO => Self::Fifo,
            _ => Self::Null,
        }
    }

    /// The type bits a node of this kind carries in its mode.
    pub fn type_bits(self) -> u32 {
        match self {
            Self::Dir | Self::Mount | Self::Root => stat::S_IFDIR,
            Self::File | Self::Buffer => stat::S_IFREG,
            Self::Link => stat::S_IFLNK,
            Self::Dev => stat::S_IFCHR,
            Self::Fifo => stat::S_IFIFO,
            Self::Null => 0,
        }
    }

    /// Kinds that carry data through a resource binding.
    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            Self::File | Self::Link | Self::Buffer | Self::Fifo | Self::Dev
        )
    }

    /// Kinds a traversal may descend through.
    pub fn is_directory(self) -> bool {
        matches!(self, Self::Dir | Self::Mount | Self::Root)
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                NodeKind::Null => "Null",
                NodeKind::File => "File",
                NodeKind::Dir => "Directory",
                NodeKind::Mount => "Mount",
                NodeKind::Root => "Root",
                NodeKind::Link => "Link",
                NodeKind::Buffer => "Buffer",
                NodeKind::Fifo => "FIFO",
                NodeKind::Dev => "Device",
            }
        )
    }
}

/// Mutable properties of a node, guarded by the property lock.
pub struct NodeProps {
    pub kind: NodeKind,
    /// Cached metadata, refreshed from the driver on demand.
    pub stat: Stat,
    pub resource: Option<Arc<Resource>>,
    /// Resolved target of a Link node. The target carries one reference
    /// count attributed to this node for as long as this is set.
    pub link: Option<Weak<Node>>,
    /// Nearest enclosing Mount node, fixed at materialization time.
    pub mount: Weak<Node>,
    /// Pre-mount duplicate a Mount node reinstates on unmount.
    pub snapshot: Option<Arc<Node>>,
}

pub struct Node {
    /// Empty at the root; rewritten only under the owning parent's branch
    /// lock.
    name: RwLock<Arc<str>>,
    parent: RwLock<Weak<Node>>,
    /// Branch lock: the child list and the names below this node.
    children: Mutex<Vec<Arc<Node>>>,
    /// Property lock.
    props: Mutex<NodeProps>,
    /// Live borrows: open handles, in-flight traversals, structural pins.
    /// Nonzero blocks destruction of this node and every ancestor.
    ref_count: AtomicU64,
}

impl Node {
    pub(crate) fn new(
        kind: NodeKind,
        stat: Stat,
        resource: Option<Arc<Resource>>,
        mount: Weak<Node>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: RwLock::new("".into()),
            parent: RwLock::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            props: Mutex::new(NodeProps {
                kind,
                stat,
                resource,
                link: None,
                mount,
                snapshot: None,
            }),
            ref_count: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> Arc<str> {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write() = name.into();
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.read().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: Weak<Node>) {
        *self.parent.write() = parent;
    }

    pub(crate) fn children_lock(&self) -> MutexGuard<'_, Vec<Arc<Node>>> {
        self.children.lock()
    }

    /// Snapshot of the current child list.
    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.lock().clone()
    }

    pub fn props(&self) -> MutexGuard<'_, NodeProps> {
        self.props.lock()
    }

    pub fn kind(&self) -> NodeKind {
        self.props.lock().kind
    }

    /// Nearest enclosing Mount node, if any.
    pub fn mount(&self) -> Option<Arc<Node>> {
        self.props.lock().mount.upgrade()
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Adds a structural pin without an owning guard (root, mounts).
    pub(crate) fn pin(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases a pin taken with [`Node::pin`] or kept through
    /// [`NodeRef::into_pinned`].
    pub(crate) fn unpin(&self) {
        self.ref_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// The node a handle's I/O lands on: the resolved link target, one hop,
    /// or the node itself.
    pub(crate) fn effective(self: &Arc<Self>) -> Arc<Node> {
        let target = self.props.lock().link.as_ref().and_then(Weak::upgrade);
        target.unwrap_or_else(|| self.clone())
    }

    /// The absolute path of this node, for diagnostics.
    pub fn path(self: &Arc<Self>) -> String {
        let mut path = String::from("/");
        path.push_str(&crate::graph::path_get_abs(self, None));
        path
    }
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("name", &*self.name.read())
            .field("kind", &self.props.lock().kind)
            .field("ref_count", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// An owning borrow of a node. Holding one keeps the node and every ancestor
/// alive; dropping it releases the reference count. The resolver hands these
/// out and every operation holds one for the duration of its work.
pub struct NodeRef {
    node: Option<Arc<Node>>,
}

impl NodeRef {
    pub(crate) fn acquire(node: &Arc<Node>) -> Self {
        node.ref_count.fetch_add(1, Ordering::SeqCst);

        Self {
            node: Some(node.clone()),
        }
    }

    /// Drops the borrow and hands back the raw node.
    pub(crate) fn release(mut self) -> Arc<Node> {
        let node = self.node.take().unwrap();
        node.ref_count.fetch_sub(1, Ordering::SeqCst);
        node
    }

    /// Keeps the count as a structural pin and hands back the raw node.
    /// The pin is released later with [`Node::unpin`].
    pub(crate) fn into_pinned(mut self) -> Arc<Node> {
        self.node.take().unwrap()
    }
}

impl Deref for NodeRef {
    type Target = Arc<Node>;

    fn deref(&self) -> &Self::Target {
        self.node.as_ref().unwrap()
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        Self::acquire(self)
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            node.ref_count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_kind() {
        assert_eq!(NodeKind::from_mode(stat::S_IFDIR | 0o755), NodeKind::Dir);
        assert_eq!(NodeKind::from_mode(stat::S_IFREG | 0o644), NodeKind::File);
        assert_eq!(NodeKind::from_mode(stat::S_IFLNK | 0o777), NodeKind::Link);
        assert_eq!(NodeKind::from_mode(0o644), NodeKind::Null);
        assert_eq!(NodeKind::Dir.type_bits(), stat::S_IFDIR);
    }

    #[test]
    fn node_refs_track_the_reference_count() {
        let node = Node::new(NodeKind::File, Stat::default(), None, Weak::new());

        let a = NodeRef::acquire(&node);
        let b = a.clone();
        assert_eq!(node.ref_count(), 2);

        drop(a);
        assert_eq!(node.ref_count(), 1);

        let raw = b.release();
        assert_eq!(raw.ref_count(), 0);
    }

    #[test]
    fn pinned_refs_keep_the_count() {
        let node = Node::new(NodeKind::Dir, Stat::default(), None, Weak::new());

        let r = NodeRef::acquire(&node);
        let raw = r.into_pinned();
        assert_eq!(raw.ref_count(), 1);

        raw.unpin();
        assert_eq!(raw.ref_count(), 0);
    }
}
