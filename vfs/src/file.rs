//! Open-file handles. A handle owns one reference on its node and one
//! reference on the resource its I/O dispatches through; many handles can
//! be open against the same node.

use alloc::sync::Arc;

use spin::Mutex;

use crate::node::{Node, NodeRef};
use crate::resource::Resource;

bitflags::bitflags! {
    /// Disposition a handle is opened with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        /// Create the object if the path does not resolve.
        const CREATE = 1 << 2;
        /// Position writes at the end of the file.
        const APPEND = 1 << 3;
    }
}

/// A per-open descriptor: a position, the open disposition, and the
/// resource reference I/O goes through.
pub struct File {
    node: NodeRef,
    offset: Mutex<u64>,
    flags: OpenFlags,
    mode: u32,
    resource: Option<Arc<Resource>>,
}

impl File {
    pub(crate) fn new(
        node: NodeRef,
        flags: OpenFlags,
        mode: u32,
        resource: Option<Arc<Resource>>,
    ) -> Self {
        Self {
            node,
            offset: Mutex::new(0),
            flags,
            mode,
            resource,
        }
    }

    /// A handle the VFS builds for its own short-lived I/O, like reading a
    /// link body.
    pub(crate) fn internal(
        node: NodeRef,
        flags: OpenFlags,
        resource: Option<Arc<Resource>>,
    ) -> Self {
        Self::new(node, flags, 0, resource)
    }

    /// The node this handle was opened against. For a resolved link this is
    /// the link node itself; I/O follows the single hop.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Current position of the handle.
    pub fn offset(&self) -> u64 {
        *self.offset.lock()
    }

    pub(crate) fn set_offset(&self, offset: u64) {
        *self.offset.lock() = offset;
    }

    pub(crate) fn advance(&self, bytes: usize) {
        *self.offset.lock() += bytes as u64;
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Permission bits the handle was opened with.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub(crate) fn resource(&self) -> Option<&Arc<Resource>> {
        self.resource.as_ref()
    }

    pub(crate) fn into_node(self) -> NodeRef {
        self.node
    }
}
