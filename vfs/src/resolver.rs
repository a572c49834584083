//! The path-traversal engine.
//!
//! Traversal walks components against the graph with lock coupling: the
//! branch lock of the currently held node is taken to search its children
//! and released before the walk moves on, so at most one branch lock is
//! held at any point and always in top-down order. When a component is
//! missing, an optional materializer runs inside that critical section and
//! publishes the new child atomically.

use alloc::borrow::Cow;
use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use log::{debug, warn};
use spin::Mutex;

use crate::drivers::buffer::BufferData;
use crate::error::{Result, VfsError};
use crate::file::{File, OpenFlags};
use crate::graph;
use crate::node::{Node, NodeKind, NodeRef};
use crate::path;
use crate::perms::{PERM_EXEC, check_perms};
use crate::registry::{self, BUFFER_DRIVER_INDEX};
use crate::resource::{DriverArg, DriverGroup, Resource};
use crate::stat::{self, Stat};
use crate::vfs::Vfs;

/// Bound on link resolution; a walk that chains through more links than
/// this is reported as a cycle.
const LINK_HOP_LIMIT: usize = 40;

bitflags::bitflags! {
    /// Traversal behavior switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraverseFlags: u32 {
        /// Transparently resolve a terminal Link node to its target.
        const RESOLVE_LINKS = 1;
        /// Stop before the final path component; the leftover carries the
        /// leaf name. Used to resolve a parent directory.
        const IGNORE_LAST = 1 << 1;
    }
}

/// Outcome of a traversal: the deepest node reached, owned by the caller
/// through its [`NodeRef`], and the unresolved tail of the input path. An
/// empty leftover means the walk consumed the whole path.
pub struct Resolution {
    pub node: NodeRef,
    pub leftover: String,
}

impl Resolution {
    pub fn complete(&self) -> bool {
        self.leftover.is_empty()
    }
}

/// A missing path component, described to a materializer. The parent's
/// branch lock is held across the call, so a child attached here is seen by
/// other traversals either not at all or fully initialized.
pub struct MissingComponent<'a> {
    pub name: &'a str,
    pub is_last: bool,
}

/// What a materializer produced. Loaded nodes already existed on the
/// backing store and are subject to the caller's access check; created
/// nodes are handed to their creator unchecked.
pub(crate) enum Materialized {
    Loaded(Arc<Node>),
    Created(Arc<Node>),
}

pub(crate) trait Materializer {
    fn materialize(
        &self,
        parent: &Arc<Node>,
        children: &mut Vec<Arc<Node>>,
        missing: &MissingComponent<'_>,
    ) -> Result<Option<Materialized>>;
}

/// Parameters for the terminal node of a create path.
#[derive(Default)]
pub struct NodeInfo {
    /// Type and permission bits for the new object.
    pub mode: u32,
    /// Explicit kind; `NodeKind::Null` infers it from `mode`, and a plain
    /// permission mode makes a regular file.
    pub kind: NodeKind,
    /// Explicit driver slot; `None` infers one from the enclosing mount.
    pub driver: Option<(DriverGroup, u64)>,
    /// Argument for the new node's resource when a slot is given
    /// explicitly.
    pub driver_arg: Option<DriverArg>,
    /// Pre-built resource to install instead of constructing one.
    pub resource_overwrite: Option<Arc<Resource>>,
}

impl NodeInfo {
    pub fn with_mode(mode: u32) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }
}

/// Materializes missing components from the backing store. With `create`
/// set, absent objects are first created through the driver; that switch is
/// the whole difference between an open path and a create path.
pub(crate) struct Lookup {
    create: bool,
    info: Mutex<NodeInfo>,
}

impl Lookup {
    pub fn load() -> Self {
        Self {
            create: false,
            info: Mutex::new(NodeInfo::default()),
        }
    }

    pub fn create(info: NodeInfo) -> Self {
        Self {
            create: true,
            info: Mutex::new(info),
        }
    }

    fn infer_group(kind: NodeKind) -> DriverGroup {
        if kind == NodeKind::Dir {
            DriverGroup::FsDir
        } else {
            DriverGroup::FsFile
        }
    }

    /// The kind of the terminal node, from the explicit request or the mode
    /// bits.
    fn terminal_kind(info: &NodeInfo) -> NodeKind {
        match info.kind {
            NodeKind::Null => match NodeKind::from_mode(info.mode) {
                NodeKind::Null => NodeKind::File,
                kind => kind,
            },
            kind => kind,
        }
    }

    fn load_backed(
        &self,
        parent: &Arc<Node>,
        children: &mut Vec<Arc<Node>>,
        missing: &MissingComponent<'_>,
        mount: &Arc<Node>,
        mount_res: &Arc<Resource>,
        path: &str,
        st: Stat,
    ) -> Result<Option<Materialized>> {
        let kind = NodeKind::from_mode(st.mode);

        let mut info = self.info.lock();
        let slot = if missing.is_last {
            info.driver.take()
        } else {
            None
        };

        let resource = if missing.is_last && info.resource_overwrite.is_some() {
            info.resource_overwrite.take().unwrap()
        } else {
            match slot {
                Some((group, index)) => registry::init_resource(group, index, info.driver_arg.take())?,
                None => {
                    let arg = mount_res.driver().locate(mount_res, path);
                    registry::init_resource(Self::infer_group(kind), mount_res.index(), arg)?
                }
            }
        };
        drop(info);

        let node = Node::new(kind, st, Some(resource), Arc::downgrade(mount));
        graph::attach_locked(children, parent, &node, missing.name)?;

        debug!("loaded \"{}\" from its backing filesystem", path);

        Ok(Some(Materialized::Loaded(node)))
    }

    fn create_backed(
        &self,
        parent: &Arc<Node>,
        children: &mut Vec<Arc<Node>>,
        missing: &MissingComponent<'_>,
        mount: &Arc<Node>,
        mount_res: &Arc<Resource>,
        path: &str,
    ) -> Result<Option<Materialized>> {
        let mut info = self.info.lock();

        let (mode, kind) = if missing.is_last {
            (info.mode, Self::terminal_kind(&info))
        } else {
            // missing intermediate components become directories
            (0o755, NodeKind::Dir)
        };
        let mode = (mode & stat::S_PERMS) | kind.type_bits();

        mount_res.driver().create(mount_res, path, mode, kind)?;

        let slot = if missing.is_last {
            info.driver.take()
        } else {
            None
        };

        let resource = if missing.is_last && info.resource_overwrite.is_some() {
            info.resource_overwrite.take().unwrap()
        } else {
            match slot {
                Some((group, index)) => registry::init_resource(group, index, info.driver_arg.take())?,
                None => {
                    let arg = mount_res.driver().locate(mount_res, path);
                    registry::init_resource(Self::infer_group(kind), mount_res.index(), arg)?
                }
            }
        };
        drop(info);

        let st = mount_res
            .driver()
            .stat(mount_res, Some(path))
            .unwrap_or(Stat::with_mode(mode));

        let node = Node::new(kind, st, Some(resource), Arc::downgrade(mount));
        graph::attach_locked(children, parent, &node, missing.name)?;

        debug!("created \"{}\" on its backing filesystem", path);

        Ok(Some(Materialized::Created(node)))
    }

    /// Below no mount, created nodes live in memory only: leaves get a
    /// buffer resource, directories get none.
    fn materialize_in_memory(
        &self,
        parent: &Arc<Node>,
        children: &mut Vec<Arc<Node>>,
        missing: &MissingComponent<'_>,
    ) -> Result<Option<Materialized>> {
        if !self.create {
            return Ok(None);
        }

        let info = self.info.lock();
        let (mode, kind) = if missing.is_last {
            (info.mode, Self::terminal_kind(&info))
        } else {
            (0o755, NodeKind::Dir)
        };
        drop(info);

        let kind = match kind {
            NodeKind::File => NodeKind::Buffer,
            kind => kind,
        };
        let mode = (mode & stat::S_PERMS) | kind.type_bits();

        let resource = if kind.is_leaf() {
            Some(registry::init_resource(
                DriverGroup::FsFile,
                BUFFER_DRIVER_INDEX,
                Some(Box::new(BufferData::new(mode))),
            )?)
        } else {
            None
        };

        let node = Node::new(kind, Stat::with_mode(mode), resource, Weak::new());
        graph::attach_locked(children, parent, &node, missing.name)?;

        Ok(Some(Materialized::Created(node)))
    }
}

impl Materializer for Lookup {
    fn materialize(
        &self,
        parent: &Arc<Node>,
        children: &mut Vec<Arc<Node>>,
        missing: &MissingComponent<'_>,
    ) -> Result<Option<Materialized>> {
        let mount = {
            let props = parent.props();
            if props.kind == NodeKind::Mount {
                Some(parent.clone())
            } else {
                props.mount.upgrade()
            }
        };

        let Some(mount) = mount else {
            return self.materialize_in_memory(parent, children, missing);
        };

        let mount_res = mount.props().resource.clone().ok_or(VfsError::NoMount)?;

        let parent_path = graph::path_get_abs(parent, Some(&mount));
        let path = if parent_path.is_empty() {
            String::from(missing.name)
        } else {
            alloc::format!("{}/{}", parent_path, missing.name)
        };

        match mount_res.driver().stat(&mount_res, Some(&path)) {
            Ok(st) => self.load_backed(parent, children, missing, &mount, &mount_res, &path, st),
            Err(_) if self.create => {
                self.create_backed(parent, children, missing, &mount, &mount_res, &path)
            }
            Err(_) => {
                debug!("\"{}\" does not exist on the backing filesystem", path);
                Ok(None)
            }
        }
    }
}

/// Walks `path` from `start`, returning an owned reference to the deepest
/// node reached and the unresolved tail. `access` is the permission the
/// caller requests on the terminal node; intermediate components are
/// checked for search permission.
pub(crate) fn traverse(
    vfs: &Vfs,
    path: &str,
    start: &Arc<Node>,
    flags: TraverseFlags,
    access: u32,
    materializer: Option<&dyn Materializer>,
) -> Result<Resolution> {
    path::validate(path)?;

    let creds = vfs.credentials();

    let mut cur_path: Cow<'_, str> = Cow::Borrowed(path);
    let mut node = NodeRef::acquire(start);
    let mut original: Option<NodeRef> = None;
    let mut hops = 0usize;

    let leftover_offset = 'resolve: loop {
        let mut stop_offset = cur_path.len();
        let mut missing = false;

        for comp in path::components(cur_path.as_ref()) {
            if flags.contains(TraverseFlags::IGNORE_LAST) && comp.is_last {
                stop_offset = comp.offset;
                break;
            }

            match comp.name {
                "." => continue,
                ".." => {
                    // walking up from the root stays at the root
                    let parent = node.parent().unwrap_or_else(|| (*node).clone());
                    node = NodeRef::acquire(&parent);
                }
                name => {
                    // The reference is taken while the branch lock is still
                    // held; deletion needs the same lock, so the child
                    // cannot be reclaimed in between.
                    let found = {
                        let mut children = node.children_lock();
                        let found = children.iter().find(|c| *c.name() == *name).cloned();

                        let found = match (found, materializer) {
                            (Some(child), _) => Some(Materialized::Loaded(child)),
                            (None, Some(m)) => m.materialize(
                                &node,
                                &mut children,
                                &MissingComponent {
                                    name,
                                    is_last: comp.is_last,
                                },
                            )?,
                            (None, None) => None,
                        };

                        found.map(|m| match m {
                            Materialized::Loaded(next) => (NodeRef::acquire(&next), false),
                            Materialized::Created(next) => (NodeRef::acquire(&next), true),
                        })
                    };

                    let Some((next, fresh)) = found else {
                        debug!("traversal of \"{}\" stopped at \"{}\"", cur_path, name);
                        stop_offset = comp.offset;
                        missing = true;
                        break;
                    };

                    // a freshly created node is handed to its creator
                    // unchecked
                    if !fresh {
                        let props = next.props();
                        let requested = if comp.is_last { access } else { PERM_EXEC };
                        check_perms(&props.stat, requested, creds.uid, creds.gid)?;
                    }

                    node = next;
                }
            }
        }

        if missing && hops > 0 {
            warn!("link body no longer resolves");
            return Err(VfsError::NotFound);
        }

        if missing
            || flags.contains(TraverseFlags::IGNORE_LAST)
            || !flags.contains(TraverseFlags::RESOLVE_LINKS)
        {
            break 'resolve stop_offset;
        }

        loop {
            let (kind, resolved) = {
                let props = node.props();
                (props.kind, props.link.clone())
            };

            if kind != NodeKind::Link {
                break 'resolve stop_offset;
            }

            if let Some(target) = resolved.as_ref().and_then(Weak::upgrade) {
                if original.is_none() {
                    // an already-resolved link is returned as is; handle
                    // I/O follows the single hop
                    break 'resolve stop_offset;
                }

                hops += 1;
                if hops > LINK_HOP_LIMIT {
                    return Err(VfsError::TooManyLinks);
                }

                node = NodeRef::acquire(&target);
                continue;
            }

            hops += 1;
            if hops > LINK_HOP_LIMIT {
                return Err(VfsError::TooManyLinks);
            }

            let body = read_link_body(&node)?;
            let parent = node.parent().ok_or(VfsError::NotFound)?;

            // the first link of a chain is what the caller gets back
            let link_node = core::mem::replace(&mut node, NodeRef::acquire(&parent));
            if original.is_none() {
                original = Some(link_node);
            }

            cur_path = Cow::Owned(body);
            continue 'resolve;
        }
    };

    let leftover = cur_path.as_ref()[leftover_offset..].to_string();

    if let Some(original) = original {
        let mut props = original.props();

        if props.link.is_none() {
            props.link = Some(Arc::downgrade(&node));
            drop(props);

            // the target's traversal reference stays behind as the pin the
            // link holds on it
            let _target = core::mem::replace(&mut node, original).into_pinned();
        } else {
            // another traversal resolved it first
            drop(props);
            node = original;
        }
    }

    Ok(Resolution { node, leftover })
}

/// Reads the path string stored in a link's body through the node's own
/// resource.
fn read_link_body(link: &Arc<Node>) -> Result<String> {
    let (size, resource) = {
        let props = link.props();
        (props.stat.size, props.resource.clone())
    };

    if size == 0 {
        warn!("not resolving a link of zero bytes");
        return Err(VfsError::NotFound);
    }

    let resource = resource.ok_or(VfsError::NotFound)?;

    let mut buf = alloc::vec![0u8; size as usize];
    let file = File::internal(NodeRef::acquire(link), OpenFlags::READ, Some(resource.clone()));
    let read = resource.driver().read(&file, &resource, &mut buf)?;

    if read == 0 {
        return Err(VfsError::NotFound);
    }

    buf.truncate(read);

    String::from_utf8(buf).map_err(|_| VfsError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::S_IFDIR;
    use crate::vfs::Vfs;

    #[test]
    fn traversal_reports_the_unresolved_tail() {
        let vfs = Vfs::new();
        vfs.create("/a/b", NodeInfo::with_mode(S_IFDIR | 0o755))
            .unwrap();

        let res = vfs.traverse("/a/b/c/d", TraverseFlags::empty()).unwrap();
        assert!(!res.complete());
        assert_eq!(res.leftover, "c/d");
        assert_eq!(&*res.node.name(), "b");
    }

    #[test]
    fn dots_resolve_structurally() {
        let vfs = Vfs::new();
        vfs.create("/a/b", NodeInfo::with_mode(S_IFDIR | 0o755))
            .unwrap();

        let res = vfs
            .traverse("/a/b/../b/./../..", TraverseFlags::empty())
            .unwrap();
        assert!(res.complete());
        assert!(Arc::ptr_eq(&res.node, vfs.root()));
    }

    #[test]
    fn dotdot_at_the_root_stays_put() {
        let vfs = Vfs::new();

        let res = vfs.traverse("/..", TraverseFlags::empty()).unwrap();
        assert!(res.complete());
        assert!(Arc::ptr_eq(&res.node, vfs.root()));
    }

    #[test]
    fn ignore_last_yields_the_parent_and_leaf() {
        let vfs = Vfs::new();
        vfs.create("/a/b", NodeInfo::with_mode(S_IFDIR | 0o755))
            .unwrap();

        let res = vfs
            .traverse("/a/b/leaf", TraverseFlags::IGNORE_LAST)
            .unwrap();
        assert_eq!(&*res.node.name(), "b");
        assert_eq!(res.leftover, "leaf");
    }

    #[test]
    fn traversal_references_are_released_on_drop() {
        let vfs = Vfs::new();
        vfs.create("/a", NodeInfo::with_mode(S_IFDIR | 0o755))
            .unwrap();

        let res = vfs.traverse("/a", TraverseFlags::empty()).unwrap();
        let node = (*res.node).clone();
        assert_eq!(node.ref_count(), 1);

        drop(res);
        assert_eq!(node.ref_count(), 0);
    }
}
