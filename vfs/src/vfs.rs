//! The VFS context: the root of the name graph, the node cache, and every
//! namespace operation. A context is an ordinary value so independent
//! instances can coexist; the kernel keeps one process-wide instance behind
//! [`init`]/[`get`].

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};

use conquer_once::spin::OnceCell;
use core::fmt::Write as _;
use log::debug;

use crate::cache::{NODE_CACHE_SIZE, NodeCache};
use crate::error::{Result, VfsError};
use crate::file::{File, OpenFlags};
use crate::graph::{self, DeleteFlags};
use crate::node::{Node, NodeKind, NodeRef};
use crate::perms::{PERM_READ, PERM_WRITE};
use crate::resolver::{self, Lookup, Materializer, NodeInfo, Resolution, TraverseFlags};
use crate::resource::Resource;
use crate::stat::{self, S_IFDIR, S_IFLNK, S_IFMT, SeekFrom, Stat};

/// Caller identity the permission predicate runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

pub struct Vfs {
    root: Arc<Node>,
    cache: NodeCache,
    creds: Credentials,
}

impl Vfs {
    pub fn new() -> Self {
        Self::with_credentials(Credentials { uid: 0, gid: 0 })
    }

    /// A context whose operations run as the given caller. Useful for
    /// exercising the permission predicate as someone other than root.
    pub fn with_credentials(creds: Credentials) -> Self {
        crate::drivers::buffer::register();

        let root = Node::new(
            NodeKind::Root,
            Stat::with_mode(S_IFDIR | 0o755),
            None,
            Weak::new(),
        );

        // The root is pinned for the lifetime of the context
        root.pin();

        debug!("initialized VFS");

        Self {
            root,
            cache: NodeCache::new(NODE_CACHE_SIZE),
            creds,
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub(crate) fn credentials(&self) -> Credentials {
        self.creds
    }

    /// Selects the node a path starts resolving from. Relative paths are
    /// reserved until processes carry a working directory.
    fn start_node(&self, path: &str) -> Result<&Arc<Node>> {
        if !path.starts_with('/') {
            return Err(VfsError::InvalidArgument);
        }

        Ok(&self.root)
    }

    /// Resolves `path` as far as the graph and the backing stores allow,
    /// reporting the deepest node reached and the unresolved tail.
    pub fn traverse(&self, path: &str, flags: TraverseFlags) -> Result<Resolution> {
        resolver::traverse(self, path, self.start_node(path)?, flags, 0, None)
    }

    fn resolve(
        &self,
        path: &str,
        flags: TraverseFlags,
        access: u32,
        materializer: Option<&dyn Materializer>,
    ) -> Result<NodeRef> {
        let resolution =
            resolver::traverse(self, path, self.start_node(path)?, flags, access, materializer)?;

        if !resolution.complete() {
            return Err(VfsError::NotFound);
        }

        Ok(resolution.node)
    }

    /// Opens `path`, materializing it from the backing store and, with
    /// [`OpenFlags::CREATE`], creating it when absent. A terminal link is
    /// resolved and pins its target; the handle's I/O lands on the target.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<File> {
        if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE) {
            return Err(VfsError::InvalidArgument);
        }

        let mut access = 0;
        if flags.contains(OpenFlags::READ) {
            access |= PERM_READ;
        }
        if flags.contains(OpenFlags::WRITE) {
            access |= PERM_WRITE;
        }

        let node = if flags.contains(OpenFlags::CREATE) {
            let lookup = Lookup::create(NodeInfo::with_mode(mode));
            self.resolve(path, TraverseFlags::RESOLVE_LINKS, access, Some(&lookup))?
        } else {
            let lookup = Lookup::load();
            self.resolve(path, TraverseFlags::RESOLVE_LINKS, access, Some(&lookup))?
        };

        let effective = node.effective();
        let resource = effective.props().resource.clone();

        Ok(File::new(node, flags, mode & stat::S_PERMS, resource))
    }

    /// Reads from the handle's offset. Returns the number of bytes read.
    pub fn read(&self, file: &File, buffer: &mut [u8]) -> Result<usize> {
        if !file.flags().contains(OpenFlags::READ) {
            return Err(VfsError::InvalidArgument);
        }

        let node = file.node().effective();
        // the target stays alive across the driver call
        let _busy = NodeRef::acquire(&node);

        let resource = file.resource().ok_or(VfsError::InvalidArgument)?.clone();

        let read = resource.driver().read(file, &resource, buffer)?;
        file.advance(read);

        Ok(read)
    }

    /// Writes at the handle's offset. Returns the number of bytes written.
    pub fn write(&self, file: &File, buffer: &[u8]) -> Result<usize> {
        if !file.flags().contains(OpenFlags::WRITE) {
            return Err(VfsError::InvalidArgument);
        }

        let node = file.node().effective();
        let _busy = NodeRef::acquire(&node);

        let resource = file.resource().ok_or(VfsError::InvalidArgument)?.clone();

        if file.flags().contains(OpenFlags::APPEND) {
            let size = node.props().stat.size;
            file.set_offset(size);
        }

        let written = resource.driver().write(file, &resource, buffer)?;

        let end = file.offset() + written as u64;
        file.advance(written);

        // keep the cached size in step with what the driver now holds
        let mut props = node.props();
        if end > props.stat.size {
            props.stat.size = end;
        }

        Ok(written)
    }

    /// Moves the handle's offset. A target outside the file leaves the
    /// offset unchanged; the resulting offset is returned either way.
    /// Drivers of non-regular types may impose their own rules.
    pub fn seek(&self, file: &File, pos: SeekFrom) -> Result<u64> {
        if let Some(resource) = file.resource() {
            if let Some(result) = resource.driver().seek(file, resource, pos) {
                return result;
            }
        }

        let node = file.node().effective();
        let size = node.props().stat.size as i64;
        let cur = file.offset() as i64;

        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => cur + delta,
            SeekFrom::End(delta) => size - delta - 1,
        };

        if target >= 0 && target < size {
            file.set_offset(target as u64);
        }

        Ok(file.offset())
    }

    /// Closes the handle. When this was the last reference to a backed
    /// leaf, the node is parked in the cache instead of being torn down.
    pub fn close(&self, file: File) -> Result<()> {
        if let Some(resource) = file.resource() {
            resource.driver().close(&file, resource)?;
        }

        let node = file.into_node().release();

        if node.ref_count() == 0 {
            self.cache.offer(node);
        }

        Ok(())
    }

    /// Reports the metadata of `path`. A terminal link reports its own
    /// metadata, not the target's.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let lookup = Lookup::load();
        let node = self.resolve(path, TraverseFlags::empty(), 0, Some(&lookup))?;

        // refresh the cached copy while a driver is bound
        let resource = node.props().resource.clone();
        if let Some(resource) = resource {
            if let Ok(st) = resource.driver().stat(&resource, None) {
                node.props().stat = st;
            }
        }

        let st = node.props().stat;

        Ok(st)
    }

    /// Creates `path`, including missing intermediate directories. Existing
    /// nodes are left as they are.
    pub fn create(&self, path: &str, info: NodeInfo) -> Result<()> {
        if info.mode == 0 {
            return Err(VfsError::InvalidArgument);
        }

        let lookup = Lookup::create(info);
        self.resolve(path, TraverseFlags::RESOLVE_LINKS, PERM_WRITE, Some(&lookup))?;

        Ok(())
    }

    /// Removes `path` from the graph and the backing store. Directories
    /// need `recurse`; the recursive form refuses with `Busy` before
    /// touching anything if any node in the subtree is referenced.
    pub fn remove(&self, path: &str, recurse: bool) -> Result<()> {
        let lookup = Lookup::load();
        let node = self
            .resolve(path, TraverseFlags::empty(), PERM_WRITE, Some(&lookup))?
            .release();

        if recurse && node.kind().is_directory() {
            graph::delete_recursive(&node, DeleteFlags::PHYSICAL)
        } else {
            graph::delete_node(&node, DeleteFlags::PHYSICAL)
        }
    }

    /// Makes `linkpath` a symbolic link to `target`. The link's body is the
    /// relative path between the two, and the target carries one reference
    /// count for as long as the link knows it.
    pub fn link(&self, target: &str, linkpath: &str, mode: u32) -> Result<()> {
        let target_ref = self.resolve(target, TraverseFlags::empty(), 0, Some(&Lookup::load()))?;

        let probe = resolver::traverse(
            self,
            linkpath,
            self.start_node(linkpath)?,
            TraverseFlags::empty(),
            0,
            Some(&Lookup::load()),
        )?;
        if probe.complete() {
            return Err(VfsError::AlreadyExists);
        }
        drop(probe);

        let link_mode = if mode == 0 {
            target_ref.props().stat.mode
        } else {
            mode
        };
        let info = NodeInfo {
            mode: (link_mode & !S_IFMT) | S_IFLNK,
            kind: NodeKind::Link,
            ..Default::default()
        };

        let link_ref =
            self.resolve(linkpath, TraverseFlags::empty(), PERM_WRITE, Some(&Lookup::create(info)))?;

        // a partially built link does not survive an error below
        let link_guard = scopeguard::guard(link_ref, |link_ref| {
            let node = link_ref.release();
            let _ = graph::delete_node(&node, DeleteFlags::PHYSICAL);
        });

        let body = graph::path_get_rel(&link_guard, &target_ref);

        let resource = link_guard.props().resource.clone().ok_or(VfsError::NoMount)?;
        let file = File::internal(
            NodeRef::clone(&link_guard),
            OpenFlags::WRITE,
            Some(resource.clone()),
        );
        let written = resource.driver().write(&file, &resource, body.as_bytes())?;
        drop(file);

        if written != body.len() {
            return Err(VfsError::Driver(written as i32));
        }

        {
            let mut props = link_guard.props();
            props.stat.size = body.len() as u64;
            props.link = Some(Arc::downgrade(&target_ref));
        }

        // the target reference stays behind as the pin the link holds
        let _target = target_ref.into_pinned();

        drop(scopeguard::ScopeGuard::into_inner(link_guard));

        Ok(())
    }

    /// Moves `from` to `to`, creating `to`'s parent directories as needed.
    /// Both endpoints must live under the same mount; the backing rename
    /// and the structural move land atomically.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_ref = self.resolve(from, TraverseFlags::empty(), PERM_WRITE, Some(&Lookup::load()))?;

        if matches!(from_ref.kind(), NodeKind::Mount | NodeKind::Root) {
            return Err(VfsError::Busy);
        }

        let to_parent = resolver::traverse(
            self,
            to,
            self.start_node(to)?,
            TraverseFlags::IGNORE_LAST,
            PERM_WRITE,
            Some(&Lookup::create(NodeInfo::default())),
        )?;

        let leaf = to_parent.leftover.trim_end_matches('/');
        if leaf.contains('/') {
            // an intermediate component failed to resolve
            return Err(VfsError::NotFound);
        }
        if leaf.is_empty() || leaf == "." || leaf == ".." {
            return Err(VfsError::InvalidArgument);
        }

        let new_parent = &to_parent.node;
        if !new_parent.kind().is_directory() {
            return Err(VfsError::NotFound);
        }

        let from_mount = from_ref.mount();
        let parent_mount = {
            let props = new_parent.props();
            if props.kind == NodeKind::Mount {
                Some((**new_parent).clone())
            } else {
                props.mount.upgrade()
            }
        };

        let driver_call = match (&from_mount, &parent_mount) {
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => {
                let resource = a.props().resource.clone().ok_or(VfsError::NoMount)?;
                let old_path = graph::path_get_abs(&from_ref, Some(a));
                let new_dir = graph::path_get_abs(new_parent, Some(a));
                let new_path = if new_dir.is_empty() {
                    leaf.to_string()
                } else {
                    alloc::format!("{}/{}", new_dir, leaf)
                };

                Some((resource, old_path, new_path))
            }
            (None, None) => None,
            _ => return Err(VfsError::CrossDevice),
        };

        graph::reattach_with(&from_ref, new_parent, leaf, || match &driver_call {
            Some((resource, old_path, new_path)) => {
                resource.driver().rename(resource, old_path, new_path)
            }
            None => Ok(()),
        })
    }

    /// Elevates an existing directory to a mount hosting `resource`. The
    /// pre-mount directory is snapshotted so an unmount can restore it.
    pub fn mount(&self, path: &str, resource: Arc<Resource>) -> Result<()> {
        let node_ref = self.resolve(path, TraverseFlags::empty(), 0, Some(&Lookup::load()))?;

        if node_ref.kind() != NodeKind::Dir {
            return Err(VfsError::InvalidArgument);
        }

        let snapshot = graph::duplicate(&node_ref);

        // The directory's children move into the snapshot; the mount
        // starts empty and fills from its resource.
        {
            let mut children = node_ref.children_lock();
            let moved = core::mem::take(&mut *children);
            for child in &moved {
                child.set_parent(Arc::downgrade(&snapshot));
            }
            *snapshot.children_lock() = moved;
        }

        {
            let mut props = node_ref.props();
            props.kind = NodeKind::Mount;
            props.resource = Some(resource);
            props.snapshot = Some(snapshot);
        }

        debug!("mounted resource at \"{}\"", path);

        // the traversal reference becomes the mount pin
        let _pinned = node_ref.into_pinned();

        Ok(())
    }

    /// Tears a mount down: loaded children are discarded (the backing store
    /// keeps the objects), the pin is released, and the pre-mount snapshot
    /// takes the node's place.
    pub fn unmount(&self, path: &str) -> Result<()> {
        let node_ref = self.resolve(path, TraverseFlags::empty(), 0, None)?;

        {
            let props = node_ref.props();
            if props.kind != NodeKind::Mount {
                return Err(VfsError::InvalidArgument);
            }
            if props.snapshot.is_none() {
                return Err(VfsError::InvalidArgument);
            }
        }

        // our traversal reference plus the mount pin
        if node_ref.ref_count() > 2 {
            return Err(VfsError::Busy);
        }

        // refuse before discarding anything if any loaded child is in use
        for child in node_ref.children() {
            graph::scan_referenced(&child)?;
        }

        for child in node_ref.children() {
            graph::delete_recursive(&child, DeleteFlags::empty())?;
        }

        let (snapshot, resource) = {
            let mut props = node_ref.props();
            (props.snapshot.take(), props.resource.take())
        };
        let snapshot = snapshot.ok_or(VfsError::InvalidArgument)?;

        let node = node_ref.release();
        node.unpin();

        let parent = node.parent().ok_or(VfsError::InvalidArgument)?;

        {
            let mut siblings = parent.children_lock();
            let idx = siblings
                .iter()
                .position(|c| Arc::ptr_eq(c, &node))
                .ok_or(VfsError::NotFound)?;

            snapshot.set_name(&node.name());
            snapshot.set_parent(Arc::downgrade(&parent));
            siblings[idx] = snapshot.clone();
            node.set_parent(Weak::new());
        }

        // last reference releases the driver binding
        drop(resource);

        debug!("unmounted \"{}\"", path);

        Ok(())
    }

    /// Renders the subtree at `path`, `depth` levels deep, one node per
    /// line with its kind, mode, size, and reference count. Links are
    /// annotated with their target.
    pub fn list(&self, path: &str, depth: usize) -> Result<String> {
        if depth == 0 {
            return Err(VfsError::InvalidArgument);
        }

        let node = self.resolve(path, TraverseFlags::empty(), 0, None)?;

        let mut out = String::new();
        Self::render(&node, depth, 0, &mut out);

        Ok(out)
    }

    fn render(node: &Arc<Node>, depth: usize, level: usize, out: &mut String) {
        if level >= depth {
            return;
        }

        for child in node.children() {
            for _ in 0..level {
                out.push('\t');
            }

            {
                let props = child.props();
                let st = &props.stat;

                if props.kind != NodeKind::Link {
                    let _ = writeln!(
                        out,
                        "{} ({}, {:o}, {:#x} B, {})",
                        child.name(),
                        props.kind,
                        st.mode,
                        st.size,
                        child.ref_count(),
                    );
                } else {
                    match props.link.as_ref().and_then(Weak::upgrade) {
                        Some(target) => {
                            let _ = writeln!(
                                out,
                                "{} (Link, {:o}, {:#x} B, {}) -> {}",
                                child.name(),
                                st.mode,
                                st.size,
                                child.ref_count(),
                                target.name(),
                            );
                        }
                        None => {
                            let _ = writeln!(
                                out,
                                "{} (Broken Link, {:o}, {:#x} B, {}) -/> NULL",
                                child.name(),
                                st.mode,
                                st.size,
                                child.ref_count(),
                            );
                        }
                    }
                }
            }

            Self::render(&child, depth, level + 1, out);
        }
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

static VFS: OnceCell<Vfs> = OnceCell::uninit();

/// Initializes the process-wide VFS instance. Later calls return the
/// existing one.
pub fn init() -> &'static Vfs {
    VFS.get_or_init(Vfs::new)
}

/// The process-wide VFS instance.
pub fn get() -> &'static Vfs {
    VFS.get().expect("VFS not yet initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::{S_IFREG, S_PERMS};

    #[test]
    fn a_fresh_vfs_has_an_empty_root_directory() {
        let vfs = Vfs::new();

        assert_eq!(vfs.list("/", 1).unwrap(), "");

        let st = vfs.stat("/").unwrap();
        assert_eq!(st.mode & S_IFMT, S_IFDIR);
    }

    #[test]
    fn memory_files_round_trip_without_a_mount() {
        let vfs = Vfs::new();

        let f = vfs
            .open(
                "/tmp/notes",
                OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE,
                0o600,
            )
            .unwrap();
        assert_eq!(vfs.write(&f, b"hello").unwrap(), 5);
        vfs.close(f).unwrap();

        let f = vfs.open("/tmp/notes", OpenFlags::READ, 0o400).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(vfs.read(&f, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        vfs.close(f).unwrap();

        // intermediate directories were materialized in memory
        let st = vfs.stat("/tmp").unwrap();
        assert_eq!(st.mode & S_IFMT, S_IFDIR);
    }

    #[test]
    fn create_then_stat_reports_the_requested_permissions() {
        let vfs = Vfs::new();

        vfs.create("/f", NodeInfo::with_mode(S_IFREG | 0o640)).unwrap();

        let st = vfs.stat("/f").unwrap();
        assert_eq!(st.mode & S_PERMS, 0o640);
    }

    #[test]
    fn out_of_range_seeks_leave_the_offset_in_place() {
        let vfs = Vfs::new();

        let f = vfs
            .open(
                "/f",
                OpenFlags::CREATE | OpenFlags::READ | OpenFlags::WRITE,
                0o600,
            )
            .unwrap();
        vfs.write(&f, b"0123456789").unwrap();

        assert_eq!(vfs.seek(&f, SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(vfs.seek(&f, SeekFrom::Start(100)).unwrap(), 4);
        assert_eq!(vfs.seek(&f, SeekFrom::Current(-2)).unwrap(), 2);
        assert_eq!(vfs.seek(&f, SeekFrom::Current(-5)).unwrap(), 2);
        assert_eq!(vfs.seek(&f, SeekFrom::End(0)).unwrap(), 9);

        vfs.close(f).unwrap();
    }

    #[test]
    fn handles_need_the_matching_access_flag() {
        let vfs = Vfs::new();

        let f = vfs
            .open("/f", OpenFlags::CREATE | OpenFlags::WRITE, 0o600)
            .unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(&f, &mut buf), Err(VfsError::InvalidArgument));
        vfs.close(f).unwrap();

        let f = vfs.open("/f", OpenFlags::READ, 0o400).unwrap();
        assert_eq!(vfs.write(&f, b"x"), Err(VfsError::InvalidArgument));
        vfs.close(f).unwrap();
    }

    #[test]
    fn remove_refuses_open_nodes() {
        let vfs = Vfs::new();

        let f = vfs
            .open("/f", OpenFlags::CREATE | OpenFlags::WRITE, 0o600)
            .unwrap();
        assert_eq!(vfs.remove("/f", false), Err(VfsError::Busy));

        vfs.close(f).unwrap();
        vfs.remove("/f", false).unwrap();
        assert_eq!(vfs.stat("/f"), Err(VfsError::NotFound));
    }

    #[test]
    fn links_in_memory_read_through_to_the_target() {
        let vfs = Vfs::new();

        let f = vfs
            .open("/data", OpenFlags::CREATE | OpenFlags::WRITE, 0o600)
            .unwrap();
        vfs.write(&f, b"payload").unwrap();
        vfs.close(f).unwrap();

        vfs.link("/data", "/alias", 0o777).unwrap();

        let f = vfs.open("/alias", OpenFlags::READ, 0o400).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(vfs.read(&f, &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"payload");
        vfs.close(f).unwrap();

        // the pinned target refuses removal until the link goes away
        assert_eq!(vfs.remove("/data", false), Err(VfsError::Busy));
        vfs.remove("/alias", false).unwrap();
        vfs.remove("/data", false).unwrap();
    }

    #[test]
    fn rename_in_memory_moves_the_node() {
        let vfs = Vfs::new();

        let f = vfs
            .open("/a/f", OpenFlags::CREATE | OpenFlags::WRITE, 0o600)
            .unwrap();
        vfs.write(&f, b"x").unwrap();
        vfs.close(f).unwrap();

        vfs.rename("/a/f", "/b/g").unwrap();

        assert_eq!(vfs.stat("/a/f"), Err(VfsError::NotFound));
        let st = vfs.stat("/b/g").unwrap();
        assert_eq!(st.size, 1);
    }

    #[test]
    fn the_global_instance_is_initialized_once() {
        let a = super::init() as *const Vfs;
        let b = super::init() as *const Vfs;
        assert_eq!(a, b);
        assert!(core::ptr::eq(a, super::get()));
    }

    #[test]
    fn list_renders_kinds_and_link_targets() {
        let vfs = Vfs::new();

        vfs.create("/d", NodeInfo::with_mode(S_IFDIR | 0o755)).unwrap();
        let f = vfs
            .open("/d/f", OpenFlags::CREATE | OpenFlags::WRITE, 0o600)
            .unwrap();
        vfs.close(f).unwrap();
        vfs.link("/d/f", "/l", 0).unwrap();

        let listing = vfs.list("/", 2).unwrap();
        assert!(listing.contains("d (Directory"));
        assert!(listing.contains("\tf (Buffer"));
        assert!(listing.contains("-> f"));
    }
}
