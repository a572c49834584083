//! Structural operations on the name graph: linking and unlinking nodes,
//! node-to-node path computation, and the deletion pipeline. The namespace
//! operations compose these; using them directly means upholding the graph
//! invariants yourself, starting with the lock order: a parent's branch
//! lock before a child's, never two branch locks except the address-ordered
//! pair a move takes.

use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};

use log::debug;

use crate::error::{Result, VfsError};
use crate::node::Node;

bitflags::bitflags! {
    /// Behavior switches for the deletion pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeleteFlags: u32 {
        /// After deleting, walk upward deleting ancestors that became
        /// empty and unreferenced.
        const PRUNE = 1;
        /// Remove the object from the backing store as well. Required for
        /// memory-backed nodes, which hold the only copy of their data.
        const PHYSICAL = 1 << 1;
    }
}

/// Inserts `child` under `parent` with `name`. Takes the parent's branch
/// lock.
pub fn attach(parent: &Arc<Node>, child: &Arc<Node>, name: &str) -> Result<()> {
    let mut children = parent.children_lock();
    attach_locked(&mut children, parent, child, name)
}

/// Inserts while the caller already holds the parent's branch lock, so a
/// new child is published in the same critical section that missed it.
pub(crate) fn attach_locked(
    children: &mut Vec<Arc<Node>>,
    parent: &Arc<Node>,
    child: &Arc<Node>,
    name: &str,
) -> Result<()> {
    if name.is_empty() {
        return Err(VfsError::InvalidArgument);
    }

    if children.iter().any(|c| *c.name() == *name) {
        return Err(VfsError::AlreadyExists);
    }

    child.set_name(name);
    child.set_parent(Arc::downgrade(parent));
    children.insert(0, child.clone());

    Ok(())
}

/// Splices `node` out of its parent's child list without tearing it down.
/// Takes the parent's branch lock.
pub fn detach(node: &Arc<Node>) -> Result<()> {
    let parent = node.parent().ok_or(VfsError::InvalidArgument)?;

    let mut children = parent.children_lock();
    let idx = children
        .iter()
        .position(|c| Arc::ptr_eq(c, node))
        .ok_or(VfsError::NotFound)?;

    children.remove(idx);
    node.set_parent(Weak::new());

    Ok(())
}

/// Shallow copy of identity and resource binding, without graph links.
/// Mount uses this to snapshot the pre-mount directory.
pub fn duplicate(node: &Arc<Node>) -> Arc<Node> {
    let dup = {
        let props = node.props();
        Node::new(
            props.kind,
            props.stat,
            props.resource.clone(),
            props.mount.clone(),
        )
    };

    dup.set_name(&node.name());

    dup
}

/// Moves `node` under `new_parent` as `name`. `commit` runs after all
/// validation with both branch locks held, so a backing-store rename and
/// the structural move land atomically.
pub(crate) fn reattach_with(
    node: &Arc<Node>,
    new_parent: &Arc<Node>,
    name: &str,
    commit: impl FnOnce() -> Result<()>,
) -> Result<()> {
    if name.is_empty() {
        return Err(VfsError::InvalidArgument);
    }

    let old_parent = node.parent().ok_or(VfsError::InvalidArgument)?;

    if Arc::ptr_eq(&old_parent, new_parent) {
        let children = old_parent.children_lock();

        if children
            .iter()
            .any(|c| !Arc::ptr_eq(c, node) && *c.name() == *name)
        {
            return Err(VfsError::AlreadyExists);
        }

        commit()?;
        node.set_name(name);

        return Ok(());
    }

    // Two branch locks are needed here; address order keeps concurrent
    // moves from deadlocking each other.
    let swap = (Arc::as_ptr(&old_parent) as usize) > (Arc::as_ptr(new_parent) as usize);
    let (first, second) = if swap {
        (new_parent, &old_parent)
    } else {
        (&old_parent, new_parent)
    };

    let mut first_children = first.children_lock();
    let mut second_children = second.children_lock();

    let (old_children, new_children) = if swap {
        (&mut second_children, &mut first_children)
    } else {
        (&mut first_children, &mut second_children)
    };

    if new_children.iter().any(|c| *c.name() == *name) {
        return Err(VfsError::AlreadyExists);
    }

    let idx = old_children
        .iter()
        .position(|c| Arc::ptr_eq(c, node))
        .ok_or(VfsError::NotFound)?;

    commit()?;

    old_children.remove(idx);
    node.set_name(name);
    node.set_parent(Arc::downgrade(new_parent));
    new_children.insert(0, node.clone());

    Ok(())
}

/// `/`-joined names from just below `stop` down to `node`; the result is
/// the driver path when `stop` is the enclosing mount. `stop = None` walks
/// to the structural root.
pub fn path_get_abs(node: &Arc<Node>, stop: Option<&Arc<Node>>) -> String {
    let mut names = Vec::new();
    let mut cur = node.clone();

    loop {
        if let Some(stop) = stop {
            if Arc::ptr_eq(&cur, stop) {
                break;
            }
        }

        let name = cur.name();
        if name.is_empty() {
            break;
        }
        names.push(name);

        match cur.parent() {
            Some(parent) => cur = parent,
            None => break,
        }
    }

    let mut out = String::new();
    for (i, name) in names.iter().rev().enumerate() {
        if i > 0 {
            out.push('/');
        }
        out.push_str(name);
    }

    out
}

/// Shortest relative path from `from`'s directory to `to`: `..` ascents to
/// the closest common ancestor, then the descent names. This is the body a
/// symbolic link at `from` stores to reach `to`.
pub fn path_get_rel(from: &Arc<Node>, to: &Arc<Node>) -> String {
    fn chain(node: &Arc<Node>) -> Vec<Arc<Node>> {
        let mut nodes = alloc::vec![node.clone()];
        let mut cur = node.clone();
        while let Some(parent) = cur.parent() {
            nodes.push(parent.clone());
            cur = parent;
        }
        nodes.reverse();
        nodes
    }

    let start = from.parent().unwrap_or_else(|| from.clone());
    let a = chain(&start);
    let b = chain(to);

    let mut common = 0;
    while common < a.len() && common < b.len() && Arc::ptr_eq(&a[common], &b[common]) {
        common += 1;
    }

    let mut out = String::new();
    for _ in common..a.len() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str("..");
    }
    for node in &b[common..] {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&node.name());
    }

    if out.is_empty() {
        out.push('.');
    }

    out
}

/// Destroys `node` once it is unreferenced and childless. With
/// [`DeleteFlags::PRUNE`], continues upward until an ancestor refuses.
pub(crate) fn delete_node(start: &Arc<Node>, flags: DeleteFlags) -> Result<()> {
    let mut node = start.clone();
    let mut first = true;

    loop {
        match delete_one(&node, flags) {
            Ok(parent) => {
                if !flags.contains(DeleteFlags::PRUNE) {
                    return Ok(());
                }

                node = parent;
                first = false;
            }
            // A refusing ancestor ends the prune walk, it is not an error
            Err(_) if !first => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

fn delete_one(node: &Arc<Node>, flags: DeleteFlags) -> Result<Arc<Node>> {
    let parent = node.parent().ok_or(VfsError::InvalidArgument)?;
    let mount = node.mount();

    if mount.is_none() && !flags.contains(DeleteFlags::PHYSICAL) {
        return Err(VfsError::InvalidArgument);
    }

    // Computed before the node is spliced out
    let mount_path = mount.as_ref().map(|m| path_get_abs(node, Some(m)));

    let mut siblings = parent.children_lock();

    if node.ref_count() > 0 {
        return Err(VfsError::Busy);
    }

    if !node.children_lock().is_empty() {
        return Err(VfsError::NotEmpty);
    }

    let idx = siblings
        .iter()
        .position(|c| Arc::ptr_eq(c, node))
        .ok_or(VfsError::NotFound)?;

    // Backing object first, so a driver failure leaves the graph intact
    if flags.contains(DeleteFlags::PHYSICAL) {
        if let Some(mount) = &mount {
            let resource = mount.props().resource.clone();
            if let (Some(resource), Some(path)) = (resource, &mount_path) {
                resource.driver().remove(&resource, path)?;
            }
        }
    }

    siblings.remove(idx);
    node.set_parent(Weak::new());
    drop(siblings);

    let (resource, link) = {
        let mut props = node.props();
        (props.resource.take(), props.link.take())
    };

    if let Some(target) = link.and_then(|w| w.upgrade()) {
        target.unpin();
    }

    // Last reference releases the driver binding
    drop(resource);

    debug!("deleted node \"{}\"", node.name());

    Ok(parent)
}

/// Post-order deletion of a subtree. The whole operation is refused with
/// `Busy` before anything is deleted if any reachable node is referenced.
pub(crate) fn delete_recursive(node: &Arc<Node>, flags: DeleteFlags) -> Result<()> {
    scan_referenced(node)?;
    delete_subtree(node, flags - DeleteFlags::PRUNE)
}

pub(crate) fn scan_referenced(node: &Arc<Node>) -> Result<()> {
    if node.ref_count() > 0 {
        return Err(VfsError::Busy);
    }

    for child in node.children() {
        scan_referenced(&child)?;
    }

    Ok(())
}

fn delete_subtree(node: &Arc<Node>, flags: DeleteFlags) -> Result<()> {
    // Deleting the head child splices it out, so the list drains in place
    loop {
        let child = node.children_lock().first().cloned();

        match child {
            Some(child) => delete_subtree(&child, flags)?,
            None => break,
        }
    }

    delete_node(node, flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, NodeRef};
    use crate::stat::{S_IFDIR, S_IFREG, Stat};

    fn dir() -> Arc<Node> {
        Node::new(
            NodeKind::Dir,
            Stat::with_mode(S_IFDIR | 0o755),
            None,
            Weak::new(),
        )
    }

    fn file() -> Arc<Node> {
        Node::new(
            NodeKind::File,
            Stat::with_mode(S_IFREG | 0o644),
            None,
            Weak::new(),
        )
    }

    #[test]
    fn attach_links_parent_and_child() {
        let root = dir();
        let child = file();

        attach(&root, &child, "a").unwrap();

        assert_eq!(&*child.name(), "a");
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &root));
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn sibling_names_are_unique() {
        let root = dir();

        attach(&root, &file(), "a").unwrap();
        assert_eq!(attach(&root, &file(), "a"), Err(VfsError::AlreadyExists));
    }

    #[test]
    fn detach_splices_out_of_the_sibling_list() {
        let root = dir();
        let a = file();
        let b = file();

        attach(&root, &a, "a").unwrap();
        attach(&root, &b, "b").unwrap();
        detach(&a).unwrap();

        assert!(a.parent().is_none());
        assert_eq!(root.children().len(), 1);
        assert_eq!(&*root.children()[0].name(), "b");
    }

    #[test]
    fn abs_path_stops_at_the_given_ancestor() {
        let root = dir();
        let a = dir();
        let b = dir();
        let c = file();

        attach(&root, &a, "a").unwrap();
        attach(&a, &b, "b").unwrap();
        attach(&b, &c, "c").unwrap();

        assert_eq!(path_get_abs(&c, None), "a/b/c");
        assert_eq!(path_get_abs(&c, Some(&a)), "b/c");
        assert_eq!(path_get_abs(&a, Some(&a)), "");
    }

    #[test]
    fn rel_path_ascends_to_the_common_ancestor() {
        let root = dir();
        let d1 = dir();
        let d2 = dir();
        let target = file();
        let link = file();

        attach(&root, &d1, "d1").unwrap();
        attach(&root, &d2, "d2").unwrap();
        attach(&d1, &target, "t").unwrap();
        attach(&d2, &link, "l").unwrap();

        assert_eq!(path_get_rel(&link, &target), "../d1/t");

        let sibling = file();
        attach(&d1, &sibling, "s").unwrap();
        assert_eq!(path_get_rel(&sibling, &target), "t");
    }

    #[test]
    fn delete_refuses_referenced_nodes() {
        let root = dir();
        let a = file();
        attach(&root, &a, "a").unwrap();

        let held = NodeRef::acquire(&a);
        assert_eq!(
            delete_node(&a, DeleteFlags::PHYSICAL),
            Err(VfsError::Busy)
        );

        drop(held);
        delete_node(&a, DeleteFlags::PHYSICAL).unwrap();
        assert!(root.children().is_empty());
    }

    #[test]
    fn delete_refuses_populated_directories() {
        let root = dir();
        let d = dir();
        attach(&root, &d, "d").unwrap();
        attach(&d, &file(), "f").unwrap();

        assert_eq!(
            delete_node(&d, DeleteFlags::PHYSICAL),
            Err(VfsError::NotEmpty)
        );
    }

    #[test]
    fn memory_nodes_need_the_physical_flag() {
        let root = dir();
        let a = file();
        attach(&root, &a, "a").unwrap();

        assert_eq!(
            delete_node(&a, DeleteFlags::empty()),
            Err(VfsError::InvalidArgument)
        );
    }

    #[test]
    fn prune_walks_upward_until_refused() {
        let root = dir();
        let a = dir();
        let b = dir();
        let c = file();

        attach(&root, &a, "a").unwrap();
        attach(&a, &b, "b").unwrap();
        attach(&b, &c, "c").unwrap();
        attach(&a, &file(), "keep").unwrap();

        delete_node(&c, DeleteFlags::PHYSICAL | DeleteFlags::PRUNE).unwrap();

        // b was emptied and pruned; a still holds "keep"
        assert_eq!(a.children().len(), 1);
        assert_eq!(&*a.children()[0].name(), "keep");
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn recursive_delete_is_all_or_nothing() {
        let root = dir();
        let d = dir();
        let f1 = file();
        let f2 = file();

        attach(&root, &d, "d").unwrap();
        attach(&d, &f1, "f1").unwrap();
        attach(&d, &f2, "f2").unwrap();

        let held = NodeRef::acquire(&f2);
        assert_eq!(
            delete_recursive(&d, DeleteFlags::PHYSICAL),
            Err(VfsError::Busy)
        );
        assert_eq!(d.children().len(), 2);

        drop(held);
        delete_recursive(&d, DeleteFlags::PHYSICAL).unwrap();
        assert!(root.children().is_empty());
    }
}
