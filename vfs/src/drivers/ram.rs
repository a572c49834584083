//! A RAM-disk backing filesystem.
//!
//! The disk keeps its own tree of entries keyed by name, independent of the
//! VFS graph, so nodes materialize lazily from it exactly the way they
//! would from an on-disk driver. One driver instance serves both the
//! directory and the file slot of its family.

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use log::debug;
use spin::{Mutex, RwLock};

use crate::error::{Result, VfsError};
use crate::file::File;
use crate::node::NodeKind;
use crate::registry::{self, DriverRegistrationError};
use crate::resource::{Driver, DriverArg, DriverGroup, Resource};
use crate::stat::{S_IFDIR, S_IFMT, Stat};

/// One object on the disk.
struct RamEntry {
    stat: Mutex<Stat>,
    data: RwLock<Vec<u8>>,
    children: RwLock<BTreeMap<String, Arc<RamEntry>>>,
}

impl RamEntry {
    fn new(mode: u32) -> Arc<Self> {
        Arc::new(Self {
            stat: Mutex::new(Stat::with_mode(mode)),
            data: RwLock::new(Vec::new()),
            children: RwLock::new(BTreeMap::new()),
        })
    }

    fn is_dir(&self) -> bool {
        self.stat.lock().mode & S_IFMT == S_IFDIR
    }
}

/// An in-memory backing filesystem. Build one, seed it if needed, and hand
/// [`RamDisk::mount_resource`] to the mount operation.
pub struct RamDisk {
    root: Arc<RamEntry>,
}

/// The locate argument: the disk and the located entry on it.
struct RamRef {
    disk: Arc<RamDisk>,
    entry: Arc<RamEntry>,
}

impl RamDisk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: RamEntry::new(S_IFDIR | 0o755),
        })
    }

    /// Builds the resource the disk is mounted through, under the driver
    /// family registered at `index`.
    pub fn mount_resource(self: &Arc<Self>, index: u64) -> Result<Arc<Resource>> {
        registry::init_resource(
            DriverGroup::FsDir,
            index,
            Some(Box::new(RamRef {
                disk: self.clone(),
                entry: self.root.clone(),
            })),
        )
    }

    /// Seeds an object at `path`, creating missing parents as directories.
    /// Meant for building fixtures before the disk is mounted.
    pub fn add(self: &Arc<Self>, path: &str, mode: u32, data: &[u8]) {
        let mut cur = self.root.clone();
        let mut names = path.split('/').filter(|s| !s.is_empty()).peekable();

        while let Some(name) = names.next() {
            if names.peek().is_none() {
                let entry = RamEntry::new(mode);
                *entry.data.write() = data.to_vec();
                entry.stat.lock().size = data.len() as u64;
                cur.children.write().insert(name.to_string(), entry);
                return;
            }

            let next = {
                let mut children = cur.children.write();
                children
                    .entry(name.to_string())
                    .or_insert_with(|| RamEntry::new(S_IFDIR | 0o755))
                    .clone()
            };
            cur = next;
        }
    }

    /// Rewrites the ownership of a seeded object.
    pub fn set_owner(self: &Arc<Self>, path: &str, uid: u32, gid: u32) -> bool {
        match self.lookup(path) {
            Some(entry) => {
                let mut stat = entry.stat.lock();
                stat.uid = uid;
                stat.gid = gid;
                true
            }
            None => false,
        }
    }

    fn lookup(&self, path: &str) -> Option<Arc<RamEntry>> {
        let mut cur = self.root.clone();

        for name in path.split('/').filter(|s| !s.is_empty()) {
            let next = cur.children.read().get(name).cloned()?;
            cur = next;
        }

        Some(cur)
    }

    fn lookup_parent(&self, path: &str) -> Option<(Arc<RamEntry>, String)> {
        let names: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (leaf, dirs) = names.split_last()?;

        let mut cur = self.root.clone();
        for name in dirs {
            let next = cur.children.read().get(*name).cloned()?;
            cur = next;
        }

        Some((cur, leaf.to_string()))
    }
}

pub struct RamDriver;

impl Driver for RamDriver {
    fn stat(&self, resource: &Resource, path: Option<&str>) -> Result<Stat> {
        let this = resource.data_as::<RamRef>();

        match path {
            None => Ok(*this.entry.stat.lock()),
            Some(path) => this
                .disk
                .lookup(path)
                .map(|entry| *entry.stat.lock())
                .ok_or(VfsError::NotFound),
        }
    }

    fn locate(&self, resource: &Resource, path: &str) -> Option<DriverArg> {
        let this = resource.data_as::<RamRef>();

        this.disk.lookup(path).map(|entry| {
            Box::new(RamRef {
                disk: this.disk.clone(),
                entry,
            }) as DriverArg
        })
    }

    fn create(&self, resource: &Resource, path: &str, mode: u32, _kind: NodeKind) -> Result<()> {
        let this = resource.data_as::<RamRef>();

        let (parent, name) = this.disk.lookup_parent(path).ok_or(VfsError::NotFound)?;
        if !parent.is_dir() {
            return Err(VfsError::NotFound);
        }

        let mut children = parent.children.write();
        if children.contains_key(&name) {
            return Err(VfsError::AlreadyExists);
        }

        children.insert(name, RamEntry::new(mode));

        debug!("ram disk created \"{}\"", path);

        Ok(())
    }

    fn remove(&self, resource: &Resource, path: &str) -> Result<()> {
        let this = resource.data_as::<RamRef>();

        let (parent, name) = this.disk.lookup_parent(path).ok_or(VfsError::NotFound)?;

        let mut children = parent.children.write();
        let entry = children.get(&name).ok_or(VfsError::NotFound)?;

        if entry.is_dir() && !entry.children.read().is_empty() {
            return Err(VfsError::NotEmpty);
        }

        children.remove(&name);

        Ok(())
    }

    fn rename(&self, resource: &Resource, old: &str, new: &str) -> Result<()> {
        let this = resource.data_as::<RamRef>();

        let (old_parent, old_name) = this.disk.lookup_parent(old).ok_or(VfsError::NotFound)?;
        let (new_parent, new_name) = this.disk.lookup_parent(new).ok_or(VfsError::NotFound)?;

        if new_parent.children.read().contains_key(&new_name)
            && !(Arc::ptr_eq(&old_parent, &new_parent) && old_name == new_name)
        {
            return Err(VfsError::AlreadyExists);
        }

        let entry = old_parent
            .children
            .write()
            .remove(&old_name)
            .ok_or(VfsError::NotFound)?;

        new_parent.children.write().insert(new_name, entry);

        Ok(())
    }

    fn read(&self, file: &File, resource: &Resource, buffer: &mut [u8]) -> Result<usize> {
        let this = resource.data_as::<RamRef>();
        let data = this.entry.data.read();
        let offset = file.offset() as usize;

        if offset > data.len() {
            return Ok(0);
        }

        let remaining = data.len() - offset;
        let read_size = buffer.len().min(remaining);

        buffer[..read_size].copy_from_slice(&data[offset..offset + read_size]);

        Ok(read_size)
    }

    fn write(&self, file: &File, resource: &Resource, buffer: &[u8]) -> Result<usize> {
        let this = resource.data_as::<RamRef>();
        let mut data = this.entry.data.write();
        let offset = file.offset() as usize;

        let min_new_len = offset + buffer.len();
        if min_new_len > data.len() {
            data.resize(min_new_len, 0);
        }

        data[offset..offset + buffer.len()].copy_from_slice(buffer);

        this.entry.stat.lock().size = data.len() as u64;

        Ok(buffer.len())
    }
}

/// Registers the RAM filesystem driver family under `index` (one driver
/// serves both the directory and the file slot).
pub fn register(index: u64) -> core::result::Result<(), DriverRegistrationError> {
    let driver = Arc::new(RamDriver);

    registry::register_driver(DriverGroup::FsDir, index, driver.clone())?;
    registry::register_driver(DriverGroup::FsFile, index, driver)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_builds_intermediate_directories() {
        let disk = RamDisk::new();
        disk.add("a/b/c", crate::stat::S_IFREG | 0o644, b"data");

        let dir = disk.lookup("a/b").unwrap();
        assert!(dir.is_dir());

        let file = disk.lookup("a/b/c").unwrap();
        assert_eq!(file.stat.lock().size, 4);
        assert_eq!(&*file.data.read(), b"data");
    }

    #[test]
    fn lookup_parent_splits_the_leaf() {
        let disk = RamDisk::new();
        disk.add("a/b", S_IFDIR | 0o755, b"");

        let (parent, name) = disk.lookup_parent("a/b/c").unwrap();
        assert!(Arc::ptr_eq(&parent, &disk.lookup("a/b").unwrap()));
        assert_eq!(name, "c");

        assert!(disk.lookup_parent("missing/x/y").is_none());
    }
}
