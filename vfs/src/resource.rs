//! Resources bind a registered driver slot to the opaque argument the driver
//! produced for one backing object. Nodes and open handles share the binding
//! through `Arc`: cloning is taking a reference, dropping the last clone
//! releases the driver state.

use alloc::{boxed::Box, sync::Arc};
use core::any::Any;

use crate::error::Result;
use crate::file::File;
use crate::node::NodeKind;
use crate::stat::{SeekFrom, Stat};

/// Driver-private argument attached to a resource at `locate` time.
pub type DriverArg = Box<dyn Any + Send + Sync>;

/// Families of driver slots. A mount's slot index selects the family member;
/// the group selects the directory or file handler within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriverGroup {
    /// Device drivers addressed through device nodes.
    Dev,
    /// File handlers of a backing filesystem.
    FsFile,
    /// Directory handlers of a backing filesystem.
    FsDir,
}

/// Entry points a backing-filesystem driver exposes. Paths handed to a
/// driver are relative to its mount; `None` addresses the resource's own
/// object.
pub trait Driver: Send + Sync {
    /// Reports metadata for `path`, or for the resource itself when `path`
    /// is `None`.
    fn stat(&self, resource: &Resource, path: Option<&str>) -> Result<Stat>;

    /// Produces the argument a child resource for `path` is constructed
    /// with, or `None` when the driver needs no per-object state.
    fn locate(&self, resource: &Resource, path: &str) -> Option<DriverArg>;

    /// Creates `path` on the backing store.
    fn create(&self, resource: &Resource, path: &str, mode: u32, kind: NodeKind) -> Result<()>;

    /// Removes `path` from the backing store.
    fn remove(&self, resource: &Resource, path: &str) -> Result<()>;

    /// Renames `old` to `new`, both relative to the same mount.
    fn rename(&self, resource: &Resource, old: &str, new: &str) -> Result<()>;

    /// Reads from the handle's current offset. Returns the number of bytes
    /// read.
    fn read(&self, file: &File, resource: &Resource, buffer: &mut [u8]) -> Result<usize>;

    /// Writes at the handle's current offset. Returns the number of bytes
    /// written.
    fn write(&self, file: &File, resource: &Resource, buffer: &[u8]) -> Result<usize>;

    /// Hook for types with their own seek rules. `None` defers to the
    /// handle layer.
    fn seek(&self, _file: &File, _resource: &Resource, _pos: SeekFrom) -> Option<Result<u64>> {
        None
    }

    /// Hook run when a handle over this resource is closed.
    fn close(&self, _file: &File, _resource: &Resource) -> Result<()> {
        Ok(())
    }
}

pub struct Resource {
    group: DriverGroup,
    index: u64,
    driver: Arc<dyn Driver>,
    arg: Option<DriverArg>,
}

impl Resource {
    pub(crate) fn new(
        group: DriverGroup,
        index: u64,
        driver: Arc<dyn Driver>,
        arg: Option<DriverArg>,
    ) -> Self {
        Self {
            group,
            index,
            driver,
            arg,
        }
    }

    pub fn group(&self) -> DriverGroup {
        self.group
    }

    /// Slot index this resource was constructed from; children of a mount
    /// inherit it.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn driver(&self) -> &dyn Driver {
        &*self.driver
    }

    /// The driver-private argument, downcast to its concrete type.
    #[track_caller]
    pub fn data_as<T: 'static>(&self) -> &T {
        self.arg
            .as_ref()
            .unwrap()
            .downcast_ref::<T>()
            .unwrap()
    }
}
