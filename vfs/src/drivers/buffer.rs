//! The in-memory buffer driver. Nodes created below no mount have no
//! backing filesystem; each one gets a private resource over a growable
//! byte vector instead.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::error::{Result, VfsError};
use crate::file::File;
use crate::node::NodeKind;
use crate::registry::{self, BUFFER_DRIVER_INDEX};
use crate::resource::{Driver, DriverArg, DriverGroup, Resource};
use crate::stat::Stat;

/// Backing state of one buffer resource.
pub struct BufferData {
    stat: Mutex<Stat>,
    data: RwLock<Vec<u8>>,
}

impl BufferData {
    pub fn new(mode: u32) -> Self {
        Self {
            stat: Mutex::new(Stat::with_mode(mode)),
            data: RwLock::new(Vec::new()),
        }
    }
}

pub struct BufferDriver;

impl Driver for BufferDriver {
    fn stat(&self, resource: &Resource, path: Option<&str>) -> Result<Stat> {
        // buffers have no namespace of their own
        if path.is_some() {
            return Err(VfsError::NotFound);
        }

        Ok(*resource.data_as::<BufferData>().stat.lock())
    }

    fn locate(&self, _resource: &Resource, _path: &str) -> Option<DriverArg> {
        None
    }

    fn create(&self, _resource: &Resource, _path: &str, _mode: u32, _kind: NodeKind) -> Result<()> {
        Err(VfsError::InvalidArgument)
    }

    fn remove(&self, _resource: &Resource, _path: &str) -> Result<()> {
        // nothing outlives the resource itself
        Ok(())
    }

    fn rename(&self, _resource: &Resource, _old: &str, _new: &str) -> Result<()> {
        Ok(())
    }

    fn read(&self, file: &File, resource: &Resource, buffer: &mut [u8]) -> Result<usize> {
        let data = resource.data_as::<BufferData>().data.read();
        let offset = file.offset() as usize;

        // Nothing to read past the end of the buffer
        if offset > data.len() {
            return Ok(0);
        }

        let remaining = data.len() - offset;
        let read_size = buffer.len().min(remaining);

        buffer[..read_size].copy_from_slice(&data[offset..offset + read_size]);

        Ok(read_size)
    }

    fn write(&self, file: &File, resource: &Resource, buffer: &[u8]) -> Result<usize> {
        let backing = resource.data_as::<BufferData>();
        let mut data = backing.data.write();
        let offset = file.offset() as usize;

        // Extending writes zero-fill any hole between the old end and the
        // write offset
        let min_new_len = offset + buffer.len();
        if min_new_len > data.len() {
            data.resize(min_new_len, 0);
        }

        data[offset..offset + buffer.len()].copy_from_slice(buffer);

        backing.stat.lock().size = data.len() as u64;

        Ok(buffer.len())
    }
}

/// Registers the buffer driver in its reserved slot. Safe to call more than
/// once; only the first registration takes.
pub(crate) fn register() {
    let _ = registry::register_driver(
        DriverGroup::FsFile,
        BUFFER_DRIVER_INDEX,
        Arc::new(BufferDriver),
    );
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use super::*;
    use crate::file::OpenFlags;
    use crate::node::{Node, NodeRef};
    use crate::stat::S_IFREG;

    fn buffer_file() -> (File, Arc<Resource>) {
        register();

        let resource = registry::init_resource(
            DriverGroup::FsFile,
            BUFFER_DRIVER_INDEX,
            Some(Box::new(BufferData::new(S_IFREG | 0o600))),
        )
        .unwrap();

        let node = Node::new(
            NodeKind::Buffer,
            Stat::with_mode(S_IFREG | 0o600),
            Some(resource.clone()),
            alloc::sync::Weak::new(),
        );

        let file = File::internal(
            NodeRef::acquire(&node),
            OpenFlags::READ | OpenFlags::WRITE,
            Some(resource.clone()),
        );

        (file, resource)
    }

    #[test]
    fn writes_extend_and_reads_clamp() {
        let (file, resource) = buffer_file();
        let driver = BufferDriver;

        assert_eq!(driver.write(&file, &resource, b"hello").unwrap(), 5);

        let mut buf = [0u8; 16];
        assert_eq!(driver.read(&file, &resource, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        file.set_offset(3);
        assert_eq!(driver.read(&file, &resource, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
    }

    #[test]
    fn holes_are_zero_filled() {
        let (file, resource) = buffer_file();
        let driver = BufferDriver;

        file.set_offset(4);
        driver.write(&file, &resource, b"x").unwrap();

        file.set_offset(0);
        let mut buf = [0xffu8; 5];
        assert_eq!(driver.read(&file, &resource, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"\0\0\0\0x");

        assert_eq!(driver.stat(&resource, None).unwrap().size, 5);
    }
}
