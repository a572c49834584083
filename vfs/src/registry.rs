use alloc::{collections::BTreeMap, sync::Arc};

use spin::Mutex;

use crate::error::{Result, VfsError};
use crate::resource::{Driver, DriverArg, DriverGroup, Resource};

/// Slot reserved in the `FsFile` group for the in-memory buffer driver that
/// backs nodes created below no mount.
pub const BUFFER_DRIVER_INDEX: u64 = 0;

lazy_static::lazy_static! {
    // Maps (group, index) slots to driver implementations
    static ref DRIVER_REGISTRY: Mutex<BTreeMap<(DriverGroup, u64), Arc<dyn Driver>>>
        = Default::default();
}

#[derive(Debug)]
pub enum DriverRegistrationError {
    SlotConflict,
}

/// Registers a driver under a slot so resources can be constructed against
/// it when nodes are materialized.
pub fn register_driver(
    group: DriverGroup,
    index: u64,
    driver: Arc<dyn Driver>,
) -> core::result::Result<(), DriverRegistrationError> {
    let mut registry = DRIVER_REGISTRY.lock();

    // Make sure no other driver is registered under this slot
    if registry.contains_key(&(group, index)) {
        return Err(DriverRegistrationError::SlotConflict);
    }

    registry.insert((group, index), driver);

    Ok(())
}

/// Gets a driver by slot for resource construction
pub fn find_driver(group: DriverGroup, index: u64) -> Option<Arc<dyn Driver>> {
    let registry = DRIVER_REGISTRY.lock();

    registry.get(&(group, index)).cloned()
}

/// Builds a reference-counted binding of the slot's driver to `arg`.
pub fn init_resource(
    group: DriverGroup,
    index: u64,
    arg: Option<DriverArg>,
) -> Result<Arc<Resource>> {
    let driver = find_driver(group, index).ok_or(VfsError::InvalidArgument)?;

    Ok(Arc::new(Resource::new(group, index, driver, arg)))
}
