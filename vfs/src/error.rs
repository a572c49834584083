use thiserror::Error;

pub type Result<T> = core::result::Result<T, VfsError>;

/// Error kinds surfaced by the VFS core. Failures reported by a backing
/// driver are wrapped in [`VfsError::Driver`] with the driver's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such node")]
    NotFound,
    #[error("node already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("node is in use")]
    Busy,
    #[error("permission denied")]
    PermissionDenied,
    #[error("no enclosing mount")]
    NoMount,
    #[error("driver error ({0})")]
    Driver(i32),
    #[error("out of memory")]
    OutOfMemory,
    #[error("too many levels of links")]
    TooManyLinks,
    #[error("operation crosses mounts")]
    CrossDevice,
}
