//! In-tree backing drivers: the buffer driver every VFS instance registers
//! for memory-only nodes, and a RAM-disk filesystem usable as a mount
//! resource.

pub mod buffer;
pub mod ram;
