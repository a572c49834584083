//! An in-kernel virtual file system.
//!
//! The VFS keeps an in-memory name graph that caches and unifies objects
//! drawn from mounted backing filesystems. Paths resolve against the graph
//! with per-node lock coupling; components that are not present yet are
//! materialized lazily from the nearest mount's driver. Nodes are kept
//! alive by an explicit reference count fed by open handles, in-flight
//! traversals, and structural pins (the root, mounts, resolved link
//! targets); a bounded cache of recently closed nodes softens the cost of
//! re-opening.
//!
//! Backing filesystems plug in through the [`Driver`] trait and are bound
//! to nodes as reference-counted [`Resource`]s. The crate installs no
//! logger and owns no persistent state; both belong to the embedding
//! kernel.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod cache;
mod path;

pub mod drivers;
pub mod graph;
pub mod error;
pub mod file;
pub mod node;
pub mod perms;
pub mod registry;
pub mod resolver;
pub mod resource;
pub mod stat;
pub mod vfs;

pub use error::{Result, VfsError};
pub use file::{File, OpenFlags};
pub use node::{Node, NodeKind, NodeRef};
pub use perms::check_perms;
pub use resolver::{MissingComponent, NodeInfo, Resolution, TraverseFlags};
pub use resource::{Driver, DriverArg, DriverGroup, Resource};
pub use stat::{SeekFrom, Stat};
pub use vfs::{Credentials, Vfs, get, init};
