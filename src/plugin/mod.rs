//! Entry capability model and mount-point registry.
//!
//! A backend exposes its resources as [`Entry`] values: a name plus an
//! explicit set of optional capability implementations. The FUSE adapter and
//! the cache only ever talk to entries through those capabilities, so
//! heterogeneous backends (cloud instances, containers, API-backed services,
//! remote volumes) plug in without the filesystem layer knowing their
//! concrete types.
//!
//! Submodules:
//! - `entry`: capability traits, [`Entry`], [`Attributes`], [`SizedReader`]
//! - `registry`: the [`Root`] bootstrap contract and the [`Registry`]

mod entry;
mod registry;

pub use entry::{
    Attributed, Attributes, Entry, EntryBuilder, Execable, Group, Metadata, Pipe, Readable,
    Resource, SizedReader, Writable,
};
pub use registry::{Registry, Root};
