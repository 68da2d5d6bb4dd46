//! Heterogeneous remote and local resources exposed as a POSIX-like
//! filesystem over FUSE.
//!
//! Any backend that implements the small capability contract in [`plugin`]
//! (listable, readable, executable, streamable) becomes navigable with
//! standard file tools. The [`fuse`] adapter translates kernel filesystem
//! calls into capability invocations through a deduplicating TTL [`cache`],
//! and a background prefetcher masks the latency of remote calls.
//!
//! Main components:
//! - `plugin`: the entry capability model and the mount-point registry.
//! - `cache`: keyed, TTL-governed, single-flight result store.
//! - `fuse`: the FUSE protocol adapter, mount helpers and the prefetcher.
//! - `exec`: streamed command execution consumed by executable backends.

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod fuse;
pub mod plugin;

pub use config::Config;
pub use error::{Error, Result};
