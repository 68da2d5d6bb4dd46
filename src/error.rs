use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the filesystem core.
///
/// `Backend` wraps whatever a capability implementation failed with. The
/// cause is held in an `Arc` so the same failure can be handed to every
/// waiter of a shared in-flight computation.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("{op} failed on {id}: {cause}")]
    Backend {
        op: &'static str,
        id: String,
        cause: Arc<anyhow::Error>,
    },

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("mount {name:?} rejected: {reason}")]
    Mount { name: String, reason: String },
}

impl Error {
    pub fn backend(op: &'static str, id: impl Into<String>, cause: anyhow::Error) -> Self {
        Error::Backend {
            op,
            id: id.into(),
            cause: Arc::new(cause),
        }
    }

    /// Kernel-facing errno for this error. Only `NotFound` maps to the
    /// dedicated "no entry" code; everything else is an I/O failure.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            _ => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
