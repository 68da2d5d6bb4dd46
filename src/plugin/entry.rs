use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::exec::ExecResult;

/// Key/value metadata reported by a [`Resource`] entry.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Filesystem attributes reported for an entry.
///
/// `valid` tells the kernel how long it may cache the value before asking
/// again; it is distinct from the internal cache TTL.
#[derive(Clone, Debug)]
pub struct Attributes {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub mode: u32,
    pub size: u64,
    pub valid: Duration,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            mode: 0,
            size: 0,
            valid: Duration::ZERO,
        }
    }
}

/// Sized random-access reader produced by [`Readable::open`].
#[async_trait]
pub trait SizedReader: Send + Sync {
    /// Total content size in bytes.
    fn size(&self) -> u64;

    /// Read up to `len` bytes starting at `offset`. Reads at or past the
    /// end return an empty buffer, not an error.
    async fn read_at(&self, offset: u64, len: usize) -> anyhow::Result<Bytes>;
}

/// In-memory buffers already satisfy the reader contract; backends that
/// materialize content wholesale (e.g. by running `cat` on a remote volume)
/// can return the bytes directly.
#[async_trait]
impl SizedReader for Bytes {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> anyhow::Result<Bytes> {
        if offset >= self.len() as u64 {
            return Ok(Bytes::new());
        }
        let start = offset as usize;
        let end = usize::min(start.saturating_add(len), self.len());
        Ok(self.slice(start..end))
    }
}

/// An entry that can list child entries. Renders as a directory.
#[async_trait]
pub trait Group: Send + Sync {
    async fn ls(&self) -> anyhow::Result<Vec<Entry>>;
}

/// An entry that reports filesystem attributes directly.
#[async_trait]
pub trait Attributed: Send + Sync {
    async fn attr(&self) -> anyhow::Result<Attributes>;
}

/// An entry with a fixed amount of content that can be opened for
/// random-access reads.
#[async_trait]
pub trait Readable: Send + Sync {
    async fn open(&self) -> anyhow::Result<Box<dyn SizedReader>>;
}

/// An entry that accepts a full replacement byte stream.
#[async_trait]
pub trait Writable: Send + Sync {
    async fn save(&self, data: Bytes) -> anyhow::Result<()>;
}

/// An entry exposing a continuous update stream.
#[async_trait]
pub trait Pipe: Send + Sync {
    async fn stream(&self) -> anyhow::Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// An entry a command can be run against, producing streamed output.
#[async_trait]
pub trait Execable: Send + Sync {
    async fn exec(&self, cmd: &str, args: &[String]) -> anyhow::Result<ExecResult>;
}

/// An entry that reports key/value metadata.
#[async_trait]
pub trait Resource: Send + Sync {
    async fn metadata(&self) -> anyhow::Result<Metadata>;
}

struct EntryInner {
    name: String,
    group: Option<Arc<dyn Group>>,
    attributed: Option<Arc<dyn Attributed>>,
    readable: Option<Arc<dyn Readable>>,
    writable: Option<Arc<dyn Writable>>,
    pipe: Option<Arc<dyn Pipe>>,
    execable: Option<Arc<dyn Execable>>,
    resource: Option<Arc<dyn Resource>>,
}

/// A named backend resource plus the capabilities it supports.
///
/// The capability set is fixed at construction time; support checks are
/// plain `Option` accessors with no side effects, and call sites gate on
/// them before invoking anything. Cloning is cheap and clones share
/// identity (see [`Entry::same`]).
#[derive(Clone)]
pub struct Entry {
    inner: Arc<EntryInner>,
}

impl Entry {
    pub fn new(name: impl Into<String>) -> EntryBuilder {
        EntryBuilder {
            name: name.into(),
            group: None,
            attributed: None,
            readable: None,
            writable: None,
            pipe: None,
            execable: None,
            resource: None,
        }
    }

    /// Path segment, unique among siblings.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether two handles refer to the same underlying entry.
    pub fn same(a: &Entry, b: &Entry) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// A Group-capable entry renders as a directory regardless of its other
    /// capabilities.
    pub fn is_group(&self) -> bool {
        self.inner.group.is_some()
    }

    pub fn group(&self) -> Option<&Arc<dyn Group>> {
        self.inner.group.as_ref()
    }

    pub fn attributed(&self) -> Option<&Arc<dyn Attributed>> {
        self.inner.attributed.as_ref()
    }

    pub fn readable(&self) -> Option<&Arc<dyn Readable>> {
        self.inner.readable.as_ref()
    }

    pub fn writable(&self) -> Option<&Arc<dyn Writable>> {
        self.inner.writable.as_ref()
    }

    pub fn pipe(&self) -> Option<&Arc<dyn Pipe>> {
        self.inner.pipe.as_ref()
    }

    pub fn execable(&self) -> Option<&Arc<dyn Execable>> {
        self.inner.execable.as_ref()
    }

    pub fn resource(&self) -> Option<&Arc<dyn Resource>> {
        self.inner.resource.as_ref()
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.inner.name)
            .field("group", &self.inner.group.is_some())
            .field("readable", &self.inner.readable.is_some())
            .finish()
    }
}

/// Builder attaching capability implementations to a new [`Entry`].
///
/// Backends typically implement several capabilities on one type and attach
/// the same `Arc` more than once:
///
/// ```ignore
/// let file = Arc::new(MyFile::new(path));
/// let entry = Entry::new("hello")
///     .readable(file.clone())
///     .attributed(file)
///     .build();
/// ```
pub struct EntryBuilder {
    name: String,
    group: Option<Arc<dyn Group>>,
    attributed: Option<Arc<dyn Attributed>>,
    readable: Option<Arc<dyn Readable>>,
    writable: Option<Arc<dyn Writable>>,
    pipe: Option<Arc<dyn Pipe>>,
    execable: Option<Arc<dyn Execable>>,
    resource: Option<Arc<dyn Resource>>,
}

impl EntryBuilder {
    pub fn group(mut self, imp: Arc<dyn Group>) -> Self {
        self.group = Some(imp);
        self
    }

    pub fn attributed(mut self, imp: Arc<dyn Attributed>) -> Self {
        self.attributed = Some(imp);
        self
    }

    pub fn readable(mut self, imp: Arc<dyn Readable>) -> Self {
        self.readable = Some(imp);
        self
    }

    pub fn writable(mut self, imp: Arc<dyn Writable>) -> Self {
        self.writable = Some(imp);
        self
    }

    pub fn pipe(mut self, imp: Arc<dyn Pipe>) -> Self {
        self.pipe = Some(imp);
        self
    }

    pub fn execable(mut self, imp: Arc<dyn Execable>) -> Self {
        self.execable = Some(imp);
        self
    }

    pub fn resource(mut self, imp: Arc<dyn Resource>) -> Self {
        self.resource = Some(imp);
        self
    }

    pub fn build(self) -> Entry {
        Entry {
            inner: Arc::new(EntryInner {
                name: self.name,
                group: self.group,
                attributed: self.attributed,
                readable: self.readable,
                writable: self.writable,
                pipe: self.pipe,
                execable: self.execable,
                resource: self.resource,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_reader_serves_ranges() {
        let buf = Bytes::from_static(b"hello world");
        assert_eq!(buf.size(), 11);
        assert_eq!(buf.read_at(0, 5).await.unwrap().as_ref(), b"hello");
        assert_eq!(buf.read_at(6, 100).await.unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn bytes_reader_past_end_is_empty() {
        let buf = Bytes::from_static(b"hi");
        assert!(buf.read_at(2, 10).await.unwrap().is_empty());
        assert!(buf.read_at(100, 1).await.unwrap().is_empty());
    }

    #[test]
    fn capability_checks_follow_construction() {
        let entry = Entry::new("leaf")
            .readable(Arc::new(FixedContent(Bytes::from_static(b"x"))))
            .build();
        assert!(!entry.is_group());
        assert!(entry.readable().is_some());
        assert!(entry.resource().is_none());
        assert!(entry.writable().is_none());
        assert!(entry.pipe().is_none());
        assert!(entry.execable().is_none());
    }

    #[tokio::test]
    async fn capabilities_mix_freely_on_one_entry() {
        let sink = Arc::new(Sink);
        let entry = Entry::new("mixed")
            .readable(Arc::new(FixedContent(Bytes::from_static(b"x"))))
            .writable(sink)
            .build();
        assert!(entry.readable().is_some());
        let writable = entry.writable().unwrap();
        writable.save(Bytes::from_static(b"new")).await.unwrap();
    }

    struct FixedContent(Bytes);

    #[async_trait]
    impl Readable for FixedContent {
        async fn open(&self) -> anyhow::Result<Box<dyn SizedReader>> {
            Ok(Box::new(self.0.clone()))
        }
    }

    struct Sink;

    #[async_trait]
    impl Writable for Sink {
        async fn save(&self, _data: Bytes) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
