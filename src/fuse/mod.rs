//! FUSE protocol adapter.
//!
//! Translates kernel filesystem calls (lookup, readdir, attr, open, read,
//! xattr) into capability invocations on plugin entries, routed through the
//! single-flight cache so that a listing followed by a burst of per-child
//! lookups costs one backend call.
//!
//! Main components:
//! - implementation of the `Filesystem` trait for [`PlugFs`], the adapter
//!   around a [`Registry`] of plugin roots,
//! - `mount`: helpers for mounting the adapter via FUSE,
//! - `prefetch`: background cache warmers triggered by lookups.
//!
//! Nodes are thin wrappers around an entry plus its kernel-visible path id;
//! they hold no children of their own. Children always come from the cache,
//! which is what keeps concurrent lookups and listings consistent.

pub mod mount;
mod prefetch;

use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyXAttr,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType, Timestamp};

use crate::cache::{Cache, CacheKey, Op};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::plugin::{Attributes, Entry, Group, Metadata, Registry, SizedReader};
use prefetch::{Job, Prefetcher};

const ROOT_INO: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeKind {
    Dir,
    File,
}

/// One kernel-visible filesystem node: an entry plus its computed path id.
struct Node {
    ino: u64,
    parent: u64,
    id: String,
    entry: Entry,
    kind: NodeKind,
}

#[derive(Default)]
struct NodeTable {
    by_ino: HashMap<u64, Arc<Node>>,
    by_id: HashMap<String, u64>,
}

/// FUSE adapter exposing a [`Registry`] of plugin roots as one mount.
///
/// Every handler takes `&self` and is safe to run concurrently with any
/// other handler, including on the same node; no lock is held across an
/// await, so a canceled kernel request simply drops its future.
pub struct PlugFs {
    config: Config,
    nodes: Mutex<NodeTable>,
    handles: Mutex<HashMap<u64, Arc<dyn SizedReader>>>,
    next_ino: AtomicU64,
    next_fh: AtomicU64,
    lists: Arc<Cache<Arc<Vec<Entry>>>>,
    meta: Cache<Arc<Metadata>>,
    prefetcher: Prefetcher,
}

fn child_id(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

/// Invoke a Group listing and normalize it: duplicate names are dropped so
/// each returned list is internally consistent.
async fn compute_children(id: String, group: Arc<dyn Group>) -> Result<Arc<Vec<Entry>>> {
    let raw = group
        .ls()
        .await
        .map_err(|e| Error::backend("list", id.clone(), e))?;
    let mut seen = HashSet::new();
    let mut children = Vec::with_capacity(raw.len());
    for entry in raw {
        if !seen.insert(entry.name().to_string()) {
            warn!("list {id}: duplicate child name {:?} dropped", entry.name());
            continue;
        }
        children.push(entry);
    }
    Ok(Arc::new(children))
}

fn file_attr(node: &Node, attr: &Attributes, req: &Request) -> FileAttr {
    // Mode bits are fixed: the mount is a read-only view no matter what the
    // backend reports.
    let (kind, perm) = match node.kind {
        NodeKind::Dir => (FileType::Directory, 0o550),
        NodeKind::File => (FileType::RegularFile, 0o440),
    };
    FileAttr {
        ino: node.ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: Timestamp::from(attr.atime),
        mtime: Timestamp::from(attr.mtime),
        ctime: Timestamp::from(attr.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(attr.ctime),
        kind,
        perm,
        nlink: 1,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

fn xattr_reply(data: Vec<u8>, size: u32) -> FuseResult<ReplyXAttr> {
    if size == 0 {
        return Ok(ReplyXAttr::Size(data.len() as u32));
    }
    if data.len() > size as usize {
        return Err(libc::ERANGE.into());
    }
    Ok(ReplyXAttr::Data(Bytes::from(data)))
}

impl PlugFs {
    pub fn new(registry: Arc<Registry>, config: Config) -> Self {
        let lists = Arc::new(Cache::new());
        let prefetcher = Prefetcher::spawn(&config, lists.clone());

        let root = Arc::new(Node {
            ino: ROOT_INO,
            parent: ROOT_INO,
            id: "/".to_string(),
            entry: registry.as_entry(),
            kind: NodeKind::Dir,
        });
        let mut table = NodeTable::default();
        table.by_id.insert(root.id.clone(), ROOT_INO);
        table.by_ino.insert(ROOT_INO, root);

        Self {
            config,
            nodes: Mutex::new(table),
            handles: Mutex::new(HashMap::new()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            next_fh: AtomicU64::new(1),
            lists,
            meta: Cache::new(),
            prefetcher,
        }
    }

    fn node(&self, ino: u64) -> Option<Arc<Node>> {
        self.nodes.lock().unwrap().by_ino.get(&ino).cloned()
    }

    /// Get or create the node wrapping `entry` under `parent`. Inode numbers
    /// are stable per path id; the wrapped entry is refreshed to whatever
    /// the latest cached listing produced.
    fn intern(&self, parent: &Node, entry: &Entry) -> Arc<Node> {
        let id = child_id(&parent.id, entry.name());
        let mut table = self.nodes.lock().unwrap();
        if let Some(&ino) = table.by_id.get(&id) {
            if let Some(node) = table.by_ino.get(&ino) {
                if Entry::same(&node.entry, entry) {
                    return node.clone();
                }
            }
        }
        let ino = match table.by_id.get(&id) {
            Some(&ino) => ino,
            None => self.next_ino.fetch_add(1, Ordering::Relaxed),
        };
        let kind = if entry.is_group() {
            NodeKind::Dir
        } else {
            NodeKind::File
        };
        let node = Arc::new(Node {
            ino,
            parent: parent.ino,
            id,
            entry: entry.clone(),
            kind,
        });
        table.by_id.insert(node.id.clone(), ino);
        table.by_ino.insert(ino, node.clone());
        node
    }

    /// Child entries of a directory node, via the cache keyed on the
    /// directory's path id. Repeated readdir and per-child lookups within
    /// the TTL window reuse one computed list.
    async fn children(&self, node: &Node) -> Result<Arc<Vec<Entry>>> {
        let Some(group) = node.entry.group().cloned() else {
            return Err(Error::NotFound(node.id.clone()));
        };
        let key = CacheKey::new(Op::List, &node.id);
        self.lists
            .get(key, self.config.ttl, compute_children(node.id.clone(), group))
            .await
    }

    /// Query an entry's attributes, downgrading backend failures to the zero
    /// value: some kernels handle getattr failure poorly, so the call still
    /// succeeds and the failure is only logged.
    async fn entry_attr(&self, node: &Node, unique: u64) -> Attributes {
        let Some(attributed) = node.entry.attributed().cloned() else {
            return Attributes::default();
        };
        match attributed.attr().await {
            Ok(attr) => attr,
            Err(e) => {
                warn!("attr failed on {} (req {unique}): {e:#}", node.id);
                Attributes::default()
            }
        }
    }

    /// Metadata map for an entry, cached per path id. Entries without the
    /// metadata capability report an empty map.
    async fn metadata(&self, node: &Node) -> Result<Arc<Metadata>> {
        let Some(resource) = node.entry.resource().cloned() else {
            return Ok(Arc::new(Metadata::new()));
        };
        let key = CacheKey::new(Op::Metadata, &node.id);
        let id = node.id.clone();
        self.meta
            .get(key, self.config.ttl, async move {
                resource
                    .metadata()
                    .await
                    .map(Arc::new)
                    .map_err(|e| Error::backend("metadata", id, e))
            })
            .await
    }

    fn prefetch(&self, node: &Arc<Node>) {
        match node.kind {
            NodeKind::Dir => self.prefetcher.submit(Job::Warm {
                id: node.id.clone(),
                entry: node.entry.clone(),
            }),
            NodeKind::File if node.entry.readable().is_some() => {
                self.prefetcher.submit(Job::HoldOpen {
                    id: node.id.clone(),
                    entry: node.entry.clone(),
                })
            }
            NodeKind::File => {}
        }
    }
}

impl Filesystem for PlugFs {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let Some(dir) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        let name = name.to_string_lossy();
        debug!("lookup {name:?} in {} (req {}, pid {})", dir.id, req.unique, req.pid);

        let children = match self.children(&dir).await {
            Ok(children) => children,
            Err(e) => {
                if matches!(e, Error::NotFound(_)) {
                    debug!("lookup {name:?} in {}: {e} (req {})", dir.id, req.unique);
                } else {
                    warn!("lookup {name:?} in {} failed: {e} (req {})", dir.id, req.unique);
                }
                return Err(e.errno().into());
            }
        };

        let Some(child) = children.iter().find(|e| e.name() == &*name) else {
            debug!("{name:?} not found in {} (req {})", dir.id, req.unique);
            return Err(libc::ENOENT.into());
        };

        let node = self.intern(&dir, child);
        self.prefetch(&node);

        let attr = self.entry_attr(&node, req.unique).await;
        Ok(ReplyEntry {
            ttl: attr.valid,
            attr: file_attr(&node, &attr, &req),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let Some(node) = self.node(ino) else {
            return Err(libc::ENOENT.into());
        };
        let attr = self.entry_attr(&node, req.unique).await;
        debug!("attr of {}: size {}, valid {:?}", node.id, attr.size, attr.valid);
        Ok(ReplyAttr {
            ttl: attr.valid,
            attr: file_attr(&node, &attr, &req),
        })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let Some(node) = self.node(ino) else {
            return Err(libc::ENOENT.into());
        };
        if node.kind != NodeKind::Dir {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let Some(dir) = self.node(ino) else {
            return Err(libc::ENOENT.into());
        };
        if dir.kind != NodeKind::Dir {
            return Err(libc::ENOTDIR.into());
        }
        let children = match self.children(&dir).await {
            Ok(children) => children,
            Err(e) => {
                if matches!(e, Error::NotFound(_)) {
                    debug!("list {}: {e} (req {})", dir.id, req.unique);
                } else {
                    warn!("list {} failed: {e} (req {})", dir.id, req.unique);
                }
                return Err(e.errno().into());
            }
        };
        debug!("listed {} entries in {} (req {})", children.len(), dir.id, req.unique);

        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(children.len() + 2);
        all.push(DirectoryEntry {
            inode: dir.ino,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: dir.parent,
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, entry) in children.iter().enumerate() {
            let node = self.intern(&dir, entry);
            let kind = match node.kind {
                NodeKind::Dir => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
            };
            all.push(DirectoryEntry {
                inode: node.ino,
                kind,
                name: OsString::from(entry.name()),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let entries: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let Some(dir) = self.node(parent) else {
            return Err(libc::ENOENT.into());
        };
        if dir.kind != NodeKind::Dir {
            return Err(libc::ENOTDIR.into());
        }
        let children = match self.children(&dir).await {
            Ok(children) => children,
            Err(e) => {
                if matches!(e, Error::NotFound(_)) {
                    debug!("list {}: {e} (req {})", dir.id, req.unique);
                } else {
                    warn!("list {} failed: {e} (req {})", dir.id, req.unique);
                }
                return Err(e.errno().into());
            }
        };

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(children.len() + 2);

        let dir_attr = self.entry_attr(&dir, req.unique).await;
        all.push(DirectoryEntryPlus {
            inode: dir.ino,
            generation: 0,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: file_attr(&dir, &dir_attr, &req),
            entry_ttl: dir_attr.valid,
            attr_ttl: dir_attr.valid,
        });

        let parent_node = self.node(dir.parent).unwrap_or_else(|| dir.clone());
        let parent_attr = self.entry_attr(&parent_node, req.unique).await;
        all.push(DirectoryEntryPlus {
            inode: parent_node.ino,
            generation: 0,
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: file_attr(&parent_node, &parent_attr, &req),
            entry_ttl: parent_attr.valid,
            attr_ttl: parent_attr.valid,
        });

        for (i, entry) in children.iter().enumerate() {
            let node = self.intern(&dir, entry);
            let attr = self.entry_attr(&node, req.unique).await;
            let kind = match node.kind {
                NodeKind::Dir => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
            };
            all.push(DirectoryEntryPlus {
                inode: node.ino,
                generation: 0,
                kind,
                name: OsString::from(entry.name()),
                offset: (i as i64) + 3,
                attr: file_attr(&node, &attr, &req),
                entry_ttl: attr.valid,
                attr_ttl: attr.valid,
            });
        }

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let entries: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries })
    }

    async fn open(&self, req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let Some(node) = self.node(ino) else {
            return Err(libc::ENOENT.into());
        };
        if node.kind == NodeKind::Dir {
            return Err(libc::EISDIR.into());
        }
        let Some(readable) = node.entry.readable().cloned() else {
            return Err(libc::EACCES.into());
        };
        match readable.open().await {
            Ok(reader) => {
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                self.handles.lock().unwrap().insert(fh, Arc::from(reader));
                debug!("opened {} as fh {} (req {})", node.id, fh, req.unique);
                Ok(ReplyOpen { fh, flags: 0 })
            }
            Err(e) => {
                warn!("open {} failed: {e:#} (req {})", node.id, req.unique);
                Err(libc::EIO.into())
            }
        }
    }

    async fn read(
        &self,
        req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let reader = self.handles.lock().unwrap().get(&fh).cloned();
        let Some(reader) = reader else {
            return Err(libc::EBADF.into());
        };
        // Reads at or past the end come back as an empty buffer, which the
        // kernel treats as EOF.
        match reader.read_at(offset, size as usize).await {
            Ok(data) => {
                debug!("read {}/{} bytes at {} from fh {}", data.len(), size, offset, fh);
                Ok(ReplyData { data })
            }
            Err(e) => {
                warn!("read fh {fh} at {offset} failed: {e:#} (req {})", req.unique);
                Err(libc::EIO.into())
            }
        }
    }

    async fn release(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        // Removing the handle drops the reader, closing any underlying
        // resource exactly once.
        self.handles.lock().unwrap().remove(&fh);
        Ok(())
    }

    async fn releasedir(&self, _req: Request, _ino: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn listxattr(&self, req: Request, ino: u64, size: u32) -> FuseResult<ReplyXAttr> {
        let Some(node) = self.node(ino) else {
            return Err(libc::ENOENT.into());
        };
        let meta = match self.metadata(&node).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("listxattr {} failed: {e} (req {})", node.id, req.unique);
                return Err(e.errno().into());
            }
        };
        let mut names: Vec<&String> = meta.keys().collect();
        names.sort();
        let mut data = Vec::new();
        for name in names {
            data.extend_from_slice(name.as_bytes());
            data.push(0);
        }
        xattr_reply(data, size)
    }

    async fn getxattr(
        &self,
        req: Request,
        ino: u64,
        name: &OsStr,
        size: u32,
    ) -> FuseResult<ReplyXAttr> {
        // macOS Finder probes this on every visible entry; recognized no-op.
        if name == OsStr::new("com.apple.FinderInfo") {
            return xattr_reply(Vec::new(), size);
        }
        let Some(node) = self.node(ino) else {
            return Err(libc::ENOENT.into());
        };
        let meta = match self.metadata(&node).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("getxattr {} failed: {e} (req {})", node.id, req.unique);
                return Err(e.errno().into());
            }
        };
        let data = match meta.get(&*name.to_string_lossy()) {
            Some(value) => serde_json::to_vec(value).map_err(|_| libc::EIO)?,
            None => Vec::new(),
        };
        xattr_reply(data, size)
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn forget(&self, _req: Request, _ino: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}
