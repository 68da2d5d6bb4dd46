use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::plugin::{Attributed, Attributes, Entry, Group};

/// Bootstrap contract for a backend: produce the plugin's root entry for
/// the mount-point name it was registered under. The returned entry must be
/// Group-capable, since it anchors a directory tree.
#[async_trait]
pub trait Root: Send + Sync {
    async fn init(&self, name: &str) -> anyhow::Result<Entry>;
}

/// Fixed, process-lifetime mapping from mount-point names to plugin roots.
///
/// Mutable only while plugins register during startup; afterwards it is
/// shared as `Arc<Registry>` and read without locking. Names are unique and
/// matched case-sensitively.
pub struct Registry {
    mounts: BTreeMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            mounts: BTreeMap::new(),
        }
    }

    /// Initialize `root` and register its entry under `name`.
    pub async fn mount(&mut self, name: &str, root: &dyn Root) -> Result<()> {
        if self.mounts.contains_key(name) {
            return Err(Error::Mount {
                name: name.into(),
                reason: "name already registered".into(),
            });
        }
        let entry = root
            .init(name)
            .await
            .map_err(|e| Error::backend("init", name, e))?;
        if !entry.is_group() {
            return Err(Error::Mount {
                name: name.into(),
                reason: "root entry is not listable".into(),
            });
        }
        info!("mounted plugin {name:?}");
        self.mounts.insert(name.to_string(), entry);
        Ok(())
    }

    /// Exact-match lookup of a mounted root.
    pub fn find(&self, name: &str) -> Option<Entry> {
        self.mounts.get(name).cloned()
    }

    /// All mounted roots, in name order.
    pub fn list(&self) -> Vec<Entry> {
        self.mounts.values().cloned().collect()
    }

    /// The filesystem root: a directory listing every mounted plugin.
    pub fn as_entry(self: &Arc<Self>) -> Entry {
        let this: Arc<dyn Group> = self.clone();
        let attr: Arc<dyn Attributed> = self.clone();
        Entry::new("/").group(this).attributed(attr).build()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Group for Registry {
    async fn ls(&self) -> anyhow::Result<Vec<Entry>> {
        Ok(self.list())
    }
}

#[async_trait]
impl Attributed for Registry {
    /// Aggregate mtime: the latest mtime across all roots that report
    /// attributes. Cheap to recompute but roots may change, so the kernel
    /// validity stays short. Any root's failure propagates.
    async fn attr(&self) -> anyhow::Result<Attributes> {
        let mut latest = SystemTime::UNIX_EPOCH;
        for entry in self.mounts.values() {
            if let Some(attributed) = entry.attributed() {
                let attr = attributed.attr().await?;
                if attr.mtime > latest {
                    latest = attr.mtime;
                }
            }
        }
        Ok(Attributes {
            mtime: latest,
            valid: Duration::from_millis(100),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct EmptyDir;

    #[async_trait]
    impl Group for EmptyDir {
        async fn ls(&self) -> anyhow::Result<Vec<Entry>> {
            Ok(Vec::new())
        }
    }

    struct StampedDir(SystemTime);

    #[async_trait]
    impl Group for StampedDir {
        async fn ls(&self) -> anyhow::Result<Vec<Entry>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Attributed for StampedDir {
        async fn attr(&self) -> anyhow::Result<Attributes> {
            Ok(Attributes {
                mtime: self.0,
                ..Default::default()
            })
        }
    }

    struct BrokenDir;

    #[async_trait]
    impl Group for BrokenDir {
        async fn ls(&self) -> anyhow::Result<Vec<Entry>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Attributed for BrokenDir {
        async fn attr(&self) -> anyhow::Result<Attributes> {
            Err(anyhow!("backend offline"))
        }
    }

    struct GroupRoot;

    #[async_trait]
    impl Root for GroupRoot {
        async fn init(&self, name: &str) -> anyhow::Result<Entry> {
            Ok(Entry::new(name).group(Arc::new(EmptyDir)).build())
        }
    }

    struct LeafRoot;

    #[async_trait]
    impl Root for LeafRoot {
        async fn init(&self, name: &str) -> anyhow::Result<Entry> {
            Ok(Entry::new(name).build())
        }
    }

    #[tokio::test]
    async fn find_is_exact_match() {
        let mut registry = Registry::new();
        registry.mount("docker", &GroupRoot).await.unwrap();
        assert!(registry.find("docker").is_some());
        assert!(registry.find("Docker").is_none());
        assert!(registry.find("dock").is_none());
    }

    #[tokio::test]
    async fn duplicate_mount_is_rejected() {
        let mut registry = Registry::new();
        registry.mount("aws", &GroupRoot).await.unwrap();
        let err = registry.mount("aws", &GroupRoot).await.unwrap_err();
        assert!(matches!(err, Error::Mount { .. }));
    }

    #[tokio::test]
    async fn non_listable_root_is_rejected() {
        let mut registry = Registry::new();
        let err = registry.mount("aws", &LeafRoot).await.unwrap_err();
        assert!(matches!(err, Error::Mount { .. }));
    }

    #[tokio::test]
    async fn attr_aggregates_latest_mtime() {
        let older = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let newer = SystemTime::UNIX_EPOCH + Duration::from_secs(200);

        struct Fixed(Entry);
        #[async_trait]
        impl Root for Fixed {
            async fn init(&self, _name: &str) -> anyhow::Result<Entry> {
                Ok(self.0.clone())
            }
        }

        let mut registry = Registry::new();
        let a = Arc::new(StampedDir(older));
        let b = Arc::new(StampedDir(newer));
        registry
            .mount("a", &Fixed(Entry::new("a").group(a.clone()).attributed(a).build()))
            .await
            .unwrap();
        registry
            .mount("b", &Fixed(Entry::new("b").group(b.clone()).attributed(b).build()))
            .await
            .unwrap();

        let attr = Attributed::attr(&registry).await.unwrap();
        assert_eq!(attr.mtime, newer);
        assert_eq!(attr.valid, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn attr_fails_fast_on_any_root_error() {
        struct Fixed(Entry);
        #[async_trait]
        impl Root for Fixed {
            async fn init(&self, _name: &str) -> anyhow::Result<Entry> {
                Ok(self.0.clone())
            }
        }

        let mut registry = Registry::new();
        let ok = Arc::new(StampedDir(SystemTime::UNIX_EPOCH));
        let bad = Arc::new(BrokenDir);
        registry
            .mount("ok", &Fixed(Entry::new("ok").group(ok.clone()).attributed(ok).build()))
            .await
            .unwrap();
        registry
            .mount(
                "bad",
                &Fixed(Entry::new("bad").group(bad.clone()).attributed(bad).build()),
            )
            .await
            .unwrap();

        assert!(Attributed::attr(&registry).await.is_err());
    }
}
