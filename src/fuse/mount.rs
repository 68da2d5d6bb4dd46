//! Mount helpers for starting/stopping FUSE.
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we support unprivileged
//!   mount via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;

use super::PlugFs;

/// Build default mount options: mounted for the current user, no
/// allow_other. The adapter itself only exposes read-only operations.
#[allow(dead_code)]
fn default_mount_options() -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut options = MountOptions::default();
    options.fs_name("plugfs").uid(uid).gid(gid);
    options
}

/// Mount the adapter on the given empty directory using unprivileged mode
/// (requires fusermount3 in PATH).
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: PlugFs,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let session = rfuse3::raw::Session::new(default_mount_options());
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: PlugFs,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}

#[cfg(all(test, target_os = "linux"))]
mod mount_tests {
    use super::*;
    use crate::config::Config;
    use crate::plugin::{Entry, Group, Registry, Root};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct EmptyRoot;

    #[async_trait]
    impl Group for EmptyRoot {
        async fn ls(&self) -> anyhow::Result<Vec<Entry>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Root for EmptyRoot {
        async fn init(&self, name: &str) -> anyhow::Result<Entry> {
            Ok(Entry::new(name).group(Arc::new(EmptyRoot)).build())
        }
    }

    // Mount smoke test, gated on PLUGFS_FUSE_TEST=1 (needs fusermount3).
    #[tokio::test]
    async fn smoke_mount_and_list() {
        if std::env::var("PLUGFS_FUSE_TEST").ok().as_deref() != Some("1") {
            eprintln!("skip fuse mount test: set PLUGFS_FUSE_TEST=1 to enable");
            return;
        }

        let mut registry = Registry::new();
        registry.mount("empty", &EmptyRoot).await.unwrap();
        let fs = PlugFs::new(Arc::new(registry), Config::default());

        let mnt = tempfile::tempdir().expect("tmp mount");
        let handle = match mount_unprivileged(fs, mnt.path()).await {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("skip fuse test: mount failed: {e}");
                return;
            }
        };
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let names: Vec<_> = std::fs::read_dir(mnt.path())
            .expect("readdir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert!(names.iter().any(|n| n.to_string_lossy() == "empty"));

        if let Err(e) = handle.unmount().await {
            eprintln!("unmount error: {e}");
        }
    }
}
