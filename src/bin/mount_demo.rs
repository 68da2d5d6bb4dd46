//! Mount a demo plugfs tree.
//!
//! Two sample plugins are registered: `demo`, a small in-memory tree, and
//! `host`, whose files materialize by running local commands through the
//! execution-streaming pipe. Usage:
//!
//!   mount_demo /tmp/plugfs-mnt
//!   ls /tmp/plugfs-mnt/demo/greetings
//!   cat /tmp/plugfs-mnt/host/kernel

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use plugfs::config::DEFAULT_TTL;
use plugfs::exec::{ExecResult, StreamId, StreamSender, aggregate};
use plugfs::fuse::{PlugFs, mount::mount_unprivileged};
use plugfs::plugin::{
    Attributed, Attributes, Entry, Execable, Group, Metadata, Readable, Registry, Resource, Root,
    SizedReader,
};
use plugfs::{Config, Error};

#[derive(Parser)]
#[command(name = "mount_demo", about = "Mount a demo plugfs tree")]
struct Args {
    /// Empty directory to mount plugfs on (created if missing)
    mount_point: PathBuf,
    /// Disable background prefetching
    #[arg(long)]
    slow: bool,
}

// ==== in-memory demo plugin ====

struct StaticDir {
    children: Vec<Entry>,
    mtime: SystemTime,
}

impl StaticDir {
    fn entry(name: &str, children: Vec<Entry>) -> Entry {
        let dir = Arc::new(StaticDir {
            children,
            mtime: SystemTime::now(),
        });
        Entry::new(name).group(dir.clone()).attributed(dir).build()
    }
}

#[async_trait]
impl Group for StaticDir {
    async fn ls(&self) -> anyhow::Result<Vec<Entry>> {
        Ok(self.children.clone())
    }
}

#[async_trait]
impl Attributed for StaticDir {
    async fn attr(&self) -> anyhow::Result<Attributes> {
        Ok(Attributes {
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            valid: DEFAULT_TTL,
            ..Default::default()
        })
    }
}

struct MemFile {
    data: Bytes,
    mtime: SystemTime,
}

impl MemFile {
    fn entry(name: &str, data: &'static [u8]) -> Entry {
        let file = Arc::new(MemFile {
            data: Bytes::from_static(data),
            mtime: SystemTime::now(),
        });
        Entry::new(name)
            .readable(file.clone())
            .attributed(file.clone())
            .resource(file)
            .build()
    }
}

#[async_trait]
impl Readable for MemFile {
    async fn open(&self) -> anyhow::Result<Box<dyn SizedReader>> {
        Ok(Box::new(self.data.clone()))
    }
}

#[async_trait]
impl Attributed for MemFile {
    async fn attr(&self) -> anyhow::Result<Attributes> {
        Ok(Attributes {
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            size: self.data.len() as u64,
            valid: DEFAULT_TTL,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Resource for MemFile {
    async fn metadata(&self) -> anyhow::Result<Metadata> {
        let mut meta = Metadata::new();
        meta.insert("source".into(), serde_json::json!("memory"));
        meta.insert("length".into(), serde_json::json!(self.data.len()));
        Ok(meta)
    }
}

struct DemoRoot;

#[async_trait]
impl Root for DemoRoot {
    async fn init(&self, name: &str) -> anyhow::Result<Entry> {
        let greetings = StaticDir::entry(
            "greetings",
            vec![
                MemFile::entry("hello.txt", b"hello from plugfs\n"),
                MemFile::entry("README", b"in-memory demo plugin\n"),
            ],
        );
        Ok(StaticDir::entry(name, vec![greetings]))
    }
}

// ==== local-exec plugin ====

struct LocalExec;

#[async_trait]
impl Execable for LocalExec {
    async fn exec(&self, cmd: &str, args: &[String]) -> anyhow::Result<ExecResult> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;

        let (sender, result) = ExecResult::channel(16);
        tokio::spawn(async move {
            let out = sender.stream(StreamId::Stdout);
            let err = sender.stream(StreamId::Stderr);
            tokio::join!(pump(stdout, out), pump(stderr, err));
            match child.wait().await {
                Ok(status) => sender.exit(status.code().unwrap_or(-1)),
                Err(e) => {
                    sender.fail(Error::Exec(format!("wait failed: {e}"))).await;
                }
            }
        });
        Ok(result)
    }
}

async fn pump(mut reader: impl AsyncRead + Unpin, tx: StreamSender) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if !tx.send(Bytes::copy_from_slice(&buf[..n])).await {
                    break;
                }
            }
            Err(e) => {
                tx.fail(Error::Exec(format!("output stream: {e}"))).await;
                break;
            }
        }
    }
}

/// A file whose content is the output of a command run on the executor.
struct CmdFile {
    exec: Arc<dyn Execable>,
    cmd: String,
    args: Vec<String>,
}

impl CmdFile {
    fn entry(name: &str, exec: Arc<dyn Execable>, cmd: &str, args: &[&str]) -> Entry {
        let file = Arc::new(CmdFile {
            exec,
            cmd: cmd.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        });
        Entry::new(name)
            .readable(file.clone())
            .attributed(file)
            .build()
    }

    async fn run(&self) -> anyhow::Result<Bytes> {
        let result = self.exec.exec(&self.cmd, &self.args).await?;
        Ok(aggregate(result).await?)
    }
}

#[async_trait]
impl Readable for CmdFile {
    async fn open(&self) -> anyhow::Result<Box<dyn SizedReader>> {
        Ok(Box::new(self.run().await?))
    }
}

#[async_trait]
impl Attributed for CmdFile {
    async fn attr(&self) -> anyhow::Result<Attributes> {
        let out = self.run().await?;
        let now = SystemTime::now();
        Ok(Attributes {
            atime: now,
            mtime: now,
            ctime: now,
            size: out.len() as u64,
            valid: DEFAULT_TTL,
            ..Default::default()
        })
    }
}

struct HostRoot;

#[async_trait]
impl Root for HostRoot {
    async fn init(&self, name: &str) -> anyhow::Result<Entry> {
        let exec: Arc<dyn Execable> = Arc::new(LocalExec);
        let children = vec![
            CmdFile::entry("kernel", exec.clone(), "uname", &["-a"]),
            CmdFile::entry("uptime", exec.clone(), "uptime", &[]),
        ];
        let dir = Arc::new(StaticDir {
            children,
            mtime: SystemTime::now(),
        });
        Ok(Entry::new(name)
            .group(dir.clone())
            .attributed(dir)
            .execable(exec)
            .build())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut registry = Registry::new();
    registry.mount("demo", &DemoRoot).await?;
    registry.mount("host", &HostRoot).await?;

    let config = Config {
        slow: args.slow,
        ..Default::default()
    };
    let fs = PlugFs::new(Arc::new(registry), config);

    std::fs::create_dir_all(&args.mount_point)?;
    println!("Mounting plugfs at {} ...", args.mount_point.display());
    println!("Press Ctrl+C to unmount and exit.");
    let handle = mount_unprivileged(fs, &args.mount_point).await?;

    tokio::signal::ctrl_c().await?;
    println!("Unmounting ...");
    handle.unmount().await?;
    Ok(())
}
