//! Streamed command execution.
//!
//! Running a command against an executable entry yields incrementally
//! delivered output chunks on a channel plus a deferred exit status,
//! decoupled from output draining. Producers flush every chunk before (or
//! concurrently with) resolving the exit status, never after, so a consumer
//! that drains the channel first observes every byte the command wrote.

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Which output channel a chunk belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamId {
    Stdout,
    Stderr,
}

/// One increment of command output. Consumed exactly once by whoever drains
/// the execution's channel.
#[derive(Clone, Debug)]
pub struct OutputChunk {
    pub stream: StreamId,
    pub data: Bytes,
}

/// Consumer half of a command execution.
pub struct ExecResult {
    output: mpsc::Receiver<Result<OutputChunk>>,
    exit: oneshot::Receiver<i32>,
}

impl ExecResult {
    /// Create an execution pipe: the producer half goes to the capability
    /// implementation, the result half to the caller.
    pub fn channel(capacity: usize) -> (ExecSender, ExecResult) {
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
        let (exit_tx, exit_rx) = oneshot::channel();
        (
            ExecSender {
                chunks: chunk_tx,
                exit: exit_tx,
            },
            ExecResult {
                output: chunk_rx,
                exit: exit_rx,
            },
        )
    }

    /// Next output chunk, or `None` once the producer has finished.
    pub async fn next_chunk(&mut self) -> Option<Result<OutputChunk>> {
        self.output.recv().await
    }

    /// Resolve the command's exit code. Completes only once the process has
    /// terminated; callers aggregating output must drain the chunks first.
    pub async fn exit_code(self) -> Result<i32> {
        self.exit
            .await
            .map_err(|_| Error::Exec("producer dropped before reporting an exit code".into()))
    }
}

/// Producer half of a command execution.
pub struct ExecSender {
    chunks: mpsc::Sender<Result<OutputChunk>>,
    exit: oneshot::Sender<i32>,
}

impl ExecSender {
    /// Dedicated sender for one output stream; clone freely across the
    /// tasks pumping stdout and stderr.
    pub fn stream(&self, id: StreamId) -> StreamSender {
        StreamSender {
            id,
            chunks: self.chunks.clone(),
        }
    }

    /// Send one chunk. Returns false once the consumer is gone.
    pub async fn send(&self, id: StreamId, data: impl Into<Bytes>) -> bool {
        self.chunks
            .send(Ok(OutputChunk {
                stream: id,
                data: data.into(),
            }))
            .await
            .is_ok()
    }

    /// Report a chunk-level failure. Returns false once the consumer is gone.
    pub async fn fail(&self, err: Error) -> bool {
        self.chunks.send(Err(err)).await.is_ok()
    }

    /// Complete the execution: close the chunk channel (already-queued
    /// chunks stay readable) and resolve the exit code.
    pub fn exit(self, code: i32) {
        drop(self.chunks);
        let _ = self.exit.send(code);
    }
}

#[derive(Clone)]
pub struct StreamSender {
    id: StreamId,
    chunks: mpsc::Sender<Result<OutputChunk>>,
}

impl StreamSender {
    pub async fn send(&self, data: impl Into<Bytes>) -> bool {
        self.chunks
            .send(Ok(OutputChunk {
                stream: self.id,
                data: data.into(),
            }))
            .await
            .is_ok()
    }

    pub async fn fail(&self, err: Error) -> bool {
        self.chunks.send(Err(err)).await.is_ok()
    }
}

/// Drain an execution and return its aggregated stdout bytes.
///
/// Stderr is logged, not returned. A chunk-level error or a non-zero exit
/// code is an execution failure regardless of any output produced; it is
/// never conflated with a zero-byte successful result.
pub async fn aggregate(mut result: ExecResult) -> Result<Bytes> {
    let mut out = BytesMut::new();
    let mut failed: Option<Error> = None;
    while let Some(chunk) = result.next_chunk().await {
        match chunk {
            Ok(chunk) if chunk.stream == StreamId::Stdout => out.extend_from_slice(&chunk.data),
            Ok(chunk) => debug!("exec stderr: {:?}", chunk.data),
            Err(err) => failed = Some(err),
        }
    }
    if let Some(err) = failed {
        return Err(err);
    }
    let code = result.exit_code().await?;
    if code != 0 {
        return Err(Error::Exec(format!("command exited with status {code}")));
    }
    Ok(out.freeze())
}
