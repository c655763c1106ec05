//! The isolated execution context hosting one engine instance.
//!
//! A worker is a spawned task owning a private [`VfsSnapshot`] copy and
//! a boxed [`Engine`]. All traffic in and out is serialized JSON text;
//! the worker never shares memory with the caller. When the command
//! channel closes the task ends, yielding its final filesystem state to
//! whoever holds the join handle.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::protocol::{
    EXIT_STATUS_PREFIX, FILE_CHUNK_SIZE, WorkerCommand, WorkerReply, decode_contents,
    encode_contents,
};
use crate::vfs::VfsSnapshot;

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    cmd_tx: mpsc::UnboundedSender<String>,
    join: JoinHandle<VfsSnapshot>,
}

/// Spawns a worker hosting `engine` over a copy of `vfs`.
///
/// Returns the handle plus the stream of serialized replies.
pub fn spawn_worker(
    engine: Box<dyn Engine>,
    vfs: VfsSnapshot,
) -> (WorkerHandle, mpsc::UnboundedReceiver<String>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    let join = tokio::spawn(worker_loop(engine, vfs, cmd_rx, reply_tx));

    (WorkerHandle { cmd_tx, join }, reply_rx)
}

impl WorkerHandle {
    /// Sends a serialized command to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker task has ended.
    pub fn send(&self, serialized: String) -> Result<()> {
        self.cmd_tx
            .send(serialized)
            .map_err(|_| Error::Channel("worker task ended".into()))
    }

    /// Shuts the worker down and returns its final filesystem state.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker task panicked.
    pub async fn into_snapshot(self) -> Result<VfsSnapshot> {
        drop(self.cmd_tx);
        self.join
            .await
            .map_err(|e| Error::Channel(format!("worker task panicked: {e}")))
    }
}

/// The worker task body: apply commands to the private vfs until the
/// command channel closes, then yield the vfs.
async fn worker_loop(
    mut engine: Box<dyn Engine>,
    mut vfs: VfsSnapshot,
    mut cmd_rx: mpsc::UnboundedReceiver<String>,
    reply_tx: mpsc::UnboundedSender<String>,
) -> VfsSnapshot {
    while let Some(raw) = cmd_rx.recv().await {
        let command = match serde_json::from_str::<WorkerCommand>(&raw) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "dropping unparseable worker command");
                continue;
            }
        };

        let id = command.id();
        debug!(id, "worker executing command");

        for reply in apply(&mut engine, &mut vfs, command) {
            let serialized = match serde_json::to_string(&reply) {
                Ok(s) => s,
                Err(e) => {
                    warn!(id, error = %e, "failed to serialize worker reply");
                    continue;
                }
            };
            if reply_tx.send(serialized).is_err() {
                // Receiver gone; nothing left to do but finish up.
                return vfs;
            }
        }
    }

    vfs
}

/// Applies one command, producing one or more replies.
fn apply(
    engine: &mut Box<dyn Engine>,
    vfs: &mut VfsSnapshot,
    command: WorkerCommand,
) -> Vec<WorkerReply> {
    match command {
        WorkerCommand::Mkdir { id, path } => {
            vfs.mkdir(path);
            vec![WorkerReply::Ok { id }]
        }
        WorkerCommand::AddData { id, path, contents } => match decode_contents(&contents) {
            Ok(bytes) => {
                vfs.insert(path, bytes);
                vec![WorkerReply::Ok { id }]
            }
            Err(message) => vec![WorkerReply::Error { id, message }],
        },
        WorkerCommand::GetFile { id, path } => match vfs.get(&path) {
            Some(contents) => chunked(id, contents),
            None => vec![WorkerReply::Error {
                id,
                message: format!("no such file: {path}"),
            }],
        },
        WorkerCommand::Run { id, args } => {
            let outcome = engine.run(&args, vfs);
            let mut stdout = outcome.stdout;
            stdout.push(format!("{EXIT_STATUS_PREFIX}{}", outcome.status));
            vec![WorkerReply::RunOutput { id, stdout }]
        }
    }
}

/// Splits file contents into numbered chunks. An empty file still
/// produces a single empty chunk so the receiver sees `chunk_count` > 0.
fn chunked(id: u64, contents: &[u8]) -> Vec<WorkerReply> {
    let chunks: Vec<&[u8]> = if contents.is_empty() {
        vec![&[]]
    } else {
        contents.chunks(FILE_CHUNK_SIZE).collect()
    };
    let count = u32::try_from(chunks.len()).unwrap_or(u32::MAX);

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| WorkerReply::FileChunk {
            id,
            chunk_id: u32::try_from(i).unwrap_or(u32::MAX),
            chunk_count: count,
            data: encode_contents(chunk),
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::engine::EngineRun;

    struct EchoEngine;

    impl Engine for EchoEngine {
        fn run(&mut self, args: &[String], _vfs: &mut VfsSnapshot) -> EngineRun {
            EngineRun::ok(vec![format!("args: {}", args.join(" "))])
        }
    }

    async fn recv_reply(rx: &mut mpsc::UnboundedReceiver<String>) -> WorkerReply {
        let raw = rx.recv().await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_add_data_then_get_file() {
        let (worker, mut rx) = spawn_worker(Box::new(EchoEngine), VfsSnapshot::new());

        let add = WorkerCommand::AddData {
            id: 1,
            path: "/tmp/f".into(),
            contents: encode_contents(b"payload"),
        };
        worker.send(serde_json::to_string(&add).unwrap()).unwrap();
        assert!(matches!(recv_reply(&mut rx).await, WorkerReply::Ok { id: 1 }));

        let get = WorkerCommand::GetFile {
            id: 2,
            path: "/tmp/f".into(),
        };
        worker.send(serde_json::to_string(&get).unwrap()).unwrap();
        match recv_reply(&mut rx).await {
            WorkerReply::FileChunk {
                id,
                chunk_id,
                chunk_count,
                data,
            } => {
                assert_eq!((id, chunk_id, chunk_count), (2, 0, 1));
                assert_eq!(decode_contents(&data).unwrap(), b"payload");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_file_is_chunked() {
        let mut vfs = VfsSnapshot::new();
        let big = vec![0xABu8; FILE_CHUNK_SIZE * 2 + 10];
        vfs.insert("/big", Bytes::from(big.clone()));

        let (worker, mut rx) = spawn_worker(Box::new(EchoEngine), vfs);
        let get = WorkerCommand::GetFile {
            id: 9,
            path: "/big".into(),
        };
        worker.send(serde_json::to_string(&get).unwrap()).unwrap();

        let mut collected = Vec::new();
        for expected in 0..3u32 {
            match recv_reply(&mut rx).await {
                WorkerReply::FileChunk {
                    chunk_id,
                    chunk_count,
                    data,
                    ..
                } => {
                    assert_eq!(chunk_id, expected);
                    assert_eq!(chunk_count, 3);
                    collected.extend(decode_contents(&data).unwrap());
                }
                other => panic!("unexpected reply: {other:?}"),
            }
        }
        assert_eq!(collected, big);
    }

    #[tokio::test]
    async fn test_missing_file_is_request_error() {
        let (worker, mut rx) = spawn_worker(Box::new(EchoEngine), VfsSnapshot::new());
        let get = WorkerCommand::GetFile {
            id: 4,
            path: "/nope".into(),
        };
        worker.send(serde_json::to_string(&get).unwrap()).unwrap();
        assert!(matches!(
            recv_reply(&mut rx).await,
            WorkerReply::Error { id: 4, .. }
        ));
    }

    #[tokio::test]
    async fn test_run_appends_exit_marker() {
        let (worker, mut rx) = spawn_worker(Box::new(EchoEngine), VfsSnapshot::new());
        let run = WorkerCommand::Run {
            id: 5,
            args: vec!["--version".into()],
        };
        worker.send(serde_json::to_string(&run).unwrap()).unwrap();
        match recv_reply(&mut rx).await {
            WorkerReply::RunOutput { id, stdout } => {
                assert_eq!(id, 5);
                assert_eq!(stdout.last().map(String::as_str), Some("Exit Status: 0"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_yields_final_vfs() {
        let (worker, mut rx) = spawn_worker(Box::new(EchoEngine), VfsSnapshot::new());
        let add = WorkerCommand::AddData {
            id: 1,
            path: "/kept".into(),
            contents: encode_contents(b"state"),
        };
        worker.send(serde_json::to_string(&add).unwrap()).unwrap();
        let _ = recv_reply(&mut rx).await;

        let vfs = worker.into_snapshot().await.unwrap();
        assert_eq!(vfs.get("/kept").unwrap().as_ref(), b"state");
    }
}
