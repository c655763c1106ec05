//! Request/response channel to a worker.
//!
//! Each call posts a JSON command tagged with a fresh correlation id and
//! returns once the matching reply arrives. Replies may interleave
//! arbitrarily; matching is by id only. `get_file` replies stream in as
//! numbered chunks which are buffered and reassembled here — arrival
//! order is not guaranteed, completeness is.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{WorkerCommand, WorkerReply, decode_contents, encode_contents};
use crate::vfs::{VfsSnapshot, VirtualFile};
use crate::worker::WorkerHandle;

/// Correlation id generator.
///
/// Ids are unique within one worker instance's lifetime; a fresh worker
/// gets a fresh generator starting from zero.
#[derive(Debug, Default)]
struct RequestIds(AtomicU64);

impl RequestIds {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// A request awaiting its reply.
enum Pending {
    /// Completed by a single `Ok`/`RunOutput` reply.
    Simple(oneshot::Sender<Result<WorkerReply>>),
    /// Completed once every chunk index has arrived.
    File(FileAssembly),
}

struct FileAssembly {
    chunks: BTreeMap<u32, Vec<u8>>,
    count: Option<u32>,
    done: oneshot::Sender<Result<Bytes>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// Channel to one worker instance.
pub struct WorkerChannel {
    worker: WorkerHandle,
    pending: PendingMap,
    ids: RequestIds,
    dispatch: JoinHandle<()>,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("worker", &self.worker)
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

impl WorkerChannel {
    /// Wraps a spawned worker, consuming its reply stream.
    #[must_use]
    pub fn new(worker: WorkerHandle, reply_rx: mpsc::UnboundedReceiver<String>) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let dispatch = tokio::spawn(dispatch_loop(reply_rx, Arc::clone(&pending)));
        Self {
            worker,
            pending,
            ids: RequestIds::default(),
            dispatch,
        }
    }

    /// Creates a directory in the worker's filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or rejects the command.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        let id = self.ids.next();
        self.simple_request(
            id,
            WorkerCommand::Mkdir {
                id,
                path: path.into(),
            },
        )
        .await?;
        Ok(())
    }

    /// Writes a file into the worker's filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or rejects the command.
    pub async fn add_data(&self, contents: &[u8], path: &str) -> Result<()> {
        let id = self.ids.next();
        self.simple_request(
            id,
            WorkerCommand::AddData {
                id,
                path: path.into(),
                contents: encode_contents(contents),
            },
        )
        .await?;
        Ok(())
    }

    /// Reads a file back from the worker, reassembling its chunk stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or the worker is gone.
    pub async fn get_file(&self, path: &str) -> Result<Bytes> {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.insert_pending(
            id,
            Pending::File(FileAssembly {
                chunks: BTreeMap::new(),
                count: None,
                done: tx,
            }),
        );

        let command = WorkerCommand::GetFile {
            id,
            path: path.into(),
        };
        if let Err(e) = self.send(&command) {
            self.remove_pending(id);
            return Err(e);
        }

        rx.await
            .map_err(|_| Error::Channel("reply dispatcher dropped request".into()))?
    }

    /// Reads several files in one call.
    ///
    /// # Errors
    ///
    /// Returns an error if any file is missing or the worker is gone.
    pub async fn get_files(&self, paths: &[&str]) -> Result<Vec<VirtualFile>> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = self.get_file(path).await?;
            files.push(VirtualFile::new(*path, contents));
        }
        Ok(files)
    }

    /// Invokes the engine. Returns the raw stdout lines including the
    /// `Exit Status: N` marker; callers decide what a non-zero status
    /// means for them.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is gone or the reply is malformed.
    pub async fn run(&self, args: &[&str]) -> Result<Vec<String>> {
        let id = self.ids.next();
        let reply = self
            .simple_request(
                id,
                WorkerCommand::Run {
                    id,
                    args: args.iter().map(ToString::to_string).collect(),
                },
            )
            .await?;
        match reply {
            WorkerReply::RunOutput { stdout, .. } => Ok(stdout),
            other => Err(Error::MalformedReply(format!(
                "expected run output, got {other:?}"
            ))),
        }
    }

    /// Shuts the worker down and returns its final filesystem state.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker task panicked.
    pub async fn into_snapshot(self) -> Result<VfsSnapshot> {
        let Self {
            worker, dispatch, ..
        } = self;
        let vfs = worker.into_snapshot().await?;
        // The dispatcher exits once the reply stream closes.
        let _ = dispatch.await;
        Ok(vfs)
    }

    async fn simple_request(&self, id: u64, command: WorkerCommand) -> Result<WorkerReply> {
        let (tx, rx) = oneshot::channel();
        self.insert_pending(id, Pending::Simple(tx));

        if let Err(e) = self.send(&command) {
            self.remove_pending(id);
            return Err(e);
        }

        rx.await
            .map_err(|_| Error::Channel("reply dispatcher dropped request".into()))?
    }

    fn send(&self, command: &WorkerCommand) -> Result<()> {
        let serialized = serde_json::to_string(command)?;
        debug!(id = command.id(), "sending worker command");
        self.worker.send(serialized)
    }

    fn insert_pending(&self, id: u64, pending: Pending) {
        if let Ok(mut map) = self.pending.lock() {
            // Ids are monotonic per worker instance, so this never clobbers
            // a live request.
            map.insert(id, pending);
        }
    }

    fn remove_pending(&self, id: u64) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&id);
        }
    }
}

/// Routes serialized replies to their pending requests.
async fn dispatch_loop(mut reply_rx: mpsc::UnboundedReceiver<String>, pending: PendingMap) {
    while let Some(raw) = reply_rx.recv().await {
        match serde_json::from_str::<WorkerReply>(&raw) {
            Ok(reply) => route_reply(&pending, reply),
            Err(e) => {
                warn!(error = %e, "bad JSON from worker");
                fail_oldest(&pending, &e.to_string());
            }
        }
    }

    // Worker gone: fail whatever is still outstanding.
    let drained: Vec<Pending> = pending
        .lock()
        .map(|mut map| map.drain().map(|(_, p)| p).collect())
        .unwrap_or_default();
    for entry in drained {
        fail_pending(entry, Error::Channel("worker ended".into()));
    }
}

fn route_reply(pending: &PendingMap, reply: WorkerReply) {
    let id = reply.id();
    let Ok(mut map) = pending.lock() else { return };

    match reply {
        WorkerReply::FileChunk {
            chunk_id,
            chunk_count,
            data,
            ..
        } => {
            let Some(Pending::File(assembly)) = map.get_mut(&id) else {
                warn!(id, "file chunk for unknown request");
                return;
            };
            match decode_contents(&data) {
                Ok(bytes) => {
                    assembly.chunks.insert(chunk_id, bytes);
                    assembly.count = Some(chunk_count);
                }
                Err(message) => {
                    if let Some(entry) = map.remove(&id) {
                        fail_pending(entry, Error::MalformedReply(message));
                    }
                    return;
                }
            }

            let complete = assembly
                .count
                .and_then(|count| usize::try_from(count).ok())
                .is_some_and(|count| assembly.chunks.len() == count);
            if complete {
                if let Some(Pending::File(assembly)) = map.remove(&id) {
                    // BTreeMap iteration is index order, so out-of-order
                    // arrival reassembles correctly.
                    let mut contents = Vec::new();
                    for chunk in assembly.chunks.into_values() {
                        contents.extend(chunk);
                    }
                    let _ = assembly.done.send(Ok(Bytes::from(contents)));
                }
            }
        }
        WorkerReply::Ok { .. } | WorkerReply::RunOutput { .. } => match map.remove(&id) {
            Some(Pending::Simple(tx)) => {
                let _ = tx.send(Ok(reply));
            }
            Some(entry) => {
                fail_pending(
                    entry,
                    Error::MalformedReply("scalar reply to a file request".into()),
                );
            }
            None => warn!(id, "reply for unknown request"),
        },
        WorkerReply::Error { message, .. } => match map.remove(&id) {
            Some(entry) => fail_pending(entry, Error::Request(message)),
            None => warn!(id, %message, "error reply for unknown request"),
        },
    }
}

/// Bad JSON carries no id; fail the oldest outstanding request so the
/// caller sees the breakage instead of hanging forever.
fn fail_oldest(pending: &PendingMap, detail: &str) {
    let Ok(mut map) = pending.lock() else { return };
    if let Some(&id) = map.keys().min() {
        if let Some(entry) = map.remove(&id) {
            fail_pending(entry, Error::MalformedReply(detail.into()));
        }
    }
}

fn fail_pending(entry: Pending, error: Error) {
    match entry {
        Pending::Simple(tx) => {
            let _ = tx.send(Err(error));
        }
        Pending::File(assembly) => {
            let _ = assembly.done.send(Err(error));
        }
    }
}
