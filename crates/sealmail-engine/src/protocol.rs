//! Worker command protocol.
//!
//! Everything crossing the worker boundary is a serialized JSON message;
//! no memory is shared. Requests carry a correlation id assigned by the
//! channel; replies echo the id so the channel can match them up.
//!
//! `get_file` replies are chunked: the worker streams numbered
//! [`WorkerReply::FileChunk`] messages and the channel reassembles them
//! by index. `run` replies carry accumulated stdout whose final line is
//! the `Exit Status: N` marker.

use serde::{Deserialize, Serialize};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Maximum payload bytes per `get_file` chunk.
pub const FILE_CHUNK_SIZE: usize = 8192;

/// Marker line terminating every `run` reply's stdout.
pub const EXIT_STATUS_PREFIX: &str = "Exit Status: ";

/// A command sent to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Create a directory.
    Mkdir {
        /// Correlation id.
        id: u64,
        /// Directory path.
        path: String,
    },
    /// Write a file.
    AddData {
        /// Correlation id.
        id: u64,
        /// Destination path.
        path: String,
        /// File contents, base64.
        contents: String,
    },
    /// Read a file back; replied to as a chunk stream.
    GetFile {
        /// Correlation id.
        id: u64,
        /// Path to read.
        path: String,
    },
    /// Invoke the engine with a CLI argument list.
    Run {
        /// Correlation id.
        id: u64,
        /// Engine arguments.
        args: Vec<String>,
    },
}

impl WorkerCommand {
    /// The correlation id carried by this command.
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Mkdir { id, .. }
            | Self::AddData { id, .. }
            | Self::GetFile { id, .. }
            | Self::Run { id, .. } => *id,
        }
    }
}

/// A reply sent back by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Command completed with no payload.
    Ok {
        /// Correlation id of the completed command.
        id: u64,
    },
    /// One chunk of a `get_file` reply. Chunks may arrive in any order;
    /// the request is complete once every index in `0..chunk_count` has
    /// been received.
    FileChunk {
        /// Correlation id of the `get_file` request.
        id: u64,
        /// Index of this chunk.
        chunk_id: u32,
        /// Total number of chunks.
        chunk_count: u32,
        /// Chunk payload, base64.
        data: String,
    },
    /// Accumulated stdout of a `run` command. The last line is always
    /// the `Exit Status: N` marker.
    RunOutput {
        /// Correlation id of the `run` request.
        id: u64,
        /// Captured stdout lines.
        stdout: Vec<String>,
    },
    /// The command failed inside the worker.
    Error {
        /// Correlation id of the failed command.
        id: u64,
        /// Failure description.
        message: String,
    },
}

impl WorkerReply {
    /// The correlation id carried by this reply.
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Ok { id }
            | Self::FileChunk { id, .. }
            | Self::RunOutput { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }
}

/// Encodes binary file contents for transport.
#[must_use]
pub fn encode_contents(contents: &[u8]) -> String {
    BASE64.encode(contents)
}

/// Decodes transported file contents.
///
/// # Errors
///
/// Returns an error string if the payload is not valid base64.
pub fn decode_contents(data: &str) -> Result<Vec<u8>, String> {
    BASE64.decode(data).map_err(|e| e.to_string())
}

/// Extracts the exit status from a `run` reply's stdout.
///
/// Scans from the end for the `Exit Status: N` marker line; returns
/// `None` when the marker is missing (a malformed reply).
#[must_use]
pub fn exit_status(stdout: &[String]) -> Option<i32> {
    stdout
        .iter()
        .rev()
        .find_map(|line| line.strip_prefix(EXIT_STATUS_PREFIX))
        .and_then(|n| n.trim().parse().ok())
}

/// Stdout lines with the exit-status marker removed.
#[must_use]
pub fn stdout_without_marker(stdout: &[String]) -> Vec<String> {
    stdout
        .iter()
        .filter(|line| !line.starts_with(EXIT_STATUS_PREFIX))
        .cloned()
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_command_round_trips_as_json() {
        let cmd = WorkerCommand::Run {
            id: 7,
            args: vec!["--import".into(), "/tmp/key.asc".into()],
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"cmd\":\"run\""));
        assert!(json.contains("\"id\":7"));
        let back: WorkerCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), 7);
    }

    #[test]
    fn test_reply_tagging() {
        let reply = WorkerReply::FileChunk {
            id: 3,
            chunk_id: 1,
            chunk_count: 2,
            data: encode_contents(b"half"),
        };
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"reply\":\"file_chunk\""));
        let back: WorkerReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), 3);
    }

    #[test]
    fn test_exit_status_parse() {
        let stdout = vec![
            "gpg: key generated".to_string(),
            "Exit Status: 0".to_string(),
        ];
        assert_eq!(exit_status(&stdout), Some(0));

        let failed = vec!["gpg: no such file".to_string(), "Exit Status: 2".to_string()];
        assert_eq!(exit_status(&failed), Some(2));

        let missing = vec!["gpg: interrupted".to_string()];
        assert_eq!(exit_status(&missing), None);
    }

    #[test]
    fn test_stdout_without_marker() {
        let stdout = vec!["line one".to_string(), "Exit Status: 0".to_string()];
        assert_eq!(stdout_without_marker(&stdout), vec!["line one".to_string()]);
    }

    #[test]
    fn test_contents_codec() {
        let data = b"\x00\x01binary\xff";
        let encoded = encode_contents(data);
        assert_eq!(decode_contents(&encoded).unwrap(), data);
        assert!(decode_contents("%%%").is_err());
    }
}
