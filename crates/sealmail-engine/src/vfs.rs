//! In-memory virtual filesystem handed to worker instances.
//!
//! The engine running inside a worker reads and writes plain files. We
//! model those as a path→bytes snapshot that the orchestrator owns
//! between worker lifetimes: a copy is handed to each new worker, and
//! the worker's final state replaces the snapshot wholesale once a
//! command sequence completes.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

/// A single file in the virtual filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFile {
    /// Absolute path within the engine's filesystem.
    pub path: String,
    /// Raw contents.
    pub contents: Bytes,
}

impl VirtualFile {
    /// Creates a virtual file.
    pub fn new(path: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    /// Contents interpreted as UTF-8 text (lossy).
    #[must_use]
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.contents).into_owned()
    }
}

/// Snapshot of the engine's filesystem: files plus created directories.
///
/// Cheap to clone for copy-on-handoff: file contents are [`Bytes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VfsSnapshot {
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
}

impl VfsSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a directory.
    pub fn mkdir(&mut self, path: impl Into<String>) {
        self.dirs.insert(path.into());
    }

    /// Returns `true` if the directory has been created.
    #[must_use]
    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    /// Inserts or replaces a file.
    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Bytes>) {
        self.files.insert(path.into(), contents.into());
    }

    /// Returns a file's contents, if present.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path)
    }

    /// Removes a file, returning its contents.
    pub fn remove(&mut self, path: &str) -> Option<Bytes> {
        self.files.remove(path)
    }

    /// Returns `true` if the file exists.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Iterates over all files as (path, contents) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Bytes)> {
        self.files.iter()
    }

    /// All files whose path starts with `prefix`.
    pub fn files_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = VirtualFile> + 'a {
        self.files
            .iter()
            .filter(move |(path, _)| path.starts_with(prefix))
            .map(|(path, contents)| VirtualFile::new(path.clone(), contents.clone()))
    }

    /// Merges another snapshot's files and directories into this one.
    pub fn merge(&mut self, other: Self) {
        self.files.extend(other.files);
        self.dirs.extend(other.dirs);
    }

    /// Number of files in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns `true` if the snapshot holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
