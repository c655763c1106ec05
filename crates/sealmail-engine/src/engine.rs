//! The opaque engine capability hosted inside a worker.
//!
//! sealmail does not implement OpenPGP itself. The engine is whatever
//! GnuPG-compatible implementation the embedding application supplies;
//! it sees only the worker's virtual filesystem and a CLI argument
//! list, and reports stdout plus an exit status.

use crate::vfs::VfsSnapshot;

/// Outcome of one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineRun {
    /// Captured stdout lines.
    pub stdout: Vec<String>,
    /// Process exit status; zero means success.
    pub status: i32,
}

impl EngineRun {
    /// A successful run with the given stdout.
    #[must_use]
    pub const fn ok(stdout: Vec<String>) -> Self {
        Self { stdout, status: 0 }
    }

    /// A failed run.
    #[must_use]
    pub const fn failed(status: i32, stdout: Vec<String>) -> Self {
        Self { stdout, status }
    }
}

/// A single engine instance.
///
/// An instance is only guaranteed to survive one `run` invocation; the
/// orchestrator discards the hosting worker after each `run` and asks
/// the factory for a fresh instance.
pub trait Engine: Send + 'static {
    /// Executes the engine with `args` against the worker's filesystem.
    fn run(&mut self, args: &[String], vfs: &mut VfsSnapshot) -> EngineRun;
}

/// Creates fresh engine instances, one per worker.
pub trait EngineFactory: Send + Sync + 'static {
    /// Instantiates a new engine.
    fn create(&self) -> Box<dyn Engine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Box<dyn Engine> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn Engine> {
        self()
    }
}
