//! Serialized front-end to the worker-hosted PGP engine.
//!
//! The engine is stateful (its virtual filesystem) and a worker instance
//! is only good for one `run` invocation, so every operation here takes
//! a FIFO lock for the full critical section: load the filesystem into a
//! fresh worker, issue commands, extract output files, persist the
//! updated snapshot. Callers may issue concurrent requests; execution
//! order is arrival order and executions never overlap.

use std::sync::Arc;

use sealmail_crypto::EntropyProvider;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channel::WorkerChannel;
use crate::engine::EngineFactory;
use crate::error::{Error, Result};
use crate::keyring::{PgpKey, parse_key_listing};
use crate::protocol::{exit_status, stdout_without_marker};
use crate::vfs::VfsSnapshot;
use crate::worker::spawn_worker;

/// Key strengths the engine will be asked to generate. Anything else is
/// rejected before a worker is ever involved.
pub const ALLOWED_KEY_STRENGTHS: [u32; 2] = [2048, 4096];

/// Size of the entropy pool file seeded into the engine's filesystem.
pub const ENTROPY_POOL_BYTES: usize = 4096;

/// The engine's home directory inside the virtual filesystem.
pub const GNUPG_HOME: &str = "/home/user/.gnupg";

/// Entropy pool file consumed by the engine.
const RANDOM_SEED_PATH: &str = "/home/user/.gnupg/random_seed";

/// Scratch paths for command inputs and outputs.
const KEYGEN_SCRIPT_PATH: &str = "/tmp/keygen";
const INPUT_PATH: &str = "/tmp/input";
const SIG_PATH: &str = "/tmp/input.sig";
const OUTPUT_PATH: &str = "/tmp/output";
const IMPORT_PATH: &str = "/tmp/import.asc";

/// Serializable backup of the keyring subset of the filesystem
/// (keyrings and trust database), for the storage collaborator.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GpgBackup {
    /// Backed-up files: path → base64 contents.
    pub files: std::collections::BTreeMap<String, String>,
}

impl GpgBackup {
    /// Returns `true` if the backup holds no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// State guarded by the command lock.
struct State {
    vfs: VfsSnapshot,
    /// Home directories created and entropy pool seeded. Once per
    /// process lifetime, not per command.
    bootstrapped: bool,
}

/// Orchestrates the worker-hosted PGP engine.
pub struct Gpg {
    state: Mutex<State>,
    factory: Box<dyn EngineFactory>,
    entropy: Arc<dyn EntropyProvider>,
}

impl std::fmt::Debug for Gpg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpg").finish_non_exhaustive()
    }
}

/// Parsed outcome of one engine invocation.
struct CommandOutput {
    stdout: Vec<String>,
    status: i32,
}

/// A worker session spanning one locked operation.
///
/// The worker is created lazily from the current snapshot; after a `run`
/// the instance is tainted and a further `run` in the same session
/// rotates to a fresh worker. `mkdir`/`add_data`/`get_file` never force
/// rotation.
struct Session<'a> {
    channel: Option<WorkerChannel>,
    ran: bool,
    gpg: &'a Gpg,
}

impl Session<'_> {
    fn channel(&self) -> Result<&WorkerChannel> {
        self.channel
            .as_ref()
            .ok_or_else(|| Error::Channel("session already finished".into()))
    }

    /// Runs the engine, returning stdout and the parsed exit status.
    async fn run_raw(&mut self, args: &[&str]) -> Result<CommandOutput> {
        if self.ran {
            // One run per worker instance: rotate before running again.
            let vfs = self.take_snapshot().await?;
            self.channel = Some(self.gpg.open_channel(vfs));
            self.ran = false;
        }

        let stdout = self.channel()?.run(args).await?;
        self.ran = true;

        let status = exit_status(&stdout)
            .ok_or_else(|| Error::MalformedReply("run reply missing exit status marker".into()))?;
        debug!(status, ?args, "engine command finished");
        Ok(CommandOutput { stdout, status })
    }

    /// Runs the engine and treats a non-zero exit status as a failure,
    /// surfacing the accumulated stdout for diagnostics.
    async fn run_checked(&mut self, args: &[&str]) -> Result<Vec<String>> {
        let output = self.run_raw(args).await?;
        if output.status == 0 {
            Ok(output.stdout)
        } else {
            Err(Error::Command {
                status: output.status,
                stdout: output.stdout,
            })
        }
    }

    async fn take_snapshot(&mut self) -> Result<VfsSnapshot> {
        let channel = self
            .channel
            .take()
            .ok_or_else(|| Error::Channel("session already finished".into()))?;
        channel.into_snapshot().await
    }

    async fn finish(mut self) -> Result<VfsSnapshot> {
        self.take_snapshot().await
    }
}

impl Gpg {
    /// Creates an orchestrator over an engine factory and entropy source.
    #[must_use]
    pub fn new(factory: impl EngineFactory, entropy: Arc<dyn EntropyProvider>) -> Self {
        Self {
            state: Mutex::new(State {
                vfs: VfsSnapshot::new(),
                bootstrapped: false,
            }),
            factory: Box::new(factory),
            entropy,
        }
    }

    /// Generates a new key pair for `email`, protected by `passphrase`.
    ///
    /// `key_strength_bits` must be one of [`ALLOWED_KEY_STRENGTHS`]; any
    /// other value is a validation error and nothing reaches the worker.
    ///
    /// # Errors
    ///
    /// Returns an error on a disallowed key strength or engine failure.
    pub async fn generate_key_pair(
        &self,
        email: &str,
        passphrase: &str,
        key_strength_bits: u32,
    ) -> Result<()> {
        if !ALLOWED_KEY_STRENGTHS.contains(&key_strength_bits) {
            return Err(Error::InvalidKeyStrength(key_strength_bits));
        }

        let script = format!(
            "Key-Type: RSA\n\
             Key-Length: {key_strength_bits}\n\
             Subkey-Type: RSA\n\
             Subkey-Length: {key_strength_bits}\n\
             Name-Email: {email}\n\
             Expire-Date: 0\n\
             Passphrase: {passphrase}\n\
             %commit\n"
        );

        let mut state = self.state.lock().await;
        let mut session = self.open_session(&state).await?;
        session
            .channel()?
            .add_data(script.as_bytes(), KEYGEN_SCRIPT_PATH)
            .await?;
        session
            .run_checked(&["--batch", "--gen-key", KEYGEN_SCRIPT_PATH])
            .await?;
        info!(email, bits = key_strength_bits, "generated key pair");
        Self::commit(&mut state, session).await
    }

    /// Lists all keys, parsed into [`PgpKey`] trees. The list is rebuilt
    /// from the engine on every call.
    ///
    /// # Errors
    ///
    /// Returns an error on engine failure.
    pub async fn get_all_keys(&self) -> Result<Vec<PgpKey>> {
        let mut state = self.state.lock().await;
        let mut session = self.open_session(&state).await?;
        let stdout = session
            .run_checked(&["--list-keys", "--with-colons", "--fixed-list-mode"])
            .await?;
        Self::commit(&mut state, session).await?;
        Ok(parse_key_listing(&stdout_without_marker(&stdout)))
    }

    /// Imports an ASCII-armored key.
    ///
    /// # Errors
    ///
    /// Returns an error on engine failure.
    pub async fn import_key(&self, ascii_armored_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut session = self.open_session(&state).await?;
        session
            .channel()?
            .add_data(ascii_armored_key.as_bytes(), IMPORT_PATH)
            .await?;
        session.run_checked(&["--import", IMPORT_PATH]).await?;
        Self::commit(&mut state, session).await
    }

    /// Produces a detached ASCII-armored signature over `text`.
    ///
    /// # Errors
    ///
    /// Returns an error on engine failure.
    pub async fn sign(&self, text: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let mut session = self.open_session(&state).await?;
        session.channel()?.add_data(text.as_bytes(), INPUT_PATH).await?;
        session
            .run_checked(&["--armor", "--detach-sign", "--output", SIG_PATH, INPUT_PATH])
            .await?;
        let sig = session.channel()?.get_file(SIG_PATH).await?;
        Self::commit(&mut state, session).await?;
        Ok(String::from_utf8_lossy(&sig).into_owned())
    }

    /// Verifies a detached signature over `text`.
    ///
    /// A bad signature is not an engine failure: it comes back as
    /// `Ok(false)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker or reply is broken.
    pub async fn verify(&self, text: &str, signature: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let mut session = self.open_session(&state).await?;
        session.channel()?.add_data(text.as_bytes(), INPUT_PATH).await?;
        session
            .channel()?
            .add_data(signature.as_bytes(), SIG_PATH)
            .await?;
        let output = session.run_raw(&["--verify", SIG_PATH, INPUT_PATH]).await?;
        Self::commit(&mut state, session).await?;
        Ok(output.status == 0)
    }

    /// Encrypts `text` for the given recipients (deduplicated, order
    /// preserved), returning ASCII armor.
    ///
    /// # Errors
    ///
    /// Returns an error on engine failure, e.g. a missing public key.
    pub async fn encrypt(&self, text: &str, recipients: &[String]) -> Result<String> {
        let mut unique: Vec<&str> = Vec::new();
        for addr in recipients {
            if !unique.contains(&addr.as_str()) {
                unique.push(addr);
            }
        }

        let mut args: Vec<&str> = vec!["--armor", "--encrypt", "--output", OUTPUT_PATH];
        for addr in &unique {
            args.push("-r");
            args.push(addr);
        }
        args.push(INPUT_PATH);

        let mut state = self.state.lock().await;
        let mut session = self.open_session(&state).await?;
        session.channel()?.add_data(text.as_bytes(), INPUT_PATH).await?;
        session.run_checked(&args).await?;
        let armor = session.channel()?.get_file(OUTPUT_PATH).await?;
        Self::commit(&mut state, session).await?;
        Ok(String::from_utf8_lossy(&armor).into_owned())
    }

    /// Decrypts ASCII armor back to plaintext.
    ///
    /// # Errors
    ///
    /// Returns an error on engine failure (missing key, corrupt armor).
    pub async fn decrypt(&self, armor: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        let mut session = self.open_session(&state).await?;
        session.channel()?.add_data(armor.as_bytes(), INPUT_PATH).await?;
        session
            .run_checked(&["--decrypt", "--output", OUTPUT_PATH, INPUT_PATH])
            .await?;
        let plain = session.channel()?.get_file(OUTPUT_PATH).await?;
        Self::commit(&mut state, session).await?;
        Ok(String::from_utf8_lossy(&plain).into_owned())
    }

    /// Exports the keyring subset of the filesystem for persistence by
    /// the storage collaborator.
    ///
    /// # Errors
    ///
    /// Infallible today; kept fallible for interface stability.
    pub async fn backup(&self) -> Result<GpgBackup> {
        let state = self.state.lock().await;
        let mut backup = GpgBackup::default();
        for file in state.vfs.files_under(GNUPG_HOME) {
            // Keyrings and trust database only; the entropy pool is
            // re-seeded per process, never persisted.
            if file.path == RANDOM_SEED_PATH {
                continue;
            }
            backup
                .files
                .insert(file.path, crate::protocol::encode_contents(&file.contents));
        }
        Ok(backup)
    }

    /// Re-absorbs a previously exported backup into the filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if any file payload is not valid base64.
    pub async fn restore(&self, backup: &GpgBackup) -> Result<()> {
        let mut state = self.state.lock().await;
        for (path, data) in &backup.files {
            let contents =
                crate::protocol::decode_contents(data).map_err(Error::MalformedReply)?;
            state.vfs.insert(path.clone(), contents);
        }
        info!(files = backup.files.len(), "restored keyring backup");
        Ok(())
    }

    /// Spawns a worker over a copy of the current snapshot and performs
    /// first-use bootstrapping (home directories, entropy pool) if it
    /// has not happened yet.
    async fn open_session<'a>(&'a self, state: &State) -> Result<Session<'a>> {
        let channel = self.open_channel(state.vfs.clone());
        let session = Session {
            channel: Some(channel),
            ran: false,
            gpg: self,
        };

        if !state.bootstrapped {
            let channel = session.channel()?;
            for dir in ["/home", "/home/user", GNUPG_HOME, "/tmp"] {
                channel.mkdir(dir).await?;
            }
            let pool = self.entropy.get_random_bytes(ENTROPY_POOL_BYTES);
            channel.add_data(&pool, RANDOM_SEED_PATH).await?;
            debug!(bytes = ENTROPY_POOL_BYTES, "seeded entropy pool");
        }

        Ok(session)
    }

    fn open_channel(&self, vfs: VfsSnapshot) -> WorkerChannel {
        let (worker, reply_rx) = spawn_worker(self.factory.create(), vfs);
        WorkerChannel::new(worker, reply_rx)
    }

    /// Persists the session's final filesystem state. Only successful
    /// operations reach this point; a failed command leaves the previous
    /// snapshot in place.
    async fn commit(state: &mut State, session: Session<'_>) -> Result<()> {
        state.vfs = session.finish().await?;
        state.bootstrapped = true;
        Ok(())
    }
}
