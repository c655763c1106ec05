//! Integration tests driving the orchestrator end-to-end against the
//! stub engine.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use sealmail_crypto::{EntropyProvider, OsEntropy};
use sealmail_engine::engine::{Engine, EngineRun};
use sealmail_engine::vfs::VfsSnapshot;
use sealmail_engine::{Error, Gpg, StubEngine, StubEngineFactory};

fn orchestrator() -> Gpg {
    Gpg::new(StubEngineFactory, Arc::new(OsEntropy))
}

#[tokio::test]
async fn test_generate_then_list_keys() {
    let gpg = orchestrator();
    gpg.generate_key_pair("alice@example.com", "passphrase", 2048)
        .await
        .unwrap();

    let keys = gpg.get_all_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].has_identity_for("alice@example.com"));
    assert_eq!(keys[0].primary.bits, 2048);
    assert!(keys[0].primary.capabilities.sign);
}

#[tokio::test]
async fn test_disallowed_key_strength_rejected_before_worker() {
    // A factory that counts instantiations: validation failures must
    // never reach the worker.
    struct CountingFactory(Arc<AtomicU32>);
    impl sealmail_engine::EngineFactory for CountingFactory {
        fn create(&self) -> Box<dyn Engine> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::new(StubEngine)
        }
    }

    let created = Arc::new(AtomicU32::new(0));
    let gpg = Gpg::new(CountingFactory(Arc::clone(&created)), Arc::new(OsEntropy));

    let err = gpg
        .generate_key_pair("alice@example.com", "pw", 1536)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidKeyStrength(1536)));
    assert_eq!(created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_import_key_becomes_visible() {
    let gpg = orchestrator();
    gpg.import_key(&StubEngine::armor_public_key("bob@example.com"))
        .await
        .unwrap();

    let keys = gpg.get_all_keys().await.unwrap();
    assert!(keys.iter().any(|k| k.has_identity_for("bob@example.com")));
}

#[tokio::test]
async fn test_sign_verify_round_trip() {
    let gpg = orchestrator();
    gpg.generate_key_pair("alice@example.com", "pw", 2048)
        .await
        .unwrap();

    let sig = gpg.sign("hello world").await.unwrap();
    assert!(sig.contains("BEGIN PGP SIGNATURE"));
    assert!(gpg.verify("hello world", &sig).await.unwrap());
    assert!(!gpg.verify("tampered", &sig).await.unwrap());
}

#[tokio::test]
async fn test_encrypt_decrypt_round_trip() {
    let gpg = orchestrator();
    gpg.generate_key_pair("alice@example.com", "pw", 2048)
        .await
        .unwrap();

    let armor = gpg
        .encrypt("the plaintext", &["alice@example.com".to_string()])
        .await
        .unwrap();
    assert!(armor.contains("BEGIN PGP MESSAGE"));
    assert_eq!(gpg.decrypt(&armor).await.unwrap(), "the plaintext");
}

#[tokio::test]
async fn test_encrypt_missing_key_surfaces_stdout() {
    let gpg = orchestrator();
    gpg.generate_key_pair("alice@example.com", "pw", 2048)
        .await
        .unwrap();

    let err = gpg
        .encrypt("text", &["stranger@example.com".to_string()])
        .await
        .unwrap_err();
    match err {
        Error::Command { status, stdout } => {
            assert_ne!(status, 0);
            assert!(stdout.iter().any(|l| l.contains("No public key")));
        }
        other => panic!("expected command failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_command_does_not_poison_queue() {
    let gpg = orchestrator();
    gpg.generate_key_pair("alice@example.com", "pw", 2048)
        .await
        .unwrap();

    // Decrypt garbage: the engine fails, the lock must still release.
    assert!(gpg.decrypt("not armor").await.is_err());

    // The next command goes through fine.
    let keys = gpg.get_all_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
}

#[tokio::test]
async fn test_backup_restore_round_trip() {
    let gpg = orchestrator();
    gpg.generate_key_pair("alice@example.com", "pw", 2048)
        .await
        .unwrap();

    let backup = gpg.backup().await.unwrap();
    assert!(!backup.is_empty());
    assert!(backup.files.keys().all(|p| p.starts_with("/home/user/.gnupg")));

    // A fresh orchestrator knows nothing until the backup is restored.
    let fresh = orchestrator();
    assert!(fresh.get_all_keys().await.unwrap().is_empty());
    fresh.restore(&backup).await.unwrap();
    let keys = fresh.get_all_keys().await.unwrap();
    assert!(keys[0].has_identity_for("alice@example.com"));
}

#[tokio::test]
async fn test_entropy_pool_seeded_once() {
    // Counts how many bytes were requested; the pool must be filled for
    // the first command only.
    struct CountingEntropy(AtomicU32);
    impl EntropyProvider for CountingEntropy {
        fn get_random_bytes(&self, num_bytes: usize) -> bytes::Bytes {
            self.0.fetch_add(1, Ordering::SeqCst);
            bytes::Bytes::from(vec![0u8; num_bytes])
        }
    }

    let entropy = Arc::new(CountingEntropy(AtomicU32::new(0)));
    let gpg = Gpg::new(StubEngineFactory, Arc::clone(&entropy) as Arc<dyn EntropyProvider>);

    gpg.get_all_keys().await.unwrap();
    gpg.get_all_keys().await.unwrap();
    gpg.generate_key_pair("a@b.c", "pw", 4096).await.unwrap();

    assert_eq!(entropy.0.load(Ordering::SeqCst), 1);
}

/// N concurrent callers must observe exactly N non-overlapping engine
/// executions in FIFO arrival order.
#[tokio::test]
async fn test_concurrent_commands_serialize_fifo() {
    struct TracingEngine {
        log: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }
    impl Engine for TracingEngine {
        fn run(&mut self, _args: &[String], _vfs: &mut VfsSnapshot) -> EngineRun {
            let mut log = self.log.lock().unwrap();
            log.push("start");
            log.push("end");
            EngineRun::ok(vec![])
        }
    }

    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log_for_factory = Arc::clone(&log);
    let factory = move || {
        Box::new(TracingEngine {
            log: Arc::clone(&log_for_factory),
        }) as Box<dyn Engine>
    };
    let gpg = Arc::new(Gpg::new(factory, Arc::new(OsEntropy)));

    let n = 8;
    let mut handles = Vec::new();
    for _ in 0..n {
        let gpg = Arc::clone(&gpg);
        handles.push(tokio::spawn(async move { gpg.get_all_keys().await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let log = log.lock().unwrap();
    assert_eq!(log.len(), n * 2);
    // Executions never interleave: the log is strict start/end pairs.
    for pair in log.chunks(2) {
        assert_eq!(pair, ["start", "end"]);
    }
}
