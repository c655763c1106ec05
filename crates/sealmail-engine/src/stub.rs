//! A scripted stand-in for the real PGP engine.
//!
//! The production engine is an opaque GnuPG-compatible implementation
//! supplied by the embedding application. This stub speaks the same CLI
//! surface the orchestrator drives — batch key generation, colon-format
//! listings, import, detached sign/verify, encrypt/decrypt — against a
//! keyring file in the virtual filesystem. It is NOT a cryptographic
//! implementation; it exists so the rest of the stack can be exercised
//! end-to-end (the transport simulator and the test suites both use it).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, EngineFactory, EngineRun};
use crate::orchestrator::GNUPG_HOME;
use crate::vfs::VfsSnapshot;

/// Where the stub persists its keyring between worker lifetimes. Living
/// under the engine home means `backup`/`restore` carry it.
const KEYRING_PATH: &str = "/home/user/.gnupg/keyring.json";

/// One key known to the stub.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StubKey {
    email: String,
    bits: u32,
    has_secret: bool,
}

/// Scripted engine instance. Stateless between runs: everything lives in
/// the virtual filesystem, as with the real engine.
#[derive(Debug, Default)]
pub struct StubEngine;

/// Factory producing [`StubEngine`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubEngineFactory;

impl EngineFactory for StubEngineFactory {
    fn create(&self) -> Box<dyn Engine> {
        Box::new(StubEngine)
    }
}

impl StubEngine {
    /// Builds the armored public-key text the stub's `--import` accepts.
    #[must_use]
    pub fn armor_public_key(email: &str) -> String {
        format!(
            "-----BEGIN PGP PUBLIC KEY BLOCK-----\nEmail: {email}\n-----END PGP PUBLIC KEY BLOCK-----\n"
        )
    }
}

impl Engine for StubEngine {
    #[allow(clippy::too_many_lines)]
    fn run(&mut self, args: &[String], vfs: &mut VfsSnapshot) -> EngineRun {
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        match argv.as_slice() {
            ["--batch", "--gen-key", script] => gen_key(vfs, script),
            ["--list-keys", "--with-colons", "--fixed-list-mode"] => list_keys(vfs),
            ["--import", path] => import(vfs, path),
            ["--armor", "--detach-sign", "--output", sig, input] => sign(vfs, sig, input),
            ["--verify", sig, input] => verify(vfs, sig, input),
            ["--decrypt", "--output", output, input] => decrypt(vfs, output, input),
            _ if argv.first() == Some(&"--armor") && argv.get(1) == Some(&"--encrypt") => {
                encrypt(vfs, &argv)
            }
            _ => EngineRun::failed(2, vec![format!("gpg: invalid arguments: {argv:?}")]),
        }
    }
}

fn load_keyring(vfs: &VfsSnapshot) -> Vec<StubKey> {
    vfs.get(KEYRING_PATH)
        .and_then(|raw| serde_json::from_slice(raw).ok())
        .unwrap_or_default()
}

fn store_keyring(vfs: &mut VfsSnapshot, keys: &[StubKey]) {
    if let Ok(raw) = serde_json::to_vec(keys) {
        vfs.insert(KEYRING_PATH, raw);
    }
    // The real engine maintains these; give backup something to carry.
    vfs.insert(format!("{GNUPG_HOME}/pubring.kbx"), b"stub-pubring".to_vec());
    vfs.insert(format!("{GNUPG_HOME}/trustdb.gpg"), b"stub-trustdb".to_vec());
}

fn key_id_for(email: &str) -> String {
    let mut hasher = DefaultHasher::new();
    email.hash(&mut hasher);
    format!("{:016X}", hasher.finish())
}

fn digest(data: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn gen_key(vfs: &mut VfsSnapshot, script_path: &str) -> EngineRun {
    let Some(script) = vfs.get(script_path) else {
        return EngineRun::failed(2, vec![format!("gpg: no such file: {script_path}")]);
    };
    let text = String::from_utf8_lossy(script).into_owned();

    let field = |name: &str| {
        text.lines()
            .find_map(|l| l.strip_prefix(name))
            .map(|v| v.trim().to_string())
    };
    let Some(email) = field("Name-Email:") else {
        return EngineRun::failed(2, vec!["gpg: batch script missing Name-Email".into()]);
    };
    let bits = field("Key-Length:")
        .and_then(|v| v.parse().ok())
        .unwrap_or(2048);

    let mut keys = load_keyring(vfs);
    keys.push(StubKey {
        email: email.clone(),
        bits,
        has_secret: true,
    });
    store_keyring(vfs, &keys);

    EngineRun::ok(vec![
        format!("gpg: key {} marked as ultimately trusted", key_id_for(&email)),
        "gpg: done".into(),
    ])
}

fn list_keys(vfs: &VfsSnapshot) -> EngineRun {
    let mut stdout = vec!["tru::1:1389632699:0:3:1:5".to_string()];
    for key in load_keyring(vfs) {
        let key_id = key_id_for(&key.email);
        stdout.push(format!(
            "pub:u:{}:1:{key_id}:1388576897:::u:::scESC:",
            key.bits
        ));
        stdout.push(format!(
            "uid:u::::1388576897::X::{} <{}>:",
            key.email.split('@').next().unwrap_or(""),
            key.email
        ));
        stdout.push(format!(
            "sub:u:{}:1:{key_id}:1388576897::::::e:",
            key.bits
        ));
    }
    EngineRun::ok(stdout)
}

fn import(vfs: &mut VfsSnapshot, path: &str) -> EngineRun {
    let Some(armor) = vfs.get(path) else {
        return EngineRun::failed(2, vec![format!("gpg: no such file: {path}")]);
    };
    let text = String::from_utf8_lossy(armor);
    let Some(email) = text
        .lines()
        .find_map(|l| l.strip_prefix("Email: "))
        .map(str::trim)
        .map(ToString::to_string)
    else {
        return EngineRun::failed(2, vec!["gpg: no valid OpenPGP data found".into()]);
    };

    let mut keys = load_keyring(vfs);
    if !keys.iter().any(|k| k.email == email) {
        keys.push(StubKey {
            email: email.clone(),
            bits: 2048,
            has_secret: false,
        });
    }
    store_keyring(vfs, &keys);
    EngineRun::ok(vec![format!("gpg: key {}: imported", key_id_for(&email))])
}

fn sign(vfs: &mut VfsSnapshot, sig_path: &str, input_path: &str) -> EngineRun {
    if !load_keyring(vfs).iter().any(|k| k.has_secret) {
        return EngineRun::failed(2, vec!["gpg: no default secret key".into()]);
    }
    let Some(input) = vfs.get(input_path).cloned() else {
        return EngineRun::failed(2, vec![format!("gpg: no such file: {input_path}")]);
    };
    let armor = format!(
        "-----BEGIN PGP SIGNATURE-----\n{}\n-----END PGP SIGNATURE-----\n",
        digest(&input)
    );
    vfs.insert(sig_path.to_string(), armor.into_bytes());
    EngineRun::ok(vec!["gpg: signature created".into()])
}

fn verify(vfs: &VfsSnapshot, sig_path: &str, input_path: &str) -> EngineRun {
    let (Some(sig), Some(input)) = (vfs.get(sig_path), vfs.get(input_path)) else {
        return EngineRun::failed(2, vec!["gpg: missing signature or data file".into()]);
    };
    let expected = digest(input);
    let good = String::from_utf8_lossy(sig)
        .lines()
        .any(|line| line == expected);
    if good {
        EngineRun::ok(vec!["gpg: Good signature".into()])
    } else {
        EngineRun::failed(1, vec!["gpg: BAD signature".into()])
    }
}

fn encrypt(vfs: &mut VfsSnapshot, argv: &[&str]) -> EngineRun {
    // --armor --encrypt --output <out> [-r addr]... <input>
    let Some(out_pos) = argv.iter().position(|a| *a == "--output") else {
        return EngineRun::failed(2, vec!["gpg: missing --output".into()]);
    };
    let Some(output_path) = argv.get(out_pos + 1) else {
        return EngineRun::failed(2, vec!["gpg: missing --output value".into()]);
    };
    let mut recipients = Vec::new();
    let mut i = out_pos + 2;
    while i + 1 < argv.len() {
        if argv[i] == "-r" {
            recipients.push(argv[i + 1].to_string());
        }
        i += 2;
    }
    let Some(input_path) = argv.last() else {
        return EngineRun::failed(2, vec!["gpg: missing input".into()]);
    };
    let Some(input) = vfs.get(*input_path).cloned() else {
        return EngineRun::failed(2, vec![format!("gpg: no such file: {input_path}")]);
    };

    let keys = load_keyring(vfs);
    for addr in &recipients {
        if !keys.iter().any(|k| &k.email == addr) {
            return EngineRun::failed(2, vec![format!("gpg: {addr}: skipped: No public key")]);
        }
    }

    let armor = format!(
        "-----BEGIN PGP MESSAGE-----\nTo: {}\n\n{}\n-----END PGP MESSAGE-----\n",
        recipients.join(","),
        BASE64.encode(&input)
    );
    vfs.insert((*output_path).to_string(), armor.into_bytes());
    EngineRun::ok(vec!["gpg: encrypted".into()])
}

fn decrypt(vfs: &mut VfsSnapshot, output_path: &str, input_path: &str) -> EngineRun {
    if !load_keyring(vfs).iter().any(|k| k.has_secret) {
        return EngineRun::failed(2, vec!["gpg: decryption failed: No secret key".into()]);
    }
    let Some(armor) = vfs.get(input_path) else {
        return EngineRun::failed(2, vec![format!("gpg: no such file: {input_path}")]);
    };
    let text = String::from_utf8_lossy(armor);
    let payload = text
        .lines()
        .skip_while(|l| !l.is_empty())
        .find(|l| !l.is_empty() && !l.starts_with("-----"));
    let Some(payload) = payload else {
        return EngineRun::failed(2, vec!["gpg: no valid OpenPGP data found".into()]);
    };
    match BASE64.decode(payload) {
        Ok(plain) => {
            vfs.insert(output_path.to_string(), plain);
            EngineRun::ok(vec!["gpg: decrypted".into()])
        }
        Err(_) => EngineRun::failed(2, vec!["gpg: malformed message".into()]),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn run(vfs: &mut VfsSnapshot, args: &[&str]) -> EngineRun {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        StubEngine.run(&args, vfs)
    }

    fn gen_key_for(vfs: &mut VfsSnapshot, email: &str) {
        let script = format!("Key-Length: 2048\nName-Email: {email}\n%commit\n");
        vfs.insert("/tmp/keygen", script.into_bytes());
        let out = run(vfs, &["--batch", "--gen-key", "/tmp/keygen"]);
        assert_eq!(out.status, 0);
    }

    #[test]
    fn test_gen_then_list() {
        let mut vfs = VfsSnapshot::new();
        gen_key_for(&mut vfs, "alice@example.com");
        let out = run(&mut vfs, &["--list-keys", "--with-colons", "--fixed-list-mode"]);
        assert_eq!(out.status, 0);
        assert!(out.stdout.iter().any(|l| l.contains("<alice@example.com>")));
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let mut vfs = VfsSnapshot::new();
        gen_key_for(&mut vfs, "alice@example.com");
        vfs.insert("/tmp/input", b"message body".to_vec());

        let out = run(
            &mut vfs,
            &["--armor", "--detach-sign", "--output", "/tmp/input.sig", "/tmp/input"],
        );
        assert_eq!(out.status, 0);

        let out = run(&mut vfs, &["--verify", "/tmp/input.sig", "/tmp/input"]);
        assert_eq!(out.status, 0);

        vfs.insert("/tmp/input", b"tampered body".to_vec());
        let out = run(&mut vfs, &["--verify", "/tmp/input.sig", "/tmp/input"]);
        assert_ne!(out.status, 0);
    }

    #[test]
    fn test_encrypt_requires_public_keys() {
        let mut vfs = VfsSnapshot::new();
        gen_key_for(&mut vfs, "alice@example.com");
        vfs.insert("/tmp/input", b"secret".to_vec());

        let out = run(
            &mut vfs,
            &[
                "--armor", "--encrypt", "--output", "/tmp/out", "-r",
                "nobody@example.com", "/tmp/input",
            ],
        );
        assert_ne!(out.status, 0);
        assert!(out.stdout.iter().any(|l| l.contains("No public key")));
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let mut vfs = VfsSnapshot::new();
        gen_key_for(&mut vfs, "alice@example.com");
        vfs.insert("/tmp/input", b"secret payload".to_vec());

        let out = run(
            &mut vfs,
            &[
                "--armor", "--encrypt", "--output", "/tmp/out", "-r",
                "alice@example.com", "/tmp/input",
            ],
        );
        assert_eq!(out.status, 0);

        let armor = vfs.get("/tmp/out").unwrap().clone();
        vfs.insert("/tmp/in2", armor);
        let out = run(&mut vfs, &["--decrypt", "--output", "/tmp/plain", "/tmp/in2"]);
        assert_eq!(out.status, 0);
        assert_eq!(vfs.get("/tmp/plain").unwrap().as_ref(), b"secret payload");
    }

    #[test]
    fn test_import_adds_public_only_key() {
        let mut vfs = VfsSnapshot::new();
        let armor = StubEngine::armor_public_key("bob@example.com");
        vfs.insert("/tmp/import.asc", armor.into_bytes());
        let out = run(&mut vfs, &["--import", "/tmp/import.asc"]);
        assert_eq!(out.status, 0);

        let keys = load_keyring(&vfs);
        assert_eq!(keys.len(), 1);
        assert!(!keys[0].has_secret);
    }
}
