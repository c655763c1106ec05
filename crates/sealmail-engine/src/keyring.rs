//! Parser for the engine's machine-readable key listing.
//!
//! `--with-colons --fixed-list-mode` output is a sequence of
//! colon-separated records. A `pub` record starts a new key; subsequent
//! `uid` records attach identities and `sub` records attach subkeys,
//! until the next `pub`. The listing is rebuilt wholesale on every
//! fetch; there is no incremental update.

use chrono::{DateTime, Utc};

/// Armor header marking an OpenPGP-encrypted payload.
pub const PGP_MESSAGE_MARKER: &str = "-----BEGIN PGP MESSAGE-----";

/// What a key (or subkey) is allowed to do, from the capabilities field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCapabilities {
    /// Can produce signatures.
    pub sign: bool,
    /// Can certify other keys.
    pub certify: bool,
    /// Can encrypt.
    pub encrypt: bool,
}

impl KeyCapabilities {
    /// Parses the capabilities field (field 12 of a `pub`/`sub` record).
    /// Lowercase letters are the key's own capabilities, uppercase the
    /// usable capabilities of the whole key; both count here.
    #[must_use]
    pub fn from_field(field: &str) -> Self {
        Self {
            sign: field.contains(['s', 'S']),
            certify: field.contains(['c', 'C']),
            encrypt: field.contains(['e', 'E']),
        }
    }
}

/// Primary key or subkey attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgpKeyInfo {
    /// Long key id (field 5).
    pub key_id: String,
    /// Key length in bits.
    pub bits: u32,
    /// Creation time.
    pub created: Option<DateTime<Utc>>,
    /// Expiry time, if any.
    pub expires: Option<DateTime<Utc>>,
    /// Whether the validity field marks the key as trusted.
    pub trusted: bool,
    /// Capability set.
    pub capabilities: KeyCapabilities,
}

/// One user id attached to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgpIdentity {
    /// Full user-id text, e.g. `Alice <alice@example.com>`.
    pub text: String,
    /// Email address extracted from the text, if present.
    pub email: Option<String>,
    /// Whether the validity field marks the identity as trusted.
    pub trusted: bool,
}

impl PgpIdentity {
    /// Returns `true` if this identity is for the given email address.
    #[must_use]
    pub fn matches_email(&self, email: &str) -> bool {
        self.text.contains(&format!("<{email}>")) || self.email.as_deref() == Some(email)
    }
}

/// A key tree: primary key, identities, subkeys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgpKey {
    /// The primary key.
    pub primary: PgpKeyInfo,
    /// Attached user ids.
    pub identities: Vec<PgpIdentity>,
    /// Attached subkeys.
    pub subkeys: Vec<PgpKeyInfo>,
}

impl PgpKey {
    /// Returns `true` if any identity is for the given email address.
    #[must_use]
    pub fn has_identity_for(&self, email: &str) -> bool {
        self.identities.iter().any(|id| id.matches_email(email))
    }
}

/// Parses a colon-format key listing into key trees.
///
/// Unknown record types and short records are skipped; the engine emits
/// several record kinds (`tru`, `fpr`, ...) this layer has no use for.
#[must_use]
pub fn parse_key_listing(lines: &[String]) -> Vec<PgpKey> {
    let mut keys: Vec<PgpKey> = Vec::new();

    for line in lines {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first() {
            Some(&"pub") => {
                if let Some(info) = parse_key_info(&fields) {
                    keys.push(PgpKey {
                        primary: info,
                        identities: Vec::new(),
                        subkeys: Vec::new(),
                    });
                }
            }
            Some(&"uid") => {
                if let (Some(key), Some(identity)) = (keys.last_mut(), parse_identity(&fields)) {
                    key.identities.push(identity);
                }
            }
            Some(&"sub") => {
                if let (Some(key), Some(info)) = (keys.last_mut(), parse_key_info(&fields)) {
                    key.subkeys.push(info);
                }
            }
            _ => {}
        }
    }

    keys
}

/// Returns `true` if the text carries an OpenPGP-encrypted payload.
/// Works on a partial body (preview) since the marker leads the armor.
#[must_use]
pub fn is_encrypted(text: &str) -> bool {
    text.contains(PGP_MESSAGE_MARKER)
}

fn parse_key_info(fields: &[&str]) -> Option<PgpKeyInfo> {
    if fields.len() < 12 {
        return None;
    }
    Some(PgpKeyInfo {
        key_id: fields[4].to_string(),
        bits: fields[2].parse().unwrap_or(0),
        created: parse_timestamp(fields[5]),
        expires: parse_timestamp(fields[6]),
        trusted: is_trusted_validity(fields[1]),
        capabilities: KeyCapabilities::from_field(fields[11]),
    })
}

fn parse_identity(fields: &[&str]) -> Option<PgpIdentity> {
    if fields.len() < 10 {
        return None;
    }
    let text = fields[9].to_string();
    Some(PgpIdentity {
        email: extract_email(&text),
        trusted: is_trusted_validity(fields[1]),
        text,
    })
}

/// Validity letters that count as trusted: full, ultimate, marginal.
fn is_trusted_validity(field: &str) -> bool {
    matches!(field, "f" | "u" | "m")
}

fn parse_timestamp(field: &str) -> Option<DateTime<Utc>> {
    let seconds: i64 = field.parse().ok()?;
    if seconds == 0 {
        return None;
    }
    DateTime::from_timestamp(seconds, 0)
}

/// Pulls the address out of `Name <addr>`, or accepts a bare address.
fn extract_email(text: &str) -> Option<String> {
    if let (Some(start), Some(end)) = (text.find('<'), text.rfind('>')) {
        if start < end {
            return Some(text[start + 1..end].to_string());
        }
    }
    if text.contains('@') && !text.contains(' ') {
        return Some(text.to_string());
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_listing() -> Vec<String> {
        [
            "tru::1:1389632699:0:3:1:5",
            "pub:u:2048:1:AABBCCDD11223344:1388576897:::u:::scESC:",
            "uid:u::::1388576897::HASH::Alice <alice@example.com>:",
            "uid:u::::1388576897::HASH2::alice@work.example:",
            "sub:u:2048:1:5566778899AABBCC:1388576897::::::e:",
            "pub:-:4096:1:DEADBEEF00000000:1388576897:1500000000::-:::sc:",
            "uid:-::::1388576897::HASH3::Bob <bob@example.com>:",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    #[test]
    fn test_parse_builds_key_trees() {
        let keys = parse_key_listing(&sample_listing());
        assert_eq!(keys.len(), 2);

        let alice = &keys[0];
        assert_eq!(alice.primary.key_id, "AABBCCDD11223344");
        assert_eq!(alice.primary.bits, 2048);
        assert!(alice.primary.trusted);
        assert!(alice.primary.capabilities.sign);
        assert!(alice.primary.capabilities.certify);
        assert!(alice.primary.capabilities.encrypt);
        assert_eq!(alice.identities.len(), 2);
        assert_eq!(alice.subkeys.len(), 1);
        assert!(alice.subkeys[0].capabilities.encrypt);
        assert!(!alice.subkeys[0].capabilities.sign);

        let bob = &keys[1];
        assert_eq!(bob.primary.bits, 4096);
        assert!(!bob.primary.trusted);
        assert!(bob.primary.expires.is_some());
        assert_eq!(bob.identities.len(), 1);
    }

    #[test]
    fn test_identity_email_extraction() {
        let keys = parse_key_listing(&sample_listing());
        assert_eq!(
            keys[0].identities[0].email.as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(
            keys[0].identities[1].email.as_deref(),
            Some("alice@work.example")
        );
    }

    #[test]
    fn test_has_identity_for() {
        let keys = parse_key_listing(&sample_listing());
        assert!(keys[0].has_identity_for("alice@example.com"));
        assert!(keys[0].has_identity_for("alice@work.example"));
        assert!(!keys[0].has_identity_for("mallory@example.com"));
        assert!(keys[1].has_identity_for("bob@example.com"));
    }

    #[test]
    fn test_uid_before_pub_is_skipped() {
        let lines = vec!["uid:u::::0::H::Orphan <o@x>:".to_string()];
        assert!(parse_key_listing(&lines).is_empty());
    }

    #[test]
    fn test_short_records_skipped() {
        let lines = vec!["pub:u:2048".to_string()];
        assert!(parse_key_listing(&lines).is_empty());
    }

    #[test]
    fn test_is_encrypted_marker() {
        assert!(is_encrypted(
            "-----BEGIN PGP MESSAGE-----\nVersion: something\n\nhQEMA..."
        ));
        assert!(!is_encrypted("just a plain message"));
        // Preview detection: marker within a partial body still counts.
        assert!(is_encrypted("noise before -----BEGIN PGP MESSAGE----- rest"));
    }
}
