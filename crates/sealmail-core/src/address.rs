//! Free-text recipient parsing.
//!
//! Compose fields arrive as whatever the user typed: `Alice
//! <alice@example.com>, bob@example.com; "Carol" carol@example.com`.
//! This module extracts name+address pairs (and bare address lists) from
//! that, tolerantly — anything that does not look like an address is
//! dropped rather than reported.

/// A parsed recipient with its public-key coverage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Display name, if one was given.
    pub name: Option<String>,
    /// Bare email address.
    pub email: String,
    /// Whether a public key is known for this address. Filled in by the
    /// outbound processor; parsing leaves it `false`.
    pub have_public_key: bool,
}

impl Recipient {
    /// Creates a recipient with no key coverage information.
    pub fn new(name: Option<String>, email: impl Into<String>) -> Self {
        Self {
            name,
            email: email.into(),
            have_public_key: false,
        }
    }
}

/// Parses free text into name+address pairs.
#[must_use]
pub fn extract_recipients(text: &str) -> Vec<Recipient> {
    text.split([',', ';'])
        .filter_map(parse_one)
        .collect()
}

/// Parses free text into bare email addresses.
#[must_use]
pub fn extract_addresses(text: &str) -> Vec<String> {
    extract_recipients(text).into_iter().map(|r| r.email).collect()
}

fn parse_one(part: &str) -> Option<Recipient> {
    let part = part.trim();
    if part.is_empty() {
        return None;
    }

    // `Name <addr>` form.
    if let (Some(start), Some(end)) = (part.find('<'), part.rfind('>')) {
        if start < end {
            let email = part[start + 1..end].trim();
            if !is_plausible_address(email) {
                return None;
            }
            let name = part[..start].trim().trim_matches('"').trim();
            let name = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
            return Some(Recipient::new(name, email));
        }
    }

    // Otherwise scan tokens for something address-shaped.
    let email = part
        .split_whitespace()
        .find(|token| is_plausible_address(token))?;
    let name: Vec<&str> = part
        .split_whitespace()
        .filter(|token| token != &email)
        .collect();
    let name = if name.is_empty() {
        None
    } else {
        Some(name.join(" ").trim_matches('"').to_string())
    };
    Some(Recipient::new(name, email))
}

/// Basic shape check: one `@`, non-empty local and domain parts.
fn is_plausible_address(addr: &str) -> bool {
    let mut parts = addr.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => !local.is_empty() && !domain.is_empty(),
        _ => false,
    }
}
