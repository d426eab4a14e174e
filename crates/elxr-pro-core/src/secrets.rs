//! Secret redaction.
//!
//! Two layers scrub sensitive values before anything reaches a log sink or the
//! terminal:
//! - [`SecretRegistry`] holds the exact values learned during this invocation
//!   (tokens passed on the command line, tokens returned by the service).
//! - [`redact_sensitive_logs`] applies static patterns for values that look
//!   like credentials even when they were never registered.

use std::sync::{LazyLock, RwLock};

use regex::Regex;

/// Replacement text for every scrubbed value.
pub const REDACTED: &str = "<REDACTED>";

/// Registry of values known to be secret during this process.
///
/// Constructed once in `main` and shared (behind an `Arc`) with the logging
/// layer and the attachment state machine.
#[derive(Debug, Default)]
pub struct SecretRegistry {
    secrets: RwLock<Vec<String>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `secret`. Empty values are ignored.
    pub fn register(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        let Ok(mut secrets) = self.secrets.write() else {
            return;
        };
        if !secrets.iter().any(|s| s == secret) {
            secrets.push(secret.to_string());
        }
    }

    /// Number of registered secrets.
    pub fn len(&self) -> usize {
        self.secrets.read().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace every registered secret in `text` with [`REDACTED`].
    pub fn redact(&self, text: &str) -> String {
        let Ok(secrets) = self.secrets.read() else {
            return text.to_string();
        };
        secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    /// Apply the static patterns, then the registered secrets.
    pub fn scrub(&self, text: &str) -> String {
        self.redact(&redact_sensitive_logs(text))
    }
}

static SENSITIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(Bearer )[^'"\s]+"#,
        r"('join', ')[^']+",
        r"('test', ')[^']+",
        r"('machineToken': ')[^']+",
        r"('productToken': ')[^']+",
        r"('token': ')[^']+",
        r"('resourceToken': ')[^']+",
        r"('contractToken': ')[^']+",
        // Double-quoted forms also match once a JSON log layer has escaped
        // the quotes (`\"password\":\"...`).
        r#"(\\?"join\\?", \\?")[^"\\]+"#,
        r#"(\\?"test\\?", \\?")[^"\\]+"#,
        r#"(\\?"machineToken\\?":\s*\\?")[^"\\]+"#,
        r#"(\\?"productToken\\?":\s*\\?")[^"\\]+"#,
        r#"(\\?"token\\?":\s*\\?")[^"\\]+"#,
        r#"(\\?"password\\?":\s*\\?")[^"\\]+"#,
        r#"(\\?"login\\?":\s*\\?")[^"\\]+"#,
        r"(https://bearer:)[^@]+",
        r"(login \S+ password )\S+",
        r#"(--registration-key[= ])[^\s'"]+"#,
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Redact values that follow well-known credential markers.
pub fn redact_sensitive_logs(text: &str) -> String {
    SENSITIVE_PATTERNS.iter().fold(text.to_string(), |acc, re| {
        re.replace_all(&acc, format!("${{1}}{REDACTED}").as_str())
            .into_owned()
    })
}
