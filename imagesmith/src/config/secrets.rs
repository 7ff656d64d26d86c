//! Sensitive values and their redaction.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Placeholder written wherever a sensitive value would appear.
pub const REDACTED: &str = "<sensitive>";

/// A sensitive string.
///
/// `Debug`, `Display` and `Serialize` all print [`REDACTED`]; the value is
/// only reachable through [`Secret::expose`].
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// Replaces known sensitive values in text.
///
/// Cheap to clone; every component of one build shares the same instance.
#[derive(Clone, Default)]
pub struct Redactor {
    needles: Arc<Vec<String>>,
}

impl fmt::Debug for Redactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redactor")
            .field("values", &self.needles.len())
            .finish()
    }
}

impl Redactor {
    /// Builds a redactor over the given values. Empty values are ignored.
    #[must_use]
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut needles: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_empty())
            .collect();
        // Longest first so a secret that contains another is replaced whole.
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        needles.dedup();
        Self {
            needles: Arc::new(needles),
        }
    }

    /// Returns a redactor that also covers `secret`.
    #[must_use]
    pub fn with_secret(&self, secret: &Secret) -> Self {
        let mut values: Vec<String> = self.needles.as_ref().clone();
        values.push(secret.expose().to_string());
        Self::new(values)
    }

    /// Number of distinct values covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.needles.len()
    }

    /// Returns true if nothing is redacted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    /// Returns `text` with every sensitive value replaced by [`REDACTED`].
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for needle in self.needles.iter() {
            if out.contains(needle.as_str()) {
                out = out.replace(needle.as_str(), REDACTED);
            }
        }
        out
    }

    /// Redacts every string inside a JSON value.
    #[must_use]
    pub fn redact_value(&self, value: serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(self.redact(&s)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.redact_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

/// Credentials for the guest's command channel.
#[derive(Debug, Clone)]
pub struct ConnectionCredentials {
    /// Login user.
    pub username: String,
    /// Password, if password authentication is used.
    pub password: Option<Secret>,
    /// Private key file, if key authentication is used.
    pub private_key_file: Option<PathBuf>,
}

impl ConnectionCredentials {
    /// Creates password credentials.
    #[must_use]
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(Secret::new(password)),
            private_key_file: None,
        }
    }

    /// Creates key credentials.
    #[must_use]
    pub fn private_key(username: impl Into<String>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            username: username.into(),
            password: None,
            private_key_file: Some(key_file.into()),
        }
    }

    /// `user@host:port`, used in messages.
    #[must_use]
    pub fn target(&self, host: &str, port: u16) -> String {
        format!("{}@{host}:{port}", self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_secret_never_prints() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret}"), REDACTED);
        assert_eq!(format!("{secret:?}"), REDACTED);
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"<sensitive>\"");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_secret_deserializes_transparently() {
        let secret: Secret = serde_json::from_str("\"s3cr3t\"").unwrap();
        assert_eq!(secret.expose(), "s3cr3t");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = ConnectionCredentials::password("root", "Sup3rS3cret!");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("Sup3rS3cret!"));
        assert!(debug.contains("root"));
        assert_eq!(creds.target("10.0.0.9", 22), "root@10.0.0.9:22");
    }

    #[test]
    fn test_redact_longest_first() {
        let redactor = Redactor::new(["pass", "password123", ""]);
        assert_eq!(redactor.len(), 2);
        assert_eq!(
            redactor.redact("login with password123 then pass"),
            "login with <sensitive> then <sensitive>"
        );
    }

    #[test]
    fn test_redact_value_recurses() {
        let redactor = Redactor::new(["tok-abc"]);
        let value = serde_json::json!({
            "env": {"TOKEN": "tok-abc"},
            "args": ["--token", "tok-abc"],
            "count": 3
        });
        assert_eq!(
            redactor.redact_value(value),
            serde_json::json!({
                "env": {"TOKEN": "<sensitive>"},
                "args": ["--token", "<sensitive>"],
                "count": 3
            })
        );
    }

    #[test]
    fn test_with_secret_extends() {
        let redactor = Redactor::default().with_secret(&Secret::new("k3y"));
        assert_eq!(redactor.redact("k3y"), REDACTED);
        assert!(Redactor::default().is_empty());
    }
}
