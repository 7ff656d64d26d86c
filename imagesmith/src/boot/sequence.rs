//! Parsing and resolving boot commands.
//!
//! A boot command is a list of strings in the usual console-typing
//! language: literal text, `<key>` tokens, `<waitN>` pauses, and the
//! `{{ .HTTPIP }}` / `{{ .HTTPPort }}` placeholders for the artifact server.
//! The strings are read as one continuous stream.

use super::keys::{lookup, KeyInput, NamedKey};
use crate::utils::parse_duration;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_WAIT: Duration = Duration::from_secs(1);

/// Errors produced while parsing a boot command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BootParseError {
    /// A `<name>` token that is neither a key nor a wait.
    #[error("unknown key <{0}> in boot command")]
    UnknownKey(String),

    /// A `{{ ... }}` placeholder other than `.HTTPIP` or `.HTTPPort`.
    #[error("unknown placeholder {{{{ {0} }}}} in boot command")]
    UnknownPlaceholder(String),

    /// `{{` without a closing `}}`.
    #[error("unterminated placeholder in boot command")]
    Unterminated,

    /// `<waitX>` where `X` is not a duration.
    #[error("invalid wait <{0}> in boot command")]
    InvalidWait(String),
}

/// An element of a parsed step; placeholders are still symbolic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootKey {
    /// Literal text.
    Text(String),
    /// The artifact server's advertised host.
    HttpIp,
    /// The artifact server's port.
    HttpPort,
    /// A resolved console input.
    Input(KeyInput),
}

/// Keys sent together, followed by a pause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootStep<K> {
    /// Keys, in order.
    pub keys: Vec<K>,
    /// Pause after the keys were sent.
    pub wait_after: Duration,
}

/// A parsed boot command. Immutable once computed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootSequence {
    steps: Vec<BootStep<BootKey>>,
}

/// A boot command with the artifact server's address filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBootSequence {
    steps: Vec<BootStep<KeyInput>>,
}

impl BootSequence {
    /// Parses a list of boot command strings.
    pub fn parse<S: AsRef<str>>(commands: &[S]) -> Result<Self, BootParseError> {
        let mut builder = StepBuilder::default();
        for command in commands {
            parse_into(command.as_ref(), &mut builder)?;
        }
        Ok(builder.finish())
    }

    /// The parsed steps.
    #[must_use]
    pub fn steps(&self) -> &[BootStep<BootKey>] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.keys.is_empty())
    }

    /// Sum of all pauses.
    #[must_use]
    pub fn total_wait(&self) -> Duration {
        self.steps.iter().map(|s| s.wait_after).sum()
    }

    /// Returns true if the command references the artifact server.
    #[must_use]
    pub fn uses_http(&self) -> bool {
        self.steps
            .iter()
            .flat_map(|s| &s.keys)
            .any(|k| matches!(k, BootKey::HttpIp | BootKey::HttpPort))
    }

    /// Substitutes the artifact server's host and port.
    #[must_use]
    pub fn resolve(&self, host: &str, port: u16) -> ResolvedBootSequence {
        let port = port.to_string();
        let steps = self
            .steps
            .iter()
            .map(|step| {
                let mut keys: Vec<KeyInput> = Vec::with_capacity(step.keys.len());
                for key in &step.keys {
                    let text = match key {
                        BootKey::Text(t) => t.as_str(),
                        BootKey::HttpIp => host,
                        BootKey::HttpPort => port.as_str(),
                        BootKey::Input(input) => {
                            keys.push(input.clone());
                            continue;
                        }
                    };
                    match keys.last_mut() {
                        Some(KeyInput::Text(prev)) => prev.push_str(text),
                        _ => keys.push(KeyInput::Text(text.to_string())),
                    }
                }
                BootStep {
                    keys,
                    wait_after: step.wait_after,
                }
            })
            .collect();
        ResolvedBootSequence { steps }
    }
}

impl ResolvedBootSequence {
    /// The resolved steps.
    #[must_use]
    pub fn steps(&self) -> &[BootStep<KeyInput>] {
        &self.steps
    }

    /// All typed text, concatenated. Used by tests and debug output.
    #[must_use]
    pub fn typed_text(&self) -> String {
        self.steps
            .iter()
            .flat_map(|s| &s.keys)
            .filter_map(|k| match k {
                KeyInput::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
struct StepBuilder {
    steps: Vec<BootStep<BootKey>>,
    current: Vec<BootKey>,
}

impl StepBuilder {
    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.current.last_mut() {
            Some(BootKey::Text(prev)) => prev.push_str(text),
            _ => self.current.push(BootKey::Text(text.to_string())),
        }
    }

    fn push(&mut self, key: BootKey) {
        self.current.push(key);
    }

    fn wait(&mut self, duration: Duration) {
        if self.current.is_empty() {
            if let Some(last) = self.steps.last_mut() {
                last.wait_after += duration;
                return;
            }
        }
        self.steps.push(BootStep {
            keys: std::mem::take(&mut self.current),
            wait_after: duration,
        });
    }

    fn finish(mut self) -> BootSequence {
        if !self.current.is_empty() {
            self.steps.push(BootStep {
                keys: self.current,
                wait_after: Duration::ZERO,
            });
        }
        BootSequence { steps: self.steps }
    }
}

fn parse_into(input: &str, builder: &mut StepBuilder) -> Result<(), BootParseError> {
    let mut rest = input;

    while !rest.is_empty() {
        let next_angle = rest.find('<');
        let next_brace = rest.find("{{");
        let cut = match (next_angle, next_brace) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                builder.push_text(rest);
                return Ok(());
            }
        };
        builder.push_text(&rest[..cut]);
        rest = &rest[cut..];

        if let Some(after) = rest.strip_prefix("{{") {
            let end = after.find("}}").ok_or(BootParseError::Unterminated)?;
            match after[..end].trim() {
                ".HTTPIP" => builder.push(BootKey::HttpIp),
                ".HTTPPort" => builder.push(BootKey::HttpPort),
                other => return Err(BootParseError::UnknownPlaceholder(other.to_string())),
            }
            rest = &after[end + 2..];
            continue;
        }

        // At a '<'. Only `<name>` with an alphanumeric name is a token.
        let name_len = rest[1..]
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len() - 1);
        let closes = rest[1 + name_len..].starts_with('>');
        if name_len == 0 || !closes {
            builder.push_text("<");
            rest = &rest[1..];
            continue;
        }

        let name = &rest[1..=name_len];
        rest = &rest[name_len + 2..];

        if let Some(spec) = name.strip_prefix("wait") {
            let duration = if spec.is_empty() {
                DEFAULT_WAIT
            } else {
                parse_duration(spec).map_err(|_| BootParseError::InvalidWait(name.to_string()))?
            };
            builder.wait(duration);
            continue;
        }

        let input = match lookup(name) {
            Some(NamedKey::Key(k)) => KeyInput::Key(k),
            Some(NamedKey::Down(m)) => KeyInput::ModifierDown(m),
            Some(NamedKey::Up(m)) => KeyInput::ModifierUp(m),
            None => return Err(BootParseError::UnknownKey(name.to_string())),
        };
        builder.push(BootKey::Input(input));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::keys::{Modifier, SpecialKey};
    use pretty_assertions::assert_eq;

    fn text(s: &str) -> BootKey {
        BootKey::Text(s.to_string())
    }

    #[test]
    fn test_parse_rhel_kickstart_command() {
        let seq = BootSequence::parse(&[
            "<up><wait>",
            "<tab> inst.text inst.ks=http://{{ .HTTPIP }}:{{.HTTPPort}}/ks.cfg<enter><wait5>",
        ])
        .unwrap();

        assert_eq!(
            seq.steps(),
            &[
                BootStep {
                    keys: vec![BootKey::Input(KeyInput::Key(SpecialKey::Up))],
                    wait_after: Duration::from_secs(1),
                },
                BootStep {
                    keys: vec![
                        BootKey::Input(KeyInput::Key(SpecialKey::Tab)),
                        text(" inst.text inst.ks=http://"),
                        BootKey::HttpIp,
                        text(":"),
                        BootKey::HttpPort,
                        text("/ks.cfg"),
                        BootKey::Input(KeyInput::Key(SpecialKey::Enter)),
                    ],
                    wait_after: Duration::from_secs(5),
                },
            ]
        );
        assert!(seq.uses_http());
        assert_eq!(seq.total_wait(), Duration::from_secs(6));
    }

    #[test]
    fn test_resolve_merges_text() {
        let seq = BootSequence::parse(&["ks=http://{{ .HTTPIP }}:{{ .HTTPPort }}/ks.cfg<enter>"])
            .unwrap();
        let resolved = seq.resolve("10.1.2.3", 8123);

        assert_eq!(
            resolved.steps()[0].keys,
            vec![
                KeyInput::Text("ks=http://10.1.2.3:8123/ks.cfg".into()),
                KeyInput::Key(SpecialKey::Enter),
            ]
        );
        assert_eq!(resolved.typed_text(), "ks=http://10.1.2.3:8123/ks.cfg");
    }

    #[test]
    fn test_consecutive_and_leading_waits() {
        let seq = BootSequence::parse(&["<wait10><wait>", "<esc><wait1m30s><wait500ms>"]).unwrap();
        assert_eq!(seq.len(), 2);
        assert!(seq.steps()[0].keys.is_empty());
        assert_eq!(seq.steps()[0].wait_after, Duration::from_secs(11));
        assert_eq!(seq.steps()[1].wait_after, Duration::from_millis(90_500));
    }

    #[test]
    fn test_modifiers_and_literal_angle() {
        let seq = BootSequence::parse(&["<leftCtrlOn>x<leftCtrlOff> a < b <>"]).unwrap();
        assert_eq!(
            seq.steps()[0].keys,
            vec![
                BootKey::Input(KeyInput::ModifierDown(Modifier::LeftCtrl)),
                text("x"),
                BootKey::Input(KeyInput::ModifierUp(Modifier::LeftCtrl)),
                text(" a < b <>"),
            ]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            BootSequence::parse(&["<bogus>"]).unwrap_err(),
            BootParseError::UnknownKey("bogus".into())
        );
        assert_eq!(
            BootSequence::parse(&["{{ .Name }}"]).unwrap_err(),
            BootParseError::UnknownPlaceholder(".Name".into())
        );
        assert_eq!(
            BootSequence::parse(&["{{ .HTTPIP"]).unwrap_err(),
            BootParseError::Unterminated
        );
        assert_eq!(
            BootSequence::parse(&["<waitforever>"]).unwrap_err(),
            BootParseError::InvalidWait("waitforever".into())
        );
    }

    #[test]
    fn test_empty_sequence() {
        let seq = BootSequence::parse::<&str>(&[]).unwrap();
        assert!(seq.is_empty());
        assert!(!seq.uses_http());
    }
}
