//! `ssh` invocations against a freshly installed guest.
//!
//! A new guest has no prior host identity, so host-key pinning is always
//! disabled. Passwords reach `ssh` through `sshpass -e` and the `SSHPASS`
//! environment variable; they never appear in argv.

use crate::config::ConnectionCredentials;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Options that disable host-key pinning.
pub const HOST_KEY_OPTIONS: &[&str] = &[
    "StrictHostKeyChecking=no",
    "UserKnownHostsFile=/dev/null",
    "LogLevel=ERROR",
];

/// Host and port of the guest's command channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelTarget {
    /// Address or host name.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl ChannelTarget {
    /// Creates a target.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Builds `ssh` commands.
#[derive(Debug, Clone)]
pub struct SshClient {
    ssh: String,
    sshpass: String,
    connect_timeout: Duration,
}

impl SshClient {
    /// Uses `ssh` and `sshpass` from `PATH`.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            ssh: "ssh".to_string(),
            sshpass: "sshpass".to_string(),
            connect_timeout,
        }
    }

    /// Overrides the programs used.
    #[must_use]
    pub fn with_programs(mut self, ssh: impl Into<String>, sshpass: impl Into<String>) -> Self {
        self.ssh = ssh.into();
        self.sshpass = sshpass.into();
        self
    }

    /// Timeout of one connection attempt.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// [`HOST_KEY_OPTIONS`] as a single `-o` string, for tools that take ssh options.
    #[must_use]
    pub fn options_string() -> String {
        HOST_KEY_OPTIONS
            .iter()
            .map(|o| format!("-o {o}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The program that is spawned.
    #[must_use]
    pub fn program(&self, credentials: &ConnectionCredentials) -> &str {
        if uses_password(credentials) {
            &self.sshpass
        } else {
            &self.ssh
        }
    }

    /// Arguments after the program.
    #[must_use]
    pub fn args(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
        remote_command: &str,
    ) -> Vec<String> {
        let mut args = Vec::new();
        let password = uses_password(credentials);
        if password {
            args.push("-e".to_string());
            args.push(self.ssh.clone());
        }

        let mut option = |o: String| {
            args.push("-o".to_string());
            args.push(o);
        };
        for o in HOST_KEY_OPTIONS {
            option((*o).to_string());
        }
        option(format!(
            "ConnectTimeout={}",
            self.connect_timeout.as_secs().max(1)
        ));
        if password {
            option("NumberOfPasswordPrompts=1".to_string());
            option("PreferredAuthentications=password,keyboard-interactive,publickey".to_string());
        } else {
            option("BatchMode=yes".to_string());
        }
        if credentials.private_key_file.is_some() {
            option("IdentitiesOnly=yes".to_string());
        }

        if let Some(ref key) = credentials.private_key_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push(format!("{}@{}", credentials.username, target.host));
        args.push(remote_command.to_string());
        args
    }

    /// A ready-to-spawn command. stdin is closed; stdout and stderr are piped.
    #[must_use]
    pub fn command(
        &self,
        target: &ChannelTarget,
        credentials: &ConnectionCredentials,
        remote_command: &str,
    ) -> Command {
        let mut cmd = Command::new(self.program(credentials));
        cmd.args(self.args(target, credentials, remote_command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref password) = credentials.password {
            if !password.is_empty() {
                cmd.env("SSHPASS", password.expose());
            }
        }
        cmd
    }
}

fn uses_password(credentials: &ConnectionCredentials) -> bool {
    credentials.password.as_ref().is_some_and(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ChannelTarget {
        ChannelTarget::new("10.0.0.7", 22)
    }

    #[test]
    fn test_password_never_in_argv() {
        let client = SshClient::new(Duration::from_secs(10));
        let creds = ConnectionCredentials::password("root", "Sup3rS3cret");
        let args = client.args(&target(), &creds, "true");

        assert_eq!(client.program(&creds), "sshpass");
        assert_eq!(&args[..2], ["-e", "ssh"]);
        assert!(args.iter().all(|a| !a.contains("Sup3rS3cret")));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("true"));
        assert!(args.contains(&"root@10.0.0.7".to_string()));
    }

    #[test]
    fn test_host_key_pinning_disabled() {
        let client = SshClient::new(Duration::from_millis(200));
        let creds = ConnectionCredentials::private_key("admin", "/keys/id_ed25519");
        let args = client.args(&target(), &creds, "true");

        assert_eq!(client.program(&creds), "ssh");
        for o in HOST_KEY_OPTIONS {
            assert!(args.contains(&(*o).to_string()));
        }
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=1".to_string()));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
    }

    #[test]
    fn test_options_string() {
        assert_eq!(
            SshClient::options_string(),
            "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o LogLevel=ERROR"
        );
    }

    #[test]
    fn test_target_display() {
        assert_eq!(target().to_string(), "10.0.0.7:22");
    }
}
