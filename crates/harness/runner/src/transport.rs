//! Command and file transport to the two protocol hosts.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::Output,
    sync::Arc,
};

use crate::config::{HostConfig, TransportKind};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to run {command:?} on {host}: {source}")]
    Spawn {
        host: String,
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{command:?} on {host} exited with {status:?}: {stderr}")]
    Command {
        host: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to access {path} on {host}: {source}")]
    File {
        host: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Returns `true` if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        }
    }
}

/// Runs shell commands and moves files on one host.
pub trait Transport: fmt::Debug + Send + Sync {
    /// Returns a name for the host, used in logs and errors.
    fn host(&self) -> &str;

    /// Returns an expression running `command` through the host's shell.
    ///
    /// Callers decide how to capture output and whether to block.
    fn expression(&self, command: &str) -> duct::Expression;

    /// Writes `contents` to `path`, replacing the file.
    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError>;

    /// Reads the file at `path`.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError>;

    /// Runs `command` to completion and captures its output. A nonzero exit
    /// code is not an error.
    fn execute(&self, command: &str) -> Result<CommandOutput, TransportError> {
        tracing::debug!(host = self.host(), command, "executing");

        self.expression(command)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map(CommandOutput::from)
            .map_err(|source| TransportError::Spawn {
                host: self.host().to_string(),
                command: command.to_string(),
                source,
            })
    }
}

/// Runs commands on this machine through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn host(&self) -> &str {
        "localhost"
    }

    fn expression(&self, command: &str) -> duct::Expression {
        duct::cmd!("sh", "-c", command)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError> {
        std::fs::write(path, contents).map_err(|source| self.file_error(path, source))
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError> {
        std::fs::read(path).map_err(|source| self.file_error(path, source))
    }
}

impl LocalTransport {
    fn file_error(&self, path: &Path, source: io::Error) -> TransportError {
        TransportError::File {
            host: self.host().to_string(),
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Runs commands on a remote host through the `ssh` client, authenticating
/// with a private key. Password prompts are disabled.
#[derive(Debug, Clone)]
pub struct SshTransport {
    destination: String,
    private_key: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(address: &str, username: Option<&str>, private_key: Option<PathBuf>) -> Self {
        let destination = match username {
            Some(user) => format!("{user}@{address}"),
            None => address.to_string(),
        };

        Self {
            destination,
            private_key,
        }
    }

    fn args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(8);
        if let Some(key) = &self.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.extend(
            ["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"].map(String::from),
        );
        args.push(self.destination.clone());
        args.push(command.to_string());
        args
    }

    fn checked(&self, command: &str, output: CommandOutput) -> Result<CommandOutput, TransportError> {
        if output.success() {
            return Ok(output);
        }

        Err(TransportError::Command {
            host: self.destination.clone(),
            command: command.to_string(),
            status: output.exit_code,
            stderr: output.stderr,
        })
    }
}

impl Transport for SshTransport {
    fn host(&self) -> &str {
        &self.destination
    }

    fn expression(&self, command: &str) -> duct::Expression {
        duct::cmd("ssh", self.args(command))
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> Result<(), TransportError> {
        let command = format!("cat > {}", shell_quote(&path.display().to_string()));
        let output = self
            .expression(&command)
            .stdin_bytes(contents)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|source| TransportError::Spawn {
                host: self.destination.clone(),
                command: command.clone(),
                source,
            })?;

        self.checked(&command, output.into()).map(|_| ())
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>, TransportError> {
        let command = format!("cat {}", shell_quote(&path.display().to_string()));
        let output = self
            .expression(&command)
            .stdin_null()
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|source| TransportError::Spawn {
                host: self.destination.clone(),
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(TransportError::Command {
                host: self.destination.clone(),
                command,
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(output.stdout)
    }
}

/// Creates the transport described by a host configuration.
pub fn connect(host: &HostConfig) -> Arc<dyn Transport> {
    match host.transport {
        TransportKind::Local => Arc::new(LocalTransport),
        TransportKind::Ssh => Arc::new(SshTransport::new(
            &host.address,
            host.username.as_deref(),
            host.private_key.clone(),
        )),
    }
}

/// Quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@".contains(c))
    {
        return value.to_string();
    }

    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/share0.txt"), "/tmp/share0.txt");
        assert_eq!(shell_quote("lfw/Jane Doe/1.jpg"), "'lfw/Jane Doe/1.jpg'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_local_execute() {
        let output = LocalTransport.execute("echo out; echo err >&2; exit 3").unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
    }

    #[test]
    fn test_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share0.txt");

        LocalTransport.write_file(&path, b"0.5\n").unwrap();

        assert_eq!(LocalTransport.read_file(&path).unwrap(), b"0.5\n");
        assert!(matches!(
            LocalTransport.read_file(&dir.path().join("missing")),
            Err(TransportError::File { .. })
        ));
    }

    #[test]
    fn test_ssh_args() {
        let ssh = SshTransport::new("10.0.0.2", Some("bench"), Some(PathBuf::from("/keys/id")));

        assert_eq!(ssh.host(), "bench@10.0.0.2");
        assert_eq!(
            ssh.args("true"),
            [
                "-i",
                "/keys/id",
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "bench@10.0.0.2",
                "true"
            ]
        );
    }
}
