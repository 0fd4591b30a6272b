//! Command lines of the secure computation engine.

use std::path::PathBuf;

use harness_core::{Role, share::BitWidth};

use crate::transport::shell_quote;

/// Wraps the engine to report resource usage on stderr.
pub const TIME_COMMAND: &str = "/usr/bin/time -v";

/// One invocation of the engine for one role.
///
/// The rendered command changes into the engine directory and `exec`s the
/// engine, so that signals sent to the shell reach the engine itself.
#[derive(Debug, Clone, bon::Builder)]
pub struct EngineInvocation {
    role: Role,
    #[builder(into)]
    working_dir: PathBuf,
    #[builder(into)]
    executable: PathBuf,
    /// Address of the role 0 host, where both roles rendezvous.
    #[builder(into)]
    server_address: String,
    port: u16,
    /// Pairwise input file, or the file prefix for batched runs.
    #[builder(into)]
    input: PathBuf,
    /// Reference share held by this role.
    #[builder(into)]
    share: Option<PathBuf>,
    bit_width: BitWidth,
    /// Directory the engine reads its circuit files from.
    #[builder(into)]
    output_dir: PathBuf,
    security_level: u32,
    mt_algorithm: u8,
    /// Number of input files for batched runs.
    batch: Option<usize>,
    #[builder(default)]
    niceness: i32,
    #[builder(default)]
    measure_resources: bool,
}

impl EngineInvocation {
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the engine arguments.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            self.role.id().to_string(),
            "-a".to_string(),
            self.server_address.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-f".to_string(),
            self.input.display().to_string(),
        ];
        if let Some(share) = &self.share {
            args.push("-y".to_string());
            args.push(share.display().to_string());
        }
        args.extend([
            "-b".to_string(),
            self.bit_width.bits().to_string(),
            "-o".to_string(),
            self.output_dir.display().to_string(),
            "-s".to_string(),
            self.security_level.to_string(),
            "-x".to_string(),
            self.mt_algorithm.to_string(),
        ]);
        if let Some(batch) = self.batch {
            args.push("-d".to_string());
            args.push(batch.to_string());
        }
        args
    }

    /// Renders the shell command line.
    pub fn command_line(&self) -> String {
        let mut parts = vec![
            "cd".to_string(),
            shell_quote(&self.working_dir.display().to_string()),
            "&&".to_string(),
            "exec".to_string(),
        ];
        if self.niceness < 0 {
            parts.extend(["sudo", "-n"].map(String::from));
        }
        if self.niceness != 0 {
            parts.extend(["nice".to_string(), "-n".to_string(), self.niceness.to_string()]);
        }
        if self.measure_resources {
            parts.push(TIME_COMMAND.to_string());
        }
        parts.push(shell_quote(&self.executable.display().to_string()));
        parts.extend(self.args().iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}
