use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use harness_core::Role;

use crate::{
    config::HostConfig,
    transport::{self, Transport},
};

/// Name prefix of the engine's pairwise input files.
pub const INPUT_PREFIX: &str = "embeddings";

/// A protocol participant: the role it plays, the host it runs on and the
/// transport reaching that host.
#[derive(Debug, Clone)]
pub struct Party {
    role: Role,
    host: HostConfig,
    transport: Arc<dyn Transport>,
}

impl Party {
    /// Creates a party reaching its host through the configured transport.
    pub fn new(role: Role, host: HostConfig) -> Self {
        let transport = transport::connect(&host);
        Self::with_transport(role, host, transport)
    }

    pub fn with_transport(role: Role, host: HostConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            role,
            host,
            transport,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Path of `file` inside the engine directory.
    pub fn engine_path(&self, file: impl AsRef<Path>) -> PathBuf {
        self.host.executable_dir.join(file)
    }

    /// Path of this party's reference share.
    pub fn share_path(&self) -> PathBuf {
        self.engine_path(format!("share{}.txt", self.role.id()))
    }

    /// Path of the single trial input file.
    pub fn input_path(&self) -> PathBuf {
        self.engine_path(format!("{INPUT_PREFIX}.txt"))
    }

    /// Prefix of the batched trial input files.
    pub fn input_prefix(&self) -> PathBuf {
        self.engine_path(INPUT_PREFIX)
    }
}
