//! Core logic of the privacy-preserving face verification benchmark.
//!
//! Nothing in this crate touches processes, hosts or the filesystem. It
//! splits reference embeddings into XOR shares, encodes the engine's input
//! files, parses the engine's benchmark report and computes the plaintext
//! baseline distance.

pub mod distance;
pub mod input;
pub mod report;
pub mod resource;
pub mod share;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed-length face feature vector produced by the external extractor.
pub type Embedding = Vec<f64>;

/// Cosine distance below which two faces are considered a match (SFace).
pub const DEFAULT_THRESHOLD: f64 = 0.593;

/// Which of the two protocol participants a process instance plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Role 0, the verifying party. Holds share 0 and produces the
    /// authoritative report.
    Server,
    /// Role 1, the subject-hosting party. Holds share 1.
    Client,
}

impl Role {
    /// Both roles, ordered by id.
    pub const ALL: [Role; 2] = [Role::Server, Role::Client];

    /// Returns the numeric role id passed to the engine.
    pub fn id(&self) -> u8 {
        match self {
            Role::Server => 0,
            Role::Client => 1,
        }
    }

    /// Returns `true` if this role's report is the one that gets recorded.
    pub fn is_authoritative(&self) -> bool {
        matches!(self, Role::Server)
    }
}

impl TryFrom<u8> for Role {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Role::Server),
            1 => Ok(Role::Client),
            _ => Err("role must be 0 or 1"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "role 0 (server)"),
            Role::Client => write!(f, "role 1 (client)"),
        }
    }
}
