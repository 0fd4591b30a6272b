//! One-time delivery of a subject's reference shares to both parties.

use std::path::PathBuf;

use harness_core::{
    Embedding, Role,
    share::{BitWidth, SharePair, ShareError, create_shares},
};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info};

use crate::{
    party::Party,
    transport::TransportError,
};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to create shares: {0}")]
    Share(#[from] ShareError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Writes reference shares: share 0 to the server, share 1 to the client.
///
/// Provisioning borrows the provisioner mutably for as long as the returned
/// [`ProvisionedSubject`] lives, so shares cannot be rewritten while trials
/// read them.
#[derive(Debug)]
pub struct Provisioner {
    parties: [Party; 2],
    width: BitWidth,
    rng: ChaCha20Rng,
    share_paths: [PathBuf; 2],
}

impl Provisioner {
    pub fn new(server: Party, client: Party, width: BitWidth, rng: ChaCha20Rng) -> Self {
        let share_paths = [server.share_path(), client.share_path()];
        Self {
            parties: [server, client],
            width,
            rng,
            share_paths,
        }
    }

    /// Splits `reference` and writes each share to its party.
    pub fn provision(
        &mut self,
        subject: &str,
        reference: Embedding,
    ) -> Result<ProvisionedSubject<'_>, ProvisionError> {
        let shares = create_shares(&reference, self.width, &mut self.rng)?;

        for party in &self.parties {
            let share = shares.for_role(party.role());
            let path = &self.share_paths[party.role().id() as usize];
            party
                .transport()
                .write_file(path, share.to_text().as_bytes())?;
            debug!(subject, role = %party.role(), path = %path.display(), "wrote share");
        }
        info!(subject, width = %self.width, "provisioned reference shares");

        Ok(ProvisionedSubject {
            subject: subject.to_string(),
            reference,
            shares,
            share_paths: &self.share_paths,
        })
    }
}

/// A subject whose shares are in place on both parties.
#[derive(Debug)]
pub struct ProvisionedSubject<'a> {
    subject: String,
    reference: Embedding,
    shares: SharePair,
    share_paths: &'a [PathBuf; 2],
}

impl ProvisionedSubject<'_> {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// The plaintext reference embedding, used for the baseline distance.
    pub fn reference(&self) -> &Embedding {
        &self.reference
    }

    pub fn shares(&self) -> &SharePair {
        &self.shares
    }

    /// Path of the share held by `role`.
    pub fn share_path(&self, role: Role) -> &PathBuf {
        &self.share_paths[role.id() as usize]
    }
}
