use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::RunnerConfig;

#[derive(Parser)]
#[command(version, about, name = "pffrocd-runner", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Configuration path.
    #[arg(short, long, default_value = "pffrocd.toml", env = "PFFROCD_CONFIG", global = true)]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Command {
    /// runs the benchmark for one protocol configuration.
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// runs the benchmark for every security level and multiplication triple
    /// algorithm, writing one dataset per combination.
    Sweep {
        /// Bit width override.
        #[arg(long)]
        bit_width: Option<u32>,
        /// Batch size override.
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// parses an engine report and prints its records as JSON.
    Parse {
        /// File holding the engine's stdout.
        path: PathBuf,
    },
    /// splits an embedding into two shares.
    Shares {
        /// File holding the embedding, one value per line.
        embedding: PathBuf,
        /// Directory receiving share0.txt and share1.txt.
        #[arg(long)]
        out_dir: PathBuf,
        /// Bit width of the shares.
        #[arg(short, long, default_value = "64")]
        bit_width: u32,
        /// Seed for reproducible shares.
        #[arg(long)]
        seed: Option<u64>,
    },
}

/// Protocol settings that override the configuration file.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Security parameter (80, 112 or 128).
    #[arg(short, long)]
    pub security_level: Option<u32>,
    /// Multiplication triple algorithm (0 = OT, 1 = Paillier, 2 = DGK).
    #[arg(short, long)]
    pub mt_algorithm: Option<u8>,
    /// Bit width of the reference shares (16, 32 or 64).
    #[arg(short, long)]
    pub bit_width: Option<u32>,
    /// Number of probes per engine invocation.
    #[arg(long)]
    pub batch_size: Option<usize>,
}

impl Overrides {
    pub fn apply(&self, config: &mut RunnerConfig) {
        let protocol = &mut config.protocol;
        if let Some(security_level) = self.security_level {
            protocol.security_level = security_level;
        }
        if let Some(mt_algorithm) = self.mt_algorithm {
            protocol.mt_algorithm = mt_algorithm;
        }
        if let Some(bit_width) = self.bit_width {
            protocol.bit_width = bit_width;
        }
        if let Some(batch_size) = self.batch_size {
            protocol.batch_size = batch_size;
        }
    }
}
