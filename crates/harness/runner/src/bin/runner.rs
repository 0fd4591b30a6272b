use std::{fs, path::Path};

use anyhow::{Context, Result};
use clap::Parser;
use harness_core::{
    input::parse_vector,
    report::REPORT_SCHEMA_V1,
    share::{BitWidth, create_shares},
};
use harness_runner::{
    RunnerConfig,
    cli::{Cli, Command},
    config::{LogConfig, MT_ALGORITHMS, SECURITY_LEVELS},
    logging::init_tracing,
    run_benchmark, run_id,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let run_id = run_id();

    match cli.command {
        Command::Run { overrides } => {
            let mut config = load_config(&cli.config)?;
            overrides.apply(&mut config);
            config.validate()?;
            init_tracing(&config.log, &run_id)?;

            let output = config.run.output_dir.join(format!("{run_id}.csv"));
            let summary = run_benchmark(config, &output).await?;
            println!("{summary}");
        }
        Command::Sweep {
            bit_width,
            batch_size,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(bit_width) = bit_width {
                config.protocol.bit_width = bit_width;
            }
            if let Some(batch_size) = batch_size {
                config.protocol.batch_size = batch_size;
            }
            config.validate()?;
            init_tracing(&config.log, &run_id)?;

            for security_level in SECURITY_LEVELS {
                for mt_algorithm in MT_ALGORITHMS {
                    info!(security_level, mt_algorithm, "running combination");

                    let mut config = config.clone();
                    config.protocol.security_level = security_level;
                    config.protocol.mt_algorithm = mt_algorithm;
                    let output = config
                        .run
                        .output_dir
                        .join(format!("{run_id}_sec{security_level}_mt{mt_algorithm}.csv"));

                    let summary = run_benchmark(config, &output).await?;
                    println!("security level {security_level}, mt algorithm {mt_algorithm}: {summary}");
                }
            }
        }
        Command::Parse { path } => {
            init_tracing(&quiet_log(), &run_id)?;

            let text = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut records = Vec::new();
            for (idx, result) in REPORT_SCHEMA_V1.parse_batch_indexed(&text) {
                match result {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(segment = idx, error = %e, "skipping malformed report"),
                }
            }

            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Shares {
            embedding,
            out_dir,
            bit_width,
            seed,
        } => {
            init_tracing(&quiet_log(), &run_id)?;

            let width = BitWidth::try_from(bit_width)?;
            let text = fs::read_to_string(&embedding)
                .with_context(|| format!("failed to read {}", embedding.display()))?;
            let vector = parse_vector(&text).context("invalid embedding")?;

            let mut rng = match seed {
                Some(seed) => ChaCha20Rng::seed_from_u64(seed),
                None => ChaCha20Rng::from_os_rng(),
            };
            let shares = create_shares(&vector, width, &mut rng)?;

            fs::create_dir_all(&out_dir)
                .with_context(|| format!("failed to create {}", out_dir.display()))?;
            for (name, share) in [("share0.txt", &shares.share0), ("share1.txt", &shares.share1)] {
                let path = out_dir.join(name);
                fs::write(&path, share.to_text())
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RunnerConfig> {
    RunnerConfig::load(path).context("failed to load configuration")
}

/// Logging for the utility commands: warnings on stderr, no log file.
fn quiet_log() -> LogConfig {
    LogConfig {
        level: "warn".to_string(),
        dir: None,
        ..Default::default()
    }
}
