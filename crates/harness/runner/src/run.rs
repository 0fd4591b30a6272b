//! The benchmark loop: subjects, probes and trials.

use std::{fmt, path::PathBuf};

use anyhow::{Context, Result};
use harness_core::{
    Embedding, Role,
    distance::{cosine_distance, is_match},
    input::{batch_input_path, format_pairs},
    report::{MetricsRecord, REPORT_SCHEMA_V1},
    resource::ResourceUsage,
    share::BitWidth,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::RunnerConfig,
    driver::{DriverOutput, ProtocolDriver, RoleCommand, TrialFailure},
    energy::{EnergyReport, EnergySampler},
    engine::EngineInvocation,
    extract::{CommandExtractor, ExtractError, Extractor, extract_first},
    party::Party,
    provision::{ProvisionError, ProvisionedSubject, Provisioner},
    recorder::{RecorderError, TrialRecorder, TrialRow},
    subjects::{Dataset, Image, probes_for},
};

/// Opens the configured dataset and runs the benchmark, appending to
/// `output`.
pub async fn run_benchmark(config: RunnerConfig, output: impl Into<PathBuf>) -> Result<RunSummary> {
    let root = config.run.dataset_root.clone();
    let dataset = Dataset::open(&root)
        .with_context(|| format!("failed to read dataset {}", root.display()))?;

    let mut runner = Runner::new(config, output)?;
    runner.run(&dataset).await
}

/// Counts of trial outcomes over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub subjects: usize,
    pub skipped_subjects: usize,
    pub skipped_probes: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub timed_out: usize,
    pub process_failed: usize,
    pub parse_failed: usize,
}

impl RunSummary {
    /// Counts one attempted trial.
    pub fn count(&mut self, failure: Option<&TrialFailure>) {
        self.attempted += 1;
        match failure {
            None => self.succeeded += 1,
            Some(TrialFailure::Timeout(_)) => self.timed_out += 1,
            Some(TrialFailure::Process { .. }) => self.process_failed += 1,
            Some(TrialFailure::Parse(_)) => self.parse_failed += 1,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} subjects ({} skipped), {}/{} trials succeeded, {} timed out, {} process errors, \
             {} parse errors, {} probes skipped",
            self.subjects,
            self.skipped_subjects,
            self.succeeded,
            self.attempted,
            self.timed_out,
            self.process_failed,
            self.parse_failed,
            self.skipped_probes
        )
    }
}

/// A probe ready to be compared against the provisioned reference.
struct Probe<'a> {
    image: &'a Image,
    embedding: Embedding,
    cos_dist_np: f64,
    extraction_time: f64,
}

/// Drives the benchmark for one protocol configuration.
pub struct Runner {
    config: RunnerConfig,
    width: BitWidth,
    server: Party,
    client: Party,
    driver: ProtocolDriver,
    extractor: Box<dyn Extractor + Send + Sync>,
    samplers: Option<[EnergySampler; 2]>,
    recorder: TrialRecorder,
    rng: ChaCha20Rng,
}

impl Runner {
    /// Creates a runner appending to the dataset at `output`.
    pub fn new(config: RunnerConfig, output: impl Into<PathBuf>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let width = config.protocol.bit_width()?;

        let server = Party::new(Role::Server, config.server.clone());
        let client = Party::new(Role::Client, config.client.clone());

        let extractor = CommandExtractor::new(
            server.transport().clone(),
            &config.server.project_dir,
            &config.extractor.command,
            &config.extractor.image_root,
            &config.extractor.output,
        );

        let samplers = config.energy.enabled.then(|| {
            [&server, &client].map(|party| {
                EnergySampler::new(
                    party.transport().clone(),
                    &config.energy.command,
                    config.energy.interval(),
                )
            })
        });

        let recorder = TrialRecorder::open(output, &REPORT_SCHEMA_V1, config.protocol.threshold)
            .context("failed to open trial dataset")?;

        let rng = match config.run.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_os_rng(),
        };

        Ok(Self {
            driver: ProtocolDriver::new(config.protocol.timeout()),
            config,
            width,
            server,
            client,
            extractor: Box::new(extractor),
            samplers,
            recorder,
            rng,
        })
    }

    /// Replaces the embedding extractor.
    pub fn with_extractor(mut self, extractor: impl Extractor + Send + Sync + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn recorder(&self) -> &TrialRecorder {
        &self.recorder
    }

    /// Runs every configured subject of `dataset`.
    ///
    /// Failures of single trials, probes or subjects are logged and counted.
    /// Transport and dataset errors end the run.
    pub async fn run(&mut self, dataset: &Dataset) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let people = dataset.subjects(self.config.run.starting_person, self.config.run.nr_of_people);
        info!(people = people.len(), "running benchmark");
        debug!("config:\n{}", self.config);

        let mut provisioner = Provisioner::new(
            self.server.clone(),
            self.client.clone(),
            self.width,
            ChaCha20Rng::from_rng(&mut self.rng),
        );

        for (count, person) in people.iter().enumerate() {
            info!(subject = %person.name, "subject {}/{}", count + 1, people.len());
            summary.subjects += 1;

            let (idx, reference) =
                match extract_first(&*self.extractor, &person.images, self.config.extractor.attempts) {
                    Ok(found) => found,
                    Err(ExtractError::Transport(e)) => return Err(e.into()),
                    Err(e) => {
                        warn!(subject = %person.name, error = %e, "no usable reference image, skipping subject");
                        summary.skipped_subjects += 1;
                        continue;
                    }
                };
            let reference_image = &person.images[idx];
            debug!(subject = %person.name, image = %reference_image.path.display(), "reference image");

            let probes = probes_for(dataset, person, reference_image, &mut self.rng);

            let subject = match provisioner.provision(&person.name, reference.embedding) {
                Ok(subject) => subject,
                Err(ProvisionError::Transport(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(subject = %person.name, error = %e, "could not share reference, skipping subject");
                    summary.skipped_subjects += 1;
                    continue;
                }
            };

            self.run_subject(&subject, reference_image, &probes, &mut summary)
                .await?;
        }

        info!(%summary, path = %self.recorder.path().display(), "run finished");
        Ok(summary)
    }

    async fn run_subject(
        &mut self,
        subject: &ProvisionedSubject<'_>,
        reference_image: &Image,
        probes: &[Image],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let total = probes.len();
        for (chunk_idx, chunk) in probes.chunks(self.config.protocol.batch_size).enumerate() {
            let mut ready = Vec::with_capacity(chunk.len());
            for image in chunk {
                match self.prepare_probe(subject, image) {
                    Ok(probe) => ready.push(probe),
                    Err(ExtractError::Transport(e)) => return Err(e.into()),
                    Err(e) => {
                        warn!(subject = subject.subject(), probe = %image.path.display(), error = %e, "skipping probe");
                        summary.skipped_probes += 1;
                    }
                }
            }
            if ready.is_empty() {
                continue;
            }

            let done = (chunk_idx * self.config.protocol.batch_size + chunk.len()).min(total);
            self.run_trial(subject, reference_image, &ready, summary)
                .await?;
            info!(subject = subject.subject(), "{done}/{total} probes");
        }

        Ok(())
    }

    fn prepare_probe<'a>(
        &self,
        subject: &ProvisionedSubject<'_>,
        image: &'a Image,
    ) -> Result<Probe<'a>, ExtractError> {
        let extraction = self.extractor.extract(&image.path)?;
        let cos_dist_np = cosine_distance(&extraction.embedding, subject.reference())
            .map_err(|source| ExtractError::Distance {
                image: image.path.clone(),
                source,
            })?;

        Ok(Probe {
            image,
            embedding: extraction.embedding,
            cos_dist_np,
            extraction_time: extraction.seconds,
        })
    }

    /// Runs one engine invocation covering `probes` and records the results.
    async fn run_trial(
        &mut self,
        subject: &ProvisionedSubject<'_>,
        reference_image: &Image,
        probes: &[Probe<'_>],
        summary: &mut RunSummary,
    ) -> Result<()> {
        let batched = self.config.protocol.batch_size > 1;
        self.write_inputs(subject, probes, batched)?;

        let commands = [&self.server, &self.client].map(|party| RoleCommand {
            role: party.role(),
            transport: party.transport().clone(),
            command: self.invocation(party, subject, batched.then_some(probes.len())).command_line(),
        });
        let [server_cmd, client_cmd] = &commands;

        let token = CancellationToken::new();
        let sampling = self
            .samplers
            .as_ref()
            .map(|samplers| samplers.each_ref().map(|sampler| sampler.spawn(token.clone())));

        let output = self.driver.run(server_cmd, client_cmd).await;

        token.cancel();
        let energy = match sampling {
            Some([server, client]) => [server.await.ok(), client.await.ok()],
            None => [None, None],
        };
        let output = output?;
        info!(
            subject = subject.subject(),
            elapsed = ?output.elapsed,
            "secure computation finished"
        );

        let report = match output.report() {
            Ok(report) => report,
            Err(failure) => {
                for probe in probes {
                    log_failure(subject, probe, &failure);
                    summary.count(Some(&failure));
                }
                return Ok(());
            }
        };

        let sfe_time = output.elapsed.as_secs_f64() / probes.len() as f64;
        let base = TrialContext {
            output: &output,
            energy: &energy,
            sfe_time,
        };

        if !batched {
            let probe = &probes[0];
            let row = self.row(reference_image, probe, &base);
            match self.recorder.record_report(&row, report) {
                Ok(metrics) => {
                    log_success(subject, probe, &metrics, self.config.protocol.threshold);
                    summary.count(None);
                }
                Err(RecorderError::Report(e)) => {
                    let failure = TrialFailure::Parse(e);
                    log_failure(subject, probe, &failure);
                    summary.count(Some(&failure));
                }
                Err(e) => return Err(e).context("failed to record trial"),
            }
            return Ok(());
        }

        let segments = match REPORT_SCHEMA_V1.parse_batch_exact(report, probes.len()) {
            Ok(segments) => segments,
            Err(e) => {
                let failure = TrialFailure::Parse(e);
                for probe in probes {
                    log_failure(subject, probe, &failure);
                    summary.count(Some(&failure));
                }
                return Ok(());
            }
        };

        for (probe, segment) in probes.iter().zip(segments) {
            match segment {
                Ok(metrics) => {
                    let row = self.row(reference_image, probe, &base);
                    self.recorder
                        .record(&row, &metrics)
                        .context("failed to record trial")?;
                    log_success(subject, probe, &metrics, self.config.protocol.threshold);
                    summary.count(None);
                }
                Err(e) => {
                    let failure = TrialFailure::Parse(e);
                    log_failure(subject, probe, &failure);
                    summary.count(Some(&failure));
                }
            }
        }

        Ok(())
    }

    fn write_inputs(
        &self,
        subject: &ProvisionedSubject<'_>,
        probes: &[Probe<'_>],
        batched: bool,
    ) -> Result<()> {
        for party in [&self.server, &self.client] {
            for (idx, probe) in probes.iter().enumerate() {
                let pairs = format_pairs(&probe.embedding, subject.reference())
                    .context("probe and reference differ in length")?;
                let path = if batched {
                    batch_input_path(&party.input_prefix(), idx)
                } else {
                    party.input_path()
                };
                party
                    .transport()
                    .write_file(&path, pairs.as_bytes())
                    .with_context(|| format!("failed to write input for {}", party.role()))?;
            }
        }

        Ok(())
    }

    fn invocation(
        &self,
        party: &Party,
        subject: &ProvisionedSubject<'_>,
        batch: Option<usize>,
    ) -> EngineInvocation {
        let host = party.host();
        let protocol = &self.config.protocol;

        EngineInvocation::builder()
            .role(party.role())
            .working_dir(host.executable_dir.clone())
            .executable(party.engine_path(&host.executable_name))
            .server_address(self.server.host().address.clone())
            .port(protocol.port)
            .input(match batch {
                Some(_) => party.input_prefix(),
                None => party.input_path(),
            })
            .share(subject.share_path(party.role()).clone())
            .bit_width(self.width)
            .output_dir(host.circuit_dir.clone())
            .security_level(protocol.security_level)
            .mt_algorithm(protocol.mt_algorithm)
            .maybe_batch(batch)
            .niceness(protocol.niceness)
            .measure_resources(protocol.measure_resources)
            .build()
    }

    fn row(&self, reference_image: &Image, probe: &Probe<'_>, ctx: &TrialContext<'_>) -> TrialRow {
        let protocol = &self.config.protocol;
        let max_rss = |role: Role| {
            protocol
                .measure_resources
                .then(|| ResourceUsage::parse(&ctx.output.role(role).stderr).max_rss_kb())
                .flatten()
        };
        let joules = |idx: usize| ctx.energy[idx].as_ref().and_then(EnergyReport::joules);

        TrialRow::builder()
            .ref_img(reference_image.path.display().to_string())
            .img(probe.image.path.display().to_string())
            .expected_result(reference_image.person == probe.image.person)
            .cos_dist_np(probe.cos_dist_np)
            .sfe_time(ctx.sfe_time)
            .extraction_time(probe.extraction_time)
            .maybe_server_max_rss_kb(max_rss(Role::Server))
            .maybe_client_max_rss_kb(max_rss(Role::Client))
            .maybe_server_energy_j(joules(0))
            .maybe_client_energy_j(joules(1))
            .security_level(protocol.security_level)
            .mt_algorithm(protocol.mt_algorithm)
            .bit_width(self.width.bits())
            .build()
    }
}

/// Per-invocation measurements shared by all probes of a trial.
struct TrialContext<'a> {
    output: &'a DriverOutput,
    energy: &'a [Option<EnergyReport>; 2],
    sfe_time: f64,
}

fn log_success(
    subject: &ProvisionedSubject<'_>,
    probe: &Probe<'_>,
    metrics: &MetricsRecord,
    threshold: f64,
) {
    let cos_dist_sfe = metrics.cos_dist_sfe();
    info!(
        subject = subject.subject(),
        probe = %probe.image.path.display(),
        outcome = "success",
        cos_dist_np = probe.cos_dist_np,
        ?cos_dist_sfe,
        matched = cos_dist_sfe.is_some_and(|d| is_match(d, threshold)),
        "trial finished"
    );
}

fn log_failure(subject: &ProvisionedSubject<'_>, probe: &Probe<'_>, failure: &TrialFailure) {
    error!(
        subject = subject.subject(),
        probe = %probe.image.path.display(),
        outcome = failure.kind(),
        error = %failure,
        "trial failed"
    );
}
