//! Power sampling on a protocol host while a trial runs.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use harness_core::report::numeric_tokens;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::Transport;

/// Power samples collected over one trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyReport {
    pub samples: usize,
    pub mean_watts: f64,
    pub peak_watts: f64,
    pub duration: Duration,
}

impl EnergyReport {
    fn from_samples(samples: &[f64], duration: Duration) -> Self {
        if samples.is_empty() {
            return Self {
                duration,
                ..Default::default()
            };
        }

        Self {
            samples: samples.len(),
            mean_watts: samples.iter().sum::<f64>() / samples.len() as f64,
            peak_watts: samples.iter().copied().fold(f64::MIN, f64::max),
            duration,
        }
    }

    /// Energy estimate in joules, `None` without samples.
    pub fn joules(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.mean_watts * self.duration.as_secs_f64())
    }
}

/// Periodically runs a command printing the host's power draw in watts.
#[derive(Debug, Clone)]
pub struct EnergySampler {
    transport: Arc<dyn Transport>,
    command: String,
    interval: Duration,
}

impl EnergySampler {
    pub fn new(transport: Arc<dyn Transport>, command: impl Into<String>, interval: Duration) -> Self {
        Self {
            transport,
            command: command.into(),
            interval,
        }
    }

    /// Samples until `token` is cancelled. The report is available by
    /// awaiting the returned handle.
    pub fn spawn(&self, token: CancellationToken) -> JoinHandle<EnergyReport> {
        let sampler = self.clone();
        tokio::spawn(async move { sampler.sample_until(token).await })
    }

    async fn sample_until(self, token: CancellationToken) -> EnergyReport {
        let start = Instant::now();
        let mut samples = Vec::new();
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(watts) = self.sample().await {
                        samples.push(watts);
                    }
                }
            }
        }

        let report = EnergyReport::from_samples(&samples, start.elapsed());
        debug!(host = self.transport.host(), ?report, "energy sampling finished");
        report
    }

    async fn sample(&self) -> Option<f64> {
        let transport = self.transport.clone();
        let command = self.command.clone();
        let output = tokio::task::spawn_blocking(move || transport.execute(&command))
            .await
            .ok()?;

        match output {
            Ok(output) if output.success() => numeric_tokens(&output.stdout)
                .first()
                .and_then(|token| token.parse().ok()),
            Ok(output) => {
                warn!(exit_code = ?output.exit_code, stderr = %output.stderr.trim(), "power sample failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "power sample failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    #[tokio::test]
    async fn test_samples_until_cancelled() {
        let sampler = EnergySampler::new(
            Arc::new(LocalTransport),
            "echo 2.5 W",
            Duration::from_millis(20),
        );
        let token = CancellationToken::new();

        let handle = sampler.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        let report = handle.await.unwrap();

        assert!(report.samples > 0);
        assert_eq!(report.mean_watts, 2.5);
        assert_eq!(report.peak_watts, 2.5);
        let joules = report.joules().unwrap();
        assert!((joules - 2.5 * report.duration.as_secs_f64()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failing_command_yields_no_energy() {
        let sampler = EnergySampler::new(Arc::new(LocalTransport), "exit 1", Duration::from_millis(20));
        let token = CancellationToken::new();

        let handle = sampler.spawn(token.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.samples, 0);
        assert_eq!(report.joules(), None);
    }

    #[test]
    fn test_report_statistics() {
        let report = EnergyReport::from_samples(&[1.0, 3.0, 2.0], Duration::from_secs(2));

        assert_eq!(report.samples, 3);
        assert_eq!(report.mean_watts, 2.0);
        assert_eq!(report.peak_watts, 3.0);
        assert_eq!(report.joules(), Some(4.0));
    }
}
