use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use harness_core::{
    DEFAULT_THRESHOLD,
    share::{BitWidth, ShareError},
};
use serde::{Deserialize, Serialize};

/// Security parameters the engine supports.
pub const SECURITY_LEVELS: [u32; 3] = [80, 112, 128];

/// Multiplication triple generation algorithms: 0 = OT, 1 = Paillier,
/// 2 = DGK.
pub const MT_ALGORITHMS: [u8; 3] = [0, 1, 2];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unsupported security level {0}, expected one of 80, 112, 128")]
    SecurityLevel(u32),
    #[error("unsupported multiplication triple algorithm {0}, expected 0 (OT), 1 (Paillier) or 2 (DGK)")]
    MtAlgorithm(u8),
    #[error("invalid bit width: {0}")]
    BitWidth(#[source] ShareError),
    #[error("batch size must be at least 1")]
    BatchSize,
    #[error("protocol timeout must be positive")]
    Timeout,
    #[error("niceness {0} is outside -20..=19")]
    Niceness(i32),
    #[error("match threshold {0} is outside [0, 2]")]
    Threshold(f64),
    #[error("number of people must be at least 1")]
    People,
    #[error("extractor command must contain {{image}} and {{output}}")]
    ExtractorCommand,
    #[error("extraction attempts must be at least 1")]
    ExtractorAttempts,
    #[error("energy sampling interval must be positive")]
    EnergyInterval,
    #[error("{role} host: {reason}")]
    Host { role: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Ssh,
    Local,
}

/// One of the two machines running the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub transport: TransportKind,
    /// Address of the host. The server's address is also the rendezvous
    /// address passed to both engine roles.
    pub address: String,
    pub username: Option<String>,
    /// Private key used by ssh.
    pub private_key: Option<PathBuf>,
    /// Directory holding the engine executable. Input and share files are
    /// written here.
    pub executable_dir: PathBuf,
    pub executable_name: String,
    /// Circuit directory passed to the engine.
    pub circuit_dir: PathBuf,
    /// Checkout of this project on the host. The extractor runs here.
    pub project_dir: PathBuf,
}

impl HostConfig {
    fn local() -> Self {
        Self {
            transport: TransportKind::Local,
            address: "127.0.0.1".to_string(),
            username: None,
            private_key: None,
            executable_dir: PathBuf::from("ABY/build/bin"),
            executable_name: "cos_dist_float_scen_simd".to_string(),
            circuit_dir: PathBuf::from("ABY/bin/circ"),
            project_dir: PathBuf::from("."),
        }
    }

    fn validate(&self, role: &'static str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Host {
            role,
            reason: reason.to_string(),
        };

        if self.address.trim().is_empty() {
            return Err(invalid("address is empty"));
        }
        if self.executable_name.trim().is_empty() {
            return Err(invalid("executable name is empty"));
        }
        if self.transport == TransportKind::Ssh && self.username.is_none() {
            return Err(invalid("ssh transport requires a username"));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub security_level: u32,
    pub mt_algorithm: u8,
    /// Width of the floats the reference shares are computed at.
    pub bit_width: u32,
    /// Number of probes per engine invocation.
    pub batch_size: usize,
    pub port: u16,
    /// Seconds both roles have to finish.
    pub timeout: u64,
    /// Scheduling priority of the engine processes. Negative values need
    /// passwordless sudo on the host.
    pub niceness: i32,
    /// Wraps the engine in `/usr/bin/time -v`.
    pub measure_resources: bool,
    pub threshold: f64,
}

impl ProtocolConfig {
    pub fn bit_width(&self) -> Result<BitWidth, ConfigError> {
        BitWidth::try_from(self.bit_width).map_err(ConfigError::BitWidth)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            security_level: 128,
            mt_algorithm: 0,
            bit_width: 64,
            batch_size: 1,
            port: 7766,
            timeout: 600,
            niceness: 0,
            measure_resources: false,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Local copy of the image dataset, laid out as `<root>/<person>/<image>`.
    pub dataset_root: PathBuf,
    /// Index of the first person to run for.
    pub starting_person: usize,
    pub nr_of_people: usize,
    /// Directory the trial datasets are written to.
    pub output_dir: PathBuf,
    /// Seed for share creation and probe selection. Drawn from the OS if
    /// unset.
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset_root: PathBuf::from("lfw"),
            starting_person: 0,
            nr_of_people: 10,
            output_dir: PathBuf::from("dfs"),
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Command run on the server host. `{image}` and `{output}` are replaced
    /// with the image path and the embedding output path.
    pub command: String,
    /// Dataset location on the server host.
    pub image_root: PathBuf,
    /// Embedding output path on the server host.
    pub output: PathBuf,
    /// Reference images tried per person before the person is skipped.
    pub attempts: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            command: "env/bin/python pyscripts/extract_embedding.py -i {image} -o {output}"
                .to_string(),
            image_root: PathBuf::from("lfw"),
            output: PathBuf::from("embedding.txt"),
            attempts: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub enabled: bool,
    /// Command printing the instantaneous power draw in watts.
    pub command: String,
    /// Milliseconds between samples.
    pub interval: u64,
}

impl EnergyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "cat /sys/class/power_supply/BAT0/power_now | awk '{print $1 / 1000000}'"
                .to_string(),
            interval: 500,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level of the default filter,
    /// `harness_runner=<level>,harness_core=<level>`.
    pub level: String,
    /// Custom `EnvFilter` directives, overriding `level`.
    pub filter: Option<String>,
    pub format: LogFormat,
    /// Directory receiving one log file per run.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            filter: None,
            format: LogFormat::Compact,
            dir: Some(PathBuf::from("log")),
        }
    }
}

/// Runner configuration.
///
/// The server host plays role 0 and produces the recorded report, the client
/// host plays role 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub server: HostConfig,
    pub client: HostConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub energy: EnergyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl RunnerConfig {
    /// Loads a configuration file without validating it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every value the run depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate("server")?;
        self.client.validate("client")?;

        let protocol = &self.protocol;
        if !SECURITY_LEVELS.contains(&protocol.security_level) {
            return Err(ConfigError::SecurityLevel(protocol.security_level));
        }
        if !MT_ALGORITHMS.contains(&protocol.mt_algorithm) {
            return Err(ConfigError::MtAlgorithm(protocol.mt_algorithm));
        }
        protocol.bit_width()?;
        if protocol.batch_size == 0 {
            return Err(ConfigError::BatchSize);
        }
        if protocol.timeout == 0 {
            return Err(ConfigError::Timeout);
        }
        if !(-20..=19).contains(&protocol.niceness) {
            return Err(ConfigError::Niceness(protocol.niceness));
        }
        if !(0.0..=2.0).contains(&protocol.threshold) {
            return Err(ConfigError::Threshold(protocol.threshold));
        }

        if self.run.nr_of_people == 0 {
            return Err(ConfigError::People);
        }

        if !self.extractor.command.contains("{image}") || !self.extractor.command.contains("{output}")
        {
            return Err(ConfigError::ExtractorCommand);
        }
        if self.extractor.attempts == 0 {
            return Err(ConfigError::ExtractorAttempts);
        }

        if self.energy.enabled && self.energy.interval == 0 {
            return Err(ConfigError::EnergyInterval);
        }

        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            server: HostConfig::local(),
            client: HostConfig::local(),
            protocol: ProtocolConfig::default(),
            run: RunConfig::default(),
            extractor: ExtractorConfig::default(),
            energy: EnergyConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl fmt::Display for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = toml::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    const CONFIG: &str = r#"
[server]
address = "192.168.5.114"
username = "bench"
private_key = "/home/bench/.ssh/id_pffrocd"
executable_dir = "/home/bench/pffrocd/ABY/build/bin"
executable_name = "cos_dist_float_scen_simd"
circuit_dir = "/home/bench/pffrocd/ABY/bin/circ/"
project_dir = "/home/bench/pffrocd"

[client]
transport = "local"
address = "127.0.0.1"
executable_dir = "ABY/build/bin"
executable_name = "cos_dist_float_scen_simd"
circuit_dir = "ABY/bin/circ/"
project_dir = "."

[protocol]
security_level = 112
mt_algorithm = 2
bit_width = 32
batch_size = 4
port = 7766
timeout = 120
niceness = -20
measure_resources = true
threshold = 0.593
"#;

    #[test]
    fn test_parse_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pffrocd.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let config = RunnerConfig::load(&path).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.transport, TransportKind::Ssh);
        assert_eq!(config.client.transport, TransportKind::Local);
        assert_eq!(config.protocol.bit_width().unwrap(), BitWidth::Single);
        assert_eq!(config.protocol.timeout(), Duration::from_secs(120));
        assert_eq!(config.run, RunConfig::default());
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_display_round_trips() {
        let config = RunnerConfig::default();

        let parsed: RunnerConfig = toml::from_str(&config.to_string()).unwrap();

        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            RunnerConfig::load(Path::new("/nonexistent/pffrocd.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[rstest]
    #[case::bit_width(|c: &mut RunnerConfig| c.protocol.bit_width = 8)]
    #[case::security_level(|c: &mut RunnerConfig| c.protocol.security_level = 100)]
    #[case::mt_algorithm(|c: &mut RunnerConfig| c.protocol.mt_algorithm = 3)]
    #[case::batch_size(|c: &mut RunnerConfig| c.protocol.batch_size = 0)]
    #[case::timeout(|c: &mut RunnerConfig| c.protocol.timeout = 0)]
    #[case::niceness(|c: &mut RunnerConfig| c.protocol.niceness = -21)]
    #[case::threshold(|c: &mut RunnerConfig| c.protocol.threshold = f64::NAN)]
    #[case::people(|c: &mut RunnerConfig| c.run.nr_of_people = 0)]
    #[case::extractor(|c: &mut RunnerConfig| c.extractor.command = "extract {image}".into())]
    #[case::ssh_user(|c: &mut RunnerConfig| c.server.transport = TransportKind::Ssh)]
    fn test_invalid_config(#[case] edit: fn(&mut RunnerConfig)) {
        let mut config = RunnerConfig::default();
        config.validate().unwrap();

        edit(&mut config);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_bit_width_is_reported() {
        let mut config = RunnerConfig::default();
        config.protocol.bit_width = 128;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::BitWidth(ShareError::UnsupportedBitWidth(128)))
        ));
    }
}
