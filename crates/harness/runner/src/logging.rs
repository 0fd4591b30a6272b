use std::{fs, str::FromStr, sync::Mutex};

use anyhow::{Context, Result};
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogConfig, LogFormat};

fn format_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let f = fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => f.compact().boxed(),
        LogFormat::Json => f.json().boxed(),
    }
}

fn file_layer<S>(file: fs::File) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .boxed()
}

/// Returns the filter directives for `config`.
pub fn directives(config: &LogConfig) -> Result<String> {
    match &config.filter {
        Some(filter) => Ok(filter.clone()),
        None => {
            let level = Level::from_str(&config.level)
                .with_context(|| format!("invalid log level {:?}", config.level))?;
            Ok(format!(
                "pffrocd_runner={level},harness_runner={level},harness_core={level}"
            ))
        }
    }
}

/// Installs the global subscriber. When a log directory is configured, the
/// run is also logged to `<dir>/<run_id>.log`.
pub fn init_tracing(config: &LogConfig, run_id: &str) -> Result<()> {
    let filter_layer = EnvFilter::builder()
        .parse(directives(config)?)
        .context("invalid log filter")?;

    let file = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let path = dir.join(format!("{run_id}.log"));
            let file = fs::File::create(&path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            Some(file_layer(file))
        }
        None => None,
    };

    Registry::default()
        .with(filter_layer)
        .with(format_layer(config.format))
        .with(file)
        .try_init()?;

    Ok(())
}
