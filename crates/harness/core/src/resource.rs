//! Resource usage reported by `/usr/bin/time -v` on stderr.

use std::collections::BTreeMap;

use serde::Serialize;

const MAX_RSS: &str = "Maximum resident set size (kbytes)";
const USER_TIME: &str = "User time (seconds)";
const SYSTEM_TIME: &str = "System time (seconds)";
const CPU_PERCENT: &str = "Percent of CPU this job got";
const ELAPSED: &str = "Elapsed (wall clock) time (h:mm:ss or m:ss)";
const EXIT_STATUS: &str = "Exit status";

/// `key: value` entries of one `time -v` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    entries: BTreeMap<String, String>,
}

impl ResourceUsage {
    /// Collects every tab-indented `key: value` line. Other stderr output of
    /// the timed program is skipped.
    pub fn parse(stderr: &str) -> Self {
        let entries = stderr
            .lines()
            .filter(|line| line.starts_with('\t'))
            .filter_map(|line| line.trim().split_once(": "))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        Self { entries }
    }

    /// Returns `true` if no entries were found.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a raw entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Peak resident set size in kilobytes.
    pub fn max_rss_kb(&self) -> Option<u64> {
        self.get(MAX_RSS)?.parse().ok()
    }

    pub fn user_time_secs(&self) -> Option<f64> {
        self.get(USER_TIME)?.parse().ok()
    }

    pub fn system_time_secs(&self) -> Option<f64> {
        self.get(SYSTEM_TIME)?.parse().ok()
    }

    pub fn cpu_percent(&self) -> Option<f64> {
        self.get(CPU_PERCENT)?.trim_end_matches('%').parse().ok()
    }

    /// Wall clock time in seconds, from `h:mm:ss` or `m:ss.ss`.
    pub fn elapsed_secs(&self) -> Option<f64> {
        self.get(ELAPSED)?
            .split(':')
            .try_fold(0.0, |acc, part| Some(acc * 60.0 + part.parse::<f64>().ok()?))
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.get(EXIT_STATUS)?.parse().ok()
    }
}
