//! Persistent trial dataset.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use csv::WriterBuilder;
use harness_core::{
    distance::is_match,
    report::{MetricsRecord, ReportError, ReportSchema},
};

/// Columns preceding the report fields.
pub const TRIAL_COLUMNS: [&str; 16] = [
    "ref_img",
    "img",
    "result",
    "expected_result",
    "cos_dist_np",
    "cos_dist_sfe",
    "total_time",
    "sfe_time",
    "extraction_time",
    "server_max_rss_kb",
    "client_max_rss_kb",
    "server_energy_j",
    "client_energy_j",
    "security_level",
    "mt_algorithm",
    "bit_width",
];

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write trial row: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to flush trial row: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("report v{0} does not match the dataset's report schema")]
    SchemaMismatch(u32),
    #[error("secure distance {0:?} is not a number")]
    InvalidDistance(Option<String>),
}

/// Trial facts that do not come from the engine report.
#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct TrialRow {
    #[builder(into)]
    pub ref_img: String,
    #[builder(into)]
    pub img: String,
    /// Whether both images show the same person.
    pub expected_result: bool,
    /// Plaintext cosine distance.
    pub cos_dist_np: f64,
    /// Seconds the secure computation took.
    pub sfe_time: f64,
    /// Seconds the probe embedding extraction took.
    pub extraction_time: f64,
    pub server_max_rss_kb: Option<u64>,
    pub client_max_rss_kb: Option<u64>,
    pub server_energy_j: Option<f64>,
    pub client_energy_j: Option<f64>,
    pub security_level: u32,
    pub mt_algorithm: u8,
    pub bit_width: u32,
}

/// Appends one row per successful trial to a CSV file.
///
/// The header is written only if the file is new or empty. Every row is
/// flushed as soon as it is written so an interrupted run keeps its rows.
pub struct TrialRecorder {
    path: PathBuf,
    schema: &'static ReportSchema,
    threshold: f64,
    writer: csv::Writer<File>,
    rows: usize,
}

impl TrialRecorder {
    pub fn open(
        path: impl Into<PathBuf>,
        schema: &'static ReportSchema,
        threshold: f64,
    ) -> Result<Self, RecorderError> {
        let path = path.into();
        let open_error = |source| RecorderError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(open_error)?;
        let is_empty = file.metadata().map_err(open_error)?.len() == 0;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if is_empty {
            writer.write_record(Self::columns(schema))?;
            writer.flush()?;
        }

        Ok(Self {
            path,
            schema,
            threshold,
            writer,
            rows: 0,
        })
    }

    /// All column names in order.
    pub fn columns(schema: &ReportSchema) -> impl Iterator<Item = &'static str> + '_ {
        TRIAL_COLUMNS.into_iter().chain(schema.field_names())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended by this recorder.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Parses `report` and appends a row for it. Nothing is written if the
    /// report does not parse.
    pub fn record_report(
        &mut self,
        row: &TrialRow,
        report: &str,
    ) -> Result<MetricsRecord, RecorderError> {
        let metrics = self.schema.parse(report)?;
        self.record(row, &metrics)?;
        Ok(metrics)
    }

    /// Appends a row for already parsed metrics.
    pub fn record(&mut self, row: &TrialRow, metrics: &MetricsRecord) -> Result<(), RecorderError> {
        if metrics.schema_version() != self.schema.version {
            return Err(RecorderError::SchemaMismatch(metrics.schema_version()));
        }
        let cos_dist_sfe = metrics.cos_dist_sfe().ok_or_else(|| {
            RecorderError::InvalidDistance(metrics.get(harness_core::report::FIELD_COS_DIST_SFE).map(String::from))
        })?;

        let fixed = [
            row.ref_img.clone(),
            row.img.clone(),
            is_match(cos_dist_sfe, self.threshold).to_string(),
            row.expected_result.to_string(),
            row.cos_dist_np.to_string(),
            cos_dist_sfe.to_string(),
            (row.sfe_time + row.extraction_time).to_string(),
            row.sfe_time.to_string(),
            row.extraction_time.to_string(),
            optional(row.server_max_rss_kb),
            optional(row.client_max_rss_kb),
            optional(row.server_energy_j),
            optional(row.client_energy_j),
            row.security_level.to_string(),
            row.mt_algorithm.to_string(),
            row.bit_width.to_string(),
        ];

        let record: Vec<&str> = fixed
            .iter()
            .map(String::as_str)
            .chain(metrics.iter().map(|(_, value)| value))
            .collect();
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        self.rows += 1;

        Ok(())
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::report::REPORT_SCHEMA_V1;

    fn row() -> TrialRow {
        TrialRow::builder()
            .ref_img("Alice/Alice_0001.jpg")
            .img("Bob/Bob_0002.jpg")
            .expected_result(false)
            .cos_dist_np(0.75)
            .sfe_time(1.5)
            .extraction_time(0.5)
            .server_max_rss_kb(2048)
            .security_level(128)
            .mt_algorithm(0)
            .bit_width(64)
            .build()
    }

    fn report(distance: f64) -> String {
        let mut text = String::new();
        for section in REPORT_SCHEMA_V1.sections {
            text.push_str(section.anchor);
            for _ in section.fields {
                text.push_str(" 7");
            }
            text.push('\n');
        }
        text.replace("cos_dist: 7", &format!("cos_dist: {distance}"))
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dfs/run.csv");

        let mut recorder = TrialRecorder::open(&path, &REPORT_SCHEMA_V1, 0.593).unwrap();
        recorder.record_report(&row(), &report(0.75)).unwrap();
        drop(recorder);

        let mut recorder = TrialRecorder::open(&path, &REPORT_SCHEMA_V1, 0.593).unwrap();
        recorder.record_report(&row(), &report(0.25)).unwrap();
        assert_eq!(recorder.rows(), 1);

        let lines = lines(&path);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ref_img,img,result,expected_result,cos_dist_np"));
        assert!(lines[0].ends_with("cos_dist_ver,cos_dist_sfe"));
        assert_eq!(lines[0].split(',').count(), 16 + 61);
        assert!(lines[1].starts_with("Alice/Alice_0001.jpg,Bob/Bob_0002.jpg,false,false,0.75,0.75,2,1.5,0.5,2048,,,,128,0,64,"));
        assert!(lines[2].starts_with("Alice/Alice_0001.jpg,Bob/Bob_0002.jpg,true,false,0.75,0.25,"));
        assert_eq!(lines[2].split(',').count(), 16 + 61);
    }

    #[test]
    fn test_unparsable_report_appends_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut recorder = TrialRecorder::open(&path, &REPORT_SCHEMA_V1, 0.593).unwrap();
        recorder.record_report(&row(), &report(0.5)).unwrap();

        let before = lines(&path).len();
        let empty = recorder.record_report(&row(), "");
        let truncated = recorder.record_report(&row(), "Timings:\nTotal = 1 ms");

        assert!(matches!(empty, Err(RecorderError::Report(ReportError::Empty))));
        assert!(matches!(truncated, Err(RecorderError::Report(_))));
        assert_eq!(lines(&path).len(), before);
        assert_eq!(recorder.rows(), 1);
    }
}
