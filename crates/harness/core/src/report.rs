//! Parser for the secure computation engine's benchmark report.
//!
//! The report carries no machine-readable labels for its values, so the
//! mapping from numbers to field names is positional. To keep a change in the
//! engine's output from silently shifting every value into the wrong column,
//! the layout is pinned by a versioned [`ReportSchema`]: the report is cut
//! into sections at fixed anchor strings, the anchors must appear in schema
//! order, and every section must contain exactly the number of numeric
//! tokens the schema declares for it.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, ser::SerializeMap};

/// Marker the engine prints between reports of a batched run.
pub const BATCH_DELIMITER: &str = "split here";

/// Field holding the distance recomputed in plaintext by the engine.
pub const FIELD_COS_DIST_VER: &str = "cos_dist_ver";
/// Field holding the distance computed under the secure protocol.
pub const FIELD_COS_DIST_SFE: &str = "cos_dist_sfe";

static NUMERIC_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[-+]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][-+]?\d+)?").expect("token pattern is valid")
});

/// A contiguous block of the report, starting at `anchor`.
#[derive(Debug, Clone, Copy)]
pub struct Section {
    pub anchor: &'static str,
    pub fields: &'static [&'static str],
}

/// Layout of one engine report version.
#[derive(Debug, Clone, Copy)]
pub struct ReportSchema {
    pub version: u32,
    pub sections: &'static [Section],
}

/// Report layout of the cosine distance engine, version 1.
pub static REPORT_SCHEMA_V1: ReportSchema = ReportSchema {
    version: 1,
    sections: &[
        Section {
            anchor: "Boolean Sharing: local gates",
            fields: &[
                "bool_local_gates",
                "bool_interactive_gates",
                "bool_layer_finish",
                "yao_local_gates",
                "yao_interactive_gates",
                "yao_layer_finish",
                "yao_rev_local_gates",
                "yao_rev_interactive_gates",
                "yao_rev_layer_finish",
                "arith_local_gates",
                "arith_interactive_gates",
                "arith_layer_finish",
                "splut_local_gates",
                "splut_interactive_gates",
                "splut_layer_finish",
                "online_communication",
            ],
        },
        Section {
            anchor: "Complexities:",
            fields: &[
                "bool_ands",
                "bool_depth",
                "bool_total_vec_and",
                "bool_total_nonvec_and",
                "bool_xor_vals",
                "bool_xor_gates",
                "bool_comb_vals",
                "bool_comb_gates",
                "bool_combstruct_vals",
                "bool_combstruct_gates",
                "bool_perm_vals",
                "bool_perm_gates",
                "bool_subst_vals",
                "bool_subst_gates",
                "bool_split_vals",
                "bool_split_gates",
                "yao_ands",
                "yao_depth",
                "arith_muls",
                "arith_depth",
                "splut_ot_gates",
                "splut_depth",
            ],
        },
        Section {
            anchor: "Timings:",
            fields: &[
                "time_total",
                "time_init",
                "time_circuit_gen",
                "time_network",
                "time_base_ots",
                "time_setup",
                "time_ot_extension",
                "time_garbling",
                "time_online",
            ],
        },
        Section {
            anchor: "Total Sent / Rcv",
            fields: &[
                "comm_total_sent",
                "comm_total_recv",
                "comm_base_ots_sent",
                "comm_base_ots_recv",
                "comm_setup_sent",
                "comm_setup_recv",
                "comm_ot_extension_sent",
                "comm_ot_extension_recv",
                "comm_garbling_sent",
                "comm_garbling_recv",
                "comm_online_sent",
                "comm_online_recv",
            ],
        },
        Section {
            anchor: "cos_dist_ver:",
            fields: &[FIELD_COS_DIST_VER],
        },
        Section {
            anchor: "cos_dist:",
            fields: &[FIELD_COS_DIST_SFE],
        },
    ],
};

/// Error for a single report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("report is empty")]
    Empty,
    #[error("report schema v{version}: section {anchor:?} is missing or out of order")]
    MissingSection { version: u32, anchor: &'static str },
    #[error(
        "report schema v{version}: section {anchor:?} holds {actual} values, expected {expected}"
    )]
    TokenCount {
        version: u32,
        anchor: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("batched output holds {actual} report segments, expected {expected}")]
    SegmentCount { expected: usize, actual: usize },
}

/// Structured metrics of one report, in schema order.
///
/// Values are kept as the decimal text the engine printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsRecord {
    schema_version: u32,
    fields: Vec<(&'static str, String)>,
}

impl MetricsRecord {
    /// Returns the version of the schema this record was parsed with.
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Returns the raw text of a field.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns a field parsed as `f64`.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.parse().ok())
    }

    /// Returns the distance computed by the secure protocol.
    pub fn cos_dist_sfe(&self) -> Option<f64> {
        self.get_f64(FIELD_COS_DIST_SFE)
    }

    /// Returns the plaintext verification distance printed by the engine.
    pub fn cos_dist_ver(&self) -> Option<f64> {
        self.get_f64(FIELD_COS_DIST_VER)
    }

    /// Iterates over `(field, value)` in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.fields.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for MetricsRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl ReportSchema {
    /// Returns the total number of fields.
    pub fn field_count(&self) -> usize {
        self.sections.iter().map(|s| s.fields.len()).sum()
    }

    /// Iterates over all field names in report order.
    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sections.iter().flat_map(|s| s.fields.iter().copied())
    }

    /// Parses a single report.
    ///
    /// Anything before the first section anchor is ignored.
    pub fn parse(&self, text: &str) -> Result<MetricsRecord, ReportError> {
        if text.trim().is_empty() {
            return Err(ReportError::Empty);
        }

        let bounds = self.section_bounds(text)?;

        let mut fields = Vec::with_capacity(self.field_count());
        for (section, (start, end)) in self.sections.iter().zip(bounds) {
            let body = &text[start + section.anchor.len()..end];
            let tokens = numeric_tokens(body);
            if tokens.len() != section.fields.len() {
                return Err(ReportError::TokenCount {
                    version: self.version,
                    anchor: section.anchor,
                    expected: section.fields.len(),
                    actual: tokens.len(),
                });
            }
            fields.extend(
                section
                    .fields
                    .iter()
                    .zip(tokens)
                    .map(|(name, token)| (*name, token.to_string())),
            );
        }

        Ok(MetricsRecord {
            schema_version: self.version,
            fields,
        })
    }

    /// Parses a possibly batched output, returning one entry per segment
    /// together with its position in the batch.
    ///
    /// A blank segment keeps its position and yields [`ReportError::Empty`].
    /// Only a blank segment after the final delimiter is dropped.
    pub fn parse_batch_indexed(
        &self,
        text: &str,
    ) -> Vec<(usize, Result<MetricsRecord, ReportError>)> {
        let mut segments: Vec<&str> = text.split(BATCH_DELIMITER).collect();
        if segments.len() > 1 && segments.last().is_some_and(|s| s.trim().is_empty()) {
            segments.pop();
        }

        segments
            .into_iter()
            .enumerate()
            .map(|(idx, segment)| (idx, self.parse(segment)))
            .collect()
    }

    /// Parses a batched output that must hold exactly `expected` segments.
    ///
    /// The returned entries are in batch order, so entry `i` belongs to the
    /// `i`-th input of the batch.
    pub fn parse_batch_exact(
        &self,
        text: &str,
        expected: usize,
    ) -> Result<Vec<Result<MetricsRecord, ReportError>>, ReportError> {
        let segments = self.parse_batch_indexed(text);
        if segments.len() != expected {
            return Err(ReportError::SegmentCount {
                expected,
                actual: segments.len(),
            });
        }

        Ok(segments.into_iter().map(|(_, result)| result).collect())
    }

    /// Parses a possibly batched output, skipping malformed segments.
    pub fn parse_batch(&self, text: &str) -> Vec<MetricsRecord> {
        self.parse_batch_indexed(text)
            .into_iter()
            .filter_map(|(idx, result)| match result {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(segment = idx, error = %e, "skipping malformed report segment");
                    None
                }
            })
            .collect()
    }

    fn section_bounds(&self, text: &str) -> Result<Vec<(usize, usize)>, ReportError> {
        let mut starts = Vec::with_capacity(self.sections.len());
        let mut cursor = 0;
        for section in self.sections {
            let start = text[cursor..]
                .find(section.anchor)
                .map(|pos| cursor + pos)
                .ok_or(ReportError::MissingSection {
                    version: self.version,
                    anchor: section.anchor,
                })?;
            starts.push(start);
            cursor = start + section.anchor.len();
        }

        let ends = starts.iter().skip(1).copied().chain([text.len()]);
        Ok(starts.iter().copied().zip(ends).collect())
    }
}

impl fmt::Display for ReportSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "report schema v{} ({} fields)", self.version, self.field_count())
    }
}

/// Returns every signed or unsigned integer or decimal token, left to right.
pub fn numeric_tokens(text: &str) -> Vec<&str> {
    NUMERIC_TOKEN.find_iter(text).map(|m| m.as_str()).collect()
}

/// Parses a single report with the current schema.
pub fn parse_report(text: &str) -> Result<MetricsRecord, ReportError> {
    REPORT_SCHEMA_V1.parse(text)
}

/// Parses a batched output with the current schema, skipping malformed
/// segments.
pub fn parse_batch(text: &str) -> Vec<MetricsRecord> {
    REPORT_SCHEMA_V1.parse_batch(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    const REPORT: &str = "\
Boolean Sharing: local gates: 0.123, interactive gates: 4.5, layer finish: 0.06
Yao Sharing: local gates: 0, interactive gates: 0, layer finish: 0
Yao Reverse Sharing: local gates: 0, interactive gates: 0, layer finish: 0
Arithmetic Sharing: local gates: 0.001, interactive gates: 0.002, layer finish: 0.003
SPLUT Sharing: local gates: 0, interactive gates: 0, layer finish: 0
Communication: 12.75
Complexities:
Boolean Sharing: ANDs: 2360 ; Depth: 44
Total Vec AND: 2360
Total Non-Vec AND: 0
XOR vals: 8254 gates: 8254
Comb.: 0 gates: 0
Combstruct: 0 gates: 0
Perm: 0 gates: 0
Subst: 0 gates: 0
Split: 128 gates: 1
Yao: ANDs: 0 ; Depth: 0
Arithmetic Sharing: MULs: 0 ; Depth: 0
SP-LUT Sharing: OT-gates: 0 ; Depth: 0
Timings:
Total =\t\t1234.5 ms
Init =\t\t0.1 ms
CircuitGen =\t0.2 ms
Network =\t1 ms
BaseOTs =\t12.25 ms
Setup =\t\t100 ms
OTExtension =\t80 ms
Garbling =\t0 ms
Online =\t20.5 ms

Communication:
Total Sent / Rcv\t1000 bytes / 2000 bytes
BaseOTs Sent / Rcv\t10 bytes / 20 bytes
Setup Sent / Rcv\t300 bytes / 400 bytes
OTExtension Sent / Rcv\t50 bytes / 60 bytes
Garbling Sent / Rcv\t0 bytes / 0 bytes
Online Sent / Rcv\t700 bytes / 800 bytes

cos_dist_ver: 0.4211940870
cos_dist: -0.0000000012
";

    #[test]
    fn test_schema_shape() {
        assert_eq!(REPORT_SCHEMA_V1.field_count(), 61);
        let names: Vec<_> = REPORT_SCHEMA_V1.field_names().collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn test_parse_full_report() {
        let record = parse_report(REPORT).unwrap();

        assert_eq!(record.len(), 61);
        assert_eq!(record.schema_version(), 1);
        assert_eq!(record.get("bool_local_gates"), Some("0.123"));
        assert_eq!(record.get("bool_interactive_gates"), Some("4.5"));
        assert_eq!(record.get("arith_layer_finish"), Some("0.003"));
        assert_eq!(record.get("online_communication"), Some("12.75"));
        assert_eq!(record.get("bool_ands"), Some("2360"));
        assert_eq!(record.get("bool_depth"), Some("44"));
        assert_eq!(record.get("bool_split_vals"), Some("128"));
        assert_eq!(record.get("bool_split_gates"), Some("1"));
        assert_eq!(record.get("time_total"), Some("1234.5"));
        assert_eq!(record.get("time_base_ots"), Some("12.25"));
        assert_eq!(record.get("time_online"), Some("20.5"));
        assert_eq!(record.get("comm_total_sent"), Some("1000"));
        assert_eq!(record.get("comm_total_recv"), Some("2000"));
        assert_eq!(record.get("comm_online_recv"), Some("800"));
        assert_eq!(record.get(FIELD_COS_DIST_VER), Some("0.4211940870"));
        assert_eq!(record.get(FIELD_COS_DIST_SFE), Some("-0.0000000012"));
        assert_eq!(record.cos_dist_ver(), Some(0.421194087));
        assert_eq!(record.cos_dist_sfe(), Some(-0.0000000012));

        let order: Vec<_> = record.iter().map(|(k, _)| k).collect();
        let expected: Vec<_> = REPORT_SCHEMA_V1.field_names().collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_preamble_is_ignored() {
        let text = format!("x: 0.1 | y: 0.2\nx: 0.3 | y: 0.4\n{REPORT}");

        assert_eq!(parse_report(&text).unwrap(), parse_report(REPORT).unwrap());
    }

    #[test]
    fn test_empty_report() {
        assert_eq!(parse_report(""), Err(ReportError::Empty));
        assert_eq!(parse_report(" \n\t"), Err(ReportError::Empty));
        assert!(parse_batch("").is_empty());
    }

    #[rstest]
    #[case::cut_in_timings(REPORT.find("Network").unwrap())]
    #[case::cut_before_distances(REPORT.find("cos_dist_ver").unwrap())]
    #[case::cut_after_last_anchor(REPORT.rfind("cos_dist:").unwrap() + "cos_dist:".len())]
    #[case::only_first_line(REPORT.find('\n').unwrap())]
    fn test_truncated_report(#[case] cut: usize) {
        assert!(parse_report(&REPORT[..cut]).is_err());
    }

    #[test]
    fn test_truncated_last_section_reports_count() {
        let text = REPORT.replace("cos_dist: -0.0000000012", "cos_dist: ");

        assert_eq!(
            parse_report(&text),
            Err(ReportError::TokenCount {
                version: 1,
                anchor: "cos_dist:",
                expected: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn test_reordered_sections_detected() {
        // Same token count, Timings moved in front of Complexities.
        let complexities = REPORT.find("Complexities:").unwrap();
        let timings = REPORT.find("Timings:").unwrap();
        let comm = REPORT.find("\nCommunication:\nTotal").unwrap();
        let text = format!(
            "{}{}{}{}",
            &REPORT[..complexities],
            &REPORT[timings..comm],
            &REPORT[complexities..timings],
            &REPORT[comm..]
        );
        assert_eq!(numeric_tokens(&text).len(), numeric_tokens(REPORT).len());

        assert!(matches!(
            parse_report(&text),
            Err(ReportError::MissingSection { .. })
        ));
    }

    #[test]
    fn test_extra_value_in_section_detected() {
        let text = REPORT.replace("Total Vec AND: 2360", "Total Vec AND: 2360 (1-bit)");

        assert_eq!(
            parse_report(&text),
            Err(ReportError::TokenCount {
                version: 1,
                anchor: "Complexities:",
                expected: 22,
                actual: 23
            })
        );
    }

    #[test]
    fn test_batch_skips_malformed_segments() {
        let truncated = &REPORT[..REPORT.find("Timings").unwrap()];
        let text = [REPORT, truncated, REPORT, "garbage 1 2 3", REPORT].join(BATCH_DELIMITER);
        let delimiters = text.matches(BATCH_DELIMITER).count();

        let records = parse_batch(&text);

        assert_eq!(delimiters, 4);
        assert_eq!(records.len(), 3);
        assert!(records.len() < delimiters);
        assert!(records.iter().all(|r| r.len() == 61));
    }

    #[test]
    fn test_batch_indexed_keeps_positions() {
        let text = [REPORT, "\nnot a report\n", REPORT, "\n"].join(BATCH_DELIMITER);

        let parsed = REPORT_SCHEMA_V1.parse_batch_indexed(&text);

        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].1.is_ok());
        assert!(parsed[1].1.is_err());
        assert_eq!(parsed[2].0, 2);
        assert!(parsed[2].1.is_ok());
    }

    #[test]
    fn test_blank_middle_segment_keeps_positions() {
        let text = [REPORT, "\n", REPORT].join(BATCH_DELIMITER);

        let parsed = REPORT_SCHEMA_V1.parse_batch_indexed(&text);

        let positions: Vec<_> = parsed.iter().map(|(idx, _)| *idx).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(parsed[1].1, Err(ReportError::Empty));
        assert!(parsed[0].1.is_ok());
        assert!(parsed[2].1.is_ok());
    }

    #[test]
    fn test_trailing_delimiter_is_not_a_segment() {
        let text = format!("{REPORT}\n{BATCH_DELIMITER}\n");

        let parsed = REPORT_SCHEMA_V1.parse_batch_indexed(&text);

        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].1.is_ok());
    }

    #[rstest]
    #[case::one_short(&[REPORT, REPORT], 3)]
    #[case::one_extra(&[REPORT, REPORT, REPORT], 2)]
    #[case::single_report(&[REPORT], 4)]
    fn test_batch_exact_rejects_segment_count(#[case] reports: &[&str], #[case] expected: usize) {
        let text = reports.join(BATCH_DELIMITER);

        assert_eq!(
            REPORT_SCHEMA_V1.parse_batch_exact(&text, expected),
            Err(ReportError::SegmentCount {
                expected,
                actual: reports.len()
            })
        );
    }

    #[test]
    fn test_batch_exact_pairs_by_position() {
        let second = REPORT.replace("cos_dist: -0.0000000012", "cos_dist: 0.25");
        let text = [REPORT, "\n", second.as_str()].join(BATCH_DELIMITER);

        let parsed = REPORT_SCHEMA_V1.parse_batch_exact(&text, 3).unwrap();

        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].as_ref().unwrap().cos_dist_sfe(), Some(-0.0000000012));
        assert_eq!(parsed[1], Err(ReportError::Empty));
        assert_eq!(parsed[2].as_ref().unwrap().cos_dist_sfe(), Some(0.25));
    }

    #[test]
    fn test_numeric_tokens() {
        assert_eq!(
            numeric_tokens("a: -1.5, b: +2 c 3e-4 .5 x7"),
            vec!["-1.5", "+2", "3e-4", ".5", "7"]
        );
    }
}
