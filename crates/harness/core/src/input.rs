//! Text files exchanged with the secure computation engine and the
//! embedding extractor.
//!
//! The engine reads newline-delimited `x_i y_i` pairs, and share files with
//! one value per line. Values are written with Rust's shortest exact float
//! formatting so they parse back to the same bits.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("vectors have different lengths: {0} and {1}")]
    LengthMismatch(usize, usize),
    #[error("invalid value on line {line}: {value:?}")]
    InvalidValue { line: usize, value: String },
    #[error("line {0} does not hold exactly two values")]
    MalformedPair(usize),
}

/// Renders the probe/reference pair as `x_i y_i` lines.
pub fn format_pairs(x: &[f64], y: &[f64]) -> Result<String, InputError> {
    if x.len() != y.len() {
        return Err(InputError::LengthMismatch(x.len(), y.len()));
    }

    let mut out = String::with_capacity(x.len() * 48);
    for (a, b) in x.iter().zip(y) {
        out.push_str(&format!("{a} {b}\n"));
    }
    Ok(out)
}

/// Parses `x_i y_i` lines back into the two vectors.
pub fn parse_pairs(text: &str) -> Result<(Vec<f64>, Vec<f64>), InputError> {
    let mut x = Vec::new();
    let mut y = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let mut values = line.split_whitespace();
        let (Some(a), Some(b), None) = (values.next(), values.next(), values.next()) else {
            if line.trim().is_empty() {
                continue;
            }
            return Err(InputError::MalformedPair(idx + 1));
        };
        x.push(parse_value(a, idx + 1)?);
        y.push(parse_value(b, idx + 1)?);
    }
    Ok((x, y))
}

/// Renders a vector with one value per line.
pub fn format_vector(v: &[f64]) -> String {
    let mut out = String::with_capacity(v.len() * 24);
    for value in v {
        out.push_str(&format!("{value}\n"));
    }
    out
}

/// Parses a vector separated by newlines, whitespace or commas.
pub fn parse_vector(text: &str) -> Result<Vec<f64>, InputError> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        for token in line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
        {
            out.push(parse_value(token, idx + 1)?);
        }
    }
    Ok(out)
}

/// Path of the `index`-th input file of a batch, `<prefix><index>.txt`.
pub fn batch_input_path(prefix: &Path, index: usize) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("{index}.txt"));
    PathBuf::from(name)
}

fn parse_value(token: &str, line: usize) -> Result<f64, InputError> {
    token.parse().map_err(|_| InputError::InvalidValue {
        line,
        value: token.to_string(),
    })
}
