//! Plaintext cosine distance, used as the baseline the secure result is
//! validated against.

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DistanceError {
    #[error("vectors have different lengths: {0} and {1}")]
    LengthMismatch(usize, usize),
    #[error("vector is empty")]
    Empty,
    #[error("vector has zero norm")]
    ZeroNorm,
}

/// Returns `1 - (x . y) / (|x| |y|)`.
pub fn cosine_distance(x: &[f64], y: &[f64]) -> Result<f64, DistanceError> {
    if x.len() != y.len() {
        return Err(DistanceError::LengthMismatch(x.len(), y.len()));
    }
    if x.is_empty() {
        return Err(DistanceError::Empty);
    }

    let (dot, xx, yy) = x
        .iter()
        .zip(y)
        .fold((0.0, 0.0, 0.0), |(dot, xx, yy), (a, b)| {
            (dot + a * b, xx + a * a, yy + b * b)
        });

    let norm = xx.sqrt() * yy.sqrt();
    if norm == 0.0 {
        return Err(DistanceError::ZeroNorm);
    }

    Ok(1.0 - dot / norm)
}

/// Returns `true` if `distance` is below `threshold`, i.e. the faces match.
pub fn is_match(distance: f64, threshold: f64) -> bool {
    distance < threshold
}
