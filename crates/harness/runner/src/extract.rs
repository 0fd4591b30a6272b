//! Face embedding extraction on the server host.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use harness_core::{
    Embedding,
    distance::DistanceError,
    input::{InputError, parse_vector},
    report::numeric_tokens,
};
use tracing::{debug, info};

use crate::transport::{Transport, TransportError, shell_quote};

/// Message the extractor prints when an image holds no detectable face.
pub const NO_FACE_MARKER: &str = "Face could not be detected";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("no face detected in {0}")]
    NoFace(PathBuf),
    #[error("extraction for {image} failed with exit code {exit_code:?}: {stderr}")]
    Failed {
        image: PathBuf,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("invalid embedding for {image}: {source}")]
    Embedding {
        image: PathBuf,
        #[source]
        source: InputError,
    },
    #[error("embedding of {image} is not comparable to the reference: {source}")]
    Distance {
        image: PathBuf,
        #[source]
        source: DistanceError,
    },
    #[error("no face detected in any of the first {0} images")]
    Exhausted(usize),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ExtractError {
    /// Whether retrying with another image may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractError::NoFace(_))
    }
}

/// An embedding and the time it took to extract.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub embedding: Embedding,
    /// Seconds, as reported by the extractor.
    pub seconds: f64,
}

/// Produces face embeddings from images.
pub trait Extractor {
    fn extract(&self, image: &Path) -> Result<Extraction, ExtractError>;
}

/// Runs an extraction command on a host and reads the embedding back.
///
/// The command template's `{image}` and `{output}` placeholders are replaced
/// with the image path below `image_root` and the output file. The last
/// number the command prints on stdout is taken as the extraction time.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    transport: Arc<dyn Transport>,
    working_dir: PathBuf,
    template: String,
    image_root: PathBuf,
    output: PathBuf,
}

impl CommandExtractor {
    pub fn new(
        transport: Arc<dyn Transport>,
        working_dir: impl Into<PathBuf>,
        template: impl Into<String>,
        image_root: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            working_dir: working_dir.into(),
            template: template.into(),
            image_root: image_root.into(),
            output: output.into(),
        }
    }

    fn command(&self, image: &Path) -> String {
        let command = self
            .template
            .replace("{image}", &shell_quote(&image.display().to_string()))
            .replace("{output}", &shell_quote(&self.output.display().to_string()));
        format!(
            "cd {} && {command}",
            shell_quote(&self.working_dir.display().to_string())
        )
    }
}

impl Extractor for CommandExtractor {
    fn extract(&self, image: &Path) -> Result<Extraction, ExtractError> {
        let path = self.image_root.join(image);
        let start = Instant::now();
        let output = self.transport.execute(&self.command(&path))?;

        if !output.success() {
            if output.stderr.contains(NO_FACE_MARKER) || output.stdout.contains(NO_FACE_MARKER) {
                return Err(ExtractError::NoFace(image.to_path_buf()));
            }
            return Err(ExtractError::Failed {
                image: image.to_path_buf(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let output_path = self.working_dir.join(&self.output);
        let text = self.transport.read_file(&output_path)?;
        let embedding = parse_vector(&String::from_utf8_lossy(&text)).map_err(|source| {
            ExtractError::Embedding {
                image: image.to_path_buf(),
                source,
            }
        })?;

        let seconds = numeric_tokens(&output.stdout)
            .last()
            .and_then(|token| token.parse().ok())
            .unwrap_or_else(|| start.elapsed().as_secs_f64());
        debug!(image = %image.display(), seconds, "extracted embedding");

        Ok(Extraction { embedding, seconds })
    }
}

/// Extracts the first candidate with a detectable face, trying at most
/// `cap` candidates. Returns the index of the candidate used.
pub fn extract_first<E, P>(
    extractor: &E,
    candidates: &[P],
    cap: usize,
) -> Result<(usize, Extraction), ExtractError>
where
    E: Extractor + ?Sized,
    P: AsRef<Path>,
{
    let mut attempts = 0;
    for (idx, candidate) in candidates.iter().enumerate().take(cap) {
        attempts += 1;
        match extractor.extract(candidate.as_ref()) {
            Ok(extraction) => return Ok((idx, extraction)),
            Err(e) if e.is_retryable() => {
                info!(image = %candidate.as_ref().display(), "no face detected, trying next image");
            }
            Err(e) => return Err(e),
        }
    }

    Err(ExtractError::Exhausted(attempts))
}
