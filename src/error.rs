//! Error types for the export pipeline

use thiserror::Error;

/// Result type alias for export operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage identifiers carried by fatal failures.
///
/// The stages form a linear progression; a failure report names the stage
/// that aborted the export so callers can tell a configuration problem from
/// a rendering problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    Paper,
    Extent,
    Grid,
    RenderMap,
    Scale,
    ScaleLabel,
    Legends,
    Build,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::Paper => "PAPER",
            Stage::Extent => "EXTENT",
            Stage::Grid => "GRID",
            Stage::RenderMap => "RENDER_MAP",
            Stage::Scale => "SCALE",
            Stage::ScaleLabel => "SCALE_LABEL",
            Stage::Legends => "LEGENDS",
            Stage::Build => "BUILD",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the export pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// A pipeline stage failed fatally
    #[error("{stage}: {message}")]
    StageFailed { stage: Stage, message: String },

    /// Remote imagery fetch failed for a single layer
    #[error("Layer fetch failed: {0}")]
    LayerFetch(String),

    /// Fetched bytes could not be decoded into a bitmap
    #[error("Image decode failed: {0}")]
    Decode(String),

    /// A drawing surface refused pixel readback (cross-origin restricted)
    #[error("Tainted surface: {0}")]
    Tainted(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a fatal failure attributed to a pipeline stage.
    pub fn at(stage: Stage, message: impl Into<String>) -> Self {
        Error::StageFailed {
            stage,
            message: message.into(),
        }
    }

    /// The stage this error is attributed to, when one is known.
    ///
    /// Tainted surfaces surface during the render stage but keep their own
    /// variant so operators can tell a CORS problem from an empty render.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::StageFailed { stage, .. } => Some(*stage),
            Error::Tainted(_) => Some(Stage::RenderMap),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
