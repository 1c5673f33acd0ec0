use thiserror::Error;

/// Failures crossing the pipeline's component seams.
///
/// The variants map onto the recovery policy each one gets:
/// - `SourceUnavailable`: fatal at startup.
/// - `ReadFailure`: transient, retried with backoff.
/// - `SourceEnded`: the origin will not yield further frames.
/// - `DetectionFailure`: handled per `DetectionFailurePolicy`.
/// - `Persistence`: fatal, halts the loop that owns the log.
#[derive(Debug, Error)]
pub enum Error {
    #[error("source unavailable: {origin}: {reason}")]
    SourceUnavailable { origin: String, reason: String },

    #[error("frame read failed: {0}")]
    ReadFailure(String),

    #[error("source ended")]
    SourceEnded,

    #[error("detection failed: {0}")]
    DetectionFailure(String),

    #[error("detection log write failed: {0}")]
    Persistence(#[from] csv::Error),

    #[error("frame encode failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("component shut down")]
    Shutdown,
}

impl Error {
    pub fn source_unavailable(origin: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::SourceUnavailable {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    /// Per-frame failures the caller is expected to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ReadFailure(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Persistence(csv::Error::from(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
