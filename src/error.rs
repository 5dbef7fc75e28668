//! Error kinds shared by the fetch/download pipeline.
//!
//! Handlers only ever see [`FetchError`]. The message carried by
//! [`FetchError::Input`] is safe to show to a user; the other variants carry
//! diagnostic detail that must stay in the log.

use thiserror::Error;

pub const MSG_MISSING_URL: &str = "Please enter a YouTube URL";
pub const MSG_INVALID_URL: &str = "Invalid YouTube URL. Please enter a valid YouTube video URL.";
pub const MSG_NO_VIDEO_ID: &str = "Could not extract a video ID from the URL.";
pub const MSG_UNAVAILABLE: &str = "This video is unavailable. It might be private or removed.";

const MSG_EXTRACTION: &str = "Failed to process the video. Please try again later.";
const MSG_ARTIFACT: &str = "Download failed: the file could not be produced.";

/// Failure raised by an [`crate::extractor::Extractor`] implementation.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unable to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("video unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

impl ExtractError {
    /// Classifies a failed run by looking at what yt-dlp printed on stderr.
    pub fn from_failure(program: &str, status: String, stderr: &str) -> Self {
        let trimmed = stderr.trim();
        if is_unavailable_message(trimmed) {
            return Self::Unavailable(trimmed.to_owned());
        }
        Self::Failed {
            program: program.to_owned(),
            status,
            stderr: trimmed.to_owned(),
        }
    }
}

fn is_unavailable_message(stderr: &str) -> bool {
    const MARKERS: &[&str] = &[
        "Video unavailable",
        "Private video",
        "This video has been removed",
        "This video is not available",
        "This video is private",
        "is not available in your country",
    ];
    MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Closed set of failures a request can end with.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Missing or malformed input, or a video that cannot be reached.
    #[error("{0}")]
    Input(String),
    /// The extraction collaborator failed for any other reason.
    #[error("extraction failed: {0}")]
    Extraction(String),
    /// Extraction claimed success but no output file was found.
    #[error("artifact missing: {0}")]
    Artifact(String),
}

impl FetchError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    /// The flat message returned to the caller. Never includes the
    /// diagnostic detail of extraction or artifact failures.
    pub fn user_message(&self) -> &str {
        match self {
            Self::Input(message) => message,
            Self::Extraction(_) => MSG_EXTRACTION,
            Self::Artifact(_) => MSG_ARTIFACT,
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, Self::Input(_))
    }
}

impl From<ExtractError> for FetchError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Unavailable(_) => Self::Input(MSG_UNAVAILABLE.to_owned()),
            other => Self::Extraction(other.to_string()),
        }
    }
}
