//! Failure taxonomy of a conversion request.
//!
//! Every variant is terminal for the request that produced it. Callers pick
//! the user-facing text with [`ConversionError::user_message`] and the wire
//! representation with [`ConversionError::code`] / [`ConversionError::http_status`],
//! so the HTML form and the JSON API report the same kinds.

/// Error kinds returned by the conversion workflow and file retrieval.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    /// No URL was supplied.
    #[error("no URL supplied")]
    MissingInput,

    /// The URL is not an accepted YouTube http(s) URL.
    #[error("invalid source URL: {0}")]
    InvalidUrl(String),

    /// The session already used all of its conversions.
    #[error("conversion limit of {limit} reached")]
    QuotaExceeded { limit: u32 },

    /// The video does not exist or is unavailable.
    #[error("video not found")]
    NotFound,

    /// The video is private.
    #[error("video is private")]
    PrivateVideo,

    /// The video is blocked for copyright reasons.
    #[error("video is blocked by a copyright claim")]
    Copyrighted,

    /// The external tool failed; carries its diagnostic output.
    #[error("external tool failure: {0}")]
    ExternalToolFailure(String),

    /// Writing the conversion record failed.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A converted file requested for download does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),
}

impl ConversionError {
    pub fn tool(message: impl Into<String>) -> Self {
        Self::ExternalToolFailure(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceFailure(message.into())
    }

    /// Stable machine-readable code exposed by the JSON API.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingInput => "missing_input",
            Self::InvalidUrl(_) => "invalid_url",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::NotFound => "video_not_found",
            Self::PrivateVideo => "private_video",
            Self::Copyrighted => "copyrighted",
            Self::ExternalToolFailure(_) => "tool_failure",
            Self::PersistenceFailure(_) => "persistence_failure",
            Self::FileNotFound(_) => "file_not_found",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingInput | Self::InvalidUrl(_) => 400,
            Self::QuotaExceeded { .. } => 429,
            Self::NotFound | Self::FileNotFound(_) => 404,
            Self::PrivateVideo => 403,
            Self::Copyrighted => 451,
            Self::ExternalToolFailure(_) => 502,
            Self::PersistenceFailure(_) => 500,
        }
    }

    /// Text shown to the user. Diagnostic payloads (tool output, database
    /// errors) never leak through here; they only go to the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::MissingInput => "Please provide a valid URL.",
            Self::InvalidUrl(_) => "Only YouTube video URLs (http or https) can be converted.",
            Self::QuotaExceeded { .. } => {
                "You have reached the maximum number of free conversions. Please subscribe to our premium service for unlimited conversions."
            }
            Self::NotFound => "The YouTube video could not be found.",
            Self::PrivateVideo => "This video is private and cannot be converted.",
            Self::Copyrighted => "This video is protected by copyright and cannot be converted.",
            Self::ExternalToolFailure(_) | Self::PersistenceFailure(_) => {
                "An error occurred during the conversion. Please try again later."
            }
            Self::FileNotFound(_) => "The file does not exist.",
        }
    }
}

pub type ConversionResult<T> = Result<T, ConversionError>;
