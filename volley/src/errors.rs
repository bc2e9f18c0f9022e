use thiserror::Error as ThisError;

/// Setup-time failures.
///
/// Per-call failures never show up here: the dispatcher folds them into
/// [`CallRecord`](crate::types::CallRecord)s. Anything in this enum aborts a
/// run before the offending work item generates network traffic.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Structurally invalid input: call counts, concurrency, prompts, model parameters
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// A requested model has no pricing entry
    #[error("No pricing entry for model '{model}'")]
    PricingLookup { model: String },

    /// Configuration file or environment could not be loaded
    #[error(transparent)]
    Config(Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The HTTP client handle could not be built
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration { message: message.into() }
    }

    /// True for errors caused by the caller's input rather than the environment.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. } | Error::PricingLookup { .. } | Error::Config(_))
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

/// Type alias for engine and driver results
pub type Result<T> = std::result::Result<T, Error>;
