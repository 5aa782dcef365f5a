use std::fmt::{self, Display};

/// Crate-level error type.
///
/// Denied limit checks are not errors: they are first-class variants of
/// [`crate::decision::LimitDecision`]. `Error` is reserved for genuine
/// faults. Operations on unknown job IDs return `None` rather than an error,
/// so callers treat "not found" as a valid outcome.
#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new`
// method and log the error.
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    Serialization { message: String },
    SweeperAlreadyRunning,
}

impl ErrorDetails {
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::SweeperAlreadyRunning => tracing::Level::WARN,
        }
    }

    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDetails::Serialization { message } => {
                write!(f, "Serialization error: {message}")
            }
            ErrorDetails::SweeperAlreadyRunning => {
                write!(f, "Cleanup sweeper is already running")
            }
        }
    }
}
