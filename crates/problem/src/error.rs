//! Error taxonomy shared by every convforge crate.

use std::path::PathBuf;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unresolved direction or malformed descriptor fields.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No solver candidate accepts the problem.
    #[error("unsupported problem: {0}")]
    UnsupportedProblem(String),

    /// The device runtime rejected a kernel build.
    #[error("failed to compile `{source_id}` with options `{options}`: {message}")]
    Compilation {
        source_id: String,
        options: String,
        message: String,
    },

    #[error("{what} did not finish within {limit:?}")]
    Timeout { what: String, limit: Duration },

    #[error("operation cancelled")]
    Cancelled,

    /// Only raised on the write path; reads degrade to an empty database.
    #[error("performance database i/o failed for {}: {source}", path.display())]
    DatabaseIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::UnsupportedProblem(message.into())
    }

    pub fn compilation(
        source_id: impl Into<String>,
        options: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Compilation {
            source_id: source_id.into(),
            options: options.into(),
            message: message.into(),
        }
    }

    /// Storage-layer failures callers may degrade instead of aborting on.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::DatabaseIo { .. })
    }
}
