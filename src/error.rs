use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Run-level errors for the llm-batch library.
///
/// Per-item failures never show up here: they travel inside the item's
/// result (see [`crate::pool::TaskError`]). Anything surfaced as an `Error`
/// aborts the run.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// IO error with context about the file path.
    #[error("IO error accessing '{path}': {message}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Detailed error message
        message: String,
    },

    /// JSON serialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// YAML parsing or serialization error.
    #[error("YAML error: {message}")]
    Yaml {
        /// Error message
        message: String,
    },

    /// CSV reading or writing error.
    #[error("CSV error: {message}")]
    Csv {
        /// Error message
        message: String,
    },

    /// The worker pool itself failed (not an individual item).
    #[error("Worker pool failure: {message}")]
    Pool {
        /// Error message
        message: String,
    },

    /// The sink stopped writing. Records already written stay on disk.
    #[error("Sink '{path}' failed after {written} records ({} lost): {message}", .lost.len())]
    Sink {
        /// Target being written
        path: PathBuf,
        /// Records persisted before the failure
        written: usize,
        /// Identifiers of records that were drained but never persisted
        lost: Vec<String>,
        /// Error message
        message: String,
    },

    /// Nothing to process.
    #[error("No input found in '{path}'")]
    NoInput {
        /// Source that was enumerated
        path: PathBuf,
    },

    /// Multiple errors occurred during processing.
    #[error("Multiple errors occurred during processing ({count} errors)")]
    Multiple {
        /// Number of errors
        count: usize,
        /// Collection of errors
        errors: Vec<Error>,
    },
}

impl Error {
    /// Creates an IO error with path context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: source.to_string(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a pool error.
    #[must_use]
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool {
            message: message.into(),
        }
    }

    /// Creates a no input error.
    #[must_use]
    pub fn no_input(path: impl Into<PathBuf>) -> Self {
        Self::NoInput { path: path.into() }
    }

    /// Combines multiple errors into a single error.
    #[must_use]
    pub fn multiple(errors: Vec<Self>) -> Self {
        let count = errors.len();
        Self::Multiple { count, errors }
    }

    /// Returns true if this is an IO error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if this is a sink error.
    #[must_use]
    pub const fn is_sink(&self) -> bool {
        matches!(self, Self::Sink { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Self::Csv {
            message: e.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("parallelism must be at least 1");
        assert!(err.is_config());
        assert!(err.to_string().contains("parallelism"));
    }

    #[test]
    fn test_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io("/tmp/models.yaml", io_err);
        assert!(err.is_io());
        assert!(err.to_string().contains("/tmp/models.yaml"));
    }

    #[test]
    fn test_multiple_errors() {
        let combined = Error::multiple(vec![Error::config("a"), Error::pool("b")]);
        assert!(combined.to_string().contains("2 errors"));
    }

    #[test]
    fn test_sink_error_reports_lost_records() {
        let err = Error::Sink {
            path: PathBuf::from("out/results.jsonl"),
            written: 4,
            lost: vec!["job-5".to_string(), "job-6".to_string()],
            message: "disk full".to_string(),
        };
        assert!(err.is_sink());
        let text = err.to_string();
        assert!(text.contains("after 4 records"));
        assert!(text.contains("2 lost"));
    }

    #[test]
    fn test_serialization_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(err.to_string().contains("Serialization error"));
    }

    #[test]
    fn test_yaml_error() {
        let yaml_err = serde_yaml::from_str::<Vec<u32>>("{not: [a list").unwrap_err();
        let err: Error = yaml_err.into();
        assert!(err.to_string().starts_with("YAML error"));
    }

    #[test]
    fn test_csv_error() {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader("a,b\nc\n".as_bytes());
        let csv_err = reader.records().find_map(std::result::Result::err).unwrap();
        let err: Error = csv_err.into();
        assert!(err.to_string().starts_with("CSV error"));
    }
}
