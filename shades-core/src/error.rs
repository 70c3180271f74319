//! Error types for shades core.

use std::path::PathBuf;
use std::{error::Error, fmt, io};

/// Error type for shades core operations.
#[derive(Debug)]
pub enum ShadesError {
    /// An underlying I/O error.
    Io(io::Error),
    /// A JSON document could not be encoded or decoded.
    Json(serde_json::Error),
    /// An analysis artifact could not be read or written.
    Serialization {
        /// Path of the offending artifact.
        path: PathBuf,
        /// Why the artifact was rejected.
        reason: String,
    },
    /// An analysis artifact declares a schema version this build cannot read.
    UnsupportedVersion {
        /// Path of the offending artifact.
        path: PathBuf,
        /// The version value found in the artifact.
        found: String,
    },
    /// A formatter configuration failed validation.
    Config(String),
    /// A cache entry was unreadable or could not be persisted.
    Cache(String),
    /// A catch-all error with a message.
    Other(String),
}

impl ShadesError {
    pub(crate) fn serialization(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Serialization {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ShadesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::Serialization { path, reason } => {
                write!(f, "invalid analysis {}: {reason}", path.display())
            }
            Self::UnsupportedVersion { path, found } => write!(
                f,
                "unsupported analysis format in {}: version {found}",
                path.display()
            ),
            Self::Config(message) => write!(f, "invalid formatter configuration: {message}"),
            Self::Cache(message) => write!(f, "cache error: {message}"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

impl Error for ShadesError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ShadesError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ShadesError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Convenience result type for shades core.
pub type Result<T> = std::result::Result<T, ShadesError>;

#[cfg(test)]
mod tests {
    use super::ShadesError;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn io_error_formats_message() {
        let error = ShadesError::Io(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(format!("{error}"), "io error: boom");
    }

    #[test]
    fn other_error_formats_message() {
        let error = ShadesError::Other("analysis failed".to_string());
        assert_eq!(format!("{error}"), "analysis failed");
    }

    #[test]
    fn serialization_error_names_path_and_reason() {
        let error = ShadesError::serialization("/tmp/a.json", "missing schema version");
        assert_eq!(
            format!("{error}"),
            "invalid analysis /tmp/a.json: missing schema version"
        );
    }

    #[test]
    fn unsupported_version_formats_found_value() {
        let error = ShadesError::UnsupportedVersion {
            path: PathBuf::from("new.json"),
            found: "7".to_string(),
        };
        assert_eq!(
            format!("{error}"),
            "unsupported analysis format in new.json: version 7"
        );
    }

    #[test]
    fn json_error_keeps_source() {
        let parse = serde_json::from_str::<u32>("nope").expect_err("invalid json");
        let error: ShadesError = parse.into();
        assert!(format!("{error}").starts_with("json error: "));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn from_io_error_maps_variant() {
        let error: ShadesError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        match error {
            ShadesError::Io(inner) => {
                assert_eq!(inner.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected Io variant, got {other:?}"),
        }
    }
}
