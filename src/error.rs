//! Error types for roistat.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while reading volumes, transforming them between spaces,
/// computing overlap metrics, or orchestrating a subject.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing, unreadable, or truncated file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The header does not carry a NIfTI-1 magic string.
    #[error("invalid NIfTI magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// The header declares a datatype code we cannot decode.
    #[error("unsupported data type code: {0}")]
    UnsupportedDataType(i16),

    /// Dimension, spacing, or offset fields are inconsistent.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// The file is not a 3D/4D scalar NIfTI volume.
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    /// Gzip payload could not be inflated.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Two operands of a voxelwise operation live on different grids.
    #[error("space mismatch in {operation}: {detail}")]
    SpaceMismatch {
        /// Operation that compared the grids.
        operation: &'static str,
        /// Shapes or affines that disagreed.
        detail: String,
    },

    /// A resampling or warp could not be applied.
    #[error("{operation} failed: {reason}")]
    Transform {
        /// Transform that was attempted.
        operation: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A ratio had a zero, negative, or non-integer denominator.
    ///
    /// Recovered inside the metrics engine; never aborts a subject.
    #[error("degenerate denominator {denominator} (numerator {numerator})")]
    DegenerateDenominator {
        /// Numerator of the ratio.
        numerator: f64,
        /// Offending denominator.
        denominator: f64,
    },

    /// A required configuration value is missing or contradictory.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An expected output was absent after a stage completed.
    #[error("checkpoint '{stage}' failed: missing {}", .missing.display())]
    MissingOutput {
        /// Stage whose outputs were checked.
        stage: String,
        /// First expected file that was not found.
        missing: PathBuf,
    },

    /// A per-task unit panicked instead of returning.
    #[error("task '{task}' panicked: {message}")]
    TaskPanicked {
        /// Task identifier.
        task: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// One or more per-task units failed for a subject.
    #[error("{} task(s) failed for subject {subject}: {}", .failures.len(), format_failures(.failures))]
    TaskFailures {
        /// Subject identifier.
        subject: String,
        /// (task, reason) pairs.
        failures: Vec<(String, String)>,
    },

    /// CSV serialisation error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Structural errors abort the enclosing subject; only degenerate
    /// denominators are recovered locally.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::DegenerateDenominator { .. })
    }

    pub(crate) fn not_found(path: &std::path::Path, what: &str) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found: {}", what, path.display()),
        ))
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(task, reason)| format!("[{task}] {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_is_not_structural() {
        let err = Error::DegenerateDenominator {
            numerator: 3.0,
            denominator: 0.0,
        };
        assert!(!err.is_structural());
        assert!(Error::Configuration("x".into()).is_structural());
        assert!(Error::not_found(std::path::Path::new("a.nii"), "zstat").is_structural());
    }

    #[test]
    fn test_task_failures_message_lists_tasks() {
        let err = Error::TaskFailures {
            subject: "sub-01".into(),
            failures: vec![
                ("motor_hand".into(), "zstat missing".into()),
                ("language".into(), "bad grid".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 task(s) failed for subject sub-01"));
        assert!(msg.contains("[motor_hand] zstat missing"));
        assert!(msg.contains("[language] bad grid"));
    }
}
