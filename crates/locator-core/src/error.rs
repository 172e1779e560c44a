use thiserror::Error;

use crate::sample::SampleKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Address range {address:#x}+{len:#x} is not mapped")]
    Unmapped { address: u64, len: usize },

    #[error("Invalid discovery plan: {0}")]
    InvalidPlan(String),

    #[error("Sample pool too small: need at least {required} samples, got {actual}")]
    PoolTooSmall { required: usize, actual: usize },

    #[error("Sample {key} for variant '{variant}' unavailable: {message}")]
    SampleUnavailable {
        variant: String,
        key: SampleKey,
        message: String,
    },

    #[error("Discriminator for variant '{variant}' could not be computed")]
    DiscriminatorUnavailable { variant: String },

    #[error(
        "Discriminator {discriminator:#x} is shared by variants '{first}' and '{second}'"
    )]
    AmbiguousDiscriminator {
        discriminator: u64,
        first: String,
        second: String,
    },

    #[error("Profile build failed for variant '{variant}', field '{field}': {reason}")]
    ProfileBuildFailed {
        variant: String,
        field: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Whether this error is a fatal profile build failure.
    ///
    /// Build failures mean the plan's static ranges no longer hold for a
    /// variant the plan claims to support; they are never retried.
    pub fn is_build_failure(&self) -> bool {
        matches!(self, Error::ProfileBuildFailed { .. })
    }

    pub(crate) fn build_failed(
        variant: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::ProfileBuildFailed {
            variant: variant.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}
