/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod apis;

pub mod conciliation;
pub mod extensions;
pub mod labels;
pub mod status;
/// Log and trace integrations
pub mod telemetry;
pub mod worker_pool;

/// Metrics
mod metrics;
pub use metrics::Metrics;
pub mod config;
pub mod defaults;

#[cfg(test)]
pub mod fixtures;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("SerializationError: {0}")]
    YamlSerializationError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    /// The desired resource set could not be computed, the whole cycle is aborted
    #[error("Resource generation failed: {0}")]
    ResourceGenerationError(String),

    /// Some create, patch or delete calls of a plan failed
    #[error("{} of the planned operations failed: {}", .0.len(), .0.join("; "))]
    ApplyError(Vec<String>),

    #[error("Extension {extension} failed: {message}")]
    ExtensionError { extension: String, message: String },

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(String),

    #[error("Invalid Data: {0}")]
    InvalidErr(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::SerializationError(_) | Error::YamlSerializationError(_) => "serialization",
            Error::KubeError(_) => "kube",
            Error::ResourceGenerationError(_) => "resource_generation",
            Error::ApplyError(_) => "apply",
            Error::ExtensionError { .. } => "extension",
            Error::MissingCollaborator(_) => "missing_collaborator",
            Error::InvalidErr(_) => "invalid",
        };
        label.to_string()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::YamlSerializationError(err)
    }
}
