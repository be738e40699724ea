//! CLI error types and conversions

use crate::collaborators::CollaboratorError;
use crate::pipeline::PipelineError;
use crate::recovery::RecoveryError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Discovery or collaborator setup failed
    #[error("discovery error: {0}")]
    Discovery(#[from] CollaboratorError),

    /// The batch could not start
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Recovery store problem
    #[error("recovery store error: {0}")]
    Recovery(#[from] RecoveryError),

    /// Report could not be rendered
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem operation on a CLI-managed path failed
    #[error("{action} {path}: {source}")]
    Io {
        /// What was being done
        action: &'static str,
        /// Path involved
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}
