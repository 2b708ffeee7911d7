use provider::ProviderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("spec error: {0}")]
    Spec(#[from] fnspec::SpecError),

    #[error("account and/or region is not allowed by the spec")]
    NotAllowedHere,

    #[error("VPC is configured but its security groups have no egress rules")]
    NoEgress,

    #[error("invalid alias name: '{0}' - must match '{1}'")]
    InvalidAliasName(String, &'static str),

    #[error("function failed to return non-5xx - aborting deploy: {0}\n\n{1}")]
    CanaryFailure(String, String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("image error: {0}")]
    Docker(#[from] docker::DockerError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControllerError {
    /// True when the underlying provider error was a 404-class miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControllerError::Provider(e) if e.is_not_found())
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ControllerError::Provider(e) if e.is_already_exists())
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
