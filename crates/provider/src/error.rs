use thiserror::Error;

/// Error kinds surfaced by provider backends.
///
/// The controller's retry wrapper consumes the transient kinds; everything
/// else is returned to the nearest caller.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("resource conflict: {0}")]
    Conflict(String),

    #[error("role cannot be assumed yet: {0}")]
    RoleNotAssumable(String),

    #[error("ARN does not refer to a valid principal yet: {0}")]
    InvalidPrincipal(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// True for errors raised while the provider is mid-convergence; these
    /// are safe to retry after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Conflict(_)
                | ProviderError::RoleNotAssumable(_)
                | ProviderError::InvalidPrincipal(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProviderError::AlreadyExists(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
