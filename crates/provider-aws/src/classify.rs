//! Mapping of SDK errors onto the provider error taxonomy.
//!
//! The interesting kinds are recognized by error code plus the message
//! fragments the service emits while resources are still converging.

use aws_sdk_lambda::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use provider::ProviderError;

const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "NoSuchEntity",
    "NoSuchEntityException",
    "RepositoryNotFoundException",
    "NotFoundException",
];

pub(crate) fn classify<E, R>(err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = err.code().unwrap_or_default().to_string();
    let message = err.message().unwrap_or_default().to_string();
    let text = format!("{code}: {message}");

    if NOT_FOUND_CODES.contains(&code.as_str()) || message.contains("404") {
        return ProviderError::NotFound(text);
    }
    if code == "EntityAlreadyExists"
        || message.contains("already exist")
        || message.contains("exists for this")
    {
        return ProviderError::AlreadyExists(text);
    }
    if message.contains("role defined for the function cannot be assumed") {
        return ProviderError::RoleNotAssumable(text);
    }
    if message.contains("does not refer to a valid principal") {
        return ProviderError::InvalidPrincipal(text);
    }
    if code == "ResourceConflictException" || code == "ConflictException" {
        return if message.contains("exist") {
            ProviderError::AlreadyExists(text)
        } else {
            ProviderError::Conflict(text)
        };
    }

    ProviderError::Other(anyhow::anyhow!("{}", DisplayErrorContext(&err)))
}
