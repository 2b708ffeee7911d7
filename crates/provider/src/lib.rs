//! Provider abstraction for lambdafy.
//!
//! This crate defines the [`Provider`] trait: every cloud operation the
//! lifecycle controller performs goes through it. The AWS backend lives in
//! the `provider-aws` crate; an in-memory [`mock::MockProvider`] (behind the
//! `mock` feature) backs the controller's scenario tests.

use std::collections::BTreeMap;

use async_trait::async_trait;

pub mod error;
#[cfg(feature = "mock")]
pub mod mock;
pub mod types;

pub use error::{ProviderError, Result};
pub use types::*;

/// A cloud backend able to host container-image functions.
///
/// All operations are fallible with the [`ProviderError`] taxonomy; the
/// transient kinds are retried by the controller, the rest surface to the
/// caller. Implementations must be cheap to clone through `&self` sharing
/// (the controller fans out concurrent calls during deploys).
#[async_trait]
pub trait Provider: Send + Sync {
    // ===== Identity and networking =====

    /// Account and region of the configured credentials.
    async fn caller_identity(&self) -> Result<CallerIdentity>;

    /// Egress rules across the given security groups.
    async fn security_group_egress(&self, group_ids: &[String]) -> Result<Vec<EgressRule>>;

    // ===== Roles =====

    /// Creates a role; fails with `AlreadyExists` when it is already there.
    /// Returns the role ARN.
    async fn create_role(
        &self,
        name: &str,
        assume_policy: &str,
        description: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Resolves a role name to its ARN.
    async fn get_role_arn(&self, name: &str) -> Result<String>;

    /// Creates or replaces an inline policy on a role.
    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str) -> Result<()>;

    /// Fetches an inline policy document (URL-decoded form is up to the
    /// backend; callers canonicalize before comparing).
    async fn get_role_policy(&self, role: &str, policy_name: &str) -> Result<String>;

    /// Lists role names starting with the given prefix.
    async fn list_roles_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deletes a role along with its inline policies.
    async fn delete_role(&self, name: &str) -> Result<()>;

    // ===== Functions =====

    /// Fetches a function, optionally qualified by a numeric version or an
    /// alias name.
    async fn get_function(&self, name: &str, qualifier: Option<&str>) -> Result<FunctionInfo>;

    /// Creates the function and publishes version 1.
    async fn create_function(&self, config: &FunctionConfig) -> Result<PublishedVersion>;

    /// Updates the configuration of the function head.
    async fn update_function_configuration(&self, config: &FunctionConfig) -> Result<()>;

    /// Points the function head at a new image and publishes a version.
    async fn update_function_code(&self, name: &str, image_uri: &str) -> Result<PublishedVersion>;

    async fn delete_function(&self, name: &str) -> Result<()>;

    async fn tag_function(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    async fn untag_function(&self, arn: &str, keys: &[String]) -> Result<()>;

    async fn list_functions(&self) -> Result<Vec<String>>;

    /// All published versions, including the provider's mutable head
    /// pseudo-version; callers filter it out.
    async fn list_versions(&self, name: &str) -> Result<Vec<VersionSummary>>;

    async fn list_aliases(&self, name: &str) -> Result<Vec<AliasSummary>>;

    // ===== Aliases, URLs and permissions =====

    async fn create_alias(&self, name: &str, alias: &str, version: i64) -> Result<()>;

    async fn update_alias(&self, name: &str, alias: &str, version: i64) -> Result<()>;

    /// Returns the version the alias points at.
    async fn get_alias(&self, name: &str, alias: &str) -> Result<i64>;

    async fn delete_alias(&self, name: &str, alias: &str) -> Result<()>;

    /// Creates the public URL of an alias; `AlreadyExists` when present.
    async fn create_function_url(
        &self,
        name: &str,
        alias: &str,
        cors: &CorsConfig,
    ) -> Result<String>;

    async fn update_function_url(
        &self,
        name: &str,
        alias: &str,
        cors: &CorsConfig,
    ) -> Result<String>;

    async fn get_function_url(&self, name: &str, alias: &str) -> Result<String>;

    /// Grants unauthenticated invocation on an alias URL; `AlreadyExists`
    /// when the statement is already in place.
    async fn add_public_invoke_permission(
        &self,
        name: &str,
        alias: &str,
        statement_id: &str,
    ) -> Result<()>;

    // ===== Queue trigger bindings =====

    /// Creates a binding for `name` or `name:version`. Returns the binding
    /// id. Bindings made during publish are pinned to the new version and
    /// start out disabled.
    async fn create_queue_binding(
        &self,
        function_ref: &str,
        trigger: &QueueTriggerConfig,
        enabled: bool,
    ) -> Result<String>;

    /// Lists bindings for `name` or `name:version`.
    async fn list_queue_bindings(&self, function_ref: &str) -> Result<Vec<QueueBinding>>;

    async fn set_queue_binding_enabled(&self, uuid: &str, enabled: bool) -> Result<()>;

    async fn get_queue_binding_state(&self, uuid: &str) -> Result<String>;

    async fn update_queue_binding_batch_size(&self, uuid: &str, batch_size: i32) -> Result<()>;

    async fn delete_queue_binding(&self, uuid: &str) -> Result<()>;

    // ===== Schedules =====

    async fn delete_schedule_group(&self, group: &str) -> Result<()>;

    /// Creates a schedule group; `Conflict` while a previous deletion is
    /// still settling.
    async fn create_schedule_group(&self, group: &str) -> Result<()>;

    async fn create_schedule(&self, schedule: &ScheduleConfig) -> Result<()>;

    // ===== Image registry =====

    /// Resolves a repository name to its URI, creating it when `create` is
    /// set and it does not exist.
    async fn ensure_repository(&self, name: &str, create: bool) -> Result<String>;

    /// Short-lived credentials for pushing to the registry.
    async fn registry_auth(&self) -> Result<RegistryAuth>;

    // ===== Logs =====

    /// Log events of one numeric version since `start_ms` (unix millis).
    async fn function_log_events(
        &self,
        name: &str,
        version: i64,
        start_ms: i64,
    ) -> Result<Vec<LogEvent>>;
}
