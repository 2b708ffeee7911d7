//! Shared data types exchanged between the controller and provider backends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity of the credentials the provider was configured with.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub account: String,
    pub region: String,
}

/// An EFS mount attached to a function.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSystemMount {
    pub arn: String,
    pub path: String,
}

/// Everything needed to create or reconfigure a function.
#[derive(Debug, Clone, Default)]
pub struct FunctionConfig {
    pub name: String,
    pub description: String,
    pub role_arn: String,
    pub image_uri: String,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub memory: Option<i32>,
    pub timeout: Option<i32>,
    pub temp_size: Option<i32>,
    pub env: BTreeMap<String, String>,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub efs_mounts: Vec<FileSystemMount>,
    pub tags: BTreeMap<String, String>,
}

/// Lifecycle state of a function version as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionState {
    Active,
    Pending,
    Other(String),
}

/// A snapshot of a function (or one of its versions) as the provider sees it.
#[derive(Debug, Clone, Default)]
pub struct FunctionInfo {
    pub arn: String,
    pub name: String,
    /// Numeric version, or the provider's mutable head pseudo-version.
    pub version: String,
    pub description: String,
    pub state: Option<FunctionState>,
    pub role_arn: String,
    pub image_uri: Option<String>,
    pub resolved_image_uri: Option<String>,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub memory: Option<i32>,
    pub timeout: Option<i32>,
    pub temp_size: Option<i32>,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub efs_mounts: Vec<FileSystemMount>,
    pub tags: BTreeMap<String, String>,
    pub last_modified: String,
}

/// Result of publishing a new version of a function.
#[derive(Debug, Clone)]
pub struct PublishedVersion {
    pub arn: String,
    pub version: i64,
}

#[derive(Debug, Clone)]
pub struct VersionSummary {
    pub version: i64,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct AliasSummary {
    pub name: String,
    pub version: i64,
}

/// One egress rule of a security group; only the protocol matters to us.
#[derive(Debug, Clone)]
pub struct EgressRule {
    /// `-1` means all protocols.
    pub ip_protocol: Option<String>,
}

/// CORS settings applied to a function URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub origins: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub headers: Vec<String>,
}

/// Desired configuration of a queue trigger binding.
#[derive(Debug, Clone, Default)]
pub struct QueueTriggerConfig {
    pub source_arn: String,
    pub batch_size: Option<i32>,
    pub batch_window: Option<i32>,
    pub max_concurrency: Option<i32>,
}

/// A queue trigger binding as reported by the provider.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    pub uuid: String,
    pub source_arn: String,
    /// Enabled / Disabled / Enabling / Disabling (provider vocabulary).
    pub state: String,
    pub batch_size: Option<i32>,
}

/// A schedule to create inside a function's schedule group.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub name: String,
    pub group: String,
    /// Raw cron expression; the backend wraps it in its own syntax.
    pub expression: String,
    pub target_arn: String,
    pub role_arn: String,
    /// JSON payload delivered with every tick.
    pub input: String,
}

/// Short-lived credentials for the image registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub endpoint: String,
}

/// A single log line emitted by a function.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub timestamp_ms: i64,
    pub message: String,
}
