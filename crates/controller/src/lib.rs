//! Lifecycle controller for lambdafy.
//!
//! Coordinates the publish -> stage -> cut-over -> activate deployment of a
//! function against a [`provider::Provider`] backend, along with the
//! surrounding management operations (aliases, versions, triggers, logs,
//! generated-role cleanup). All provider writes go through the
//! conflict-tolerant retry wrapper in [`retry`].

mod admin;
pub mod constants;
mod deploy;
mod error;
mod publish;
mod resolver;
mod retry;
mod specgen;
mod triggers;

pub use admin::{cleanup_roles, delete_function, fetch_logs, function_info, list_functions};
pub use deploy::{deploy, deploy_with, undeploy, DeployOptions};
pub use error::{ControllerError, Result};
pub use publish::{publish, PublishResult};
pub use resolver::{alias, resolve_version, unalias, versions, FunctionVersion};
pub use retry::{retry_on_conflict, wait_on_function};
pub use specgen::generate_spec;
pub use triggers::{sqs_add, sqs_list, sqs_remove, QueueTriggerSummary};
