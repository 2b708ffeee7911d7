//! Centralized constants for the lifecycle controller.

use std::time::Duration;

// =============================================================================
// Reserved names
// =============================================================================

/// Alias serving production traffic.
pub const ACTIVE_ALIAS: &str = "lambdafy-active";

/// Staging alias a deploy is verified against before cut-over.
pub const PREACTIVE_ALIAS: &str = "lambdafy-preactive";

/// Statement id of the public-invoke permission on alias URLs.
pub const PUBLIC_ACCESS_STATEMENT_ID: &str = "AllowPublicAccess";

/// Prefix of generated IAM role names. The rest of the name is the MD5 of
/// the full policy content, so identical policies share one role.
pub const GENERATED_ROLE_PREFIX: &str = "lambdafy-v1-";

// =============================================================================
// Spec-in-environment hints
// =============================================================================

// The function configuration is the only durable store shared between
// publish and deploy, so deploy-time settings (CORS, cron) ride along as
// environment variables under this prefix. The runtime adapter strips them
// before the user program starts.

pub const SPEC_ENV_PREFIX: &str = "LAMBDAFY__SPEC_";

pub const SPEC_ENV_CORS: &str = "LAMBDAFY__SPEC_CORS";

pub const SPEC_ENV_CRON_PREFIX: &str = "LAMBDAFY__SPEC_CRON_";

// =============================================================================
// Deadlines and poll intervals
// =============================================================================

/// Overall deadline for each create/update step of a publish.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(600);

/// Deadline for each staging/cut-over phase of a deploy.
pub const DEPLOY_PHASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for the canary prime phase.
pub const PRIME_TIMEOUT: Duration = Duration::from_secs(300);

/// Schedule-group deletion is eventually consistent; recreation retries
/// conflicts up to this long.
pub const SCHEDULE_GROUP_RECREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Overall deadline for undeploy and delete.
pub const UNDEPLOY_TIMEOUT: Duration = Duration::from_secs(120);

/// Delay between attempts in the conflict-tolerant retry wrapper.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval of the function stabilization predicate.
pub const STABILIZE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Poll interval while waiting for queue bindings to reach their state.
pub const BINDING_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between canary probe attempts within one worker.
pub const PRIME_PROBE_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Role generation
// =============================================================================

/// Trust policy of generated roles. Part of the hashed content that names
/// the role, so any change here mints new role names.
pub const DEFAULT_ASSUME_ROLE_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Action": "sts:AssumeRole",
      "Principal": {
        "Service": [
          "lambda.amazonaws.com",
          "scheduler.amazonaws.com"
        ]
      }
    }
  ]
}
"#;
