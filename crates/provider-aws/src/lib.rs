//! AWS implementation of the lambdafy [`Provider`] trait over the official
//! SDK: Lambda for functions/aliases/URLs/event sources, IAM for roles, STS
//! for identity, EC2 for security-group inspection, ECR for the image
//! registry, EventBridge Scheduler for cron and CloudWatch for logs.

mod classify;

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_lambda::types::{
    Architecture, Cors, Environment, FileSystemConfig, FunctionCode, FunctionResponseType,
    FunctionUrlAuthType, ImageConfig, PackageType, ScalingConfig, State, VpcConfig,
};
use base64::Engine;
use provider::{
    AliasSummary, CallerIdentity, CorsConfig, EgressRule, FileSystemMount, FunctionConfig,
    FunctionInfo, FunctionState, LogEvent, Provider, ProviderError, PublishedVersion,
    QueueBinding, QueueTriggerConfig, RegistryAuth, Result, ScheduleConfig, VersionSummary,
};

use crate::classify::classify;

pub struct AwsProvider {
    region: String,
    lambda: aws_sdk_lambda::Client,
    iam: aws_sdk_iam::Client,
    sts: aws_sdk_sts::Client,
    ec2: aws_sdk_ec2::Client,
    ecr: aws_sdk_ecr::Client,
    scheduler: aws_sdk_scheduler::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
}

impl AwsProvider {
    /// Builds a provider from the ambient AWS configuration (environment,
    /// shared config files, instance metadata).
    pub async fn new() -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let region = config
            .region()
            .map(|r| r.to_string())
            .ok_or_else(|| ProviderError::Other(anyhow::anyhow!("no AWS region configured")))?;
        Ok(AwsProvider {
            region,
            lambda: aws_sdk_lambda::Client::new(&config),
            iam: aws_sdk_iam::Client::new(&config),
            sts: aws_sdk_sts::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
            ecr: aws_sdk_ecr::Client::new(&config),
            scheduler: aws_sdk_scheduler::Client::new(&config),
            logs: aws_sdk_cloudwatchlogs::Client::new(&config),
        })
    }

    fn to_cors(cors: &CorsConfig) -> Cors {
        Cors::builder()
            .set_allow_origins(non_empty(&cors.origins))
            .set_allow_methods(non_empty(&cors.methods))
            .set_allow_headers(non_empty(&cors.headers))
            .build()
    }

    fn function_config_builders(
        config: &FunctionConfig,
    ) -> Result<(
        Environment,
        ImageConfig,
        Option<VpcConfig>,
        Vec<FileSystemConfig>,
    )> {
        let env = Environment::builder()
            .set_variables(Some(config.env.clone().into_iter().collect()))
            .build();
        let image_config = ImageConfig::builder()
            .set_entry_point(non_empty(&config.entrypoint))
            .set_command(non_empty(&config.command))
            .set_working_directory(config.workdir.clone())
            .build();
        let vpc = if config.subnet_ids.is_empty() && config.security_group_ids.is_empty() {
            None
        } else {
            Some(
                VpcConfig::builder()
                    .set_subnet_ids(Some(config.subnet_ids.clone()))
                    .set_security_group_ids(Some(config.security_group_ids.clone()))
                    .build(),
            )
        };
        let mounts = config
            .efs_mounts
            .iter()
            .map(|m| {
                FileSystemConfig::builder()
                    .arn(&m.arn)
                    .local_mount_path(&m.path)
                    .build()
                    .map_err(|e| ProviderError::Other(e.into()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((env, image_config, vpc, mounts))
    }
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    if v.is_empty() { None } else { Some(v.to_vec()) }
}

fn owned(s: Option<&str>) -> String {
    s.unwrap_or_default().to_string()
}

fn to_function_state(state: Option<&State>) -> Option<FunctionState> {
    state.map(|s| match s {
        State::Active => FunctionState::Active,
        State::Pending => FunctionState::Pending,
        other => FunctionState::Other(other.as_str().to_string()),
    })
}

#[async_trait]
impl Provider for AwsProvider {
    async fn caller_identity(&self) -> Result<CallerIdentity> {
        let out = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(classify)?;
        Ok(CallerIdentity {
            account: owned(out.account()),
            region: self.region.clone(),
        })
    }

    async fn security_group_egress(&self, group_ids: &[String]) -> Result<Vec<EgressRule>> {
        let out = self
            .ec2
            .describe_security_groups()
            .set_group_ids(Some(group_ids.to_vec()))
            .send()
            .await
            .map_err(classify)?;
        let mut rules = Vec::new();
        for sg in out.security_groups() {
            for rule in sg.ip_permissions_egress() {
                rules.push(EgressRule {
                    ip_protocol: rule.ip_protocol().map(str::to_string),
                });
            }
        }
        Ok(rules)
    }

    async fn create_role(
        &self,
        name: &str,
        assume_policy: &str,
        description: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        let tags = tags
            .iter()
            .map(|(k, v)| {
                aws_sdk_iam::types::Tag::builder()
                    .key(k)
                    .value(v)
                    .build()
                    .map_err(|e| ProviderError::Other(e.into()))
            })
            .collect::<Result<Vec<_>>>()?;
        let out = self
            .iam
            .create_role()
            .role_name(name)
            .assume_role_policy_document(assume_policy)
            .description(description)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(classify)?;
        Ok(out.role().map(|r| r.arn().to_string()).unwrap_or_default())
    }

    async fn get_role_arn(&self, name: &str) -> Result<String> {
        let out = self
            .iam
            .get_role()
            .role_name(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(out.role().map(|r| r.arn().to_string()).unwrap_or_default())
    }

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str) -> Result<()> {
        self.iam
            .put_role_policy()
            .role_name(role)
            .policy_name(policy_name)
            .policy_document(document)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_role_policy(&self, role: &str, policy_name: &str) -> Result<String> {
        let out = self
            .iam
            .get_role_policy()
            .role_name(role)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(classify)?;
        // IAM returns the document URL-encoded.
        let decoded = urlencoding::decode(out.policy_document())
            .map_err(|e| ProviderError::Other(e.into()))?;
        Ok(decoded.into_owned())
    }

    async fn list_roles_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut stream = self.iam.list_roles().into_paginator().items().send();
        let mut names = Vec::new();
        while let Some(item) = stream.next().await {
            let role = item.map_err(classify)?;
            if role.role_name().starts_with(prefix) {
                names.push(role.role_name().to_string());
            }
        }
        Ok(names)
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        // Inline policies block role deletion and must go first.
        let policies = self
            .iam
            .list_role_policies()
            .role_name(name)
            .send()
            .await
            .map_err(classify)?;
        for policy in policies.policy_names() {
            self.iam
                .delete_role_policy()
                .role_name(name)
                .policy_name(policy)
                .send()
                .await
                .map_err(classify)?;
        }
        self.iam
            .delete_role()
            .role_name(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_function(&self, name: &str, qualifier: Option<&str>) -> Result<FunctionInfo> {
        let out = self
            .lambda
            .get_function()
            .function_name(name)
            .set_qualifier(qualifier.map(String::from))
            .send()
            .await
            .map_err(classify)?;

        let mut info = FunctionInfo::default();
        if let Some(code) = out.code() {
            info.image_uri = code.image_uri().map(str::to_string);
            info.resolved_image_uri = code.resolved_image_uri().map(str::to_string);
        }
        if let Some(tags) = out.tags() {
            info.tags = tags.clone().into_iter().collect();
        }
        let Some(config) = out.configuration() else {
            return Ok(info);
        };
        info.arn = owned(config.function_arn());
        info.name = owned(config.function_name());
        info.version = owned(config.version());
        info.description = owned(config.description());
        info.state = to_function_state(config.state());
        info.role_arn = owned(config.role());
        info.last_modified = owned(config.last_modified());
        info.memory = config.memory_size();
        info.timeout = config.timeout();
        info.temp_size = config.ephemeral_storage().map(|s| s.size());
        if let Some(env) = config.environment() {
            if let Some(vars) = env.variables() {
                info.env = vars.clone().into_iter().collect();
            }
        }
        if let Some(image_config) = out
            .configuration()
            .and_then(|c| c.image_config_response())
            .and_then(|r| r.image_config())
        {
            info.entrypoint = image_config.entry_point().to_vec();
            info.command = image_config.command().to_vec();
            info.workdir = image_config.working_directory().map(str::to_string);
        }
        if let Some(vpc) = config.vpc_config() {
            info.subnet_ids = vpc.subnet_ids().to_vec();
            info.security_group_ids = vpc.security_group_ids().to_vec();
        }
        info.efs_mounts = config
            .file_system_configs()
            .iter()
            .map(|c| FileSystemMount {
                arn: c.arn().to_string(),
                path: c.local_mount_path().to_string(),
            })
            .collect();
        Ok(info)
    }

    async fn create_function(&self, config: &FunctionConfig) -> Result<PublishedVersion> {
        let (env, image_config, vpc, mounts) = Self::function_config_builders(config)?;
        let mut req = self
            .lambda
            .create_function()
            .function_name(&config.name)
            .description(&config.description)
            .role(&config.role_arn)
            .architectures(Architecture::X8664)
            .package_type(PackageType::Image)
            .code(FunctionCode::builder().image_uri(&config.image_uri).build())
            .environment(env)
            .image_config(image_config)
            .set_vpc_config(vpc)
            .set_file_system_configs(Some(mounts))
            .set_memory_size(config.memory)
            .set_timeout(config.timeout)
            .set_tags(Some(config.tags.clone().into_iter().collect()))
            .publish(true);
        if let Some(size) = config.temp_size {
            let storage = aws_sdk_lambda::types::EphemeralStorage::builder()
                .size(size)
                .build()
                .map_err(|e| ProviderError::Other(e.into()))?;
            req = req.ephemeral_storage(storage);
        }
        let out = req.send().await.map_err(classify)?;
        let version = owned(out.version()).parse::<i64>().map_err(|_| {
            ProviderError::Other(anyhow::anyhow!("non-numeric published version"))
        })?;
        Ok(PublishedVersion {
            arn: owned(out.function_arn()),
            version,
        })
    }

    async fn update_function_configuration(&self, config: &FunctionConfig) -> Result<()> {
        let (env, image_config, vpc, mounts) = Self::function_config_builders(config)?;
        let mut req = self
            .lambda
            .update_function_configuration()
            .function_name(&config.name)
            .description(&config.description)
            .role(&config.role_arn)
            .environment(env)
            .image_config(image_config)
            .set_vpc_config(vpc)
            .set_file_system_configs(Some(mounts))
            .set_memory_size(config.memory)
            .set_timeout(config.timeout);
        if let Some(size) = config.temp_size {
            let storage = aws_sdk_lambda::types::EphemeralStorage::builder()
                .size(size)
                .build()
                .map_err(|e| ProviderError::Other(e.into()))?;
            req = req.ephemeral_storage(storage);
        }
        req.send().await.map_err(classify)?;
        Ok(())
    }

    async fn update_function_code(&self, name: &str, image_uri: &str) -> Result<PublishedVersion> {
        let out = self
            .lambda
            .update_function_code()
            .function_name(name)
            .image_uri(image_uri)
            .architectures(Architecture::X8664)
            .publish(true)
            .send()
            .await
            .map_err(classify)?;
        let version = owned(out.version()).parse::<i64>().map_err(|_| {
            ProviderError::Other(anyhow::anyhow!("non-numeric published version"))
        })?;
        Ok(PublishedVersion {
            arn: owned(out.function_arn()),
            version,
        })
    }

    async fn delete_function(&self, name: &str) -> Result<()> {
        self.lambda
            .delete_function()
            .function_name(name)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn tag_function(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.lambda
            .tag_resource()
            .resource(arn)
            .set_tags(Some(tags.clone().into_iter().collect()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn untag_function(&self, arn: &str, keys: &[String]) -> Result<()> {
        self.lambda
            .untag_resource()
            .resource(arn)
            .set_tag_keys(Some(keys.to_vec()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list_functions(&self) -> Result<Vec<String>> {
        let mut stream = self.lambda.list_functions().into_paginator().items().send();
        let mut names = Vec::new();
        while let Some(item) = stream.next().await {
            let config = item.map_err(classify)?;
            if let Some(name) = config.function_name() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<VersionSummary>> {
        let mut stream = self
            .lambda
            .list_versions_by_function()
            .function_name(name)
            .into_paginator()
            .items()
            .send();
        let mut versions = Vec::new();
        while let Some(item) = stream.next().await {
            let config = item.map_err(classify)?;
            // The mutable head shows up as $LATEST and is not a version.
            let Ok(version) = owned(config.version()).parse::<i64>() else {
                continue;
            };
            versions.push(VersionSummary {
                version,
                description: owned(config.description()),
            });
        }
        Ok(versions)
    }

    async fn list_aliases(&self, name: &str) -> Result<Vec<AliasSummary>> {
        let mut stream = self
            .lambda
            .list_aliases()
            .function_name(name)
            .into_paginator()
            .items()
            .send();
        let mut aliases = Vec::new();
        while let Some(item) = stream.next().await {
            let alias = item.map_err(classify)?;
            let Ok(version) = owned(alias.function_version()).parse::<i64>() else {
                continue;
            };
            aliases.push(AliasSummary {
                name: owned(alias.name()),
                version,
            });
        }
        Ok(aliases)
    }

    async fn create_alias(&self, name: &str, alias: &str, version: i64) -> Result<()> {
        self.lambda
            .create_alias()
            .function_name(name)
            .name(alias)
            .function_version(version.to_string())
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn update_alias(&self, name: &str, alias: &str, version: i64) -> Result<()> {
        self.lambda
            .update_alias()
            .function_name(name)
            .name(alias)
            .function_version(version.to_string())
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_alias(&self, name: &str, alias: &str) -> Result<i64> {
        let out = self
            .lambda
            .get_alias()
            .function_name(name)
            .name(alias)
            .send()
            .await
            .map_err(classify)?;
        owned(out.function_version())
            .parse::<i64>()
            .map_err(|_| ProviderError::Other(anyhow::anyhow!("non-numeric alias version")))
    }

    async fn delete_alias(&self, name: &str, alias: &str) -> Result<()> {
        self.lambda
            .delete_alias()
            .function_name(name)
            .name(alias)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_function_url(
        &self,
        name: &str,
        alias: &str,
        cors: &CorsConfig,
    ) -> Result<String> {
        let out = self
            .lambda
            .create_function_url_config()
            .function_name(name)
            .qualifier(alias)
            .auth_type(FunctionUrlAuthType::None)
            .cors(Self::to_cors(cors))
            .send()
            .await
            .map_err(classify)?;
        Ok(out.function_url().to_string())
    }

    async fn update_function_url(
        &self,
        name: &str,
        alias: &str,
        cors: &CorsConfig,
    ) -> Result<String> {
        let out = self
            .lambda
            .update_function_url_config()
            .function_name(name)
            .qualifier(alias)
            .auth_type(FunctionUrlAuthType::None)
            .cors(Self::to_cors(cors))
            .send()
            .await
            .map_err(classify)?;
        Ok(out.function_url().to_string())
    }

    async fn get_function_url(&self, name: &str, alias: &str) -> Result<String> {
        let out = self
            .lambda
            .get_function_url_config()
            .function_name(name)
            .qualifier(alias)
            .send()
            .await
            .map_err(classify)?;
        Ok(out.function_url().to_string())
    }

    async fn add_public_invoke_permission(
        &self,
        name: &str,
        alias: &str,
        statement_id: &str,
    ) -> Result<()> {
        self.lambda
            .add_permission()
            .function_name(name)
            .qualifier(alias)
            .statement_id(statement_id)
            .action("lambda:InvokeFunctionUrl")
            .principal("*")
            .function_url_auth_type(FunctionUrlAuthType::None)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_queue_binding(
        &self,
        function_ref: &str,
        trigger: &QueueTriggerConfig,
        enabled: bool,
    ) -> Result<String> {
        let scaling = trigger.max_concurrency.map(|c| {
            ScalingConfig::builder().maximum_concurrency(c).build()
        });
        let out = self
            .lambda
            .create_event_source_mapping()
            .event_source_arn(&trigger.source_arn)
            .function_name(function_ref)
            .set_batch_size(trigger.batch_size)
            .set_maximum_batching_window_in_seconds(trigger.batch_window)
            .set_scaling_config(scaling)
            .function_response_types(FunctionResponseType::ReportBatchItemFailures)
            .enabled(enabled)
            .send()
            .await
            .map_err(classify)?;
        Ok(owned(out.uuid()))
    }

    async fn list_queue_bindings(&self, function_ref: &str) -> Result<Vec<QueueBinding>> {
        let mut stream = self
            .lambda
            .list_event_source_mappings()
            .function_name(function_ref)
            .into_paginator()
            .items()
            .send();
        let mut bindings = Vec::new();
        while let Some(item) = stream.next().await {
            let mapping = item.map_err(classify)?;
            bindings.push(QueueBinding {
                uuid: owned(mapping.uuid()),
                source_arn: owned(mapping.event_source_arn()),
                state: owned(mapping.state()),
                batch_size: mapping.batch_size(),
            });
        }
        Ok(bindings)
    }

    async fn set_queue_binding_enabled(&self, uuid: &str, enabled: bool) -> Result<()> {
        self.lambda
            .update_event_source_mapping()
            .uuid(uuid)
            .enabled(enabled)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_queue_binding_state(&self, uuid: &str) -> Result<String> {
        let out = self
            .lambda
            .get_event_source_mapping()
            .uuid(uuid)
            .send()
            .await
            .map_err(classify)?;
        Ok(owned(out.state()))
    }

    async fn update_queue_binding_batch_size(&self, uuid: &str, batch_size: i32) -> Result<()> {
        self.lambda
            .update_event_source_mapping()
            .uuid(uuid)
            .batch_size(batch_size)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_queue_binding(&self, uuid: &str) -> Result<()> {
        self.lambda
            .delete_event_source_mapping()
            .uuid(uuid)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_schedule_group(&self, group: &str) -> Result<()> {
        self.scheduler
            .delete_schedule_group()
            .name(group)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_schedule_group(&self, group: &str) -> Result<()> {
        self.scheduler
            .create_schedule_group()
            .name(group)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_schedule(&self, schedule: &ScheduleConfig) -> Result<()> {
        let target = aws_sdk_scheduler::types::Target::builder()
            .arn(&schedule.target_arn)
            .role_arn(&schedule.role_arn)
            .input(&schedule.input)
            .build()
            .map_err(|e| ProviderError::Other(e.into()))?;
        let window = aws_sdk_scheduler::types::FlexibleTimeWindow::builder()
            .mode(aws_sdk_scheduler::types::FlexibleTimeWindowMode::Off)
            .build()
            .map_err(|e| ProviderError::Other(e.into()))?;
        self.scheduler
            .create_schedule()
            .name(&schedule.name)
            .group_name(&schedule.group)
            .schedule_expression(format!("cron({})", schedule.expression))
            .target(target)
            .flexible_time_window(window)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn ensure_repository(&self, name: &str, create: bool) -> Result<String> {
        let described = self
            .ecr
            .describe_repositories()
            .repository_names(name)
            .send()
            .await
            .map_err(classify);
        let repos = match described {
            Ok(out) => out.repositories().to_vec(),
            Err(e) if e.is_not_found() && create => {
                self.ecr
                    .create_repository()
                    .repository_name(name)
                    .send()
                    .await
                    .map_err(classify)?;
                self.ecr
                    .describe_repositories()
                    .repository_names(name)
                    .send()
                    .await
                    .map_err(classify)?
                    .repositories()
                    .to_vec()
            }
            Err(e) => return Err(e),
        };
        repos
            .first()
            .and_then(|r| r.repository_uri())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::NotFound(format!("repository {name}")))
    }

    async fn registry_auth(&self) -> Result<RegistryAuth> {
        let out = self
            .ecr
            .get_authorization_token()
            .send()
            .await
            .map_err(classify)?;
        let data = out
            .authorization_data()
            .first()
            .ok_or_else(|| ProviderError::Other(anyhow::anyhow!("missing registry auth token")))?;
        let token = data
            .authorization_token()
            .ok_or_else(|| ProviderError::Other(anyhow::anyhow!("missing registry auth token")))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token)
            .map_err(|e| ProviderError::Other(e.into()))?;
        let decoded =
            String::from_utf8(decoded).map_err(|e| ProviderError::Other(e.into()))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| ProviderError::Other(anyhow::anyhow!("invalid registry auth token")))?;
        Ok(RegistryAuth {
            username: username.to_string(),
            password: password.to_string(),
            endpoint: owned(data.proxy_endpoint()),
        })
    }

    async fn function_log_events(
        &self,
        name: &str,
        version: i64,
        start_ms: i64,
    ) -> Result<Vec<LogEvent>> {
        // Version is only visible in the stream name, e.g. "2024/.../[7]abc".
        let version_marker = format!("[{version}]");
        let mut stream = self
            .logs
            .filter_log_events()
            .log_group_name(format!("/aws/lambda/{name}"))
            .start_time(start_ms)
            .into_paginator()
            .items()
            .send();
        let mut events = Vec::new();
        while let Some(item) = stream.next().await {
            let event = item.map_err(classify)?;
            if !event
                .log_stream_name()
                .is_some_and(|s| s.contains(&version_marker))
            {
                continue;
            }
            events.push(LogEvent {
                timestamp_ms: event.timestamp().unwrap_or_default(),
                message: owned(event.message()).trim_end().to_string(),
            });
        }
        events.sort_by_key(|e| e.timestamp_ms);
        Ok(events)
    }
}
