//! In-memory [`Provider`] used by controller tests.
//!
//! State transitions are immediate (bindings flip straight to their terminal
//! state, published versions are `Active` from the start) and every write is
//! appended to an ordered journal so tests can assert call ordering.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{ProviderError, Result};
use crate::types::*;
use crate::Provider;

#[derive(Debug, Clone)]
struct MockFunction {
    arn: String,
    head: FunctionConfig,
    versions: BTreeMap<i64, FunctionConfig>,
    next_version: i64,
    tags: BTreeMap<String, String>,
    aliases: BTreeMap<String, i64>,
    urls: BTreeMap<String, String>,
    permissions: Vec<String>,
}

#[derive(Debug, Clone)]
struct MockBinding {
    function: String,
    version: Option<i64>,
    source_arn: String,
    state: String,
    batch_size: Option<i32>,
}

#[derive(Debug, Clone)]
struct MockRole {
    arn: String,
    policies: BTreeMap<String, String>,
}

#[derive(Default)]
struct MockState {
    functions: BTreeMap<String, MockFunction>,
    bindings: BTreeMap<String, MockBinding>,
    schedule_groups: BTreeMap<String, Vec<ScheduleConfig>>,
    roles: BTreeMap<String, MockRole>,
    repos: BTreeMap<String, String>,
    egress: Vec<EgressRule>,
    journal: Vec<String>,
}

fn split_function_ref(function_ref: &str) -> Result<(&str, Option<i64>)> {
    match function_ref.split_once(':') {
        Some((n, v)) => {
            let v = v.parse::<i64>().map_err(|_| {
                ProviderError::Other(anyhow::anyhow!("bad function qualifier: {function_ref}"))
            })?;
            Ok((n, Some(v)))
        }
        None => Ok((function_ref, None)),
    }
}

pub struct MockProvider {
    account: String,
    region: String,
    /// When set, function URLs are `{url_base}/{function}/{alias}` so tests
    /// can point them at a local server.
    url_base: Option<String>,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(account: &str, region: &str) -> Self {
        MockProvider {
            account: account.to_string(),
            region: region.to_string(),
            url_base: None,
            state: Mutex::new(MockState {
                egress: vec![EgressRule {
                    ip_protocol: Some("-1".to_string()),
                }],
                ..Default::default()
            }),
        }
    }

    pub fn with_url_base(mut self, base: &str) -> Self {
        self.url_base = Some(base.trim_end_matches('/').to_string());
        self
    }

    pub fn set_egress_rules(&self, rules: Vec<EgressRule>) {
        self.state.lock().unwrap().egress = rules;
    }

    /// Ordered record of every write performed against the mock.
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().unwrap().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().unwrap().journal.clear();
    }

    pub fn alias_target(&self, name: &str, alias: &str) -> Option<i64> {
        let st = self.state.lock().unwrap();
        st.functions.get(name)?.aliases.get(alias).copied()
    }

    /// `(source_arn, version, state)` of every binding of a function.
    pub fn binding_states(&self, name: &str) -> Vec<(String, Option<i64>, String)> {
        let st = self.state.lock().unwrap();
        st.bindings
            .values()
            .filter(|b| b.function == name)
            .map(|b| (b.source_arn.clone(), b.version, b.state.clone()))
            .collect()
    }

    pub fn function_tags(&self, name: &str) -> BTreeMap<String, String> {
        let st = self.state.lock().unwrap();
        st.functions
            .get(name)
            .map(|f| f.tags.clone())
            .unwrap_or_default()
    }

    pub fn schedules(&self, group: &str) -> Vec<ScheduleConfig> {
        let st = self.state.lock().unwrap();
        st.schedule_groups.get(group).cloned().unwrap_or_default()
    }

    pub fn role_names(&self) -> Vec<String> {
        let st = self.state.lock().unwrap();
        st.roles.keys().cloned().collect()
    }

    fn function_arn(&self, name: &str) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{}",
            self.region, self.account, name
        )
    }

    fn info_from(&self, f: &MockFunction, config: &FunctionConfig, version: &str) -> FunctionInfo {
        let arn = if version == "$LATEST" {
            f.arn.clone()
        } else {
            format!("{}:{version}", f.arn)
        };
        FunctionInfo {
            arn,
            name: config.name.clone(),
            version: version.to_string(),
            description: config.description.clone(),
            state: Some(FunctionState::Active),
            role_arn: config.role_arn.clone(),
            image_uri: Some(config.image_uri.clone()),
            resolved_image_uri: Some(config.image_uri.clone()),
            env: config.env.clone(),
            entrypoint: config.entrypoint.clone(),
            command: config.command.clone(),
            workdir: config.workdir.clone(),
            memory: config.memory,
            timeout: config.timeout,
            temp_size: config.temp_size,
            subnet_ids: config.subnet_ids.clone(),
            security_group_ids: config.security_group_ids.clone(),
            efs_mounts: config.efs_mounts.clone(),
            tags: f.tags.clone(),
            last_modified: "1970-01-01T00:00:00.000+0000".to_string(),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn caller_identity(&self) -> Result<CallerIdentity> {
        Ok(CallerIdentity {
            account: self.account.clone(),
            region: self.region.clone(),
        })
    }

    async fn security_group_egress(&self, _group_ids: &[String]) -> Result<Vec<EgressRule>> {
        Ok(self.state.lock().unwrap().egress.clone())
    }

    async fn create_role(
        &self,
        name: &str,
        _assume_policy: &str,
        _description: &str,
        _tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut st = self.state.lock().unwrap();
        if st.roles.contains_key(name) {
            st.journal.push(format!("create_role {name} (exists)"));
            return Err(ProviderError::AlreadyExists(format!("role {name}")));
        }
        let arn = format!("arn:aws:iam::{}:role/{}", self.account, name);
        st.roles.insert(
            name.to_string(),
            MockRole {
                arn: arn.clone(),
                policies: BTreeMap::new(),
            },
        );
        st.journal.push(format!("create_role {name}"));
        Ok(arn)
    }

    async fn get_role_arn(&self, name: &str) -> Result<String> {
        let st = self.state.lock().unwrap();
        st.roles
            .get(name)
            .map(|r| r.arn.clone())
            .ok_or_else(|| ProviderError::NotFound(format!("role {name}")))
    }

    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("put_role_policy {role} {policy_name}"));
        let role = st
            .roles
            .get_mut(role)
            .ok_or_else(|| ProviderError::NotFound(format!("role {role}")))?;
        role.policies
            .insert(policy_name.to_string(), document.to_string());
        Ok(())
    }

    async fn get_role_policy(&self, role: &str, policy_name: &str) -> Result<String> {
        let st = self.state.lock().unwrap();
        st.roles
            .get(role)
            .and_then(|r| r.policies.get(policy_name))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("policy {policy_name}")))
    }

    async fn list_roles_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let st = self.state.lock().unwrap();
        Ok(st
            .roles
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_role(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("delete_role {name}"));
        st.roles
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(format!("role {name}")))
    }

    async fn get_function(&self, name: &str, qualifier: Option<&str>) -> Result<FunctionInfo> {
        let st = self.state.lock().unwrap();
        let f = st
            .functions
            .get(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        match qualifier {
            None => Ok(self.info_from(f, &f.head, "$LATEST")),
            Some(q) => {
                if let Ok(v) = q.parse::<i64>() {
                    let config = f
                        .versions
                        .get(&v)
                        .ok_or_else(|| ProviderError::NotFound(format!("version {v}")))?;
                    Ok(self.info_from(f, config, &v.to_string()))
                } else {
                    let v = *f
                        .aliases
                        .get(q)
                        .ok_or_else(|| ProviderError::NotFound(format!("alias {q}")))?;
                    let config = f
                        .versions
                        .get(&v)
                        .ok_or_else(|| ProviderError::NotFound(format!("version {v}")))?;
                    Ok(self.info_from(f, config, &v.to_string()))
                }
            }
        }
    }

    async fn create_function(&self, config: &FunctionConfig) -> Result<PublishedVersion> {
        let mut st = self.state.lock().unwrap();
        if st.functions.contains_key(&config.name) {
            return Err(ProviderError::AlreadyExists(format!(
                "function {}",
                config.name
            )));
        }
        let arn = self.function_arn(&config.name);
        let mut versions = BTreeMap::new();
        versions.insert(1, config.clone());
        st.functions.insert(
            config.name.clone(),
            MockFunction {
                arn: arn.clone(),
                head: config.clone(),
                versions,
                next_version: 2,
                tags: config.tags.clone(),
                aliases: BTreeMap::new(),
                urls: BTreeMap::new(),
                permissions: Vec::new(),
            },
        );
        st.journal.push(format!("create_function {} -> v1", config.name));
        Ok(PublishedVersion {
            arn: format!("{arn}:1"),
            version: 1,
        })
    }

    async fn update_function_configuration(&self, config: &FunctionConfig) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal
            .push(format!("update_function_configuration {}", config.name));
        let f = st
            .functions
            .get_mut(&config.name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {}", config.name)))?;
        let image = f.head.image_uri.clone();
        f.head = config.clone();
        f.head.image_uri = image;
        Ok(())
    }

    async fn update_function_code(&self, name: &str, image_uri: &str) -> Result<PublishedVersion> {
        let mut st = self.state.lock().unwrap();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        f.head.image_uri = image_uri.to_string();
        let version = f.next_version;
        f.next_version += 1;
        f.versions.insert(version, f.head.clone());
        let arn = format!("{}:{version}", f.arn);
        st.journal
            .push(format!("update_function_code {name} -> v{version}"));
        Ok(PublishedVersion { arn, version })
    }

    async fn delete_function(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("delete_function {name}"));
        st.functions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))
    }

    async fn tag_function(&self, arn: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("tag_function {arn}"));
        for f in st.functions.values_mut() {
            if f.arn == arn {
                for (k, v) in tags {
                    f.tags.insert(k.clone(), v.clone());
                }
                return Ok(());
            }
        }
        Err(ProviderError::NotFound(format!("function {arn}")))
    }

    async fn untag_function(&self, arn: &str, keys: &[String]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("untag_function {arn}"));
        for f in st.functions.values_mut() {
            if f.arn == arn {
                for k in keys {
                    f.tags.remove(k);
                }
                return Ok(());
            }
        }
        Err(ProviderError::NotFound(format!("function {arn}")))
    }

    async fn list_functions(&self) -> Result<Vec<String>> {
        let st = self.state.lock().unwrap();
        Ok(st.functions.keys().cloned().collect())
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<VersionSummary>> {
        let st = self.state.lock().unwrap();
        let f = st
            .functions
            .get(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        Ok(f.versions
            .iter()
            .map(|(v, c)| VersionSummary {
                version: *v,
                description: c.description.clone(),
            })
            .collect())
    }

    async fn list_aliases(&self, name: &str) -> Result<Vec<AliasSummary>> {
        let st = self.state.lock().unwrap();
        let f = st
            .functions
            .get(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        Ok(f.aliases
            .iter()
            .map(|(n, v)| AliasSummary {
                name: n.clone(),
                version: *v,
            })
            .collect())
    }

    async fn create_alias(&self, name: &str, alias: &str, version: i64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        if f.aliases.contains_key(alias) {
            st.journal.push(format!("create_alias {alias} (exists)"));
            return Err(ProviderError::AlreadyExists(format!("alias {alias}")));
        }
        f.aliases.insert(alias.to_string(), version);
        st.journal.push(format!("create_alias {alias} -> v{version}"));
        Ok(())
    }

    async fn update_alias(&self, name: &str, alias: &str, version: i64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        if !f.aliases.contains_key(alias) {
            return Err(ProviderError::NotFound(format!("alias {alias}")));
        }
        f.aliases.insert(alias.to_string(), version);
        st.journal.push(format!("update_alias {alias} -> v{version}"));
        Ok(())
    }

    async fn get_alias(&self, name: &str, alias: &str) -> Result<i64> {
        let st = self.state.lock().unwrap();
        st.functions
            .get(name)
            .and_then(|f| f.aliases.get(alias))
            .copied()
            .ok_or_else(|| ProviderError::NotFound(format!("alias {alias}")))
    }

    async fn delete_alias(&self, name: &str, alias: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("delete_alias {alias}"));
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        f.aliases
            .remove(alias)
            .ok_or_else(|| ProviderError::NotFound(format!("alias {alias}")))?;
        f.urls.remove(alias);
        f.permissions.retain(|p| !p.starts_with(&format!("{alias}:")));
        Ok(())
    }

    async fn create_function_url(
        &self,
        name: &str,
        alias: &str,
        _cors: &CorsConfig,
    ) -> Result<String> {
        let url = match &self.url_base {
            Some(base) => format!("{base}/{name}/{alias}"),
            None => format!(
                "https://{alias}.{name}.lambda-url.{}.on.mock/",
                self.region
            ),
        };
        let mut st = self.state.lock().unwrap();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        if f.urls.contains_key(alias) {
            st.journal.push(format!("create_function_url {alias} (exists)"));
            return Err(ProviderError::AlreadyExists(format!("url for {alias}")));
        }
        f.urls.insert(alias.to_string(), url.clone());
        st.journal.push(format!("create_function_url {alias}"));
        Ok(url)
    }

    async fn update_function_url(
        &self,
        name: &str,
        alias: &str,
        _cors: &CorsConfig,
    ) -> Result<String> {
        let mut st = self.state.lock().unwrap();
        let url = st
            .functions
            .get(name)
            .and_then(|f| f.urls.get(alias))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("url for {alias}")))?;
        st.journal.push(format!("update_function_url {alias}"));
        Ok(url)
    }

    async fn get_function_url(&self, name: &str, alias: &str) -> Result<String> {
        let st = self.state.lock().unwrap();
        st.functions
            .get(name)
            .and_then(|f| f.urls.get(alias))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("url for {alias}")))
    }

    async fn add_public_invoke_permission(
        &self,
        name: &str,
        alias: &str,
        statement_id: &str,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let f = st
            .functions
            .get_mut(name)
            .ok_or_else(|| ProviderError::NotFound(format!("function {name}")))?;
        let key = format!("{alias}:{statement_id}");
        if f.permissions.contains(&key) {
            st.journal.push(format!("add_permission {alias} (exists)"));
            return Err(ProviderError::AlreadyExists(format!(
                "statement {statement_id}"
            )));
        }
        f.permissions.push(key);
        st.journal.push(format!("add_permission {alias}"));
        Ok(())
    }

    async fn create_queue_binding(
        &self,
        function_ref: &str,
        trigger: &QueueTriggerConfig,
        enabled: bool,
    ) -> Result<String> {
        let (name, version) = split_function_ref(function_ref)?;
        let mut st = self.state.lock().unwrap();
        if !st.functions.contains_key(name) {
            return Err(ProviderError::NotFound(format!("function {name}")));
        }
        let exists = st.bindings.values().any(|b| {
            b.function == name && b.version == version && b.source_arn == trigger.source_arn
        });
        if exists {
            return Err(ProviderError::AlreadyExists(format!(
                "binding {} {function_ref}",
                trigger.source_arn
            )));
        }
        let uuid = Uuid::new_v4().to_string();
        st.bindings.insert(
            uuid.clone(),
            MockBinding {
                function: name.to_string(),
                version,
                source_arn: trigger.source_arn.clone(),
                state: if enabled { "Enabled" } else { "Disabled" }.to_string(),
                batch_size: trigger.batch_size,
            },
        );
        st.journal.push(format!(
            "create_queue_binding {function_ref} {}",
            trigger.source_arn
        ));
        Ok(uuid)
    }

    async fn list_queue_bindings(&self, function_ref: &str) -> Result<Vec<QueueBinding>> {
        let (name, version) = split_function_ref(function_ref)?;
        let st = self.state.lock().unwrap();
        Ok(st
            .bindings
            .iter()
            .filter(|(_, b)| {
                b.function == name && (version.is_none() || b.version == version)
            })
            .map(|(uuid, b)| QueueBinding {
                uuid: uuid.clone(),
                source_arn: b.source_arn.clone(),
                state: b.state.clone(),
                batch_size: b.batch_size,
            })
            .collect())
    }

    async fn set_queue_binding_enabled(&self, uuid: &str, enabled: bool) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let b = st
            .bindings
            .get_mut(uuid)
            .ok_or_else(|| ProviderError::NotFound(format!("binding {uuid}")))?;
        b.state = if enabled { "Enabled" } else { "Disabled" }.to_string();
        let (function, version, arn) = (b.function.clone(), b.version, b.source_arn.clone());
        let enabled_now = st
            .bindings
            .values()
            .filter(|b| b.function == function && b.state == "Enabled")
            .count();
        let version = version.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        st.journal.push(format!(
            "set_binding {arn} v{version} enabled={enabled} (enabled_now={enabled_now})"
        ));
        Ok(())
    }

    async fn get_queue_binding_state(&self, uuid: &str) -> Result<String> {
        let st = self.state.lock().unwrap();
        st.bindings
            .get(uuid)
            .map(|b| b.state.clone())
            .ok_or_else(|| ProviderError::NotFound(format!("binding {uuid}")))
    }

    async fn update_queue_binding_batch_size(&self, uuid: &str, batch_size: i32) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("update_binding_batch {uuid} {batch_size}"));
        let b = st
            .bindings
            .get_mut(uuid)
            .ok_or_else(|| ProviderError::NotFound(format!("binding {uuid}")))?;
        b.batch_size = Some(batch_size);
        Ok(())
    }

    async fn delete_queue_binding(&self, uuid: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("delete_binding {uuid}"));
        st.bindings
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(format!("binding {uuid}")))
    }

    async fn delete_schedule_group(&self, group: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("delete_schedule_group {group}"));
        st.schedule_groups
            .remove(group)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(format!("schedule group {group}")))
    }

    async fn create_schedule_group(&self, group: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.schedule_groups.contains_key(group) {
            return Err(ProviderError::AlreadyExists(format!(
                "schedule group {group}"
            )));
        }
        st.schedule_groups.insert(group.to_string(), Vec::new());
        st.journal.push(format!("create_schedule_group {group}"));
        Ok(())
    }

    async fn create_schedule(&self, schedule: &ScheduleConfig) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.journal.push(format!("create_schedule {}", schedule.name));
        let group = st
            .schedule_groups
            .get_mut(&schedule.group)
            .ok_or_else(|| ProviderError::NotFound(format!("schedule group {}", schedule.group)))?;
        group.push(schedule.clone());
        Ok(())
    }

    async fn ensure_repository(&self, name: &str, create: bool) -> Result<String> {
        let mut st = self.state.lock().unwrap();
        if let Some(uri) = st.repos.get(name) {
            return Ok(uri.clone());
        }
        if !create {
            return Err(ProviderError::NotFound(format!("repository {name}")));
        }
        let uri = format!(
            "{}.dkr.ecr.{}.amazonaws.com/{name}",
            self.account, self.region
        );
        st.repos.insert(name.to_string(), uri.clone());
        st.journal.push(format!("create_repository {name}"));
        Ok(uri)
    }

    async fn registry_auth(&self) -> Result<RegistryAuth> {
        Ok(RegistryAuth {
            username: "AWS".to_string(),
            password: "mock-token".to_string(),
            endpoint: format!("https://{}.dkr.ecr.{}.amazonaws.com", self.account, self.region),
        })
    }

    async fn function_log_events(
        &self,
        _name: &str,
        _version: i64,
        _start_ms: i64,
    ) -> Result<Vec<LogEvent>> {
        Ok(Vec::new())
    }
}
