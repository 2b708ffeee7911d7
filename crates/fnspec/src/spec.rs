use std::collections::BTreeMap;
use std::io::{Read, Write};

use glob::{MatchOptions, Pattern};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpecError};

/// Special role name that asks the publisher to generate a role from the
/// default policy plus the spec's extra statements.
pub const ROLE_GENERATE: &str = "generate";

static ECR_IMAGE_PAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.dkr\.ecr\.[^.]+\.amazonaws\.com/").unwrap());

/// An EFS filesystem mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EfsMount {
    /// ARN of the EFS access point.
    pub arn: String,
    /// Path to mount the filesystem at inside the function.
    pub path: String,
}

/// A single IAM policy statement attached to a generated role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePolicy {
    pub effect: String,
    pub action: Vec<String>,
    pub resource: Vec<String>,
}

/// CORS configuration applied to the function URL at deploy time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cors {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origins: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
}

/// An SQS queue trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqsTrigger {
    pub arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_window: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<i32>,
}

/// The specification of a function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub image: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_extra_policy: Vec<RolePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_repo: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_size: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpc_security_group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpc_subnet_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub efs_mounts: Vec<EfsMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_account_regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<Cors>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sqs_triggers: Vec<SqsTrigger>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cron: BTreeMap<String, String>,

    #[serde(skip)]
    allowed_globs: Vec<Pattern>,
}

// Account/region globs treat ':' as a separator that '*' must not cross.
// The glob crate only knows '/' as a literal separator, so both pattern and
// candidate are mapped ':' -> '/' before matching.
const GLOB_OPTS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl Spec {
    /// Loads and validates a spec from the given reader, substituting
    /// `{{KEY}}` placeholders from `vars` over the raw document first.
    pub fn load(mut r: impl Read, vars: &BTreeMap<String, String>) -> Result<Spec> {
        let mut doc = String::new();
        r.read_to_string(&mut doc)?;
        for (k, v) in vars {
            doc = doc.replace(&format!("{{{{{k}}}}}"), v);
        }

        let mut spec: Spec = serde_yaml::from_str(&doc)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&mut self) -> Result<()> {
        if self.name.is_empty() || self.image.is_empty() || self.role.is_empty() {
            return Err(SpecError::Invalid(
                "name, image and role must be specified".into(),
            ));
        }
        if !self.role_extra_policy.is_empty() && self.role != ROLE_GENERATE {
            return Err(SpecError::Invalid(
                "role_extra_policy can only be used with role: generate".into(),
            ));
        }
        for p in &self.role_extra_policy {
            if p.effect.is_empty() || p.action.is_empty() || p.resource.is_empty() {
                return Err(SpecError::Invalid(
                    "role_extra_policy items must have effect, action and resource".into(),
                ));
            }
        }
        if let Some(m) = self.memory {
            if !(128..=10240).contains(&m) {
                return Err(SpecError::Invalid(
                    "memory must be between 128 and 10240 MB".into(),
                ));
            }
        }
        if let Some(t) = self.timeout {
            if !(3..=900).contains(&t) {
                return Err(SpecError::Invalid(
                    "timeout must be between 3 and 900".into(),
                ));
            }
        }
        if let Some(t) = self.temp_size {
            if !(512..=10240).contains(&t) {
                return Err(SpecError::Invalid(
                    "temp_size must be between 512 and 10240".into(),
                ));
            }
        }

        self.allowed_globs = self
            .allowed_account_regions
            .iter()
            .map(|a| {
                Pattern::new(&a.replace(':', "/")).map_err(|_| SpecError::InvalidGlob(a.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        if ECR_IMAGE_PAT.is_match(&self.image) {
            if !self.repo_name.is_empty() || self.create_repo.is_some() {
                return Err(SpecError::Invalid(
                    "repo_name and create_repo can only be used with non-registry images".into(),
                ));
            }
        } else {
            if self.create_repo.is_none() {
                self.create_repo = Some(true);
            }
            if self.repo_name.is_empty() {
                self.repo_name = self.name.clone();
            }
        }

        for t in &mut self.sqs_triggers {
            if t.arn.is_empty() {
                return Err(SpecError::Invalid("sqs_triggers must have an arn".into()));
            }
            let batch = *t.batch_size.get_or_insert(1);
            if !(1..=10000).contains(&batch) {
                return Err(SpecError::Invalid(
                    "sqs_triggers batch_size must be between 1 and 10000".into(),
                ));
            }
            if let Some(w) = t.batch_window {
                if !(0..=300).contains(&w) {
                    return Err(SpecError::Invalid(
                        "sqs_triggers batch_window must be between 0 and 300".into(),
                    ));
                }
            }
            if batch >= 10 && t.batch_window.is_none() {
                t.batch_window = Some(1);
            }
            if let Some(c) = t.concurrency {
                if !(2..=1000).contains(&c) {
                    return Err(SpecError::Invalid(
                        "sqs_triggers concurrency must be between 2 and 1000".into(),
                    ));
                }
            }
        }

        if !self.image.contains(':') {
            self.image.push_str(":latest");
        }

        Ok(())
    }

    /// Saves the spec as canonical YAML. Empty collections are omitted.
    pub fn save(&self, mut w: impl Write) -> Result<()> {
        let doc = serde_yaml::to_string(self)?;
        w.write_all(doc.as_bytes())?;
        Ok(())
    }

    /// Returns true if the given account and region are allowed by the spec.
    /// An empty glob list allows everything.
    pub fn is_account_region_allowed(&self, account: &str, region: &str) -> bool {
        if self.allowed_globs.is_empty() {
            return true;
        }
        let acc_reg = format!("{account}/{region}");
        self.allowed_globs
            .iter()
            .any(|g| g.matches_with(&acc_reg, GLOB_OPTS))
    }

    /// Returns true if the image lives outside the managed registry and must
    /// be prepared and pushed before publishing.
    pub fn needs_build_and_push(&self) -> bool {
        !ECR_IMAGE_PAT.is_match(&self.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(doc: &str) -> Result<Spec> {
        Spec::load(doc.as_bytes(), &BTreeMap::new())
    }

    const MINIMAL: &str = "name: app1\nimage: myapp\nrole: generate\n";

    #[test]
    fn minimal_spec_defaults() {
        let s = load(MINIMAL).unwrap();
        assert_eq!(s.image, "myapp:latest");
        assert_eq!(s.repo_name, "app1");
        assert_eq!(s.create_repo, Some(true));
        assert!(s.needs_build_and_push());
    }

    #[test]
    fn registry_image_skips_build() {
        let s = load(
            "name: app1\nimage: 123456789012.dkr.ecr.us-west-2.amazonaws.com/app1:latest\nrole: r\n",
        )
        .unwrap();
        assert!(!s.needs_build_and_push());
        assert!(s.repo_name.is_empty());
        assert_eq!(s.create_repo, None);
    }

    #[test]
    fn registry_image_rejects_repo_fields() {
        let err = load(
            "name: a\nimage: 1.dkr.ecr.us-west-2.amazonaws.com/a\nrole: r\nrepo_name: x\n",
        );
        assert!(err.is_err());
    }

    #[test]
    fn missing_required_fields() {
        assert!(load("name: a\nimage: i\n").is_err());
        assert!(load("image: i\nrole: r\n").is_err());
    }

    #[test]
    fn numeric_bounds() {
        assert!(load("name: a\nimage: i\nrole: r\nmemory: 64\n").is_err());
        assert!(load("name: a\nimage: i\nrole: r\nmemory: 10241\n").is_err());
        assert!(load("name: a\nimage: i\nrole: r\ntimeout: 2\n").is_err());
        assert!(load("name: a\nimage: i\nrole: r\ntemp_size: 256\n").is_err());
        assert!(load("name: a\nimage: i\nrole: r\nmemory: 128\ntimeout: 900\n").is_ok());
    }

    #[test]
    fn extra_policy_requires_generate() {
        let doc = "name: a\nimage: i\nrole: arn:aws:iam::1:role/r\nrole_extra_policy:\n  - effect: Allow\n    action: [s3:GetObject]\n    resource: ['*']\n";
        assert!(load(doc).is_err());
    }

    #[test]
    fn sqs_trigger_defaults_and_bounds() {
        let s = load("name: a\nimage: i\nrole: r\nsqs_triggers:\n  - arn: arn:aws:sqs:us-west-2:1:q\n").unwrap();
        assert_eq!(s.sqs_triggers[0].batch_size, Some(1));
        assert_eq!(s.sqs_triggers[0].batch_window, None);

        let s = load("name: a\nimage: i\nrole: r\nsqs_triggers:\n  - arn: arn:aws:sqs:us-west-2:1:q\n    batch_size: 10\n").unwrap();
        assert_eq!(s.sqs_triggers[0].batch_window, Some(1));

        assert!(load("name: a\nimage: i\nrole: r\nsqs_triggers:\n  - arn: q\n    concurrency: 1\n").is_err());
        assert!(load("name: a\nimage: i\nrole: r\nsqs_triggers:\n  - arn: q\n    batch_window: 301\n").is_err());
    }

    #[test]
    fn account_region_globs() {
        let s = load(MINIMAL).unwrap();
        assert!(s.is_account_region_allowed("1", "anywhere"));

        let s = load("name: a\nimage: i\nrole: r\nallowed_account_regions:\n  - '123456789012:*'\n").unwrap();
        assert!(s.is_account_region_allowed("123456789012", "us-west-2"));
        assert!(!s.is_account_region_allowed("999999999999", "us-west-2"));

        // '*' must not cross the account:region separator.
        let s = load("name: a\nimage: i\nrole: r\nallowed_account_regions:\n  - '*'\n").unwrap();
        assert!(!s.is_account_region_allowed("123456789012", "us-west-2"));
        let s = load("name: a\nimage: i\nrole: r\nallowed_account_regions:\n  - '*:*'\n").unwrap();
        assert!(s.is_account_region_allowed("123456789012", "us-west-2"));
    }

    #[test]
    fn placeholder_substitution() {
        let mut vars = BTreeMap::new();
        vars.insert("IMG".to_string(), "repo/app:1".to_string());
        let s = Spec::load(
            "name: a\nimage: '{{IMG}}'\nrole: r\n".as_bytes(),
            &vars,
        )
        .unwrap();
        assert_eq!(s.image, "repo/app:1");
    }

    #[test]
    fn save_load_round_trip() {
        let doc = "name: app1\nimage: myapp:v3\nrole: generate\nenv:\n  A: '1'\n  B: '2'\nmemory: 512\ncron:\n  nightly: 0 2 * * ? *\nsqs_triggers:\n  - arn: arn:aws:sqs:us-west-2:1:q\n    batch_size: 20\nallowed_account_regions:\n  - '123:us-*'\n";
        let s = load(doc).unwrap();
        let mut out = Vec::new();
        s.save(&mut out).unwrap();
        let s2 = Spec::load(out.as_slice(), &BTreeMap::new()).unwrap();
        assert_eq!(s, s2);
    }
}
