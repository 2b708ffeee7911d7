use std::collections::HashMap;

use bollard::auth::DockerCredentials;
use bollard::query_parameters::{BuildImageOptions, PushImageOptions, TagImageOptions};
use bollard::Docker;
use futures_util::stream::TryStreamExt;
use provider::RegistryAuth;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{DockerError, Result};

/// Label carrying the checksum of the adapter baked into an image.
pub const PROXY_CHECKSUM_LABEL: &str = "lambdafy.proxy.checksum";

/// Path of the adapter inside prepared images.
pub const PROXY_PATH: &str = "/lambdafy-proxy";

/// The runtime adapter binary together with its content hash.
pub struct AdapterBinary {
    bytes: Vec<u8>,
    sha256_hex: String,
}

impl AdapterBinary {
    /// The hash is computed once here and reused everywhere downstream.
    pub fn new(bytes: Vec<u8>) -> Self {
        let sha256_hex = hex::encode(Sha256::digest(&bytes));
        AdapterBinary { bytes, sha256_hex }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sha256_hex(&self) -> &str {
        &self.sha256_hex
    }
}

/// What the daemon reports about an image, reduced to the parts we act on.
#[derive(Debug, Clone, Default)]
pub struct ImageDetails {
    pub id: String,
    pub architecture: String,
    pub os: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Outcome of planning a preparation run.
#[derive(Debug, Clone, PartialEq)]
pub enum PrepareAction {
    /// Image already carries the current adapter.
    Skip,
    /// Rebuild with the synthesized Dockerfile.
    Build { dockerfile: String },
}

/// Decides whether an image needs rebuilding and synthesizes the Dockerfile
/// if so. Pure so it can be tested without a daemon.
pub fn plan_prepare(details: &ImageDetails, image: &str, adapter_sha256_hex: &str) -> Result<PrepareAction> {
    if details.labels.get(PROXY_CHECKSUM_LABEL).map(String::as_str) == Some(adapter_sha256_hex) {
        return Ok(PrepareAction::Skip);
    }

    if details.architecture != "amd64" || details.os != "linux" {
        return Err(DockerError::UnsupportedPlatform(format!(
            "image '{}' must be linux/amd64, got {}/{}",
            image, details.os, details.architecture
        )));
    }

    // A previously prepared image already has the adapter at the front of
    // its entrypoint; drop it so it is not doubled up.
    let mut entrypoint = details.entrypoint.clone();
    if entrypoint.first().map(String::as_str) == Some(PROXY_PATH) {
        entrypoint.remove(0);
    }

    let mut full_entrypoint = vec![PROXY_PATH.to_string()];
    full_entrypoint.extend(entrypoint);
    let ep_json = serde_json::to_string(&full_entrypoint)
        .map_err(|e| DockerError::BuildFailed(e.to_string()))?;
    let cmd_json =
        serde_json::to_string(&details.cmd).map_err(|e| DockerError::BuildFailed(e.to_string()))?;

    let dockerfile = format!(
        "FROM --platform=linux/amd64 {image}\n\
         RUN rm -f {PROXY_PATH}\n\
         COPY lambdafy-proxy /\n\
         ENTRYPOINT {ep_json}\n\
         CMD {cmd_json}\n\
         LABEL \"{PROXY_CHECKSUM_LABEL}\"=\"{adapter_sha256_hex}\"\n"
    );

    Ok(PrepareAction::Build { dockerfile })
}

/// Builds the in-memory build context: the Dockerfile plus the adapter at
/// mode 0775. Timestamps are pinned to zero so the context bytes are
/// reproducible for a given adapter.
pub fn build_context(dockerfile: &str, adapter: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;

    let mut header = tar::Header::new_gnu();
    header.set_size(adapter.len() as u64);
    header.set_mode(0o775);
    header.set_mtime(0);
    builder.append_data(&mut header, "lambdafy-proxy", adapter)?;

    Ok(builder.into_inner()?)
}

/// Content-addressed destination tag for a pushed image: the hex SHA-256 of
/// the image id.
pub fn content_tag(image_id: &str) -> String {
    hex::encode(Sha256::digest(image_id.as_bytes()))
}

pub struct ImageManager {
    docker: Docker,
}

impl ImageManager {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::ConnectionError(e.to_string()))?;
        Ok(ImageManager { docker })
    }

    pub async fn inspect(&self, image: &str) -> Result<ImageDetails> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|e| DockerError::ImageNotFound(format!("{image}: {e}")))?;
        let config = inspect.config.unwrap_or_default();
        Ok(ImageDetails {
            id: inspect.id.unwrap_or_default(),
            architecture: inspect.architecture.unwrap_or_default(),
            os: inspect.os.unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
        })
    }

    /// Rewrites `image` in place so the adapter runs as its entrypoint
    /// prefix. A no-op when the image already carries the current adapter.
    pub async fn prepare(&self, image: &str, adapter: &AdapterBinary) -> Result<()> {
        let details = self.inspect(image).await?;

        let dockerfile = match plan_prepare(&details, image, adapter.sha256_hex())? {
            PrepareAction::Skip => {
                info!("image '{image}' already carries the current adapter - skipping");
                return Ok(());
            }
            PrepareAction::Build { dockerfile } => dockerfile,
        };

        debug!("rebuilding '{image}' with adapter {}", adapter.sha256_hex());

        let context = build_context(&dockerfile, adapter.bytes())?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: Some(image.to_string()),
            platform: "linux/amd64".to_string(),
            ..Default::default()
        };

        let mut build_stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(context.into())));
        while let Some(msg) = build_stream.try_next().await? {
            if let Some(err) = msg.error {
                return Err(DockerError::BuildFailed(err));
            }
        }

        info!("image '{image}' prepared");
        Ok(())
    }

    /// Tags the image into `repo_uri` under its content-addressed tag and
    /// pushes it. Returns the pushed reference.
    pub async fn push(&self, image: &str, repo_uri: &str, auth: &RegistryAuth) -> Result<String> {
        let details = self.inspect(image).await?;
        let tag = content_tag(&details.id);
        let pushed = format!("{repo_uri}:{tag}");

        debug!("tagging '{image}' as '{pushed}'");
        self.docker
            .tag_image(
                image,
                Some(TagImageOptions {
                    repo: Some(repo_uri.to_string()),
                    tag: Some(tag.clone()),
                }),
            )
            .await?;

        info!("pushing '{pushed}'");
        let credentials = DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: Some(auth.endpoint.clone()),
            ..Default::default()
        };
        let mut push_stream = self.docker.push_image(
            repo_uri,
            Some(PushImageOptions {
                tag: Some(tag),
                platform: None,
            }),
            Some(credentials),
        );
        while let Some(msg) = push_stream.try_next().await? {
            if let Some(err) = msg.error {
                return Err(DockerError::PushFailed(err));
            }
        }

        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(entrypoint: &[&str], labels: &[(&str, &str)]) -> ImageDetails {
        ImageDetails {
            id: "sha256:abcd".to_string(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            entrypoint: entrypoint.iter().map(|s| s.to_string()).collect(),
            cmd: vec!["serve".to_string()],
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn matching_checksum_is_a_noop() {
        let d = details(&["/bin/app"], &[(PROXY_CHECKSUM_LABEL, "cafe")]);
        let action = plan_prepare(&d, "img", "cafe").unwrap();
        assert_eq!(action, PrepareAction::Skip);
    }

    #[test]
    fn stale_checksum_triggers_rebuild() {
        let d = details(&["/bin/app"], &[(PROXY_CHECKSUM_LABEL, "old")]);
        match plan_prepare(&d, "img", "new").unwrap() {
            PrepareAction::Build { dockerfile } => {
                assert!(dockerfile.contains("ENTRYPOINT [\"/lambdafy-proxy\",\"/bin/app\"]"));
                assert!(dockerfile.contains("LABEL \"lambdafy.proxy.checksum\"=\"new\""));
            }
            other => panic!("expected rebuild, got {other:?}"),
        }
    }

    #[test]
    fn wrong_platform_is_rejected() {
        let mut d = details(&[], &[]);
        d.architecture = "arm64".to_string();
        assert!(matches!(
            plan_prepare(&d, "img", "x"),
            Err(DockerError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn existing_adapter_prefix_is_stripped() {
        let d = details(&["/lambdafy-proxy", "/bin/app", "-v"], &[]);
        match plan_prepare(&d, "img", "x").unwrap() {
            PrepareAction::Build { dockerfile } => {
                assert!(
                    dockerfile.contains("ENTRYPOINT [\"/lambdafy-proxy\",\"/bin/app\",\"-v\"]")
                );
                assert!(dockerfile.contains("CMD [\"serve\"]"));
            }
            other => panic!("expected rebuild, got {other:?}"),
        }
    }

    #[test]
    fn context_is_reproducible() {
        let a = build_context("FROM x\n", b"adapter").unwrap();
        let b = build_context("FROM x\n", b"adapter").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn content_tag_is_hex_sha256_of_id() {
        let tag = content_tag("sha256:abcd");
        assert_eq!(tag.len(), 64);
        assert_eq!(tag, content_tag("sha256:abcd"));
        assert_ne!(tag, content_tag("sha256:other"));
    }
}
