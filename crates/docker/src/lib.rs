//! Container image preparation for lambdafy.
//!
//! Rewrites an already-built image so the runtime adapter runs as its
//! entrypoint prefix, and pushes prepared images to the managed registry
//! under a content-addressed tag.

pub mod error;
pub mod image;

pub use error::{DockerError, Result};
pub use image::{
    AdapterBinary, ImageDetails, ImageManager, PrepareAction, PROXY_CHECKSUM_LABEL, PROXY_PATH,
};
