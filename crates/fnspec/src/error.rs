use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpecError {
    #[error("invalid spec: {0}")]
    Invalid(String),

    #[error("invalid allowed_account_regions pattern: {0}")]
    InvalidGlob(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpecError>;
