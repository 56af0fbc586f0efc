//! Crate-wide error types.

use thiserror::Error;

pub type ProfResult<T> = Result<T, ProfError>;

#[derive(Debug, Error)]
pub enum ProfError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("zip error: {0}")]
    Zip(String),
}

impl From<zip::result::ZipError> for ProfError {
    fn from(value: zip::result::ZipError) -> Self {
        Self::Zip(value.to_string())
    }
}

impl From<walkdir::Error> for ProfError {
    fn from(value: walkdir::Error) -> Self {
        let msg = value.to_string();
        Self::Io(
            value
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other(msg)),
        )
    }
}
