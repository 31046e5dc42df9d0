use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("feed parse error: {0}")]
    Feed(String),

    #[error("artifact integrity failure: {0}")]
    Integrity(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
