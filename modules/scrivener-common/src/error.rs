use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScrivenerError>;

#[derive(Error, Debug)]
pub enum ScrivenerError {
    #[error("database error: {0}")]
    Database(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("index lock conflict: another ingestion process holds the advisory lock")]
    LockConflict,

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
