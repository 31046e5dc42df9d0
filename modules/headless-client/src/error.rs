use thiserror::Error;

pub type Result<T> = std::result::Result<T, HeadlessError>;

#[derive(Error, Debug)]
pub enum HeadlessError {
    #[error("render API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl HeadlessError {
    /// Whether the failure is worth retrying on a later attempt. 4xx answers
    /// from the render service describe the target page and will not change.
    pub fn is_transient(&self) -> bool {
        match self {
            HeadlessError::Api { status, .. } => *status >= 500 || *status == 429,
            HeadlessError::Http(e) => e.is_timeout() || e.is_connect(),
        }
    }
}
