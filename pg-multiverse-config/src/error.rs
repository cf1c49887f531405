use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration invalid: {0:?}")]
    Invalid(Vec<String>),
}
