use thiserror::Error;

/// The error taxonomy surfaced by the core. Adapter failures never reach this
/// type directly — the Detector converts them into non-spam `CheckResult`s
/// before they can propagate (see `detector::run_check`).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InputInvalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage unavailable: {0}")]
    StorageTransient(#[source] sqlx::Error),

    #[error("external adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CoreError::NotFound(err.to_string()),
            _ => CoreError::StorageTransient(err),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors from the out-of-scope collaborators (platform client, reputation
/// lookup, LLM veto). The Detector and Pipeline both treat these as "the
/// check didn't run", never as a reason to fail the surrounding request.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("adapter transport error: {0}")]
    Transport(String),

    #[error("adapter returned an unexpected response: {0}")]
    BadResponse(String),
}
