use thiserror::Error;

/// Failure classes of a run.
///
/// `Config`, `Provider` and `Download` raised while generating are demoted to a
/// fallback copy by the orchestrator. `Fatal` ends the process with a non-zero status.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("download error: {0}")]
    Download(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Fatal(_))
    }
}

impl From<reqwest::Error> for RunError {
    fn from(e: reqwest::Error) -> Self {
        RunError::Provider(e.to_string())
    }
}
