use hlsvault_engine::FailureReport;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] hlsvault_engine::DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Task {task_id} failed: {}", report.message)]
    TaskFailed {
        task_id: String,
        report: FailureReport,
    },

    #[error("Task {0} was cancelled")]
    Cancelled(String),
}
