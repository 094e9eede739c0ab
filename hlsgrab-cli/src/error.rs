use std::path::PathBuf;

use hlsgrab_engine::HlsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Engine(#[from] HlsError),

    #[error("Invalid config file {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AppError {
    /// Process exit code: 130 after Ctrl-C, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Engine(HlsError::Cancelled) => 130,
            _ => 1,
        }
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
