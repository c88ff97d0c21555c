use serde::{Deserialize, Serialize};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Transport(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Timeout(String),

    #[error("Dependency cycle between themes: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Invalid theme manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("File watch failed: {0}")]
    Watch(#[from] notify::Error),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transport(msg: impl ToString) -> Self {
        Self::Transport(msg.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The uniform `{success, message}` shape every surface call answers with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl<T> From<Result<T>> for Outcome {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}
