use std::fmt;

#[derive(Debug)]
pub enum CraftSyncError {
    Storage(String),
    Serialization(String),
    IO(String),
    QueueFull(String),
    NotFound(String),
    InvalidOperation(String),
    Timeout(String),
    Executor(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
}

impl fmt::Display for CraftSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CraftSyncError::Storage(e) => write!(f, "Storage error: {}", e),
            CraftSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            CraftSyncError::IO(e) => write!(f, "IO error: {}", e),
            CraftSyncError::QueueFull(e) => write!(f, "Queue is full: {}", e),
            CraftSyncError::NotFound(e) => write!(f, "Not found: {}", e),
            CraftSyncError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            CraftSyncError::Timeout(e) => write!(f, "Timeout: {}", e),
            CraftSyncError::Executor(e) => write!(f, "Executor error: {}", e),
            CraftSyncError::Config(e) => write!(f, "Config error: {}", e),
            CraftSyncError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            CraftSyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
        }
    }
}

impl std::error::Error for CraftSyncError {}

impl From<std::io::Error> for CraftSyncError {
    fn from(error: std::io::Error) -> Self {
        CraftSyncError::IO(error.to_string())
    }
}

impl From<serde_json::Error> for CraftSyncError {
    fn from(error: serde_json::Error) -> Self {
        CraftSyncError::Serialization(error.to_string())
    }
}

impl From<sled::Error> for CraftSyncError {
    fn from(error: sled::Error) -> Self {
        CraftSyncError::Storage(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CraftSyncError>;
