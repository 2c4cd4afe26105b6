use routelens_core::{InvariantError, Route};
use routelens_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("daily divisions must be positive and divide a day evenly, got {0}")]
    InvalidDailyDivisions(u32),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Invariant(#[from] InvariantError),
    #[error("{} of {} pending route updates failed", .failures.len(), .attempted)]
    PendingUpdates {
        attempted: usize,
        failures: Vec<(Route, StoreError)>,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;
