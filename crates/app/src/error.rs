use thiserror::Error;

use routelens_core::InvariantError;
use routelens_engine::{ConfigError, EngineError};
use routelens_store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Invariant(#[from] InvariantError),
}

pub type Result<T> = std::result::Result<T, AppError>;
