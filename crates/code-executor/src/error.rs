use crate::config::ConfigError;
use crate::pool::PoolError;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
