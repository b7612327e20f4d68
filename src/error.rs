use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("query memory exhausted: requested {requested} bytes")]
    QueryMemoryExhausted { requested: usize },

    #[error("execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, DbError>;
