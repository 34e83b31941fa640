use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Error> for diram_mem::AllocError {
    fn from(e: Error) -> Self {
        diram_mem::AllocError::Sink(e.to_string())
    }
}
