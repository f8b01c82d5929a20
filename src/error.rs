use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("model doesn't exist: '{0}'")]
    ModelNotFound(PathBuf),

    #[error("failed to decode image '{path}': {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("dim mismatch: {actual} != {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("row {row} out of range (index has {len} rows)")]
    RowOutOfRange { row: usize, len: usize },

    #[error("no images found under '{0}'")]
    EmptyCorpus(PathBuf),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("invalid index file '{path}': {reason}")]
    IndexFormat { path: PathBuf, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

impl Error {
    pub(crate) fn index_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::IndexFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
