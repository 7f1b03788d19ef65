use std::io;

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("failed to serialize value for key {key:?}")]
    Serialize {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to deserialize value for key {key:?}")]
    Deserialize {
        key: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("key decoder could not invert filename {filename:?}")]
    KeyEncoding { filename: String },

    #[error("cache instance requires a non-empty name")]
    NotConfigured,

    #[error("cache error: {source}")]
    Generic {
        #[from]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;
