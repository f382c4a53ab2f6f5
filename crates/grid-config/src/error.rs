//! Configuration error types.

use std::path::PathBuf;

/// Failure to load or persist `config.ron`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file or its directory could not be read or written.
    #[error("config file {}: {source}", path.display())]
    Io {
        /// File or directory involved.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid RON for [`Config`](crate::Config).
    #[error("config file {} is invalid: {source}", path.display())]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    /// The config could not be rendered as RON.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] ron::Error),
}
