use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "MIEND_MATCH_THRESHOLD must be set (squared-L2 distance cutoff; \
         faces closer than this to an enrolled embedding are a match)"
    )]
    MissingThreshold,
    #[error("MIEND_MATCH_THRESHOLD is not a valid number: {0:?}")]
    BadThreshold(String),
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_addr: String,
    /// Path to the SQLite catalogue file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Squared-L2 distance below which a face matches an enrolled identity.
    /// Required; there is no sensible universal default.
    pub match_threshold: f32,
    /// Embedding dimensionality the catalogue and index are configured for.
    pub embedding_dim: usize,
    /// When set, enrollment images are retained here and referenced from
    /// the embedding record.
    pub upload_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `MIEND_*` environment variables.
    ///
    /// Every key has a default except the match threshold, which must be
    /// configured explicitly.
    pub fn from_env() -> Result<Self, ConfigError> {
        let model_dir = std::env::var("MIEND_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| mien_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("mien");

        let db_path = std::env::var("MIEND_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("catalogue.db"));

        let match_threshold = match std::env::var("MIEND_MATCH_THRESHOLD") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::BadThreshold(raw))?,
            Err(_) => return Err(ConfigError::MissingThreshold),
        };

        Ok(Self {
            bind_addr: std::env::var("MIEND_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8787".to_string()),
            db_path,
            model_dir,
            match_threshold,
            embedding_dim: env_usize("MIEND_EMBEDDING_DIM", 512),
            upload_dir: std::env::var("MIEND_UPLOAD_DIR").ok().map(PathBuf::from),
        })
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
