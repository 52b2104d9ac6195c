use portrait_core::RegionWeights;
use portrait_ingest::catalog::DEFAULT_LISTING_URL;
use portrait_ingest::pipeline::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_IMAGE_BYTES, DEFAULT_MIN_IMAGE_BYTES,
};
use portrait_ingest::PipelineConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid weights file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for downloaded paintings and face crops.
    pub data_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Listing page URL with a `{page}` placeholder.
    pub listing_url: String,
    /// Extraction workers (0 = available parallelism).
    pub compute_workers: usize,
    pub io_workers: usize,
    pub fetch_timeout_secs: u64,
    pub min_image_bytes: usize,
    pub max_image_bytes: usize,
    pub max_attempts: u32,
    /// Default number of matches returned by `query`.
    pub top_k: usize,
    /// Optional TOML file overriding the region weights.
    pub weights_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `PORTRAIT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = var("PORTRAIT_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                    PathBuf::from(home).join(".local/share")
                })
                .join("portrait")
        });

        let db_path = var("PORTRAIT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("portrait.db"));

        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse().ok());

        Self {
            listing_url: var("PORTRAIT_LISTING_URL")
                .unwrap_or_else(|| DEFAULT_LISTING_URL.to_string()),
            compute_workers: parsed("PORTRAIT_COMPUTE_WORKERS").unwrap_or(0),
            io_workers: parsed("PORTRAIT_IO_WORKERS").unwrap_or(8),
            fetch_timeout_secs: var("PORTRAIT_FETCH_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(10),
            min_image_bytes: parsed("PORTRAIT_MIN_IMAGE_BYTES").unwrap_or(DEFAULT_MIN_IMAGE_BYTES),
            max_image_bytes: parsed("PORTRAIT_MAX_IMAGE_BYTES").unwrap_or(DEFAULT_MAX_IMAGE_BYTES),
            max_attempts: var("PORTRAIT_MAX_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            top_k: parsed("PORTRAIT_TOP_K").unwrap_or(3),
            weights_path: var("PORTRAIT_WEIGHTS_PATH").map(PathBuf::from),
            data_dir,
            db_path,
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join("paintings")
    }

    pub fn face_dir(&self) -> PathBuf {
        self.data_dir.join("faces")
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn pipeline(&self, first_page: u32, page_count: u32) -> PipelineConfig {
        PipelineConfig {
            first_page,
            page_count,
            compute_workers: self.compute_workers,
            io_workers: self.io_workers,
            download_dir: self.download_dir(),
            min_image_bytes: self.min_image_bytes,
            max_image_bytes: self.max_image_bytes,
            max_attempts: self.max_attempts,
        }
    }

    /// Region weights from `weights_path`, or the defaults when unset.
    pub fn region_weights(&self) -> Result<RegionWeights, ConfigError> {
        match &self.weights_path {
            Some(path) => load_weights(path),
            None => Ok(RegionWeights::default()),
        }
    }
}

fn load_weights(path: &Path) -> Result<RegionWeights, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
