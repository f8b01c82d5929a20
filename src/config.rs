//! Static configuration for indexing, querying and serving.
//!
//! Values come from an optional JSON file and are then overridden by
//! `SIAMESE_*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::IndexKind;

/// Channel order expected by an exported ONNX embedding head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// batch, height, width, channels (Keras export)
    #[default]
    Nhwc,
    /// batch, channels, height, width (PyTorch export)
    Nchw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model input size as (width, height).
    pub image_size: (u32, u32),
    pub embedding_dim: usize,
    /// Training hyper-parameters. Nothing here trains; they are carried in
    /// the file so one config serves the external trainer that produces
    /// `model_path`.
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Margin used by triplet evaluation.
    pub margin: f32,
    /// Default number of neighbours returned by a query.
    pub n_results: usize,
    pub normalize_embeddings: bool,

    /// Corpus that gets indexed.
    pub data: PathBuf,
    /// Images used by `query` when no single image is given.
    pub query_data: PathBuf,
    /// Class-per-directory dataset for triplet evaluation.
    pub valid_data: PathBuf,

    /// Embedding model checkpoint (`.json` projection model or `.onnx`).
    pub model_path: PathBuf,
    pub onnx_layout: TensorLayout,

    pub index_kind: IndexKind,
    pub index_path: PathBuf,

    pub bind: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_size: (224, 224),
            embedding_dim: 128,
            batch_size: 8,
            learning_rate: 1e-4,
            margin: 0.5,
            n_results: 9,
            normalize_embeddings: true,
            data: PathBuf::from("data/images"),
            query_data: PathBuf::from("data/query"),
            valid_data: PathBuf::from("data/valid"),
            model_path: PathBuf::from("output/model.json"),
            onnx_layout: TensorLayout::default(),
            index_kind: IndexKind::FlatIp,
            index_path: PathBuf::from("output/index.ssix"),
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

impl Config {
    /// Read the config file if it exists, fall back to defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            Some(p) => {
                return Err(Error::Config(format!(
                    "config file not found: '{}'",
                    p.display()
                )));
            }
            None => {
                let default_path = Path::new("siamese.json");
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `SIAMESE_*` overrides. The lookup is injected so tests don't
    /// have to touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SIAMESE_DATA") {
            self.data = v.into();
        }
        if let Some(v) = lookup("SIAMESE_QUERY_DATA") {
            self.query_data = v.into();
        }
        if let Some(v) = lookup("SIAMESE_VALID_DATA") {
            self.valid_data = v.into();
        }
        if let Some(v) = lookup("SIAMESE_MODEL") {
            self.model_path = v.into();
        }
        if let Some(v) = lookup("SIAMESE_INDEX") {
            self.index_path = v.into();
        }
        if let Some(v) = lookup("SIAMESE_INDEX_KIND") {
            self.index_kind = v.parse()?;
        }
        if let Some(v) = lookup("SIAMESE_N_RESULTS") {
            self.n_results = parse_env("SIAMESE_N_RESULTS", &v)?;
        }
        if let Some(v) = lookup("SIAMESE_EMBEDDING_DIM") {
            self.embedding_dim = parse_env("SIAMESE_EMBEDDING_DIM", &v)?;
        }
        if let Some(v) = lookup("SIAMESE_BIND") {
            self.bind = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let (w, h) = self.image_size;
        if w == 0 || h == 0 {
            return Err(Error::Config(format!("image_size must be non-zero, got {w}x{h}")));
        }
        if self.embedding_dim == 0 {
            return Err(Error::Config("embedding_dim must be greater than 0".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if !(self.margin.is_finite() && self.margin >= 0.0) {
            return Err(Error::Config(format!("margin must be >= 0, got {}", self.margin)));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse '{value}'")))
}
