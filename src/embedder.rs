//! Embedding models: image tensor in, fixed-length vector out.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::preprocess::{ImageTensor, Preprocessor};
use crate::vector::{all_finite, l2_normalize};

pub trait Embedder: Send + Sync {
    /// Length of every vector returned by [`Embedder::embed`].
    fn dim(&self) -> usize;
    /// Input size (width, height) the model was built for.
    fn input_size(&self) -> (u32, u32);
    fn embed(&self, image: &ImageTensor) -> Result<Vec<f32>>;
    fn describe(&self) -> String;
}

impl fmt::Debug for dyn Embedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Decode, preprocess and embed one file. Indexer and query engine both go
/// through here.
pub fn embed_file(
    embedder: &dyn Embedder,
    pre: &Preprocessor,
    path: &Path,
    normalize: bool,
) -> Result<Vec<f32>> {
    let tensor = pre.load(path)?;
    finish(embedder, &tensor, normalize)
}

pub fn embed_bytes(
    embedder: &dyn Embedder,
    pre: &Preprocessor,
    bytes: &[u8],
    normalize: bool,
) -> Result<Vec<f32>> {
    let tensor = pre.load_bytes(bytes)?;
    finish(embedder, &tensor, normalize)
}

pub fn finish(embedder: &dyn Embedder, tensor: &ImageTensor, normalize: bool) -> Result<Vec<f32>> {
    let mut v = embedder.embed(tensor)?;
    if v.len() != embedder.dim() {
        return Err(Error::DimensionMismatch {
            expected: embedder.dim(),
            actual: v.len(),
        });
    }
    if !all_finite(&v) {
        return Err(Error::Inference("embedding contains non-finite values".into()));
    }
    if normalize {
        l2_normalize(&mut v);
    }
    Ok(v)
}

/// Load the model named by `config.model_path`. A missing file is fatal.
pub fn load_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    let path = &config.model_path;
    if !path.exists() {
        return Err(Error::ModelNotFound(path.clone()));
    }
    tracing::info!("loading the model from '{}'", path.display());

    let is_onnx = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("onnx"));

    let embedder: Arc<dyn Embedder> = if is_onnx {
        load_onnx(config)?
    } else {
        Arc::new(ProjectionEmbedder::load(path)?)
    };

    if embedder.dim() != config.embedding_dim {
        return Err(Error::DimensionMismatch {
            expected: config.embedding_dim,
            actual: embedder.dim(),
        });
    }
    Ok(embedder)
}

#[cfg(feature = "onnx")]
fn load_onnx(config: &Config) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(crate::embedder_onnx::OnnxEmbedder::load(
        &config.model_path,
        config.image_size,
        config.embedding_dim,
        config.onnx_layout,
    )?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(config: &Config) -> Result<Arc<dyn Embedder>> {
    Err(Error::Config(format!(
        "'{}' is an ONNX model but this build has no `onnx` feature",
        config.model_path.display()
    )))
}

/// Pure-Rust embedding model: mean colour over a `grid x grid` partition of
/// the image, centred around mid-grey, followed by a dense projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionEmbedder {
    input_size: (u32, u32),
    grid: usize,
    seed: u64,
    /// dim x (3 * grid * grid)
    weights: Array2<f32>,
}

#[derive(Serialize, Deserialize)]
struct Checkpoint {
    input_size: (u32, u32),
    grid: usize,
    dim: usize,
    seed: u64,
    weights: Vec<f32>,
}

impl ProjectionEmbedder {
    pub const DEFAULT_GRID: usize = 8;

    /// Fresh model with weights drawn uniformly from `[-s, s]`,
    /// `s = sqrt(3 / features)`, so each output has unit variance.
    pub fn init(input_size: (u32, u32), grid: usize, dim: usize, seed: u64) -> Result<Self> {
        let (w, h) = input_size;
        if grid == 0 || dim == 0 {
            return Err(Error::Config("grid and dim must be greater than 0".into()));
        }
        if (w as usize) < grid || (h as usize) < grid {
            return Err(Error::Config(format!(
                "input size {w}x{h} is smaller than the {grid}x{grid} pooling grid"
            )));
        }
        let features = 3 * grid * grid;
        let scale = (3.0 / features as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = Array2::from_shape_fn((dim, features), |_| rng.gen_range(-scale..=scale));
        Ok(Self {
            input_size,
            grid,
            seed,
            weights,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ModelNotFound(path.to_path_buf()));
        }
        let raw = std::fs::read(path)?;
        let ckpt: Checkpoint = serde_json::from_slice(&raw)?;
        let features = 3 * ckpt.grid * ckpt.grid;
        let weights = Array2::from_shape_vec((ckpt.dim, features), ckpt.weights).map_err(|e| {
            Error::Config(format!("checkpoint '{}' has bad weights: {e}", path.display()))
        })?;
        Ok(Self {
            input_size: ckpt.input_size,
            grid: ckpt.grid,
            seed: ckpt.seed,
            weights,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let ckpt = Checkpoint {
            input_size: self.input_size,
            grid: self.grid,
            dim: self.weights.nrows(),
            seed: self.seed,
            weights: self.weights.iter().copied().collect(),
        };
        std::fs::write(path, serde_json::to_vec(&ckpt)?)?;
        tracing::info!("saved projection model to {}", path.display());
        Ok(())
    }

    fn pool(&self, image: &ImageTensor) -> Result<Vec<f32>> {
        let (h, w, c) = image.dim();
        if c != 3 || h < self.grid || w < self.grid {
            return Err(Error::Inference(format!(
                "expected at least {g}x{g}x3 input, got {h}x{w}x{c}",
                g = self.grid
            )));
        }
        let g = self.grid;
        let mut out = Vec::with_capacity(3 * g * g);
        for gy in 0..g {
            let (y0, y1) = (gy * h / g, (gy + 1) * h / g);
            for gx in 0..g {
                let (x0, x1) = (gx * w / g, (gx + 1) * w / g);
                let count = ((y1 - y0) * (x1 - x0)) as f32;
                let mut sums = [0f32; 3];
                for y in y0..y1 {
                    for x in x0..x1 {
                        for (ch, s) in sums.iter_mut().enumerate() {
                            *s += image[[y, x, ch]];
                        }
                    }
                }
                out.extend(sums.iter().map(|s| s / count - 0.5));
            }
        }
        Ok(out)
    }
}

impl Embedder for ProjectionEmbedder {
    fn dim(&self) -> usize {
        self.weights.nrows()
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn embed(&self, image: &ImageTensor) -> Result<Vec<f32>> {
        let features = ndarray::Array1::from(self.pool(image)?);
        Ok(self.weights.dot(&features).to_vec())
    }

    fn describe(&self) -> String {
        format!(
            "projection(grid={}, dim={}, seed={}, input={}x{})",
            self.grid,
            self.dim(),
            self.seed,
            self.input_size.0,
            self.input_size.1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::l2_norm;
    use ndarray::Array3;

    fn gradient(h: usize, w: usize, tint: f32) -> ImageTensor {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            ((y as f32 / h as f32) * 0.5 + (x as f32 / w as f32) * 0.3 + c as f32 * tint).min(1.0)
        })
    }

    #[test]
    fn output_has_configured_dim() {
        let m = ProjectionEmbedder::init((32, 32), 4, 24, 7).unwrap();
        let v = m.embed(&gradient(32, 32, 0.1)).unwrap();
        assert_eq!(v.len(), 24);
    }

    #[test]
    fn finish_normalizes() {
        let m = ProjectionEmbedder::init((32, 32), 4, 16, 7).unwrap();
        let v = finish(&m, &gradient(32, 32, 0.2), true).unwrap();
        assert!((l2_norm(&v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn same_seed_same_model() {
        let a = ProjectionEmbedder::init((16, 16), 4, 8, 42).unwrap();
        let b = ProjectionEmbedder::init((16, 16), 4, 8, 42).unwrap();
        let c = ProjectionEmbedder::init((16, 16), 4, 8, 43).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let m = ProjectionEmbedder::init((16, 16), 4, 8, 3).unwrap();
        m.save(&path).unwrap();
        let back = ProjectionEmbedder::load(&path).unwrap();
        let img = gradient(16, 16, 0.05);
        assert_eq!(m.embed(&img).unwrap(), back.embed(&img).unwrap());
    }

    #[test]
    fn missing_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            model_path: dir.path().join("absent.json"),
            ..Config::default()
        };
        assert!(matches!(load_embedder(&config), Err(Error::ModelNotFound(_))));
    }

    #[test]
    fn config_dim_must_match_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        ProjectionEmbedder::init((16, 16), 4, 8, 3).unwrap().save(&path).unwrap();
        let config = Config {
            model_path: path,
            embedding_dim: 16,
            ..Config::default()
        };
        assert!(matches!(
            load_embedder(&config),
            Err(Error::DimensionMismatch { expected: 16, actual: 8 })
        ));
    }

    #[test]
    fn tiny_input_rejected() {
        let m = ProjectionEmbedder::init((16, 16), 8, 8, 1).unwrap();
        assert!(m.embed(&gradient(4, 4, 0.0)).is_err());
        assert!(ProjectionEmbedder::init((4, 4), 8, 8, 1).is_err());
    }
}
