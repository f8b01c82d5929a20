//! Query engine: embed a query image exactly like the indexer did and rank
//! the indexed images against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::corpus::image_paths;
use crate::embedder::{Embedder, embed_bytes, embed_file};
use crate::error::{Error, Result};
use crate::image_table::ImageTable;
use crate::index::{IndexFiles, IndexKind, Manifest, VecIndex, load_index};
use crate::preprocess::Preprocessor;
use crate::vector::normalized;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryHit {
    pub row: usize,
    pub path: PathBuf,
    pub distance: f32,
}

pub struct QueryEngine {
    embedder: Arc<dyn Embedder>,
    preprocessor: Preprocessor,
    index: Box<dyn VecIndex>,
    images: Vec<PathBuf>,
    manifest: Option<Manifest>,
    normalize: bool,
}

impl QueryEngine {
    /// Assemble an engine from an in-memory index. `images[i]` names row `i`.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Box<dyn VecIndex>,
        images: Vec<PathBuf>,
    ) -> Result<Self> {
        if images.len() != index.len() {
            return Err(Error::Config(format!(
                "image table has {} rows but index has {}",
                images.len(),
                index.len()
            )));
        }
        if embedder.dim() != index.dim() {
            return Err(Error::DimensionMismatch {
                expected: index.dim(),
                actual: embedder.dim(),
            });
        }
        Ok(Self {
            preprocessor: Preprocessor::new(embedder.input_size()),
            embedder,
            index,
            images,
            manifest: None,
            normalize: true,
        })
    }

    /// Load index, image table and (if present) manifest written by the
    /// indexer. The manifest's index kind wins over `kind`, and the manifest
    /// must name the same model as `embedder`.
    pub fn open(embedder: Arc<dyn Embedder>, index_path: &Path, kind: IndexKind) -> Result<Self> {
        let files = IndexFiles::for_index(index_path);
        let manifest = if files.manifest.exists() {
            Some(Manifest::load(&files.manifest)?)
        } else {
            tracing::warn!("no manifest at {}, assuming {} index", files.manifest.display(), kind);
            None
        };
        let kind = match &manifest {
            Some(m) if m.kind != kind => {
                tracing::warn!("configured index kind {} but manifest says {}", kind, m.kind);
                m.kind
            }
            Some(m) => m.kind,
            None => kind,
        };

        let index = load_index(kind, &files.index)?;
        let images = ImageTable::open(&files.table)?.load_all()?;
        tracing::info!("there are {} observations in the index", index.len());

        let mut engine = Self::new(embedder, index, images)?;
        if let Some(m) = &manifest {
            if m.dim != engine.dim() || m.rows != engine.len() {
                return Err(Error::index_format(
                    &files.manifest,
                    format!(
                        "manifest says {}x{} but index holds {}x{}",
                        m.rows,
                        m.dim,
                        engine.len(),
                        engine.dim()
                    ),
                ));
            }
            let model = engine.embedder.describe();
            if m.model != model {
                return Err(Error::Config(format!(
                    "index was built with model '{}', queries would use '{}'",
                    m.model, model
                )));
            }
            engine.normalize = m.normalized;
        }
        engine.manifest = manifest;
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.index.dim()
    }

    pub fn kind(&self) -> IndexKind {
        self.index.kind()
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn image_path(&self, row: usize) -> Option<&Path> {
        self.images.get(row).map(PathBuf::as_path)
    }

    pub fn embed_path(&self, path: &Path) -> Result<Vec<f32>> {
        embed_file(self.embedder.as_ref(), &self.preprocessor, path, self.normalize)
    }

    pub fn query_path(&self, path: &Path, top_k: usize) -> Result<Vec<QueryHit>> {
        let v = self.embed_path(path)?;
        self.search(&v, top_k)
    }

    pub fn query_bytes(&self, bytes: &[u8], top_k: usize) -> Result<Vec<QueryHit>> {
        let v = embed_bytes(self.embedder.as_ref(), &self.preprocessor, bytes, self.normalize)?;
        self.search(&v, top_k)
    }

    /// Rank a raw model output. It is normalized first when the index rows
    /// were.
    pub fn query_embedding(&self, embedding: &[f32], top_k: usize) -> Result<Vec<QueryHit>> {
        if self.normalize {
            self.search(&normalized(embedding), top_k)
        } else {
            self.search(embedding, top_k)
        }
    }

    fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<QueryHit>> {
        let neighbors = self.index.search(embedding, top_k)?;
        neighbors
            .into_iter()
            .map(|n| -> Result<QueryHit> {
                let path = self
                    .images
                    .get(n.row)
                    .cloned()
                    .ok_or(Error::RowOutOfRange {
                        row: n.row,
                        len: self.images.len(),
                    })?;
                Ok(QueryHit {
                    row: n.row,
                    path,
                    distance: n.distance,
                })
            })
            .collect()
    }

    /// Run a query for every image under `dir`, one after the other.
    pub fn query_dir(&self, dir: &Path, top_k: usize) -> Result<Vec<(PathBuf, Vec<QueryHit>)>> {
        let queries = image_paths(dir)?;
        tracing::info!("there are {} images for querying", queries.len());
        queries
            .into_iter()
            .map(|q| -> Result<(PathBuf, Vec<QueryHit>)> {
                let hits = self.query_path(&q, top_k)?;
                Ok((q, hits))
            })
            .collect()
    }
}
