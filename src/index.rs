//! Similarity index abstraction and the files that make up a built index.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::index_flat::FlatIpIndex;
use crate::index_matrix::MatrixIndex;

/// One search result: the row in the index and its score under the
/// index's metric (inner product for `flat-ip`, Euclidean distance for
/// `matrix`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub row: usize,
    pub distance: f32,
}

pub trait VecIndex: Send + Sync {
    fn kind(&self) -> IndexKind;
    fn dim(&self) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Append a row and return its position.
    fn append(&mut self, vec: &[f32]) -> Result<usize>;
    fn get(&self, row: usize) -> Result<Vec<f32>>;
    /// Best-first neighbours of `q`, at most `min(top_k, len())` of them.
    /// `q` is compared as given; callers normalize it the same way the rows
    /// were.
    fn search(&self, q: &[f32], top_k: usize) -> Result<Vec<Neighbor>>;
    fn save(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// f32 rows scored by inner product, highest first.
    #[serde(rename = "flat-ip")]
    FlatIp,
    /// f64 matrix scored by Euclidean distance, lowest first.
    #[serde(rename = "matrix")]
    Matrix,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::FlatIp => "flat-ip",
            IndexKind::Matrix => "matrix",
        }
    }

    /// Whether a larger score ranks higher.
    pub fn higher_is_better(&self) -> bool {
        matches!(self, IndexKind::FlatIp)
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat-ip" | "flat" | "ip" | "faiss" => Ok(IndexKind::FlatIp),
            "matrix" | "dict" | "l2" => Ok(IndexKind::Matrix),
            other => Err(Error::Config(format!("unknown index kind '{other}'"))),
        }
    }
}

pub fn new_index(kind: IndexKind, dim: usize, capacity: usize) -> Box<dyn VecIndex> {
    match kind {
        IndexKind::FlatIp => Box::new(FlatIpIndex::with_capacity(dim, capacity)),
        IndexKind::Matrix => Box::new(MatrixIndex::new(dim)),
    }
}

pub fn load_index(kind: IndexKind, path: &Path) -> Result<Box<dyn VecIndex>> {
    Ok(match kind {
        IndexKind::FlatIp => Box::new(FlatIpIndex::load(path)?),
        IndexKind::Matrix => Box::new(MatrixIndex::load(path)?),
    })
}

/// Order scored rows best-first and keep `top_k`. The sort is stable over
/// row order, so equal scores keep the smaller row first.
pub(crate) fn rank(mut scored: Vec<(usize, f32)>, kind: IndexKind, top_k: usize) -> Vec<Neighbor> {
    if kind.higher_is_better() {
        scored.sort_by(|a, b| OrderedFloat(b.1).cmp(&OrderedFloat(a.1)));
    } else {
        scored.sort_by(|a, b| OrderedFloat(a.1).cmp(&OrderedFloat(b.1)));
    }
    scored.truncate(top_k);
    scored
        .into_iter()
        .map(|(row, distance)| Neighbor { row, distance })
        .collect()
}

pub(crate) fn check_dim(expected: usize, v: &[f32]) -> Result<()> {
    if v.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: v.len(),
        });
    }
    Ok(())
}

/// Paths of everything written for one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFiles {
    pub index: PathBuf,
    pub table: PathBuf,
    pub manifest: PathBuf,
}

impl IndexFiles {
    pub fn for_index(index: impl Into<PathBuf>) -> Self {
        let index = index.into();
        let table = sibling(&index, "images.jsonl");
        let manifest = sibling(&index, "manifest.json");
        Self {
            index,
            table,
            manifest,
        }
    }

    /// Same layout with a `.tmp` suffix on every file.
    pub fn staging(&self) -> Self {
        Self {
            index: sibling(&self.index, "tmp"),
            table: sibling(&self.table, "tmp"),
            manifest: sibling(&self.manifest, "tmp"),
        }
    }

    /// Move staged files over `self`. The index file goes last so a reader
    /// never sees a new index next to an old table. On failure whatever is
    /// still staged is removed.
    pub fn promote(&self, staged: &IndexFiles) -> Result<()> {
        let moved = std::fs::rename(&staged.table, &self.table)
            .and_then(|_| std::fs::rename(&staged.manifest, &self.manifest))
            .and_then(|_| std::fs::rename(&staged.index, &self.index));
        if let Err(e) = moved {
            tracing::error!("promoting {} failed: {}", self.index.display(), e);
            staged.discard();
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove whichever of these files exist.
    pub fn discard(&self) {
        for p in [&self.index, &self.table, &self.manifest] {
            if p.exists() {
                if let Err(e) = std::fs::remove_file(p) {
                    tracing::warn!("could not remove {}: {}", p.display(), e);
                }
            }
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Build metadata written next to an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub build_id: Uuid,
    pub kind: IndexKind,
    pub dim: usize,
    pub rows: usize,
    pub model: String,
    pub normalized: bool,
    pub created_unix: u64,
}

impl Manifest {
    pub fn new(kind: IndexKind, dim: usize, rows: usize, model: String, normalized: bool) -> Self {
        let created_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            build_id: Uuid::new_v4(),
            kind,
            dim,
            rows,
            model,
            normalized,
            created_unix,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_descending_keeps_row_order_on_ties() {
        let scored = vec![(0, 0.5), (1, 0.9), (2, 0.5), (3, 0.9)];
        let got = rank(scored, IndexKind::FlatIp, 3);
        let rows: Vec<_> = got.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![1, 3, 0]);
    }

    #[test]
    fn rank_ascending_for_distances() {
        let scored = vec![(0, 2.0), (1, 0.1), (2, 0.1), (3, 1.0)];
        let got = rank(scored, IndexKind::Matrix, 10);
        let rows: Vec<_> = got.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![1, 2, 3, 0]);
    }

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("faiss".parse::<IndexKind>().unwrap(), IndexKind::FlatIp);
        assert_eq!("Dict".parse::<IndexKind>().unwrap(), IndexKind::Matrix);
        assert!("hnsw".parse::<IndexKind>().is_err());
    }

    #[test]
    fn file_layout() {
        let files = IndexFiles::for_index("out/index.ssix");
        assert_eq!(files.table, PathBuf::from("out/index.ssix.images.jsonl"));
        assert_eq!(files.manifest, PathBuf::from("out/index.ssix.manifest.json"));
        assert_eq!(files.staging().index, PathBuf::from("out/index.ssix.tmp"));
    }

    #[test]
    fn failed_promote_leaves_nothing_staged() {
        let dir = tempfile::tempdir().unwrap();
        let files = IndexFiles::for_index(dir.path().join("index.ssix"));
        let staged = files.staging();
        for p in [&staged.index, &staged.table, &staged.manifest] {
            std::fs::write(p, b"x").unwrap();
        }
        // a directory in the way makes the final rename fail
        std::fs::create_dir(&files.index).unwrap();
        std::fs::write(files.index.join("keep"), b"x").unwrap();

        assert!(files.promote(&staged).is_err());
        assert!(!staged.index.exists());
        assert!(!staged.table.exists());
        assert!(!staged.manifest.exists());
    }

    #[test]
    fn promote_moves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let files = IndexFiles::for_index(dir.path().join("index.ssix"));
        let staged = files.staging();
        for p in [&staged.index, &staged.table, &staged.manifest] {
            std::fs::write(p, b"x").unwrap();
        }
        files.promote(&staged).unwrap();
        assert!(files.index.exists() && files.table.exists() && files.manifest.exists());
        assert!(!staged.index.exists());
    }
}
