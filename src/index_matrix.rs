//! Flat `f64` matrix ranked by Euclidean distance, persisted with bincode.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::{Array1, Array2, Axis};

use crate::error::{Error, Result};
use crate::index::{IndexKind, Neighbor, VecIndex, check_dim, rank};
use crate::vector::all_finite;

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixIndex {
    matrix: Array2<f64>,
}

impl MatrixIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            matrix: Array2::zeros((0, dim)),
        }
    }

    pub fn from_array(matrix: Array2<f64>) -> Self {
        Self { matrix }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let matrix: Array2<f64> = bincode::deserialize_from(reader)?;
        if matrix.ncols() == 0 {
            return Err(Error::index_format(path, "zero dimension"));
        }
        tracing::info!(
            "loaded matrix index: {} rows, dim={} @ {}",
            matrix.nrows(),
            matrix.ncols(),
            path.display()
        );
        Ok(Self::from_array(matrix))
    }
}

impl VecIndex for MatrixIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Matrix
    }

    fn dim(&self) -> usize {
        self.matrix.ncols()
    }

    fn len(&self) -> usize {
        self.matrix.nrows()
    }

    fn append(&mut self, vec: &[f32]) -> Result<usize> {
        check_dim(self.dim(), vec)?;
        if !all_finite(vec) {
            return Err(Error::Inference("embedding contains non-finite values".into()));
        }
        let row = self.len();
        let values: Array1<f64> = vec.iter().map(|&x| x as f64).collect();
        self.matrix
            .push_row(values.view())
            .map_err(|e| Error::Inference(format!("matrix append failed: {e}")))?;
        tracing::debug!("append OK: row={}, dim={}", row, self.dim());
        Ok(row)
    }

    fn get(&self, row: usize) -> Result<Vec<f32>> {
        if row >= self.len() {
            return Err(Error::RowOutOfRange {
                row,
                len: self.len(),
            });
        }
        Ok(self.matrix.row(row).iter().map(|&x| x as f32).collect())
    }

    fn search(&self, q: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
        check_dim(self.dim(), q)?;
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let query: Array1<f64> = q.iter().map(|&x| x as f64).collect();

        let scored = self
            .matrix
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(i, row)| {
                let diff = &row - &query;
                (i, diff.dot(&diff).sqrt() as f32)
            })
            .collect();
        Ok(rank(scored, IndexKind::Matrix, top_k))
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut w, &self.matrix)?;
        w.flush()?;
        w.get_ref().sync_all()?;
        tracing::info!("matrix index written: {} rows @ {}", self.len(), path.display());
        Ok(())
    }
}
