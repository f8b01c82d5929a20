//! Exhaustive inner-product index over f32 rows.
//!
//! On-disk layout, all little-endian:
//! `b"SSIX"`, version `u32`, dim `u32`, rows `u64`, then `rows * dim` f32.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::index::{IndexKind, Neighbor, VecIndex, check_dim, rank};
use crate::vector::{all_finite, dot};

const MAGIC: &[u8; 4] = b"SSIX";
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 4 + 4 + 4 + 8;

#[derive(Debug, Clone, PartialEq)]
pub struct FlatIpIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIpIndex {
    pub fn new(dim: usize) -> Self {
        Self::with_capacity(dim, 0)
    }

    pub fn with_capacity(dim: usize, rows: usize) -> Self {
        Self {
            dim,
            data: Vec::with_capacity(dim * rows),
        }
    }

    fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut r = BufReader::new(file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|_| Error::index_format(path, "truncated header"))?;
        if &magic != MAGIC {
            return Err(Error::index_format(path, "bad magic"));
        }
        let version = read_u32(&mut r)?;
        if version != VERSION {
            return Err(Error::index_format(path, format!("unsupported version {version}")));
        }
        let dim = read_u32(&mut r)?;
        let rows = read_u64(&mut r)?;
        if dim == 0 {
            return Err(Error::index_format(path, "zero dimension"));
        }

        let values = rows
            .checked_mul(dim as u64)
            .ok_or_else(|| Error::index_format(path, "header size overflow"))?;
        let expect = values
            .checked_mul(4)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or_else(|| Error::index_format(path, "header size overflow"))?;
        if file_len != expect {
            return Err(Error::index_format(
                path,
                format!("size {file_len} bytes, expected {expect} for {rows}x{dim}"),
            ));
        }
        // the file length bounds `values`, so this only fails on 32-bit hosts
        let values = usize::try_from(values)
            .map_err(|_| Error::index_format(path, "index too large for this platform"))?;

        let mut data = Vec::with_capacity(values);
        let mut buf = [0u8; 4];
        for _ in 0..values {
            r.read_exact(&mut buf)?;
            data.push(f32::from_le_bytes(buf));
        }

        tracing::info!("loaded flat-ip index: {} rows, dim={} @ {}", rows, dim, path.display());
        Ok(Self {
            dim: dim as usize,
            data,
        })
    }
}

impl VecIndex for FlatIpIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::FlatIp
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    fn append(&mut self, vec: &[f32]) -> Result<usize> {
        check_dim(self.dim, vec)?;
        if !all_finite(vec) {
            return Err(Error::Inference("embedding contains non-finite values".into()));
        }
        let row = self.len();
        self.data.extend_from_slice(vec);
        tracing::debug!("append OK: row={}, dim={}", row, self.dim);
        Ok(row)
    }

    fn get(&self, row: usize) -> Result<Vec<f32>> {
        if row >= self.len() {
            return Err(Error::RowOutOfRange {
                row,
                len: self.len(),
            });
        }
        Ok(self.row(row).to_vec())
    }

    fn search(&self, q: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
        check_dim(self.dim, q)?;
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let scored = (0..self.len()).map(|i| (i, dot(q, self.row(i)))).collect();
        Ok(rank(scored, IndexKind::FlatIp, top_k))
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&(self.dim as u32).to_le_bytes())?;
        w.write_all(&(self.len() as u64).to_le_bytes())?;
        for x in &self.data {
            w.write_all(&x.to_le_bytes())?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;

        tracing::info!("flat-ip index written: {} rows @ {}", self.len(), path.display());
        Ok(())
    }
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::normalized;

    fn sample() -> FlatIpIndex {
        let mut idx = FlatIpIndex::new(3);
        for v in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.6, 0.8, 0.0], [0.0, 0.0, 1.0]] {
            idx.append(&v).unwrap();
        }
        idx
    }

    #[test]
    fn self_match_first() {
        let idx = sample();
        let hits = idx.search(&[0.0, 1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].row, 1);
        assert!((hits[0].distance - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].row, 2);
    }

    #[test]
    fn k_is_clamped_and_zero_is_empty() {
        let idx = sample();
        assert_eq!(idx.search(&[1.0, 0.0, 0.0], 50).unwrap().len(), 4);
        assert!(idx.search(&[1.0, 0.0, 0.0], 0).unwrap().is_empty());
        assert!(FlatIpIndex::new(3).search(&[1.0, 0.0, 0.0], 3).unwrap().is_empty());
    }

    #[test]
    fn scores_descend() {
        let idx = sample();
        let hits = idx.search(&normalized(&[0.3, 0.5, 0.2]), 4).unwrap();
        assert!(hits.windows(2).all(|w| w[0].distance >= w[1].distance));
    }

    #[test]
    fn dim_mismatch_rejected() {
        let mut idx = FlatIpIndex::new(3);
        assert!(matches!(
            idx.append(&[1.0, 2.0]),
            Err(Error::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(idx.search(&[1.0; 4], 1).is_err());
    }

    #[test]
    fn nan_rejected() {
        let mut idx = FlatIpIndex::new(2);
        assert!(idx.append(&[f32::NAN, 0.0]).is_err());
    }

    #[test]
    fn save_load_same_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.ssix");
        let idx = sample();
        idx.save(&path).unwrap();
        let back = FlatIpIndex::load(&path).unwrap();
        assert_eq!(back, idx);
        let q = [0.2, 0.7, 0.1];
        assert_eq!(idx.search(&q, 3).unwrap(), back.search(&q, 3).unwrap());
    }

    #[test]
    fn truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.ssix");
        sample().save(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(FlatIpIndex::load(&path), Err(Error::IndexFormat { .. })));
    }

    #[test]
    fn oversized_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.ssix");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&(1u64 << 62).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        match FlatIpIndex::load(&path) {
            Err(Error::IndexFormat { reason, .. }) => assert_eq!(reason, "header size overflow"),
            other => panic!("expected a format error, got {other:?}"),
        }
    }

    #[test]
    fn header_rows_must_match_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx.ssix");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&(1u64 << 20).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(FlatIpIndex::load(&path), Err(Error::IndexFormat { .. })));
    }
}
