//! Row -> image path table, stored as JSON lines next to the index.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub row: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ImageTable {
    path: PathBuf,
}

impl ImageTable {
    /// Start an empty table, truncating any previous one at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        File::create(&path)?;
        Ok(Self { path })
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::index_format(&path, "image table is missing"));
        }
        Ok(Self { path })
    }

    /// Write all paths in one go, row `i` being `paths[i]`.
    pub fn write_all<P: AsRef<Path>>(&self, paths: &[P]) -> Result<()> {
        let mut w = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        for (row, p) in paths.iter().enumerate() {
            let record = ImageRecord {
                row,
                path: p.as_ref().to_path_buf(),
            };
            serde_json::to_writer(&mut w, &record)?;
            w.write_all(b"\n")?;
        }
        w.flush()?;
        Ok(())
    }

    /// All paths in row order. Each line's `row` must match its position.
    pub fn load_all(&self) -> Result<Vec<PathBuf>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ImageRecord = serde_json::from_str(&line)?;
            if record.row != i {
                return Err(Error::index_format(
                    &self.path,
                    format!("line {i} holds row {}", record.row),
                ));
            }
            out.push(record.path);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let table = ImageTable::create(dir.path().join("t.jsonl")).unwrap();
        table.write_all(&["a.jpg", "b/c.png", "d.jpeg"]).unwrap();

        assert_eq!(
            table.load_all().unwrap(),
            vec![PathBuf::from("a.jpg"), "b/c.png".into(), "d.jpeg".into()]
        );
    }

    #[test]
    fn create_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        ImageTable::create(&path).unwrap().write_all(&["x.jpg"]).unwrap();
        let table = ImageTable::create(&path).unwrap();
        assert!(table.load_all().unwrap().is_empty());
    }

    #[test]
    fn out_of_order_rows_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "{\"row\":1,\"path\":\"a.jpg\"}\n").unwrap();
        assert!(ImageTable::open(&path).unwrap().load_all().is_err());
    }

    #[test]
    fn missing_table() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageTable::open(dir.path().join("nope")).is_err());
    }
}
