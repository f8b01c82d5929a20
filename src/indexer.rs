//! Offline index build: embed every corpus image and write index, image
//! table and manifest.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::corpus::image_paths;
use crate::embedder::{Embedder, embed_file};
use crate::error::{Error, Result};
use crate::image_table::ImageTable;
use crate::index::{IndexFiles, IndexKind, Manifest, VecIndex, new_index};
use crate::preprocess::Preprocessor;

pub struct Indexer<'a> {
    embedder: &'a dyn Embedder,
    preprocessor: Preprocessor,
    kind: IndexKind,
    normalize: bool,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub files: IndexFiles,
    pub manifest: Manifest,
}

impl<'a> Indexer<'a> {
    pub fn new(embedder: &'a dyn Embedder, kind: IndexKind) -> Self {
        Self {
            embedder,
            preprocessor: Preprocessor::new(embedder.input_size()),
            kind,
            normalize: true,
        }
    }

    pub fn normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    /// Embed `paths` in order; row `i` of the result is `paths[i]`.
    /// The first image that fails to decode aborts the whole build.
    pub fn embed_all(&self, paths: &[PathBuf]) -> Result<Box<dyn VecIndex>> {
        let mut index = new_index(self.kind, self.embedder.dim(), paths.len());
        let started = Instant::now();
        for (i, path) in paths.iter().enumerate() {
            let v = embed_file(self.embedder, &self.preprocessor, path, self.normalize)?;
            let row = index.append(&v)?;
            debug_assert_eq!(row, i);
            if (i + 1) % 100 == 0 {
                tracing::info!("embedded {}/{} images", i + 1, paths.len());
            }
        }
        tracing::info!(
            "embedded {} images in {:.2?}",
            paths.len(),
            started.elapsed()
        );
        Ok(index)
    }

    /// Build an index over every image under `data_dir` and replace whatever
    /// is at `index_path`. Files are staged and only renamed into place once
    /// everything has been written.
    pub fn build(&self, data_dir: &Path, index_path: &Path) -> Result<BuildReport> {
        tracing::info!("creating {} index from {}", self.kind, data_dir.display());

        let paths = image_paths(data_dir)?;
        if paths.is_empty() {
            return Err(Error::EmptyCorpus(data_dir.to_path_buf()));
        }
        tracing::info!("there are {} images to index", paths.len());

        let index = self.embed_all(&paths)?;

        let files = IndexFiles::for_index(index_path);
        if let Some(dir) = index_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let staged = files.staging();

        let result = self.write_staged(&staged, index.as_ref(), &paths);
        let manifest = match result {
            Ok(m) => m,
            Err(e) => {
                staged.discard();
                return Err(e);
            }
        };
        files.promote(&staged)?;

        tracing::info!(
            build_id = %manifest.build_id,
            "{} index created at '{}'",
            self.kind,
            files.index.display()
        );
        Ok(BuildReport { files, manifest })
    }

    fn write_staged(
        &self,
        staged: &IndexFiles,
        index: &dyn VecIndex,
        paths: &[PathBuf],
    ) -> Result<Manifest> {
        index.save(&staged.index)?;
        ImageTable::create(&staged.table)?.write_all(paths)?;
        let manifest = Manifest::new(
            self.kind,
            index.dim(),
            index.len(),
            self.embedder.describe(),
            self.normalize,
        );
        manifest.save(&staged.manifest)?;
        Ok(manifest)
    }
}
