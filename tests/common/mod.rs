#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use siamese_search::{Config, Embedder, IndexKind, ProjectionEmbedder};

pub const SIZE: u32 = 32;
pub const DIM: usize = 32;

/// Write a distinct synthetic PNG for `seed` and return its path.
pub fn write_image(path: &Path, seed: u32) -> PathBuf {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).unwrap();
    }
    let (a, b, c) = (seed * 37 + 11, seed * 91 + 5, seed * 53 + 200);
    let img = RgbImage::from_fn(SIZE, SIZE, |x, y| {
        let cell = (x / 8 + y / 8 + seed) % 4;
        Rgb([
            ((x * a + y * 3 + cell * 40) % 256) as u8,
            ((y * b + x + cell * 70) % 256) as u8,
            ((x * y + c + cell * 20) % 256) as u8,
        ])
    });
    img.save(path).unwrap();
    path.to_path_buf()
}

/// Corpus of `n` images spread over two sub-directories.
pub fn corpus(root: &Path, n: u32) -> Vec<PathBuf> {
    let mut paths: Vec<_> = (0..n)
        .map(|i| {
            let sub = if i % 2 == 0 { "even" } else { "odd" };
            write_image(&root.join(sub).join(format!("img_{i:02}.png")), i)
        })
        .collect();
    paths.sort();
    paths
}

pub fn model() -> Arc<dyn Embedder> {
    Arc::new(ProjectionEmbedder::init((SIZE, SIZE), 4, DIM, 17).unwrap())
}

pub fn config(root: &Path, kind: IndexKind) -> Config {
    Config {
        image_size: (SIZE, SIZE),
        embedding_dim: DIM,
        data: root.join("corpus"),
        query_data: root.join("queries"),
        valid_data: root.join("valid"),
        model_path: root.join("model.json"),
        index_kind: kind,
        index_path: root.join("out").join("index.bin"),
        ..Config::default()
    }
}
