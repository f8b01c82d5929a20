//! Image decoding and resizing shared by indexing and querying.
//!
//! Both sides must go through the same [`Preprocessor`]; any difference in
//! resize filter or scaling makes query rankings meaningless.

use std::path::Path;

use image::{DynamicImage, imageops::FilterType};
use ndarray::Array3;

use crate::error::{Error, Result};

/// Decoded image as height x width x 3, values in `[0, 1]`.
pub type ImageTensor = Array3<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
    width: u32,
    height: u32,
}

impl Preprocessor {
    pub fn new((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn load(&self, path: &Path) -> Result<ImageTensor> {
        let img = image::open(path).map_err(|source| Error::ImageDecode {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.to_tensor(&img))
    }

    pub fn load_bytes(&self, bytes: &[u8]) -> Result<ImageTensor> {
        let img = image::load_from_memory(bytes).map_err(|source| Error::ImageDecode {
            path: "<memory>".into(),
            source,
        })?;
        Ok(self.to_tensor(&img))
    }

    pub fn to_tensor(&self, img: &DynamicImage) -> ImageTensor {
        let rgb = img.to_rgb8();
        let resized = image::imageops::resize(&rgb, self.width, self.height, FilterType::Triangle);

        let (w, h) = (self.width as usize, self.height as usize);
        let mut out = Array3::<f32>::zeros((h, w, 3));
        for (x, y, px) in resized.enumerate_pixels() {
            for c in 0..3 {
                out[[y as usize, x as usize, c]] = px[c] as f32 / 255.0;
            }
        }
        out
    }
}
