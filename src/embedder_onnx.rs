//! Embedding head of a trained siamese network, exported to ONNX.

use std::path::Path;

use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use parking_lot::Mutex;

use crate::config::TensorLayout;
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::preprocess::ImageTensor;

pub struct OnnxEmbedder {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    input_size: (u32, u32),
    dim: usize,
    layout: TensorLayout,
    source: String,
}

fn ort_err(e: ort::Error) -> Error {
    Error::Inference(e.to_string())
}

impl OnnxEmbedder {
    pub fn load(
        path: &Path,
        input_size: (u32, u32),
        dim: usize,
        layout: TensorLayout,
    ) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ModelNotFound(path.to_path_buf()));
        }
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.commit_from_file(path))
            .map_err(ort_err)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "anchor".into());
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "embedding".into());

        tracing::info!(
            input = %input_name,
            output = %output_name,
            "ONNX embedding model loaded from {}",
            path.display()
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            input_size,
            dim,
            layout,
            source: path.display().to_string(),
        })
    }
}

impl Embedder for OnnxEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    fn embed(&self, image: &ImageTensor) -> Result<Vec<f32>> {
        let (h, w, c) = image.dim();
        let (shape, data): (Vec<i64>, Vec<f32>) = match self.layout {
            TensorLayout::Nhwc => (
                vec![1, h as i64, w as i64, c as i64],
                image.iter().copied().collect(),
            ),
            TensorLayout::Nchw => (
                vec![1, c as i64, h as i64, w as i64],
                image.view().permuted_axes([2, 0, 1]).iter().copied().collect(),
            ),
        };
        let input = Tensor::from_array((shape, data)).map_err(ort_err)?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(ort_err)?;
        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            Error::Inference(format!("no output '{}' from model", self.output_name))
        })?;
        let (_shape, values) = output.try_extract_tensor::<f32>().map_err(ort_err)?;

        let embedding = values.to_vec();
        tracing::debug!(dims = embedding.len(), "ONNX embedding computed");
        Ok(embedding)
    }

    fn describe(&self) -> String {
        format!("onnx({}, dim={})", self.source, self.dim)
    }
}
