//! Image retrieval over siamese-network embeddings: build a flat similarity
//! index over an image corpus and answer top-K nearest-image queries.

pub mod config;
pub mod corpus;
pub mod embedder;
#[cfg(feature = "onnx")]
pub mod embedder_onnx;
pub mod error;
pub mod image_table;
pub mod index;
pub mod index_flat;
pub mod index_matrix;
pub mod indexer;
pub mod preprocess;
pub mod query;
pub mod server;
pub mod triplets;
pub mod vector;

pub use config::Config;
pub use embedder::{Embedder, ProjectionEmbedder, load_embedder};
pub use error::{Error, Result};
pub use index::{IndexFiles, IndexKind, Manifest, Neighbor, VecIndex};
pub use indexer::Indexer;
pub use query::{QueryEngine, QueryHit};
