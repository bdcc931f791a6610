//! BioGPT causal language model: weight binding, decoder graph, KV cache and
//! the decode engine that ties them together.

mod engine;
mod kv_cache;
mod model;
pub mod modeling;
pub mod weights;

pub use engine::{DecodeEngine, ScratchArena};
pub use kv_cache::KvCache;
pub use model::Model;
pub use weights::{tensor_layout, ModelTensors, POSITION_OFFSET};
