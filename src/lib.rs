//! # biogpt-core
//!
//! Local inference runtime for BioGPT checkpoints, built on the
//! [Candle](https://github.com/huggingface/candle) framework.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`format`] | Binary model format: header, vocabulary, tensor catalog, shard sets |
//! | [`loader`] | Binding catalog entries to the architecture and filling the weight arena |
//! | [`models`] | BioGPT decoder, KV cache and the decode engine |
//! | [`quantize`] | Rewriting a model with block-quantized weight matrices |
//! | [`generation`] | Sampling and the autoregressive generation loop |
//! | [`utils`] | Device selection and progress reporting |
//!
//! Token ids in, token ids out: tokenization happens outside this crate.

pub mod error;
pub mod format;
pub mod generation;
pub mod loader;
pub mod models;
pub mod quantize;
pub mod utils;

#[cfg(test)]
mod test_factory;

pub use error::{Error, Result};
pub use format::{TokenId, WeightType};
pub use generation::based::ModelForCausalLM;
pub use generation::GenerationConfig;
pub use models::biogpt::{DecodeEngine, Model};
