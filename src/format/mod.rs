//! On-disk model format.
//!
//! A model file is a little-endian stream of u32 fields and byte strings:
//!
//! ```text
//! magic, version
//! n_vocab, n_merges, n_layer, n_head, n_positions, d_ff, d_model, ftype
//! vocab count, count × (len, bytes)
//! merge count, count × (len, "left right")
//! tensor records until EOF:
//!     n_dims, name_len, type tag, shape[n_dims], name,
//!     zero padding to a 32-byte file offset, payload
//! ```
//!
//! Large models may be split into shard files. Each shard repeats the header
//! and carries a slice of every tensor along its outermost dimension.

mod catalog;
mod dtype;
mod hparams;
mod reader;
mod vocab;
mod writer;

pub use catalog::{ShardLocation, TensorCatalog, TensorDescriptor};
pub use dtype::WeightType;
pub use hparams::HyperParameters;
pub use reader::{ModelFile, ShardReader};
pub use vocab::{TokenId, Vocabulary};
pub use writer::FileWriter;

/// "ggjt"
pub const MAGIC: u32 = 0x6767_6a74;

pub const VERSION: u32 = 1;

/// Tensor payloads start on multiples of this many bytes.
pub const ALIGNMENT: u64 = 32;

/// Zero bytes needed after `offset` to reach the next aligned position.
pub fn padding_for(offset: u64) -> u64 {
    (ALIGNMENT - offset % ALIGNMENT) % ALIGNMENT
}
