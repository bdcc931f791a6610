pub mod biogpt;

pub use candle_core;
pub use candle_core::{DType, Device, Tensor};
