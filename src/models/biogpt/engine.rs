use std::time::Instant;

use byteorder::{NativeEndian, WriteBytesExt};
use candle_core::{DType, Tensor};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use super::model::Model;
use super::modeling::StepInputs;
use super::weights::POSITION_OFFSET;
use crate::error::{Error, Result};
use crate::format::TokenId;

/// Reusable staging buffer for the per-step graph inputs.
///
/// Sized from the first decode call and grown with 10% headroom whenever a
/// later batch would not fit. A failed grow leaves the old buffer in place.
#[derive(Debug, Default)]
pub struct ScratchArena {
    buf: Vec<u8>,
    mem_per_token: usize,
}

struct StagedInputs<'a> {
    input_ids: &'a [u8],
    position_ids: &'a [u8],
    mask: Option<&'a [u8]>,
}

impl ScratchArena {
    fn required(n_tokens: usize, n_past: usize) -> usize {
        let ids_and_positions = 2 * n_tokens * std::mem::size_of::<u32>();
        let mask = if n_tokens > 1 {
            n_tokens * (n_past + n_tokens) * std::mem::size_of::<f32>()
        } else {
            0
        };
        ids_and_positions + mask
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Bytes per token measured on the first call; 0 before that.
    pub fn mem_per_token(&self) -> usize {
        self.mem_per_token
    }

    fn reserve(&mut self, n_tokens: usize, n_past: usize) -> Result<()> {
        let required = Self::required(n_tokens, n_past);
        if self.mem_per_token == 0 {
            self.mem_per_token = required.div_ceil(n_tokens);
            debug!(mem_per_token = self.mem_per_token, "scratch estimate");
        }
        let needed = required.max(self.mem_per_token * n_tokens);
        if needed > self.buf.capacity() {
            let target = needed + needed / 10;
            let mut grown = Vec::new();
            grown.try_reserve_exact(target).map_err(|_| Error::Resource {
                what: "decode scratch arena",
                bytes: target,
            })?;
            debug!(from = self.buf.capacity(), to = target, "growing scratch arena");
            self.buf = grown;
        }
        Ok(())
    }

    fn stage(&mut self, tokens: &[TokenId], n_past: usize) -> Result<StagedInputs<'_>> {
        self.reserve(tokens.len(), n_past)?;
        let n = tokens.len();
        let total = n_past + n;

        self.buf.clear();
        for &id in tokens {
            self.buf.write_u32::<NativeEndian>(id)?;
        }
        for i in 0..n {
            self.buf
                .write_u32::<NativeEndian>((n_past + i + POSITION_OFFSET) as u32)?;
        }
        if n > 1 {
            for i in 0..n {
                for j in 0..total {
                    let v = if j > n_past + i { f32::NEG_INFINITY } else { 0.0 };
                    self.buf.write_f32::<NativeEndian>(v)?;
                }
            }
        }

        let (input_ids, rest) = self.buf.split_at(n * 4);
        let (position_ids, mask) = rest.split_at(n * 4);
        Ok(StagedInputs {
            input_ids,
            position_ids,
            mask: (n > 1).then_some(mask),
        })
    }
}

/// Runs forward passes of a [`Model`] against its persistent KV cache.
///
/// The caller owns `n_past`: after decoding `N` tokens at `n_past`, the next
/// call continues at `n_past + N`. Decoding at a smaller `n_past` overwrites
/// the cache from that position on.
pub struct DecodeEngine {
    model: Model,
    pool: ThreadPool,
    n_threads: usize,
    scratch: ScratchArena,
}

impl DecodeEngine {
    pub fn new(model: Model, n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(Error::InvalidArgument("n_threads must be at least 1".into()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("biogpt-decode-{i}"))
            .build()?;
        Ok(Self {
            model,
            pool,
            n_threads,
            scratch: ScratchArena::default(),
        })
    }

    /// Feed `tokens` at positions `n_past..n_past + N` and return the logits
    /// (length `n_vocab`) predicted after the last of them.
    pub fn decode(&mut self, tokens: &[TokenId], n_past: usize) -> Result<Vec<f32>> {
        let hp = *self.model.hparams();
        let n = tokens.len();
        if n == 0 {
            return Err(Error::InvalidArgument("empty token batch".into()));
        }
        if n_past.checked_add(n).filter(|&end| end <= hp.n_positions).is_none() {
            return Err(Error::ContextOverflow {
                n_past,
                n_tokens: n,
                n_positions: hp.n_positions,
            });
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= hp.n_vocab) {
            return Err(Error::InvalidArgument(format!(
                "token id {bad} out of range for vocabulary of {}",
                hp.n_vocab
            )));
        }

        let start = Instant::now();
        let device = self.model.device();
        let staged = self.scratch.stage(tokens, n_past)?;
        let inputs = StepInputs {
            input_ids: Tensor::from_raw_buffer(staged.input_ids, DType::U32, &[n], device)?,
            position_ids: Tensor::from_raw_buffer(staged.position_ids, DType::U32, &[n], device)?,
            mask: staged
                .mask
                .map(|m| Tensor::from_raw_buffer(m, DType::F32, &[n, n_past + n], device))
                .transpose()?,
        };

        let model = &self.model;
        let logits = self.pool.install(|| {
            model
                .transformer()
                .forward(&inputs, n_past, model.kv_cache())
        })?;

        debug!(
            n_tokens = n,
            n_past,
            elapsed_ms = start.elapsed().as_secs_f64() * 1e3,
            "decode"
        );
        Ok(logits)
    }

    pub fn clear_kv_cache(&mut self) -> Result<()> {
        self.model.clear_kv_cache()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    pub fn scratch(&self) -> &ScratchArena {
        &self.scratch
    }
}
