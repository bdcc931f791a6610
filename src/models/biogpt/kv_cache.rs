use candle_core::{Device, Tensor};

use crate::error::{Error, Result};
use crate::format::HyperParameters;

/// Key/value memory for every layer and position.
///
/// Both buffers are flat `n_layer * n_positions * d_model` f32 arrays, viewed
/// as `(n_layer * n_positions, d_model)`. Position `p` of layer `l` lives at
/// element offset `(l * n_positions + p) * d_model`.
pub struct KvCache {
    keys: Tensor,
    values: Tensor,
    n_layer: usize,
    n_positions: usize,
    d_model: usize,
}

fn zeroed(rows: usize, d_model: usize, device: &Device) -> Result<Tensor> {
    let elems = rows * d_model;
    let mut data: Vec<f32> = Vec::new();
    data.try_reserve_exact(elems).map_err(|_| Error::Resource {
        what: "kv cache",
        bytes: elems * std::mem::size_of::<f32>(),
    })?;
    data.resize(elems, 0.0);
    Ok(Tensor::from_vec(data, (rows, d_model), device)?)
}

impl KvCache {
    pub fn new(hp: &HyperParameters, device: &Device) -> Result<Self> {
        let rows = hp.n_layer * hp.n_positions;
        Ok(Self {
            keys: zeroed(rows, hp.d_model, device)?,
            values: zeroed(rows, hp.d_model, device)?,
            n_layer: hp.n_layer,
            n_positions: hp.n_positions,
            d_model: hp.d_model,
        })
    }

    /// Element offset of position `pos` in layer `layer`.
    pub fn offset(&self, layer: usize, pos: usize) -> usize {
        (layer * self.n_positions + pos) * self.d_model
    }

    fn row(&self, layer: usize, pos: usize) -> usize {
        self.offset(layer, pos) / self.d_model
    }

    /// Store `(N, d_model)` keys and values for positions `n_past..n_past+N`.
    pub fn write(&self, layer: usize, n_past: usize, k: &Tensor, v: &Tensor) -> Result<()> {
        let n = k.dim(0)?;
        let fits = n_past.checked_add(n).is_some_and(|end| end <= self.n_positions);
        if layer >= self.n_layer || !fits {
            return Err(Error::ContextOverflow {
                n_past,
                n_tokens: n,
                n_positions: self.n_positions,
            });
        }
        let row = self.row(layer, n_past);
        self.keys.slice_set(&k.contiguous()?, 0, row)?;
        self.values.slice_set(&v.contiguous()?, 0, row)?;
        Ok(())
    }

    /// Keys of positions `0..len` for `layer`, as `(len, d_model)`.
    pub fn keys(&self, layer: usize, len: usize) -> Result<Tensor> {
        Ok(self.keys.narrow(0, self.row(layer, 0), len)?)
    }

    pub fn values(&self, layer: usize, len: usize) -> Result<Tensor> {
        Ok(self.values.narrow(0, self.row(layer, 0), len)?)
    }

    /// Zero both buffers in place.
    pub fn clear(&mut self) -> Result<()> {
        self.keys.zero_set()?;
        self.values.zero_set()?;
        Ok(())
    }

    pub fn size_in_bytes(&self) -> usize {
        2 * self.n_layer * self.n_positions * self.d_model * std::mem::size_of::<f32>()
    }
}
