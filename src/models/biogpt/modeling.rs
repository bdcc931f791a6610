//! BioGPT decoder on top of candle.
//!
//! Pre-norm transformer blocks with learned absolute positions:
//!
//! 1. **Weights straight from the arena**: 2-D matrices become [`QMatMul`]s
//!    in their stored type, so quantized checkpoints run quantized matmuls.
//!    Embedding tables, biases and norms are expanded to f32.
//! 2. **Flat KV cache** written in place with `slice_set`; attention always
//!    reads the cached range `0..n_past + N`.
//! 3. **Causal mask only for multi-token batches**; a single token may see
//!    the whole cached range.

use candle_core::quantized::QMatMul;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::LayerNorm;

use super::kv_cache::KvCache;
use super::weights::{LayerTensors, ModelTensors};
use crate::error::Result;
use crate::format::HyperParameters;
use crate::loader::{TensorId, WeightArena};

pub const LAYER_NORM_EPS: f64 = 1e-5;

// ── Building blocks ─────────────────────────────────────────────────────

/// `x · Wᵀ + b` with the weight kept in its stored type.
struct QLinear {
    weight: QMatMul,
    bias: Option<Tensor>,
}

impl QLinear {
    fn new(
        arena: &WeightArena,
        weight: TensorId,
        bias: Option<TensorId>,
        device: &Device,
    ) -> Result<Self> {
        let weight = QMatMul::from_qtensor(arena.qtensor(weight, device)?)?;
        let bias = bias.map(|b| arena.dequantize(b, device)).transpose()?;
        Ok(Self { weight, bias })
    }
}

impl Module for QLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = self.weight.forward(xs)?;
        match &self.bias {
            Some(b) => ys.broadcast_add(b),
            None => Ok(ys),
        }
    }
}

fn layer_norm(
    arena: &WeightArena,
    weight: TensorId,
    bias: TensorId,
    device: &Device,
) -> Result<LayerNorm> {
    Ok(LayerNorm::new(
        arena.dequantize(weight, device)?,
        arena.dequantize(bias, device)?,
        LAYER_NORM_EPS,
    ))
}

// ── Attention ───────────────────────────────────────────────────────────

struct Attention {
    q_proj: QLinear,
    k_proj: QLinear,
    v_proj: QLinear,
    o_proj: QLinear,
    n_head: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(
        hp: &HyperParameters,
        t: &LayerTensors,
        arena: &WeightArena,
        device: &Device,
    ) -> Result<Self> {
        let head_dim = hp.head_dim();
        Ok(Self {
            q_proj: QLinear::new(arena, t.q_proj_weight, Some(t.q_proj_bias), device)?,
            k_proj: QLinear::new(arena, t.k_proj_weight, Some(t.k_proj_bias), device)?,
            v_proj: QLinear::new(arena, t.v_proj_weight, Some(t.v_proj_bias), device)?,
            o_proj: QLinear::new(arena, t.o_proj_weight, Some(t.o_proj_bias), device)?,
            n_head: hp.n_head,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `[T, H*D]` → `[H, T, D]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let seq_len = xs.dim(0)?;
        Ok(xs
            .reshape((seq_len, self.n_head, self.head_dim))?
            .transpose(0, 1)?
            .contiguous()?)
    }

    fn forward(
        &self,
        xs: &Tensor,
        layer: usize,
        n_past: usize,
        cache: &KvCache,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (seq_len, d_model) = xs.dims2()?;
        let q = (self.q_proj.forward(xs)? * self.scale)?;
        let k = self.k_proj.forward(xs)?;
        let v = self.v_proj.forward(xs)?;

        cache.write(layer, n_past, &k, &v)?;
        let total = n_past + seq_len;
        let k = self.split_heads(&cache.keys(layer, total)?)?;
        let v = self.split_heads(&cache.values(layer, total)?)?;
        let q = self.split_heads(&q)?;

        // [H, N, T]
        let attn_weights = q.matmul(&k.t()?)?;
        let attn_weights = match mask {
            Some(mask) => attn_weights.broadcast_add(mask)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [H, N, D] → [N, H*D]
        let attn_output = attn_output
            .transpose(0, 1)?
            .contiguous()?
            .reshape((seq_len, d_model))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

// ── Feed-forward ────────────────────────────────────────────────────────

struct Mlp {
    fc1: QLinear,
    fc2: QLinear,
}

impl Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?.gelu()?;
        Ok(self.fc2.forward(&hidden)?)
    }
}

// ── Decoder layer ───────────────────────────────────────────────────────

struct DecoderLayer {
    self_attn_layer_norm: LayerNorm,
    self_attn: Attention,
    final_layer_norm: LayerNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn new(
        hp: &HyperParameters,
        t: &LayerTensors,
        arena: &WeightArena,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            self_attn_layer_norm: layer_norm(
                arena,
                t.self_attn_layer_norm_weight,
                t.self_attn_layer_norm_bias,
                device,
            )?,
            self_attn: Attention::new(hp, t, arena, device)?,
            final_layer_norm: layer_norm(
                arena,
                t.final_layer_norm_weight,
                t.final_layer_norm_bias,
                device,
            )?,
            mlp: Mlp {
                fc1: QLinear::new(arena, t.fc1_weight, Some(t.fc1_bias), device)?,
                fc2: QLinear::new(arena, t.fc2_weight, Some(t.fc2_bias), device)?,
            },
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        layer: usize,
        n_past: usize,
        cache: &KvCache,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let residual = xs;
        let hidden = self.self_attn_layer_norm.forward(xs)?;
        let hidden = self.self_attn.forward(&hidden, layer, n_past, cache, mask)?;
        let hidden = (residual + hidden)?;

        let residual = &hidden;
        let ff = self.final_layer_norm.forward(&hidden)?;
        let ff = self.mlp.forward(&ff)?;
        Ok((residual + ff)?)
    }
}

// ── Full model ──────────────────────────────────────────────────────────

/// Graph inputs for one decode step, already on the model's device.
pub struct StepInputs {
    /// `[N]` u32 token ids.
    pub input_ids: Tensor,
    /// `[N]` u32 rows of the position table.
    pub position_ids: Tensor,
    /// `[N, n_past + N]` additive f32 mask, absent for single-token steps.
    pub mask: Option<Tensor>,
}

pub struct BioGptTransformer {
    embed_tokens: Tensor,
    embed_positions: Tensor,
    embed_scale: f64,
    layers: Vec<DecoderLayer>,
    layer_norm: LayerNorm,
    output_projection: QLinear,
}

impl BioGptTransformer {
    pub fn new(
        hp: &HyperParameters,
        tensors: &ModelTensors,
        arena: &WeightArena,
        device: &Device,
    ) -> Result<Self> {
        let layers = tensors
            .layers
            .iter()
            .map(|t| DecoderLayer::new(hp, t, arena, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: arena.dequantize(tensors.embed_tokens, device)?,
            embed_positions: arena.dequantize(tensors.embed_positions, device)?,
            embed_scale: (hp.d_model as f64).sqrt(),
            layers,
            layer_norm: layer_norm(
                arena,
                tensors.layer_norm_weight,
                tensors.layer_norm_bias,
                device,
            )?,
            output_projection: QLinear::new(arena, tensors.output_projection, None, device)?,
        })
    }

    /// Run one step and return the logits of the last position.
    pub fn forward(&self, inputs: &StepInputs, n_past: usize, cache: &KvCache) -> Result<Vec<f32>> {
        let seq_len = inputs.input_ids.dim(0)?;
        let tokens = (self.embed_tokens.index_select(&inputs.input_ids, 0)? * self.embed_scale)?;
        let positions = self.embed_positions.index_select(&inputs.position_ids, 0)?;
        let mut hidden = (tokens + positions)?;

        for (idx, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, idx, n_past, cache, inputs.mask.as_ref())?;
        }

        let last = hidden.narrow(0, seq_len - 1, 1)?;
        let last = self.layer_norm.forward(&last)?;
        let logits = self.output_projection.forward(&last)?;
        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}
