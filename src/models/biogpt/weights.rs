//! Tensor names and shapes of the BioGPT decoder, and binding them to arena
//! slots.

use std::io::{Read, Seek};

use crate::error::Result;
use crate::format::HyperParameters;
use crate::loader::{ModelMaterializer, TensorId};

/// Row `p + POSITION_OFFSET` of the position table encodes position `p`.
pub const POSITION_OFFSET: usize = 2;

#[derive(Debug, Clone)]
pub struct LayerTensors {
    pub self_attn_layer_norm_weight: TensorId,
    pub self_attn_layer_norm_bias: TensorId,
    pub q_proj_weight: TensorId,
    pub q_proj_bias: TensorId,
    pub k_proj_weight: TensorId,
    pub k_proj_bias: TensorId,
    pub v_proj_weight: TensorId,
    pub v_proj_bias: TensorId,
    pub o_proj_weight: TensorId,
    pub o_proj_bias: TensorId,
    pub final_layer_norm_weight: TensorId,
    pub final_layer_norm_bias: TensorId,
    pub fc1_weight: TensorId,
    pub fc1_bias: TensorId,
    pub fc2_weight: TensorId,
    pub fc2_bias: TensorId,
}

#[derive(Debug, Clone)]
pub struct ModelTensors {
    pub embed_tokens: TensorId,
    pub embed_positions: TensorId,
    pub layers: Vec<LayerTensors>,
    pub layer_norm_weight: TensorId,
    pub layer_norm_bias: TensorId,
    pub output_projection: TensorId,
}

fn layer_specs(hp: &HyperParameters, i: usize) -> [(String, Vec<usize>); 16] {
    let (d, f) = (hp.d_model, hp.d_ff);
    let name = |suffix: &str| format!("layers.{i}.{suffix}");
    [
        (name("self_attn_layer_norm.weight"), vec![d]),
        (name("self_attn_layer_norm.bias"), vec![d]),
        (name("self_attn.q_proj.weight"), vec![d, d]),
        (name("self_attn.q_proj.bias"), vec![d]),
        (name("self_attn.k_proj.weight"), vec![d, d]),
        (name("self_attn.k_proj.bias"), vec![d]),
        (name("self_attn.v_proj.weight"), vec![d, d]),
        (name("self_attn.v_proj.bias"), vec![d]),
        (name("self_attn.o_proj.weight"), vec![d, d]),
        (name("self_attn.o_proj.bias"), vec![d]),
        (name("final_layer_norm.weight"), vec![d]),
        (name("final_layer_norm.bias"), vec![d]),
        (name("fc1.weight"), vec![d, f]),
        (name("fc1.bias"), vec![f]),
        (name("fc2.weight"), vec![f, d]),
        (name("fc2.bias"), vec![d]),
    ]
}

fn global_specs(hp: &HyperParameters) -> [(String, Vec<usize>); 5] {
    let d = hp.d_model;
    [
        ("embed_tokens.weight".into(), vec![d, hp.n_vocab]),
        (
            "embed_positions.weight".into(),
            vec![d, hp.n_positions + POSITION_OFFSET],
        ),
        ("layer_norm.weight".into(), vec![d]),
        ("layer_norm.bias".into(), vec![d]),
        ("output_projection.weight".into(), vec![d, hp.n_vocab]),
    ]
}

/// Every tensor the architecture requires, with its file-order shape.
pub fn tensor_layout(hp: &HyperParameters) -> Vec<(String, Vec<usize>)> {
    let mut out = Vec::from(global_specs(hp));
    for i in 0..hp.n_layer {
        out.extend(layer_specs(hp, i));
    }
    out
}

impl ModelTensors {
    pub fn bind<R: Read + Seek>(
        m: &mut ModelMaterializer<R>,
        hp: &HyperParameters,
    ) -> Result<Self> {
        let [tok, pos, ln_w, ln_b, head] = global_specs(hp);
        let embed_tokens = m.get_tensor(&tok.0, &tok.1)?;
        let embed_positions = m.get_tensor(&pos.0, &pos.1)?;

        let mut layers = Vec::with_capacity(hp.n_layer);
        for i in 0..hp.n_layer {
            let mut ids = [0; 16];
            for (id, (name, shape)) in ids.iter_mut().zip(layer_specs(hp, i).iter()) {
                *id = m.get_tensor(name, shape)?;
            }
            let [
                self_attn_layer_norm_weight,
                self_attn_layer_norm_bias,
                q_proj_weight,
                q_proj_bias,
                k_proj_weight,
                k_proj_bias,
                v_proj_weight,
                v_proj_bias,
                o_proj_weight,
                o_proj_bias,
                final_layer_norm_weight,
                final_layer_norm_bias,
                fc1_weight,
                fc1_bias,
                fc2_weight,
                fc2_bias,
            ] = ids;
            layers.push(LayerTensors {
                self_attn_layer_norm_weight,
                self_attn_layer_norm_bias,
                q_proj_weight,
                q_proj_bias,
                k_proj_weight,
                k_proj_bias,
                v_proj_weight,
                v_proj_bias,
                o_proj_weight,
                o_proj_bias,
                final_layer_norm_weight,
                final_layer_norm_bias,
                fc1_weight,
                fc1_bias,
                fc2_weight,
                fc2_bias,
            });
        }

        Ok(Self {
            embed_tokens,
            embed_positions,
            layers,
            layer_norm_weight: m.get_tensor(&ln_w.0, &ln_w.1)?,
            layer_norm_bias: m.get_tensor(&ln_b.0, &ln_b.1)?,
            output_projection: m.get_tensor(&head.0, &head.1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::WeightType;

    #[test]
    fn layout_counts_and_shapes() {
        let hp = HyperParameters {
            n_vocab: 10,
            n_merges: 0,
            n_layer: 3,
            n_head: 2,
            n_positions: 6,
            d_ff: 16,
            d_model: 4,
            ftype: WeightType::F32,
        };
        let layout = tensor_layout(&hp);
        assert_eq!(layout.len(), 5 + 3 * 16);

        let shape = |n: &str| layout.iter().find(|(name, _)| name == n).map(|(_, s)| s.clone());
        assert_eq!(shape("embed_positions.weight"), Some(vec![4, 8]));
        assert_eq!(shape("layers.2.fc2.weight"), Some(vec![16, 4]));
        assert_eq!(shape("layers.0.fc1.bias"), Some(vec![16]));
        assert_eq!(shape("layers.3.fc1.bias"), None);
    }
}
