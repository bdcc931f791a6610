//! Tiny synthetic checkpoints for unit tests.

use std::io::Cursor;

use candle_core::quantized::QTensor;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::format::{FileWriter, HyperParameters, ModelFile, Vocabulary, WeightType};
use crate::models::biogpt::{tensor_layout, Model};

pub fn tiny_hparams() -> HyperParameters {
    HyperParameters {
        n_vocab: 16,
        n_merges: 3,
        n_layer: 2,
        n_head: 4,
        n_positions: 8,
        d_ff: 64,
        d_model: 32,
        ftype: WeightType::F32,
    }
}

pub fn tiny_vocab(hp: &HyperParameters) -> Vocabulary {
    let mut vocab = Vocabulary::new();
    for special in ["<s>", "<pad>", "</s>", "<unk>"] {
        vocab.push_token(special.into()).unwrap();
    }
    for i in vocab.len()..hp.n_vocab {
        vocab.push_token(format!("tok{i}</w>")).unwrap();
    }
    for merge in ["t o", "to k", "tok 4</w>"].iter().take(hp.n_merges) {
        vocab.push_merge(merge).unwrap();
    }
    vocab
}

/// Payload bytes for `values` laid out with file-order `shape`.
pub fn encode(values: Vec<f32>, shape: &[usize], dtype: WeightType) -> Vec<u8> {
    if dtype == WeightType::F32 {
        return values.iter().flat_map(|v| v.to_le_bytes()).collect();
    }
    let dims: Vec<usize> = shape.iter().rev().copied().collect();
    let t = Tensor::from_vec(values, dims, &Device::Cpu).unwrap();
    let q = QTensor::quantize(&t, dtype.ggml_dtype()).unwrap();
    q.data().unwrap().into_owned()
}

pub fn write_model(hp: &HyperParameters, ftype: WeightType, seed: u64) -> Vec<u8> {
    write_model_with(hp, ftype, seed, |_| true)
}

/// Writes every architecture tensor for which `keep` returns true. Matrices
/// are stored as `ftype`, vectors as f32.
pub fn write_model_with(
    hp: &HyperParameters,
    ftype: WeightType,
    seed: u64,
    keep: impl Fn(&str) -> bool,
) -> Vec<u8> {
    let hp = HyperParameters { ftype, ..*hp };
    let mut rng = StdRng::seed_from_u64(seed);
    let mut w = FileWriter::new(Vec::new());
    w.write_header(&hp, &tiny_vocab(&hp)).unwrap();

    for (name, shape) in tensor_layout(&hp) {
        let n: usize = shape.iter().product();
        let (base, spread) = if name.ends_with("layer_norm.weight") {
            (1.0, 0.1)
        } else if shape.len() == 1 {
            (0.0, 0.05)
        } else {
            (0.0, 0.2)
        };
        let values: Vec<f32> = (0..n)
            .map(|_| base + spread * rng.gen_range(-1.0f32..1.0))
            .collect();
        if !keep(&name) {
            continue;
        }
        let dtype = if shape.len() == 1 { WeightType::F32 } else { ftype };
        w.write_tensor(&name, &shape, dtype, &encode(values, &shape, dtype))
            .unwrap();
    }
    w.into_inner()
}

pub fn tiny_model(ftype: WeightType) -> Model {
    let bytes = write_model(&tiny_hparams(), ftype, 42);
    let file = ModelFile::from_reader(Cursor::new(bytes)).unwrap();
    Model::from_model_file(file, &Device::Cpu, &mut |_| {}).unwrap()
}
