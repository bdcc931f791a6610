use std::io::{Read, Seek};
use std::path::Path;
use std::time::Instant;

use candle_core::Device;
use tracing::info;

use super::kv_cache::KvCache;
use super::modeling::BioGptTransformer;
use super::weights::ModelTensors;
use crate::error::Result;
use crate::format::{HyperParameters, ModelFile, TensorCatalog, Vocabulary};
use crate::loader::{LoadedWeights, ModelMaterializer, WeightArena};

/// A loaded BioGPT checkpoint.
///
/// Owns the engine-side modules and the KV cache, released together when the
/// model is dropped. The weight arena they were built from is freed once
/// they exist, unless the model was loaded with
/// [`load_with_arena`](Self::load_with_arena) or
/// [`from_model_file_with_arena`](Self::from_model_file_with_arena), which keep the
/// payloads exactly as stored so the quantizer can write them back out.
pub struct Model {
    hparams: HyperParameters,
    vocab: Vocabulary,
    catalog: TensorCatalog,
    arena: Option<WeightArena>,
    transformer: BioGptTransformer,
    kv_cache: KvCache,
    device: Device,
}

impl Model {
    pub fn load(
        path: impl AsRef<Path>,
        device: &Device,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Self> {
        Self::load_shards(&[path], device, progress)
    }

    /// Like [`load`](Self::load), keeping the weight arena.
    pub fn load_with_arena(
        path: impl AsRef<Path>,
        device: &Device,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Self> {
        let start = Instant::now();
        let file = ModelFile::open(path)?;
        let model = Self::materialize(file, device, progress, true)?;
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model loaded with weight arena"
        );
        Ok(model)
    }

    /// Load a model split across `paths`, in shard order.
    pub fn load_shards<P: AsRef<Path>>(
        paths: &[P],
        device: &Device,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Self> {
        let start = Instant::now();
        let file = ModelFile::open_shards(paths)?;
        let model = Self::from_model_file(file, device, progress)?;
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model loaded"
        );
        Ok(model)
    }

    pub fn from_model_file<R: Read + Seek>(
        file: ModelFile<R>,
        device: &Device,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Self> {
        Self::materialize(file, device, progress, false)
    }

    pub fn from_model_file_with_arena<R: Read + Seek>(
        file: ModelFile<R>,
        device: &Device,
        progress: &mut dyn FnMut(f32),
    ) -> Result<Self> {
        Self::materialize(file, device, progress, true)
    }

    fn materialize<R: Read + Seek>(
        file: ModelFile<R>,
        device: &Device,
        progress: &mut dyn FnMut(f32),
        keep_arena: bool,
    ) -> Result<Self> {
        let hp = file.hparams;
        info!(
            n_vocab = hp.n_vocab,
            n_merges = hp.n_merges,
            d_model = hp.d_model,
            d_ff = hp.d_ff,
            n_head = hp.n_head,
            n_layer = hp.n_layer,
            n_positions = hp.n_positions,
            ftype = %hp.ftype,
            n_shards = file.n_shards(),
            "model hyperparameters"
        );

        let mut materializer = ModelMaterializer::new(file)?;
        let tensors = ModelTensors::bind(&mut materializer, &hp)?;
        materializer.done_getting_tensors()?;
        materializer.load_all_data(progress)?;
        let LoadedWeights {
            hparams,
            vocab,
            catalog,
            arena,
        } = materializer.finish();

        let transformer = BioGptTransformer::new(&hparams, &tensors, &arena, device)?;
        let kv_cache = KvCache::new(&hparams, device)?;
        info!(
            weights_mb = arena.size_in_bytes() as f64 / (1024.0 * 1024.0),
            kv_cache_mb = kv_cache.size_in_bytes() as f64 / (1024.0 * 1024.0),
            "model materialized"
        );

        Ok(Self {
            hparams,
            vocab,
            catalog,
            arena: keep_arena.then_some(arena),
            transformer,
            kv_cache,
            device: device.clone(),
        })
    }

    pub fn hparams(&self) -> &HyperParameters {
        &self.hparams
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn catalog(&self) -> &TensorCatalog {
        &self.catalog
    }

    /// The stored payloads, if this model was loaded with them kept.
    pub fn arena(&self) -> Option<&WeightArena> {
        self.arena.as_ref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv_cache
    }

    pub(crate) fn transformer(&self) -> &BioGptTransformer {
        &self.transformer
    }

    pub fn clear_kv_cache(&mut self) -> Result<()> {
        self.kv_cache.clear()
    }
}
