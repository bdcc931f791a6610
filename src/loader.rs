//! Binding catalog entries to the architecture and streaming their bytes into
//! one contiguous weight arena.

use std::fs::File;
use std::io::{BufReader, Read, Seek};

use candle_core::quantized::{ggml_file::qtensor_from_ggml, QTensor};
use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use crate::error::{format_err, Error, Result};
use crate::format::{
    HyperParameters, ModelFile, TensorCatalog, TensorDescriptor, Vocabulary, WeightType, ALIGNMENT,
};

/// Handle to a slot in a [`WeightArena`].
pub type TensorId = usize;

#[derive(Debug, Clone)]
pub struct ArenaSlot {
    pub name: String,
    /// File order.
    pub shape: Vec<usize>,
    pub dtype: WeightType,
    pub offset: usize,
    pub size: usize,
}

/// One contiguous allocation holding every weight payload as stored on disk.
///
/// Slots start on [`ALIGNMENT`] offsets from the start of the buffer.
#[derive(Debug, Default)]
pub struct WeightArena {
    data: Vec<u8>,
    slots: Vec<ArenaSlot>,
}

impl WeightArena {
    pub fn with_capacity(bytes: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|_| Error::Resource {
            what: "weight arena",
            bytes,
        })?;
        Ok(Self {
            data,
            slots: Vec::new(),
        })
    }

    fn bind(&mut self, tensor: &TensorDescriptor) -> Result<TensorId> {
        let offset = self.data.len().next_multiple_of(ALIGNMENT as usize);
        let end = offset + tensor.size;
        if end > self.data.capacity() {
            return Err(Error::Resource {
                what: "weight arena slot",
                bytes: end,
            });
        }
        self.data.resize(end, 0);
        self.slots.push(ArenaSlot {
            name: tensor.name.clone(),
            shape: tensor.shape.clone(),
            dtype: tensor.dtype,
            offset,
            size: tensor.size,
        });
        Ok(self.slots.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes in use, padding included.
    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn slot(&self, id: TensorId) -> &ArenaSlot {
        &self.slots[id]
    }

    pub fn slots(&self) -> &[ArenaSlot] {
        &self.slots
    }

    pub fn bytes(&self, id: TensorId) -> &[u8] {
        let slot = &self.slots[id];
        &self.data[slot.offset..slot.offset + slot.size]
    }

    fn bytes_mut(&mut self, id: TensorId) -> &mut [u8] {
        let slot = &self.slots[id];
        &mut self.data[slot.offset..slot.offset + slot.size]
    }

    /// Hand a slot to the tensor engine in its stored type.
    pub fn qtensor(&self, id: TensorId, device: &Device) -> Result<QTensor> {
        let slot = &self.slots[id];
        let dims = slot.shape.iter().rev().copied().collect();
        Ok(qtensor_from_ggml(
            slot.dtype.ggml_dtype(),
            self.bytes(id),
            dims,
            device,
        )?)
    }

    /// A slot expanded to f32, outermost dimension first.
    pub fn dequantize(&self, id: TensorId, device: &Device) -> Result<Tensor> {
        Ok(self.qtensor(id, device)?.dequantize(device)?)
    }
}

/// Everything a finished materialization produced.
pub struct LoadedWeights {
    pub hparams: HyperParameters,
    pub vocab: Vocabulary,
    pub catalog: TensorCatalog,
    pub arena: WeightArena,
}

/// Reconciles a scanned [`ModelFile`] against the tensors an architecture asks
/// for, then loads the claimed payloads.
///
/// Call [`get_tensor`](Self::get_tensor) for every tensor the architecture
/// needs, then [`done_getting_tensors`](Self::done_getting_tensors) to reject
/// leftovers, then [`load_all_data`](Self::load_all_data).
pub struct ModelMaterializer<R = BufReader<File>> {
    file: ModelFile<R>,
    arena: WeightArena,
    bindings: Vec<Option<TensorId>>,
    n_bound: usize,
}

impl<R: Read + Seek> ModelMaterializer<R> {
    pub fn new(file: ModelFile<R>) -> Result<Self> {
        let catalog = &file.catalog;
        let bytes = catalog.total_size() + catalog.len() * ALIGNMENT as usize;
        let arena = WeightArena::with_capacity(bytes)?;
        info!(
            n_tensors = catalog.len(),
            arena_mb = bytes as f64 / (1024.0 * 1024.0),
            "allocated weight arena"
        );
        Ok(Self {
            bindings: vec![None; catalog.len()],
            file,
            arena,
            n_bound: 0,
        })
    }

    pub fn hparams(&self) -> &HyperParameters {
        &self.file.hparams
    }

    pub fn catalog(&self) -> &TensorCatalog {
        &self.file.catalog
    }

    /// Claim the tensor `name`, which must have file-order shape `shape`.
    pub fn get_tensor(&mut self, name: &str, shape: &[usize]) -> Result<TensorId> {
        let idx = self
            .file
            .catalog
            .index_of(name)
            .ok_or_else(|| Error::MissingTensor(name.to_string()))?;
        let tensor = self.file.catalog.by_index(idx);
        if tensor.shape != shape {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: tensor.shape.clone(),
            });
        }
        if self.bindings[idx].is_some() {
            return Err(format_err!("tensor '{name}' bound twice"));
        }
        let id = self.arena.bind(tensor)?;
        self.bindings[idx] = Some(id);
        self.n_bound += 1;
        Ok(id)
    }

    pub fn done_getting_tensors(&self) -> Result<()> {
        if self.n_bound == self.file.catalog.len() {
            return Ok(());
        }
        let names = self
            .file
            .catalog
            .iter()
            .zip(&self.bindings)
            .filter(|(_, b)| b.is_none())
            .map(|(t, _)| t.name.clone())
            .collect();
        Err(Error::ExtraTensor { names })
    }

    /// Stream every claimed tensor into its slot. `progress` sees a
    /// non-decreasing fraction from 0 to 1.
    pub fn load_all_data(&mut self, progress: &mut dyn FnMut(f32)) -> Result<()> {
        progress(0.0);
        let mut n_loaded = 0usize;
        for idx in 0..self.bindings.len() {
            let Some(id) = self.bindings[idx] else {
                continue;
            };
            let tensor = self.file.catalog.by_index(idx).clone();
            self.file.read_payload(&tensor, self.arena.bytes_mut(id))?;
            n_loaded += 1;
            debug!(name = %tensor.name, bytes = tensor.size, "loaded tensor");
            progress(n_loaded as f32 / self.n_bound as f32);
        }

        if n_loaded == 0 {
            warn!("no tensors loaded; empty model, testing only");
            progress(1.0);
        } else if n_loaded != self.n_bound {
            return Err(format_err!(
                "loaded {n_loaded} tensors, {} were bound",
                self.n_bound
            ));
        }
        Ok(())
    }

    pub fn finish(self) -> LoadedWeights {
        LoadedWeights {
            hparams: self.file.hparams,
            vocab: self.file.vocab,
            catalog: self.file.catalog,
            arena: self.arena,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::format::FileWriter;

    fn model_file(tensors: &[(&str, &[usize])]) -> ModelFile<Cursor<Vec<u8>>> {
        let hparams = HyperParameters {
            n_vocab: 1,
            n_merges: 0,
            n_layer: 1,
            n_head: 1,
            n_positions: 1,
            d_ff: 1,
            d_model: 1,
            ftype: WeightType::F32,
        };
        let mut vocab = Vocabulary::new();
        vocab.push_token("x".into()).unwrap();

        let mut w = FileWriter::new(Vec::new());
        w.write_header(&hparams, &vocab).unwrap();
        for (i, (name, shape)) in tensors.iter().enumerate() {
            let n: usize = shape.iter().product();
            let payload: Vec<u8> = (0..n)
                .flat_map(|j| ((i * 100 + j) as f32).to_le_bytes())
                .collect();
            w.write_tensor(name, shape, WeightType::F32, &payload).unwrap();
        }
        ModelFile::from_reader(Cursor::new(w.into_inner())).unwrap()
    }

    #[test]
    fn binds_and_loads_into_aligned_slots() {
        let file = model_file(&[("a", &[3][..]), ("b", &[2, 2][..])]);
        let mut m = ModelMaterializer::new(file).unwrap();
        let a = m.get_tensor("a", &[3]).unwrap();
        let b = m.get_tensor("b", &[2, 2]).unwrap();
        m.done_getting_tensors().unwrap();

        let mut seen = Vec::new();
        m.load_all_data(&mut |f| seen.push(f)).unwrap();
        assert_eq!(seen, vec![0.0, 0.5, 1.0]);

        let weights = m.finish();
        let arena = &weights.arena;
        assert_eq!(arena.slot(b).offset % ALIGNMENT as usize, 0);
        assert!(arena.size_in_bytes() <= arena.capacity());
        assert_eq!(&arena.bytes(a)[4..8], &1f32.to_le_bytes());

        let b = arena.dequantize(b, &Device::Cpu).unwrap();
        assert_eq!(b.dims(), &[2, 2]);
        assert_eq!(
            b.to_vec2::<f32>().unwrap(),
            vec![vec![100., 101.], vec![102., 103.]]
        );
    }

    #[test]
    fn missing_tensor() {
        let mut m = ModelMaterializer::new(model_file(&[("a", &[3][..])])).unwrap();
        match m.get_tensor("nope", &[3]).unwrap_err() {
            Error::MissingTensor(name) => assert_eq!(name, "nope"),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn shape_mismatch_reports_both_shapes() {
        let mut m = ModelMaterializer::new(model_file(&[("a", &[3][..])])).unwrap();
        match m.get_tensor("a", &[4]).unwrap_err() {
            Error::ShapeMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, vec![4]);
                assert_eq!(actual, vec![3]);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn binding_twice_is_rejected() {
        let mut m = ModelMaterializer::new(model_file(&[("a", &[3][..])])).unwrap();
        m.get_tensor("a", &[3]).unwrap();
        assert!(matches!(m.get_tensor("a", &[3]), Err(Error::Format(_))));
    }

    #[test]
    fn leftover_tensor_is_extra() {
        let file = model_file(&[("a", &[3][..]), ("stray", &[1][..]), ("b", &[2][..])]);
        let mut m = ModelMaterializer::new(file).unwrap();
        m.get_tensor("a", &[3]).unwrap();
        m.get_tensor("b", &[2]).unwrap();
        match m.done_getting_tensors().unwrap_err() {
            Error::ExtraTensor { names } => assert_eq!(names, vec!["stray".to_string()]),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn empty_model_is_tolerated() {
        let mut m = ModelMaterializer::new(model_file(&[])).unwrap();
        m.done_getting_tensors().unwrap();
        let mut last = -1.0;
        m.load_all_data(&mut |f| last = f).unwrap();
        assert_eq!(last, 1.0);
        assert!(m.finish().arena.is_empty());
    }
}
