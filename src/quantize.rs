//! Re-encoding a loaded model's weight matrices in a block-quantized type.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use std::time::Instant;

use candle_core::quantized::QTensor;
use candle_core::Device;
use tracing::{debug, info, warn};

use crate::error::{format_err, Error, Result};
use crate::format::{FileWriter, HyperParameters, ShardReader, WeightType};
use crate::models::biogpt::Model;

/// Size accounting for one quantization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantizeStats {
    pub n_tensors: usize,
    /// Tensors that went through the block quantizer.
    pub n_quantized: usize,
    pub original_bytes: usize,
    pub quantized_bytes: usize,
}

impl QuantizeStats {
    pub fn ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 1.0;
        }
        self.quantized_bytes as f64 / self.original_bytes as f64
    }
}

fn copy_string_block<R: Read + Seek, W: Write>(
    src: &mut ShardReader<R>,
    dst: &mut FileWriter<W>,
) -> Result<()> {
    let count = src.read_u32()?;
    dst.write_u32(count)?;
    for _ in 0..count {
        let s = src.read_raw_string()?;
        dst.write_string(&s)?;
    }
    Ok(())
}

/// Copy the header of `src` to `dst` byte for byte, except the stored weight
/// type which becomes `target`.
fn copy_header<R: Read + Seek, W: Write>(
    src: &mut ShardReader<R>,
    dst: &mut FileWriter<W>,
    target: WeightType,
) -> Result<()> {
    dst.write_magic()?;
    for field in 0..HyperParameters::N_FIELDS {
        let value = src.read_u32()?;
        if field == HyperParameters::FTYPE_FIELD {
            dst.write_u32(target.tag())?;
        } else {
            dst.write_u32(value)?;
        }
    }
    copy_string_block(src, dst)?;
    copy_string_block(src, dst)
}

/// Write `model` to `dest` with every 2-D tensor stored as `target`.
///
/// `model` must have been loaded with its weight arena kept, and `source` must
/// be the stream it was loaded from; its header is copied through. Vectors are
/// written unchanged, as are matrices already stored as `target`.
pub fn quantize<R: Read + Seek, W: Write>(
    model: &Model,
    source: R,
    target: WeightType,
    dest: W,
    progress: &mut dyn FnMut(f32),
) -> Result<QuantizeStats> {
    if !target.is_quantized() {
        return Err(format_err!(
            "quantization target must be a block type, got {target}"
        ));
    }

    let arena = model.arena().ok_or_else(|| {
        Error::InvalidArgument("model was loaded without its weight arena".into())
    })?;

    let mut src = ShardReader::open(source)?;
    let mut out = FileWriter::new(dest);
    copy_header(&mut src, &mut out, target)?;

    let slots: HashMap<&str, usize> = arena
        .slots()
        .iter()
        .enumerate()
        .map(|(id, slot)| (slot.name.as_str(), id))
        .collect();

    let cpu = Device::Cpu;
    let mut stats = QuantizeStats::default();
    let n_total = model.catalog().len();
    progress(0.0);

    for (idx, tensor) in model.catalog().iter().enumerate() {
        let id = *slots
            .get(tensor.name.as_str())
            .ok_or_else(|| Error::MissingTensor(tensor.name.clone()))?;
        let original = arena.bytes(id);

        if tensor.n_dims() == 1 || tensor.dtype == target {
            out.write_tensor(&tensor.name, &tensor.shape, tensor.dtype, original)?;
            stats.quantized_bytes += original.len();
        } else {
            let dense = arena.dequantize(id, &cpu)?;
            let q = QTensor::quantize(&dense, target.ggml_dtype())?;
            let data = q.data()?;
            let expected = target.tensor_size(&tensor.shape)?;
            if data.len() != expected {
                return Err(format_err!(
                    "quantizer produced {} bytes for '{}', {target} layout needs {expected}",
                    data.len(),
                    tensor.name
                ));
            }
            out.write_tensor(&tensor.name, &tensor.shape, target, &data)?;
            stats.quantized_bytes += data.len();
            stats.n_quantized += 1;
            debug!(
                name = %tensor.name,
                from = %tensor.dtype,
                to = %target,
                original_kb = original.len() as f64 / 1024.0,
                quantized_kb = data.len() as f64 / 1024.0,
                "quantized tensor"
            );
        }

        stats.original_bytes += original.len();
        stats.n_tensors += 1;
        progress((idx + 1) as f32 / n_total as f32);
    }

    out.flush()?;
    info!(
        n_tensors = stats.n_tensors,
        n_quantized = stats.n_quantized,
        original_mb = stats.original_bytes as f64 / (1024.0 * 1024.0),
        quantized_mb = stats.quantized_bytes as f64 / (1024.0 * 1024.0),
        ratio = stats.ratio(),
        "quantization finished"
    );
    Ok(stats)
}

/// Load `input`, quantize it to `target` and write the result to `output`.
///
/// A failed run removes the partial output file.
pub fn quantize_file(
    input: &Path,
    output: &Path,
    target: WeightType,
    progress: &mut dyn FnMut(f32),
) -> Result<QuantizeStats> {
    let start = Instant::now();
    let model = Model::load_with_arena(input, &Device::Cpu, &mut |_| {})?;

    let open = |path: &Path, file: std::io::Result<File>| {
        file.map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })
    };
    let source = BufReader::new(open(input, File::open(input))?);
    let dest = BufWriter::new(open(output, File::create(output))?);

    let result = quantize(&model, source, target, dest, progress);
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(output) {
            warn!(path = %output.display(), error = %e, "could not remove partial output");
        }
    }
    let stats = result?;
    info!(
        input = %input.display(),
        output = %output.display(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "quantized model written"
    );
    Ok(stats)
}
