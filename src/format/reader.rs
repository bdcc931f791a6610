use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::debug;

use super::{
    padding_for, HyperParameters, ShardLocation, TensorCatalog, TensorDescriptor, Vocabulary,
    WeightType, MAGIC, VERSION,
};
use crate::error::{format_err, Error, Result};

/// Bounds-checked little-endian reader over one model file.
///
/// Every read is checked against the stream length first, so a damaged
/// length field turns into [`Error::Truncated`] instead of a huge allocation.
pub struct ShardReader<R> {
    inner: R,
    pos: u64,
    len: u64,
}

impl<R: Read + Seek> ShardReader<R> {
    /// Validate magic and version and leave the reader at the hyperparameters.
    pub fn open(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        let mut reader = Self { inner, pos: 0, len };

        let magic = reader.read_u32()?;
        if magic != MAGIC {
            return Err(format_err!(
                "bad magic {magic:#010x}, expected {MAGIC:#010x}"
            ));
        }
        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(format_err!(
                "unsupported format version {version}, expected {VERSION}"
            ));
        }
        Ok(reader)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn at_eof(&self) -> bool {
        self.pos >= self.len
    }

    fn ensure(&self, needed: u64) -> Result<()> {
        let available = self.len.saturating_sub(self.pos);
        if needed > available {
            return Err(Error::Truncated {
                offset: self.pos,
                needed,
                available,
            });
        }
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        let value = self.inner.read_u32::<LittleEndian>()?;
        self.pos += 4;
        Ok(value)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.ensure(buf.len() as u64)?;
        self.inner.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.ensure(n as u64)?;
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Length-prefixed byte string, returned raw.
    pub fn read_raw_string(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    fn read_string(&mut self, what: &str) -> Result<String> {
        let offset = self.pos;
        let bytes = self.read_raw_string()?;
        String::from_utf8(bytes)
            .map_err(|_| format_err!("{what} at offset {offset} is not valid UTF-8"))
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        self.ensure(n)?;
        self.pos = self.inner.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }

    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        if offset > self.len {
            return Err(Error::Truncated {
                offset,
                needed: 0,
                available: 0,
            });
        }
        self.pos = self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    pub fn read_hparams(&mut self) -> Result<HyperParameters> {
        let mut fields = [0u32; HyperParameters::N_FIELDS];
        for field in fields.iter_mut() {
            *field = self.read_u32()?;
        }
        HyperParameters::from_fields(fields)
    }

    /// Read the vocabulary block into `vocab`; its count must be `n_vocab`.
    pub fn read_vocab(&mut self, n_vocab: usize, vocab: &mut Vocabulary) -> Result<()> {
        let count = self.read_u32()? as usize;
        if count != n_vocab {
            return Err(format_err!(
                "vocabulary holds {count} tokens, header says {n_vocab}"
            ));
        }
        for _ in 0..count {
            let token = self.read_string("vocabulary entry")?;
            vocab.push_token(token)?;
        }
        Ok(())
    }

    pub fn read_merges(&mut self, n_merges: usize, vocab: &mut Vocabulary) -> Result<()> {
        let count = self.read_u32()? as usize;
        if count != n_merges {
            return Err(format_err!(
                "merge table holds {count} entries, header says {n_merges}"
            ));
        }
        for _ in 0..count {
            let merge = self.read_string("merge entry")?;
            vocab.push_merge(&merge)?;
        }
        Ok(())
    }

    /// Scan tensor records to end of stream, recording each in `catalog`
    /// without reading its payload.
    pub fn read_tensor_metadata(
        &mut self,
        shard: usize,
        catalog: &mut TensorCatalog,
    ) -> Result<()> {
        let mut n_records = 0usize;
        while !self.at_eof() {
            let n_dims = self.read_u32()?;
            let name_len = self.read_u32()? as usize;
            let tag = self.read_u32()?;
            if !(1..=2).contains(&n_dims) {
                return Err(format_err!(
                    "tensor record at offset {} has {n_dims} dimensions, only 1 or 2 supported",
                    self.pos - 12
                ));
            }
            let dtype = WeightType::from_tag(tag)?;
            let shape = (0..n_dims)
                .map(|_| self.read_u32().map(|d| d as usize))
                .collect::<Result<Vec<_>>>()?;
            let name_bytes = self.read_bytes(name_len)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| format_err!("tensor name is not valid UTF-8"))?;

            self.skip(padding_for(self.pos))?;
            let size = dtype.tensor_size(&shape)?;
            let offset = self.pos;
            self.skip(size as u64)?;

            debug!(shard, %name, ?shape, %dtype, offset, size, "tensor record");
            catalog.register(&name, shape, dtype, ShardLocation { shard, offset, size })?;
            n_records += 1;
        }
        debug!(shard, n_records, "finished scanning tensor records");
        Ok(())
    }
}

/// A parsed model: header, vocabulary and tensor catalog, with the shard
/// streams kept open for payload reads.
pub struct ModelFile<R = BufReader<File>> {
    pub hparams: HyperParameters,
    pub vocab: Vocabulary,
    pub catalog: TensorCatalog,
    shards: Vec<ShardReader<R>>,
}

impl ModelFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_shards(&[path])
    }

    /// Open an ordered shard set. The first file supplies the vocabulary.
    pub fn open_shards<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let files = paths
            .iter()
            .map(|p| {
                let path = p.as_ref();
                File::open(path)
                    .map(BufReader::new)
                    .map_err(|source| Error::Open {
                        path: path.to_path_buf(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_readers(files)
    }
}

impl<R: Read + Seek> ModelFile<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        Self::from_readers(vec![reader])
    }

    pub fn from_readers(readers: Vec<R>) -> Result<Self> {
        if readers.is_empty() {
            return Err(Error::InvalidArgument("no model files given".into()));
        }

        let mut first: Option<(HyperParameters, Vocabulary)> = None;
        let mut catalog = TensorCatalog::new();
        let mut shards = Vec::with_capacity(readers.len());

        for (idx, inner) in readers.into_iter().enumerate() {
            let mut reader = ShardReader::open(inner)?;
            let hparams = reader.read_hparams()?;
            let mut vocab = Vocabulary::new();
            reader.read_vocab(hparams.n_vocab, &mut vocab)?;
            reader.read_merges(hparams.n_merges, &mut vocab)?;

            if let Some((expected, _)) = &first {
                if *expected != hparams {
                    return Err(format_err!(
                        "shard {idx} hyperparameters {hparams:?} differ from shard 0 {expected:?}"
                    ));
                }
            } else {
                first = Some((hparams, vocab));
            }

            reader.read_tensor_metadata(idx, &mut catalog)?;
            shards.push(reader);
        }

        let (hparams, vocab) = first.ok_or_else(|| format_err!("no shard header"))?;
        debug!(
            n_shards = shards.len(),
            n_tensors = catalog.len(),
            bytes = catalog.total_size(),
            "model file scanned"
        );
        Ok(Self {
            hparams,
            vocab,
            catalog,
            shards,
        })
    }

    pub fn n_shards(&self) -> usize {
        self.shards.len()
    }

    /// Read a tensor's full payload into `dst`, concatenating its shard pieces.
    pub fn read_payload(&mut self, tensor: &TensorDescriptor, dst: &mut [u8]) -> Result<()> {
        if dst.len() != tensor.size {
            return Err(Error::InvalidArgument(format!(
                "buffer of {} bytes for tensor '{}' of {} bytes",
                dst.len(),
                tensor.name,
                tensor.size
            )));
        }
        let mut filled = 0;
        for loc in &tensor.shards {
            let reader = self.shards.get_mut(loc.shard).ok_or_else(|| {
                format_err!("tensor '{}' refers to missing shard {}", tensor.name, loc.shard)
            })?;
            reader.seek_to(loc.offset)?;
            reader.read_exact(&mut dst[filled..filled + loc.size])?;
            filled += loc.size;
        }
        Ok(())
    }

    /// Give the shard streams back, e.g. to reuse the first as a copy source.
    pub fn into_readers(self) -> Vec<R> {
        self.shards.into_iter().map(|s| s.inner).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::format::FileWriter;

    fn hparams() -> HyperParameters {
        HyperParameters {
            n_vocab: 3,
            n_merges: 1,
            n_layer: 1,
            n_head: 2,
            n_positions: 4,
            d_ff: 8,
            d_model: 4,
            ftype: WeightType::F32,
        }
    }

    fn vocab() -> Vocabulary {
        let mut v = Vocabulary::new();
        for t in ["<s>", "a", "b</w>"] {
            v.push_token(t.into()).unwrap();
        }
        v.push_merge("a b</w>").unwrap();
        v
    }

    fn header() -> FileWriter<Vec<u8>> {
        let mut w = FileWriter::new(Vec::new());
        w.write_header(&hparams(), &vocab()).unwrap();
        w
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn reads_header_and_catalog() {
        let mut w = header();
        w.write_tensor("bias", &[4], WeightType::F32, &f32_bytes(&[1., 2., 3., 4.]))
            .unwrap();
        w.write_tensor("w", &[4, 2], WeightType::F16, &[7u8; 16]).unwrap();

        let mut file = ModelFile::from_reader(Cursor::new(w.into_inner())).unwrap();
        assert_eq!(file.hparams, hparams());
        assert_eq!(file.vocab.id("b</w>"), Some(2));
        assert_eq!(file.vocab.merge_rank("a", "b</w>"), Some(0));
        assert_eq!(file.catalog.len(), 2);

        let w = file.catalog.get("w").unwrap().clone();
        assert_eq!(w.shards[0].offset % 32, 0);
        let mut buf = vec![0u8; w.size];
        file.read_payload(&w, &mut buf).unwrap();
        assert_eq!(buf, vec![7u8; 16]);
    }

    #[test]
    fn bad_magic_or_version() {
        let mut bytes = header().into_inner();
        bytes[0] ^= 0xff;
        let err = ModelFile::from_reader(Cursor::new(bytes)).err().unwrap();
        assert!(matches!(err, Error::Format(_)), "{err}");

        let mut bytes = header().into_inner();
        bytes[4] = 2;
        let err = ModelFile::from_reader(Cursor::new(bytes)).err().unwrap();
        assert!(matches!(err, Error::Format(_)), "{err}");
    }

    #[test]
    fn vocab_count_mismatch_fails_before_tensors() {
        let mut w = FileWriter::new(Vec::new());
        w.write_magic().unwrap();
        w.write_hparams(&HyperParameters {
            n_vocab: 4,
            ..hparams()
        })
        .unwrap();
        w.write_vocab(&vocab()).unwrap();
        w.write_merges(&vocab()).unwrap();
        // Garbage where tensor records would be; must never be reached.
        w.write_u32(99).unwrap();

        let err = ModelFile::from_reader(Cursor::new(w.into_inner())).err().unwrap();
        let msg = err.to_string();
        assert!(matches!(err, Error::Format(_)));
        assert!(msg.contains("vocabulary"), "{msg}");
    }

    #[test]
    fn truncated_payload() {
        let mut w = header();
        w.write_tensor("w", &[4, 2], WeightType::F32, &[0u8; 32]).unwrap();
        let mut bytes = w.into_inner();
        bytes.truncate(bytes.len() - 5);

        let err = ModelFile::from_reader(Cursor::new(bytes)).err().unwrap();
        match err {
            Error::Truncated {
                needed, available, ..
            } => {
                assert_eq!(needed, 32);
                assert_eq!(available, 27);
            }
            other => panic!("expected truncation, got {other}"),
        }
    }

    #[test]
    fn three_dimensional_tensor_rejected() {
        let mut w = header();
        w.write_u32(3).unwrap();
        w.write_u32(1).unwrap();
        w.write_u32(0).unwrap();
        for _ in 0..3 {
            w.write_u32(1).unwrap();
        }
        w.write_bytes(b"x").unwrap();
        let err = ModelFile::from_reader(Cursor::new(w.into_inner())).err().unwrap();
        assert!(err.to_string().contains("3 dimensions"), "{err}");
    }

    #[test]
    fn unknown_type_tag_rejected() {
        let mut w = header();
        w.write_u32(1).unwrap();
        w.write_u32(1).unwrap();
        w.write_u32(5).unwrap();
        w.write_u32(32).unwrap();
        w.write_bytes(b"x").unwrap();
        let err = ModelFile::from_reader(Cursor::new(w.into_inner())).err().unwrap();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn shards_split_outer_dimension() {
        let row = |v: f32| f32_bytes(&[v; 4]);

        let mut a = header();
        a.write_tensor("w", &[4, 2], WeightType::F32, &[row(1.0), row(2.0)].concat())
            .unwrap();
        let mut b = header();
        b.write_tensor("w", &[4, 2], WeightType::F32, &[row(3.0), row(4.0)].concat())
            .unwrap();

        let mut file = ModelFile::from_readers(vec![
            Cursor::new(a.into_inner()),
            Cursor::new(b.into_inner()),
        ])
        .unwrap();
        assert_eq!(file.n_shards(), 2);

        let w = file.catalog.get("w").unwrap().clone();
        assert_eq!(w.shape, vec![4, 4]);
        let mut buf = vec![0u8; w.size];
        file.read_payload(&w, &mut buf).unwrap();
        assert_eq!(buf, [row(1.0), row(2.0), row(3.0), row(4.0)].concat());
    }

    #[test]
    fn uneven_shards_rejected() {
        let row = |v: f32| f32_bytes(&[v; 4]);

        let mut a = header();
        a.write_tensor("w", &[4, 1], WeightType::F32, &row(1.0)).unwrap();
        let mut b = header();
        b.write_tensor("w", &[4, 2], WeightType::F32, &[row(2.0), row(3.0)].concat())
            .unwrap();

        let err = ModelFile::from_readers(vec![
            Cursor::new(a.into_inner()),
            Cursor::new(b.into_inner()),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, Error::Format(_)), "{err}");
        assert!(err.to_string().contains("disagree on shape"), "{err}");
    }

    #[test]
    fn huge_shape_is_a_format_error() {
        let mut w = header();
        w.write_u32(2).unwrap();
        w.write_u32(1).unwrap();
        w.write_u32(WeightType::F32.tag()).unwrap();
        w.write_u32(u32::MAX).unwrap();
        w.write_u32(u32::MAX).unwrap();
        w.write_bytes(b"x").unwrap();
        let err = ModelFile::from_reader(Cursor::new(w.into_inner())).err().unwrap();
        assert!(matches!(err, Error::Format(_)), "{err}");
    }

    #[test]
    fn shard_hparams_must_agree() {
        let a = header();
        let mut b = FileWriter::new(Vec::new());
        b.write_header(
            &HyperParameters {
                n_layer: 2,
                ..hparams()
            },
            &vocab(),
        )
        .unwrap();
        let err = ModelFile::from_readers(vec![
            Cursor::new(a.into_inner()),
            Cursor::new(b.into_inner()),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.bin");
        match ModelFile::open(&path).err().unwrap() {
            Error::Open { path: p, .. } => assert_eq!(p, path),
            other => panic!("expected open error, got {other}"),
        }
    }
}
