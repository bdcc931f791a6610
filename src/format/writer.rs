use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{padding_for, HyperParameters, Vocabulary, WeightType, MAGIC, VERSION};
use crate::error::{format_err, Result};

/// Sequential writer for the model format.
///
/// Tracks its own offset so payload padding can be computed without seeking;
/// the wrapped stream must start at offset 0.
pub struct FileWriter<W> {
    inner: W,
    pos: u64,
}

impl<W: Write> FileWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, pos: 0 }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.inner.write_u32::<LittleEndian>(value)?;
        self.pos += 4;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    /// Length-prefixed byte string.
    pub fn write_string(&mut self, s: &[u8]) -> Result<()> {
        self.write_u32(s.len() as u32)?;
        self.write_bytes(s)
    }

    pub fn write_magic(&mut self) -> Result<()> {
        self.write_u32(MAGIC)?;
        self.write_u32(VERSION)
    }

    pub fn write_hparams(&mut self, hparams: &HyperParameters) -> Result<()> {
        for field in hparams.to_fields() {
            self.write_u32(field)?;
        }
        Ok(())
    }

    pub fn write_vocab(&mut self, vocab: &Vocabulary) -> Result<()> {
        self.write_u32(vocab.len() as u32)?;
        for id in 0..vocab.len() as u32 {
            let token = vocab.token(id).unwrap_or_default();
            self.write_string(token.as_bytes())?;
        }
        Ok(())
    }

    pub fn write_merges(&mut self, vocab: &Vocabulary) -> Result<()> {
        self.write_u32(vocab.n_merges() as u32)?;
        for (left, right) in vocab.merges() {
            self.write_string(format!("{left} {right}").as_bytes())?;
        }
        Ok(())
    }

    /// Magic, version, hyperparameters, vocabulary and merges.
    pub fn write_header(&mut self, hparams: &HyperParameters, vocab: &Vocabulary) -> Result<()> {
        self.write_magic()?;
        self.write_hparams(hparams)?;
        self.write_vocab(vocab)?;
        self.write_merges(vocab)
    }

    /// One tensor record. `shape` is in file order (innermost first) and the
    /// payload must be exactly the size the type and shape call for.
    pub fn write_tensor(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: WeightType,
        payload: &[u8],
    ) -> Result<()> {
        let expected = dtype.tensor_size(shape)?;
        if payload.len() != expected {
            return Err(format_err!(
                "tensor '{name}': {} payload bytes for shape {shape:?} of {dtype}, \
                 expected {expected}",
                payload.len()
            ));
        }
        self.write_u32(shape.len() as u32)?;
        self.write_u32(name.len() as u32)?;
        self.write_u32(dtype.tag())?;
        for &dim in shape {
            self.write_u32(dim as u32)?;
        }
        self.write_bytes(name.as_bytes())?;
        let pad = padding_for(self.pos) as usize;
        self.write_bytes(&[0u8; super::ALIGNMENT as usize][..pad])?;
        self.write_bytes(payload)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
