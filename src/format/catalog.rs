//! Name-indexed catalog of the tensors found while scanning a model file.

use std::collections::HashMap;

use super::WeightType;
use crate::error::{format_err, Result};

/// Where one piece of a tensor's payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLocation {
    /// Index of the file in the shard set.
    pub shard: usize,
    /// Absolute byte offset of the payload inside that file.
    pub offset: u64,
    /// Payload bytes stored at `offset`.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub name: String,
    /// File order: innermost dimension first.
    pub shape: Vec<usize>,
    pub dtype: WeightType,
    /// `product(shape) * type_size / block_size`.
    pub size: usize,
    /// Shape of each shard's piece; equal to `shape` for unsplit tensors.
    pub shard_shape: Vec<usize>,
    pub shards: Vec<ShardLocation>,
}

impl TensorDescriptor {
    pub fn n_dims(&self) -> usize {
        self.shape.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TensorCatalog {
    tensors: Vec<TensorDescriptor>,
    name_to_idx: HashMap<String, usize>,
}

impl TensorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one tensor record read from shard `location.shard`.
    ///
    /// A name seen again is another slice of the same tensor, split along its
    /// outermost dimension. Every slice must have the same type and shape as
    /// the first, and the logical outermost extent is that of one slice times
    /// the number of slices.
    pub fn register(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        dtype: WeightType,
        location: ShardLocation,
    ) -> Result<()> {
        let size = dtype.tensor_size(&shape)?;
        if size != location.size {
            return Err(format_err!(
                "tensor '{name}' payload is {} bytes, shape {shape:?} of {dtype} needs {size}",
                location.size
            ));
        }

        let Some(&idx) = self.name_to_idx.get(name) else {
            self.name_to_idx.insert(name.to_string(), self.tensors.len());
            self.tensors.push(TensorDescriptor {
                name: name.to_string(),
                shape: shape.clone(),
                dtype,
                size,
                shard_shape: shape,
                shards: vec![location],
            });
            return Ok(());
        };

        let entry = &mut self.tensors[idx];
        if entry.dtype != dtype {
            return Err(format_err!(
                "tensor '{name}' shards disagree on type: {} vs {dtype}",
                entry.dtype
            ));
        }
        if entry.shard_shape != shape {
            return Err(format_err!(
                "tensor '{name}' shards disagree on shape: {:?} vs {shape:?}",
                entry.shard_shape
            ));
        }
        let outer = shape.len() - 1;
        let n_shards = entry.shards.len() + 1;
        let mut logical = shape;
        logical[outer] = logical[outer].checked_mul(n_shards).ok_or_else(|| {
            format_err!("tensor '{name}' split over {n_shards} shards overflows")
        })?;
        entry.size = dtype.tensor_size(&logical)?;
        entry.shape = logical;
        entry.shards.push(location);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_idx.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&TensorDescriptor> {
        self.index_of(name).map(|idx| &self.tensors[idx])
    }

    pub fn by_index(&self, idx: usize) -> &TensorDescriptor {
        &self.tensors[idx]
    }

    /// Tensors in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &TensorDescriptor> {
        self.tensors.iter()
    }

    /// Sum of all payload sizes.
    pub fn total_size(&self) -> usize {
        self.tensors.iter().map(|t| t.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn loc(shard: usize, offset: u64, size: usize) -> ShardLocation {
        ShardLocation {
            shard,
            offset,
            size,
        }
    }

    #[test]
    fn shards_concatenate_along_rows() {
        let mut catalog = TensorCatalog::new();
        for shard in 0..3 {
            catalog
                .register("w", vec![4, 2], WeightType::F32, loc(shard, 64, 32))
                .unwrap();
        }

        let w = catalog.get("w").unwrap();
        assert_eq!(w.shape, vec![4, 6]);
        assert_eq!(w.shard_shape, vec![4, 2]);
        assert_eq!(w.size, 96);
        assert_eq!(w.shards, vec![loc(0, 64, 32), loc(1, 64, 32), loc(2, 64, 32)]);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn shard_type_or_shape_disagreement_is_rejected() {
        let mut catalog = TensorCatalog::new();
        catalog
            .register("w", vec![4, 2], WeightType::F32, loc(0, 0, 32))
            .unwrap();

        let err = catalog
            .register("w", vec![4, 2], WeightType::F16, loc(1, 0, 16))
            .unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        // Same rows, different number of them.
        let err = catalog
            .register("w", vec![4, 3], WeightType::F32, loc(1, 0, 48))
            .unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{err}");

        let err = catalog
            .register("w", vec![8, 1], WeightType::F32, loc(1, 0, 32))
            .unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        let err = catalog
            .register("w", vec![8], WeightType::F32, loc(1, 0, 32))
            .unwrap_err();
        assert!(matches!(err, Error::Format(_)));

        let w = catalog.get("w").unwrap();
        assert_eq!(w.shape, vec![4, 2]);
        assert_eq!(w.shards.len(), 1);
    }

    #[test]
    fn first_seen_order_is_kept() {
        let mut catalog = TensorCatalog::new();
        for (i, name) in ["b", "a", "c"].iter().enumerate() {
            catalog
                .register(name, vec![2], WeightType::F32, loc(0, i as u64 * 8, 8))
                .unwrap();
        }
        let names: Vec<_> = catalog.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["b", "a", "c"]);
        assert_eq!(catalog.index_of("c"), Some(2));
        assert_eq!(catalog.total_size(), 24);
    }
}
