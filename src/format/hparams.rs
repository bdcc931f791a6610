use super::WeightType;
use crate::error::{format_err, Result};

/// Model geometry, stored as a fixed sequence of u32 fields after the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HyperParameters {
    pub n_vocab: usize,
    pub n_merges: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_positions: usize,
    pub d_ff: usize,
    pub d_model: usize,
    /// Type most weight matrices are stored in.
    pub ftype: WeightType,
}

impl HyperParameters {
    /// Number of u32 fields in the on-disk block.
    pub const N_FIELDS: usize = 8;

    /// Index of `ftype` in the on-disk block.
    pub const FTYPE_FIELD: usize = 7;

    pub fn from_fields(fields: [u32; Self::N_FIELDS]) -> Result<Self> {
        let [n_vocab, n_merges, n_layer, n_head, n_positions, d_ff, d_model, ftype] =
            fields.map(|f| f as usize);
        let hparams = Self {
            n_vocab,
            n_merges,
            n_layer,
            n_head,
            n_positions,
            d_ff,
            d_model,
            ftype: WeightType::from_tag(ftype as u32)?,
        };
        hparams.validate()?;
        Ok(hparams)
    }

    pub fn to_fields(&self) -> [u32; Self::N_FIELDS] {
        [
            self.n_vocab as u32,
            self.n_merges as u32,
            self.n_layer as u32,
            self.n_head as u32,
            self.n_positions as u32,
            self.d_ff as u32,
            self.d_model as u32,
            self.ftype.tag(),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("n_vocab", self.n_vocab),
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
            ("n_positions", self.n_positions),
            ("d_ff", self.d_ff),
            ("d_model", self.d_model),
        ];
        if let Some((field, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(format_err!("hyperparameter {field} must be non-zero"));
        }
        if self.d_model % self.n_head != 0 {
            return Err(format_err!(
                "d_model ({}) is not divisible by n_head ({})",
                self.d_model,
                self.n_head
            ));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_head
    }
}
