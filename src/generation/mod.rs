//! Autoregressive generation: the parameter bundle, the sampler and the
//! driver loop.

pub mod based;
pub mod sampling;

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::format::TokenId;

/// Knobs for one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// RNG seed; the current time when absent.
    pub seed: Option<u64>,
    pub n_threads: usize,
    /// Upper bound on new tokens, further limited by the context window.
    pub n_predict: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    /// Prompt tokens fed per decode call.
    pub n_batch: usize,
    /// Generation stops after this token is emitted.
    pub eos_token_id: Option<TokenId>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            seed: None,
            n_threads: cpus.min(4),
            n_predict: 200,
            top_k: 40,
            top_p: 0.9,
            temperature: 0.9,
            n_batch: 8,
            eos_token_id: Some(2),
        }
    }
}

impl GenerationConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&data).map_err(|e| {
            Error::InvalidArgument(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| -> Result<()> { Err(Error::InvalidArgument(msg.to_string())) };
        if self.n_threads == 0 {
            return bad("n_threads must be at least 1");
        }
        if self.n_batch == 0 {
            return bad("n_batch must be at least 1");
        }
        if self.temperature.is_nan() || self.temperature <= 0.0 {
            return bad("temperature must be positive");
        }
        if self.top_p.is_nan() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return bad("top_p must be in (0, 1]");
        }
        Ok(())
    }

    /// RNG for this run, seeded from `seed` or the clock.
    pub fn rng(&self) -> StdRng {
        let seed = self.seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        });
        info!(seed, "sampling seed");
        StdRng::seed_from_u64(seed)
    }
}
