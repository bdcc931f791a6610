//! Top-k / top-p sampling over a logits vector.

use std::cmp::Ordering;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::{Error, Result};
use crate::format::TokenId;

/// Higher score first; equal scores keep the lower token id first.
fn by_score(a: &(f64, usize), b: &(f64, usize)) -> Ordering {
    b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
}

/// The distribution [`sample`] draws from, most likely token first.
///
/// `top_k` is clamped to `[1, logits.len()]`. When `top_p < 1` only the
/// shortest prefix whose probability mass reaches `top_p` is kept, and the
/// result is renormalized.
pub fn candidates(
    logits: &[f32],
    top_k: usize,
    top_p: f32,
    temperature: f32,
) -> Result<Vec<(TokenId, f32)>> {
    if logits.is_empty() {
        return Err(Error::InvalidArgument("cannot sample from empty logits".into()));
    }
    if temperature.is_nan() || temperature <= 0.0 {
        return Err(Error::InvalidArgument(format!(
            "temperature must be positive, got {temperature}"
        )));
    }

    let scale = 1.0 / temperature as f64;
    let mut scored: Vec<(f64, usize)> = logits
        .iter()
        .enumerate()
        .map(|(i, &l)| (l as f64 * scale, i))
        .collect();

    let k = top_k.clamp(1, scored.len());
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, by_score);
        scored.truncate(k);
    }
    scored.sort_by(by_score);

    let max = scored[0].0;
    let mut probs: Vec<f64> = scored.iter().map(|(s, _)| (s - max).exp()).collect();
    let sum: f64 = probs.iter().sum();
    probs.iter_mut().for_each(|p| *p /= sum);

    if top_p < 1.0 {
        let mut cumulative = 0.0;
        let mut keep = probs.len();
        for (i, p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= top_p as f64 {
                keep = i + 1;
                break;
            }
        }
        probs.truncate(keep);
        let sum: f64 = probs.iter().sum();
        probs.iter_mut().for_each(|p| *p /= sum);
    }

    Ok(scored
        .iter()
        .zip(&probs)
        .map(|(&(_, id), &p)| (id as TokenId, p as f32))
        .collect())
}

/// Draw the next token id from `logits`.
pub fn sample<R: Rng + ?Sized>(
    logits: &[f32],
    top_k: usize,
    top_p: f32,
    temperature: f32,
    rng: &mut R,
) -> Result<TokenId> {
    let candidates = candidates(logits, top_k, top_p, temperature)?;
    let dist = WeightedIndex::new(candidates.iter().map(|&(_, p)| p))
        .map_err(|e| Error::InvalidArgument(format!("degenerate distribution: {e}")))?;
    Ok(candidates[dist.sample(rng)].0)
}
