use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::info;

use super::sampling::sample;
use super::GenerationConfig;
use crate::error::{Error, Result};
use crate::format::TokenId;
use crate::models::biogpt::DecodeEngine;

pub trait ModelForCausalLM {
    /// Context window length.
    fn n_positions(&self) -> usize;

    /// Logits after feeding `tokens` at positions `n_past..`.
    fn decode(&mut self, tokens: &[TokenId], n_past: usize) -> Result<Vec<f32>>;

    /// Feed `prompt` in chunks of `config.n_batch`, then sample and feed back
    /// up to `config.n_predict` tokens, bounded by the context window.
    ///
    /// Each sampled id is handed to `on_token` before the next step. An
    /// emitted `eos_token_id` ends the run and is included in the output.
    fn generate(
        &mut self,
        prompt: &[TokenId],
        config: &GenerationConfig,
        rng: &mut dyn RngCore,
        on_token: &mut dyn FnMut(TokenId) -> Result<()>,
    ) -> Result<Vec<TokenId>> {
        if prompt.is_empty() {
            return Err(Error::InvalidArgument("empty prompt".into()));
        }
        if config.n_batch == 0 {
            return Err(Error::InvalidArgument("n_batch must be at least 1".into()));
        }
        let n_positions = self.n_positions();
        if prompt.len() > n_positions {
            return Err(Error::ContextOverflow {
                n_past: 0,
                n_tokens: prompt.len(),
                n_positions,
            });
        }
        let n_predict = config.n_predict.min(n_positions - prompt.len());

        let mut predict_time = Duration::ZERO;
        let mut sample_time = Duration::ZERO;
        let mut n_decode_calls = 0usize;

        let mut n_past = 0;
        let mut logits = Vec::new();
        for chunk in prompt.chunks(config.n_batch) {
            let t = Instant::now();
            logits = self.decode(chunk, n_past)?;
            predict_time += t.elapsed();
            n_decode_calls += 1;
            n_past += chunk.len();
        }

        let mut output = Vec::with_capacity(n_predict);
        for step in 0..n_predict {
            let t = Instant::now();
            let next = sample(&logits, config.top_k, config.top_p, config.temperature, rng)?;
            sample_time += t.elapsed();

            on_token(next)?;
            output.push(next);
            if Some(next) == config.eos_token_id || step + 1 == n_predict {
                break;
            }

            let t = Instant::now();
            logits = self.decode(&[next], n_past)?;
            predict_time += t.elapsed();
            n_decode_calls += 1;
            n_past += 1;
        }

        let per_call = |d: Duration, n: usize| d.as_secs_f64() * 1e3 / n.max(1) as f64;
        info!(
            prompt_tokens = prompt.len(),
            generated = output.len(),
            sample_ms = sample_time.as_secs_f64() * 1e3,
            predict_ms = predict_time.as_secs_f64() * 1e3,
            predict_ms_per_call = per_call(predict_time, n_decode_calls),
            "generation finished"
        );
        Ok(output)
    }
}

impl ModelForCausalLM for DecodeEngine {
    fn n_positions(&self) -> usize {
        self.model().hparams().n_positions
    }

    fn decode(&mut self, tokens: &[TokenId], n_past: usize) -> Result<Vec<f32>> {
        DecodeEngine::decode(self, tokens, n_past)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::format::WeightType;
    use crate::test_factory::tiny_model;

    /// Always predicts `next`; records every decode call.
    struct DummyModel {
        n_positions: usize,
        n_vocab: usize,
        next: TokenId,
        calls: Vec<(Vec<TokenId>, usize)>,
    }

    impl DummyModel {
        fn new(next: TokenId) -> Self {
            Self {
                n_positions: 16,
                n_vocab: 8,
                next,
                calls: Vec::new(),
            }
        }
    }

    impl ModelForCausalLM for DummyModel {
        fn n_positions(&self) -> usize {
            self.n_positions
        }

        fn decode(&mut self, tokens: &[TokenId], n_past: usize) -> Result<Vec<f32>> {
            self.calls.push((tokens.to_vec(), n_past));
            let mut logits = vec![0.0; self.n_vocab];
            logits[self.next as usize] = 10.0;
            Ok(logits)
        }
    }

    fn greedy(n_predict: usize) -> GenerationConfig {
        GenerationConfig {
            seed: Some(0),
            n_predict,
            top_k: 1,
            n_batch: 3,
            eos_token_id: None,
            ..Default::default()
        }
    }

    #[test]
    fn prompt_fed_in_batches() -> Result<()> {
        let mut model = DummyModel::new(5);
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.generate(&[1, 2, 3, 4, 5, 6, 7], &greedy(2), &mut rng, &mut |_| Ok(()))?;

        assert_eq!(out, vec![5, 5]);
        let calls: Vec<_> = model.calls.iter().map(|(t, p)| (t.len(), *p)).collect();
        assert_eq!(calls, vec![(3, 0), (3, 3), (1, 6), (1, 7)]);
        Ok(())
    }

    #[test]
    fn stops_at_eos_and_reports_tokens() -> Result<()> {
        let mut model = DummyModel::new(2);
        let config = GenerationConfig {
            eos_token_id: Some(2),
            ..greedy(10)
        };
        let mut seen = Vec::new();
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.generate(&[1], &config, &mut rng, &mut |t| {
            seen.push(t);
            Ok(())
        })?;
        assert_eq!(out, vec![2]);
        assert_eq!(seen, out);
        Ok(())
    }

    #[test]
    fn bounded_by_context_window() -> Result<()> {
        let mut model = DummyModel::new(4);
        let prompt: Vec<TokenId> = vec![1; 12];
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.generate(&prompt, &greedy(100), &mut rng, &mut |_| Ok(()))?;
        assert_eq!(out.len(), 4);
        let last_call = model.calls.last().unwrap();
        assert!(last_call.1 + last_call.0.len() <= model.n_positions);

        let too_long: Vec<TokenId> = vec![1; 17];
        assert!(matches!(
            model.generate(&too_long, &greedy(1), &mut rng, &mut |_| Ok(())),
            Err(Error::ContextOverflow { .. })
        ));
        Ok(())
    }

    #[test]
    fn callback_error_aborts() {
        let mut model = DummyModel::new(3);
        let mut rng = StdRng::seed_from_u64(0);
        let err = model
            .generate(&[1], &greedy(5), &mut rng, &mut |_| {
                Err(Error::InvalidArgument("stop".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(model.calls.len(), 1);
    }

    #[test]
    fn engine_generation_is_reproducible() -> Result<()> {
        let config = GenerationConfig {
            seed: Some(17),
            n_predict: 5,
            n_batch: 2,
            ..Default::default()
        };
        let run = || -> Result<Vec<TokenId>> {
            let mut engine = DecodeEngine::new(tiny_model(WeightType::F32), 1)?;
            let mut rng = config.rng();
            engine.generate(&[0, 7, 9], &config, &mut rng, &mut |_| Ok(()))
        };
        let a = run()?;
        assert_eq!(a, run()?);
        assert!(!a.is_empty() && a.len() <= 5);
        Ok(())
    }
}
