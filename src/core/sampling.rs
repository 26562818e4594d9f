//! LogitPipeline: repetition/presence/frequency penalties, top-k, min-p,
//! and the final temperature/nucleus sampler, with optional logprob capture.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::GenerationParams;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct TopLogprob {
    pub token_id: u32,
    pub logprob: f32,
}

#[derive(Debug, Clone)]
pub struct LogprobRecord {
    pub token_id: u32,
    pub logprob: f32,
    pub top: Vec<TopLogprob>,
}

/// Applies the penalty/shaping chain to a row of logits and samples a token.
/// Owns the sliding window of recently-emitted tokens used by the
/// repetition/presence/frequency penalties.
pub struct LogitPipeline {
    temperature: f64,
    top_p: f64,
    top_k: usize,
    min_p: f64,
    repetition_penalty: f32,
    repetition_context_size: usize,
    presence_penalty: f64,
    frequency_penalty: f64,
    logprobs: bool,
    top_logprobs: usize,
    window: VecDeque<u32>,
    counts: HashMap<u32, u32>,
    rng: StdRng,
}

impl LogitPipeline {
    pub fn new(params: &GenerationParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            min_p: params.min_p,
            repetition_penalty: params.repetition_penalty,
            repetition_context_size: params.repetition_context_size,
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
            logprobs: params.logprobs,
            top_logprobs: params.top_logprobs,
            window: VecDeque::new(),
            counts: HashMap::new(),
            rng,
        }
    }

    /// Seeds the repetition window from the tail of the prompt, so penalties
    /// take effect from the very first generated token.
    pub fn prime(&mut self, prompt_tokens: &[u32]) {
        let start = prompt_tokens.len().saturating_sub(self.repetition_context_size);
        for &t in &prompt_tokens[start..] {
            self.push_window(t);
        }
    }

    /// Records a generated token into the repetition window.
    pub fn observe(&mut self, token: u32) {
        self.push_window(token);
    }

    fn push_window(&mut self, token: u32) {
        self.window.push_back(token);
        *self.counts.entry(token).or_insert(0) += 1;
        if self.window.len() > self.repetition_context_size {
            if let Some(evicted) = self.window.pop_front() {
                if let Some(c) = self.counts.get_mut(&evicted) {
                    *c -= 1;
                    if *c == 0 {
                        self.counts.remove(&evicted);
                    }
                }
            }
        }
    }

    /// Applies repetition/presence/frequency penalties then top-k/min-p
    /// masking, in place, ahead of sampling.
    pub fn apply(&self, logits: &mut [f32]) {
        self.apply_repetition_penalty(logits);
        self.apply_presence_and_frequency_penalty(logits);
        self.apply_top_k(logits);
        self.apply_min_p(logits);
    }

    fn apply_repetition_penalty(&self, logits: &mut [f32]) {
        if (self.repetition_penalty - 1.0).abs() < f32::EPSILON || self.repetition_context_size == 0 {
            return;
        }
        for (&token, _) in self.counts.iter() {
            if let Some(l) = logits.get_mut(token as usize) {
                if *l >= 0.0 {
                    *l /= self.repetition_penalty;
                } else {
                    *l *= self.repetition_penalty;
                }
            }
        }
    }

    fn apply_presence_and_frequency_penalty(&self, logits: &mut [f32]) {
        if self.presence_penalty == 0.0 && self.frequency_penalty == 0.0 {
            return;
        }
        for (&token, &count) in self.counts.iter() {
            if let Some(l) = logits.get_mut(token as usize) {
                if self.presence_penalty != 0.0 {
                    *l -= self.presence_penalty as f32;
                }
                if self.frequency_penalty != 0.0 {
                    *l -= self.frequency_penalty as f32 * count as f32;
                }
            }
        }
    }

    fn apply_top_k(&self, logits: &mut [f32]) {
        if self.top_k == 0 || self.top_k >= logits.len() {
            return;
        }
        let mut sorted: Vec<f32> = logits.to_vec();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let threshold = sorted[self.top_k - 1];
        for l in logits.iter_mut() {
            if *l < threshold {
                *l = f32::NEG_INFINITY;
            }
        }
    }

    fn apply_min_p(&self, logits: &mut [f32]) {
        if self.min_p <= 0.0 {
            return;
        }
        let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if max_logit.is_infinite() {
            return;
        }
        let threshold = max_logit + (self.min_p as f32).ln();
        for l in logits.iter_mut() {
            if *l < threshold {
                *l = f32::NEG_INFINITY;
            }
        }
    }

    /// Samples a token from the (already-penalized/masked) logits, returning
    /// the token id and, if logprobs were requested, the record for it.
    pub fn sample(&mut self, logits: &[f32]) -> Result<(u32, Option<LogprobRecord>), AppError> {
        if logits.iter().all(|l| l.is_infinite() && *l < 0.0) {
            return Err(AppError::ModelError(
                "no candidate tokens survived logit masking".to_string(),
            ));
        }

        // §4.1: logprobs are computed "after processors (and with temperature
        // applied)" — on the same temperature-scaled distribution the sampler
        // draws from, not the raw logits. The argmax (temperature == 0) path
        // has no well-defined scaled distribution, so it falls back to the
        // unscaled one.
        let log_probs = if self.temperature > 0.0 {
            let scaled: Vec<f32> = logits.iter().map(|l| l / self.temperature as f32).collect();
            log_softmax(&scaled)
        } else {
            log_softmax(logits)
        };

        let token = if self.temperature <= 0.0 {
            argmax(logits)
        } else {
            let scaled: Vec<f32> = logits.iter().map(|l| l / self.temperature as f32).collect();
            let probs = softmax(&scaled);
            let probs = self.apply_nucleus(&probs);
            self.sample_categorical(&probs)
        };

        let record = if self.logprobs {
            Some(self.build_logprob_record(token, &log_probs))
        } else {
            None
        };

        Ok((token, record))
    }

    fn apply_nucleus(&self, probs: &[f32]) -> Vec<f32> {
        if self.top_p >= 1.0 {
            return probs.to_vec();
        }
        let mut indexed: Vec<(usize, f32)> = probs.iter().cloned().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut cumulative = 0.0f32;
        let mut cutoff = indexed.len();
        for (i, (_, p)) in indexed.iter().enumerate() {
            cumulative += p;
            if cumulative >= self.top_p as f32 {
                cutoff = i + 1;
                break;
            }
        }
        let keep: std::collections::HashSet<usize> =
            indexed[..cutoff].iter().map(|(idx, _)| *idx).collect();
        probs
            .iter()
            .enumerate()
            .map(|(i, &p)| if keep.contains(&i) { p } else { 0.0 })
            .collect()
    }

    fn sample_categorical(&mut self, probs: &[f32]) -> u32 {
        let total: f32 = probs.iter().sum();
        if total <= 0.0 {
            return argmax(probs);
        }
        let mut target = self.rng.gen::<f32>() * total;
        for (i, &p) in probs.iter().enumerate() {
            if target < p {
                return i as u32;
            }
            target -= p;
        }
        (probs.len() - 1) as u32
    }

    fn build_logprob_record(&self, token: u32, log_probs: &[f32]) -> LogprobRecord {
        let logprob = log_probs.get(token as usize).copied().unwrap_or(f32::NEG_INFINITY);
        let mut top = Vec::new();
        if self.top_logprobs > 0 {
            let mut indexed: Vec<(usize, f32)> = log_probs.iter().cloned().enumerate().collect();
            indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (idx, lp) in indexed.into_iter().take(self.top_logprobs) {
                top.push(TopLogprob {
                    token_id: idx as u32,
                    logprob: lp,
                });
            }
        }
        LogprobRecord {
            token_id: token,
            logprob,
            top,
        }
    }
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 {
        return vec![0.0; logits.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum_exp: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    let log_sum_exp = sum_exp.ln() + max;
    logits.iter().map(|l| l - log_sum_exp).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn params(seed: Option<u64>) -> GenerationParams {
        let cfg = ServerConfig::default();
        GenerationParams::merge(
            &cfg, None, Some(1.0), None, None, None, None, None, None, seed, vec![], true, Some(3),
        )
        .unwrap()
    }

    #[test]
    fn argmax_picks_the_highest_logit_at_zero_temperature() {
        let cfg = ServerConfig::default();
        let mut p = GenerationParams::merge(
            &cfg, None, Some(0.0), None, None, None, None, None, None, None, vec![], false, None,
        )
        .unwrap();
        p.temperature = 0.0;
        let mut pipeline = LogitPipeline::new(&p);
        let logits = vec![0.1, 5.0, -2.0, 0.4];
        let (token, _) = pipeline.sample(&logits).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn repetition_penalty_lowers_logit_of_seen_token() {
        let p = params(Some(42));
        let mut pipeline = LogitPipeline::new(&p);
        pipeline.observe(2);
        let mut logits = vec![1.0, 1.0, 1.0, 1.0];
        pipeline.apply(&mut logits);
        assert!(logits[2] < logits[0]);
    }

    #[test]
    fn top_k_masks_everything_outside_the_window() {
        let cfg = ServerConfig::default();
        let mut p = GenerationParams::merge(
            &cfg, None, Some(1.0), None, Some(2), None, None, None, None, None, vec![], false, None,
        )
        .unwrap();
        p.repetition_penalty = 1.0;
        let pipeline = LogitPipeline::new(&p);
        let mut logits = vec![3.0, 1.0, 2.0, 0.0];
        pipeline.apply(&mut logits);
        assert!(logits[0].is_finite());
        assert!(logits[2].is_finite());
        assert!(logits[1].is_infinite());
        assert!(logits[3].is_infinite());
    }

    #[test]
    fn seeded_sampling_is_deterministic() {
        let p = params(Some(7));
        let logits = vec![0.2, 0.3, 0.1, 5.0];
        let mut a = LogitPipeline::new(&p);
        let mut b = LogitPipeline::new(&p);
        let (ta, _) = a.sample(&logits).unwrap();
        let (tb, _) = b.sample(&logits).unwrap();
        assert_eq!(ta, tb);
    }

    #[test]
    fn logprob_record_includes_requested_top_k() {
        let p = params(Some(1));
        let mut pipeline = LogitPipeline::new(&p);
        let logits = vec![1.0, 2.0, 0.5, 3.0];
        let (_, record) = pipeline.sample(&logits).unwrap();
        let record = record.unwrap();
        assert_eq!(record.top.len(), 3);
        assert!(record.top[0].logprob >= record.top[1].logprob);
    }

    #[test]
    fn logprobs_reflect_the_temperature_scaled_distribution() {
        let cfg = ServerConfig::default();
        let logits = vec![1.0, 2.0, 0.5, 3.0];

        let mut p_unit = GenerationParams::merge(
            &cfg, None, Some(1.0), None, None, None, None, None, None, Some(1), vec![], true, Some(0),
        )
        .unwrap();
        p_unit.repetition_penalty = 1.0;
        let unit_logprob = LogitPipeline::new(&p_unit).sample(&logits).unwrap().1.unwrap().logprob;

        let mut p_cool = GenerationParams::merge(
            &cfg, None, Some(0.5), None, None, None, None, None, None, Some(1), vec![], true, Some(0),
        )
        .unwrap();
        p_cool.repetition_penalty = 1.0;
        let cool_logprob = LogitPipeline::new(&p_cool).sample(&logits).unwrap().1.unwrap().logprob;

        assert_ne!(unit_logprob, cool_logprob);
    }
}
