//! Multi-stage token selection: repetition penalty, temperature, softmax,
//! nucleus cutoff, renormalized draw.

use std::collections::HashSet;

use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::error::EngineError;

const TEMPERATURE_FLOOR: f64 = 1e-6;

/// Knobs applied at every sampling step.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f64,
    /// Cumulative probability threshold for the nucleus. The arg-max id is always
    /// kept, so any value in `(0, 1]` yields a nonempty candidate set.
    pub top_p: f64,
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            repetition_penalty: 1.1,
        }
    }
}

/// Create a deterministic RNG when a seed is provided.
pub fn init_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => StdRng::from_entropy(),
    }
}

/// Select the next token id from raw logits and the generated-id history.
pub fn sample_token(
    logits: &[f32],
    history: &[i64],
    params: &SamplingParams,
    rng: &mut StdRng,
) -> Result<i64> {
    if logits.is_empty() {
        return Err(EngineError::Sampling("logits vector is empty".into()).into());
    }

    let mut scores: Vec<f64> = logits.iter().map(|&v| v as f64).collect();
    apply_repetition_penalty(&mut scores, history, params.repetition_penalty);

    let temperature = params.temperature.max(TEMPERATURE_FLOOR);
    for score in &mut scores {
        *score /= temperature;
    }

    let probs = softmax(&scores)?;
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let keep = nucleus_cutoff(&probs, &order, params.top_p);

    let kept_mass: f64 = order[..keep].iter().map(|&idx| probs[idx]).sum();
    let mut remainder = rng.gen::<f64>() * kept_mass;
    for &idx in &order[..keep] {
        remainder -= probs[idx];
        if remainder <= 0.0 {
            return Ok(idx as i64);
        }
    }
    // Floating-point error kept the remainder positive; fall back to the last
    // candidate rather than failing the step.
    Ok(order[keep - 1] as i64)
}

/// Discourage ids already present in the history: positive logits are divided by
/// the penalty, non-positive logits multiplied. Applied once per distinct id.
fn apply_repetition_penalty(scores: &mut [f64], history: &[i64], penalty: f32) {
    if (penalty - 1.0).abs() <= f32::EPSILON {
        return;
    }
    let penalty = penalty as f64;
    let mut seen = HashSet::new();
    for &token in history {
        let Ok(index) = usize::try_from(token) else {
            continue;
        };
        if index < scores.len() && seen.insert(index) {
            let entry = &mut scores[index];
            if *entry > 0.0 {
                *entry /= penalty;
            } else {
                *entry *= penalty;
            }
        }
    }
}

/// Max-subtracted softmax. A distribution with no finite mass left after
/// exponentiation signals numerical overflow upstream and is reported instead of
/// silently collapsing to id 0.
fn softmax(scores: &[f64]) -> Result<Vec<f64>> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Err(EngineError::Sampling("logits contain no finite values".into()).into());
    }
    let mut probs: Vec<f64> = scores.iter().map(|&score| (score - max).exp()).collect();
    let total: f64 = probs.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(EngineError::Sampling(format!(
            "probability mass degenerated after exponentiation (total={total})"
        ))
        .into());
    }
    for prob in &mut probs {
        *prob /= total;
    }
    Ok(probs)
}

/// Number of ids to keep from `order` (descending probability): the shortest
/// prefix whose cumulative probability reaches `top_p`, never fewer than one.
fn nucleus_cutoff(probs: &[f64], order: &[usize], top_p: f64) -> usize {
    let mut cumulative = 0.0;
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative >= top_p {
            return rank + 1;
        }
    }
    order.len()
}
