//! Probability shaping for next-token distributions.
//!
//! The filter pipeline runs in a fixed order: temperature scaling, softmax,
//! min-p cutoff, then nucleus (top-p) truncation. The output either sums to
//! one or is all zero; an all-zero distribution is the "no viable
//! continuation" signal, not an error.

use crate::config::SamplingOptions;
use std::cmp::Ordering;

/// Shape raw logits into a filtered probability distribution.
///
/// Returns a vector over the vocabulary summing to `1.0`, or to exactly
/// `0.0` when every entry was filtered out.
pub fn filter_logits(logits: &[f32], opts: &SamplingOptions) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }

    let scaled: Vec<f32> = if opts.temperature != 1.0 {
        logits.iter().map(|&l| l / opts.temperature).collect()
    } else {
        logits.to_vec()
    };

    // Softmax with the usual max-subtraction for stability.
    let max = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = scaled.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = probs.iter().sum();
    for p in &mut probs {
        *p /= sum;
    }

    if opts.min_p > 0.0 {
        for p in &mut probs {
            if *p < opts.min_p {
                *p = 0.0;
            }
        }
        let remaining: f32 = probs.iter().sum();
        if remaining > 0.0 {
            for p in &mut probs {
                *p /= remaining;
            }
        }
    }

    if opts.top_p < 1.0 {
        apply_top_p(&mut probs, opts.top_p);
    }

    probs
}

/// Nucleus truncation in place.
///
/// Tokens are kept in descending probability order until the cumulative mass
/// before a token exceeds `top_p`; the token that crosses the boundary is
/// kept, so at least the single most likely entry always survives.
fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));

    let mut cumulative = 0.0f32;
    let mut cut = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        if cumulative > top_p {
            cut = rank;
            break;
        }
        cumulative += probs[idx];
    }
    for &idx in &order[cut..] {
        probs[idx] = 0.0;
    }

    let remaining: f32 = probs.iter().sum();
    if remaining > 0.0 {
        for p in probs.iter_mut() {
            *p /= remaining;
        }
    }
}

/// The `min(k, nonzero)` highest-probability entries, descending.
///
/// Ties keep the lower vocabulary index first, so the result is
/// deterministic for a given distribution.
pub fn top_candidates(probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut nonzero: Vec<(u32, f32)> = probs
        .iter()
        .enumerate()
        .filter(|(_, &p)| p > 0.0)
        .map(|(i, &p)| (i as u32, p))
        .collect();
    nonzero.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    nonzero.truncate(k);
    nonzero
}

/// Index of the maximum entry; first wins on ties. `None` for empty input.
pub fn argmax(probs: &[f32]) -> Option<u32> {
    let mut best: Option<(u32, f32)> = None;
    for (i, &p) in probs.iter().enumerate() {
        match best {
            Some((_, bp)) if p <= bp => {}
            _ => best = Some((i as u32, p)),
        }
    }
    best.map(|(i, _)| i)
}
