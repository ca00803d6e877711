//! Deterministic down-sampling of one series for display.
//!
//! Both strategies pick samples purely by position and value, so the same
//! input always yields the same output.

use std::sync::Arc;

use crate::config::Decimation;
use crate::store::StoredSample;

/// Reduce `samples` to at most `budget` entries, preserving order.
pub fn decimate(
    samples: Vec<Arc<StoredSample>>,
    budget: usize,
    strategy: Decimation,
) -> Vec<Arc<StoredSample>> {
    if budget == 0 || samples.len() <= budget {
        return samples;
    }
    match strategy {
        Decimation::Stride => stride(samples, budget),
        Decimation::MinMax if budget >= 2 => min_max(samples, budget),
        Decimation::MinMax => stride(samples, budget),
    }
}

fn stride(samples: Vec<Arc<StoredSample>>, budget: usize) -> Vec<Arc<StoredSample>> {
    let step = samples.len().div_ceil(budget);
    samples.into_iter().step_by(step).collect()
}

/// Keep the minimum and maximum of each bucket, ranked by the sample's first
/// field. Peaks survive where a stride would skip them.
fn min_max(samples: Vec<Arc<StoredSample>>, budget: usize) -> Vec<Arc<StoredSample>> {
    let buckets = budget / 2;
    let size = samples.len().div_ceil(buckets);
    let mut out = Vec::with_capacity(buckets * 2);

    for chunk in samples.chunks(size) {
        let mut lo = 0;
        let mut hi = 0;
        for (i, s) in chunk.iter().enumerate() {
            let v = rank(s);
            if v < rank(&chunk[lo]) {
                lo = i;
            }
            if v > rank(&chunk[hi]) {
                hi = i;
            }
        }
        let (first, second) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        out.push(Arc::clone(&chunk[first]));
        if second != first {
            out.push(Arc::clone(&chunk[second]));
        }
    }
    out
}

fn rank(s: &StoredSample) -> f64 {
    s.sample.fields.values().next().copied().unwrap_or(0.0)
}
