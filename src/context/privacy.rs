//! Differential-privacy noise for exposed behavioral aggregates.
//!
//! When enabled, frequency counts leaving the context manager get
//! Laplace noise calibrated to sensitivity 1 and the configured epsilon.
//! Stored raw history is never altered; only the exposed copy is noisy.

use std::collections::BTreeMap;

use rand::Rng;

use crate::config::PrivacyConfig;

/// Draw one sample from Laplace(0, scale) via inverse transform.
fn laplace_sample<R: Rng>(rng: &mut R, scale: f64) -> f64 {
    // u uniform in (-0.5, 0.5]; the sign of u picks the branch.
    let u: f64 = rng.gen::<f64>() - 0.5;
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}

/// Apply calibrated noise to a map of non-negative counts.
///
/// With privacy disabled the counts pass through untouched. Noised
/// values are rounded and clamped at zero so callers still see counts.
pub fn noisy_counts(
    counts: &BTreeMap<String, u64>,
    privacy: &PrivacyConfig,
) -> BTreeMap<String, u64> {
    if !privacy.enabled || privacy.epsilon <= 0.0 {
        return counts.clone();
    }

    let scale = 1.0 / privacy.epsilon;
    let mut rng = rand::thread_rng();
    counts
        .iter()
        .map(|(action, count)| {
            let noised = to_f64(*count) + laplace_sample(&mut rng, scale);
            (action.clone(), from_f64(noised.round().max(0.0)))
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(count: u64) -> f64 {
    count as f64
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn from_f64(value: f64) -> u64 {
    value as u64
}
