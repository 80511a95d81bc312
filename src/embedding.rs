//! Running appearance-embedding aggregation.

use nalgebra::DVector;

use crate::config::EmbeddingMode;

fn l2_normalize(v: &DVector<f64>) -> DVector<f64> {
    let norm = v.norm();
    if norm > 0.0 { v / norm } else { v.clone() }
}

/// Folds a new observation into a track's running embedding.
///
/// `Last` simply replaces the previous embedding (re-normalized). `Ema` blends the
/// previous embedding and the new one with `alpha` weight on the previous value, then
/// re-normalizes so the result stays a unit vector regardless of how skewed the blend is.
pub fn update_embedding(
    previous: Option<&DVector<f64>>,
    new: &DVector<f64>,
    mode: EmbeddingMode,
    ema_alpha: f64,
) -> DVector<f64> {
    let normalized_new = l2_normalize(new);
    match (previous, mode) {
        (Some(prev), EmbeddingMode::Ema) => {
            let blended = prev * ema_alpha + &normalized_new * (1.0 - ema_alpha);
            l2_normalize(&blended)
        }
        _ => normalized_new,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_last_mode_replaces_with_normalized_new() {
        let prev = DVector::from_vec(vec![1.0, 0.0]);
        let new = DVector::from_vec(vec![0.0, 3.0]);
        let result = update_embedding(Some(&prev), &new, EmbeddingMode::Last, 0.9);
        assert_relative_eq!(result[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(result[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ema_mode_blends_and_renormalizes() {
        let prev = DVector::from_vec(vec![1.0, 0.0]);
        let new = DVector::from_vec(vec![1.0, 0.0]);
        let result = update_embedding(Some(&prev), &new, EmbeddingMode::Ema, 0.9);
        assert_relative_eq!(result.norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(result[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_no_previous_embedding_just_normalizes() {
        let new = DVector::from_vec(vec![0.0, 5.0]);
        let result = update_embedding(None, &new, EmbeddingMode::Ema, 0.9);
        assert_relative_eq!(result.norm(), 1.0, epsilon = 1e-9);
    }
}
