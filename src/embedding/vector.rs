//! Vector validation and normalisation primitives.
//!
//! All stored embeddings are unit vectors; similarity is the inner product.
//! Upstream engines are only trusted within a tolerance: a returned vector
//! must have the configured dimension and a norm in `[0.99, 1.01]`, after
//! which it is re-normalised to `1 ± 1e-6`.

use crate::errors::ServiceError;

/// Norm magnitudes below this are treated as zero vectors.
pub const EPSILON: f32 = 1e-10;

/// Accepted norm band for vectors returned by an embedding engine.
pub const NORM_MIN: f32 = 0.99;
/// Upper bound of the accepted norm band.
pub const NORM_MAX: f32 = 1.01;

/// Euclidean norm.
#[must_use]
pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Inner product of two equal-length vectors.
#[must_use]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Validate a vector fresh from an embedding engine.
///
/// Rejects wrong dimension, non-finite components, and norms outside the
/// accepted band. Failures are permanent — the upstream produced a vector
/// that no retry will fix.
pub fn validate(vector: &[f32], dimension: usize) -> Result<(), ServiceError> {
    if vector.len() != dimension {
        return Err(ServiceError::PermanentUpstream {
            stage: "embedding",
            message: format!(
                "expected dimension {dimension}, got {}",
                vector.len()
            ),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(ServiceError::PermanentUpstream {
            stage: "embedding",
            message: "vector contains non-finite components".into(),
        });
    }
    let norm = l2_norm(vector);
    if !(NORM_MIN..=NORM_MAX).contains(&norm) {
        return Err(ServiceError::PermanentUpstream {
            stage: "embedding",
            message: format!("vector norm {norm} outside [{NORM_MIN}, {NORM_MAX}]"),
        });
    }
    Ok(())
}

/// Scale a vector to unit length in place.
///
/// Errors on near-zero magnitude rather than emitting NaNs.
pub fn normalize(vector: &mut [f32]) -> Result<(), ServiceError> {
    let norm = l2_norm(vector);
    if norm < EPSILON {
        return Err(ServiceError::PermanentUpstream {
            stage: "embedding",
            message: "cannot normalise a zero-magnitude vector".into(),
        });
    }
    for v in vector.iter_mut() {
        *v /= norm;
    }
    Ok(())
}

/// Validate against the expected dimension and return the unit-normalised
/// vector.
pub fn validate_and_normalize(
    mut vector: Vec<f32>,
    dimension: usize,
) -> Result<Vec<f32>, ServiceError> {
    validate(&vector, dimension)?;
    normalize(&mut vector)?;
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unit(dimension: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimension];
        v[0] = 1.0;
        v
    }

    #[test]
    fn rejects_wrong_dimension() {
        let err = validate(&unit(1535), 1536).unwrap_err();
        assert_eq!(err.kind(), "permanent_upstream");
    }

    #[test]
    fn rejects_out_of_band_norm() {
        let mut v = unit(8);
        v[0] = 1.5;
        assert!(validate(&v, 8).is_err());
        v[0] = 0.5;
        assert!(validate(&v, 8).is_err());
        v[0] = 1.005;
        assert!(validate(&v, 8).is_ok());
    }

    #[test]
    fn rejects_zero_vector() {
        let mut v = vec![0.0_f32; 4];
        assert!(normalize(&mut v).is_err());
    }

    #[test]
    fn normalized_norm_is_tight() {
        let mut v = vec![0.3_f32, -0.4, 0.5, 0.7];
        normalize(&mut v).unwrap();
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    proptest! {
        // normalize(normalize(v)) == normalize(v) within 1e-6
        #[test]
        fn normalization_is_idempotent(
            raw in proptest::collection::vec(-100.0_f32..100.0, 16)
        ) {
            prop_assume!(l2_norm(&raw) > 1e-3);
            let mut once = raw.clone();
            normalize(&mut once).unwrap();
            let mut twice = once.clone();
            normalize(&mut twice).unwrap();
            for (a, b) in once.iter().zip(&twice) {
                prop_assert!((a - b).abs() < 1e-6);
            }
        }

        #[test]
        fn inner_product_of_unit_vectors_bounded(
            a in proptest::collection::vec(-10.0_f32..10.0, 16),
            b in proptest::collection::vec(-10.0_f32..10.0, 16),
        ) {
            prop_assume!(l2_norm(&a) > 1e-3 && l2_norm(&b) > 1e-3);
            let mut a = a;
            let mut b = b;
            normalize(&mut a).unwrap();
            normalize(&mut b).unwrap();
            let score = inner_product(&a, &b);
            prop_assert!((-1.0 - 1e-4..=1.0 + 1e-4).contains(&score));
        }
    }
}
