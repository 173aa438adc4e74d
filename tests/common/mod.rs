//! Common test utilities for varreg-core integration tests

use varreg_core::field::DisplacementField;

/// Largest absolute difference between two slices
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y).abs())
        .fold(0.0f64, f64::max)
}

/// Largest absolute per-component difference between two fields
pub fn field_max_diff(a: &DisplacementField, b: &DisplacementField) -> f64 {
    assert!(a.same_geometry(b), "fields must share geometry");
    let mut max = 0.0f64;
    for c in 0..a.dim() {
        max = max.max(max_abs_diff(a.component(c), b.component(c)));
    }
    max
}

/// Assert two fields agree everywhere within `tol`
pub fn assert_fields_close(a: &DisplacementField, b: &DisplacementField, tol: f64, what: &str) {
    let diff = field_max_diff(a, b);
    assert!(
        diff <= tol,
        "{}: fields differ by {} (tolerance {})",
        what,
        diff,
        tol
    );
}
