//! Regularizer capability trait
//!
//! A registration loop only needs one capability from its regularization
//! stage: turn a raw displacement field into a smoothed one under the
//! current parameters. Keeping the seam this narrow lets pipelines swap in
//! other variants (e.g. a diffusive regularizer) without touching the loop.

use crate::elastic::ElasticRegularizer;
use crate::field::DisplacementField;

/// Smooths displacement fields; one implementation per regularization model.
pub trait Regularizer {
    /// Produce a smoothed copy of `field` with identical geometry.
    fn regularize(&mut self, field: &DisplacementField) -> Result<DisplacementField, String>;
}

impl Regularizer for ElasticRegularizer {
    fn regularize(&mut self, field: &DisplacementField) -> Result<DisplacementField, String> {
        ElasticRegularizer::regularize(self, field)
    }
}
