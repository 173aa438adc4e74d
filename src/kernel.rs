//! Frequency-domain kernel of the linear-elasticity operator
//!
//! The Navier-Lamé operator mu*Δu + (lambda+mu)*∇(∇·u), discretized with
//! periodic finite differences, decouples in the frequency domain into one
//! small symmetric system per frequency bin. Its entries are built from two
//! per-axis eigenvalue tables precomputed here:
//!
//! - `lap[a][k]  = (2 - 2*cos(2π k / n_a)) / h_a²`, the eigenvalue of the
//!   second-difference stencil along axis a (non-negative),
//! - `grad[a][k] = sin(2π k / n_a) / h_a`, the eigenvalue magnitude of the
//!   central-difference stencil along axis a.
//!
//! Tables are a pure function of the grid geometry, are recomputed when the
//! geometry changes, and are only ever read during a solve, so all solver
//! workers share them without locking. Non-halved axes carry full-length
//! tables: upper-half frequency indices pick up their negative sine values
//! directly, which keeps the off-diagonal coupling terms correct for the
//! implicit conjugate bins.

use crate::fft::SpectralShape;
use std::f64::consts::PI;

/// Per-axis eigenvalue tables of the discrete elasticity operator.
pub struct ElasticKernel {
    lap: [Vec<f64>; 3],
    grad: [Vec<f64>; 3],
}

impl ElasticKernel {
    /// Precompute the tables for a fixed spectral geometry.
    pub fn new(shape: &SpectralShape) -> Self {
        let mut lap: [Vec<f64>; 3] = Default::default();
        let mut grad: [Vec<f64>; 3] = Default::default();

        for a in 0..3 {
            let n = shape.size[a] as f64;
            let h = shape.spacing[a];
            let bins = shape.complex_size[a];
            lap[a] = Vec::with_capacity(bins);
            grad[a] = Vec::with_capacity(bins);
            for k in 0..bins {
                let theta = 2.0 * PI * k as f64 / n;
                lap[a].push((2.0 - 2.0 * theta.cos()) / (h * h));
                grad[a].push(theta.sin() / h);
            }
        }

        Self { lap, grad }
    }

    /// Second-difference eigenvalue along `axis` at frequency index `k`.
    #[inline]
    pub fn lap(&self, axis: usize, k: usize) -> f64 {
        self.lap[axis][k]
    }

    /// Central-difference eigenvalue along `axis` at frequency index `k`.
    #[inline]
    pub fn grad(&self, axis: usize, k: usize) -> f64 {
        self.grad[axis][k]
    }
}
