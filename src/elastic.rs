//! Elastic regularization of displacement fields
//!
//! Smooths a displacement field toward a physically plausible elastic
//! deformation by solving the linear-elasticity equation spectrally: each
//! vector component is transformed to the frequency domain, a small
//! symmetric system (one per frequency bin, coupling the components) is
//! solved in place, and the components are transformed back. Typical use is
//! one call per iteration of a variational registration loop, after each
//! force update.
//!
//! Transform plans, coefficient tables and working buffers are built on
//! first use and reused across calls; they are torn down and rebuilt when
//! the input geometry changes, and can be released explicitly with
//! [`ElasticRegularizer::free_data`]. The per-bin solves are independent, so
//! the half-spectrum index range is split into contiguous chunks executed on
//! a rayon pool.

use crate::fft::{SpectralShape, SpectralWorkspace};
use crate::field::DisplacementField;
use crate::kernel::ElasticKernel;
use num_complex::Complex64;
use rayon::prelude::*;

/// Spectral solver for the linear-elasticity smoothing step.
///
/// `lambda` weighs resistance against dilation/compression, `mu` against
/// shear. With both weights zero the regularizer is an exact no-op. The mean
/// (zero-frequency) displacement always passes through unchanged.
pub struct ElasticRegularizer {
    lambda: f64,
    mu: f64,
    threads: usize,
    state: Option<ElasticState>,
}

/// Per-geometry resources, rebuilt whenever the input geometry changes.
struct ElasticState {
    shape: SpectralShape,
    kernel: ElasticKernel,
    workspace: SpectralWorkspace,
    pool: Option<rayon::ThreadPool>,
    real: Vec<f64>,
    spectra: Vec<Vec<Complex64>>,
}

impl ElasticRegularizer {
    /// Create a regularizer with the given elasticity weights.
    pub fn new(lambda: f64, mu: f64) -> Self {
        Self {
            lambda,
            mu,
            threads: 0,
            state: None,
        }
    }

    /// Dilation/compression weight.
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Set the dilation/compression weight; read at the next call.
    pub fn set_lambda(&mut self, lambda: f64) {
        self.lambda = lambda;
    }

    /// Shear weight.
    pub fn mu(&self) -> f64 {
        self.mu
    }

    /// Set the shear weight; read at the next call.
    pub fn set_mu(&mut self, mu: f64) {
        self.mu = mu;
    }

    /// Worker count for the solve phase; 0 means the rayon default.
    pub fn thread_count(&self) -> usize {
        self.threads
    }

    /// Set the worker count. 0 uses the global rayon pool; any other value
    /// builds a dedicated pool on the next call. Cached resources are
    /// dropped so the pool is rebuilt.
    pub fn set_thread_count(&mut self, threads: usize) {
        if threads != self.threads {
            self.threads = threads;
            self.free_data();
        }
    }

    /// Smooth `field` and return the result as a new field of identical
    /// geometry. The input is not modified.
    pub fn regularize(&mut self, field: &DisplacementField) -> Result<DisplacementField, String> {
        let mut output = field.zeros_like();
        self.regularize_into(field, &mut output)?;
        Ok(output)
    }

    /// Smooth `input` into `output`, reusing `output`'s storage when its
    /// geometry already matches (it is reshaped otherwise).
    ///
    /// On error the output contents are unspecified and must not be
    /// consumed.
    pub fn regularize_into(
        &mut self,
        input: &DisplacementField,
        output: &mut DisplacementField,
    ) -> Result<(), String> {
        self.initialize(input)?;
        if !output.same_geometry(input) {
            *output = input.zeros_like();
        }

        let lambda = self.lambda;
        let mu = self.mu;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| "regularizer state missing after initialization".to_string())?;
        let ElasticState {
            shape,
            kernel,
            workspace,
            pool,
            real,
            spectra,
        } = state;
        let dim = shape.dim;

        // Forward transforms, one component at a time through the shared
        // real buffer.
        for c in 0..dim {
            real.copy_from_slice(input.component(c));
            workspace.forward(real, &mut spectra[c])?;
        }

        // Frequency-domain solve. Zero weights mean no smoothing at all, so
        // the spectra pass through untouched.
        if lambda != 0.0 || mu != 0.0 {
            let workers = pool
                .as_ref()
                .map(|p| p.current_num_threads())
                .unwrap_or_else(rayon::current_num_threads);
            let chunks = partition_spectra(spectra, workers);
            let shape: &SpectralShape = shape;
            let kernel: &ElasticKernel = kernel;
            let solve = move || {
                chunks
                    .into_par_iter()
                    .for_each(|chunk| solve_chunk(chunk, shape, kernel, lambda, mu));
            };
            match pool {
                Some(p) => p.install(solve),
                None => solve(),
            }
        }

        // Backward transforms; the write-back removes the transform gain.
        let scale = 1.0 / shape.n_voxels as f64;
        for c in 0..dim {
            workspace.backward(&mut spectra[c], real)?;
            let plane = output.component_mut(c);
            for (o, &v) in plane.iter_mut().zip(real.iter()) {
                *o = v * scale;
            }
        }

        Ok(())
    }

    /// Release all cached plans and buffers. Safe to call repeatedly; the
    /// next call rebuilds everything.
    pub fn free_data(&mut self) {
        self.state = None;
    }

    /// Build (or keep) the per-geometry resources for `field`.
    fn initialize(&mut self, field: &DisplacementField) -> Result<(), String> {
        if let Some(state) = &self.state {
            if state.shape.matches(field) {
                return Ok(());
            }
        }
        self.free_data();

        let shape = SpectralShape::from_field(field)?;
        let kernel = ElasticKernel::new(&shape);
        let workspace = SpectralWorkspace::new(shape.size[0], shape.size[1], shape.size[2])?;
        let pool = if self.threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.threads)
                .build()
                .map_err(|e| format!("failed to build solver thread pool: {}", e))?;
            Some(pool)
        } else {
            None
        };
        let real = vec![0.0; shape.n_voxels];
        let spectra = (0..shape.dim)
            .map(|_| vec![Complex64::default(); shape.n_complex])
            .collect();

        self.state = Some(ElasticState {
            shape,
            kernel,
            workspace,
            pool,
            real,
            spectra,
        });
        Ok(())
    }
}

/// One worker's share of the half spectrum: the same contiguous index range
/// of every component's buffer, plus the range's starting linear index.
struct SpectrumChunk<'a> {
    start: usize,
    components: Vec<&'a mut [Complex64]>,
}

/// Split every component buffer at identical boundaries into `parts`
/// contiguous chunks of near-equal size, the remainder going to the first
/// chunks. Chunks own disjoint ranges, so workers never touch the same bin.
fn partition_spectra(spectra: &mut [Vec<Complex64>], parts: usize) -> Vec<SpectrumChunk<'_>> {
    let total = spectra.first().map(|s| s.len()).unwrap_or(0);
    if total == 0 {
        return Vec::new();
    }
    let parts = parts.clamp(1, total);
    let base = total / parts;
    let rem = total % parts;

    let mut tails: Vec<&mut [Complex64]> =
        spectra.iter_mut().map(|s| s.as_mut_slice()).collect();
    let mut chunks = Vec::with_capacity(parts);
    let mut start = 0;
    for c in 0..parts {
        let len = base + usize::from(c < rem);
        let mut components = Vec::with_capacity(tails.len());
        for tail in tails.iter_mut() {
            let (head, rest) = std::mem::take(tail).split_at_mut(len);
            components.push(head);
            *tail = rest;
        }
        chunks.push(SpectrumChunk { start, components });
        start += len;
    }
    chunks
}

/// Solve the per-frequency elasticity system over one chunk, overwriting the
/// component spectra in place.
fn solve_chunk(
    chunk: SpectrumChunk<'_>,
    shape: &SpectralShape,
    kernel: &ElasticKernel,
    lambda: f64,
    mu: f64,
) {
    let dim = shape.dim;
    let coupling = lambda + mu;
    let mut components = chunk.components;
    let len = components.first().map(|c| c.len()).unwrap_or(0);

    for off in 0..len {
        let index = shape.decode(chunk.start + off);
        if index == [0, 0, 0] {
            // Pure translation has zero elastic energy; keep the mean
            // displacement.
            continue;
        }

        let mut trace = 0.0;
        for a in 0..dim {
            trace += kernel.lap(a, index[a]);
        }

        let mut matrix = [[0.0f64; 3]; 3];
        for i in 0..dim {
            for j in 0..dim {
                matrix[i][j] = if i == j {
                    mu * trace + coupling * kernel.lap(i, index[i])
                } else {
                    coupling * kernel.grad(i, index[i]) * kernel.grad(j, index[j])
                };
            }
        }

        // Real and imaginary parts share the real system matrix, so they are
        // carried as two simultaneous right-hand sides.
        let mut rhs = [[0.0f64; 3]; 2];
        for c in 0..dim {
            let v = components[c][off];
            rhs[0][c] = v.re;
            rhs[1][c] = v.im;
        }

        if !solve_in_place(dim, &mut matrix, &mut rhs) {
            // Rank-deficient bin (e.g. mu = 0 with an axis-aligned
            // frequency): same pass-through policy as the zero frequency.
            continue;
        }

        for c in 0..dim {
            components[c][off] = Complex64::new(rhs[0][c], rhs[1][c]);
        }
    }
}

/// Gaussian elimination with partial pivoting on the leading n-by-n block,
/// with two right-hand sides solved simultaneously. Returns false if a pivot
/// degenerates, leaving `b` unusable.
fn solve_in_place(n: usize, a: &mut [[f64; 3]; 3], b: &mut [[f64; 3]; 2]) -> bool {
    let mut scale = 0.0f64;
    for row in a.iter().take(n) {
        for &v in row.iter().take(n) {
            scale = scale.max(v.abs());
        }
    }
    if scale == 0.0 {
        return false;
    }
    let tol = scale * 1e-14;

    for col in 0..n {
        let mut pivot = col;
        for row in col + 1..n {
            if a[row][col].abs() > a[pivot][col].abs() {
                pivot = row;
            }
        }
        if a[pivot][col].abs() <= tol {
            return false;
        }
        if pivot != col {
            a.swap(pivot, col);
            b[0].swap(pivot, col);
            b[1].swap(pivot, col);
        }

        let inv = 1.0 / a[col][col];
        for row in col + 1..n {
            let factor = a[row][col] * inv;
            if factor == 0.0 {
                continue;
            }
            for j in col..n {
                a[row][j] -= factor * a[col][j];
            }
            b[0][row] -= factor * b[0][col];
            b[1][row] -= factor * b[1][col];
        }
    }

    for col in (0..n).rev() {
        let mut x_re = b[0][col];
        let mut x_im = b[1][col];
        for j in col + 1..n {
            x_re -= a[col][j] * b[0][j];
            x_im -= a[col][j] * b[1][j];
        }
        b[0][col] = x_re / a[col][col];
        b[1][col] = x_im / a[col][col];
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::DisplacementField;

    #[test]
    fn test_partition_remainder_goes_first() {
        let mut spectra = vec![vec![Complex64::default(); 10], vec![Complex64::default(); 10]];
        let chunks = partition_spectra(&mut spectra, 4);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.components[0].len()).collect();
        let starts: Vec<usize> = chunks.iter().map(|c| c.start).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
        assert_eq!(starts, vec![0, 3, 6, 8]);
        for chunk in &chunks {
            assert_eq!(chunk.components.len(), 2);
        }
    }

    #[test]
    fn test_partition_more_parts_than_bins() {
        let mut spectra = vec![vec![Complex64::default(); 3]];
        let chunks = partition_spectra(&mut spectra, 8);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.components[0].len() == 1));
    }

    #[test]
    fn test_solve_in_place_diagonal() {
        let mut a = [[6.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0; 3]];
        let mut b = [[12.0, 4.0, 0.0], [6.0, 1.0, 0.0]];
        assert!(solve_in_place(2, &mut a, &mut b));
        assert!((b[0][0] - 2.0).abs() < 1e-14);
        assert!((b[0][1] - 2.0).abs() < 1e-14);
        assert!((b[1][0] - 1.0).abs() < 1e-14);
        assert!((b[1][1] - 0.5).abs() < 1e-14);
    }

    #[test]
    fn test_solve_in_place_coupled() {
        // [[8, 2], [2, 8]] x = (8, 0) has solution (16/15, -4/15)
        let mut a = [[8.0, 2.0, 0.0], [2.0, 8.0, 0.0], [0.0; 3]];
        let mut b = [[8.0, 0.0, 0.0], [0.0; 3]];
        assert!(solve_in_place(2, &mut a, &mut b));
        assert!((b[0][0] - 16.0 / 15.0).abs() < 1e-14);
        assert!((b[0][1] + 4.0 / 15.0).abs() < 1e-14);
    }

    #[test]
    fn test_solve_in_place_needs_pivoting() {
        // Leading zero forces a row swap.
        let mut a = [[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0; 3]];
        let mut b = [[3.0, 5.0, 0.0], [0.0; 3]];
        assert!(solve_in_place(2, &mut a, &mut b));
        assert!((b[0][0] - 5.0).abs() < 1e-14);
        assert!((b[0][1] - 3.0).abs() < 1e-14);
    }

    #[test]
    fn test_solve_in_place_singular() {
        let mut a = [[0.0f64; 3]; 3];
        let mut b = [[1.0, 1.0, 1.0], [0.0; 3]];
        assert!(!solve_in_place(3, &mut a, &mut b));

        let mut a = [[2.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0; 3]];
        let mut b = [[1.0, 1.0, 0.0], [0.0; 3]];
        assert!(!solve_in_place(2, &mut a, &mut b));
    }

    #[test]
    fn test_chunked_solve_matches_single_chunk() {
        let field = {
            let mut f = DisplacementField::new_2d(8, 6, 1.0, 1.0);
            for idx in 0..f.num_voxels() {
                f.set_vector(idx, [(idx as f64 * 0.13).sin(), (idx as f64 * 0.29).cos(), 0.0]);
            }
            f
        };
        let shape = SpectralShape::from_field(&field).unwrap();
        let kernel = ElasticKernel::new(&shape);

        let make_spectra = || -> Vec<Vec<Complex64>> {
            (0..2)
                .map(|c| {
                    (0..shape.n_complex)
                        .map(|i| {
                            Complex64::new((i + c) as f64 * 0.1, (i * 2 + c) as f64 * 0.05 - 1.0)
                        })
                        .collect()
                })
                .collect()
        };

        let mut serial = make_spectra();
        for chunk in partition_spectra(&mut serial, 1) {
            solve_chunk(chunk, &shape, &kernel, 1.3, 0.7);
        }

        let mut chunked = make_spectra();
        partition_spectra(&mut chunked, 5)
            .into_par_iter()
            .for_each(|chunk| solve_chunk(chunk, &shape, &kernel, 1.3, 0.7));

        for c in 0..2 {
            for i in 0..shape.n_complex {
                assert_eq!(
                    serial[c][i], chunked[c][i],
                    "worker count must not change the result (component {}, bin {})",
                    c, i
                );
            }
        }
    }

    #[test]
    fn test_zero_frequency_passes_through() {
        let field = DisplacementField::new_2d(4, 4, 1.0, 1.0);
        let shape = SpectralShape::from_field(&field).unwrap();
        let kernel = ElasticKernel::new(&shape);

        let mut spectra = vec![vec![Complex64::default(); shape.n_complex]; 2];
        spectra[0][0] = Complex64::new(16.0, 0.0);
        spectra[1][0] = Complex64::new(-4.0, 0.0);

        for chunk in partition_spectra(&mut spectra, 3) {
            solve_chunk(chunk, &shape, &kernel, 1.0, 1.0);
        }
        assert_eq!(spectra[0][0], Complex64::new(16.0, 0.0));
        assert_eq!(spectra[1][0], Complex64::new(-4.0, 0.0));
    }

    #[test]
    fn test_degenerate_bin_passes_through() {
        // mu = 0 leaves the y-row of an x-aligned frequency without a pivot;
        // the bin must survive unchanged instead of turning into NaNs.
        let field = DisplacementField::new_2d(4, 4, 1.0, 1.0);
        let shape = SpectralShape::from_field(&field).unwrap();
        let kernel = ElasticKernel::new(&shape);

        let mut spectra = vec![vec![Complex64::default(); shape.n_complex]; 2];
        let bin = 1; // frequency (1, 0)
        spectra[0][bin] = Complex64::new(2.0, -1.0);
        spectra[1][bin] = Complex64::new(3.0, 0.5);

        for chunk in partition_spectra(&mut spectra, 1) {
            solve_chunk(chunk, &shape, &kernel, 2.0, 0.0);
        }
        assert_eq!(spectra[0][bin], Complex64::new(2.0, -1.0));
        assert_eq!(spectra[1][bin], Complex64::new(3.0, 0.5));
        assert!(spectra[0].iter().all(|v| v.re.is_finite() && v.im.is_finite()));
    }
}
