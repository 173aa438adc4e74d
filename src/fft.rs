//! Half-spectrum FFT resources for real-valued volumes
//!
//! Provides the real-to-complex / complex-to-real transform chain used by the
//! frequency-domain solvers, with plans and scratch buffers cached for reuse.
//! Volumes are flat `f64` slices in Fortran (column-major) order
//! (index = x + y*nx + z*nx*ny).
//!
//! The transforms use the conjugate-symmetric half-spectrum convention of a
//! real-input FFT: the x axis (fastest varying) is halved to `nx/2 + 1`
//! complex bins, the remaining axes keep their full extent. A complex bin
//! (ix, iy, iz) lives at linear index `ix + iy*cx + iz*cx*ny` with
//! `cx = nx/2 + 1`. Both directions are unnormalized; a forward+backward
//! round trip gains a factor of `nx*ny*nz` which the caller removes.

use num_complex::Complex64;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftDirection, FftPlanner};
use std::sync::Arc;

/// Cached geometry of a field and of its half-spectrum representation.
///
/// Recomputed whenever the input geometry changes; read-only afterwards and
/// safely shared by concurrent solver workers.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralShape {
    /// Spatial dimensionality, 2 or 3.
    pub dim: usize,
    /// Grid extent per axis (unused axes = 1).
    pub size: [usize; 3],
    /// Physical spacing per axis.
    pub spacing: [f64; 3],
    /// Total voxel count.
    pub n_voxels: usize,
    /// Complex extent per axis: `[nx/2 + 1, ny, nz]`.
    pub complex_size: [usize; 3],
    /// Total half-spectrum element count.
    pub n_complex: usize,
    /// Strides of the complex layout, for linear index decoding.
    pub complex_strides: [usize; 3],
}

impl SpectralShape {
    /// Derive the spectral geometry from a field's grid.
    pub fn from_field(field: &crate::field::DisplacementField) -> Result<Self, String> {
        let dim = field.dim();
        let size = field.size();
        let spacing = field.spacing();

        for a in 0..dim {
            if size[a] == 0 {
                return Err(format!("field extent along axis {} is zero", a));
            }
            if !(spacing[a] > 0.0) {
                return Err(format!(
                    "field spacing along axis {} must be positive, got {}",
                    a, spacing[a]
                ));
            }
        }

        let complex_size = [size[0] / 2 + 1, size[1], size[2]];
        let complex_strides = [1, complex_size[0], complex_size[0] * complex_size[1]];

        Ok(Self {
            dim,
            size,
            spacing,
            n_voxels: size[0] * size[1] * size[2],
            complex_size,
            n_complex: complex_size[0] * complex_size[1] * complex_size[2],
            complex_strides,
        })
    }

    /// Decode a linear half-spectrum index into a per-axis frequency index.
    #[inline]
    pub fn decode(&self, offset: usize) -> [usize; 3] {
        let mut rem = offset;
        let mut index = [0usize; 3];
        for a in (0..3).rev() {
            index[a] = rem / self.complex_strides[a];
            rem %= self.complex_strides[a];
        }
        index
    }

    /// True if the cached geometry still matches `field`.
    pub fn matches(&self, field: &crate::field::DisplacementField) -> bool {
        self.dim == field.dim() && self.size == field.size() && self.spacing == field.spacing()
    }
}

/// FFT workspace holding one forward/backward plan per axis plus scratch
/// buffers, all sized at construction for a fixed grid.
///
/// The x axis uses real-to-complex / complex-to-real plans; y and z use
/// complex plans executed line by line with gather/scatter staging buffers.
pub struct SpectralWorkspace {
    nx: usize,
    ny: usize,
    nz: usize,
    cx: usize,
    n_real: usize,
    n_complex: usize,
    // Plans along x (halved axis)
    r2c: Arc<dyn RealToComplex<f64>>,
    c2r: Arc<dyn ComplexToReal<f64>>,
    // Plans along the full axes
    fft_y: Arc<dyn Fft<f64>>,
    ifft_y: Arc<dyn Fft<f64>>,
    fft_z: Arc<dyn Fft<f64>>,
    ifft_z: Arc<dyn Fft<f64>>,
    // Scratch buffers
    scratch_x: Vec<Complex64>,
    scratch_y: Vec<Complex64>,
    scratch_z: Vec<Complex64>,
    buffer_y: Vec<Complex64>,
    buffer_z: Vec<Complex64>,
}

impl SpectralWorkspace {
    /// Build all plans and working buffers for an `nx * ny * nz` grid.
    pub fn new(nx: usize, ny: usize, nz: usize) -> Result<Self, String> {
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(format!(
                "cannot build transform plans for empty grid {}x{}x{}",
                nx, ny, nz
            ));
        }

        let mut real_planner = RealFftPlanner::<f64>::new();
        let r2c = real_planner.plan_fft_forward(nx);
        let c2r = real_planner.plan_fft_inverse(nx);

        let mut planner = FftPlanner::<f64>::new();
        let fft_y = planner.plan_fft(ny, FftDirection::Forward);
        let ifft_y = planner.plan_fft(ny, FftDirection::Inverse);
        let fft_z = planner.plan_fft(nz, FftDirection::Forward);
        let ifft_z = planner.plan_fft(nz, FftDirection::Inverse);

        let cx = nx / 2 + 1;
        let scratch_x =
            vec![Complex64::default(); r2c.get_scratch_len().max(c2r.get_scratch_len())];
        let scratch_y =
            vec![
                Complex64::default();
                fft_y.get_inplace_scratch_len().max(ifft_y.get_inplace_scratch_len())
            ];
        let scratch_z =
            vec![
                Complex64::default();
                fft_z.get_inplace_scratch_len().max(ifft_z.get_inplace_scratch_len())
            ];

        Ok(Self {
            nx,
            ny,
            nz,
            cx,
            n_real: nx * ny * nz,
            n_complex: cx * ny * nz,
            r2c,
            c2r,
            fft_y,
            ifft_y,
            fft_z,
            ifft_z,
            scratch_x,
            scratch_y,
            scratch_z,
            buffer_y: vec![Complex64::default(); ny],
            buffer_z: vec![Complex64::default(); nz],
        })
    }

    /// Number of real samples per transform.
    #[inline]
    pub fn real_len(&self) -> usize {
        self.n_real
    }

    /// Number of half-spectrum bins per transform.
    #[inline]
    pub fn complex_len(&self) -> usize {
        self.n_complex
    }

    /// Forward transform: real volume -> half spectrum (unnormalized).
    ///
    /// `real` is consumed as scratch and left in an unspecified state.
    pub fn forward(&mut self, real: &mut [f64], spectrum: &mut [Complex64]) -> Result<(), String> {
        self.check_lengths(real.len(), spectrum.len())?;
        let (nx, ny, nz, cx) = (self.nx, self.ny, self.nz, self.cx);

        // Real-to-complex along x, one contiguous line per (y, z)
        for k in 0..nz {
            for j in 0..ny {
                let r0 = (j + k * ny) * nx;
                let c0 = (j + k * ny) * cx;
                self.r2c
                    .process_with_scratch(
                        &mut real[r0..r0 + nx],
                        &mut spectrum[c0..c0 + cx],
                        &mut self.scratch_x,
                    )
                    .map_err(|e| format!("forward transform failed along x: {}", e))?;
            }
        }

        // Transform along y (stride cx)
        if ny > 1 {
            for k in 0..nz {
                for i in 0..cx {
                    for j in 0..ny {
                        self.buffer_y[j] = spectrum[i + j * cx + k * cx * ny];
                    }
                    self.fft_y
                        .process_with_scratch(&mut self.buffer_y, &mut self.scratch_y);
                    for j in 0..ny {
                        spectrum[i + j * cx + k * cx * ny] = self.buffer_y[j];
                    }
                }
            }
        }

        // Transform along z (stride cx*ny)
        if nz > 1 {
            for j in 0..ny {
                for i in 0..cx {
                    for k in 0..nz {
                        self.buffer_z[k] = spectrum[i + j * cx + k * cx * ny];
                    }
                    self.fft_z
                        .process_with_scratch(&mut self.buffer_z, &mut self.scratch_z);
                    for k in 0..nz {
                        spectrum[i + j * cx + k * cx * ny] = self.buffer_z[k];
                    }
                }
            }
        }

        Ok(())
    }

    /// Backward transform: half spectrum -> real volume (unnormalized).
    ///
    /// `spectrum` is consumed as scratch and left in an unspecified state.
    /// The caller divides the result by `nx*ny*nz` to undo the transform
    /// convention.
    pub fn backward(&mut self, spectrum: &mut [Complex64], real: &mut [f64]) -> Result<(), String> {
        self.check_lengths(real.len(), spectrum.len())?;
        let (nx, ny, nz, cx) = (self.nx, self.ny, self.nz, self.cx);

        // Inverse transform along z
        if nz > 1 {
            for j in 0..ny {
                for i in 0..cx {
                    for k in 0..nz {
                        self.buffer_z[k] = spectrum[i + j * cx + k * cx * ny];
                    }
                    self.ifft_z
                        .process_with_scratch(&mut self.buffer_z, &mut self.scratch_z);
                    for k in 0..nz {
                        spectrum[i + j * cx + k * cx * ny] = self.buffer_z[k];
                    }
                }
            }
        }

        // Inverse transform along y
        if ny > 1 {
            for k in 0..nz {
                for i in 0..cx {
                    for j in 0..ny {
                        self.buffer_y[j] = spectrum[i + j * cx + k * cx * ny];
                    }
                    self.ifft_y
                        .process_with_scratch(&mut self.buffer_y, &mut self.scratch_y);
                    for j in 0..ny {
                        spectrum[i + j * cx + k * cx * ny] = self.buffer_y[j];
                    }
                }
            }
        }

        // Complex-to-real along x
        for k in 0..nz {
            for j in 0..ny {
                let r0 = (j + k * ny) * nx;
                let c0 = (j + k * ny) * cx;
                let line = &mut spectrum[c0..c0 + cx];
                // Conjugate symmetry requires the DC bin (and, for even nx,
                // the Nyquist bin) to be purely real; rounding residue from
                // the y/z passes must not reach the c2r input check.
                line[0].im = 0.0;
                if nx % 2 == 0 {
                    line[cx - 1].im = 0.0;
                }
                self.c2r
                    .process_with_scratch(line, &mut real[r0..r0 + nx], &mut self.scratch_x)
                    .map_err(|e| format!("backward transform failed along x: {}", e))?;
            }
        }

        Ok(())
    }

    fn check_lengths(&self, real_len: usize, complex_len: usize) -> Result<(), String> {
        if real_len != self.n_real {
            return Err(format!(
                "real buffer has {} samples, plan expects {}",
                real_len, self.n_real
            ));
        }
        if complex_len != self.n_complex {
            return Err(format!(
                "complex buffer has {} bins, plan expects {}",
                complex_len, self.n_complex
            ));
        }
        Ok(())
    }
}
