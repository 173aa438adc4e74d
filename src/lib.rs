//! VarReg-Core: spectral regularization for variational image registration
//!
//! This crate smooths vector-valued displacement fields by solving the
//! linear-elasticity equation in the frequency domain, one decoupled small
//! system per frequency bin.
//!
//! # Modules
//! - `field`: displacement fields on uniform 2D/3D grids
//! - `fft`: half-spectrum FFT plans, buffers and layout bookkeeping
//! - `kernel`: precomputed per-frequency elasticity operator coefficients
//! - `elastic`: the elastic regularizer (solve + parallel work splitting)
//! - `regularizer`: the capability trait registration pipelines consume
//! - `nifti_io`: displacement-field NIfTI I/O

// Core modules
pub mod elastic;
pub mod fft;
pub mod field;
pub mod kernel;
pub mod regularizer;

// I/O modules
pub mod nifti_io;
