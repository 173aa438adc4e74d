//! Elastic smoothing of a displacement field stored as NIfTI
//!
//! Usage: cargo run --release --example regularize_nifti -- <input.nii[.gz]> <output.nii[.gz]> [lambda] [mu]

use std::path::Path;
use std::time::Instant;

use varreg_core::elastic::ElasticRegularizer;
use varreg_core::nifti_io::{read_displacement_field, save_displacement_field};

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        return Err(format!(
            "Usage: {} <input.nii[.gz]> <output.nii[.gz]> [lambda] [mu]",
            args[0]
        ));
    }
    let input_path = Path::new(&args[1]);
    let output_path = Path::new(&args[2]);
    let lambda: f64 = args
        .get(3)
        .map(|s| s.parse().map_err(|e| format!("Invalid lambda '{}': {}", s, e)))
        .transpose()?
        .unwrap_or(1.0);
    let mu: f64 = args
        .get(4)
        .map(|s| s.parse().map_err(|e| format!("Invalid mu '{}': {}", s, e)))
        .transpose()?
        .unwrap_or(1.0);

    println!("[INFO] Loading displacement field...");
    let start = Instant::now();
    let field = read_displacement_field(input_path)?;
    let [nx, ny, nz] = field.size();
    let [sx, sy, sz] = field.spacing();
    println!("[INFO] Loaded in {:.2?}", start.elapsed());
    println!(
        "[INFO] Field: {}x{}x{} ({}D), spacing {:.2}x{:.2}x{:.2}",
        nx,
        ny,
        nz,
        field.dim(),
        sx,
        sy,
        sz
    );
    println!("[INFO] Weights: lambda={}, mu={}", lambda, mu);

    println!("[INFO] Regularizing...");
    let start = Instant::now();
    let mut regularizer = ElasticRegularizer::new(lambda, mu);
    let smoothed = regularizer.regularize(&field)?;
    println!("[INFO] Regularized in {:.2?}", start.elapsed());

    let mean_in = field.mean_vector();
    let mean_out = smoothed.mean_vector();
    println!(
        "[INFO] Mean displacement: ({:.4}, {:.4}, {:.4}) -> ({:.4}, {:.4}, {:.4})",
        mean_in[0], mean_in[1], mean_in[2], mean_out[0], mean_out[1], mean_out[2]
    );

    println!("[INFO] Saving result...");
    let start = Instant::now();
    save_displacement_field(output_path, &smoothed)?;
    println!("[INFO] Saved to {} in {:.2?}", output_path.display(), start.elapsed());

    Ok(())
}
