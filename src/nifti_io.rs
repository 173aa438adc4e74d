//! NIfTI I/O for displacement fields
//!
//! Registration pipelines exchange displacement fields as vector-valued
//! NIfTI volumes: 4D with the vector components on the fourth dimension
//! (nx x ny x nz x D), or 5D with a singleton fourth dimension
//! (nx x ny x nz x 1 x D), the common warp-field convention. Both layouts
//! are accepted on load; saving writes the 4D layout with the NIfTI vector
//! intent code. Gzip compression is auto-detected on load and chosen by
//! file extension on save.

use crate::field::DisplacementField;
use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiObject};
use std::io::Cursor;

/// NIFTI_INTENT_VECTOR: each voxel holds a vector along the last dimension.
const NIFTI_INTENT_VECTOR: i16 = 1007;

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Load a displacement field from NIfTI bytes (.nii or .nii.gz).
pub fn load_displacement_field(bytes: &[u8]) -> Result<DisplacementField, String> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        let decoder = GzDecoder::new(Cursor::new(bytes));
        InMemNiftiObject::from_reader(decoder)
            .map_err(|e| format!("Failed to read gzipped NIfTI: {}", e))?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| format!("Failed to read NIfTI: {}", e))?
    };

    let header = obj.header();
    let pixdim = header.pixdim;
    let (sx, sy, sz) = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| format!("Failed to convert NIfTI volume to ndarray: {}", e))?;
    let shape = array.shape().to_vec();

    // Vector components live on the last dimension: 4D directly, or 5D with
    // a singleton time axis between space and components.
    let (nx, ny, nz, ncomp, five_d) = match shape.as_slice() {
        [nx, ny, nz, nc] => (*nx, *ny, *nz, *nc, false),
        [nx, ny, nz, 1, nc] => (*nx, *ny, *nz, *nc, true),
        _ => {
            return Err(format!(
                "Expected a vector-valued volume (4D, or 5D with singleton dim 4), got shape {:?}",
                shape
            ))
        }
    };

    let mut field = match ncomp {
        3 => DisplacementField::new_3d(nx, ny, nz, sx, sy, sz),
        2 => {
            if nz != 1 {
                return Err(format!(
                    "2-component field must be planar, got {} slices",
                    nz
                ));
            }
            DisplacementField::new_2d(nx, ny, sx, sy)
        }
        _ => {
            return Err(format!(
                "Expected 2 or 3 vector components, got {}",
                ncomp
            ))
        }
    };

    // Extract each component plane in Fortran order (x varies fastest)
    for c in 0..ncomp {
        let plane = field.component_mut(c);
        let mut idx = 0;
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    plane[idx] = if five_d {
                        array[[i, j, k, 0, c]]
                    } else {
                        array[[i, j, k, c]]
                    };
                    idx += 1;
                }
            }
        }
    }

    Ok(field)
}

/// Read a displacement field from a .nii or .nii.gz file.
pub fn read_displacement_field(path: &std::path::Path) -> Result<DisplacementField, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e))?;
    load_displacement_field(&bytes)
}

/// Encode a displacement field as uncompressed NIfTI bytes.
///
/// Writes a 4D float32 volume with the vector intent code and a diagonal
/// spacing affine.
pub fn displacement_field_to_nifti(field: &DisplacementField) -> Result<Vec<u8>, String> {
    use std::io::Write;

    let [nx, ny, nz] = field.size();
    let [sx, sy, sz] = field.spacing();
    let ncomp = field.dim();

    // NIfTI-1 header (348 bytes)
    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]: 4D volume, components on dim 4
    let dim: [i16; 8] = [4, nx as i16, ny as i16, nz as i16, ncomp as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // intent_code = vector field
    header[68..70].copy_from_slice(&NIFTI_INTENT_VECTOR.to_le_bytes());

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, sx as f32, sy as f32, sz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4-byte extension flag)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0, scl_inter = 0.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 with a diagonal spacing affine
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    let srow_x: [f32; 4] = [sx as f32, 0.0, 0.0, 0.0];
    let srow_y: [f32; 4] = [0.0, sy as f32, 0.0, 0.0];
    let srow_z: [f32; 4] = [0.0, 0.0, sz as f32, 0.0];
    for (base, row) in [(280usize, srow_x), (296, srow_y), (312, srow_z)] {
        for (i, &v) in row.iter().enumerate() {
            let offset = base + i * 4;
            header[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    // magic = "n+1\0" for a single-file NIfTI-1
    header[344..348].copy_from_slice(b"n+1\0");

    let n = field.num_voxels();
    let mut buffer = Vec::with_capacity(352 + ncomp * n * 4);
    buffer
        .write_all(&header)
        .map_err(|e| format!("Write header failed: {}", e))?;
    buffer
        .write_all(&[0u8; 4])
        .map_err(|e| format!("Write extension failed: {}", e))?;

    // Component planes in Fortran order are exactly the 4D data layout
    // (x fastest, components slowest).
    for c in 0..ncomp {
        for &val in field.component(c) {
            buffer
                .write_all(&(val as f32).to_le_bytes())
                .map_err(|e| format!("Write data failed: {}", e))?;
        }
    }

    Ok(buffer)
}

/// Encode a displacement field as gzipped NIfTI bytes (.nii.gz).
pub fn displacement_field_to_nifti_gz(field: &DisplacementField) -> Result<Vec<u8>, String> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = displacement_field_to_nifti(field)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| format!("Gzip compression failed: {}", e))?;
    encoder
        .finish()
        .map_err(|e| format!("Gzip finish failed: {}", e))
}

/// Save a displacement field to a file.
///
/// A path ending in .nii.gz is gzip compressed, anything else is written as
/// uncompressed .nii.
pub fn save_displacement_field(
    path: &std::path::Path,
    field: &DisplacementField,
) -> Result<(), String> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        displacement_field_to_nifti_gz(field)?
    } else {
        displacement_field_to_nifti(field)?
    };

    std::fs::write(path, &bytes)
        .map_err(|e| format!("Failed to write file '{}': {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_field_3d() -> DisplacementField {
        let mut f = DisplacementField::new_3d(4, 3, 2, 1.0, 1.5, 2.0);
        for idx in 0..f.num_voxels() {
            f.set_vector(
                idx,
                [idx as f64 * 0.5, -(idx as f64) * 0.25, idx as f64 - 10.0],
            );
        }
        f
    }

    #[test]
    fn test_gzip_detection() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x00]));
        assert!(!is_gzip(&[0x00, 0x00, 0x00]));
        assert!(!is_gzip(&[0x1f])); // Too short
    }

    #[test]
    fn test_header_layout() {
        let field = sample_field_3d();
        let bytes = displacement_field_to_nifti(&field).unwrap();

        assert_eq!(bytes.len(), 352 + 3 * 24 * 4);
        assert_eq!(&bytes[344..348], b"n+1\0");

        let ndim = i16::from_le_bytes([bytes[40], bytes[41]]);
        assert_eq!(ndim, 4);
        let ncomp = i16::from_le_bytes([bytes[48], bytes[49]]);
        assert_eq!(ncomp, 3);

        let intent = i16::from_le_bytes([bytes[68], bytes[69]]);
        assert_eq!(intent, NIFTI_INTENT_VECTOR);

        let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);
        assert_eq!(datatype, 16);
    }

    #[test]
    fn test_roundtrip_3d() {
        let field = sample_field_3d();
        let bytes = displacement_field_to_nifti(&field).unwrap();
        let loaded = load_displacement_field(&bytes).unwrap();

        assert_eq!(loaded.dim(), 3);
        assert_eq!(loaded.size(), field.size());
        for a in 0..3 {
            assert!(
                (loaded.spacing()[a] - field.spacing()[a]).abs() < 1e-5,
                "spacing mismatch on axis {}",
                a
            );
        }
        // Data is stored as f32
        for c in 0..3 {
            for (i, (&got, &want)) in loaded
                .component(c)
                .iter()
                .zip(field.component(c).iter())
                .enumerate()
            {
                assert!(
                    (got - want).abs() < 1e-4,
                    "component {} voxel {}: expected {}, got {}",
                    c,
                    i,
                    want,
                    got
                );
            }
        }
    }

    #[test]
    fn test_roundtrip_2d() {
        let mut field = DisplacementField::new_2d(5, 4, 0.5, 0.5);
        for idx in 0..field.num_voxels() {
            field.set_vector(idx, [(idx % 3) as f64, -(idx as f64) * 0.125, 0.0]);
        }

        let bytes = displacement_field_to_nifti(&field).unwrap();
        let loaded = load_displacement_field(&bytes).unwrap();

        assert_eq!(loaded.dim(), 2);
        assert_eq!(loaded.size(), [5, 4, 1]);
        for c in 0..2 {
            for (got, want) in loaded.component(c).iter().zip(field.component(c).iter()) {
                assert!((got - want).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_roundtrip_gzip() {
        let field = sample_field_3d();
        let bytes = displacement_field_to_nifti_gz(&field).unwrap();
        assert!(is_gzip(&bytes), "gz encoder must produce gzip bytes");

        let loaded = load_displacement_field(&bytes).unwrap();
        assert_eq!(loaded.size(), field.size());
    }

    #[test]
    fn test_file_roundtrip() {
        let field = sample_field_3d();
        let tmp_path = std::env::temp_dir().join("varreg_field_roundtrip.nii.gz");

        save_displacement_field(&tmp_path, &field).unwrap();
        let raw = std::fs::read(&tmp_path).unwrap();
        assert!(is_gzip(&raw), ".nii.gz path should be compressed");

        let loaded = read_displacement_field(&tmp_path).unwrap();
        assert_eq!(loaded.dim(), 3);
        assert_eq!(loaded.size(), field.size());

        std::fs::remove_file(&tmp_path).ok();
    }

    #[test]
    fn test_load_invalid_bytes() {
        assert!(load_displacement_field(&[0u8; 16]).is_err());
        assert!(
            load_displacement_field(&[0x1f, 0x8b, 0x00, 0x00]).is_err(),
            "corrupt gzip should error"
        );
    }

    #[test]
    fn test_read_nonexistent_file() {
        let result =
            read_displacement_field(std::path::Path::new("/tmp/varreg_missing_98172.nii"));
        match result {
            Err(err) => assert!(err.contains("Failed to read file"), "got: {}", err),
            Ok(_) => panic!("reading a missing file must error"),
        }
    }
}
