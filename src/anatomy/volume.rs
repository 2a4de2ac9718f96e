//! MGH/MGZ volumes (FreeSurfer) and a minimal NIfTI-1 export.
//!
//! MGH header (big-endian, data at byte 284):
//! ```text
//!   0  4  version      i32 (1)
//!   4 12  width, height, depth  i32
//!  16  4  n_frames     i32
//!  20  4  type         i32 (0 uchar, 1 int, 3 float, 4 short)
//!  24  4  dof          i32
//!  28  2  good_ras     i16
//!  30 12  voxel size   3 × f32
//!  42 36  Mdc          9 × f32 (direction cosines, column-major)
//!  78 12  c_ras        3 × f32
//! ```
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;

const MGH_DATA_OFFSET: usize = 284;

/// Scalar volume with its voxel→RAS geometry.
#[derive(Debug, Clone)]
pub struct Volume {
    pub dims: [usize; 3],
    pub voxel_size: [f64; 3],
    /// Direction cosines, columns are the voxel axes in RAS.
    pub mdc: [[f64; 3]; 3],
    /// RAS coordinate of the volume centre.
    pub c_ras: [f64; 3],
    /// Voxel values, x fastest.
    pub data: Vec<f32>,
}

impl Volume {
    pub fn value(&self, i: usize, j: usize, k: usize) -> f32 {
        self.data[i + self.dims[0] * (j + self.dims[1] * k)]
    }

    /// Voxel indices → RAS millimetres (centre-anchored, as FreeSurfer does).
    pub fn vox2ras(&self, i: usize, j: usize, k: usize) -> [f64; 3] {
        let v = [
            (i as f64 - self.dims[0] as f64 / 2.0) * self.voxel_size[0],
            (j as f64 - self.dims[1] as f64 / 2.0) * self.voxel_size[1],
            (k as f64 - self.dims[2] as f64 / 2.0) * self.voxel_size[2],
        ];
        let mut out = [0.0; 3];
        for r in 0..3 {
            out[r] = self.mdc[r][0] * v[0] + self.mdc[r][1] * v[1] + self.mdc[r][2] * v[2]
                + self.c_ras[r];
        }
        out
    }

    /// Voxel indices of every voxel whose value equals `label`.
    pub fn voxels_with_value(&self, label: f32) -> Vec<[usize; 3]> {
        let mut out = Vec::new();
        for k in 0..self.dims[2] {
            for j in 0..self.dims[1] {
                for i in 0..self.dims[0] {
                    if (self.value(i, j, k) - label).abs() < 0.5 {
                        out.push([i, j, k]);
                    }
                }
            }
        }
        out
    }
}

fn be_i32(b: &[u8], off: usize) -> i32 {
    i32::from_be_bytes(b[off..off + 4].try_into().unwrap())
}

fn be_f32(b: &[u8], off: usize) -> f32 {
    f32::from_be_bytes(b[off..off + 4].try_into().unwrap())
}

/// Read an MGH volume; gzipped (`.mgz`) files are detected by magic.
pub fn read_mgz(path: &Path) -> Result<Volume> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let bytes = if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        let mut out = Vec::new();
        GzDecoder::new(&raw[..])
            .read_to_end(&mut out)
            .with_context(|| format!("decompressing {}", path.display()))?;
        out
    } else {
        raw
    };
    if bytes.len() < MGH_DATA_OFFSET {
        bail!("{}: too small for an MGH header", path.display());
    }
    let version = be_i32(&bytes, 0);
    if version != 1 {
        bail!("{}: unsupported MGH version {}", path.display(), version);
    }
    let dims = [
        be_i32(&bytes, 4) as usize,
        be_i32(&bytes, 8) as usize,
        be_i32(&bytes, 12) as usize,
    ];
    let dtype = be_i32(&bytes, 20);
    let mut voxel_size = [1.0f64; 3];
    let mut mdc = [[0.0f64; 3]; 3];
    mdc[0][0] = 1.0;
    mdc[1][1] = 1.0;
    mdc[2][2] = 1.0;
    let mut c_ras = [0.0f64; 3];
    let good_ras = i16::from_be_bytes(bytes[28..30].try_into().unwrap());
    if good_ras > 0 {
        for i in 0..3 {
            voxel_size[i] = be_f32(&bytes, 30 + i * 4) as f64;
        }
        // Mdc is stored column-major: x-axis, y-axis, z-axis.
        for col in 0..3 {
            for row in 0..3 {
                mdc[row][col] = be_f32(&bytes, 42 + (col * 3 + row) * 4) as f64;
            }
        }
        for i in 0..3 {
            c_ras[i] = be_f32(&bytes, 78 + i * 4) as f64;
        }
    }

    let n = dims[0] * dims[1] * dims[2];
    let body = &bytes[MGH_DATA_OFFSET..];
    let data: Vec<f32> = match dtype {
        0 => {
            if body.len() < n {
                bail!("{}: truncated uchar data", path.display());
            }
            body[..n].iter().map(|&b| b as f32).collect()
        }
        1 => {
            if body.len() < n * 4 {
                bail!("{}: truncated int data", path.display());
            }
            (0..n).map(|i| be_i32(body, i * 4) as f32).collect()
        }
        3 => {
            if body.len() < n * 4 {
                bail!("{}: truncated float data", path.display());
            }
            (0..n).map(|i| be_f32(body, i * 4)).collect()
        }
        4 => {
            if body.len() < n * 2 {
                bail!("{}: truncated short data", path.display());
            }
            (0..n)
                .map(|i| i16::from_be_bytes(body[i * 2..i * 2 + 2].try_into().unwrap()) as f32)
                .collect()
        }
        other => bail!("{}: unsupported MGH data type {}", path.display(), other),
    };
    Ok(Volume { dims, voxel_size, mdc, c_ras, data })
}

/// Write an uncompressed MGH volume (float data).
pub fn write_mgh(vol: &Volume, path: &Path) -> Result<()> {
    let mut out = vec![0u8; MGH_DATA_OFFSET];
    out[0..4].copy_from_slice(&1_i32.to_be_bytes());
    for (i, &d) in vol.dims.iter().enumerate() {
        out[4 + i * 4..8 + i * 4].copy_from_slice(&(d as i32).to_be_bytes());
    }
    out[16..20].copy_from_slice(&1_i32.to_be_bytes());
    out[20..24].copy_from_slice(&3_i32.to_be_bytes());
    out[28..30].copy_from_slice(&1_i16.to_be_bytes());
    for i in 0..3 {
        out[30 + i * 4..34 + i * 4].copy_from_slice(&(vol.voxel_size[i] as f32).to_be_bytes());
    }
    for col in 0..3 {
        for row in 0..3 {
            let off = 42 + (col * 3 + row) * 4;
            out[off..off + 4].copy_from_slice(&(vol.mdc[row][col] as f32).to_be_bytes());
        }
    }
    for i in 0..3 {
        out[78 + i * 4..82 + i * 4].copy_from_slice(&(vol.c_ras[i] as f32).to_be_bytes());
    }
    for &v in &vol.data {
        out.extend_from_slice(&v.to_be_bytes());
    }
    std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Write a minimal single-frame NIfTI-1 file (float32, little-endian).
///
/// Used to export the combined source space for visual inspection; only the
/// fields viewers need are populated.
pub fn write_nifti(dims: [usize; 3], voxel_mm: [f64; 3], data: &[f32], path: &Path) -> Result<()> {
    if data.len() != dims[0] * dims[1] * dims[2] {
        bail!("data length {} does not match dims {:?}", data.len(), dims);
    }
    let mut hdr = vec![0u8; 352];
    hdr[0..4].copy_from_slice(&348_i32.to_le_bytes());
    // dim[0]=3, dim[1..4]=shape
    let dim: [i16; 8] = [3, dims[0] as i16, dims[1] as i16, dims[2] as i16, 1, 1, 1, 1];
    for (i, d) in dim.iter().enumerate() {
        hdr[40 + i * 2..42 + i * 2].copy_from_slice(&d.to_le_bytes());
    }
    hdr[70..72].copy_from_slice(&16_i16.to_le_bytes()); // DT_FLOAT32
    hdr[72..74].copy_from_slice(&32_i16.to_le_bytes()); // bitpix
    let pixdim: [f32; 8] = [
        1.0,
        voxel_mm[0] as f32,
        voxel_mm[1] as f32,
        voxel_mm[2] as f32,
        1.0, 1.0, 1.0, 1.0,
    ];
    for (i, p) in pixdim.iter().enumerate() {
        hdr[76 + i * 4..80 + i * 4].copy_from_slice(&p.to_le_bytes());
    }
    hdr[108..112].copy_from_slice(&352.0_f32.to_le_bytes()); // vox_offset
    hdr[344..348].copy_from_slice(b"n+1\0");
    let mut out = hdr;
    for &v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_volume() -> Volume {
        let dims = [4, 4, 4];
        let mut data = vec![0.0f32; 64];
        data[1 + 4 * (2 + 4 * 3)] = 18.0; // one Left-Amygdala voxel
        Volume {
            dims,
            voxel_size: [2.0, 2.0, 2.0],
            mdc: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            c_ras: [0.0, 0.0, 0.0],
            data,
        }
    }

    #[test]
    fn mgh_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aseg.mgz");
        let vol = toy_volume();
        write_mgh(&vol, &path).unwrap();
        let back = read_mgz(&path).unwrap();
        assert_eq!(back.dims, vol.dims);
        assert_eq!(back.voxel_size, vol.voxel_size);
        approx::assert_abs_diff_eq!(back.value(1, 2, 3), 18.0);
    }

    #[test]
    fn voxel_lookup_and_ras() {
        let vol = toy_volume();
        let hits = vol.voxels_with_value(18.0);
        assert_eq!(hits, vec![[1, 2, 3]]);
        let ras = vol.vox2ras(2, 2, 2);
        // Centre voxel of a 4³ grid with 2 mm voxels maps to the origin.
        approx::assert_abs_diff_eq!(ras[0], 0.0);
        approx::assert_abs_diff_eq!(ras[1], 0.0);
        approx::assert_abs_diff_eq!(ras[2], 0.0);
    }

    #[test]
    fn nifti_header_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.nii");
        write_nifti([2, 2, 2], [1.0, 1.0, 1.0], &[0.0; 8], &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 352 + 32);
        assert_eq!(&bytes[344..348], b"n+1\0");
    }
}
