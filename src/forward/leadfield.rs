//! MEG lead fields on a spherically symmetric conductor.
//!
//! The field of a current dipole inside a conducting sphere has the closed
//! form of Sarvas (1987); volume currents contribute nothing outside the
//! sphere, so the single-shell conductivity never enters the field values.
//! Sensors are treated as point magnetometers oriented radially from the
//! sphere centre. EEG channels are not part of the solution.
//!
//! Sources closer than [`MIN_DIST_MM`] to the inner-skull shell (or outside
//! it) get a zero gain column and are counted in the solution metadata.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Spacing;
use crate::error::PipelineError;
use crate::forward::bem::BemModel;
use crate::forward::coreg::CoordTransform;
use crate::forward::source_space::SourceSpace;
use crate::io::raw::RawBundle;
use crate::io::tensor::{TensorFile, TensorWriter};

/// Sources closer than this to the shell are dropped from the solution.
pub const MIN_DIST_MM: f64 = 5.0;

const MU0_OVER_4PI: f64 = 1e-7;

/// Gain matrices plus the source geometry they were computed on.
#[derive(Debug, Clone)]
pub struct ForwardSolution {
    /// [C, S, 3]: field at channel `c` for a unit dipole along x/y/z at
    /// source `s`, in T/(A·m).
    pub gain: Array3<f64>,
    /// Source locations in head coordinates, metres. [S, 3]
    pub points: Array2<f64>,
    /// Source orientations in head coordinates. [S, 3]
    pub normals: Array2<f64>,
    pub ch_names: Vec<String>,
    /// Patch name and source count, in source-space order.
    pub patch_sizes: Vec<(String, usize)>,
    /// Sources with a zeroed column (too close to or outside the shell).
    pub n_excluded: usize,
}

/// Metadata written next to the solution tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardInfo {
    pub subject: String,
    pub spacing: String,
    pub mixed: bool,
    pub n_channels: usize,
    pub n_sources: usize,
    pub n_excluded: usize,
    pub mindist_mm: f64,
    pub patches: Vec<(String, usize)>,
}

impl ForwardSolution {
    pub fn n_channels(&self) -> usize {
        self.gain.shape()[0]
    }

    pub fn n_sources(&self) -> usize {
        self.gain.shape()[1]
    }

    /// Gain for dipoles fixed along the source normals: [C, S].
    pub fn fixed_gain(&self) -> Array2<f64> {
        let (n_c, n_s, _) = self.gain.dim();
        let mut out = Array2::zeros((n_c, n_s));
        for c in 0..n_c {
            for src in 0..n_s {
                let mut v = 0.0;
                for k in 0..3 {
                    v += self.gain[[c, src, k]] * self.normals[[src, k]];
                }
                out[[c, src]] = v;
            }
        }
        out
    }

    /// Free-orientation gain reshaped to [C, S*3], columns grouped by source.
    pub fn free_gain(&self) -> Array2<f64> {
        let (n_c, n_s, _) = self.gain.dim();
        let mut out = Array2::zeros((n_c, n_s * 3));
        for c in 0..n_c {
            for src in 0..n_s {
                for k in 0..3 {
                    out[[c, src * 3 + k]] = self.gain[[c, src, k]];
                }
            }
        }
        out
    }

    pub fn save(&self, path: &Path, info: &ForwardInfo) -> Result<()> {
        let mut w = TensorWriter::new();
        let flat: Vec<f64> = self.gain.iter().copied().collect();
        w.add_f64("gain", &flat, self.gain.shape());
        w.add_arr2_f64("points", &self.points);
        w.add_arr2_f64("normals", &self.normals);
        w.add_str_list("ch_names", &self.ch_names);
        w.write(path)?;
        let sidecar = path.with_extension("json");
        std::fs::write(&sidecar, serde_json::to_string_pretty(info)?)
            .with_context(|| format!("writing {}", sidecar.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<(Self, ForwardInfo)> {
        let f = TensorFile::open(path)?;
        let gain = f.arr3_f64("gain")?;
        let points = f.arr2_f64("points")?;
        let normals = f.arr2_f64("normals")?;
        let ch_names = f.str_list("ch_names")?;
        let sidecar = path.with_extension("json");
        let text = std::fs::read_to_string(&sidecar)
            .with_context(|| format!("reading {}", sidecar.display()))?;
        let info: ForwardInfo = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", sidecar.display()))?;
        let solution = ForwardSolution {
            gain,
            points,
            normals,
            ch_names,
            patch_sizes: info.patches.clone(),
            n_excluded: info.n_excluded,
        };
        Ok((solution, info))
    }
}

/// Output path: `<base>-<spacing>[-aseg]-fwd.safetensors`.
pub fn forward_file(out_dir: &Path, base: &str, spacing: Spacing, mixed: bool) -> PathBuf {
    let tag = if mixed { "-aseg" } else { "" };
    out_dir.join(format!("{base}-{}{tag}-fwd.safetensors", spacing.as_str()))
}

/// Compute the MEG lead field for every source of `src` as seen by the MEG
/// channels of `raw`.
///
/// `trans` maps head coordinates to MRI surface RAS (metres); source points
/// and the conductor sphere are taken from MRI space and moved into head
/// coordinates with its inverse.
pub fn compute_forward(
    raw: &RawBundle,
    src: &SourceSpace,
    bem: &BemModel,
    trans: &CoordTransform,
) -> Result<ForwardSolution> {
    let meg = raw.meg_picks();
    if meg.is_empty() {
        return Err(PipelineError::config("recording has no MEG channels".to_string()));
    }
    let mri_to_head = trans.invert();

    let center = mri_to_head.apply([
        bem.sphere_center_mm[0] / 1000.0,
        bem.sphere_center_mm[1] / 1000.0,
        bem.sphere_center_mm[2] / 1000.0,
    ]);
    let radius = bem.sphere_radius_mm / 1000.0;
    let limit = radius - MIN_DIST_MM / 1000.0;

    let points_mm = src.all_points();
    let normals_mri = src.all_normals();
    let n_s = points_mm.len();
    let n_c = meg.len();

    let mut points = Array2::zeros((n_s, 3));
    let mut normals = Array2::zeros((n_s, 3));
    for (i, p) in points_mm.iter().enumerate() {
        let head = mri_to_head.apply([p[0] / 1000.0, p[1] / 1000.0, p[2] / 1000.0]);
        for c in 0..3 {
            points[[i, c]] = head[c];
        }
        // Rotate orientations without the offset.
        let n = normals_mri[i];
        let origin = mri_to_head.apply([0.0, 0.0, 0.0]);
        let rotated = mri_to_head.apply(n);
        for c in 0..3 {
            normals[[i, c]] = rotated[c] - origin[c];
        }
    }

    let mut gain = Array3::zeros((n_c, n_s, 3));
    let mut n_excluded = 0usize;
    for s_idx in 0..n_s {
        let r0 = [
            points[[s_idx, 0]] - center[0],
            points[[s_idx, 1]] - center[1],
            points[[s_idx, 2]] - center[2],
        ];
        let depth = norm(&r0);
        if depth >= limit {
            n_excluded += 1;
            continue;
        }
        for (c_idx, &ch) in meg.iter().enumerate() {
            let pos = raw.channels[ch].pos;
            let r = [pos[0] - center[0], pos[1] - center[1], pos[2] - center[2]];
            let orient = unit(&r);
            for k in 0..3 {
                let mut q = [0.0; 3];
                q[k] = 1.0;
                let b = sarvas_field(&q, &r0, &r);
                gain[[c_idx, s_idx, k]] = dot(&b, &orient);
            }
        }
    }
    if n_excluded > 0 {
        warn!(n_excluded, mindist_mm = MIN_DIST_MM, "sources too shallow for the shell");
    }

    info!(n_channels = n_c, n_sources = n_s, "lead field computed");
    Ok(ForwardSolution {
        gain,
        points,
        normals,
        ch_names: meg.iter().map(|&i| raw.channels[i].name.clone()).collect(),
        patch_sizes: src.patches.iter().map(|p| (p.name.clone(), p.n_sources())).collect(),
        n_excluded,
    })
}

/// Magnetic field of a dipole `q` at `r0` seen at `r`, both relative to the
/// sphere centre (Sarvas 1987, eq. 25).
fn sarvas_field(q: &[f64; 3], r0: &[f64; 3], r: &[f64; 3]) -> [f64; 3] {
    let a_vec = [r[0] - r0[0], r[1] - r0[1], r[2] - r0[2]];
    let a = norm(&a_vec);
    let r_n = norm(r);
    if a < 1e-12 || r_n < 1e-12 {
        return [0.0; 3];
    }
    let ar = dot(&a_vec, r);
    let r0r = dot(r0, r);

    let f = a * (r_n * a + r_n * r_n - r0r);
    let grad_coeff_r = a * a / r_n + ar / a + 2.0 * a + 2.0 * r_n;
    let grad_coeff_r0 = a + 2.0 * r_n + ar / a;
    let grad_f = [
        grad_coeff_r * r[0] - grad_coeff_r0 * r0[0],
        grad_coeff_r * r[1] - grad_coeff_r0 * r0[1],
        grad_coeff_r * r[2] - grad_coeff_r0 * r0[2],
    ];

    let q_x_r0 = cross(q, r0);
    let qr0_r = dot(&q_x_r0, r);
    let scale = MU0_OVER_4PI / (f * f);
    [
        scale * (f * q_x_r0[0] - qr0_r * grad_f[0]),
        scale * (f * q_x_r0[1] - qr0_r * grad_f[1]),
        scale * (f * q_x_r0[2] - qr0_r * grad_f[2]),
    ]
}

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: &[f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

fn unit(a: &[f64; 3]) -> [f64; 3] {
    let n = norm(a).max(1e-300);
    [a[0] / n, a[1] / n, a[2] / n]
}
