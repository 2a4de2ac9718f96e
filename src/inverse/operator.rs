//! Minimum-norm inverse operator: assembly, noise normalization and
//! application to raw, epoched and evoked recordings.
//!
//! The kernel is `K = R Gᵀ (G R Gᵀ + λ² C)⁻¹` with source covariance `R`
//! built from the orientation policy (loose weighting of the tangential
//! components, depth weighting of deep sources). dSPM and sLORETA divide
//! each source by its estimated noise, MNE leaves amplitudes untouched.
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{s, Array2, Array3};
use tracing::info;

use crate::config::{InverseMethod, OrientationPolicy};
use crate::error::PipelineError;
use crate::forward::ForwardSolution;
use crate::inverse::covariance::NoiseCovariance;
use crate::io::raw::{EpochsBundle, EvokedBundle, RawBundle};
use crate::io::tensor::{TensorFile, TensorWriter};
use crate::linalg::{cho_solve, cholesky};

/// Samples per block when applying the operator to continuous data.
pub const RAW_BUFFER_SAMPLES: usize = 1000;

/// Assembled linear inverse.
#[derive(Debug, Clone)]
pub struct InverseOperator {
    /// [S*components, C]; rows of one source are adjacent, the normal
    /// component last.
    kernel: Array2<f64>,
    pub n_sources: usize,
    pub components: usize,
    pub pick_normal: bool,
    pub method: InverseMethod,
    pub ch_names: Vec<String>,
    /// Per-source noise normalization; empty for plain MNE.
    norm_factors: Vec<f64>,
}

/// Build the inverse operator for a forward solution.
///
/// `lambda2` is the regularization (1/SNR²); the orientation policy decides
/// loose, depth and whether estimates are projected on the source normals.
pub fn make_inverse_operator(
    fwd: &ForwardSolution,
    cov: &NoiseCovariance,
    policy: OrientationPolicy,
    lambda2: f64,
    method: InverseMethod,
) -> Result<InverseOperator> {
    let cov = cov.pick(&fwd.ch_names)?;
    let n_c = fwd.n_channels();
    let n_s = fwd.n_sources();

    // Depth weights from the free-orientation gain column norms.
    let weights = match policy.depth {
        Some(gamma) => depth_weights(fwd, gamma),
        None => vec![1.0; n_s],
    };

    let fixed = policy.loose == 0.0;
    let components = if fixed { 1 } else { 3 };

    // Oriented gain: per source either the normal column, or the
    // (tangential, tangential, normal) triple.
    let n_cols = n_s * components;
    let mut gain = Array2::<f64>::zeros((n_c, n_cols));
    let mut r_diag = vec![0.0f64; n_cols];
    for src in 0..n_s {
        let normal = [fwd.normals[[src, 0]], fwd.normals[[src, 1]], fwd.normals[[src, 2]]];
        if fixed {
            for c in 0..n_c {
                let mut v = 0.0;
                for k in 0..3 {
                    v += fwd.gain[[c, src, k]] * normal[k];
                }
                gain[[c, src]] = v;
            }
            r_diag[src] = weights[src];
        } else {
            let (t1, t2) = tangential_basis(&normal);
            for (comp, axis) in [t1, t2, normal].iter().enumerate() {
                let col = src * 3 + comp;
                for c in 0..n_c {
                    let mut v = 0.0;
                    for k in 0..3 {
                        v += fwd.gain[[c, src, k]] * axis[k];
                    }
                    gain[[c, col]] = v;
                }
                r_diag[col] =
                    if comp < 2 { policy.loose * weights[src] } else { weights[src] };
            }
        }
    }

    // A = G R Gᵀ + λ² C, with a whisper of ridge for rank safety.
    let mut a = Array2::<f64>::zeros((n_c, n_c));
    for i in 0..n_c {
        for j in 0..n_c {
            let mut v = 0.0;
            for col in 0..n_cols {
                v += gain[[i, col]] * r_diag[col] * gain[[j, col]];
            }
            a[[i, j]] = v + lambda2 * cov.data[[i, j]];
        }
    }
    let trace: f64 = (0..n_c).map(|i| a[[i, i]]).sum();
    let ridge = trace / n_c as f64 * 1e-12;
    for i in 0..n_c {
        a[[i, i]] += ridge;
    }
    let l = cholesky(&a).context("whitened gain covariance is not invertible")?;
    let a_inv = cho_solve(&l, &Array2::eye(n_c));

    // K = R Gᵀ A⁻¹.
    let mut kernel = Array2::<f64>::zeros((n_cols, n_c));
    for row in 0..n_cols {
        for j in 0..n_c {
            let mut v = 0.0;
            for c in 0..n_c {
                v += r_diag[row] * gain[[c, row]] * a_inv[[c, j]];
            }
            kernel[[row, j]] = v;
        }
    }

    // Per-source noise normalization.
    let norm_factors = match method {
        InverseMethod::Mne => Vec::new(),
        InverseMethod::Dspm => source_norms(&kernel, &cov.data, n_s, components),
        InverseMethod::Sloreta => source_norms(&kernel, &a, n_s, components),
    };

    info!(
        n_sources = n_s,
        components,
        method = method.as_str(),
        lambda2,
        "inverse operator assembled"
    );
    Ok(InverseOperator {
        kernel,
        n_sources: n_s,
        components,
        pick_normal: policy.pick_normal,
        method,
        ch_names: fwd.ch_names.clone(),
        norm_factors,
    })
}

fn depth_weights(fwd: &ForwardSolution, gamma: f64) -> Vec<f64> {
    let (n_c, n_s, _) = fwd.gain.dim();
    let mut w = Vec::with_capacity(n_s);
    for src in 0..n_s {
        let mut power = 0.0;
        for c in 0..n_c {
            for k in 0..3 {
                power += fwd.gain[[c, src, k]] * fwd.gain[[c, src, k]];
            }
        }
        w.push(if power > 0.0 { power.powf(-gamma) } else { 0.0 });
    }
    let max = w.iter().fold(0.0f64, |m, &v| m.max(v));
    if max > 0.0 {
        for v in &mut w {
            *v = (*v / max).max(1e-2);
        }
    }
    // Sources with a zeroed gain stay out of the estimate.
    for src in 0..n_s {
        let mut power = 0.0;
        for c in 0..n_c {
            for k in 0..3 {
                power += fwd.gain[[c, src, k]] * fwd.gain[[c, src, k]];
            }
        }
        if power == 0.0 {
            w[src] = 0.0;
        }
    }
    w
}

/// `1/sqrt(Σ_comp k A kᵀ)` per source.
fn source_norms(kernel: &Array2<f64>, a: &Array2<f64>, n_s: usize, components: usize) -> Vec<f64> {
    let n_c = a.nrows();
    let mut out = Vec::with_capacity(n_s);
    for src in 0..n_s {
        let mut var = 0.0;
        for comp in 0..components {
            let row = kernel.row(src * components + comp);
            for i in 0..n_c {
                let mut ka = 0.0;
                for j in 0..n_c {
                    ka += row[j] * a[[i, j]];
                }
                var += row[i] * ka;
            }
        }
        out.push(if var > 0.0 { 1.0 / var.sqrt() } else { 0.0 });
    }
    out
}

fn tangential_basis(n: &[f64; 3]) -> ([f64; 3], [f64; 3]) {
    let pick = if n[0].abs() < 0.9 { [1.0, 0.0, 0.0] } else { [0.0, 1.0, 0.0] };
    let t1 = [
        n[1] * pick[2] - n[2] * pick[1],
        n[2] * pick[0] - n[0] * pick[2],
        n[0] * pick[1] - n[1] * pick[0],
    ];
    let l1 = (t1[0] * t1[0] + t1[1] * t1[1] + t1[2] * t1[2]).sqrt().max(1e-300);
    let t1 = [t1[0] / l1, t1[1] / l1, t1[2] / l1];
    let t2 = [
        n[1] * t1[2] - n[2] * t1[1],
        n[2] * t1[0] - n[0] * t1[2],
        n[0] * t1[1] - n[1] * t1[0],
    ];
    (t1, t2)
}

impl InverseOperator {
    /// Row indices of `bundle_names` matching the operator's channel order.
    pub fn channel_picks(&self, bundle_names: &[String]) -> Result<Vec<usize>> {
        self.ch_names
            .iter()
            .map(|n| {
                bundle_names.iter().position(|c| c == n).ok_or_else(|| {
                    PipelineError::shape(format!("channel `{n}` missing from the recording"))
                })
            })
            .collect()
    }

    /// Apply to sensor data already in the operator's channel order.
    ///
    /// Returns [S, T]: signed amplitudes for fixed or normal-projected
    /// estimates, component norms otherwise.
    pub fn apply(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
        if data.nrows() != self.ch_names.len() {
            return Err(PipelineError::shape(format!(
                "operator expects {} channels, data has {}",
                self.ch_names.len(),
                data.nrows()
            )));
        }
        let full = self.kernel.dot(data); // [S*comp, T]
        let n_t = data.ncols();
        let mut out = Array2::<f64>::zeros((self.n_sources, n_t));
        for src in 0..self.n_sources {
            if self.components == 1 {
                out.row_mut(src).assign(&full.row(src));
            } else if self.pick_normal {
                out.row_mut(src).assign(&full.row(src * 3 + 2));
            } else {
                for t in 0..n_t {
                    let mut sq = 0.0;
                    for comp in 0..3 {
                        let v = full[[src * 3 + comp, t]];
                        sq += v * v;
                    }
                    out[[src, t]] = sq.sqrt();
                }
            }
            if let Some(&f) = self.norm_factors.get(src) {
                out.row_mut(src).mapv_inplace(|v| v * f);
            }
        }
        Ok(out)
    }

    /// Apply to a continuous recording, block by block.
    pub fn apply_raw(&self, raw: &RawBundle) -> Result<Array2<f64>> {
        let picks = self.channel_picks(&raw.ch_names())?;
        let sel = raw.pick_channels(&picks);
        let n_t = sel.data.ncols();
        let mut out = Array2::<f64>::zeros((self.n_sources, n_t));
        let mut start = 0;
        while start < n_t {
            let stop = (start + RAW_BUFFER_SAMPLES).min(n_t);
            let block = sel.data.slice(s![.., start..stop]).to_owned();
            out.slice_mut(s![.., start..stop]).assign(&self.apply(&block)?);
            start = stop;
        }
        Ok(out)
    }

    /// Apply to every trial of an epoched recording → [E, S, T].
    pub fn apply_epochs(&self, epochs: &EpochsBundle) -> Result<Array3<f64>> {
        let picks = self.channel_picks(&epochs.ch_names())?;
        let n_e = epochs.n_epochs();
        let n_t = epochs.n_samples();
        let mut out = Array3::<f64>::zeros((n_e, self.n_sources, n_t));
        for e in 0..n_e {
            let mut block = Array2::<f64>::zeros((picks.len(), n_t));
            for (row, &c) in picks.iter().enumerate() {
                block.row_mut(row).assign(&epochs.data.slice(s![e, c, ..]));
            }
            out.slice_mut(s![e, .., ..]).assign(&self.apply(&block)?);
        }
        Ok(out)
    }

    /// Apply to each condition average → (condition, [S, T]) pairs.
    pub fn apply_evoked(&self, evoked: &EvokedBundle) -> Result<Vec<(String, Array2<f64>)>> {
        let names: Vec<String> = evoked.channels.iter().map(|c| c.name.clone()).collect();
        let picks = self.channel_picks(&names)?;
        let mut out = Vec::with_capacity(evoked.conditions.len());
        for (cond, data) in &evoked.conditions {
            let mut block = Array2::<f64>::zeros((picks.len(), data.ncols()));
            for (row, &c) in picks.iter().enumerate() {
                block.row_mut(row).assign(&data.row(c));
            }
            out.push((cond.clone(), self.apply(&block)?));
        }
        Ok(out)
    }
}

/// Write source estimates as `[n_est, S, T]` under the `stc_data` key.
pub fn write_stc(estimates: &[Array2<f64>], path: &Path) -> Result<()> {
    if estimates.is_empty() {
        return Err(PipelineError::shape("no source estimates to write".to_string()));
    }
    let (n_s, n_t) = estimates[0].dim();
    let mut stacked = Array3::<f64>::zeros((estimates.len(), n_s, n_t));
    for (i, est) in estimates.iter().enumerate() {
        if est.dim() != (n_s, n_t) {
            return Err(PipelineError::shape(format!(
                "estimate {i} has shape {:?}, expected {:?}",
                est.dim(),
                (n_s, n_t)
            )));
        }
        stacked.slice_mut(s![i, .., ..]).assign(est);
    }
    let mut w = TensorWriter::new();
    w.add_arr3_f64("stc_data", &stacked);
    w.write(path)
}

/// Read back `[n_est, S, T]` estimates.
pub fn read_stc(path: &Path) -> Result<Array3<f64>> {
    TensorFile::open(path)?.arr3_f64("stc_data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{lambda2, InverseMethod, OrientationPolicy, SNR_EVOKED};
    use crate::forward::{compute_forward, BemModel, CoordTransform, SourcePatch, SourceSpace};
    use crate::inverse::covariance::identity_covariance;
    use crate::io::raw::{ChannelKind, SensorChannel};

    fn toy_forward() -> (RawBundle, ForwardSolution) {
        let mut channels = Vec::new();
        for i in 0..12 {
            let a = i as f64 / 12.0 * std::f64::consts::TAU;
            let z = if i % 2 == 0 { 0.02 } else { 0.08 };
            channels.push(SensorChannel {
                name: format!("MEG {i:03}"),
                kind: ChannelKind::Magnetometer,
                pos: [0.12 * a.cos(), 0.12 * a.sin(), z],
            });
        }
        let raw = RawBundle {
            channels,
            data: Array2::zeros((12, 10)),
            sfreq: 1000.0,
            bads: vec![],
        };
        let src = SourceSpace {
            subject: "sub-01".into(),
            spacing: "oct-6".into(),
            patches: vec![SourcePatch {
                name: "lh".into(),
                is_surface: true,
                points_mm: vec![[30.0, 0.0, 10.0], [-20.0, 25.0, 5.0], [0.0, -35.0, 15.0]],
                normals: vec![[0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]],
                vertex_ids: vec![0, 1, 2],
            }],
        };
        let bem = BemModel {
            subject: "sub-01".into(),
            ico: 4,
            conductivity: vec![0.3],
            sphere_center_mm: [0.0; 3],
            sphere_radius_mm: 80.0,
            n_vertices: 2562,
            n_faces: 5120,
            surface_source: "inner_skull".into(),
        };
        let trans = CoordTransform::identity("head", "mri");
        let fwd = compute_forward(&raw, &src, &bem, &trans).unwrap();
        (raw, fwd)
    }

    fn simulate(fwd: &ForwardSolution, active: usize, n_t: usize) -> Array2<f64> {
        let n_c = fwd.n_channels();
        let mut data = Array2::<f64>::zeros((n_c, n_t));
        for t in 0..n_t {
            let amp = (t as f64 * 0.2).sin() * 1e-8;
            for c in 0..n_c {
                let mut g = 0.0;
                for k in 0..3 {
                    g += fwd.gain[[c, active, k]] * fwd.normals[[active, k]];
                }
                data[[c, t]] += g * amp;
            }
        }
        data
    }

    #[test]
    fn active_source_dominates_estimate() {
        let (raw, fwd) = toy_forward();
        let cov = identity_covariance(&raw);
        let policy = OrientationPolicy::select(false, false);
        let op = make_inverse_operator(&fwd, &cov, policy, lambda2(SNR_EVOKED), InverseMethod::Mne)
            .unwrap();
        let data = simulate(&fwd, 0, 50);
        let est = op.apply(&data).unwrap();
        let power: Vec<f64> = (0..3)
            .map(|s| est.row(s).iter().map(|v| v * v).sum::<f64>())
            .collect();
        assert!(power[0] > power[1] && power[0] > power[2], "{power:?}");
    }

    #[test]
    fn policy_table_shapes() {
        let (raw, fwd) = toy_forward();
        let cov = identity_covariance(&raw);
        for (fixed, mixed) in [(true, false), (false, false), (false, true)] {
            let policy = OrientationPolicy::select(fixed, mixed);
            let op = make_inverse_operator(
                &fwd,
                &cov,
                policy,
                lambda2(SNR_EVOKED),
                InverseMethod::Dspm,
            )
            .unwrap();
            assert_eq!(op.components, if fixed { 1 } else { 3 });
            let data = simulate(&fwd, 1, 20);
            let est = op.apply(&data).unwrap();
            assert_eq!(est.shape(), &[3, 20]);
            if fixed {
                // Signed estimates.
                assert!(est.iter().any(|&v| v < 0.0));
            }
            if mixed {
                // Vector norms are non-negative.
                assert!(est.iter().all(|&v| v >= 0.0));
            }
        }
    }

    #[test]
    fn raw_blocking_matches_single_shot() {
        let (mut raw, fwd) = toy_forward();
        let cov = identity_covariance(&raw);
        let policy = OrientationPolicy::select(false, false);
        let op = make_inverse_operator(&fwd, &cov, policy, lambda2(1.0), InverseMethod::Mne)
            .unwrap();
        raw.data = simulate(&fwd, 2, 2500);
        let blocked = op.apply_raw(&raw).unwrap();
        let direct = op.apply(&raw.data).unwrap();
        assert_eq!(blocked.shape(), direct.shape());
        for (a, b) in blocked.iter().zip(direct.iter()) {
            approx::assert_abs_diff_eq!(a, b, epsilon = 1e-20);
        }
    }

    #[test]
    fn dspm_normalization_is_unitless() {
        let (raw, fwd) = toy_forward();
        let cov = identity_covariance(&raw);
        let policy = OrientationPolicy::select(true, false);
        let mne = make_inverse_operator(&fwd, &cov, policy, lambda2(1.0), InverseMethod::Mne)
            .unwrap();
        let dspm = make_inverse_operator(&fwd, &cov, policy, lambda2(1.0), InverseMethod::Dspm)
            .unwrap();
        let data = simulate(&fwd, 0, 30);
        let est_mne = mne.apply(&data).unwrap();
        let est_dspm = dspm.apply(&data).unwrap();
        // Same shape, different scaling.
        assert_eq!(est_mne.shape(), est_dspm.shape());
        let r0 = est_dspm[[0, 10]] / est_mne[[0, 10]];
        let r1 = est_dspm[[1, 10]] / est_mne[[1, 10]];
        assert!((r0 / r1 - 1.0).abs() > 1e-6, "normalization did nothing");
    }

    #[test]
    fn stc_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec_stc.safetensors");
        let a = Array2::from_shape_fn((4, 6), |(i, j)| (i * 6 + j) as f64);
        let b = a.mapv(|v| v * 2.0);
        write_stc(&[a.clone(), b], &path).unwrap();
        let back = read_stc(&path).unwrap();
        assert_eq!(back.shape(), &[2, 4, 6]);
        approx::assert_abs_diff_eq!(back[[1, 2, 3]], a[[2, 3]] * 2.0);
    }
}
