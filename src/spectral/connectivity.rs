//! Pairwise spectral connectivity over trials.
//!
//! Each trial yields an ensemble of complex spectral coefficients per node
//! (multitaper band bins, or Morlet coefficients per frequency); metrics
//! are expectations over that ensemble. Per-trial matrices are then
//! aggregated by mean or elementwise max into one real lower-triangular
//! `[N, N]` matrix with a zero diagonal.
use std::path::{Path, PathBuf};

use anyhow::Result;
use ndarray::{Array2, Array3, Axis};
use rustfft::{num_complex::Complex, FftPlanner};
use tracing::info;

use crate::config::{ConnectivityMetric, SpectralMode, TrialAggregation};
use crate::error::PipelineError;
use crate::io::mat::write_mat;
use crate::io::tensor::{TensorFile, TensorWriter};

const N_SINE_TAPERS: usize = 4;
const CYCLES_PER_FREQ: f64 = 7.0;

/// Promote a `[nodes, samples]` record to a 1-trial tensor where the
/// metric permits it. Phase metrics need a trial dimension.
pub fn promote_trials(data: &Array2<f64>, metric: ConnectivityMetric) -> Result<Array3<f64>> {
    if !metric.allows_single_trial() {
        return Err(PipelineError::shape(format!(
            "`{}` needs trialed data [trials, nodes, samples], got a single \
             [{}, {}] record",
            metric.as_str(),
            data.nrows(),
            data.ncols()
        )));
    }
    Ok(data.clone().insert_axis(Axis(0)))
}

/// Connectivity of a `[trials, nodes, samples]` tensor in `[fmin, fmax]`.
pub fn spectral_connectivity(
    data: &Array3<f64>,
    metric: ConnectivityMetric,
    sfreq: f64,
    fmin: f64,
    fmax: f64,
    mode: SpectralMode,
    aggregation: TrialAggregation,
) -> Result<Array2<f64>> {
    let (n_trials, n_nodes, _) = data.dim();
    let per_trial = spectral_connectivity_trials(data, metric, sfreq, fmin, fmax, mode)?;
    let mut agg = Array2::<f64>::zeros((n_nodes, n_nodes));
    for con in per_trial.axis_iter(Axis(0)) {
        match aggregation {
            TrialAggregation::Mean => agg += &con,
            TrialAggregation::Max => agg.zip_mut_with(&con, |a, &b| *a = a.max(b)),
        }
    }
    if aggregation == TrialAggregation::Mean {
        agg /= n_trials as f64;
    }
    Ok(agg)
}

/// Per-trial connectivity, `[trials, N, N]`, without aggregation.
pub fn spectral_connectivity_trials(
    data: &Array3<f64>,
    metric: ConnectivityMetric,
    sfreq: f64,
    fmin: f64,
    fmax: f64,
    mode: SpectralMode,
) -> Result<Array3<f64>> {
    if fmin < 0.0 || fmax <= fmin || fmax > sfreq / 2.0 {
        return Err(PipelineError::config(format!(
            "frequency range [{fmin}, {fmax}] invalid at {sfreq} Hz"
        )));
    }
    let (n_trials, n_nodes, _) = data.dim();
    if n_trials == 0 || n_nodes < 2 {
        return Err(PipelineError::shape(format!(
            "connectivity needs at least one trial and two nodes, got {n_trials} x {n_nodes}"
        )));
    }
    let mut out = Array3::<f64>::zeros((n_trials, n_nodes, n_nodes));
    for (e, trial) in data.axis_iter(Axis(0)).enumerate() {
        let con = match mode {
            SpectralMode::Multitaper => multitaper_trial(&trial.to_owned(), metric, sfreq, fmin, fmax)?,
            SpectralMode::CwtMorlet => morlet_trial(&trial.to_owned(), metric, sfreq, fmin, fmax)?,
        };
        out.index_axis_mut(Axis(0), e).assign(&con);
    }
    Ok(out)
}

/// Band-averaged multitaper estimate: the expectation runs over all
/// (taper, band bin) coefficient pairs of the trial.
fn multitaper_trial(
    trial: &Array2<f64>,
    metric: ConnectivityMetric,
    sfreq: f64,
    fmin: f64,
    fmax: f64,
) -> Result<Array2<f64>> {
    let (n_nodes, n_t) = trial.dim();
    let df = sfreq / n_t as f64;
    let bins: Vec<usize> = (0..n_t / 2 + 1)
        .filter(|&f| {
            let hz = f as f64 * df;
            hz >= fmin && hz <= fmax
        })
        .collect();
    if bins.is_empty() {
        return Err(PipelineError::config(format!(
            "no frequency bins inside [{fmin}, {fmax}] at a resolution of {df} Hz"
        )));
    }

    let mut planner: FftPlanner<f64> = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_t);
    let tapers: Vec<Vec<f64>> = (0..N_SINE_TAPERS)
        .map(|k| {
            let norm = (2.0 / (n_t as f64 + 1.0)).sqrt();
            (0..n_t)
                .map(|t| {
                    norm * (std::f64::consts::PI * (k + 1) as f64 * (t + 1) as f64
                        / (n_t as f64 + 1.0))
                        .sin()
                })
                .collect()
        })
        .collect();

    // [node][taper * bins] coefficient ensemble.
    let mut coeffs: Vec<Vec<Complex<f64>>> =
        vec![Vec::with_capacity(N_SINE_TAPERS * bins.len()); n_nodes];
    for (node, row) in trial.axis_iter(Axis(0)).enumerate() {
        for taper in &tapers {
            let mut buf: Vec<Complex<f64>> = row
                .iter()
                .zip(taper)
                .map(|(&v, &w)| Complex { re: v * w, im: 0.0 })
                .collect();
            fft.process(&mut buf);
            coeffs[node].extend(bins.iter().map(|&b| buf[b]));
        }
    }
    Ok(lower_triangular(&coeffs, metric))
}

/// Morlet estimate: one metric per integer frequency in `[fmin, fmax)`
/// with `freq / 7` cycles, averaged over frequencies. The per-frequency
/// expectation runs over time points.
fn morlet_trial(
    trial: &Array2<f64>,
    metric: ConnectivityMetric,
    sfreq: f64,
    fmin: f64,
    fmax: f64,
) -> Result<Array2<f64>> {
    let (n_nodes, n_t) = trial.dim();
    let freqs: Vec<f64> = {
        let mut f = fmin.max(1.0);
        let mut out = Vec::new();
        while f < fmax {
            out.push(f);
            f += 1.0;
        }
        out
    };
    if freqs.is_empty() {
        return Err(PipelineError::config(format!(
            "no integer frequencies inside [{fmin}, {fmax})"
        )));
    }

    let mut agg = Array2::<f64>::zeros((n_nodes, n_nodes));
    for &freq in &freqs {
        let wavelet = morlet_wavelet(sfreq, freq, (freq / CYCLES_PER_FREQ).max(1.0));
        let coeffs: Vec<Vec<Complex<f64>>> = trial
            .axis_iter(Axis(0))
            .map(|row| cwt_same(&row.to_vec(), &wavelet))
            .collect();
        debug_assert!(coeffs.iter().all(|c| c.len() == n_t));
        agg += &lower_triangular(&coeffs, metric);
    }
    agg /= freqs.len() as f64;
    Ok(agg)
}

fn morlet_wavelet(sfreq: f64, freq: f64, n_cycles: f64) -> Vec<Complex<f64>> {
    let sigma_t = n_cycles / (2.0 * std::f64::consts::PI * freq);
    let half = (3.5 * sigma_t * sfreq).ceil() as i64;
    let dt = 1.0 / sfreq;
    let mut w: Vec<Complex<f64>> = (-half..=half)
        .map(|i| {
            let t = i as f64 * dt;
            let gauss = (-t * t / (2.0 * sigma_t * sigma_t)).exp();
            let phase = 2.0 * std::f64::consts::PI * freq * t;
            Complex { re: phase.cos(), im: phase.sin() } * gauss
        })
        .collect();
    let norm: f64 = w.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    for c in &mut w {
        *c /= norm;
    }
    w
}

/// Same-length complex convolution via FFT.
fn cwt_same(x: &[f64], wavelet: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let n = x.len();
    let m = wavelet.len();
    let n_conv = (n + m - 1).next_power_of_two();
    let mut planner: FftPlanner<f64> = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_conv);
    let ifft = planner.plan_fft_inverse(n_conv);

    let mut a: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex { re: v, im: 0.0 })
        .chain(std::iter::repeat(Complex::default()))
        .take(n_conv)
        .collect();
    let mut b: Vec<Complex<f64>> = wavelet
        .iter()
        .copied()
        .chain(std::iter::repeat(Complex::default()))
        .take(n_conv)
        .collect();
    fft.process(&mut a);
    fft.process(&mut b);
    for (u, v) in a.iter_mut().zip(&b) {
        *u *= v;
    }
    ifft.process(&mut a);
    let scale = 1.0 / n_conv as f64;
    let offset = m / 2;
    (0..n).map(|i| a[offset + i] * scale).collect()
}

/// Fill the strict lower triangle with the pairwise metric.
fn lower_triangular(coeffs: &[Vec<Complex<f64>>], metric: ConnectivityMetric) -> Array2<f64> {
    let n = coeffs.len();
    let mut out = Array2::<f64>::zeros((n, n));
    for i in 1..n {
        for j in 0..i {
            out[[i, j]] = edge_metric(&coeffs[i], &coeffs[j], metric);
        }
    }
    out
}

fn edge_metric(x: &[Complex<f64>], y: &[Complex<f64>], metric: ConnectivityMetric) -> f64 {
    let n = x.len() as f64;
    let mut sxy = Complex::<f64>::default();
    let mut sxx = 0.0f64;
    let mut syy = 0.0f64;
    let mut plv_sum = Complex::<f64>::default();
    let mut sign_sum = 0.0f64;
    let mut im_sum = 0.0f64;
    let mut abs_im_sum = 0.0f64;
    let mut im_sq_sum = 0.0f64;
    for (a, b) in x.iter().zip(y) {
        let c = a * b.conj();
        sxy += c;
        sxx += a.norm_sqr();
        syy += b.norm_sqr();
        let mag = c.norm();
        if mag > 0.0 {
            plv_sum += c / mag;
        }
        sign_sum += if c.im > 0.0 {
            1.0
        } else if c.im < 0.0 {
            -1.0
        } else {
            0.0
        };
        im_sum += c.im;
        abs_im_sum += c.im.abs();
        im_sq_sum += c.im * c.im;
    }
    let denom = (sxx * syy).sqrt();
    match metric {
        ConnectivityMetric::Coh => {
            if denom > 0.0 {
                sxy.norm() / denom
            } else {
                0.0
            }
        }
        ConnectivityMetric::Cohy => {
            if denom > 0.0 {
                (sxy / denom).re
            } else {
                0.0
            }
        }
        ConnectivityMetric::Imcoh => {
            if denom > 0.0 {
                sxy.im / denom
            } else {
                0.0
            }
        }
        ConnectivityMetric::Plv => plv_sum.norm() / n,
        ConnectivityMetric::Ppc => {
            if n > 1.0 {
                (plv_sum.norm_sqr() - n) / (n * (n - 1.0))
            } else {
                0.0
            }
        }
        ConnectivityMetric::Pli => (sign_sum / n).abs(),
        ConnectivityMetric::Pli2Unbiased => {
            if n > 1.0 {
                let s = sign_sum / n;
                (n * s * s - 1.0) / (n - 1.0)
            } else {
                0.0
            }
        }
        ConnectivityMetric::Wpli => {
            if abs_im_sum > 0.0 {
                im_sum.abs() / abs_im_sum
            } else {
                0.0
            }
        }
        ConnectivityMetric::Wpli2Debiased => {
            let den = abs_im_sum * abs_im_sum - im_sq_sum;
            if den > 0.0 {
                (im_sum * im_sum - im_sq_sum) / den
            } else {
                0.0
            }
        }
    }
}

/// `conmat_<index>_<metric>.safetensors`.
pub fn conmat_file(out_dir: &Path, index: usize, metric: ConnectivityMetric) -> PathBuf {
    out_dir.join(format!("conmat_{index}_{}.safetensors", metric.as_str()))
}

/// Persist a connectivity matrix, optionally mirrored as a `.mat` file.
pub fn write_conmat(
    conmat: &Array2<f64>,
    out_dir: &Path,
    index: usize,
    metric: ConnectivityMetric,
    export_mat: bool,
) -> Result<PathBuf> {
    let path = conmat_file(out_dir, index, metric);
    let mut w = TensorWriter::new();
    w.add_arr2_f64("conmat", conmat);
    w.write(&path)?;
    if export_mat {
        let flat: Vec<f64> = conmat.iter().copied().collect();
        write_mat(
            &path.with_extension("mat"),
            &[("conmat", &[conmat.nrows(), conmat.ncols()], &flat)],
        )?;
    }
    info!(file = %path.display(), metric = metric.as_str(), "connectivity written");
    Ok(path)
}

pub fn load_conmat(path: &Path) -> Result<Array2<f64>> {
    TensorFile::open(path)?.arr2_f64("conmat")
}

/// Persist one matrix per trial, `conmat_<index>_<metric>_trial_<e>`.
pub fn write_multi_conmat(
    per_trial: &Array3<f64>,
    out_dir: &Path,
    index: usize,
    metric: ConnectivityMetric,
    export_mat: bool,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::with_capacity(per_trial.dim().0);
    for (e, con) in per_trial.axis_iter(Axis(0)).enumerate() {
        let path = out_dir
            .join(format!("conmat_{index}_{}_trial_{e}.safetensors", metric.as_str()));
        let con = con.to_owned();
        let mut w = TensorWriter::new();
        w.add_arr2_f64("conmat", &con);
        w.write(&path)?;
        if export_mat {
            let flat: Vec<f64> = con.iter().copied().collect();
            write_mat(
                &path.with_extension("mat"),
                &[("conmat", &[con.nrows(), con.ncols()], &flat)],
            )?;
        }
        files.push(path);
    }
    info!(n_trials = files.len(), metric = metric.as_str(), "per-trial connectivity written");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coupled_trials(n_trials: usize, n_nodes: usize, n_t: usize, sfreq: f64) -> Array3<f64> {
        // Node 0 drives node 1 with a fixed phase lag; the rest is noise-free
        // tones at unrelated frequencies.
        Array3::from_shape_fn((n_trials, n_nodes, n_t), |(e, c, t)| {
            let tt = t as f64 / sfreq;
            let w = 2.0 * std::f64::consts::PI;
            match c {
                0 => (w * 20.0 * tt + e as f64).sin(),
                1 => (w * 20.0 * tt + e as f64 + 0.9).sin(),
                _ => (w * (30.0 + 3.0 * c as f64) * tt + (e * c) as f64).sin(),
            }
        })
    }

    #[test]
    fn coherent_pair_dominates() {
        let data = coupled_trials(5, 4, 2000, 200.0);
        let con = spectral_connectivity(
            &data,
            ConnectivityMetric::Coh,
            200.0,
            15.0,
            25.0,
            SpectralMode::Multitaper,
            TrialAggregation::Mean,
        )
        .unwrap();
        assert!(con[[1, 0]] > 0.9);
        assert!(con[[1, 0]] > con[[3, 2]]);
    }

    #[test]
    fn matrix_is_lower_triangular_with_zero_diagonal() {
        let data = coupled_trials(3, 4, 1000, 200.0);
        let con = spectral_connectivity(
            &data,
            ConnectivityMetric::Plv,
            200.0,
            15.0,
            25.0,
            SpectralMode::Multitaper,
            TrialAggregation::Mean,
        )
        .unwrap();
        for i in 0..4 {
            for j in i..4 {
                approx::assert_abs_diff_eq!(con[[i, j]], 0.0);
            }
        }
    }

    #[test]
    fn mean_is_bounded_by_max() {
        let data = coupled_trials(8, 3, 1500, 200.0);
        let mean = spectral_connectivity(
            &data,
            ConnectivityMetric::Coh,
            200.0,
            10.0,
            40.0,
            SpectralMode::Multitaper,
            TrialAggregation::Mean,
        )
        .unwrap();
        let max = spectral_connectivity(
            &data,
            ConnectivityMetric::Coh,
            200.0,
            10.0,
            40.0,
            SpectralMode::Multitaper,
            TrialAggregation::Max,
        )
        .unwrap();
        for (m, x) in mean.iter().zip(max.iter()) {
            assert!(m <= &(x + 1e-12));
        }
    }

    #[test]
    fn phase_metric_rejects_single_trial() {
        let flat = Array2::<f64>::zeros((4, 256));
        assert!(promote_trials(&flat, ConnectivityMetric::Plv).is_err());
        assert!(promote_trials(&flat, ConnectivityMetric::Wpli).is_err());
        let promoted = promote_trials(&flat, ConnectivityMetric::Coh).unwrap();
        assert_eq!(promoted.shape(), &[1, 4, 256]);
    }

    #[test]
    fn morlet_mode_sees_the_coupling() {
        let data = coupled_trials(2, 3, 800, 100.0);
        let con = spectral_connectivity(
            &data,
            ConnectivityMetric::Coh,
            100.0,
            15.0,
            26.0,
            SpectralMode::CwtMorlet,
            TrialAggregation::Mean,
        )
        .unwrap();
        assert!(con[[1, 0]] > con[[2, 1]]);
    }

    #[test]
    fn conmat_roundtrip_with_mat_export() {
        let dir = tempfile::tempdir().unwrap();
        let m = Array2::from_shape_fn((3, 3), |(i, j)| if i > j { 0.5 } else { 0.0 });
        let path = write_conmat(&m, dir.path(), 0, ConnectivityMetric::Coh, true).unwrap();
        assert!(path.to_str().unwrap().ends_with("conmat_0_coh.safetensors"));
        assert!(path.with_extension("mat").exists());
        let back = load_conmat(&path).unwrap();
        approx::assert_abs_diff_eq!(back[[2, 1]], 0.5);
    }

    #[test]
    fn per_trial_matrices_average_to_the_mean() {
        let dir = tempfile::tempdir().unwrap();
        let data = coupled_trials(4, 3, 1000, 200.0);
        let per_trial = spectral_connectivity_trials(
            &data,
            ConnectivityMetric::Coh,
            200.0,
            15.0,
            25.0,
            SpectralMode::Multitaper,
        )
        .unwrap();
        assert_eq!(per_trial.shape(), &[4, 3, 3]);
        let mean = spectral_connectivity(
            &data,
            ConnectivityMetric::Coh,
            200.0,
            15.0,
            25.0,
            SpectralMode::Multitaper,
            TrialAggregation::Mean,
        )
        .unwrap();
        approx::assert_abs_diff_eq!(
            per_trial.mean_axis(Axis(0)).unwrap()[[1, 0]],
            mean[[1, 0]],
            epsilon = 1e-12
        );

        let files =
            write_multi_conmat(&per_trial, dir.path(), 2, ConnectivityMetric::Coh, false).unwrap();
        assert_eq!(files.len(), 4);
        assert!(files[3].to_str().unwrap().ends_with("conmat_2_coh_trial_3.safetensors"));
        let back = load_conmat(&files[0]).unwrap();
        approx::assert_abs_diff_eq!(back[[1, 0]], per_trial[[0, 1, 0]], epsilon = 1e-12);
    }

    #[test]
    fn bad_frequency_range_is_config_error() {
        let data = coupled_trials(1, 2, 500, 100.0);
        assert!(spectral_connectivity(
            &data,
            ConnectivityMetric::Coh,
            100.0,
            40.0,
            30.0,
            SpectralMode::Multitaper,
            TrialAggregation::Mean,
        )
        .is_err());
    }
}
