//! Power spectral density on sensor and source signals.
//!
//! Welch averages modified periodograms over Hamming-windowed segments;
//! the multitaper path uses sine tapers. Both return one-sided densities
//! restricted to the closed `[fmin, fmax]` interval.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, Axis};
use plotters::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use tracing::info;

use crate::config::PsdMethod;
use crate::error::PipelineError;
use crate::io::raw::{EpochsBundle, RawBundle};
use crate::io::tensor::{TensorFile, TensorWriter};
use crate::util::split_filename;

pub const DEFAULT_N_FFT: usize = 256;
pub const DEFAULT_OVERLAP: f64 = 0.5;
const N_SINE_TAPERS: usize = 4;

/// Per-channel one-sided spectra [C, F] with their frequency grid.
#[derive(Debug, Clone)]
pub struct Psd {
    pub psds: Array2<f64>,
    pub freqs: Vec<f64>,
}

impl Psd {
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = TensorWriter::new();
        w.add_arr2_f64("psds", &self.psds);
        w.add_f64("freqs", &self.freqs, &[self.freqs.len()]);
        w.write(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = TensorFile::open(path)?;
        Ok(Psd { psds: f.arr2_f64("psds")?, freqs: f.f64_vec("freqs")? })
    }
}

/// `<base>-psds.safetensors` next to the input file's stem.
pub fn psd_file(out_dir: &Path, base: &str) -> PathBuf {
    out_dir.join(format!("{base}-psds.safetensors"))
}

fn hamming(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * std::f64::consts::PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

fn sine_taper(k: usize, n: usize) -> Vec<f64> {
    let norm = (2.0 / (n as f64 + 1.0)).sqrt();
    (0..n)
        .map(|t| {
            norm * (std::f64::consts::PI * (k + 1) as f64 * (t + 1) as f64 / (n as f64 + 1.0))
                .sin()
        })
        .collect()
}

/// One-sided periodogram of `x` under `window`, scaled to density.
fn periodogram(
    x: &[f64],
    window: &[f64],
    sfreq: f64,
    planner: &mut FftPlanner<f64>,
) -> Vec<f64> {
    let n = window.len();
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .zip(window)
        .map(|(&v, &w)| Complex { re: v * w, im: 0.0 })
        .collect();
    planner.plan_fft_forward(n).process(&mut buf);
    let w_norm: f64 = window.iter().map(|w| w * w).sum();
    let scale = 1.0 / (sfreq * w_norm);
    let n_freq = n / 2 + 1;
    (0..n_freq)
        .map(|f| {
            let p = buf[f].norm_sqr() * scale;
            // Interior bins carry the mirrored negative frequencies.
            if f == 0 || (n % 2 == 0 && f == n_freq - 1) {
                p
            } else {
                2.0 * p
            }
        })
        .collect()
}

/// Welch PSD over `[fmin, fmax]` of a `[C, T]` array.
///
/// `nperseg` is clipped to the signal length, `overlap` is the fraction of
/// a segment shared with its successor.
pub fn welch_psd(
    data: &Array2<f64>,
    sfreq: f64,
    fmin: f64,
    fmax: f64,
    nperseg: usize,
    overlap: f64,
) -> Result<Psd> {
    if fmin < 0.0 || fmax <= fmin {
        return Err(PipelineError::config(format!("bad frequency range [{fmin}, {fmax}]")));
    }
    let n_t = data.ncols();
    let nperseg = nperseg.min(n_t).max(8);
    if n_t < nperseg {
        return Err(PipelineError::shape(format!(
            "{n_t} samples is shorter than one {nperseg}-sample segment"
        )));
    }
    let step = ((nperseg as f64 * (1.0 - overlap)).round() as usize).max(1);
    let window = hamming(nperseg);
    let mut planner: FftPlanner<f64> = FftPlanner::new();

    let n_freq = nperseg / 2 + 1;
    let mut full = Array2::<f64>::zeros((data.nrows(), n_freq));
    for (c, row) in data.axis_iter(Axis(0)).enumerate() {
        let x = row.to_vec();
        let mut acc = vec![0.0f64; n_freq];
        let mut n_seg = 0usize;
        let mut start = 0usize;
        while start + nperseg <= n_t {
            let p = periodogram(&x[start..start + nperseg], &window, sfreq, &mut planner);
            for (a, v) in acc.iter_mut().zip(&p) {
                *a += v;
            }
            n_seg += 1;
            start += step;
        }
        for (f, a) in acc.iter().enumerate() {
            full[[c, f]] = a / n_seg as f64;
        }
    }
    restrict(full, sfreq, nperseg, fmin, fmax)
}

/// Sine-multitaper PSD over `[fmin, fmax]` of a `[C, T]` array.
pub fn multitaper_psd(data: &Array2<f64>, sfreq: f64, fmin: f64, fmax: f64) -> Result<Psd> {
    if fmin < 0.0 || fmax <= fmin {
        return Err(PipelineError::config(format!("bad frequency range [{fmin}, {fmax}]")));
    }
    let n_t = data.ncols();
    let tapers: Vec<Vec<f64>> = (0..N_SINE_TAPERS).map(|k| sine_taper(k, n_t)).collect();
    let mut planner: FftPlanner<f64> = FftPlanner::new();
    let n_freq = n_t / 2 + 1;
    let mut full = Array2::<f64>::zeros((data.nrows(), n_freq));
    for (c, row) in data.axis_iter(Axis(0)).enumerate() {
        let x = row.to_vec();
        for taper in &tapers {
            let p = periodogram(&x, taper, sfreq, &mut planner);
            for (f, v) in p.iter().enumerate() {
                full[[c, f]] += v / N_SINE_TAPERS as f64;
            }
        }
    }
    restrict(full, sfreq, n_t, fmin, fmax)
}

fn restrict(full: Array2<f64>, sfreq: f64, n_fft: usize, fmin: f64, fmax: f64) -> Result<Psd> {
    let df = sfreq / n_fft as f64;
    let keep: Vec<usize> = (0..full.ncols())
        .filter(|&f| {
            let hz = f as f64 * df;
            hz >= fmin && hz <= fmax
        })
        .collect();
    if keep.is_empty() {
        return Err(PipelineError::config(format!(
            "no frequency bins inside [{fmin}, {fmax}] at a resolution of {df} Hz"
        )));
    }
    let freqs: Vec<f64> = keep.iter().map(|&f| f as f64 * df).collect();
    let mut psds = Array2::zeros((full.nrows(), keep.len()));
    for c in 0..full.nrows() {
        for (j, &f) in keep.iter().enumerate() {
            psds[[c, j]] = full[[c, f]];
        }
    }
    Ok(Psd { psds, freqs })
}

/// PSD of the MEG channels of a recording (or the epoch-averaged PSD of an
/// epoched file). Writes `<base>-psds.safetensors` and a summary figure.
pub fn sensor_psd(
    data_file: &Path,
    out_dir: &Path,
    fmin: f64,
    fmax: f64,
    method: PsdMethod,
    is_epoched: bool,
) -> Result<PathBuf> {
    let (psd, base) = if is_epoched {
        let epochs = EpochsBundle::load(data_file)?;
        let picks = epochs.meg_picks();
        let mut acc: Option<Psd> = None;
        for e in 0..epochs.n_epochs() {
            let trial = epochs.data.index_axis(Axis(0), e);
            let meg = Array2::from_shape_fn((picks.len(), trial.ncols()), |(i, t)| {
                trial[[picks[i], t]]
            });
            let p = compute(&meg, epochs.sfreq, fmin, fmax, method)?;
            acc = Some(match acc {
                None => p,
                Some(mut a) => {
                    a.psds += &p.psds;
                    a
                }
            });
        }
        let mut psd = acc.context("epoched file holds no trials")?;
        psd.psds /= epochs.n_epochs() as f64;
        let (_, base, _) = split_filename(data_file);
        (psd, base)
    } else {
        let raw = RawBundle::load(data_file)?;
        let meg = raw.pick_channels(&raw.meg_picks());
        let psd = compute(&meg.data, raw.sfreq, fmin, fmax, method)?;
        let (_, base, _) = split_filename(data_file);
        (psd, base)
    };

    let out = psd_file(out_dir, &base);
    psd.save(&out)?;
    plot_psd(&psd, &out.with_extension("png"))?;
    info!(file = %out.display(), n_freqs = psd.freqs.len(), "sensor PSD written");
    Ok(out)
}

fn compute(data: &Array2<f64>, sfreq: f64, fmin: f64, fmax: f64, method: PsdMethod) -> Result<Psd> {
    match method {
        PsdMethod::Welch => {
            welch_psd(data, sfreq, fmin, fmax, DEFAULT_N_FFT, DEFAULT_OVERLAP)
        }
        PsdMethod::Multitaper => multitaper_psd(data, sfreq, fmin, fmax),
    }
}

/// Welch PSD of a source-level tensor file (region or vertex time series).
///
/// A 3-D tensor with a leading singleton axis is squeezed to 2-D.
pub fn source_psd(
    data_file: &Path,
    out_dir: &Path,
    sfreq: f64,
    fmin: f64,
    fmax: f64,
    n_fft: usize,
    overlap: f64,
) -> Result<PathBuf> {
    let data = load_source_ts(data_file)?;
    let psd = welch_psd(&data, sfreq, fmin, fmax, n_fft, overlap)?;
    let (_, base, _) = split_filename(data_file);
    let out = psd_file(out_dir, &base);
    psd.save(&out)?;
    plot_psd(&psd, &out.with_extension("png"))?;
    info!(file = %out.display(), n_rows = data.nrows(), "source PSD written");
    Ok(out)
}

/// Load the first recognized time-series key of a tensor file as `[N, T]`.
pub fn load_source_ts(path: &Path) -> Result<Array2<f64>> {
    let f = TensorFile::open(path)?;
    for key in ["roi_ts", "ts", "stc_data", "data"] {
        if !f.contains(key) {
            continue;
        }
        let shape = f.shape(key)?;
        return match shape.len() {
            2 => f.arr2_f64(key),
            3 if shape[0] == 1 => {
                let a = f.arr3_f64(key)?;
                Ok(a.index_axis(Axis(0), 0).to_owned())
            }
            _ => Err(PipelineError::shape(format!(
                "`{key}` in {} has shape {shape:?}, expected [N, T]",
                path.display()
            ))),
        };
    }
    Err(PipelineError::config(format!(
        "{} holds no recognized time-series tensor",
        path.display()
    )))
}

/// Mean power in dB with a one-standard-deviation band across channels.
fn plot_psd(psd: &Psd, path: &Path) -> Result<()> {
    let n_f = psd.freqs.len();
    let db = psd.psds.mapv(|v| 10.0 * (v.max(1e-30)).log10());
    let mean: Vec<f64> = (0..n_f).map(|f| db.column(f).mean().unwrap_or(0.0)).collect();
    let std: Vec<f64> = (0..n_f)
        .map(|f| {
            let col = db.column(f);
            let m = mean[f];
            (col.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / col.len() as f64).sqrt()
        })
        .collect();

    let y_lo = mean
        .iter()
        .zip(&std)
        .map(|(m, s)| m - s)
        .fold(f64::INFINITY, f64::min);
    let y_hi = mean
        .iter()
        .zip(&std)
        .map(|(m, s)| m + s)
        .fold(f64::NEG_INFINITY, f64::max);

    let root = BitMapBackend::new(path, (900, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut chart = ChartBuilder::on(&root)
        .caption("power spectral density", ("sans-serif", 20))
        .margin(10)
        .x_label_area_size(35)
        .y_label_area_size(50)
        .build_cartesian_2d(psd.freqs[0]..psd.freqs[n_f - 1], (y_lo - 1.0)..(y_hi + 1.0))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    chart
        .configure_mesh()
        .x_desc("frequency (Hz)")
        .y_desc("power (dB)")
        .draw()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let band: Vec<(f64, f64)> = psd
        .freqs
        .iter()
        .zip(mean.iter().zip(&std))
        .map(|(&f, (m, s))| (f, m + s))
        .chain(
            psd.freqs
                .iter()
                .zip(mean.iter().zip(&std))
                .rev()
                .map(|(&f, (m, s))| (f, m - s)),
        )
        .collect();
    chart
        .draw_series(std::iter::once(Polygon::new(band, BLUE.mix(0.15))))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    chart
        .draw_series(LineSeries::new(
            psd.freqs.iter().zip(&mean).map(|(&f, &m)| (f, m)),
            &BLUE,
        ))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    root.present().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}
