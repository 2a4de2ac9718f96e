//! FastICA decomposition and cardiac / ocular component rejection.
//!
//! The decomposition whitens the picked channels by PCA, runs symmetric
//! FastICA with the tanh contrast, and scores each component against the
//! ECG and EOG traces. Components crossing the score thresholds are marked
//! in `exclude` (at most [`N_MAX_ECG`] cardiac and [`N_MAX_EOG`] ocular).
//!
//! When the recording has no ECG channel a surrogate is synthesised from
//! the average of the MEG channels band-passed to the cardiac band; a
//! missing EOG channel skips ocular scoring entirely.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::io::raw::{ChannelKind, RawBundle};
use crate::io::tensor::{TensorFile, TensorWriter};
use crate::linalg::{inv_sqrt_sym, sym_eig};
use crate::preproc::filter::{design_band, filter_1d};
use crate::util::split_filename;

/// Cardiac components rejected at most.
pub const N_MAX_ECG: usize = 3;
/// Ocular components rejected at most.
pub const N_MAX_EOG: usize = 2;
/// Absolute correlation above which a component counts as cardiac.
pub const ECG_THRESHOLD: f64 = 0.25;
/// Z-score above which a component counts as ocular.
pub const EOG_THRESHOLD: f64 = 3.0;

const MAX_ITER: usize = 200;
const TOL: f64 = 1e-6;

// ── Decomposition ─────────────────────────────────────────────────────────

/// A fitted ICA: unmixing/mixing pair, channel means, rejected components
/// and the artifact scores that selected them.
#[derive(Debug, Clone)]
pub struct IcaDecomposition {
    /// [K, C]: sources = unmixing · (data - mean).
    pub unmixing: Array2<f64>,
    /// [C, K]: pseudo-inverse of `unmixing`.
    pub mixing: Array2<f64>,
    /// Per-channel mean removed before unmixing.
    pub mean: Array1<f64>,
    /// Component indices zeroed on reconstruction, sorted.
    pub exclude: Vec<usize>,
    /// |correlation| of each component with the cardiac trace.
    pub ecg_scores: Vec<f64>,
    /// Correlation z-score of each component with the ocular trace
    /// (empty when the recording has no EOG channel).
    pub eog_scores: Vec<f64>,
}

impl IcaDecomposition {
    pub fn n_components(&self) -> usize {
        self.unmixing.nrows()
    }

    /// Component time series of `data` ([C, T]) → [K, T].
    pub fn sources(&self, data: &Array2<f64>) -> Array2<f64> {
        let centered = data - &self.mean.view().insert_axis(Axis(1));
        self.unmixing.dot(&centered)
    }

    /// Reconstruct `data` with the excluded components removed.
    pub fn apply(&self, data: &Array2<f64>) -> Array2<f64> {
        let mut sources = self.sources(data);
        for &k in &self.exclude {
            sources.row_mut(k).fill(0.0);
        }
        self.mixing.dot(&sources) + &self.mean.view().insert_axis(Axis(1))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = TensorWriter::new();
        w.add_arr2_f64("unmixing", &self.unmixing);
        w.add_arr2_f64("mixing", &self.mixing);
        w.add_arr1_f64("mean", &self.mean);
        let exclude: Vec<i32> = self.exclude.iter().map(|&v| v as i32).collect();
        w.add_i32("exclude", &exclude, &[exclude.len()]);
        w.add_f64("ecg_scores", &self.ecg_scores, &[self.ecg_scores.len()]);
        w.add_f64("eog_scores", &self.eog_scores, &[self.eog_scores.len()]);
        w.write(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = TensorFile::open(path)?;
        let unmixing = f.arr2_f64("unmixing")?;
        let mixing = f.arr2_f64("mixing")?;
        let mean = f.arr1_f64("mean")?;
        let exclude: Vec<usize> = f.i32_vec("exclude")?.iter().map(|&v| v as usize).collect();
        let ecg_scores = f.f64_vec("ecg_scores")?;
        let eog_scores = f.f64_vec("eog_scores")?;
        Ok(IcaDecomposition { unmixing, mixing, mean, exclude, ecg_scores, eog_scores })
    }
}

/// Fit FastICA on `data` ([C, T]), keeping either a fixed component count or
/// enough PCA components to explain the given variance fraction.
#[derive(Debug, Clone, Copy)]
pub enum ComponentCount {
    Fixed(usize),
    /// Fraction of variance in (0, 1].
    Variance(f64),
}

pub fn fit_ica(data: &Array2<f64>, n_components: ComponentCount) -> Result<IcaDecomposition> {
    let (n_ch, n_t) = data.dim();
    if n_t < 2 * n_ch {
        return Err(PipelineError::shape(format!(
            "{n_t} samples is too short to decompose {n_ch} channels"
        )));
    }

    let mean = data.mean_axis(Axis(1)).context("empty data")?;
    let centered = data - &mean.view().insert_axis(Axis(1));

    // PCA whitening.
    let cov = centered.dot(&centered.t()) / (n_t as f64 - 1.0);
    let (vals, vecs) = sym_eig(&cov)?;

    let k = match n_components {
        ComponentCount::Fixed(k) => {
            if k == 0 || k > n_ch {
                return Err(PipelineError::config(format!(
                    "cannot keep {k} components of {n_ch} channels"
                )));
            }
            k
        }
        ComponentCount::Variance(frac) => {
            if !(0.0..=1.0).contains(&frac) || frac == 0.0 {
                return Err(PipelineError::config(format!(
                    "variance fraction {frac} outside (0, 1]"
                )));
            }
            let total: f64 = vals.iter().filter(|&&v| v > 0.0).sum();
            let mut acc = 0.0;
            let mut k = n_ch;
            for (i, &v) in vals.iter().enumerate() {
                acc += v.max(0.0);
                if acc >= frac * total {
                    k = i + 1;
                    break;
                }
            }
            k
        }
    };

    // Near-rank-deficient data is valid input; keep only the components the
    // covariance can support.
    let tol = vals.first().copied().unwrap_or(0.0).max(0.0) * 1e-12;
    let rank = vals.iter().take_while(|&&v| v > tol).count();
    if rank == 0 {
        return Err(PipelineError::shape("data has no variance to decompose"));
    }
    let k = if k > rank {
        warn!(requested = k, rank, "component count clamped to the covariance rank");
        rank
    } else {
        k
    };

    let mut whitener = Array2::<f64>::zeros((k, n_ch));
    for row in 0..k {
        let w = 1.0 / vals[row].sqrt();
        for col in 0..n_ch {
            whitener[[row, col]] = vecs[[col, row]] * w;
        }
    }
    let z = whitener.dot(&centered); // [K, T]

    // Symmetric FastICA, tanh contrast, deterministic start.
    let mut w = initial_rotation(k);
    w = inv_sqrt_sym(&w.dot(&w.t()))?.dot(&w);
    for _iter in 0..MAX_ITER {
        let wx = w.dot(&z); // [K, T]
        let g = wx.mapv(f64::tanh);
        let g_prime_mean: Vec<f64> = (0..k)
            .map(|i| g.row(i).iter().map(|&v| 1.0 - v * v).sum::<f64>() / n_t as f64)
            .collect();

        let mut w_new = g.dot(&z.t()) / n_t as f64;
        for i in 0..k {
            for j in 0..k {
                w_new[[i, j]] -= g_prime_mean[i] * w[[i, j]];
            }
        }
        w_new = inv_sqrt_sym(&w_new.dot(&w_new.t()))?.dot(&w_new);

        let delta = w_new
            .dot(&w.t())
            .diag()
            .iter()
            .map(|&d| (d.abs() - 1.0).abs())
            .fold(0.0_f64, f64::max);
        w = w_new;
        if delta < TOL {
            break;
        }
    }

    let unmixing = w.dot(&whitener); // [K, C]

    // mixing = pinv(unmixing) = E_k D_k^{1/2} Wᵀ.
    let mut color = Array2::<f64>::zeros((n_ch, k));
    for col in 0..k {
        let s = vals[col].sqrt();
        for row in 0..n_ch {
            color[[row, col]] = vecs[[row, col]] * s;
        }
    }
    let mixing = color.dot(&w.t());

    Ok(IcaDecomposition {
        unmixing,
        mixing,
        mean,
        exclude: Vec::new(),
        ecg_scores: Vec::new(),
        eog_scores: Vec::new(),
    })
}

/// Deterministic full-rank starting rotation (xorshift-filled, fixed seed).
fn initial_rotation(k: usize) -> Array2<f64> {
    let mut state = 0x9e3779b97f4a7c15_u64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
    };
    let mut w = Array2::<f64>::zeros((k, k));
    for i in 0..k {
        for j in 0..k {
            w[[i, j]] = next();
        }
        w[[i, i]] += 1.0;
    }
    w
}

// ── Artifact scoring ──────────────────────────────────────────────────────

/// Score components against cardiac and ocular traces and fill `exclude`.
///
/// Returns the name of the ECG channel used, or `None` when a surrogate was
/// synthesised from the MEG average.
pub fn score_artifacts(
    ica: &mut IcaDecomposition,
    raw: &RawBundle,
    picks: &[usize],
) -> Result<Option<String>> {
    let picked = raw.pick_channels(picks);
    let sources = ica.sources(&picked.data);
    let k = ica.n_components();
    let sfreq = raw.sfreq;

    // Cardiac trace: the ECG channel, or a surrogate from the MEG average.
    let ecg_idx = raw.picks(|kind| kind == ChannelKind::Ecg);
    let (ecg_trace, ecg_name) = match ecg_idx.first() {
        Some(&i) => (raw.data.row(i).to_vec(), Some(raw.channels[i].name.clone())),
        None => {
            warn!("no ECG channel, synthesising a cardiac trace from the MEG average");
            let meg = raw.meg_picks();
            if meg.is_empty() {
                bail!("cannot synthesise an ECG trace without MEG channels");
            }
            let mut avg = vec![0.0; raw.n_samples()];
            for &i in &meg {
                for (a, &v) in avg.iter_mut().zip(raw.data.row(i)) {
                    *a += v;
                }
            }
            for a in &mut avg {
                *a /= meg.len() as f64;
            }
            (avg, None)
        }
    };

    // Cardiac band 8-16 Hz.
    let cardiac = band_limited(&ecg_trace, 8.0, 16.0, sfreq)?;
    let mut ecg_scores = Vec::with_capacity(k);
    for c in 0..k {
        let src = band_limited(&sources.row(c).to_vec(), 8.0, 16.0, sfreq)?;
        ecg_scores.push(pearson(&src, &cardiac).abs());
    }

    let mut cardiac_hits: Vec<usize> = (0..k).filter(|&c| ecg_scores[c] > ECG_THRESHOLD).collect();
    cardiac_hits.sort_by(|&a, &b| {
        ecg_scores[b].partial_cmp(&ecg_scores[a]).unwrap_or(std::cmp::Ordering::Equal)
    });
    cardiac_hits.truncate(N_MAX_ECG);

    // Ocular trace: skip scoring when absent.
    let eog_idx = raw.picks(|kind| kind == ChannelKind::Eog);
    let mut eog_scores = Vec::new();
    let mut ocular_hits: Vec<usize> = Vec::new();
    if let Some(&i) = eog_idx.first() {
        let ocular = band_limited(&raw.data.row(i).to_vec(), 1.0, 10.0, sfreq)?;
        let mut corrs = Vec::with_capacity(k);
        for c in 0..k {
            let src = band_limited(&sources.row(c).to_vec(), 1.0, 10.0, sfreq)?;
            corrs.push(pearson(&src, &ocular));
        }
        let m = corrs.iter().sum::<f64>() / k as f64;
        let sd = (corrs.iter().map(|&v| (v - m) * (v - m)).sum::<f64>() / k as f64).sqrt();
        eog_scores = corrs.iter().map(|&v| if sd > 0.0 { (v - m).abs() / sd } else { 0.0 }).collect();
        ocular_hits = (0..k).filter(|&c| eog_scores[c] > EOG_THRESHOLD).collect();
        ocular_hits.sort_by(|&a, &b| {
            eog_scores[b].partial_cmp(&eog_scores[a]).unwrap_or(std::cmp::Ordering::Equal)
        });
        ocular_hits.truncate(N_MAX_EOG);
    } else {
        info!("no EOG channel, skipping ocular scoring");
    }

    let mut exclude: Vec<usize> = cardiac_hits;
    for c in ocular_hits {
        if !exclude.contains(&c) {
            exclude.push(c);
        }
    }
    exclude.sort_unstable();

    ica.ecg_scores = ecg_scores;
    ica.eog_scores = eog_scores;
    ica.exclude = exclude;
    Ok(ecg_name)
}

fn band_limited(x: &[f64], lo: f64, hi: f64, sfreq: f64) -> Result<Vec<f64>> {
    let hi = hi.min(sfreq / 2.0 - 1.0);
    if hi <= lo {
        return Ok(x.to_vec());
    }
    let h = design_band(Some(lo), Some(hi), sfreq)?;
    filter_1d(x, &h)
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let ma = a[..n].iter().sum::<f64>() / n as f64;
    let mb = b[..n].iter().sum::<f64>() / n as f64;
    let mut num = 0.0;
    let mut da = 0.0;
    let mut db = 0.0;
    for i in 0..n {
        let xa = a[i] - ma;
        let xb = b[i] - mb;
        num += xa * xb;
        da += xa * xa;
        db += xb * xb;
    }
    if da == 0.0 || db == 0.0 {
        0.0
    } else {
        num / (da * db).sqrt()
    }
}

// ── Manual exclusion overrides ────────────────────────────────────────────

/// Reviewer-supplied component rejections, keyed by subject then session.
///
/// A `(subject, session)` hit replaces the automatic selection outright; a
/// subject entry with no matching session keeps the automatic selection and
/// logs the miss.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExclusionOverrides(pub BTreeMap<String, BTreeMap<String, Vec<usize>>>);

impl ExclusionOverrides {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply any override for `(subject, session)` to `ica.exclude`.
    pub fn apply(&self, ica: &mut IcaDecomposition, subject: &str, session: &str) {
        match self.0.get(subject) {
            Some(sessions) => match sessions.get(session) {
                Some(components) => {
                    let mut list = components.clone();
                    list.sort_unstable();
                    list.dedup();
                    info!(subject, session, ?list, "replacing automatic rejections");
                    ica.exclude = list;
                }
                None => {
                    warn!(
                        subject,
                        session, "override entry has no session match, keeping automatic rejections"
                    );
                }
            },
            None => {}
        }
    }
}

// ── Solution discovery ────────────────────────────────────────────────────

/// Locate a previously fitted solution for `raw_file`.
///
/// Looks next to the recording and in a sibling `ica/` directory, trying the
/// recording's stem with the usual preprocessing suffixes appended.
pub fn find_solution_file(raw_file: &Path) -> Result<PathBuf> {
    let (dir, base, _) = split_filename(raw_file);
    let mut dirs = vec![dir.clone()];
    if let Some(parent) = dir.parent() {
        dirs.push(parent.join("ica"));
    }
    let stems = [
        base.clone(),
        format!("{base}_ica"),
        format!("{base}_filt_ica"),
        format!("{base}_filt_dsamp_ica"),
    ];
    for d in &dirs {
        for stem in &stems {
            let candidate = d.join(format!("{stem}_solution.safetensors"));
            if candidate.is_file() {
                return Ok(candidate);
            }
            let candidate = d.join(format!("{stem}_ica_solution.safetensors"));
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(PipelineError::missing_cache(format!(
        "no fitted solution found for {}",
        raw_file.display()
    )))
}
