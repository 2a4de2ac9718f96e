//! Noise covariance: estimation from empty-room recordings and the
//! fallback chain that picks the matrix used by the inverse operator.
//!
//! Resolution order:
//!   1. an existing covariance file matching the caller's pattern,
//!   2. a covariance computed from an empty-room recording,
//!   3. an identity matrix (flagged as such in the file), only when the
//!      caller allows the fallback; otherwise the chain is fatal.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, Axis};
use tracing::info;

use crate::error::PipelineError;
use crate::io::ctf::convert_ds_to_raw;
use crate::io::raw::{EpochsBundle, RawBundle};
use crate::io::tensor::{TensorFile, TensorWriter};
use crate::util::{find_matches, split_filename};

/// Channel-space noise covariance.
#[derive(Debug, Clone)]
pub struct NoiseCovariance {
    /// [C, C], ordered like `ch_names`.
    pub data: Array2<f64>,
    pub ch_names: Vec<String>,
    /// True when no noise recording was available.
    pub is_identity: bool,
}

impl NoiseCovariance {
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = TensorWriter::new();
        w.add_arr2_f64("data", &self.data);
        w.add_str_list("ch_names", &self.ch_names);
        w.add_scalar_f64("is_identity", if self.is_identity { 1.0 } else { 0.0 });
        w.write(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = TensorFile::open(path)?;
        Ok(NoiseCovariance {
            data: f.arr2_f64("data")?,
            ch_names: f.str_list("ch_names")?,
            is_identity: f.scalar_f64("is_identity")? != 0.0,
        })
    }

    /// Restrict to the named channels, in their order.
    pub fn pick(&self, names: &[String]) -> Result<NoiseCovariance> {
        let idx: Vec<usize> = names
            .iter()
            .map(|n| {
                self.ch_names
                    .iter()
                    .position(|c| c == n)
                    .with_context(|| format!("channel `{n}` missing from the covariance"))
            })
            .collect::<Result<_>>()?;
        let n = idx.len();
        let mut data = Array2::zeros((n, n));
        for (i, &a) in idx.iter().enumerate() {
            for (j, &b) in idx.iter().enumerate() {
                data[[i, j]] = self.data[[a, b]];
            }
        }
        Ok(NoiseCovariance { data, ch_names: names.to_vec(), is_identity: self.is_identity })
    }
}

/// Sample covariance of the MEG channels of a recording.
pub fn compute_covariance(raw: &RawBundle) -> Result<NoiseCovariance> {
    let picks = raw.meg_picks();
    let sel = raw.pick_channels(&picks);
    let n_t = sel.data.ncols();
    let mean = sel.data.mean_axis(Axis(1)).context("empty recording")?;
    let centered = &sel.data - &mean.view().insert_axis(Axis(1));
    let data = centered.dot(&centered.t()) / (n_t as f64 - 1.0);
    Ok(NoiseCovariance { data, ch_names: sel.ch_names(), is_identity: false })
}

/// Covariance of the pre-stimulus interval of epoched data, pooled over
/// trials. Falls back to the whole trial when there is no pre-stimulus
/// part.
pub fn baseline_covariance(epochs: &EpochsBundle) -> Result<NoiseCovariance> {
    let picks = epochs.meg_picks();
    if picks.is_empty() {
        return Err(PipelineError::config("epochs hold no MEG channels".to_string()));
    }
    let n_t = epochs.n_samples();
    let n_pre = if epochs.tmin < 0.0 {
        (((-epochs.tmin) * epochs.sfreq).round() as usize + 1).min(n_t)
    } else {
        n_t
    };
    let n_e = epochs.n_epochs();
    if n_e == 0 || n_pre < 2 {
        return Err(PipelineError::shape(format!(
            "{n_e} trials with a {n_pre}-sample baseline cannot estimate a covariance"
        )));
    }

    let n_ch = picks.len();
    let total = n_e * n_pre;
    let mut pooled = Array2::<f64>::zeros((n_ch, total));
    for e in 0..n_e {
        for (row, &c) in picks.iter().enumerate() {
            for t in 0..n_pre {
                pooled[[row, e * n_pre + t]] = epochs.data[[e, c, t]];
            }
        }
    }
    let mean = pooled.mean_axis(Axis(1)).context("empty baseline")?;
    let centered = &pooled - &mean.view().insert_axis(Axis(1));
    let data = centered.dot(&centered.t()) / (total as f64 - 1.0);
    let names: Vec<String> = picks.iter().map(|&i| epochs.channels[i].name.clone()).collect();
    Ok(NoiseCovariance { data, ch_names: names, is_identity: false })
}

/// Identity covariance over the MEG channels of `raw`.
pub fn identity_covariance(raw: &RawBundle) -> NoiseCovariance {
    let picks = raw.meg_picks();
    let names: Vec<String> = picks.iter().map(|&i| raw.channels[i].name.clone()).collect();
    NoiseCovariance {
        data: Array2::eye(names.len()),
        ch_names: names,
        is_identity: true,
    }
}

/// Walk the fallback chain and return the path of the covariance to use.
///
/// `cov_pattern` is a wildcard matched inside `data_dir` (matches must
/// contain `cov`); `er_file` is an empty-room recording, either serialized
/// or a `.ds` dataset directory. With `allow_identity` false, a chain that
/// reaches the end fails instead of writing an identity matrix.
pub fn resolve_noise_cov(
    raw: &RawBundle,
    data_dir: &Path,
    cov_pattern: Option<&str>,
    er_file: Option<&Path>,
    out_dir: &Path,
    allow_identity: bool,
) -> Result<PathBuf> {
    if let Some(pattern) = cov_pattern {
        let matches: Vec<PathBuf> = find_matches(data_dir, pattern)?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.contains("cov"))
                    .unwrap_or(false)
            })
            .collect();
        if let Some(found) = matches.first() {
            info!(file = %found.display(), "using existing noise covariance");
            return Ok(found.clone());
        }
    }

    if let Some(er) = er_file {
        let er_raw_file = if er.is_dir() {
            convert_ds_to_raw(er, out_dir)?
        } else {
            er.to_path_buf()
        };
        let er_raw = RawBundle::load(&er_raw_file)?;
        let cov = compute_covariance(&er_raw)?;
        let (_, base, _) = split_filename(&er_raw_file);
        let out = out_dir.join(format!("{base}-cov.safetensors"));
        cov.save(&out)?;
        info!(file = %out.display(), "noise covariance from the empty room");
        return Ok(out);
    }

    if !allow_identity {
        return Err(PipelineError::config(
            "no noise covariance found and the identity fallback is disabled",
        ));
    }
    let cov = identity_covariance(raw);
    let out = out_dir.join("identity_noise-cov.safetensors");
    cov.save(&out)?;
    info!("no noise recording, writing an identity covariance");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raw::{ChannelKind, SensorChannel};

    fn toy_raw(n_t: usize) -> RawBundle {
        let channels = vec![
            SensorChannel { name: "MEG 001".into(), kind: ChannelKind::Magnetometer, pos: [0.1, 0.0, 0.1] },
            SensorChannel { name: "MEG 002".into(), kind: ChannelKind::Gradiometer, pos: [0.0, 0.1, 0.1] },
            SensorChannel { name: "EOG 061".into(), kind: ChannelKind::Eog, pos: [0.0; 3] },
        ];
        let data = Array2::from_shape_fn((3, n_t), |(c, t)| {
            ((c + 1) as f64 * t as f64 * 0.013).sin()
        });
        RawBundle { channels, data, sfreq: 300.0, bads: vec![] }
    }

    #[test]
    fn covariance_is_meg_only_and_symmetric() {
        let cov = compute_covariance(&toy_raw(2000)).unwrap();
        assert_eq!(cov.ch_names, vec!["MEG 001", "MEG 002"]);
        assert_eq!(cov.data.shape(), &[2, 2]);
        approx::assert_abs_diff_eq!(cov.data[[0, 1]], cov.data[[1, 0]], epsilon = 1e-12);
        assert!(cov.data[[0, 0]] > 0.0);
        assert!(!cov.is_identity);
    }

    #[test]
    fn chain_prefers_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = toy_raw(500);
        let existing = dir.path().join("sub-01_noise-cov.safetensors");
        identity_covariance(&raw).save(&existing).unwrap();

        let out =
            resolve_noise_cov(&raw, dir.path(), Some("*cov*"), None, dir.path(), true).unwrap();
        assert_eq!(out, existing);
    }

    #[test]
    fn chain_computes_from_empty_room() {
        let dir = tempfile::tempdir().unwrap();
        let raw = toy_raw(500);
        let er_file = dir.path().join("er_raw.safetensors");
        toy_raw(1500).save(&er_file).unwrap();

        let out =
            resolve_noise_cov(&raw, dir.path(), None, Some(&er_file), dir.path(), false).unwrap();
        assert!(out.to_str().unwrap().ends_with("er_raw-cov.safetensors"));
        let cov = NoiseCovariance::load(&out).unwrap();
        assert!(!cov.is_identity);
        assert_eq!(cov.data.shape(), &[2, 2]);
    }

    #[test]
    fn chain_falls_back_to_identity() {
        let dir = tempfile::tempdir().unwrap();
        let raw = toy_raw(500);
        let out = resolve_noise_cov(&raw, dir.path(), None, None, dir.path(), true).unwrap();
        assert!(out.ends_with("identity_noise-cov.safetensors"));
        let cov = NoiseCovariance::load(&out).unwrap();
        assert!(cov.is_identity);
        approx::assert_abs_diff_eq!(cov.data[[0, 0]], 1.0);
        approx::assert_abs_diff_eq!(cov.data[[0, 1]], 0.0);
    }

    #[test]
    fn exhausted_chain_without_fallback_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let raw = toy_raw(500);
        assert!(resolve_noise_cov(&raw, dir.path(), None, None, dir.path(), false).is_err());
    }

    #[test]
    fn baseline_covariance_uses_the_prestimulus_window() {
        use crate::preproc::epochs::epochs_from_events;
        use ndarray::array;
        use std::collections::BTreeMap;

        let raw = toy_raw(1200);
        let events = array![[300, 0, 1], [700, 0, 1]];
        let mut event_id = BTreeMap::new();
        event_id.insert("stim".to_string(), 1);
        let epochs =
            epochs_from_events(&raw, &events, &event_id, -0.2, 0.5, None, None).unwrap();
        let cov = baseline_covariance(&epochs).unwrap();
        assert_eq!(cov.ch_names.len(), 2);
        approx::assert_abs_diff_eq!(cov.data[[0, 1]], cov.data[[1, 0]], epsilon = 1e-12);
        assert!(!cov.is_identity);
    }

    #[test]
    fn pick_reorders_channels() {
        let cov = compute_covariance(&toy_raw(800)).unwrap();
        let picked = cov.pick(&["MEG 002".to_string(), "MEG 001".to_string()]).unwrap();
        approx::assert_abs_diff_eq!(picked.data[[0, 0]], cov.data[[1, 1]]);
        approx::assert_abs_diff_eq!(picked.data[[0, 1]], cov.data[[1, 0]]);
        assert!(cov.pick(&["MEG 099".to_string()]).is_err());
    }
}
