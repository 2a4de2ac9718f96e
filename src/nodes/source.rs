//! Source-reconstruction nodes: lead field, noise covariance and the
//! inverse with region extraction.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::anatomy::SubjectsDir;
use crate::config::{
    lambda2, InverseMethod, OrientationPolicy, RejectCriteria, Spacing, SNR_EVOKED, SNR_RAW,
};
use crate::engine::{socket, Node, Payload, Sockets};
use crate::forward::{
    compute_forward, find_trans_file, forward_file, make_bem, setup_mixed_source_space,
    setup_source_space, src_file, CoordTransform, ForwardSolution, SourceSpace,
};
use crate::inverse::{
    baseline_covariance, build_rois, make_inverse_operator, resolve_noise_cov, write_stc,
    NoiseCovariance,
};
use crate::io::raw::{EpochsBundle, RawBundle};
use crate::io::tensor::TensorWriter;
use crate::preproc::epochs::{average, epochs_from_events};
use crate::util::split_filename;

/// Event list serialized as JSON: names to codes plus `(sample, previous,
/// code)` rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsFile {
    pub event_id: BTreeMap<String, i32>,
    pub events: Vec<[i32; 3]>,
}

impl EventsFile {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn to_array(&self) -> Array2<i32> {
        let mut out = Array2::zeros((self.events.len(), 3));
        for (i, row) in self.events.iter().enumerate() {
            for j in 0..3 {
                out[[i, j]] = row[j];
            }
        }
        out
    }
}

/// `raw_file` -> `fwd_file`: conductor model, source space and gain matrix.
///
/// BEM and source space are built on first use and reused afterwards; the
/// coregistration transform is discovered next to the recording.
pub struct LeadFieldNode {
    pub name: String,
    pub subjects_dir: PathBuf,
    pub subject: String,
    pub spacing: Spacing,
    /// Subcortical structures of a mixed source space; empty for surface
    /// only.
    pub structures: Vec<String>,
    /// Transform filename template with a `{subject}` placeholder; `None`
    /// falls back to the widened-stem glob.
    pub trans_template: Option<String>,
}

impl LeadFieldNode {
    fn source_space(&self, sd: &SubjectsDir) -> Result<SourceSpace> {
        if self.structures.is_empty() {
            setup_source_space(sd, &self.subject, self.spacing)
        } else {
            setup_mixed_source_space(sd, &self.subject, self.spacing, &self.structures)
        }
    }
}

impl Node for LeadFieldNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let raw_file = socket(inputs, "raw_file")?.as_path()?;
        let sd = SubjectsDir::new(&self.subjects_dir);
        let bem = make_bem(&sd, &self.subject)?;
        let src = self.source_space(&sd)?;
        let trans = CoordTransform::from_json_file(&find_trans_file(
            raw_file,
            &self.subject,
            self.trans_template.as_deref(),
        )?)?;
        let raw = RawBundle::load(raw_file)?;
        let fwd = compute_forward(&raw, &src, &bem, &trans)?;

        let (_, base, _) = split_filename(raw_file);
        let mixed = src.is_mixed();
        let out_file = forward_file(workdir, &base, self.spacing, mixed);
        let info = crate::forward::ForwardInfo {
            subject: self.subject.clone(),
            spacing: self.spacing.as_str().to_string(),
            mixed,
            n_channels: fwd.n_channels(),
            n_sources: fwd.n_sources(),
            n_excluded: fwd.n_excluded,
            mindist_mm: crate::forward::MIN_DIST_MM,
            patches: src.patches.iter().map(|p| (p.name.clone(), p.n_sources())).collect(),
        };
        fwd.save(&out_file, &info)?;

        let mut out = Sockets::new();
        out.insert("fwd_file".into(), Payload::Path(out_file));
        Ok(out)
    }
}

/// `raw_file` -> `cov_file`: the noise covariance fallback chain.
pub struct NoiseCovNode {
    pub name: String,
    /// Wildcard for an existing covariance file, matched in the recording's
    /// directory.
    pub cov_pattern: Option<String>,
    /// Empty-room recording (serialized or a CTF `.ds` directory).
    pub er_file: Option<PathBuf>,
    pub allow_identity: bool,
    /// With events, estimate from the pre-stimulus interval instead.
    pub events_file: Option<PathBuf>,
    pub tmin: f64,
    pub tmax: f64,
}

impl Node for NoiseCovNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let raw_file = socket(inputs, "raw_file")?.as_path()?;
        let raw = RawBundle::load(raw_file)?;

        let cov_file = if let Some(events_file) = &self.events_file {
            let events = EventsFile::from_json_file(events_file)?;
            let epochs = epochs_from_events(
                &raw,
                &events.to_array(),
                &events.event_id,
                self.tmin,
                self.tmax,
                Some(&RejectCriteria::default()),
                None,
            )?;
            let cov = baseline_covariance(&epochs)?;
            let (_, base, _) = split_filename(raw_file);
            let out = workdir.join(format!("{base}-cov.safetensors"));
            cov.save(&out)?;
            out
        } else {
            let data_dir = raw_file.parent().map(Path::to_path_buf).unwrap_or_default();
            resolve_noise_cov(
                &raw,
                &data_dir,
                self.cov_pattern.as_deref(),
                self.er_file.as_deref(),
                workdir,
                self.allow_identity,
            )?
        };

        let mut out = Sockets::new();
        out.insert("cov_file".into(), Payload::Path(cov_file));
        Ok(out)
    }
}

/// `raw_file, fwd_file, cov_file` -> region time series and label files.
///
/// Application dispatch follows the epoch/event/evoked flags; the
/// orientation policy and regularization derive from the forward model and
/// the evoked flag.
pub struct InverseNode {
    pub name: String,
    pub subjects_dir: PathBuf,
    pub subject: String,
    pub spacing: Spacing,
    pub structures: Vec<String>,
    pub parc: String,
    pub method: InverseMethod,
    pub is_fixed: bool,
    pub is_epoched: bool,
    pub is_evoked: bool,
    pub events_file: Option<PathBuf>,
    pub tmin: f64,
    pub tmax: f64,
    /// Also dump the full per-vertex tensor.
    pub all_src_space: bool,
}

impl InverseNode {
    fn estimates(
        &self,
        inv: &crate::inverse::InverseOperator,
        data_file: &Path,
    ) -> Result<Vec<Array2<f64>>> {
        if self.is_epoched {
            if let Some(events_file) = &self.events_file {
                let raw = RawBundle::load(data_file)?;
                let events = EventsFile::from_json_file(events_file)?;
                let epochs = epochs_from_events(
                    &raw,
                    &events.to_array(),
                    &events.event_id,
                    self.tmin,
                    self.tmax,
                    Some(&RejectCriteria::default()),
                    None,
                )?;
                if self.is_evoked {
                    let evoked = average(&epochs)?;
                    let per_condition = inv.apply_evoked(&evoked)?;
                    return Ok(per_condition.into_iter().map(|(_, est)| est).collect());
                }
                let stc = inv.apply_epochs(&epochs)?;
                return Ok(split_trials(&stc));
            }
            let epochs = EpochsBundle::load(data_file)?;
            let stc = inv.apply_epochs(&epochs)?;
            return Ok(split_trials(&stc));
        }
        let raw = RawBundle::load(data_file)?;
        Ok(vec![inv.apply_raw(&raw)?])
    }
}

fn split_trials(stc: &Array3<f64>) -> Vec<Array2<f64>> {
    (0..stc.shape()[0]).map(|e| stc.index_axis(Axis(0), e).to_owned()).collect()
}

impl Node for InverseNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let data_file = socket(inputs, "raw_file")?.as_path()?;
        let fwd_file = socket(inputs, "fwd_file")?.as_path()?;
        let cov_file = socket(inputs, "cov_file")?.as_path()?;

        let (fwd, info) = ForwardSolution::load(fwd_file)?;
        let cov = NoiseCovariance::load(cov_file)?;
        let policy = OrientationPolicy::select(self.is_fixed, info.mixed);
        let snr = if self.is_epoched && self.is_evoked { SNR_EVOKED } else { SNR_RAW };
        let inv = make_inverse_operator(&fwd, &cov, policy, lambda2(snr), self.method)?;

        let estimates = self.estimates(&inv, data_file)?;
        if estimates.is_empty() {
            return Err(crate::error::PipelineError::shape(
                "inverse application produced no source estimates",
            ));
        }

        // Source space for label geometry; rebuilt if its file is gone.
        let sd = SubjectsDir::new(&self.subjects_dir);
        let src_path = src_file(&sd, &self.subject, self.spacing, info.mixed);
        let src = if src_path.is_file() {
            SourceSpace::from_json_file(&src_path)?
        } else if self.structures.is_empty() {
            setup_source_space(&sd, &self.subject, self.spacing)?
        } else {
            setup_mixed_source_space(&sd, &self.subject, self.spacing, &self.structures)?
        };
        let rois = build_rois(&src, &sd, &self.subject, &self.parc)?;

        let n_t = estimates[0].ncols();
        let mut roi_ts = Array3::<f64>::zeros((estimates.len(), rois.n_rois(), n_t));
        for (e, est) in estimates.iter().enumerate() {
            let ts = rois.extract_time_series(est, policy.aggregation)?;
            roi_ts.index_axis_mut(Axis(0), e).assign(&ts);
        }

        let (_, base, _) = split_filename(data_file);
        let ts_file = workdir.join(format!("{base}_ROI_ts.safetensors"));
        let mut w = TensorWriter::new();
        w.add_arr3_f64("roi_ts", &roi_ts);
        w.write(&ts_file)?;
        rois.write_label_files(workdir)?;

        let mut out = Sockets::new();
        out.insert("roi_ts_file".into(), Payload::Path(ts_file));
        out.insert("labels_file".into(), Payload::Path(workdir.join("ROI.json")));
        out.insert("label_names_file".into(), Payload::Path(workdir.join("label_names.txt")));
        out.insert(
            "label_centroids_file".into(),
            Payload::Path(workdir.join("label_centroid.txt")),
        );
        if self.all_src_space {
            let stc_file = workdir.join(format!("{base}_stc.safetensors"));
            write_stc(&estimates, &stc_file)?;
            out.insert("stc_file".into(), Payload::Path(stc_file));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let mut event_id = BTreeMap::new();
        event_id.insert("aud_l".to_string(), 1);
        event_id.insert("aud_r".to_string(), 2);
        let ev = EventsFile {
            event_id,
            events: vec![[300, 0, 1], [900, 0, 2]],
        };
        std::fs::write(&path, serde_json::to_string(&ev).unwrap()).unwrap();
        let back = EventsFile::from_json_file(&path).unwrap();
        assert_eq!(back.event_id.len(), 2);
        let arr = back.to_array();
        assert_eq!(arr.shape(), &[2, 3]);
        assert_eq!(arr[[1, 2]], 2);
    }
}
