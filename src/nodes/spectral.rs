//! Spectral nodes: PSD, band power, connectivity, windowing and plots.
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array3;

use crate::config::{
    ConnectivityMetric, FreqBand, PsdMethod, SpectralMode, TrialAggregation,
};
use crate::engine::{socket, Node, Payload, Sockets};
use crate::error::PipelineError;
use crate::io::tensor::TensorFile;
use crate::spectral::{
    circle_plot, mean_band_stage, promote_trials, sensor_psd, source_psd,
    spectral_connectivity, spectral_connectivity_trials, split_into_windows, write_conmat,
    write_multi_conmat,
};

/// `fif_file` -> `psds_file`: PSD of the MEG channels.
pub struct SensorPsdNode {
    pub name: String,
    pub fmin: f64,
    pub fmax: f64,
    pub method: PsdMethod,
    pub is_epoched: bool,
}

impl Node for SensorPsdNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let fif_file = socket(inputs, "fif_file")?.as_path()?;
        let psds =
            sensor_psd(fif_file, workdir, self.fmin, self.fmax, self.method, self.is_epoched)?;
        let mut out = Sockets::new();
        out.insert("psds_file".into(), Payload::Path(psds));
        Ok(out)
    }
}

/// `data_file` -> `psds_file`: Welch PSD of a source-level tensor.
pub struct SourcePsdNode {
    pub name: String,
    pub sfreq: f64,
    pub fmin: f64,
    pub fmax: f64,
    pub n_fft: usize,
    pub overlap: f64,
}

impl Node for SourcePsdNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let data_file = socket(inputs, "data_file")?.as_path()?;
        let psds = source_psd(
            data_file,
            workdir,
            self.sfreq,
            self.fmin,
            self.fmax,
            self.n_fft,
            self.overlap,
        )?;
        let mut out = Sockets::new();
        out.insert("psds_file".into(), Payload::Path(psds));
        Ok(out)
    }
}

/// `psds_file` -> `mean_band_file`: collapse the PSD onto bands.
pub struct MeanBandNode {
    pub name: String,
    pub bands: Vec<FreqBand>,
}

impl Node for MeanBandNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, _workdir: &Path) -> Result<Sockets> {
        let psds_file = socket(inputs, "psds_file")?.as_path()?;
        let band_file = mean_band_stage(psds_file, &self.bands)?;
        let mut out = Sockets::new();
        out.insert("mean_band_file".into(), Payload::Path(band_file));
        Ok(out)
    }
}

/// `ts_file` -> `win_files`: slice the sample axis into windows.
pub struct WindowNode {
    pub name: String,
    pub windows: Vec<(usize, usize)>,
}

impl Node for WindowNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let ts_file = socket(inputs, "ts_file")?.as_path()?;
        let files = split_into_windows(ts_file, workdir, &self.windows)?;
        let mut out = Sockets::new();
        out.insert("win_files".into(), Payload::Paths(files));
        Ok(out)
    }
}

/// `ts_file, sfreq, freq_band` -> `conmat_file`.
///
/// A 3-D input is taken as `[trials, nodes, samples]`; a 2-D input is
/// promoted to one trial where the metric permits it. Downstream of a
/// windowing node, `window` selects one entry of its `win_files` list.
pub struct ConnectivityNode {
    pub name: String,
    pub metric: ConnectivityMetric,
    pub mode: SpectralMode,
    pub aggregation: TrialAggregation,
    pub export_mat: bool,
    /// Also persist the unaggregated per-trial matrices.
    pub multi_con: bool,
    /// Position in the output filename, e.g. the window or band index.
    pub index: usize,
    pub window: Option<usize>,
}

impl Node for ConnectivityNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let ts_file = match self.window {
            Some(w) => {
                let files = socket(inputs, "win_files")?.as_paths()?;
                files
                    .get(w)
                    .ok_or_else(|| {
                        PipelineError::shape(format!(
                            "window {w} requested but only {} were produced",
                            files.len()
                        ))
                    })?
                    .as_path()
            }
            None => socket(inputs, "ts_file")?.as_path()?,
        };
        let sfreq = socket(inputs, "sfreq")?.as_number()?;
        let [fmin, fmax] = socket(inputs, "freq_band")?.as_band()?;

        let trials = load_trials(ts_file, self.metric)?;
        let conmat = spectral_connectivity(
            &trials,
            self.metric,
            sfreq,
            fmin,
            fmax,
            self.mode,
            self.aggregation,
        )?;
        let path = write_conmat(&conmat, workdir, self.index, self.metric, self.export_mat)?;
        let mut out = Sockets::new();
        out.insert("conmat_file".into(), Payload::Path(path));
        if self.multi_con {
            let per_trial = spectral_connectivity_trials(
                &trials,
                self.metric,
                sfreq,
                fmin,
                fmax,
                self.mode,
            )?;
            let files =
                write_multi_conmat(&per_trial, workdir, self.index, self.metric, self.export_mat)?;
            out.insert("trial_files".into(), Payload::Paths(files));
        }
        Ok(out)
    }
}

fn load_trials(path: &Path, metric: ConnectivityMetric) -> Result<Array3<f64>> {
    let f = TensorFile::open(path)?;
    for key in ["roi_ts", "ts", "data"] {
        if !f.contains(key) {
            continue;
        }
        let shape = f.shape(key)?;
        return match shape.len() {
            3 if shape[0] > 1 => f.arr3_f64(key),
            3 => {
                let a = f.arr3_f64(key)?;
                promote_trials(&a.index_axis(ndarray::Axis(0), 0).to_owned(), metric)
            }
            2 => promote_trials(&f.arr2_f64(key)?, metric),
            _ => Err(PipelineError::shape(format!(
                "`{key}` in {} has shape {shape:?}",
                path.display()
            ))),
        };
    }
    Err(PipelineError::config(format!(
        "{} holds no recognized time-series tensor",
        path.display()
    )))
}

/// `conmat_file, labels_file` -> `plot_file`: the circular figure.
pub struct CirclePlotNode {
    pub name: String,
    pub tag: String,
    pub n_lines: usize,
}

impl Node for CirclePlotNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let conmat_file = socket(inputs, "conmat_file")?.as_path()?;
        let labels_file = socket(inputs, "labels_file")?.as_path()?;
        let conmat = crate::spectral::load_conmat(conmat_file)?;
        let labels = read_label_names(labels_file)?;
        let plot = circle_plot(&conmat, &labels, &self.tag, workdir, self.n_lines)?;
        let mut out = Sockets::new();
        out.insert("plot_file".into(), Payload::Path(plot));
        Ok(out)
    }
}

/// Label names from either the structured `ROI.json` bundle or a plain
/// one-name-per-line text file.
pub fn read_label_names(path: &Path) -> Result<Vec<String>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let v: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let names = v["ROI_names"].as_array().ok_or_else(|| {
            PipelineError::config(format!("{} has no ROI_names", path.display()))
        })?;
        return names
            .iter()
            .map(|n| {
                n.as_str().map(str::to_string).ok_or_else(|| {
                    PipelineError::config(format!("non-string label in {}", path.display()))
                })
            })
            .collect();
    }
    Ok(text.lines().filter(|l| !l.trim().is_empty()).map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tensor::TensorWriter;
    use ndarray::Array2;

    #[test]
    fn label_names_from_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("label_names.txt");
        std::fs::write(&txt, "a-lh\na-rh\n").unwrap();
        assert_eq!(read_label_names(&txt).unwrap(), vec!["a-lh", "a-rh"]);

        let json = dir.path().join("ROI.json");
        std::fs::write(&json, r#"{"ROI_names":["x-lh","x-rh"],"ROI_colors":[],"ROI_coords":[]}"#)
            .unwrap();
        assert_eq!(read_label_names(&json).unwrap(), vec!["x-lh", "x-rh"]);
    }

    #[test]
    fn connectivity_node_writes_the_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let sfreq = 200.0;
        let ts = Array2::from_shape_fn((3, 2000), |(c, t)| {
            (2.0 * std::f64::consts::PI * 20.0 * t as f64 / sfreq + c as f64).sin()
        });
        let ts_file = dir.path().join("win_ts_0.safetensors");
        let mut w = TensorWriter::new();
        w.add_arr2_f64("ts", &ts);
        w.write(&ts_file).unwrap();

        let node = ConnectivityNode {
            name: "con".into(),
            metric: ConnectivityMetric::Coh,
            mode: SpectralMode::Multitaper,
            aggregation: TrialAggregation::Mean,
            export_mat: false,
            multi_con: false,
            index: 0,
            window: None,
        };
        let mut inputs = Sockets::new();
        inputs.insert("ts_file".into(), Payload::Path(ts_file));
        inputs.insert("sfreq".into(), Payload::Number(sfreq));
        inputs.insert("freq_band".into(), Payload::Band([10.0, 30.0]));
        let out = node.run(&inputs, dir.path()).unwrap();
        let conmat_file = socket(&out, "conmat_file").unwrap().as_path().unwrap();
        assert!(conmat_file.to_str().unwrap().ends_with("conmat_0_coh.safetensors"));

        // Phase metric on the same single-trial input must fail.
        let bad = ConnectivityNode {
            name: "con_plv".into(),
            metric: ConnectivityMetric::Plv,
            mode: SpectralMode::Multitaper,
            aggregation: TrialAggregation::Mean,
            export_mat: false,
            multi_con: false,
            index: 0,
            window: None,
        };
        assert!(bad.run(&inputs, dir.path()).is_err());
    }
}
