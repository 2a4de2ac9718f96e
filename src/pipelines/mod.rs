//! Pipeline builders.
//!
//! Each builder is a pure function returning a [`Pipeline`]: a workflow
//! DAG plus named public inputs that the caller fills before running.
//! Builders never execute nodes.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use petgraph::graph::NodeIndex;

use crate::config::{
    ConnectivityMetric, DataKind, FreqBand, InverseMethod, PsdMethod, Spacing, SpectralMode,
    TrialAggregation,
};
use crate::engine::{ExecPolicy, Payload, RunReport, Workflow};
use crate::error::PipelineError;
use crate::nodes::{
    ApplyIcaNode, CirclePlotNode, ConnectivityNode, ConvertDsNode, FilterNode, IcaNode,
    InverseNode, LeadFieldNode, MeanBandNode, NoiseCovNode, SensorPsdNode, SourcePsdNode,
    WindowNode,
};
use crate::preproc::ica::ComponentCount;
use crate::preproc::BandPass;
use crate::spectral::DEFAULT_N_LINES;

/// A built DAG with its public input sockets.
pub struct Pipeline {
    pub workflow: Workflow,
    nodes: BTreeMap<String, NodeIndex>,
    inputs: BTreeMap<String, Vec<(NodeIndex, String)>>,
}

impl Pipeline {
    fn new(workflow: Workflow) -> Self {
        Pipeline { workflow, nodes: BTreeMap::new(), inputs: BTreeMap::new() }
    }

    fn register(&mut self, name: &str, idx: NodeIndex) -> NodeIndex {
        self.nodes.insert(name.to_string(), idx);
        idx
    }

    fn bind(&mut self, public: &str, node: NodeIndex, socket: &str) {
        self.inputs
            .entry(public.to_string())
            .or_default()
            .push((node, socket.to_string()));
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.keys().map(String::as_str).collect()
    }

    /// Fill a public input; it may fan out to several nodes.
    pub fn set_input(&mut self, public: &str, value: Payload) -> Result<()> {
        let bindings = self.inputs.get(public).ok_or_else(|| {
            PipelineError::config(format!("pipeline has no input named `{public}`"))
        })?;
        for (node, socket) in bindings.clone() {
            self.workflow.set_input(node, &socket, value.clone());
        }
        Ok(())
    }

    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.nodes.get(name).copied()
    }

    pub fn run(&self, base_dir: &Path, policy: ExecPolicy) -> Result<RunReport> {
        crate::engine::run(&self.workflow, base_dir, policy)
    }
}

// ── Preprocessing ─────────────────────────────────────────────────────────

pub struct PreprocParams {
    pub data_kind: DataKind,
    pub band: BandPass,
    pub down_sfreq: Option<f64>,
    pub n_components: ComponentCount,
    pub overrides_file: Option<PathBuf>,
    /// Apply an operator-reviewed decomposition instead of fitting one.
    pub review_mode: bool,
    pub subject: String,
    pub session: String,
}

/// `{raw_file | ds_dir}` -> cleaned `fif_file`.
pub fn preprocess_pipeline(p: &PreprocParams) -> Pipeline {
    let mut pl = Pipeline::new(Workflow::new("preprocess"));

    let filter = pl.workflow.add(Box::new(FilterNode {
        name: "filter".into(),
        band: p.band,
        down_sfreq: p.down_sfreq,
    }));
    pl.register("filter", filter);

    if p.data_kind.needs_ds_conversion() {
        let convert = pl.workflow.add(Box::new(ConvertDsNode { name: "convert".into() }));
        pl.register("convert", convert);
        pl.workflow.connect(convert, "raw_file", filter, "raw_file");
        pl.bind("ds_dir", convert, "ds_dir");
    } else {
        pl.bind("raw_file", filter, "raw_file");
    }

    let ica: NodeIndex = if p.review_mode {
        pl.workflow.add(Box::new(ApplyIcaNode {
            name: "apply_ica".into(),
            overrides_file: p.overrides_file.clone(),
            subject: p.subject.clone(),
            session: p.session.clone(),
        }))
    } else {
        pl.workflow.add(Box::new(IcaNode {
            name: "ica".into(),
            n_components: p.n_components,
            overrides_file: p.overrides_file.clone(),
            subject: p.subject.clone(),
            session: p.session.clone(),
        }))
    };
    pl.register(if p.review_mode { "apply_ica" } else { "ica" }, ica);
    pl.workflow.connect(filter, "fif_file", ica, "fif_file");
    pl
}

// ── Source reconstruction ─────────────────────────────────────────────────

pub struct SourceReconParams {
    pub subjects_dir: PathBuf,
    pub subject: String,
    pub spacing: Spacing,
    pub structures: Vec<String>,
    /// Transform filename template with a `{subject}` placeholder; `None`
    /// discovers the transform by glob next to the recording.
    pub trans_template: Option<String>,
    pub parc: String,
    pub method: InverseMethod,
    pub is_fixed: bool,
    pub is_epoched: bool,
    pub is_evoked: bool,
    pub events_file: Option<PathBuf>,
    pub tmin: f64,
    pub tmax: f64,
    pub cov_pattern: Option<String>,
    pub er_file: Option<PathBuf>,
    pub allow_identity_cov: bool,
    pub all_src_space: bool,
}

/// `{raw_file}` -> region time series plus label files.
///
/// `lead_field` and `noise_cov` feed the `inverse` node; the recording
/// itself fans out to all three.
pub fn source_reconstruction_pipeline(p: &SourceReconParams) -> Pipeline {
    let mut pl = Pipeline::new(Workflow::new("source_reconstruction"));

    let lead_field = pl.workflow.add(Box::new(LeadFieldNode {
        name: "lead_field".into(),
        subjects_dir: p.subjects_dir.clone(),
        subject: p.subject.clone(),
        spacing: p.spacing,
        structures: p.structures.clone(),
        trans_template: p.trans_template.clone(),
    }));
    pl.register("lead_field", lead_field);

    let noise_cov = pl.workflow.add(Box::new(NoiseCovNode {
        name: "noise_cov".into(),
        cov_pattern: p.cov_pattern.clone(),
        er_file: p.er_file.clone(),
        allow_identity: p.allow_identity_cov,
        events_file: if p.is_epoched && p.is_evoked { p.events_file.clone() } else { None },
        tmin: p.tmin,
        tmax: p.tmax,
    }));
    pl.register("noise_cov", noise_cov);

    let inverse = pl.workflow.add(Box::new(InverseNode {
        name: "inverse".into(),
        subjects_dir: p.subjects_dir.clone(),
        subject: p.subject.clone(),
        spacing: p.spacing,
        structures: p.structures.clone(),
        parc: p.parc.clone(),
        method: p.method,
        is_fixed: p.is_fixed,
        is_epoched: p.is_epoched,
        is_evoked: p.is_evoked,
        events_file: p.events_file.clone(),
        tmin: p.tmin,
        tmax: p.tmax,
        all_src_space: p.all_src_space,
    }));
    pl.register("inverse", inverse);

    pl.workflow.connect(lead_field, "fwd_file", inverse, "fwd_file");
    pl.workflow.connect(noise_cov, "cov_file", inverse, "cov_file");
    pl.bind("raw_file", lead_field, "raw_file");
    pl.bind("raw_file", noise_cov, "raw_file");
    pl.bind("raw_file", inverse, "raw_file");
    pl
}

// ── Power ─────────────────────────────────────────────────────────────────

pub struct SensorPowerParams {
    pub fmin: f64,
    pub fmax: f64,
    pub method: PsdMethod,
    pub is_epoched: bool,
    pub bands: Vec<FreqBand>,
}

/// `{fif_file}` -> `{psds_file, mean_band_file}`.
pub fn sensor_power_pipeline(p: &SensorPowerParams) -> Pipeline {
    let mut pl = Pipeline::new(Workflow::new("sensor_power"));
    let psd = pl.workflow.add(Box::new(SensorPsdNode {
        name: "psd".into(),
        fmin: p.fmin,
        fmax: p.fmax,
        method: p.method,
        is_epoched: p.is_epoched,
    }));
    pl.register("psd", psd);
    let band = pl
        .workflow
        .add(Box::new(MeanBandNode { name: "mean_band".into(), bands: p.bands.clone() }));
    pl.register("mean_band", band);
    pl.workflow.connect(psd, "psds_file", band, "psds_file");
    pl.bind("fif_file", psd, "fif_file");
    pl
}

pub struct SourcePowerParams {
    pub sfreq: f64,
    pub fmin: f64,
    pub fmax: f64,
    pub n_fft: usize,
    pub overlap: f64,
    pub bands: Vec<FreqBand>,
}

/// `{data_file}` -> `{psds_file, mean_band_file}` on source signals.
pub fn source_power_pipeline(p: &SourcePowerParams) -> Pipeline {
    let mut pl = Pipeline::new(Workflow::new("source_power"));
    let psd = pl.workflow.add(Box::new(SourcePsdNode {
        name: "psd".into(),
        sfreq: p.sfreq,
        fmin: p.fmin,
        fmax: p.fmax,
        n_fft: p.n_fft,
        overlap: p.overlap,
    }));
    pl.register("psd", psd);
    let band = pl
        .workflow
        .add(Box::new(MeanBandNode { name: "mean_band".into(), bands: p.bands.clone() }));
    pl.register("mean_band", band);
    pl.workflow.connect(psd, "psds_file", band, "psds_file");
    pl.bind("data_file", psd, "data_file");
    pl
}

// ── Connectivity ──────────────────────────────────────────────────────────

pub struct ConnectivityParams {
    pub metrics: Vec<ConnectivityMetric>,
    pub mode: SpectralMode,
    pub aggregation: TrialAggregation,
    pub export_mat: bool,
    /// Also keep the unaggregated per-trial matrices on disk.
    pub multi_con: bool,
    /// Optional sample windows cut in front of the connectivity nodes.
    pub windows: Vec<(usize, usize)>,
    pub n_lines: usize,
}

impl Default for ConnectivityParams {
    fn default() -> Self {
        ConnectivityParams {
            metrics: vec![ConnectivityMetric::Coh],
            mode: SpectralMode::Multitaper,
            aggregation: TrialAggregation::Mean,
            export_mat: false,
            multi_con: false,
            windows: Vec::new(),
            n_lines: DEFAULT_N_LINES,
        }
    }
}

/// `{ts_file, sfreq, freq_band, labels_file}` -> one connectivity matrix
/// and circular figure per `(window, metric)` pair.
pub fn connectivity_pipeline(p: &ConnectivityParams) -> Pipeline {
    let mut pl = Pipeline::new(Workflow::new("connectivity"));

    let windows = if p.windows.is_empty() {
        None
    } else {
        let w = pl
            .workflow
            .add(Box::new(WindowNode { name: "windows".into(), windows: p.windows.clone() }));
        pl.register("windows", w);
        pl.bind("ts_file", w, "ts_file");
        Some(w)
    };

    let n_units = p.windows.len().max(1);
    for unit in 0..n_units {
        for &metric in &p.metrics {
            let con_name = format!("conmat_{unit}_{}", metric.as_str());
            let con = pl.workflow.add(Box::new(ConnectivityNode {
                name: con_name.clone(),
                metric,
                mode: p.mode,
                aggregation: p.aggregation,
                export_mat: p.export_mat,
                multi_con: p.multi_con,
                index: unit,
                window: windows.map(|_| unit),
            }));
            pl.register(&con_name, con);
            match windows {
                Some(w) => pl.workflow.connect(w, "win_files", con, "win_files"),
                None => pl.bind("ts_file", con, "ts_file"),
            }
            pl.bind("sfreq", con, "sfreq");
            pl.bind("freq_band", con, "freq_band");

            let plot_name = format!("circle_{unit}_{}", metric.as_str());
            let plot = pl.workflow.add(Box::new(CirclePlotNode {
                name: plot_name.clone(),
                tag: format!("{unit}_{}", metric.as_str()),
                n_lines: p.n_lines,
            }));
            pl.register(&plot_name, plot);
            pl.workflow.connect(con, "conmat_file", plot, "conmat_file");
            pl.bind("labels_file", plot, "labels_file");
        }
    }
    pl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::socket;
    use crate::io::raw::{ChannelKind, RawBundle, SensorChannel};
    use crate::io::tensor::TensorWriter;
    use ndarray::Array2;

    #[test]
    fn preprocess_topology_branches_on_data_kind() {
        let base = PreprocParams {
            data_kind: DataKind::SerializedRaw,
            band: BandPass { l_freq: Some(1.0), h_freq: Some(40.0) },
            down_sfreq: None,
            n_components: ComponentCount::Fixed(2),
            overrides_file: None,
            review_mode: false,
            subject: "sub-01".into(),
            session: "ses-01".into(),
        };
        let pl = preprocess_pipeline(&base);
        assert!(pl.node_index("convert").is_none());
        assert!(pl.input_names().contains(&"raw_file"));

        let ds = PreprocParams { data_kind: DataKind::CtfDataset, ..base };
        let pl = preprocess_pipeline(&ds);
        assert!(pl.node_index("convert").is_some());
        assert!(pl.input_names().contains(&"ds_dir"));
    }

    #[test]
    fn unknown_input_name_is_rejected() {
        let mut pl = sensor_power_pipeline(&SensorPowerParams {
            fmin: 0.1,
            fmax: 40.0,
            method: PsdMethod::Welch,
            is_epoched: false,
            bands: vec![[8.0, 12.0]],
        });
        assert!(pl.set_input("nonexistent", Payload::Number(1.0)).is_err());
        assert!(pl.set_input("fif_file", Payload::Path("/tmp/x".into())).is_ok());
    }

    #[test]
    fn sensor_power_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let sfreq = 600.0;
        let channels = vec![
            SensorChannel { name: "MEG 001".into(), kind: ChannelKind::Magnetometer, pos: [0.1, 0.0, 0.1] },
            SensorChannel { name: "MEG 002".into(), kind: ChannelKind::Gradiometer, pos: [0.0, 0.1, 0.1] },
        ];
        let data = Array2::from_shape_fn((2, (60.0 * sfreq) as usize), |(c, t)| {
            (2.0 * std::f64::consts::PI * 10.0 * t as f64 / sfreq + c as f64).sin()
        });
        let raw = RawBundle { channels, data, sfreq, bads: vec![] };
        let raw_file = dir.path().join("sub-01_task-rest_raw.safetensors");
        raw.save(&raw_file).unwrap();

        let mut pl = sensor_power_pipeline(&SensorPowerParams {
            fmin: 0.1,
            fmax: 40.0,
            method: PsdMethod::Welch,
            is_epoched: false,
            bands: vec![[8.0, 12.0], [13.0, 29.0]],
        });
        pl.set_input("fif_file", Payload::Path(raw_file)).unwrap();
        let report = pl.run(dir.path(), ExecPolicy::Linear).unwrap();
        assert!(report.is_success(), "{:?}", report.failed);

        let band_file = socket(&report.outputs["mean_band"], "mean_band_file")
            .unwrap()
            .as_path()
            .unwrap();
        let m = crate::spectral::load_mean_band(band_file).unwrap();
        assert_eq!(m.shape(), &[2, 2]);
    }

    #[test]
    fn connectivity_fans_out_over_windows_and_metrics() {
        let p = ConnectivityParams {
            metrics: vec![ConnectivityMetric::Coh, ConnectivityMetric::Imcoh],
            windows: vec![(0, 500), (500, 1000)],
            ..Default::default()
        };
        let pl = connectivity_pipeline(&p);
        // windows + 2x2 conmat + 2x2 circle
        assert_eq!(pl.workflow.node_count(), 9);
        assert!(pl.node_index("conmat_1_imcoh").is_some());
        assert!(pl.node_index("circle_0_coh").is_some());
    }

    #[test]
    fn windowed_connectivity_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let sfreq = 200.0;
        let ts = Array2::from_shape_fn((4, 1000), |(c, t)| {
            (2.0 * std::f64::consts::PI * 20.0 * t as f64 / sfreq + 0.4 * c as f64).sin()
        });
        let ts_file = dir.path().join("sub-01_ROI_ts.safetensors");
        let mut w = TensorWriter::new();
        w.add_arr2_f64("roi_ts", &ts);
        w.write(&ts_file).unwrap();
        let labels_file = dir.path().join("label_names.txt");
        std::fs::write(&labels_file, "a-lh\nb-lh\na-rh\nb-rh\n").unwrap();

        let mut pl = connectivity_pipeline(&ConnectivityParams {
            windows: vec![(0, 500), (500, 1000)],
            ..Default::default()
        });
        pl.set_input("ts_file", Payload::Path(ts_file)).unwrap();
        pl.set_input("sfreq", Payload::Number(sfreq)).unwrap();
        pl.set_input("freq_band", Payload::Band([10.0, 30.0])).unwrap();
        pl.set_input("labels_file", Payload::Path(labels_file)).unwrap();

        let report = pl.run(dir.path(), ExecPolicy::Linear).unwrap();
        assert!(report.is_success(), "{:?}", report.failed);
        let plot = socket(&report.outputs["circle_1_coh"], "plot_file")
            .unwrap()
            .as_path()
            .unwrap();
        assert!(plot.exists());
    }
}
