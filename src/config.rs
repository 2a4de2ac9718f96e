//! Shared parameter types for the four pipelines.
//!
//! Everything here is plain data: enums parsed from user strings (with a
//! configuration error on unknown values), plus the orientation-policy table
//! used by the inverse subsystem.
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ── Data kinds ────────────────────────────────────────────────────────────

/// Input data kind of the preprocessing pipeline.
///
/// Modeled as a tagged variant with capability methods rather than branches
/// scattered over the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataKind {
    /// Canonical serialized raw bundle (MEG or mixed sensor set).
    SerializedRaw,
    /// CTF-style `.ds` dataset directory; converted to the serialized bundle
    /// before anything else runs.
    CtfDataset,
    /// EEG recording with montage metadata.
    Eeg,
}

impl DataKind {
    /// The dataset must be converted to the serialized bundle first.
    pub fn needs_ds_conversion(self) -> bool {
        matches!(self, DataKind::CtfDataset)
    }

    /// Electrode montage metadata is meaningful for this kind.
    pub fn reads_montage(self) -> bool {
        matches!(self, DataKind::Eeg)
    }

    /// EOG channels may be renamed/derived from bipolar pairs.
    pub fn supports_eog_rename(self) -> bool {
        matches!(self, DataKind::Eeg)
    }
}

// ── Source-space spacing ──────────────────────────────────────────────────

/// Named source-space spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Spacing {
    Oct6,
    Oct5,
    Ico5,
}

impl Spacing {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "oct-6" => Ok(Spacing::Oct6),
            "oct-5" => Ok(Spacing::Oct5),
            "ico-5" => Ok(Spacing::Ico5),
            other => Err(PipelineError::config(format!("unknown source spacing `{other}`"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Spacing::Oct6 => "oct-6",
            Spacing::Oct5 => "oct-5",
            Spacing::Ico5 => "ico-5",
        }
    }

    /// Number of source points kept per hemisphere.
    pub fn vertices_per_hemi(self) -> usize {
        match self {
            Spacing::Oct6 => 4098,
            Spacing::Oct5 => 1026,
            Spacing::Ico5 => 10242,
        }
    }

    /// Grid step (mm) of the volume source spaces paired with this surface
    /// spacing when building a mixed source space.
    pub fn volume_grid_mm(self) -> f64 {
        match self {
            Spacing::Oct6 => 5.0,
            Spacing::Oct5 => 7.0,
            Spacing::Ico5 => 3.0,
        }
    }
}

// ── Spectral parameters ───────────────────────────────────────────────────

/// Sensor-space PSD estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsdMethod {
    Welch,
    Multitaper,
}

impl PsdMethod {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "welch" => Ok(PsdMethod::Welch),
            "multitaper" => Ok(PsdMethod::Multitaper),
            other => Err(PipelineError::config(format!("unknown PSD method `{other}`"))),
        }
    }
}

/// Spectral estimation mode for connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectralMode {
    Multitaper,
    CwtMorlet,
}

impl SpectralMode {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "multitaper" => Ok(SpectralMode::Multitaper),
            "cwt_morlet" => Ok(SpectralMode::CwtMorlet),
            other => Err(PipelineError::config(format!("unknown spectral mode `{other}`"))),
        }
    }
}

/// Pairwise spectral connectivity metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityMetric {
    Coh,
    Imcoh,
    Cohy,
    Plv,
    Pli,
    Pli2Unbiased,
    Ppc,
    Wpli,
    Wpli2Debiased,
}

impl ConnectivityMetric {
    pub const ALL: [ConnectivityMetric; 9] = [
        ConnectivityMetric::Coh,
        ConnectivityMetric::Imcoh,
        ConnectivityMetric::Cohy,
        ConnectivityMetric::Plv,
        ConnectivityMetric::Pli,
        ConnectivityMetric::Pli2Unbiased,
        ConnectivityMetric::Ppc,
        ConnectivityMetric::Wpli,
        ConnectivityMetric::Wpli2Debiased,
    ];

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "coh" => Ok(ConnectivityMetric::Coh),
            "imcoh" => Ok(ConnectivityMetric::Imcoh),
            "cohy" => Ok(ConnectivityMetric::Cohy),
            "plv" => Ok(ConnectivityMetric::Plv),
            "pli" => Ok(ConnectivityMetric::Pli),
            "pli2_unbiased" => Ok(ConnectivityMetric::Pli2Unbiased),
            "ppc" => Ok(ConnectivityMetric::Ppc),
            "wpli" => Ok(ConnectivityMetric::Wpli),
            "wpli2_debiased" => Ok(ConnectivityMetric::Wpli2Debiased),
            other => Err(PipelineError::config(format!("unknown connectivity metric `{other}`"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectivityMetric::Coh => "coh",
            ConnectivityMetric::Imcoh => "imcoh",
            ConnectivityMetric::Cohy => "cohy",
            ConnectivityMetric::Plv => "plv",
            ConnectivityMetric::Pli => "pli",
            ConnectivityMetric::Pli2Unbiased => "pli2_unbiased",
            ConnectivityMetric::Ppc => "ppc",
            ConnectivityMetric::Wpli => "wpli",
            ConnectivityMetric::Wpli2Debiased => "wpli2_debiased",
        }
    }

    /// Amplitude-coupling metrics remain meaningful on a single continuous
    /// record, so a 2-D `[nodes, samples]` input is promoted to one trial.
    /// Phase metrics need a trial dimension and reject 2-D input.
    pub fn allows_single_trial(self) -> bool {
        matches!(
            self,
            ConnectivityMetric::Coh | ConnectivityMetric::Cohy | ConnectivityMetric::Imcoh
        )
    }
}

/// Cross-trial aggregation of per-trial connectivity matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialAggregation {
    Mean,
    Max,
}

/// A `[fmin, fmax]` frequency band in Hz.
pub type FreqBand = [f64; 2];

// ── Inverse parameters ────────────────────────────────────────────────────

/// Distributed inverse method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InverseMethod {
    Mne,
    Dspm,
    Sloreta,
}

impl InverseMethod {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "MNE" => Ok(InverseMethod::Mne),
            "dSPM" => Ok(InverseMethod::Dspm),
            "sLORETA" => Ok(InverseMethod::Sloreta),
            other => Err(PipelineError::config(format!("unknown inverse method `{other}`"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InverseMethod::Mne => "MNE",
            InverseMethod::Dspm => "dSPM",
            InverseMethod::Sloreta => "sLORETA",
        }
    }
}

/// Per-label aggregation of source time courses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiAggregation {
    Mean,
    MeanFlip,
}

/// Orientation policy of the inverse operator, fixed once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientationPolicy {
    pub loose: f64,
    pub depth: Option<f64>,
    /// Keep only the surface-normal component of each source estimate.
    pub pick_normal: bool,
    pub aggregation: RoiAggregation,
}

impl OrientationPolicy {
    /// The policy table is total over `(fixed, mixed)`:
    ///
    /// | fixed | mixed | loose | depth | pick  | aggregation    |
    /// |-------|-------|-------|-------|-------|----------------|
    /// | yes   | —     | 0.0   | None  | none  | sign-flip mean |
    /// | no    | yes   | 1.0   | None  | none  | mean           |
    /// | no    | no    | 0.2   | 0.8   | normal| mean           |
    pub fn select(fixed: bool, mixed: bool) -> Self {
        if fixed {
            OrientationPolicy {
                loose: 0.0,
                depth: None,
                pick_normal: false,
                aggregation: RoiAggregation::MeanFlip,
            }
        } else if mixed {
            OrientationPolicy {
                loose: 1.0,
                depth: None,
                pick_normal: false,
                aggregation: RoiAggregation::Mean,
            }
        } else {
            OrientationPolicy {
                loose: 0.2,
                depth: Some(0.8),
                pick_normal: true,
                aggregation: RoiAggregation::Mean,
            }
        }
    }
}

/// `λ² = 1/SNR²`. SNR defaults to 1 for raw/epoch inversion, 3 for evoked.
pub fn lambda2(snr: f64) -> f64 {
    1.0 / (snr * snr)
}

pub const SNR_RAW: f64 = 1.0;
pub const SNR_EVOKED: f64 = 3.0;

// ── Rejection thresholds ──────────────────────────────────────────────────

/// Peak-to-peak rejection thresholds by channel kind, in SI units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RejectCriteria {
    pub mag: Option<f64>,
    pub grad: Option<f64>,
    pub eog: Option<f64>,
}

impl Default for RejectCriteria {
    fn default() -> Self {
        RejectCriteria {
            mag: Some(4e-12),
            grad: Some(4000e-13),
            eog: Some(150e-6),
        }
    }
}

/// Minimum-amplitude (flat) thresholds for MEG channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlatCriteria {
    pub mag: f64,
    pub grad: f64,
}

impl Default for FlatCriteria {
    fn default() -> Self {
        FlatCriteria { mag: 1e-13, grad: 1e-13 }
    }
}
