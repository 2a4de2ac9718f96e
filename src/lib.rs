//! # meegflow — M/EEG processing pipelines in pure Rust
//!
//! `meegflow` chains M/EEG analysis stages into cacheable workflow DAGs:
//! sensor-space preprocessing, forward and inverse modeling, spectral
//! power and pairwise connectivity. The numerical core follows the
//! [MNE-Python](https://mne.tools) conventions (filter design, minimum-norm
//! inverses, spectral estimators); the workflow layer adds per-node working
//! directories, input-keyed result caching and local parallelism.
//!
//! ## Pipeline overview
//!
//! ```text
//! raw recording (.safetensors bundle, or CTF .ds)
//!   │
//!   ├─ preprocess      band-pass FIR → downsample → ICA artifact rejection
//!   │                    <base>_filt_dsamp_ica.safetensors + report.html
//!   ├─ lead_field      BEM + source space + coregistration → gain matrix
//!   ├─ noise_cov       file / pre-stimulus / empty-room / identity chain
//!   ├─ inverse         MNE | dSPM | sLORETA → region time series (+stc)
//!   ├─ power           Welch / multitaper PSD → band-averaged matrices
//!   └─ connectivity    coh, imcoh, plv, wpli, ... → conmat + circle plot
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use meegflow::engine::{ExecPolicy, Payload};
//! use meegflow::pipelines::{sensor_power_pipeline, SensorPowerParams};
//! use meegflow::PsdMethod;
//!
//! let mut pipeline = sensor_power_pipeline(&SensorPowerParams {
//!     fmin: 0.1,
//!     fmax: 40.0,
//!     method: PsdMethod::Welch,
//!     is_epoched: false,
//!     bands: vec![[8.0, 12.0], [13.0, 29.0]],
//! });
//! pipeline
//!     .set_input("fif_file", Payload::Path("sub-01_task-rest_raw.safetensors".into()))
//!     .unwrap();
//! let report = pipeline.run(Path::new("work"), ExecPolicy::Linear).unwrap();
//! assert!(report.is_success());
//! ```
//!
//! Every stage is also callable directly, without the engine, e.g.
//! [`preproc::filter_stage`], [`forward::compute_forward`] or
//! [`spectral::spectral_connectivity`].

pub mod anatomy;
pub mod config;
pub mod engine;
pub mod error;
pub mod forward;
pub mod inverse;
pub mod io;
pub mod linalg;
pub mod nodes;
pub mod pipelines;
pub mod preproc;
pub mod spectral;
pub mod util;

// ── Crate-root re-exports ─────────────────────────────────────────────────
//
// Everything a downstream user is likely to need is available directly as
// `meegflow::Foo` without having to know the internal module layout.

// error taxonomy
pub use error::PipelineError;

// shared parameter types
pub use config::{
    lambda2, ConnectivityMetric, DataKind, FlatCriteria, FreqBand, InverseMethod,
    OrientationPolicy, PsdMethod, RejectCriteria, RoiAggregation, Spacing, SpectralMode,
    TrialAggregation, SNR_EVOKED, SNR_RAW,
};

// i/o bundles
pub use io::{EpochsBundle, EvokedBundle, RawBundle, TensorFile, TensorWriter};

// preprocessing
pub use preproc::{
    apply_precomputed_ica, filter_stage, ica_stage, BandPass, ComponentCount,
    ExclusionOverrides, IcaDecomposition, IcaOutputs, ReviewOutputs,
};

// forward model
pub use forward::{compute_forward, make_bem, setup_source_space, ForwardSolution, SourceSpace};

// inverse
pub use inverse::{
    build_rois, make_inverse_operator, resolve_noise_cov, InverseOperator, NoiseCovariance,
    RoiSet,
};

// spectral
pub use spectral::{mean_band, spectral_connectivity, welch_psd, Psd};

// workflow engine
pub use engine::{ExecPolicy, Payload, RunReport, Workflow};

// pipeline builders
pub use pipelines::{
    connectivity_pipeline, preprocess_pipeline, sensor_power_pipeline,
    source_power_pipeline, source_reconstruction_pipeline, Pipeline,
};
