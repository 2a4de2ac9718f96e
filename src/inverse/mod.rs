//! Inverse problem: noise covariance, minimum-norm operators and region
//! time series.
pub mod covariance;
pub mod operator;
pub mod rois;

pub use covariance::{
    baseline_covariance, compute_covariance, identity_covariance, resolve_noise_cov,
    NoiseCovariance,
};
pub use operator::{
    make_inverse_operator, read_stc, write_stc, InverseOperator, RAW_BUFFER_SAMPLES,
};
pub use rois::{build_rois, Roi, RoiSet};
