//! Spectral analysis: PSD, band power, pairwise connectivity, windowing
//! and the circular connectivity figure.
pub mod bands;
pub mod circle;
pub mod connectivity;
pub mod psd;
pub mod windows;

pub use bands::{band_file, load_mean_band, mean_band, mean_band_stage};
pub use circle::{circle_plot, node_order, DEFAULT_N_LINES};
pub use connectivity::{
    conmat_file, load_conmat, promote_trials, spectral_connectivity,
    spectral_connectivity_trials, write_conmat, write_multi_conmat,
};
pub use psd::{
    load_source_ts, multitaper_psd, psd_file, sensor_psd, source_psd, welch_psd, Psd,
};
pub use windows::split_into_windows;
