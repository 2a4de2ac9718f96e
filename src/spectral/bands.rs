//! Band-averaged power: collapse a PSD onto a list of frequency bands.
use std::path::{Path, PathBuf};

use anyhow::Result;
use ndarray::Array2;
use tracing::info;

use crate::config::FreqBand;
use crate::error::PipelineError;
use crate::io::tensor::{TensorFile, TensorWriter};
use crate::spectral::psd::Psd;
use crate::util::split_filename;

/// Mean of the PSD columns whose frequency lies in each closed band.
/// Returns `[C, B]`.
pub fn mean_band(psd: &Psd, bands: &[FreqBand]) -> Result<Array2<f64>> {
    let mut out = Array2::<f64>::zeros((psd.psds.nrows(), bands.len()));
    for (b, &[fmin, fmax]) in bands.iter().enumerate() {
        let cols: Vec<usize> = psd
            .freqs
            .iter()
            .enumerate()
            .filter(|(_, &f)| f >= fmin && f <= fmax)
            .map(|(i, _)| i)
            .collect();
        if cols.is_empty() {
            return Err(PipelineError::config(format!(
                "band [{fmin}, {fmax}] Hz holds no frequency bins"
            )));
        }
        for c in 0..psd.psds.nrows() {
            let sum: f64 = cols.iter().map(|&f| psd.psds[[c, f]]).sum();
            out[[c, b]] = sum / cols.len() as f64;
        }
    }
    Ok(out)
}

/// `<psds base>-mean_band.safetensors`.
pub fn band_file(psds_file: &Path) -> PathBuf {
    let (dir, base, _) = split_filename(psds_file);
    dir.join(format!("{base}-mean_band.safetensors"))
}

/// Band-average a PSD archive and write the `[C, B]` matrix next to it.
pub fn mean_band_stage(psds_file: &Path, bands: &[FreqBand]) -> Result<PathBuf> {
    let psd = Psd::load(psds_file)?;
    let matrix = mean_band(&psd, bands)?;
    let out = band_file(psds_file);
    let mut w = TensorWriter::new();
    w.add_arr2_f64("mean_band", &matrix);
    let edges: Vec<f64> = bands.iter().flat_map(|b| b.iter().copied()).collect();
    w.add_f64("bands", &edges, &[bands.len(), 2]);
    w.write(&out)?;
    info!(file = %out.display(), n_bands = bands.len(), "band power written");
    Ok(out)
}

/// Load the `[C, B]` matrix of a band-power file.
pub fn load_mean_band(path: &Path) -> Result<Array2<f64>> {
    TensorFile::open(path)?.arr2_f64("mean_band")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_psd() -> Psd {
        let freqs: Vec<f64> = (0..40).map(|f| f as f64).collect();
        let psds = Array2::from_shape_fn((2, 40), |(c, f)| (c + 1) as f64 * f as f64);
        Psd { psds, freqs }
    }

    #[test]
    fn closed_interval_mean() {
        let psd = toy_psd();
        let out = mean_band(&psd, &[[8.0, 12.0], [13.0, 29.0]]).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        // Bins 8..=12 of channel 0 average to 10.
        approx::assert_abs_diff_eq!(out[[0, 0]], 10.0);
        approx::assert_abs_diff_eq!(out[[1, 0]], 20.0);
        approx::assert_abs_diff_eq!(out[[0, 1]], 21.0);
    }

    #[test]
    fn full_range_band_equals_frequency_mean() {
        let psd = toy_psd();
        let out = mean_band(&psd, &[[0.0, 39.0]]).unwrap();
        let direct = psd.psds.row(0).mean().unwrap();
        approx::assert_abs_diff_eq!(out[[0, 0]], direct, epsilon = 1e-12);
    }

    #[test]
    fn empty_band_is_an_error() {
        let psd = toy_psd();
        assert!(mean_band(&psd, &[[100.0, 120.0]]).is_err());
    }

    #[test]
    fn stage_writes_next_to_the_psd() {
        let dir = tempfile::tempdir().unwrap();
        let psds_file = dir.path().join("sub-01-psds.safetensors");
        toy_psd().save(&psds_file).unwrap();
        let out = mean_band_stage(&psds_file, &[[8.0, 12.0]]).unwrap();
        assert!(out.to_str().unwrap().ends_with("sub-01-psds-mean_band.safetensors"));
        let m = load_mean_band(&out).unwrap();
        assert_eq!(m.shape(), &[2, 1]);
    }
}
