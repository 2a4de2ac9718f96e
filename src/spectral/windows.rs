//! Split a time-series file into sample windows before connectivity.
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::error::PipelineError;
use crate::io::tensor::TensorWriter;
use crate::spectral::psd::load_source_ts;

/// Slice the sample axis at each `(start, stop)` pair and write one
/// `win_ts_<i>.safetensors` per window. Every pair must satisfy
/// `0 <= start < stop <= length`.
pub fn split_into_windows(
    ts_file: &Path,
    out_dir: &Path,
    windows: &[(usize, usize)],
) -> Result<Vec<PathBuf>> {
    let data = load_source_ts(ts_file)?;
    let n_t = data.ncols();
    for &(start, stop) in windows {
        if start >= stop || stop > n_t {
            return Err(PipelineError::shape(format!(
                "window [{start}, {stop}) outside the {n_t}-sample record"
            )));
        }
    }
    let mut out = Vec::with_capacity(windows.len());
    for (i, &(start, stop)) in windows.iter().enumerate() {
        let slice = data.slice(ndarray::s![.., start..stop]).to_owned();
        let path = out_dir.join(format!("win_ts_{i}.safetensors"));
        let mut w = TensorWriter::new();
        w.add_arr2_f64("ts", &slice);
        w.write(&path)?;
        out.push(path);
    }
    info!(n_windows = out.len(), file = %ts_file.display(), "windows written");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn write_ts(dir: &Path, n_t: usize) -> PathBuf {
        let file = dir.join("ts.safetensors");
        let mut w = TensorWriter::new();
        w.add_arr2_f64("ts", &Array2::from_shape_fn((3, n_t), |(c, t)| (c * n_t + t) as f64));
        w.write(&file).unwrap();
        file
    }

    #[test]
    fn windows_slice_the_sample_axis() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_ts(dir.path(), 100);
        let out = split_into_windows(&file, dir.path(), &[(0, 50), (50, 100)]).unwrap();
        assert_eq!(out.len(), 2);
        let first = load_source_ts(&out[0]).unwrap();
        assert_eq!(first.shape(), &[3, 50]);
        approx::assert_abs_diff_eq!(first[[0, 0]], 0.0);
        let second = load_source_ts(&out[1]).unwrap();
        approx::assert_abs_diff_eq!(second[[0, 0]], 50.0);
    }

    #[test]
    fn out_of_range_window_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_ts(dir.path(), 100);
        assert!(split_into_windows(&file, dir.path(), &[(0, 101)]).is_err());
        assert!(split_into_windows(&file, dir.path(), &[(60, 60)]).is_err());
        assert!(split_into_windows(&file, dir.path(), &[(80, 20)]).is_err());
    }
}
