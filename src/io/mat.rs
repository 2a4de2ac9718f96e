//! MATLAB Level-5 `.mat` files (uncompressed elements only).
//!
//! Enough of the format to exchange numeric matrices with FieldTrip-style
//! tooling: the 128-byte file header, `miMATRIX` elements with array flags,
//! dimensions, name, and a real part in miDOUBLE / miSINGLE / miINT32 /
//! miUINT8. MATLAB arrays are column-major on disk; everything is exposed
//! row-major here.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3};

use crate::io::tensor::TensorWriter;
use crate::util::split_filename;

const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_MATRIX: u32 = 14;

const MX_DOUBLE_CLASS: u32 = 6;

/// One numeric variable read from a `.mat` file.
#[derive(Debug, Clone)]
pub struct MatVar {
    pub dims: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f64>,
}

impl MatVar {
    pub fn to_arr2(&self) -> Result<Array2<f64>> {
        if self.dims.len() != 2 {
            bail!("variable has {} dims, expected 2", self.dims.len());
        }
        Ok(Array2::from_shape_vec((self.dims[0], self.dims[1]), self.data.clone())?)
    }

    pub fn to_arr3(&self) -> Result<Array3<f64>> {
        if self.dims.len() != 3 {
            bail!("variable has {} dims, expected 3", self.dims.len());
        }
        Ok(Array3::from_shape_vec(
            (self.dims[0], self.dims[1], self.dims[2]),
            self.data.clone(),
        )?)
    }
}

// Column-major linear index → row-major position, generic over rank.
fn col_to_row_major(dims: &[usize], col: &[f64]) -> Vec<f64> {
    let n: usize = dims.iter().product();
    let mut out = vec![0.0; n];
    let mut strides_row = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides_row[i] = strides_row[i + 1] * dims[i + 1];
    }
    let mut idx = vec![0usize; dims.len()];
    for value in col.iter().take(n) {
        let row_lin: usize = idx.iter().zip(&strides_row).map(|(i, s)| i * s).sum();
        out[row_lin] = *value;
        // Increment column-major: first dimension fastest.
        for d in 0..dims.len() {
            idx[d] += 1;
            if idx[d] < dims[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

fn row_to_col_major(dims: &[usize], row: &[f64]) -> Vec<f64> {
    let n: usize = dims.iter().product();
    let mut out = vec![0.0; n];
    let mut strides_row = vec![1usize; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides_row[i] = strides_row[i + 1] * dims[i + 1];
    }
    let mut idx = vec![0usize; dims.len()];
    for slot in out.iter_mut().take(n) {
        let row_lin: usize = idx.iter().zip(&strides_row).map(|(i, s)| i * s).sum();
        *slot = row[row_lin];
        for d in 0..dims.len() {
            idx[d] += 1;
            if idx[d] < dims[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    out
}

// ── Reader ────────────────────────────────────────────────────────────────

struct Element<'a> {
    dtype: u32,
    payload: &'a [u8],
}

/// Parse one data element at `off`; returns the element and the offset of
/// the next one (small-element format included).
fn parse_element(bytes: &[u8], off: usize) -> Result<(Element<'_>, usize)> {
    if off + 8 > bytes.len() {
        bail!("truncated .mat element at offset {off}");
    }
    let word = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
    // Small data element: nonzero upper 16 bits hold the byte count.
    let small_len = (word >> 16) as usize;
    if small_len != 0 {
        let dtype = word & 0xffff;
        let payload = &bytes[off + 4..off + 4 + small_len];
        return Ok((Element { dtype, payload }, off + 8));
    }
    let dtype = word;
    let len = u32::from_le_bytes(bytes[off + 4..off + 8].try_into().unwrap()) as usize;
    if off + 8 + len > bytes.len() {
        bail!("truncated .mat element payload at offset {off}");
    }
    let payload = &bytes[off + 8..off + 8 + len];
    let padded = (len + 7) / 8 * 8;
    Ok((Element { dtype, payload }, off + 8 + padded))
}

fn numeric_payload(dtype: u32, payload: &[u8]) -> Result<Vec<f64>> {
    let v = match dtype {
        MI_DOUBLE => payload
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes(b.try_into().unwrap()))
            .collect(),
        MI_SINGLE => payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()) as f64)
            .collect(),
        MI_INT32 => payload
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes(b.try_into().unwrap()) as f64)
            .collect(),
        MI_UINT8 => payload.iter().map(|&b| b as f64).collect(),
        other => bail!("unsupported numeric storage type {other}"),
    };
    Ok(v)
}

/// Read every numeric variable of a `.mat` file.
pub fn read_mat(path: &Path) -> Result<BTreeMap<String, MatVar>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() < 128 {
        bail!("{}: too small for a .mat header", path.display());
    }
    let version = u16::from_le_bytes(bytes[124..126].try_into().unwrap());
    let endian = &bytes[126..128];
    if version != 0x0100 || endian != b"IM" {
        bail!("{}: not a little-endian Level-5 .mat file", path.display());
    }

    let mut vars = BTreeMap::new();
    let mut off = 128;
    while off + 8 <= bytes.len() {
        let (elem, next) = parse_element(&bytes, off)?;
        off = next;
        if elem.dtype != MI_MATRIX {
            // Compressed or unknown element kinds are skipped.
            continue;
        }
        let body = elem.payload;
        let mut boff = 0usize;

        let (flags, n1) = parse_element(body, boff)?;
        if flags.dtype != MI_UINT32 || flags.payload.len() < 8 {
            bail!("malformed array flags");
        }
        boff = n1;

        let (dims_el, n2) = parse_element(body, boff)?;
        if dims_el.dtype != MI_INT32 {
            bail!("malformed dimensions element");
        }
        let dims: Vec<usize> = dims_el
            .payload
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes(b.try_into().unwrap()) as usize)
            .collect();
        boff = n2;

        let (name_el, n3) = parse_element(body, boff)?;
        if name_el.dtype != MI_INT8 {
            bail!("malformed array name element");
        }
        let name = String::from_utf8_lossy(name_el.payload).into_owned();
        boff = n3;

        let (real_el, _) = parse_element(body, boff)?;
        let col = numeric_payload(real_el.dtype, real_el.payload)?;
        let data = col_to_row_major(&dims, &col);
        vars.insert(name, MatVar { dims, data });
    }
    Ok(vars)
}

// ── Writer ────────────────────────────────────────────────────────────────

fn push_element(out: &mut Vec<u8>, dtype: u32, payload: &[u8]) {
    out.extend_from_slice(&dtype.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let pad = (8 - payload.len() % 8) % 8;
    out.extend(std::iter::repeat(0u8).take(pad));
}

/// Write numeric variables (row-major input) as double-precision matrices.
pub fn write_mat(path: &Path, vars: &[(&str, &[usize], &[f64])]) -> Result<()> {
    let mut out = Vec::new();
    let mut header = [0u8; 128];
    let text = b"MATLAB 5.0 MAT-file, written by meegflow";
    header[..text.len()].copy_from_slice(text);
    // Pad the descriptive text with spaces as MATLAB does.
    for b in header[text.len()..116].iter_mut() {
        *b = b' ';
    }
    header[124..126].copy_from_slice(&0x0100_u16.to_le_bytes());
    header[126..128].copy_from_slice(b"IM");
    out.extend_from_slice(&header);

    for (name, dims, data) in vars {
        let mut body = Vec::new();

        let mut flags = [0u8; 8];
        flags[..4].copy_from_slice(&MX_DOUBLE_CLASS.to_le_bytes());
        push_element(&mut body, MI_UINT32, &flags);

        let dim_bytes: Vec<u8> = dims.iter().flat_map(|&d| (d as i32).to_le_bytes()).collect();
        push_element(&mut body, MI_INT32, &dim_bytes);

        push_element(&mut body, MI_INT8, name.as_bytes());

        let col = row_to_col_major(dims, data);
        let data_bytes: Vec<u8> = col.iter().flat_map(|v| v.to_le_bytes()).collect();
        push_element(&mut body, MI_DOUBLE, &data_bytes);

        push_element(&mut out, MI_MATRIX, &body);
    }
    std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

// ── FieldTrip-style imports ───────────────────────────────────────────────

/// Import a numeric matrix from a `.mat` file into the tensor container.
///
/// When sidecar files are given, channel names come from
/// `orig_channel_names_file` and coordinates from `orig_channel_coords_file`,
/// each re-emitted under the canonical `correct_channel_*` filenames.
pub fn import_mat_to_ts(
    mat_file: &Path,
    data_field_name: &str,
    orig_channel_names_file: Option<&Path>,
    orig_channel_coords_file: Option<&Path>,
    out_dir: &Path,
) -> Result<(PathBuf, Option<PathBuf>, Option<PathBuf>)> {
    let vars = read_mat(mat_file)?;
    let var = vars
        .get(data_field_name)
        .with_context(|| format!("{}: no variable `{data_field_name}`", mat_file.display()))?;

    let (_, base, _) = split_filename(mat_file);
    let ts_file = out_dir.join(format!("{base}.safetensors"));
    let mut w = TensorWriter::new();
    match var.dims.len() {
        2 => w.add_arr2_f64("ts", &var.to_arr2()?),
        3 => w.add_arr3_f64("ts", &var.to_arr3()?),
        n => bail!("variable `{data_field_name}` has {n} dims, expected 2 or 3"),
    }
    w.write(&ts_file)?;

    let names_out = match orig_channel_names_file {
        Some(src) => {
            let dst = out_dir.join("correct_channel_names.txt");
            std::fs::copy(src, &dst)
                .with_context(|| format!("copying channel names from {}", src.display()))?;
            Some(dst)
        }
        None => None,
    };
    let coords_out = match orig_channel_coords_file {
        Some(src) => {
            let dst = out_dir.join("correct_channel_coords.txt");
            std::fs::copy(src, &dst)
                .with_context(|| format!("copying channel coords from {}", src.display()))?;
            Some(dst)
        }
        None => None,
    };
    Ok((ts_file, coords_out, names_out))
}

/// Import a FieldTrip-style `[channels, samples]` matrix, keeping only rows
/// flagged good (flag == 1) when a good-channel field is named.
pub fn import_tsmat_to_ts(
    tsmat_file: &Path,
    data_field_name: &str,
    good_channels_field_name: Option<&str>,
    out_dir: &Path,
) -> Result<PathBuf> {
    let vars = read_mat(tsmat_file)?;
    let data = vars
        .get(data_field_name)
        .with_context(|| format!("{}: no variable `{data_field_name}`", tsmat_file.display()))?
        .to_arr2()?;

    let good = match good_channels_field_name {
        Some(field) => {
            let flags = &vars
                .get(field)
                .with_context(|| format!("{}: no variable `{field}`", tsmat_file.display()))?
                .data;
            let keep: Vec<usize> = flags
                .iter()
                .enumerate()
                .filter(|(_, &f)| f == 1.0)
                .map(|(i, _)| i)
                .collect();
            let mut out = Array2::zeros((keep.len(), data.ncols()));
            for (row, &i) in keep.iter().enumerate() {
                out.row_mut(row).assign(&data.row(i));
            }
            out
        }
        None => data,
    };

    let ts_file = out_dir.join("tsmat.safetensors");
    let mut w = TensorWriter::new();
    w.add_arr2_f64("ts", &good);
    w.write(&ts_file)?;
    Ok(ts_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn mat_roundtrip_2d() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.mat");
        let a = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let flat: Vec<f64> = a.iter().copied().collect();
        write_mat(&path, &[("F", &[2, 3], &flat)]).unwrap();

        let vars = read_mat(&path).unwrap();
        let back = vars["F"].to_arr2().unwrap();
        for (x, y) in a.iter().zip(back.iter()) {
            approx::assert_abs_diff_eq!(x, y);
        }
    }

    #[test]
    fn mat_roundtrip_3d() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.mat");
        let a = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as f64);
        let flat: Vec<f64> = a.iter().copied().collect();
        write_mat(&path, &[("F", &[2, 3, 4], &flat)]).unwrap();
        let back = read_mat(&path).unwrap()["F"].to_arr3().unwrap();
        assert_eq!(a, back);
    }

    #[test]
    fn tsmat_good_channel_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts.mat");
        let data = array![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]];
        let flat: Vec<f64> = data.iter().copied().collect();
        let flags = [1.0, 0.0, 1.0];
        write_mat(&path, &[("F", &[3, 2], &flat), ("ChannelFlag", &[3, 1], &flags)]).unwrap();

        let ts = import_tsmat_to_ts(&path, "F", Some("ChannelFlag"), dir.path()).unwrap();
        let f = crate::io::tensor::TensorFile::open(&ts).unwrap();
        let kept = f.arr2_f64("ts").unwrap();
        assert_eq!(kept.nrows(), 2);
        assert_eq!(kept.row(1).to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn import_splits_names_and_coords() {
        let dir = tempfile::tempdir().unwrap();
        let mat = dir.path().join("sub01_ts.mat");
        write_mat(&mat, &[("F", &[2, 4], &[0.0; 8])]).unwrap();
        let names = dir.path().join("names.txt");
        let coords = dir.path().join("coords.txt");
        std::fs::write(&names, "A1\nA2\n").unwrap();
        std::fs::write(&coords, "0 0 1\n0 1 0\n").unwrap();

        let (_, coords_out, names_out) =
            import_mat_to_ts(&mat, "F", Some(&names), Some(&coords), dir.path()).unwrap();
        let names_txt = std::fs::read_to_string(names_out.unwrap()).unwrap();
        let coords_txt = std::fs::read_to_string(coords_out.unwrap()).unwrap();
        assert!(names_txt.contains("A1"));
        assert!(coords_txt.contains("0 0 1"));
    }
}
