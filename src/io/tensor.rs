//! Safetensors-compatible array container.
//!
//! Every numeric artifact of the pipelines (raw bundles, PSDs, connectivity
//! matrices, source tensors) is stored in this one format: an 8-byte LE
//! header length, a JSON header mapping names to `{dtype, shape,
//! data_offsets}`, then the raw little-endian tensor bytes. String lists are
//! stored as newline-joined `U8` entries.
use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, Array3};
use std::collections::HashMap;
use std::path::Path;

// ── Writer ────────────────────────────────────────────────────────────────

/// Append-only builder for a safetensors file (F32, F64, I32, U8 string).
pub struct TensorWriter {
    entries: Vec<(String, Vec<u8>, &'static str, Vec<usize>)>,
}

impl Default for TensorWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorWriter {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn add_f32(&mut self, name: &str, data: &[f32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F32", shape.to_vec()));
    }

    pub fn add_f64(&mut self, name: &str, data: &[f64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F64", shape.to_vec()));
    }

    pub fn add_i32(&mut self, name: &str, data: &[i32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "I32", shape.to_vec()));
    }

    pub fn add_scalar_f64(&mut self, name: &str, v: f64) {
        self.add_f64(name, &[v], &[1]);
    }

    pub fn add_arr1_f64(&mut self, name: &str, arr: &Array1<f64>) {
        let data: Vec<f64> = arr.iter().copied().collect();
        self.add_f64(name, &data, &[arr.len()]);
    }

    pub fn add_arr2_f64(&mut self, name: &str, arr: &Array2<f64>) {
        let data: Vec<f64> = arr.iter().copied().collect();
        self.add_f64(name, &data, &[arr.nrows(), arr.ncols()]);
    }

    pub fn add_arr3_f64(&mut self, name: &str, arr: &Array3<f64>) {
        let data: Vec<f64> = arr.iter().copied().collect();
        let s = arr.shape();
        self.add_f64(name, &data, &[s[0], s[1], s[2]]);
    }

    pub fn add_arr2_f32(&mut self, name: &str, arr: &Array2<f32>) {
        let data: Vec<f32> = arr.iter().copied().collect();
        self.add_f32(name, &data, &[arr.nrows(), arr.ncols()]);
    }

    /// Store a string list as one newline-joined U8 tensor.
    pub fn add_str_list(&mut self, name: &str, items: &[String]) {
        let joined = items.join("\n");
        let bytes = joined.into_bytes();
        let n = bytes.len();
        self.entries.push((name.to_string(), bytes, "U8", vec![n]));
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        use std::io::Write;
        let mut header_map = serde_json::Map::new();
        let mut offset: usize = 0;
        for (name, data, dtype, shape) in &self.entries {
            header_map.insert(name.clone(), serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [offset, offset + data.len()],
            }));
            offset += data.len();
        }
        let hdr_bytes = serde_json::to_vec(&header_map)?;
        let pad = (8 - hdr_bytes.len() % 8) % 8;
        let padded: Vec<u8> = hdr_bytes.into_iter()
            .chain(std::iter::repeat(b' ').take(pad))
            .collect();
        let mut f = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        f.write_all(&(padded.len() as u64).to_le_bytes())?;
        f.write_all(&padded)?;
        for (_, data, _, _) in &self.entries {
            f.write_all(data)?;
        }
        Ok(())
    }
}

// ── Reader ────────────────────────────────────────────────────────────────

/// Parsed safetensors file, tensors materialized on demand.
pub struct TensorFile {
    bytes: Vec<u8>,
    header: HashMap<String, serde_json::Value>,
    data_start: usize,
}

impl TensorFile {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        if bytes.len() < 8 {
            bail!("{}: file too small for a safetensors header", path.display());
        }
        let n = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        if bytes.len() < 8 + n {
            bail!("{}: truncated safetensors header", path.display());
        }
        let header: HashMap<String, serde_json::Value> =
            serde_json::from_slice(&bytes[8..8 + n])
                .context("failed to parse safetensors header")?;
        Ok(TensorFile { bytes, header, data_start: 8 + n })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.header.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.header.keys().map(String::as_str).collect()
    }

    fn entry(&self, name: &str) -> Result<&serde_json::Value> {
        self.header
            .get(name)
            .with_context(|| format!("missing tensor `{name}`"))
    }

    pub fn shape(&self, name: &str) -> Result<Vec<usize>> {
        let entry = self.entry(name)?;
        let shape = entry["shape"]
            .as_array()
            .context("malformed shape field")?
            .iter()
            .map(|v| v.as_u64().map(|u| u as usize))
            .collect::<Option<Vec<usize>>>()
            .context("malformed shape field")?;
        Ok(shape)
    }

    fn raw_bytes(&self, name: &str) -> Result<(&[u8], &str)> {
        let entry = self.entry(name)?;
        let dtype = entry["dtype"].as_str().context("malformed dtype field")?;
        let offsets = entry["data_offsets"].as_array().context("malformed data_offsets")?;
        let s = offsets[0].as_u64().context("malformed offset")? as usize;
        let e = offsets[1].as_u64().context("malformed offset")? as usize;
        if self.data_start + e > self.bytes.len() || s > e {
            bail!("tensor `{name}` offsets out of bounds");
        }
        Ok((&self.bytes[self.data_start + s..self.data_start + e], dtype))
    }

    /// Load a tensor as an f64 vector; F32 and I32 entries are promoted.
    pub fn f64_vec(&self, name: &str) -> Result<Vec<f64>> {
        let (raw, dtype) = self.raw_bytes(name)?;
        let v = match dtype {
            "F64" => raw
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes(b.try_into().unwrap()))
                .collect(),
            "F32" => raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes(b.try_into().unwrap()) as f64)
                .collect(),
            "I32" => raw
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes(b.try_into().unwrap()) as f64)
                .collect(),
            other => bail!("tensor `{name}`: cannot read dtype {other} as f64"),
        };
        Ok(v)
    }

    pub fn i32_vec(&self, name: &str) -> Result<Vec<i32>> {
        let (raw, dtype) = self.raw_bytes(name)?;
        if dtype != "I32" {
            bail!("tensor `{name}`: expected I32, found {dtype}");
        }
        Ok(raw
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes(b.try_into().unwrap()))
            .collect())
    }

    pub fn scalar_f64(&self, name: &str) -> Result<f64> {
        let v = self.f64_vec(name)?;
        v.first().copied().with_context(|| format!("tensor `{name}` is empty"))
    }

    pub fn arr1_f64(&self, name: &str) -> Result<Array1<f64>> {
        Ok(Array1::from_vec(self.f64_vec(name)?))
    }

    pub fn arr2_f64(&self, name: &str) -> Result<Array2<f64>> {
        let shape = self.shape(name)?;
        if shape.len() != 2 {
            bail!("tensor `{name}` has {} dims, expected 2", shape.len());
        }
        Ok(Array2::from_shape_vec((shape[0], shape[1]), self.f64_vec(name)?)?)
    }

    pub fn arr3_f64(&self, name: &str) -> Result<Array3<f64>> {
        let shape = self.shape(name)?;
        if shape.len() != 3 {
            bail!("tensor `{name}` has {} dims, expected 3", shape.len());
        }
        Ok(Array3::from_shape_vec(
            (shape[0], shape[1], shape[2]),
            self.f64_vec(name)?,
        )?)
    }

    pub fn arr2_f32(&self, name: &str) -> Result<Array2<f32>> {
        let shape = self.shape(name)?;
        if shape.len() != 2 {
            bail!("tensor `{name}` has {} dims, expected 2", shape.len());
        }
        let (raw, dtype) = self.raw_bytes(name)?;
        if dtype != "F32" {
            bail!("tensor `{name}`: expected F32, found {dtype}");
        }
        let v: Vec<f32> = raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect();
        Ok(Array2::from_shape_vec((shape[0], shape[1]), v)?)
    }

    /// Read a newline-joined U8 string list.
    pub fn str_list(&self, name: &str) -> Result<Vec<String>> {
        let (raw, dtype) = self.raw_bytes(name)?;
        if dtype != "U8" {
            bail!("tensor `{name}`: expected U8 string entry, found {dtype}");
        }
        let s = std::str::from_utf8(raw).context("string entry is not UTF-8")?;
        Ok(s.split('\n').filter(|s| !s.is_empty()).map(String::from).collect())
    }
}
