//! ASCII electrode matrices and BrainVision recordings.
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{s, Array2, Array3};

use crate::error::PipelineError;
use crate::io::tensor::TensorWriter;

// ── Delimited text ────────────────────────────────────────────────────────

/// Split a delimited text file of electrode rows into fixed-size trials.
///
/// Each line is `<electrode><sep><v1><sep><v2>...`; decimal commas are
/// accepted, surrounding double quotes stripped. Electrodes are kept when
/// their name splits into exactly two parts on `sep_label_name` (when
/// non-empty) and, when `keep_electrodes` is non-empty, appear in that
/// `-`-separated list.
///
/// The sample count must be a multiple of `sample_size`; the output tensor
/// is `[n_trials, n_kept, sample_size]` under key `ts`, and the kept names
/// go to `correct_channel_names.txt`.
pub fn split_txt(
    sample_size: usize,
    txt_file: &Path,
    sep_label_name: &str,
    sep: char,
    keep_electrodes: &str,
    out_dir: &Path,
) -> Result<(PathBuf, PathBuf)> {
    let text = std::fs::read_to_string(txt_file)
        .with_context(|| format!("reading {}", txt_file.display()))?;

    let mut elec_names: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for line in text.lines() {
        let mut line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('"') && line.ends_with('"') && line.len() >= 2 {
            line = &line[1..line.len() - 1];
        }
        let (name, data) = line
            .split_once(sep)
            .with_context(|| format!("line without separator `{sep}`: {line}"))?;
        elec_names.push(name.to_string());
        let normalized = data.replace(' ', &sep.to_string());
        let mut row = Vec::new();
        for field in normalized.split(sep).filter(|f| !f.is_empty()) {
            row.push(
                field
                    .replace(',', ".")
                    .parse::<f64>()
                    .with_context(|| format!("bad value `{field}` for electrode {name}"))?,
            );
        }
        rows.push(row);
    }
    if rows.is_empty() {
        bail!("{}: no data rows", txt_file.display());
    }
    let n_samples = rows[0].len();
    if rows.iter().any(|r| r.len() != n_samples) {
        return Err(PipelineError::shape(format!(
            "{}: ragged rows, first has {n_samples} samples",
            txt_file.display()
        )));
    }

    let keep_list: Vec<&str> = if keep_electrodes.is_empty() {
        vec![]
    } else {
        keep_electrodes.split('-').collect()
    };
    let keep: Vec<bool> = elec_names
        .iter()
        .map(|name| {
            let label_ok = sep_label_name.is_empty()
                || name.split(sep_label_name).count() == 2;
            let list_ok = keep_list.is_empty() || keep_list.contains(&name.as_str());
            label_ok && list_ok
        })
        .collect();
    let kept: Vec<usize> = (0..elec_names.len()).filter(|&i| keep[i]).collect();

    let elec_names_file = out_dir.join("correct_channel_names.txt");
    let kept_names: Vec<&str> = kept.iter().map(|&i| elec_names[i].as_str()).collect();
    std::fs::write(&elec_names_file, kept_names.join("\n") + "\n")?;

    if n_samples % sample_size != 0 {
        return Err(PipelineError::shape(format!(
            "sample count {n_samples} is not a multiple of trial size {sample_size}"
        )));
    }
    let n_trials = n_samples / sample_size;
    let mut out = Array3::<f64>::zeros((n_trials, kept.len(), sample_size));
    for (row, &i) in kept.iter().enumerate() {
        for trial in 0..n_trials {
            for t in 0..sample_size {
                out[[trial, row, t]] = rows[i][trial * sample_size + t];
            }
        }
    }

    let splitted_ts_file = out_dir.join("splitted_ts.safetensors");
    let mut w = TensorWriter::new();
    w.add_arr3_f64("ts", &out);
    w.write(&splitted_ts_file)?;
    Ok((splitted_ts_file, elec_names_file))
}

// ── BrainVision ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BvFormat {
    Float32,
    Int16,
}

/// Read a BrainVision header + binary data file and split the continuous
/// record into `[n_trials, n_channels, sample_size]`.
///
/// Supports multiplexed binary data in IEEE_FLOAT_32 or INT_16; INT_16
/// values are scaled by the per-channel resolution.
pub fn read_brainvision(
    vhdr_file: &Path,
    sample_size: usize,
) -> Result<(Array3<f64>, Vec<String>, f64)> {
    let text = std::fs::read_to_string(vhdr_file)
        .with_context(|| format!("reading {}", vhdr_file.display()))?;

    let mut data_file = None::<String>;
    let mut n_chan = None::<usize>;
    let mut sampling_interval_us = None::<f64>;
    let mut format = None::<BvFormat>;
    let mut ch_names: Vec<String> = Vec::new();
    let mut resolutions: Vec<f64> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('[') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        match key {
            "DataFile" => data_file = Some(value.to_string()),
            "NumberOfChannels" => n_chan = Some(value.parse()?),
            "SamplingInterval" => sampling_interval_us = Some(value.parse()?),
            "DataOrientation" => {
                if value != "MULTIPLEXED" {
                    bail!("unsupported BrainVision orientation `{value}`");
                }
            }
            "BinaryFormat" => {
                format = Some(match value {
                    "IEEE_FLOAT_32" => BvFormat::Float32,
                    "INT_16" => BvFormat::Int16,
                    other => bail!("unsupported BrainVision binary format `{other}`"),
                });
            }
            _ if key.starts_with("Ch") && key[2..].chars().all(|c| c.is_ascii_digit()) => {
                // ChN=<name>,<reference>,<resolution>,<unit>
                let fields: Vec<&str> = value.split(',').collect();
                ch_names.push(fields.first().unwrap_or(&"").to_string());
                let res = fields.get(2).and_then(|r| r.parse::<f64>().ok()).unwrap_or(1.0);
                resolutions.push(if res == 0.0 { 1.0 } else { res });
            }
            _ => {}
        }
    }

    let data_file = data_file.context("header has no DataFile entry")?;
    let n_chan = n_chan.context("header has no NumberOfChannels entry")?;
    let interval = sampling_interval_us.context("header has no SamplingInterval entry")?;
    let format = format.context("header has no BinaryFormat entry")?;
    if ch_names.len() != n_chan {
        bail!("header lists {} channels, NumberOfChannels={}", ch_names.len(), n_chan);
    }
    let sfreq = 1e6 / interval;

    let data_path = vhdr_file.parent().unwrap_or(Path::new(".")).join(&data_file);
    let bytes = std::fs::read(&data_path)
        .with_context(|| format!("reading {}", data_path.display()))?;

    let item_len = match format {
        BvFormat::Float32 => 4,
        BvFormat::Int16 => 2,
    };
    let n_values = bytes.len() / item_len;
    let n_samples = n_values / n_chan;
    let mut data = Array2::<f64>::zeros((n_chan, n_samples));
    for t in 0..n_samples {
        for c in 0..n_chan {
            let off = (t * n_chan + c) * item_len;
            let v = match format {
                BvFormat::Float32 => {
                    f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as f64
                }
                BvFormat::Int16 => {
                    i16::from_le_bytes(bytes[off..off + 2].try_into().unwrap()) as f64
                        * resolutions[c]
                }
            };
            data[[c, t]] = v;
        }
    }

    if sample_size == 0 || n_samples % sample_size != 0 {
        return Err(PipelineError::shape(format!(
            "{n_samples} samples cannot be split into trials of {sample_size}"
        )));
    }
    let n_trials = n_samples / sample_size;
    let mut out = Array3::<f64>::zeros((n_trials, n_chan, sample_size));
    for trial in 0..n_trials {
        out.slice_mut(s![trial, .., ..]).assign(
            &data.slice(s![.., trial * sample_size..(trial + 1) * sample_size]),
        );
    }
    Ok((out, ch_names, sfreq))
}
