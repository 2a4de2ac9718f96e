//! CTF-style `.ds` dataset directories.
//!
//! A dataset is a directory `<name>.ds` holding a resource file
//! `<name>.res4` (channel metadata, big-endian) and a data file
//! `<name>.meg4` (trial-major samples, big-endian i32). This module reads
//! and writes the subset of the resource file the pipelines need.
//!
//! `.res4` layout (big-endian):
//! ```text
//!   0    8  magic "MEG41RS\0"
//!   8  256  application name (null-padded Latin-1)
//! 264    4  no_samples   i32   (per trial)
//! 268    4  no_channels  i32
//! 272    8  sample_rate  f64
//! 280    4  no_trials    i32
//! 284    —  per-channel records, no_channels × 112 bytes
//! ```
//!
//! Per-channel record (112 bytes):
//! ```text
//!   0   32  name (null-padded)
//!  32    2  sensor_type  i16
//!  34    2  (pad)
//!  36    8  proper_gain  f64
//!  44    8  q_gain       f64
//!  52   24  position     3 × f64 (metres)
//!  76   24  orientation  3 × f64
//! 100   12  (pad)
//! ```
//!
//! `.meg4` holds an 8-byte magic `"MEG41CP\0"` then
//! `no_trials × no_channels × no_samples` big-endian i32 values; physical
//! units are `raw / (proper_gain × q_gain)`.
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use tracing::info;

use crate::io::raw::{ChannelKind, RawBundle, SensorChannel};

const RES4_MAGIC: &[u8; 8] = b"MEG41RS\0";
const MEG4_MAGIC: &[u8; 8] = b"MEG41CP\0";
const CHAN_REC_LEN: usize = 112;
const HDR_LEN: usize = 284;

// CTF sensor type indices.
const CTF_REF_MAG: i16 = 0;
const CTF_REF_GRAD: i16 = 1;
const CTF_GRAD: i16 = 5;
const CTF_MAG: i16 = 6;
const CTF_EEG: i16 = 9;
const CTF_EOG: i16 = 10;
const CTF_ECG: i16 = 11;

fn kind_of(sensor_type: i16) -> ChannelKind {
    match sensor_type {
        CTF_REF_MAG | CTF_REF_GRAD => ChannelKind::Reference,
        CTF_GRAD => ChannelKind::Gradiometer,
        CTF_MAG => ChannelKind::Magnetometer,
        CTF_EEG => ChannelKind::Eeg,
        CTF_EOG => ChannelKind::Eog,
        CTF_ECG => ChannelKind::Ecg,
        _ => ChannelKind::Misc,
    }
}

fn type_of(kind: ChannelKind) -> i16 {
    match kind {
        ChannelKind::Reference => CTF_REF_MAG,
        ChannelKind::Gradiometer => CTF_GRAD,
        ChannelKind::Magnetometer => CTF_MAG,
        ChannelKind::Eeg => CTF_EEG,
        ChannelKind::Eog => CTF_EOG,
        ChannelKind::Ecg => CTF_ECG,
        ChannelKind::Misc => 12,
    }
}

struct ChanRecord {
    name: String,
    sensor_type: i16,
    proper_gain: f64,
    q_gain: f64,
    pos: [f64; 3],
}

fn parse_chan_record(raw: &[u8]) -> Result<ChanRecord> {
    if raw.len() < CHAN_REC_LEN {
        bail!("channel record too short: {} bytes", raw.len());
    }
    let name_bytes = &raw[0..32];
    let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(32);
    let name: String = name_bytes[..end].iter().map(|&b| b as char).collect();
    let sensor_type = i16::from_be_bytes(raw[32..34].try_into().unwrap());
    let proper_gain = f64::from_be_bytes(raw[36..44].try_into().unwrap());
    let q_gain = f64::from_be_bytes(raw[44..52].try_into().unwrap());
    let mut pos = [0f64; 3];
    for (i, v) in pos.iter_mut().enumerate() {
        *v = f64::from_be_bytes(raw[52 + i * 8..60 + i * 8].try_into().unwrap());
    }
    Ok(ChanRecord { name, sensor_type, proper_gain, q_gain, pos })
}

/// Locate `<stem>.res4` / `<stem>.meg4` inside a `.ds` directory.
fn dataset_files(ds_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let stem = ds_dir
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("bad dataset path {}", ds_dir.display()))?;
    let res4 = ds_dir.join(format!("{stem}.res4"));
    let meg4 = ds_dir.join(format!("{stem}.meg4"));
    if !res4.is_file() {
        bail!("{}: missing resource file {}", ds_dir.display(), res4.display());
    }
    if !meg4.is_file() {
        bail!("{}: missing data file {}", ds_dir.display(), meg4.display());
    }
    Ok((res4, meg4))
}

/// Read a CTF dataset directory into a raw bundle.
///
/// Trials are concatenated along the time axis in trial order.
pub fn read_ds(ds_dir: &Path) -> Result<RawBundle> {
    let (res4_path, meg4_path) = dataset_files(ds_dir)?;
    let res4 = std::fs::read(&res4_path)
        .with_context(|| format!("reading {}", res4_path.display()))?;
    if res4.len() < HDR_LEN || &res4[0..8] != RES4_MAGIC {
        bail!("{}: not a CTF resource file", res4_path.display());
    }
    let n_samp = i32::from_be_bytes(res4[264..268].try_into().unwrap()) as usize;
    let n_chan = i32::from_be_bytes(res4[268..272].try_into().unwrap()) as usize;
    let sfreq = f64::from_be_bytes(res4[272..280].try_into().unwrap());
    let n_trials = i32::from_be_bytes(res4[280..284].try_into().unwrap()) as usize;

    let need = HDR_LEN + n_chan * CHAN_REC_LEN;
    if res4.len() < need {
        bail!(
            "{}: expected {} channel records ({} bytes), file has {}",
            res4_path.display(), n_chan, need, res4.len()
        );
    }
    let mut records = Vec::with_capacity(n_chan);
    for c in 0..n_chan {
        let off = HDR_LEN + c * CHAN_REC_LEN;
        records.push(parse_chan_record(&res4[off..off + CHAN_REC_LEN])?);
    }

    let meg4 = std::fs::read(&meg4_path)
        .with_context(|| format!("reading {}", meg4_path.display()))?;
    if meg4.len() < 8 || &meg4[0..8] != MEG4_MAGIC {
        bail!("{}: not a CTF data file", meg4_path.display());
    }
    let expect = 8 + n_trials * n_chan * n_samp * 4;
    if meg4.len() < expect {
        bail!(
            "{}: {} bytes, need {} for {}×{}×{} samples",
            meg4_path.display(), meg4.len(), expect, n_trials, n_chan, n_samp
        );
    }

    let mut data = Array2::<f64>::zeros((n_chan, n_trials * n_samp));
    for trial in 0..n_trials {
        for (c, rec) in records.iter().enumerate() {
            let gain = rec.proper_gain * rec.q_gain;
            let scale = if gain != 0.0 { 1.0 / gain } else { 1.0 };
            let base = 8 + ((trial * n_chan + c) * n_samp) * 4;
            for t in 0..n_samp {
                let off = base + t * 4;
                let v = i32::from_be_bytes(meg4[off..off + 4].try_into().unwrap());
                data[[c, trial * n_samp + t]] = v as f64 * scale;
            }
        }
    }

    let channels = records
        .iter()
        .map(|r| SensorChannel {
            name: r.name.clone(),
            kind: kind_of(r.sensor_type),
            pos: r.pos,
        })
        .collect();
    Ok(RawBundle { channels, data, sfreq, bads: vec![] })
}

/// Write a raw bundle as a CTF dataset directory (single trial).
///
/// Gains are fixed at 1e12 for MEG channels (field values are O(1e-12) T)
/// and 1e6 otherwise, so the i32 quantization keeps sub-percent precision.
pub fn write_ds(raw: &RawBundle, ds_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(ds_dir)?;
    let stem = ds_dir
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("bad dataset path {}", ds_dir.display()))?;

    let n_chan = raw.n_channels();
    let n_samp = raw.n_samples();

    let mut res4 = Vec::with_capacity(HDR_LEN + n_chan * CHAN_REC_LEN);
    res4.extend_from_slice(RES4_MAGIC);
    let mut appname = [0u8; 256];
    let tag = b"meegflow";
    appname[..tag.len()].copy_from_slice(tag);
    res4.extend_from_slice(&appname);
    res4.extend_from_slice(&(n_samp as i32).to_be_bytes());
    res4.extend_from_slice(&(n_chan as i32).to_be_bytes());
    res4.extend_from_slice(&raw.sfreq.to_be_bytes());
    res4.extend_from_slice(&1_i32.to_be_bytes());

    let gains: Vec<f64> = raw
        .channels
        .iter()
        .map(|c| if c.kind.is_meg() || c.kind == ChannelKind::Reference { 1e12 } else { 1e6 })
        .collect();

    for (c, ch) in raw.channels.iter().enumerate() {
        let mut rec = [0u8; CHAN_REC_LEN];
        let name_bytes: Vec<u8> = ch.name.bytes().take(31).collect();
        rec[..name_bytes.len()].copy_from_slice(&name_bytes);
        rec[32..34].copy_from_slice(&type_of(ch.kind).to_be_bytes());
        rec[36..44].copy_from_slice(&gains[c].to_be_bytes());
        rec[44..52].copy_from_slice(&1.0_f64.to_be_bytes());
        for i in 0..3 {
            rec[52 + i * 8..60 + i * 8].copy_from_slice(&ch.pos[i].to_be_bytes());
        }
        res4.extend_from_slice(&rec);
    }
    std::fs::write(ds_dir.join(format!("{stem}.res4")), res4)?;

    let mut meg4 = Vec::with_capacity(8 + n_chan * n_samp * 4);
    meg4.extend_from_slice(MEG4_MAGIC);
    for c in 0..n_chan {
        for t in 0..n_samp {
            let v = (raw.data[[c, t]] * gains[c]).round();
            meg4.extend_from_slice(&(v as i32).to_be_bytes());
        }
    }
    std::fs::write(ds_dir.join(format!("{stem}.meg4")), meg4)?;
    Ok(())
}

/// Convert a `.ds` dataset to the serialized raw bundle `<stem>_raw.safetensors`
/// in `out_dir`. Skips the conversion when the target already exists.
pub fn convert_ds_to_raw(ds_dir: &Path, out_dir: &Path) -> Result<PathBuf> {
    let stem = ds_dir
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("bad dataset path {}", ds_dir.display()))?;
    let target = out_dir.join(format!("{stem}_raw.safetensors"));
    if target.is_file() {
        info!(target = %target.display(), "serialized raw exists, skipping conversion");
        return Ok(target);
    }
    let raw = read_ds(ds_dir).with_context(|| format!("converting {}", ds_dir.display()))?;
    raw.save(&target)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_raw() -> RawBundle {
        let channels = vec![
            SensorChannel { name: "MLC11".into(), kind: ChannelKind::Magnetometer, pos: [0.05, 0.0, 0.1] },
            SensorChannel { name: "MLC12".into(), kind: ChannelKind::Gradiometer, pos: [0.0, 0.05, 0.1] },
            SensorChannel { name: "EEG001".into(), kind: ChannelKind::Eeg, pos: [0.0, 0.0, 0.12] },
        ];
        let data = Array2::from_shape_fn((3, 64), |(c, t)| {
            let scale = if c < 2 { 1e-12 } else { 1e-5 };
            scale * ((t as f64) * 0.1 + c as f64).sin()
        });
        RawBundle { channels, data, sfreq: 600.0, bads: vec![] }
    }

    #[test]
    fn ds_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dir.path().join("run_01.ds");
        let raw = toy_raw();
        write_ds(&raw, &ds).unwrap();

        let back = read_ds(&ds).unwrap();
        assert_eq!(back.n_channels(), 3);
        assert_eq!(back.n_samples(), 64);
        assert_eq!(back.sfreq, 600.0);
        assert_eq!(back.ch_names(), raw.ch_names());
        assert_eq!(back.channels[1].kind, ChannelKind::Gradiometer);
        // Samples are stored as f32 on disk.
        for (a, b) in raw.data.iter().zip(back.data.iter()) {
            approx::assert_relative_eq!(a, b, max_relative = 1e-6, epsilon = 1e-18);
        }
    }

    #[test]
    fn convert_skips_when_target_exists() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dir.path().join("run_01.ds");
        write_ds(&toy_raw(), &ds).unwrap();

        let out = convert_ds_to_raw(&ds, dir.path()).unwrap();
        let mtime = std::fs::metadata(&out).unwrap().modified().unwrap();
        let again = convert_ds_to_raw(&ds, dir.path()).unwrap();
        assert_eq!(out, again);
        assert_eq!(std::fs::metadata(&again).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn missing_res4_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let ds = dir.path().join("empty.ds");
        std::fs::create_dir_all(&ds).unwrap();
        assert!(read_ds(&ds).is_err());
    }
}
