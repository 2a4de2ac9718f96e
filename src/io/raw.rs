//! In-memory containers for raw / epoched / evoked recordings and their
//! serialized form on top of the tensor container.
//!
//! Channel order is preserved through every derivative; a node that selects
//! channels also emits the selected label list (see [`raw_to_array`]).
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{s, Array2, Array3};

use crate::io::tensor::{TensorFile, TensorWriter};
use crate::util::split_filename;

// ── Channel metadata ──────────────────────────────────────────────────────

/// Sensor kind of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Magnetometer,
    Gradiometer,
    Eeg,
    Eog,
    Ecg,
    /// MEG reference channel; excluded from filtering and analysis picks.
    Reference,
    Misc,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Magnetometer => "mag",
            ChannelKind::Gradiometer => "grad",
            ChannelKind::Eeg => "eeg",
            ChannelKind::Eog => "eog",
            ChannelKind::Ecg => "ecg",
            ChannelKind::Reference => "ref_meg",
            ChannelKind::Misc => "misc",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "mag" => ChannelKind::Magnetometer,
            "grad" => ChannelKind::Gradiometer,
            "eeg" => ChannelKind::Eeg,
            "eog" => ChannelKind::Eog,
            "ecg" => ChannelKind::Ecg,
            "ref_meg" => ChannelKind::Reference,
            "misc" => ChannelKind::Misc,
            other => bail!("unknown channel kind `{other}`"),
        })
    }

    pub fn is_meg(self) -> bool {
        matches!(self, ChannelKind::Magnetometer | ChannelKind::Gradiometer)
    }
}

/// One channel: label, kind, 3-D location in metres.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub pos: [f64; 3],
}

// ── Raw recording ─────────────────────────────────────────────────────────

/// Continuous multi-channel recording.
#[derive(Debug, Clone)]
pub struct RawBundle {
    pub channels: Vec<SensorChannel>,
    /// [C, T]
    pub data: Array2<f64>,
    pub sfreq: f64,
    pub bads: Vec<String>,
}

impl RawBundle {
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn ch_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn find_channel(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    /// Indices of MEG channels (magnetometers + gradiometers), in order.
    pub fn meg_picks(&self) -> Vec<usize> {
        self.picks(|k| k.is_meg())
    }

    /// Indices of data channels eligible for filtering: everything except
    /// MEG reference channels.
    pub fn filter_picks(&self) -> Vec<usize> {
        self.picks(|k| k != ChannelKind::Reference)
    }

    pub fn picks(&self, keep: impl Fn(ChannelKind) -> bool) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| keep(c.kind))
            .map(|(i, _)| i)
            .collect()
    }

    /// Sub-recording with only the given channels, order preserved.
    pub fn pick_channels(&self, picks: &[usize]) -> RawBundle {
        let channels = picks.iter().map(|&i| self.channels[i].clone()).collect();
        let mut data = Array2::zeros((picks.len(), self.n_samples()));
        for (row, &i) in picks.iter().enumerate() {
            data.row_mut(row).assign(&self.data.row(i));
        }
        RawBundle { channels, data, sfreq: self.sfreq, bads: self.bads.clone() }
    }

    /// Channel positions as an `[C, 3]` array.
    pub fn chan_pos(&self) -> Array2<f64> {
        let mut pos = Array2::zeros((self.n_channels(), 3));
        for (i, c) in self.channels.iter().enumerate() {
            for j in 0..3 {
                pos[[i, j]] = c.pos[j];
            }
        }
        pos
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = TensorWriter::new();
        w.add_arr2_f64("data", &self.data);
        w.add_arr2_f64("chan_pos", &self.chan_pos());
        w.add_scalar_f64("sfreq", self.sfreq);
        w.add_str_list("ch_names", &self.ch_names());
        let kinds: Vec<String> = self.channels.iter().map(|c| c.kind.as_str().to_string()).collect();
        w.add_str_list("ch_kinds", &kinds);
        w.add_str_list("bads", &self.bads);
        w.write(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = TensorFile::open(path)?;
        let data = f.arr2_f64("data")?;
        let pos = f.arr2_f64("chan_pos")?;
        let sfreq = f.scalar_f64("sfreq")?;
        let names = f.str_list("ch_names")?;
        let kinds = f.str_list("ch_kinds")?;
        let bads = if f.contains("bads") { f.str_list("bads")? } else { vec![] };
        let channels = build_channels(&names, &kinds, &pos, data.nrows())
            .with_context(|| format!("loading {}", path.display()))?;
        Ok(RawBundle { channels, data, sfreq, bads })
    }
}

fn build_channels(
    names: &[String],
    kinds: &[String],
    pos: &Array2<f64>,
    n_chan: usize,
) -> Result<Vec<SensorChannel>> {
    if names.len() != n_chan || kinds.len() != n_chan || pos.nrows() != n_chan {
        bail!(
            "channel metadata mismatch: {} rows, {} names, {} kinds, {} positions",
            n_chan, names.len(), kinds.len(), pos.nrows()
        );
    }
    names
        .iter()
        .zip(kinds)
        .enumerate()
        .map(|(i, (name, kind))| {
            Ok(SensorChannel {
                name: name.clone(),
                kind: ChannelKind::parse(kind)?,
                pos: [pos[[i, 0]], pos[[i, 1]], pos[[i, 2]]],
            })
        })
        .collect()
}

// ── Epoched recording ─────────────────────────────────────────────────────

/// Fixed-length trials aligned to event markers.
#[derive(Debug, Clone)]
pub struct EpochsBundle {
    pub channels: Vec<SensorChannel>,
    /// [E, C, T]
    pub data: Array3<f64>,
    /// [E, 3]: (sample, previous value, event code)
    pub events: Array2<i32>,
    pub event_id: BTreeMap<String, i32>,
    pub tmin: f64,
    pub sfreq: f64,
}

impl EpochsBundle {
    pub fn n_epochs(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn n_samples(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn ch_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn meg_picks(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind.is_meg())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = TensorWriter::new();
        w.add_arr3_f64("data", &self.data);
        let ev: Vec<i32> = self.events.iter().copied().collect();
        w.add_i32("events", &ev, &[self.events.nrows(), 3]);
        w.add_scalar_f64("tmin", self.tmin);
        w.add_scalar_f64("sfreq", self.sfreq);
        let mut pos = Array2::zeros((self.channels.len(), 3));
        for (i, c) in self.channels.iter().enumerate() {
            for j in 0..3 {
                pos[[i, j]] = c.pos[j];
            }
        }
        w.add_arr2_f64("chan_pos", &pos);
        w.add_str_list("ch_names", &self.ch_names());
        let kinds: Vec<String> = self.channels.iter().map(|c| c.kind.as_str().to_string()).collect();
        w.add_str_list("ch_kinds", &kinds);
        let ids: Vec<String> = self.event_id.iter().map(|(k, v)| format!("{k}:{v}")).collect();
        w.add_str_list("event_id", &ids);
        w.write(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = TensorFile::open(path)?;
        let data = f.arr3_f64("data")?;
        let ev_shape = f.shape("events")?;
        let ev = f.i32_vec("events")?;
        let events = Array2::from_shape_vec((ev_shape[0], ev_shape[1]), ev)?;
        let tmin = f.scalar_f64("tmin")?;
        let sfreq = f.scalar_f64("sfreq")?;
        let pos = f.arr2_f64("chan_pos")?;
        let names = f.str_list("ch_names")?;
        let kinds = f.str_list("ch_kinds")?;
        let channels = build_channels(&names, &kinds, &pos, data.shape()[1])
            .with_context(|| format!("loading {}", path.display()))?;
        let mut event_id = BTreeMap::new();
        for item in f.str_list("event_id")? {
            let (name, code) = item
                .rsplit_once(':')
                .with_context(|| format!("malformed event_id entry `{item}`"))?;
            event_id.insert(name.to_string(), code.parse::<i32>()?);
        }
        Ok(EpochsBundle { channels, data, events, event_id, tmin, sfreq })
    }
}

// ── Evoked response ───────────────────────────────────────────────────────

/// Per-condition averages of an epoched recording.
#[derive(Debug, Clone)]
pub struct EvokedBundle {
    pub channels: Vec<SensorChannel>,
    /// Condition name → [C, T] average, in condition order.
    pub conditions: Vec<(String, Array2<f64>)>,
    pub tmin: f64,
    pub sfreq: f64,
}

impl EvokedBundle {
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut w = TensorWriter::new();
        let names: Vec<String> = self.conditions.iter().map(|(n, _)| n.clone()).collect();
        w.add_str_list("conditions", &names);
        for (name, data) in &self.conditions {
            w.add_arr2_f64(&format!("data_{name}"), data);
        }
        w.add_scalar_f64("tmin", self.tmin);
        w.add_scalar_f64("sfreq", self.sfreq);
        let mut pos = Array2::zeros((self.channels.len(), 3));
        for (i, c) in self.channels.iter().enumerate() {
            for j in 0..3 {
                pos[[i, j]] = c.pos[j];
            }
        }
        w.add_arr2_f64("chan_pos", &pos);
        let ch_names: Vec<String> = self.channels.iter().map(|c| c.name.clone()).collect();
        w.add_str_list("ch_names", &ch_names);
        let kinds: Vec<String> = self.channels.iter().map(|c| c.kind.as_str().to_string()).collect();
        w.add_str_list("ch_kinds", &kinds);
        w.write(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = TensorFile::open(path)?;
        let names = f.str_list("conditions")?;
        let mut conditions = Vec::with_capacity(names.len());
        for name in &names {
            conditions.push((name.clone(), f.arr2_f64(&format!("data_{name}"))?));
        }
        let tmin = f.scalar_f64("tmin")?;
        let sfreq = f.scalar_f64("sfreq")?;
        let pos = f.arr2_f64("chan_pos")?;
        let ch_names = f.str_list("ch_names")?;
        let kinds = f.str_list("ch_kinds")?;
        let n_chan = pos.nrows();
        let channels = build_channels(&ch_names, &kinds, &pos, n_chan)
            .with_context(|| format!("loading {}", path.display()))?;
        Ok(EvokedBundle { channels, conditions, tmin, sfreq })
    }
}

// ── Array dumps for the connectivity path ─────────────────────────────────

/// Dump the MEG channel time series of a serialized raw to a plain array
/// file, together with the selected channel coordinates and names.
///
/// Returns `(ts_file, channel_coords_file, channel_names_file, sfreq)`.
pub fn raw_to_array(raw_file: &Path, out_dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf, f64)> {
    let raw = RawBundle::load(raw_file)?;
    let picks = raw.meg_picks();
    let sel = raw.pick_channels(&picks);

    let (_, base, _) = split_filename(raw_file);
    let ts_file = out_dir.join(format!("{base}_ts.safetensors"));
    let mut w = TensorWriter::new();
    w.add_arr2_f64("ts", &sel.data);
    w.write(&ts_file)?;

    let coords_file = out_dir.join("correct_channel_coords.txt");
    let names_file = out_dir.join("correct_channel_names.txt");
    write_coords(&coords_file, &sel.chan_pos())?;
    std::fs::write(&names_file, sel.ch_names().join("\n") + "\n")?;

    Ok((ts_file, coords_file, names_file, raw.sfreq))
}

/// Same as [`raw_to_array`] for an epoched file: dumps `[E, C, T]`.
pub fn epochs_to_array(epo_file: &Path, out_dir: &Path) -> Result<(PathBuf, PathBuf, PathBuf, f64)> {
    let epochs = EpochsBundle::load(epo_file)?;
    let picks = epochs.meg_picks();

    let n_e = epochs.n_epochs();
    let n_t = epochs.n_samples();
    let mut data = Array3::zeros((n_e, picks.len(), n_t));
    for (row, &i) in picks.iter().enumerate() {
        data.slice_mut(s![.., row, ..])
            .assign(&epochs.data.slice(s![.., i, ..]));
    }

    let ts_file = out_dir.join("ts_epochs.safetensors");
    let mut w = TensorWriter::new();
    w.add_arr3_f64("ts", &data);
    w.write(&ts_file)?;

    let mut pos = Array2::zeros((picks.len(), 3));
    let mut names = Vec::with_capacity(picks.len());
    for (row, &i) in picks.iter().enumerate() {
        let c = &epochs.channels[i];
        for j in 0..3 {
            pos[[row, j]] = c.pos[j];
        }
        names.push(c.name.clone());
    }
    let coords_file = out_dir.join("correct_channel_coords.txt");
    let names_file = out_dir.join("correct_channel_names.txt");
    write_coords(&coords_file, &pos)?;
    std::fs::write(&names_file, names.join("\n") + "\n")?;

    Ok((ts_file, coords_file, names_file, epochs.sfreq))
}

/// Concatenate time-series files along the leading (trial) axis.
pub fn concat_ts(ts_files: &[PathBuf], out_dir: &Path) -> Result<PathBuf> {
    if ts_files.is_empty() {
        bail!("concat_ts called with no input files");
    }
    let mut all: Vec<Array3<f64>> = Vec::with_capacity(ts_files.len());
    for path in ts_files {
        let f = TensorFile::open(path)?;
        let shape = f.shape("ts")?;
        let arr = match shape.len() {
            3 => f.arr3_f64("ts")?,
            2 => {
                let a = f.arr2_f64("ts")?;
                let (r, c) = a.dim();
                a.into_shape_with_order((1, r, c))?
            }
            n => bail!("{}: `ts` has {n} dims, expected 2 or 3", path.display()),
        };
        if let Some(first) = all.first() {
            if arr.shape()[1..] != first.shape()[1..] {
                bail!(
                    "{}: trial shape {:?} differs from {:?}",
                    path.display(),
                    &arr.shape()[1..],
                    &first.shape()[1..]
                );
            }
        }
        all.push(arr);
    }
    let views: Vec<_> = all.iter().map(|a| a.view()).collect();
    let cat = ndarray::concatenate(ndarray::Axis(0), &views)?;

    let out = out_dir.join("concat_ts.safetensors");
    let mut w = TensorWriter::new();
    w.add_arr3_f64("ts", &cat);
    w.write(&out)?;
    Ok(out)
}

fn write_coords(path: &Path, pos: &Array2<f64>) -> Result<()> {
    let mut s = String::new();
    for row in pos.rows() {
        s.push_str(&format!("{} {} {}\n", row[0], row[1], row[2]));
    }
    std::fs::write(path, s)?;
    Ok(())
}
