//! Epoching: fixed-length windows or event-locked trials, peak-to-peak
//! rejection, baseline correction and condition averaging.
use std::collections::BTreeMap;

use anyhow::Result;
use ndarray::{s, Array2, Array3};
use tracing::info;

use crate::config::{FlatCriteria, RejectCriteria};
use crate::error::PipelineError;
use crate::io::raw::{ChannelKind, EpochsBundle, EvokedBundle, RawBundle};

/// Split a continuous recording into back-to-back windows of `duration_s`
/// seconds. Trailing samples that do not fill a window are dropped, and each
/// window gets per-channel mean baseline correction.
pub fn fixed_length_epochs(raw: &RawBundle, duration_s: f64) -> Result<EpochsBundle> {
    let n_samp = (duration_s * raw.sfreq).round() as usize;
    if n_samp == 0 || n_samp > raw.n_samples() {
        return Err(PipelineError::config(format!(
            "window of {duration_s} s ({n_samp} samples) does not fit {} samples",
            raw.n_samples()
        )));
    }
    let n_epochs = raw.n_samples() / n_samp;
    let n_ch = raw.n_channels();

    let mut data = Array3::<f64>::zeros((n_epochs, n_ch, n_samp));
    let mut events = Array2::<i32>::zeros((n_epochs, 3));
    for e in 0..n_epochs {
        let start = e * n_samp;
        data.slice_mut(s![e, .., ..])
            .assign(&raw.data.slice(s![.., start..start + n_samp]));
        events[[e, 0]] = start as i32;
        events[[e, 2]] = 1;
    }
    baseline_correct(&mut data, 0, n_samp);

    let mut event_id = BTreeMap::new();
    event_id.insert("fixed".to_string(), 1);
    Ok(EpochsBundle {
        channels: raw.channels.clone(),
        data,
        events,
        event_id,
        tmin: 0.0,
        sfreq: raw.sfreq,
    })
}

/// Cut event-locked trials from `tmin` to `tmax` seconds around each event
/// sample. Trials whose window falls outside the recording are dropped, then
/// peak-to-peak rejection and flatness checks remove bad trials.
///
/// Baseline correction subtracts the per-channel mean of the pre-stimulus
/// interval (`tmin..0`), or of the whole trial when `tmin >= 0`.
pub fn epochs_from_events(
    raw: &RawBundle,
    events: &Array2<i32>,
    event_id: &BTreeMap<String, i32>,
    tmin: f64,
    tmax: f64,
    reject: Option<&RejectCriteria>,
    flat: Option<&FlatCriteria>,
) -> Result<EpochsBundle> {
    if tmax <= tmin {
        return Err(PipelineError::config(format!("trial window {tmin}..{tmax} s is empty")));
    }
    let first = (tmin * raw.sfreq).round() as i64;
    let last = (tmax * raw.sfreq).round() as i64;
    let n_samp = (last - first) as usize + 1;
    let n_ch = raw.n_channels();
    let wanted: Vec<i32> = event_id.values().copied().collect();

    let mut kept: Vec<(usize, i32)> = Vec::new();
    for r in 0..events.nrows() {
        let code = events[[r, 2]];
        if !wanted.contains(&code) {
            continue;
        }
        let sample = events[[r, 0]] as i64;
        let start = sample + first;
        let stop = sample + last;
        if start < 0 || stop >= raw.n_samples() as i64 {
            continue;
        }
        kept.push((start as usize, code));
    }

    let mut data = Array3::<f64>::zeros((kept.len(), n_ch, n_samp));
    let mut ev = Array2::<i32>::zeros((kept.len(), 3));
    for (e, &(start, code)) in kept.iter().enumerate() {
        data.slice_mut(s![e, .., ..])
            .assign(&raw.data.slice(s![.., start..start + n_samp]));
        ev[[e, 0]] = (start as i64 - first) as i32;
        ev[[e, 2]] = code;
    }

    // Baseline over the pre-stimulus samples.
    let base_end = if tmin < 0.0 { (-first) as usize + 1 } else { n_samp };
    baseline_correct(&mut data, 0, base_end.min(n_samp));

    let mut epochs = EpochsBundle {
        channels: raw.channels.clone(),
        data,
        events: ev,
        event_id: event_id.clone(),
        tmin,
        sfreq: raw.sfreq,
    };
    if reject.is_some() || flat.is_some() {
        drop_bad(&mut epochs, reject, flat);
    }
    Ok(epochs)
}

/// Remove trials whose peak-to-peak amplitude crosses `reject` or falls
/// below `flat` on any applicable channel.
pub fn drop_bad(
    epochs: &mut EpochsBundle,
    reject: Option<&RejectCriteria>,
    flat: Option<&FlatCriteria>,
) {
    let n_e = epochs.n_epochs();
    let mut keep = Vec::with_capacity(n_e);
    for e in 0..n_e {
        let mut good = true;
        for (c, ch) in epochs.channels.iter().enumerate() {
            let row = epochs.data.slice(s![e, c, ..]);
            let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
            for &v in row.iter() {
                lo = lo.min(v);
                hi = hi.max(v);
            }
            let ptp = hi - lo;
            let limit = reject.and_then(|r| match ch.kind {
                ChannelKind::Magnetometer => r.mag,
                ChannelKind::Gradiometer => r.grad,
                ChannelKind::Eog => r.eog,
                _ => None,
            });
            if let Some(limit) = limit {
                if ptp > limit {
                    good = false;
                    break;
                }
            }
            let floor = flat.and_then(|f| match ch.kind {
                ChannelKind::Magnetometer => Some(f.mag),
                ChannelKind::Gradiometer => Some(f.grad),
                _ => None,
            });
            if let Some(floor) = floor {
                if ptp < floor {
                    good = false;
                    break;
                }
            }
        }
        if good {
            keep.push(e);
        }
    }
    if keep.len() == n_e {
        return;
    }
    info!(dropped = n_e - keep.len(), kept = keep.len(), "peak-to-peak rejection");

    let n_ch = epochs.channels.len();
    let n_t = epochs.n_samples();
    let mut data = Array3::<f64>::zeros((keep.len(), n_ch, n_t));
    let mut events = Array2::<i32>::zeros((keep.len(), 3));
    for (new, &old) in keep.iter().enumerate() {
        data.slice_mut(s![new, .., ..]).assign(&epochs.data.slice(s![old, .., ..]));
        events.row_mut(new).assign(&epochs.events.row(old));
    }
    epochs.data = data;
    epochs.events = events;
}

/// Average trials per condition, in `event_id` order.
pub fn average(epochs: &EpochsBundle) -> Result<EvokedBundle> {
    let n_ch = epochs.channels.len();
    let n_t = epochs.n_samples();
    let mut conditions = Vec::with_capacity(epochs.event_id.len());
    for (name, &code) in &epochs.event_id {
        let members: Vec<usize> = (0..epochs.n_epochs())
            .filter(|&e| epochs.events[[e, 2]] == code)
            .collect();
        if members.is_empty() {
            info!(condition = %name, "no surviving trials, skipping average");
            continue;
        }
        let mut acc = Array2::<f64>::zeros((n_ch, n_t));
        for &e in &members {
            acc += &epochs.data.slice(s![e, .., ..]);
        }
        acc /= members.len() as f64;
        conditions.push((name.clone(), acc));
    }
    if conditions.is_empty() {
        return Err(PipelineError::shape("no condition has surviving trials".to_string()));
    }
    Ok(EvokedBundle {
        channels: epochs.channels.clone(),
        conditions,
        tmin: epochs.tmin,
        sfreq: epochs.sfreq,
    })
}

fn baseline_correct(data: &mut Array3<f64>, start: usize, stop: usize) {
    let span = (stop - start).max(1) as f64;
    let (n_e, n_ch, _) = data.dim();
    for e in 0..n_e {
        for c in 0..n_ch {
            let mean: f64 = data.slice(s![e, c, start..stop]).sum() / span;
            data.slice_mut(s![e, c, ..]).mapv_inplace(|v| v - mean);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raw::SensorChannel;

    fn toy_raw(n_t: usize) -> RawBundle {
        let channels = vec![
            SensorChannel { name: "MEG 001".into(), kind: ChannelKind::Magnetometer, pos: [0.1, 0.0, 0.1] },
            SensorChannel { name: "MEG 002".into(), kind: ChannelKind::Gradiometer, pos: [0.0, 0.1, 0.1] },
        ];
        let data = Array2::from_shape_fn((2, n_t), |(c, t)| {
            1e-13 * ((c + 1) as f64) * (t as f64 * 0.1).sin() + 3.0e-12
        });
        RawBundle { channels, data, sfreq: 100.0, bads: vec![] }
    }

    #[test]
    fn fixed_length_count_and_baseline() {
        let raw = toy_raw(1000);
        let epochs = fixed_length_epochs(&raw, 2.0).unwrap();
        // 1000 samples at 100 Hz / 2 s windows → 5 epochs of 200 samples.
        assert_eq!(epochs.data.shape(), &[5, 2, 200]);
        for e in 0..5 {
            for c in 0..2 {
                let mean: f64 = epochs.data.slice(s![e, c, ..]).mean().unwrap();
                approx::assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn trailing_samples_dropped() {
        let raw = toy_raw(1030);
        let epochs = fixed_length_epochs(&raw, 2.0).unwrap();
        assert_eq!(epochs.n_epochs(), 5);
    }

    #[test]
    fn event_epochs_respect_bounds() {
        let raw = toy_raw(500);
        let events = ndarray::array![[5, 0, 7], [250, 0, 7], [495, 0, 7]];
        let mut id = BTreeMap::new();
        id.insert("stim".to_string(), 7);
        let epochs = epochs_from_events(&raw, &events, &id, -0.2, 0.5, None, None).unwrap();
        // First and last events fall too close to the recording edges.
        assert_eq!(epochs.n_epochs(), 1);
        assert_eq!(epochs.n_samples(), 71);
        assert_eq!(epochs.events[[0, 2]], 7);
    }

    #[test]
    fn rejection_drops_large_trials() {
        let mut raw = toy_raw(600);
        // Blow up the magnetometer in the second window.
        for t in 200..400 {
            raw.data[[0, t]] += 1e-11 * ((t - 200) as f64 / 200.0);
        }
        let mut epochs = fixed_length_epochs(&raw, 2.0).unwrap();
        assert_eq!(epochs.n_epochs(), 3);
        drop_bad(&mut epochs, Some(&RejectCriteria::default()), None);
        assert_eq!(epochs.n_epochs(), 2);
    }

    #[test]
    fn flat_trials_rejected() {
        let mut raw = toy_raw(400);
        for t in 0..200 {
            raw.data[[1, t]] = 5.0e-12;
        }
        let mut epochs = fixed_length_epochs(&raw, 2.0).unwrap();
        drop_bad(&mut epochs, None, Some(&FlatCriteria::default()));
        assert_eq!(epochs.n_epochs(), 1);
    }

    #[test]
    fn averaging_by_condition() {
        let raw = toy_raw(1000);
        let events = ndarray::array![[100, 0, 1], [300, 0, 2], [500, 0, 1], [700, 0, 2]];
        let mut id = BTreeMap::new();
        id.insert("left".to_string(), 1);
        id.insert("right".to_string(), 2);
        let epochs = epochs_from_events(&raw, &events, &id, -0.1, 0.4, None, None).unwrap();
        assert_eq!(epochs.n_epochs(), 4);
        let evoked = average(&epochs).unwrap();
        assert_eq!(evoked.conditions.len(), 2);
        assert_eq!(evoked.conditions[0].0, "left");
        assert_eq!(evoked.conditions[0].1.shape(), &[2, 51]);
    }
}
