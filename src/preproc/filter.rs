//! FIR band-pass filtering: Hamming-windowed sinc design plus overlap-add
//! zero-phase convolution.
//!
//! Design rules for an edge at `f` Hz with sampling rate `sfreq`:
//!   • transition bandwidth = min(max(0.25 * f, 2.0), headroom)
//!     where headroom is `f` for a highpass edge and `nyquist - f` for a
//!     lowpass edge
//!   • filter length N      = ceil(3.3 / trans_bw * sfreq), rounded to odd
//!
//! Zero-phase is achieved by shifting the output left by `(N-1)/2` samples,
//! not by filtering twice. The edge transient is suppressed by
//! reflect-limited padding of `N-1` samples on each side.
use std::f64::consts::PI;

use anyhow::Result;
use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::error::PipelineError;

// ── Design ────────────────────────────────────────────────────────────────

/// Transition bandwidth for a filter edge at `f` Hz.
///
/// `headroom` is the widest the band may get without crossing DC (highpass)
/// or Nyquist (lowpass).
pub fn auto_trans_bandwidth(f: f64, headroom: f64) -> f64 {
    (0.25 * f).max(2.0).min(headroom)
}

/// Number of FIR taps for a given transition bandwidth, rounded to odd.
pub fn auto_filter_length(trans_bw: f64, sfreq: f64) -> usize {
    let n_raw = (3.3 / trans_bw * sfreq).ceil() as usize;
    if n_raw % 2 == 0 { n_raw + 1 } else { n_raw }
}

/// Windowed-sinc FIR design. `pass_zero=true` keeps DC (lowpass); false
/// inverts the spectrum into a highpass. `cutoff_hz` is the -6 dB point.
pub fn firwin(n: usize, cutoff_hz: f64, sfreq: f64, pass_zero: bool) -> Vec<f64> {
    debug_assert!(n % 2 == 1, "firwin requires odd N for linear-phase filter");
    let alpha = (n - 1) as f64 / 2.0;
    let nyq = sfreq / 2.0;
    let fc = cutoff_hz / nyq;

    let win = hamming(n);

    let mut h: Vec<f64> = (0..n)
        .map(|i| {
            let x = i as f64 - alpha;
            let sinc = if x == 0.0 { fc } else { (PI * fc * x).sin() / (PI * x) };
            sinc * win[i]
        })
        .collect();

    // Normalise so sum = 1 (unit DC gain for lowpass).
    let s: f64 = h.iter().sum();
    h.iter_mut().for_each(|v| *v /= s);

    if !pass_zero {
        h.iter_mut().for_each(|v| *v = -*v);
        h[n / 2] += 1.0;
    }

    h
}

/// Hamming window of length `n`.
pub fn hamming(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

/// Design the zero-phase FIR for the requested band. At least one edge must
/// be given; a lone `l_freq` yields a highpass, a lone `h_freq` a lowpass,
/// both a band-pass.
pub fn design_band(l_freq: Option<f64>, h_freq: Option<f64>, sfreq: f64) -> Result<Vec<f64>> {
    let nyq = sfreq / 2.0;
    if let Some(l) = l_freq {
        if l <= 0.0 {
            return Err(PipelineError::config(format!("highpass edge {l} Hz must be positive")));
        }
    }
    if let Some(h) = h_freq {
        if h >= nyq {
            return Err(PipelineError::config(format!(
                "lowpass edge {h} Hz is at or above Nyquist ({nyq} Hz)"
            )));
        }
    }
    if let (Some(l), Some(h)) = (l_freq, h_freq) {
        if l >= h {
            return Err(PipelineError::config(format!("band edges {l}..{h} Hz are inverted")));
        }
    }

    // Cutoffs sit at the midpoint of each transition band; the narrower band
    // dictates the tap count.
    let lo = l_freq.map(|l| {
        let tbw = auto_trans_bandwidth(l, l);
        (l - tbw / 2.0, tbw)
    });
    let hi = h_freq.map(|h| {
        let tbw = auto_trans_bandwidth(h, nyq - h);
        (h + tbw / 2.0, tbw)
    });

    let n = match (lo, hi) {
        (Some((_, ltb)), Some((_, htb))) => {
            auto_filter_length(ltb, sfreq).max(auto_filter_length(htb, sfreq))
        }
        (Some((_, tb)), None) | (None, Some((_, tb))) => auto_filter_length(tb, sfreq),
        (None, None) => {
            return Err(PipelineError::config("band-pass with neither edge set".to_string()))
        }
    };

    let h = match (lo, hi) {
        (Some((lc, _)), None) => firwin(n, lc, sfreq, false),
        (None, Some((hc, _))) => firwin(n, hc, sfreq, true),
        (Some((lc, _)), Some((hc, _))) => {
            // Band-pass = lowpass(high cutoff) - lowpass(low cutoff), same N.
            let mut band = firwin(n, hc, sfreq, true);
            let lp_lo = firwin(n, lc, sfreq, true);
            for (b, l) in band.iter_mut().zip(&lp_lo) {
                *b -= l;
            }
            band
        }
        (None, None) => unreachable!(),
    };
    Ok(h)
}

// ── Apply ─────────────────────────────────────────────────────────────────

/// Apply a zero-phase FIR filter to the given channel rows of `data` ([C, T])
/// in place. Rows outside `picks` pass through untouched.
pub fn apply_fir_zero_phase(data: &mut Array2<f64>, h: &[f64], picks: &[usize]) -> Result<()> {
    for &ch in picks {
        let row: Vec<f64> = data.row(ch).to_vec();
        let filtered = filter_1d(&row, h)?;
        data.row_mut(ch).assign(&ndarray::ArrayView1::from(&filtered));
    }
    Ok(())
}

/// Filter a single 1-D signal with the overlap-add algorithm.
///
/// Returns a vector of the same length as `x`.
pub fn filter_1d(x: &[f64], h: &[f64]) -> Result<Vec<f64>> {
    let n_x = x.len();
    let n_h = h.len();

    if n_x == 0 {
        return Ok(vec![]);
    }

    // Shift for zero-phase: (N-1)/2  (N must be odd).
    let shift = (n_h - 1) / 2;
    let n_edge = n_h - 1;

    let x_ext = reflect_limited_pad(x, n_edge, n_edge);
    let n_ext = x_ext.len();

    let n_fft = choose_fft_len(n_h, n_ext);
    let h_fft = fft_of_h(h, n_fft);

    let n_seg = n_fft - n_h + 1;
    let n_segments = n_ext.div_ceil(n_seg);
    let mut x_filtered = vec![0.0_f64; n_ext];

    let mut planner: FftPlanner<f64> = FftPlanner::new();
    let fft_fwd = planner.plan_fft_forward(n_fft);
    let fft_inv = planner.plan_fft_inverse(n_fft);
    let inv_scale = 1.0 / n_fft as f64;

    for seg_idx in 0..n_segments {
        let start = seg_idx * n_seg;
        let stop = (start + n_seg).min(n_ext);

        let mut buf: Vec<Complex<f64>> = x_ext[start..stop]
            .iter()
            .map(|&v| Complex { re: v, im: 0.0 })
            .chain(std::iter::repeat(Complex::default()))
            .take(n_fft)
            .collect();

        fft_fwd.process(&mut buf);

        for (b, &hf) in buf.iter_mut().zip(h_fft.iter()) {
            *b *= hf;
        }

        fft_inv.process(&mut buf);

        // Accumulate with overlap-add (accounting for zero-phase shift).
        let out_start = start.saturating_sub(shift);
        let out_end = (out_start + n_fft).min(n_ext);
        let prod_start = if start < shift { shift - start } else { 0 };

        for (o, p) in (out_start..out_end).zip(prod_start..) {
            if p < buf.len() {
                x_filtered[o] += buf[p].re * inv_scale;
            }
        }
    }

    Ok(x_filtered[n_edge..n_edge + n_x].to_vec())
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Reflect-limited padding.
///
/// Left:  `pad[i] = 2*x[0] - x[n_l-i]`  for i in 1..=n_l
/// Right: `pad[i] = 2*x[-1] - x[-(i+1)]` for i in 1..=n_r
pub(crate) fn reflect_limited_pad(x: &[f64], n_l: usize, n_r: usize) -> Vec<f64> {
    let n = x.len();
    let actual_l = n_l.min(n - 1);
    let actual_r = n_r.min(n - 1);

    let mut out = Vec::with_capacity(actual_l + n + actual_r);

    for i in (1..=actual_l).rev() {
        out.push(2.0 * x[0] - x[i]);
    }
    // If requested padding exceeds signal, prepend zeros.
    for _ in actual_l..n_l {
        out.insert(0, 0.0);
    }

    out.extend_from_slice(x);

    let last = x[n - 1];
    for i in 1..=actual_r {
        let idx = (n - 1).saturating_sub(i);
        out.push(2.0 * last - x[idx]);
    }
    for _ in actual_r..n_r {
        out.push(0.0);
    }

    out
}

/// Choose the FFT block size (power of 2 minimising operation count):
///   `cost = ceil(n_x / (N - n_h + 1)) * N * (log2(N) + 1) + 4e-5 * N * n_x`
fn choose_fft_len(n_h: usize, n_x: usize) -> usize {
    let min_fft = 2 * n_h - 1;

    let max_pow = (n_x as f64).log2().ceil() as u32 + 1;
    let min_pow = (min_fft as f64).log2().ceil() as u32;

    let mut best_n = 1_usize << max_pow;
    let mut best_cost = f64::INFINITY;

    for pow in min_pow..=max_pow {
        let n = 1_usize << pow;
        if n < min_fft {
            continue;
        }
        let n_seg = (n - n_h + 1) as f64;
        let cost = (n_x as f64 / n_seg).ceil() * n as f64 * (pow as f64 + 1.0)
            + 4e-5 * n as f64 * n_x as f64;
        if cost < best_cost {
            best_cost = cost;
            best_n = n;
        }
    }
    best_n
}

fn fft_of_h(h: &[f64], n_fft: usize) -> Vec<Complex<f64>> {
    let mut buf: Vec<Complex<f64>> = h
        .iter()
        .map(|&v| Complex { re: v, im: 0.0 })
        .chain(std::iter::repeat(Complex::default()))
        .take(n_fft)
        .collect();
    let mut planner: FftPlanner<f64> = FftPlanner::new();
    planner.plan_fft_forward(n_fft).process(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_length_is_odd() {
        for l_freq in [0.5_f64, 1.0, 2.0, 5.0] {
            let tb = auto_trans_bandwidth(l_freq, l_freq);
            let n = auto_filter_length(tb, 256.0);
            assert!(n % 2 == 1, "N={n} is even for l_freq={l_freq}");
        }
    }

    #[test]
    fn highpass_sum_near_zero() {
        // A highpass filter should sum to ≈ 0 (no DC component passes).
        let h = design_band(Some(0.5), None, 256.0).unwrap();
        let s: f64 = h.iter().sum();
        assert!(s.abs() < 1e-5, "highpass sum = {s}");
    }

    #[test]
    fn bandpass_is_symmetric() {
        // Linear-phase FIR must be symmetric.
        let h = design_band(Some(1.0), Some(40.0), 256.0).unwrap();
        let n = h.len();
        for i in 0..n / 2 {
            approx::assert_abs_diff_eq!(h[i], h[n - 1 - i], epsilon = 1e-12);
        }
    }

    #[test]
    fn highpass_known_length_256hz() {
        // At 256 Hz with a 0.5 Hz edge the design yields 1691 taps.
        let h = design_band(Some(0.5), None, 256.0).unwrap();
        assert_eq!(h.len(), 1691, "expected 1691 taps, got {}", h.len());
    }

    #[test]
    fn lowpass_dc_gain_unity() {
        let h = firwin(101, 10.0, 256.0, true);
        let dc: f64 = h.iter().sum();
        approx::assert_abs_diff_eq!(dc, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn inverted_band_rejected() {
        assert!(design_band(Some(40.0), Some(1.0), 256.0).is_err());
        assert!(design_band(None, None, 256.0).is_err());
        assert!(design_band(None, Some(200.0), 256.0).is_err());
    }

    #[test]
    fn filter_preserves_length() {
        let x: Vec<f64> = (0..1024).map(|i| (i as f64 / 1024.0).sin()).collect();
        let h = design_band(Some(0.5), None, 256.0).unwrap();
        let y = filter_1d(&x, &h).unwrap();
        assert_eq!(y.len(), x.len());
    }

    #[test]
    fn highpass_removes_dc() {
        let x = vec![1.0_f64; 4096];
        let h = design_band(Some(0.5), None, 256.0).unwrap();
        let y = filter_1d(&x, &h).unwrap();
        // Skip edges (transient region = filter length).
        let n_h = h.len();
        let interior = &y[n_h..y.len() - n_h];
        let max_val: f64 = interior.iter().map(|v| v.abs()).fold(0.0_f64, f64::max);
        assert!(max_val < 1e-3, "DC not removed: max={max_val}");
    }

    #[test]
    fn bandpass_keeps_inband_tone() {
        let sfreq = 256.0;
        let x: Vec<f64> = (0..4096)
            .map(|i| (2.0 * PI * 10.0 * i as f64 / sfreq).sin())
            .collect();
        let h = design_band(Some(1.0), Some(40.0), sfreq).unwrap();
        let y = filter_1d(&x, &h).unwrap();
        let n_h = h.len();
        let rms_in: f64 = x[n_h..x.len() - n_h].iter().map(|v| v * v).sum::<f64>().sqrt();
        let rms_out: f64 = y[n_h..y.len() - n_h].iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((rms_out / rms_in - 1.0).abs() < 0.05, "10 Hz tone attenuated");
    }

    #[test]
    fn picks_limit_filtering() {
        let mut data = Array2::from_elem((2, 2048), 1.0_f64);
        let h = design_band(Some(0.5), None, 256.0).unwrap();
        apply_fir_zero_phase(&mut data, &h, &[0]).unwrap();
        let mid = data.ncols() / 2;
        assert!(data[[0, mid]].abs() < 1e-3);
        approx::assert_abs_diff_eq!(data[[1, mid]], 1.0);
    }

    #[test]
    fn reflect_limited_left_pad() {
        let x = [1.0_f64, 2.0, 3.0, 4.0, 5.0];
        let padded = reflect_limited_pad(&x, 3, 0);
        // left pad: 2*1 - x[3]=4 → -2, 2*1 - x[2]=3 → -1, 2*1 - x[1]=2 → 0
        assert_eq!(&padded[..3], &[-2.0_f64, -1.0, 0.0]);
        assert_eq!(&padded[3..], &x[..]);
    }
}
