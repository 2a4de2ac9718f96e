//! Sensor-space preprocessing: band-pass filtering, downsampling and ICA
//! artifact rejection.
//!
//! Each stage reads a serialized recording and writes a sibling with a
//! suffix appended to the stem: `_filt` after filtering, `_dsamp` after
//! downsampling, `_ica` after component rejection. A recording that passes
//! through every stage ends up as `<base>_filt_dsamp_ica.safetensors`.
pub mod epochs;
pub mod filter;
pub mod ica;
pub mod report;
pub mod resample;

use std::path::{Path, PathBuf};

use anyhow::Result;
use ndarray::Array2;
use tracing::info;

use crate::io::raw::{raw_to_array, RawBundle};
use crate::io::tensor::TensorWriter;
use crate::util::split_filename;

pub use epochs::{average, drop_bad, epochs_from_events, fixed_length_epochs};
pub use filter::{apply_fir_zero_phase, design_band, filter_1d};
pub use ica::{
    fit_ica, find_solution_file, score_artifacts, ComponentCount, ExclusionOverrides,
    IcaDecomposition,
};
pub use report::Report;
pub use resample::resample;

/// Band edges for the filtering stage. Both edges absent means the stage is
/// a no-op and adds no suffix.
#[derive(Debug, Clone, Copy, Default)]
pub struct BandPass {
    pub l_freq: Option<f64>,
    pub h_freq: Option<f64>,
}

impl BandPass {
    pub fn is_noop(&self) -> bool {
        self.l_freq.is_none() && self.h_freq.is_none()
    }
}

/// Filter and optionally downsample a serialized recording.
///
/// Returns the path of the written recording, stem suffixed per stage.
pub fn filter_stage(
    raw_file: &Path,
    out_dir: &Path,
    band: BandPass,
    down_sfreq: Option<f64>,
) -> Result<PathBuf> {
    let mut raw = RawBundle::load(raw_file)?;
    let (_, base, ext) = split_filename(raw_file);
    let mut stem = base;

    if !band.is_noop() {
        let h = design_band(band.l_freq, band.h_freq, raw.sfreq)?;
        let picks = raw.filter_picks();
        apply_fir_zero_phase(&mut raw.data, &h, &picks)?;
        stem.push_str("_filt");
        info!(l_freq = ?band.l_freq, h_freq = ?band.h_freq, taps = h.len(), "filtered");
    }

    if let Some(dst) = down_sfreq {
        raw.data = resample(&raw.data, raw.sfreq, dst)?;
        raw.sfreq = dst;
        stem.push_str("_dsamp");
        info!(sfreq = dst, "downsampled");
    }

    let out = out_dir.join(format!("{stem}{ext}"));
    raw.save(&out)?;
    Ok(out)
}

/// Everything the ICA stage writes for one recording.
#[derive(Debug, Clone)]
pub struct IcaOutputs {
    /// Cleaned recording, `<stem>_ica.safetensors`.
    pub cleaned_file: PathBuf,
    /// Fitted decomposition, `<stem>_ica_solution.safetensors`.
    pub solution_file: PathBuf,
    /// Component time series, `<stem>_ica-tseries.safetensors`.
    pub tseries_file: PathBuf,
    /// `<stem>-report.html` plus its figures.
    pub report_file: PathBuf,
}

/// Fit ICA on the MEG channels of a recording, reject cardiac and ocular
/// components (subject to any reviewer override for `(subject, session)`),
/// and write the cleaned recording, the solution, the component time series
/// and an HTML report.
pub fn ica_stage(
    raw_file: &Path,
    out_dir: &Path,
    n_components: ComponentCount,
    overrides: Option<&ExclusionOverrides>,
    subject: &str,
    session: &str,
) -> Result<IcaOutputs> {
    let mut raw = RawBundle::load(raw_file)?;
    let (_, base, ext) = split_filename(raw_file);

    let picks = raw.meg_picks();
    let picked = raw.pick_channels(&picks);
    let mut decomposition = fit_ica(&picked.data, n_components)?;
    let ecg_channel = score_artifacts(&mut decomposition, &raw, &picks)?;
    if let Some(map) = overrides {
        map.apply(&mut decomposition, subject, session);
    }

    let solution_file = out_dir.join(format!("{base}_ica_solution{ext}"));
    decomposition.save(&solution_file)?;

    let sources = decomposition.sources(&picked.data);
    let tseries_file = out_dir.join(format!("{base}_ica-tseries{ext}"));
    let mut w = TensorWriter::new();
    w.add_arr2_f64("ts", &sources);
    w.write(&tseries_file)?;

    let cleaned = decomposition.apply(&picked.data);
    replace_rows(&mut raw.data, &picks, &cleaned);
    let cleaned_file = out_dir.join(format!("{base}_ica{ext}"));
    raw.save(&cleaned_file)?;

    let report_file = out_dir.join(format!("{base}-report.html"));
    write_ica_report(&decomposition, ecg_channel.as_deref(), &sources, raw.sfreq, &report_file)?;

    Ok(IcaOutputs { cleaned_file, solution_file, tseries_file, report_file })
}

/// Everything the review pass writes for one recording.
#[derive(Debug, Clone)]
pub struct ReviewOutputs {
    /// Cleaned recording, `<stem>_ica.safetensors`.
    pub cleaned_file: PathBuf,
    /// The reviewed solution, re-saved when an override replaced its
    /// exclusions.
    pub solution_file: PathBuf,
    /// MEG time series of the cleaned recording, `<stem>_ica_ts.safetensors`.
    pub ts_file: PathBuf,
    pub channel_coords_file: PathBuf,
    pub channel_names_file: PathBuf,
    pub sfreq: f64,
}

/// Apply a previously fitted solution to a recording. The solution is found
/// next to the recording or in a sibling `ica/` directory; a missing
/// solution is fatal.
///
/// An override entry for `(subject, session)` replaces the solution's
/// exclusions before cleaning, and the solution is re-saved so the reviewed
/// set sticks. The cleaned recording is also dumped as a plain array with
/// its channel coordinates and names for the connectivity path.
pub fn apply_precomputed_ica(
    raw_file: &Path,
    out_dir: &Path,
    overrides: Option<&ExclusionOverrides>,
    subject: &str,
    session: &str,
) -> Result<ReviewOutputs> {
    let solution_file = find_solution_file(raw_file)?;
    let mut decomposition = IcaDecomposition::load(&solution_file)?;
    if let Some(map) = overrides {
        map.apply(&mut decomposition, subject, session);
        decomposition.save(&solution_file)?;
    }

    let mut raw = RawBundle::load(raw_file)?;
    let (_, base, ext) = split_filename(raw_file);
    let picks = raw.meg_picks();
    let picked = raw.pick_channels(&picks);
    let cleaned = decomposition.apply(&picked.data);
    replace_rows(&mut raw.data, &picks, &cleaned);

    let cleaned_file = out_dir.join(format!("{base}_ica{ext}"));
    raw.save(&cleaned_file)?;
    let (ts_file, channel_coords_file, channel_names_file, sfreq) =
        raw_to_array(&cleaned_file, out_dir)?;
    info!(
        solution = %solution_file.display(),
        n_excluded = decomposition.exclude.len(),
        "applied reviewed decomposition"
    );
    Ok(ReviewOutputs {
        cleaned_file,
        solution_file,
        ts_file,
        channel_coords_file,
        channel_names_file,
        sfreq,
    })
}

fn replace_rows(data: &mut Array2<f64>, picks: &[usize], rows: &Array2<f64>) {
    for (src, &dst) in picks.iter().enumerate() {
        data.row_mut(dst).assign(&rows.row(src));
    }
}

fn write_ica_report(
    decomposition: &IcaDecomposition,
    ecg_channel: Option<&str>,
    sources: &Array2<f64>,
    sfreq: f64,
    report_file: &Path,
) -> Result<()> {
    let dir = report_file.parent().unwrap_or_else(|| Path::new("."));
    let mut rep = Report::new(format!(
        "ICA: {} components, {} rejected",
        decomposition.n_components(),
        decomposition.exclude.len()
    ));

    let cardiac_note = match ecg_channel {
        Some(name) => format!("scored against ECG channel {name}"),
        None => "no ECG channel; scored against a surrogate from the MEG average".to_string(),
    };
    rep.add_section(
        "Cardiac components",
        format!("{cardiac_note}; rejected {:?}", decomposition.exclude),
    );
    let ecg_png = "ica_ecg_scores.png";
    report::plot_component_scores(
        &decomposition.ecg_scores,
        ica::ECG_THRESHOLD,
        "cardiac scores",
        &dir.join(ecg_png),
    )?;
    rep.add_image(ecg_png);

    if decomposition.eog_scores.is_empty() {
        rep.add_section("Ocular components", "no EOG channel; ocular scoring skipped");
    } else {
        rep.add_section("Ocular components", "correlation z-scores against the EOG channel");
        let eog_png = "ica_eog_scores.png";
        report::plot_component_scores(
            &decomposition.eog_scores,
            ica::EOG_THRESHOLD,
            "ocular scores",
            &dir.join(eog_png),
        )?;
        rep.add_image(eog_png);
    }

    let traces_png = "ica_sources.png";
    report::plot_source_traces(sources, sfreq, 10.0, &dir.join(traces_png))?;
    rep.add_section("Component time series", "");
    rep.add_image(traces_png);

    rep.save(report_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::raw::{ChannelKind, SensorChannel};
    use std::f64::consts::PI;

    fn synth_raw(sfreq: f64, n_t: usize) -> RawBundle {
        let channels = vec![
            SensorChannel { name: "MEG 001".into(), kind: ChannelKind::Magnetometer, pos: [0.1, 0.0, 0.1] },
            SensorChannel { name: "MEG 002".into(), kind: ChannelKind::Magnetometer, pos: [0.0, 0.1, 0.1] },
            SensorChannel { name: "MEG 003".into(), kind: ChannelKind::Gradiometer, pos: [0.1, 0.1, 0.1] },
            SensorChannel { name: "EOG 061".into(), kind: ChannelKind::Eog, pos: [0.0; 3] },
        ];
        let data = Array2::from_shape_fn((4, n_t), |(c, t)| {
            let x = t as f64 / sfreq;
            (2.0 * PI * (4.0 + c as f64) * x).sin() + 0.3 * (2.0 * PI * 45.0 * x).sin()
        });
        RawBundle { channels, data, sfreq, bads: vec![] }
    }

    #[test]
    fn filter_stage_appends_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let raw_file = dir.path().join("sub-01_task-rest_raw.safetensors");
        synth_raw(256.0, 4096).save(&raw_file).unwrap();

        let band = BandPass { l_freq: Some(1.0), h_freq: Some(40.0) };
        let out = filter_stage(&raw_file, dir.path(), band, Some(128.0)).unwrap();
        assert_eq!(
            out.file_name().unwrap().to_str().unwrap(),
            "sub-01_task-rest_raw_filt_dsamp.safetensors"
        );
        let filtered = RawBundle::load(&out).unwrap();
        assert_eq!(filtered.sfreq, 128.0);
        assert_eq!(filtered.n_samples(), 2048);
    }

    #[test]
    fn noop_band_keeps_stem() {
        let dir = tempfile::tempdir().unwrap();
        let raw_file = dir.path().join("rec_raw.safetensors");
        synth_raw(256.0, 1024).save(&raw_file).unwrap();
        let sub = dir.path().join("out");
        std::fs::create_dir(&sub).unwrap();
        let out = filter_stage(&raw_file, &sub, BandPass::default(), None).unwrap();
        assert_eq!(out.file_name().unwrap().to_str().unwrap(), "rec_raw.safetensors");
    }

    #[test]
    fn ica_stage_writes_all_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let raw_file = dir.path().join("rec_raw_filt.safetensors");
        synth_raw(200.0, 4000).save(&raw_file).unwrap();

        let outputs = ica_stage(
            &raw_file,
            dir.path(),
            ComponentCount::Fixed(3),
            None,
            "sub-01",
            "ses-01",
        )
        .unwrap();
        assert!(outputs.cleaned_file.ends_with("rec_raw_filt_ica.safetensors"));
        assert!(outputs.solution_file.is_file());
        assert!(outputs.tseries_file.is_file());
        assert!(outputs.report_file.is_file());

        let cleaned = RawBundle::load(&outputs.cleaned_file).unwrap();
        assert_eq!(cleaned.n_channels(), 4);
        // EOG channel is untouched by MEG-space cleaning.
        let orig = RawBundle::load(&raw_file).unwrap();
        for t in 0..100 {
            approx::assert_abs_diff_eq!(cleaned.data[[3, t]], orig.data[[3, t]]);
        }
    }

    #[test]
    fn precomputed_solution_found_in_sibling_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ica_dir = dir.path().join("ica");
        let preproc_dir = dir.path().join("preproc");
        std::fs::create_dir_all(&ica_dir).unwrap();
        std::fs::create_dir_all(&preproc_dir).unwrap();

        let raw_file = preproc_dir.join("rec_raw.safetensors");
        let raw = synth_raw(200.0, 4000);
        raw.save(&raw_file).unwrap();

        let picks = raw.meg_picks();
        let picked = raw.pick_channels(&picks);
        let decomposition = fit_ica(&picked.data, ComponentCount::Fixed(3)).unwrap();
        decomposition
            .save(&ica_dir.join("rec_raw_ica_solution.safetensors"))
            .unwrap();

        let out = apply_precomputed_ica(&raw_file, &preproc_dir, None, "sub-01", "ses-01").unwrap();
        assert!(out.cleaned_file.ends_with("rec_raw_ica.safetensors"));
        assert!(out.ts_file.is_file());
        assert!(out.channel_coords_file.is_file());
        assert!(out.channel_names_file.is_file());
        assert_eq!(out.sfreq, 200.0);
    }

    #[test]
    fn review_pass_pins_the_reviewed_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let raw_file = dir.path().join("rec_raw.safetensors");
        let raw = synth_raw(200.0, 4000);
        raw.save(&raw_file).unwrap();

        let picks = raw.meg_picks();
        let picked = raw.pick_channels(&picks);
        let decomposition = fit_ica(&picked.data, ComponentCount::Fixed(3)).unwrap();
        assert!(decomposition.exclude.is_empty());
        let solution_file = dir.path().join("rec_raw_ica_solution.safetensors");
        decomposition.save(&solution_file).unwrap();

        let mut sessions = std::collections::BTreeMap::new();
        sessions.insert("ses-01".to_string(), vec![1, 0]);
        let mut map = std::collections::BTreeMap::new();
        map.insert("sub-01".to_string(), sessions);
        let overrides = ExclusionOverrides(map);

        let out =
            apply_precomputed_ica(&raw_file, dir.path(), Some(&overrides), "sub-01", "ses-01")
                .unwrap();

        // The reviewed set replaces the saved one and drives the cleaning.
        let reviewed = IcaDecomposition::load(&out.solution_file).unwrap();
        assert_eq!(reviewed.exclude, vec![0, 1]);
        let cleaned = RawBundle::load(&out.cleaned_file).unwrap();
        let delta: f64 = cleaned
            .data
            .row(0)
            .iter()
            .zip(raw.data.row(0))
            .map(|(a, b)| (a - b).abs())
            .sum();
        assert!(delta > 1e-6, "rejected components left the data untouched");
    }

    #[test]
    fn missing_solution_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let raw_file = dir.path().join("rec_raw.safetensors");
        synth_raw(200.0, 2000).save(&raw_file).unwrap();
        let err =
            apply_precomputed_ica(&raw_file, dir.path(), None, "sub-01", "ses-01").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::PipelineError>(),
            Some(crate::error::PipelineError::MissingCache(_))
        ));
    }
}
