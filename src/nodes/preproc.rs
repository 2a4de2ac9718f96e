//! Preprocessing nodes: CTF conversion, filtering and ICA.
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::engine::{socket, Node, Payload, Sockets};
use crate::io::ctf::convert_ds_to_raw;
use crate::preproc::ica::{ComponentCount, ExclusionOverrides};
use crate::preproc::{apply_precomputed_ica, filter_stage, ica_stage, BandPass};

/// `ds_dir` -> `raw_file`: unpack a CTF dataset into a serialized recording.
pub struct ConvertDsNode {
    pub name: String,
}

impl Node for ConvertDsNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let ds_dir = socket(inputs, "ds_dir")?.as_path()?;
        let raw_file = convert_ds_to_raw(ds_dir, workdir)?;
        let mut out = Sockets::new();
        out.insert("raw_file".into(), Payload::Path(raw_file));
        Ok(out)
    }
}

/// `raw_file` -> `fif_file`: band-pass filter and optional downsampling.
pub struct FilterNode {
    pub name: String,
    pub band: BandPass,
    pub down_sfreq: Option<f64>,
}

impl Node for FilterNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let raw_file = socket(inputs, "raw_file")?.as_path()?;
        let filtered = filter_stage(raw_file, workdir, self.band, self.down_sfreq)?;
        let mut out = Sockets::new();
        out.insert("fif_file".into(), Payload::Path(filtered));
        Ok(out)
    }
}

/// `fif_file` -> cleaned recording plus the fitted solution and report.
///
/// With `overrides_file` set, operator-reviewed exclusions replace the
/// automatic ones for the node's `(subject, session)`.
pub struct IcaNode {
    pub name: String,
    pub n_components: ComponentCount,
    pub overrides_file: Option<PathBuf>,
    pub subject: String,
    pub session: String,
}

impl Node for IcaNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let fif_file = socket(inputs, "fif_file")?.as_path()?;
        let overrides = match &self.overrides_file {
            Some(path) => Some(ExclusionOverrides::from_json_file(path)?),
            None => None,
        };
        let outputs = ica_stage(
            fif_file,
            workdir,
            self.n_components,
            overrides.as_ref(),
            &self.subject,
            &self.session,
        )?;
        let mut out = Sockets::new();
        out.insert("fif_file".into(), Payload::Path(outputs.cleaned_file));
        out.insert("solution_file".into(), Payload::Path(outputs.solution_file));
        out.insert("tseries_file".into(), Payload::Path(outputs.tseries_file));
        out.insert("report_file".into(), Payload::Path(outputs.report_file));
        Ok(out)
    }
}

/// `fif_file` -> cleaned recording plus the sensor-space dumps.
///
/// Applies a previously reviewed decomposition; an override entry for
/// `(subject, session)` replaces the solution's exclusions first.
pub struct ApplyIcaNode {
    pub name: String,
    pub overrides_file: Option<PathBuf>,
    pub subject: String,
    pub session: String,
}

impl Node for ApplyIcaNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets> {
        let fif_file = socket(inputs, "fif_file")?.as_path()?;
        let overrides = match &self.overrides_file {
            Some(path) => Some(ExclusionOverrides::from_json_file(path)?),
            None => None,
        };
        let review = apply_precomputed_ica(
            fif_file,
            workdir,
            overrides.as_ref(),
            &self.subject,
            &self.session,
        )?;
        let mut out = Sockets::new();
        out.insert("fif_file".into(), Payload::Path(review.cleaned_file));
        out.insert("solution_file".into(), Payload::Path(review.solution_file));
        out.insert("ts_file".into(), Payload::Path(review.ts_file));
        out.insert("channel_coords_file".into(), Payload::Path(review.channel_coords_file));
        out.insert("channel_names_file".into(), Payload::Path(review.channel_names_file));
        out.insert("sfreq".into(), Payload::Number(review.sfreq));
        Ok(out)
    }
}
