//! Coregistration: the head↔MRI rigid transform and its on-disk discovery.
//!
//! A recording's transform file is found by widening the recording stem
//! into a wildcard pattern (separators and preprocessing suffixes become
//! `*`) and matching `<pattern>*trans.json` in the recording's directory.
//! Exactly one match is required; zero or several is fatal.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::util::{find_matches, split_filename};

/// Rigid head↔MRI transform as a 4×4 homogeneous matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordTransform {
    pub from: String,
    pub to: String,
    pub trans: [[f64; 4]; 4],
}

impl CoordTransform {
    pub fn identity(from: &str, to: &str) -> Self {
        let mut trans = [[0.0; 4]; 4];
        for i in 0..4 {
            trans[i][i] = 1.0;
        }
        CoordTransform { from: from.to_string(), to: to.to_string(), trans }
    }

    /// Apply to a point (same units as the translation column).
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for r in 0..3 {
            out[r] = self.trans[r][0] * p[0]
                + self.trans[r][1] * p[1]
                + self.trans[r][2] * p[2]
                + self.trans[r][3];
        }
        out
    }

    /// Inverse of a rigid transform (transposed rotation, negated offset).
    pub fn invert(&self) -> CoordTransform {
        let r = &self.trans;
        let mut inv = [[0.0; 4]; 4];
        for i in 0..3 {
            for j in 0..3 {
                inv[i][j] = r[j][i];
            }
        }
        for i in 0..3 {
            inv[i][3] = -(inv[i][0] * r[0][3] + inv[i][1] * r[1][3] + inv[i][2] * r[2][3]);
        }
        inv[3][3] = 1.0;
        CoordTransform { from: self.to.clone(), to: self.from.clone(), trans: inv }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Widen a recording stem into the glob used to find its transform file.
///
/// Separators (`_`, `-`) and the stage suffixes (`raw`, `filt`, `dsamp`,
/// `ica`) all become `*`, so every derivative of a recording resolves to
/// the same transform.
pub fn trans_pattern(stem: &str) -> String {
    let mut pattern = stem.to_string();
    for token in ["filt", "dsamp", "ica", "raw", "_", "-"] {
        pattern = pattern.replace(token, "*");
    }
    pattern.push_str("*trans.json");
    // Collapse runs so the glob stays readable in errors.
    while pattern.contains("**") {
        pattern = pattern.replace("**", "*");
    }
    pattern
}

/// Locate the single transform file for a recording.
///
/// A template takes precedence over the glob: its `{subject}` placeholder
/// is filled in and the resulting path (relative paths resolve against the
/// recording's directory) must exist.
pub fn find_trans_file(
    raw_file: &Path,
    subject: &str,
    template: Option<&str>,
) -> Result<PathBuf> {
    let (dir, base, _) = split_filename(raw_file);
    if let Some(tpl) = template {
        let candidate = PathBuf::from(tpl.replace("{subject}", subject));
        let candidate = if candidate.is_absolute() { candidate } else { dir.join(candidate) };
        if !candidate.is_file() {
            return Err(PipelineError::CoregAmbiguity {
                pattern: candidate.display().to_string(),
                found: 0,
            }
            .into());
        }
        return Ok(candidate);
    }
    let pattern = trans_pattern(&base);
    let matches = find_matches(&dir, &pattern)?;
    if matches.len() != 1 {
        return Err(PipelineError::CoregAmbiguity {
            pattern: dir.join(&pattern).display().to_string(),
            found: matches.len(),
        }
        .into());
    }
    Ok(matches.into_iter().next().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_widens_suffixes() {
        let p = trans_pattern("sub-01_task-rest_raw_filt_dsamp_ica");
        assert!(!p.contains("raw"));
        assert!(!p.contains("filt"));
        assert!(!p.contains("dsamp"));
        assert!(!p.contains('_'));
        assert!(p.ends_with("*trans.json"));
    }

    #[test]
    fn derivatives_share_one_trans() {
        let dir = tempfile::tempdir().unwrap();
        let trans = CoordTransform::identity("head", "mri");
        trans.to_json_file(&dir.path().join("sub-01_task-rest_raw-trans.json")).unwrap();

        for stem in ["sub-01_task-rest_raw", "sub-01_task-rest_raw_filt_dsamp_ica"] {
            let raw = dir.path().join(format!("{stem}.safetensors"));
            std::fs::write(&raw, b"x").unwrap();
            let found = find_trans_file(&raw, "sub-01", None).unwrap();
            assert!(found.ends_with("sub-01_task-rest_raw-trans.json"));
        }
    }

    #[test]
    fn template_beats_the_glob() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("sub-03_raw.safetensors");
        std::fs::write(&raw, b"x").unwrap();
        let t = CoordTransform::identity("head", "mri");
        t.to_json_file(&dir.path().join("sub-03-fiducials-trans.json")).unwrap();
        t.to_json_file(&dir.path().join("sub-03-auto-trans.json")).unwrap();

        // The glob alone is ambiguous here.
        assert!(find_trans_file(&raw, "sub-03", None).is_err());

        let found =
            find_trans_file(&raw, "sub-03", Some("{subject}-fiducials-trans.json")).unwrap();
        assert!(found.ends_with("sub-03-fiducials-trans.json"));

        let err =
            find_trans_file(&raw, "sub-04", Some("{subject}-fiducials-trans.json")).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::CoregAmbiguity { found, .. }) => assert_eq!(*found, 0),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_or_many_matches_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("sub-02_raw.safetensors");
        std::fs::write(&raw, b"x").unwrap();

        let err = find_trans_file(&raw, "sub-02", None).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::CoregAmbiguity { found, .. }) => assert_eq!(*found, 0),
            other => panic!("unexpected error: {other:?}"),
        }

        let t = CoordTransform::identity("head", "mri");
        t.to_json_file(&dir.path().join("sub-02-a-trans.json")).unwrap();
        t.to_json_file(&dir.path().join("sub-02-b-trans.json")).unwrap();
        let err = find_trans_file(&raw, "sub-02", None).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::CoregAmbiguity { found, .. }) => assert_eq!(*found, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invert_roundtrips_points() {
        let mut t = CoordTransform::identity("head", "mri");
        // Rotation about z by 90° plus a shift.
        t.trans[0] = [0.0, -1.0, 0.0, 10.0];
        t.trans[1] = [1.0, 0.0, 0.0, -5.0];
        let p = [3.0, 4.0, 5.0];
        let back = t.invert().apply(t.apply(p));
        for i in 0..3 {
            approx::assert_abs_diff_eq!(back[i], p[i], epsilon = 1e-12);
        }
    }
}
