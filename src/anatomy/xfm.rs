//! MNI transforms (`talairach.xfm`).
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Affine RAS→MNI305 transform read from a subject's `talairach.xfm`.
#[derive(Debug, Clone, Copy)]
pub struct MniTransform {
    /// 3×4 affine rows.
    pub m: [[f64; 4]; 3],
}

impl MniTransform {
    pub fn identity() -> Self {
        MniTransform {
            m: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
        }
    }

    /// Map a surface-RAS point (mm) to MNI (mm).
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for r in 0..3 {
            out[r] = self.m[r][0] * p[0] + self.m[r][1] * p[1] + self.m[r][2] * p[2]
                + self.m[r][3];
        }
        out
    }
}

/// Parse an MNI `.xfm` text file: three rows of four numbers after the
/// `Linear_Transform =` marker, the last row terminated by `;`.
pub fn read_xfm(path: &Path) -> Result<MniTransform> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let marker = "Linear_Transform";
    let Some(pos) = text.find(marker) else {
        bail!("{}: no Linear_Transform section", path.display());
    };
    let after = &text[pos..];
    let after = after
        .split_once('=')
        .map(|(_, rest)| rest)
        .context("malformed Linear_Transform line")?;

    let mut values = Vec::with_capacity(12);
    for tok in after.split_whitespace() {
        let tok = tok.trim_end_matches(';');
        if tok.is_empty() {
            continue;
        }
        values.push(
            tok.parse::<f64>()
                .with_context(|| format!("bad transform value `{tok}`"))?,
        );
        if values.len() == 12 {
            break;
        }
    }
    if values.len() != 12 {
        bail!("{}: expected 12 transform values, found {}", path.display(), values.len());
    }
    let mut m = [[0.0; 4]; 3];
    for r in 0..3 {
        for c in 0..4 {
            m[r][c] = values[r * 4 + c];
        }
    }
    Ok(MniTransform { m })
}

/// Write an MNI `.xfm` file.
pub fn write_xfm(t: &MniTransform, path: &Path) -> Result<()> {
    let mut s = String::from("MNI Transform File\n\nTransform_Type = Linear;\nLinear_Transform =\n");
    for r in 0..3 {
        let row = t.m[r];
        let term = if r == 2 { ";" } else { "" };
        s.push_str(&format!("{} {} {} {}{}\n", row[0], row[1], row[2], row[3], term));
    }
    std::fs::write(path, s).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
