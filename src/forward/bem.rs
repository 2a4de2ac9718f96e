//! Single-layer conductor model from the subject's inner skull.
//!
//! The model is an ico-4 (5120 triangle) inner-skull surface plus the
//! sphere fitted to it; field computation uses the sphere. When the subject
//! has no inner-skull surface a watershed-style fallback reconstructs one
//! from the brain mask volume.
//!
//! The solution is written once per subject as `<subject>-5120-bem-sol.json`
//! under `bem/`; an existing file short-circuits the computation.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::anatomy::{icosphere, read_mgz, read_surface, write_surface, SubjectsDir, Surface};
use crate::error::PipelineError;
use crate::preproc::Report;

/// Icosahedron subdivision for the model surface (5120 triangles).
pub const BEM_ICO: usize = 4;
/// Single-shell conductivity in S/m.
pub const CONDUCTIVITY: [f64; 1] = [0.3];

/// Conductor model: the fitted sphere plus surface bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BemModel {
    pub subject: String,
    pub ico: usize,
    pub conductivity: Vec<f64>,
    /// Sphere centre in surface-RAS millimetres.
    pub sphere_center_mm: [f64; 3],
    pub sphere_radius_mm: f64,
    pub n_vertices: usize,
    pub n_faces: usize,
    /// `inner_skull` when the surface came from the subject, `watershed`
    /// when reconstructed from the brain mask.
    pub surface_source: String,
}

impl BemModel {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Path of a subject's solution file.
pub fn bem_solution_file(subjects_dir: &SubjectsDir, subject: &str) -> PathBuf {
    subjects_dir.bem_dir(subject).join(format!("{subject}-5120-bem-sol.json"))
}

/// Build (or reuse) the conductor model for a subject.
///
/// Writes the solution JSON and a `BEM_report.html` with a sanity figure
/// next to it.
pub fn make_bem(subjects_dir: &SubjectsDir, subject: &str) -> Result<BemModel> {
    if !subjects_dir.exists(subject) {
        return Err(PipelineError::config(format!(
            "subject `{subject}` not found under {}",
            subjects_dir.root.display()
        )));
    }
    let sol_file = bem_solution_file(subjects_dir, subject);
    if sol_file.is_file() {
        info!(subject, "conductor model already computed, reusing");
        return BemModel::from_json_file(&sol_file);
    }
    let bem_dir = subjects_dir.bem_dir(subject);
    std::fs::create_dir_all(&bem_dir)
        .with_context(|| format!("creating {}", bem_dir.display()))?;

    let (surface, source) = load_or_reconstruct_inner_skull(subjects_dir, subject)?;
    let (center, radius) = surface.fit_sphere();

    // Resample onto the ico-4 sphere so every subject carries the same mesh
    // resolution.
    let model_surface = icosphere(BEM_ICO, center, radius);

    let model = BemModel {
        subject: subject.to_string(),
        ico: BEM_ICO,
        conductivity: CONDUCTIVITY.to_vec(),
        sphere_center_mm: center,
        sphere_radius_mm: radius,
        n_vertices: model_surface.n_vertices(),
        n_faces: model_surface.faces.len(),
        surface_source: source.to_string(),
    };
    let text = serde_json::to_string_pretty(&model)?;
    std::fs::write(&sol_file, text)
        .with_context(|| format!("writing {}", sol_file.display()))?;

    write_bem_report(&bem_dir, subject, &surface, &model)?;
    info!(subject, radius_mm = radius, source, "conductor model written");
    Ok(model)
}

fn load_or_reconstruct_inner_skull(
    subjects_dir: &SubjectsDir,
    subject: &str,
) -> Result<(Surface, &'static str)> {
    for path in [subjects_dir.inner_skull(subject), subjects_dir.inner_skull_alt(subject)] {
        if path.is_file() {
            return Ok((read_surface(&path)?, "inner_skull"));
        }
    }
    warn!(subject, "no inner-skull surface, reconstructing from the brain mask");
    let mask_file = subjects_dir.brainmask(subject);
    if !mask_file.is_file() {
        return Err(PipelineError::config(format!(
            "subject `{subject}` has neither an inner-skull surface nor {}",
            mask_file.display()
        )));
    }
    let vol = read_mgz(&mask_file)?;
    let mut center = [0.0f64; 3];
    let mut n = 0usize;
    let mut points = Vec::new();
    for k in 0..vol.dims[2] {
        for j in 0..vol.dims[1] {
            for i in 0..vol.dims[0] {
                if vol.value(i, j, k) > 0.0 {
                    let p = vol.vox2ras(i, j, k);
                    for c in 0..3 {
                        center[c] += p[c];
                    }
                    n += 1;
                    points.push(p);
                }
            }
        }
    }
    if n == 0 {
        return Err(PipelineError::shape(format!("{}: brain mask is empty", mask_file.display())));
    }
    for c in &mut center {
        *c /= n as f64;
    }
    // Radius at the 90th percentile of voxel distances keeps stray voxels
    // from inflating the shell.
    let mut dists: Vec<f64> = points
        .iter()
        .map(|p| {
            let d = [p[0] - center[0], p[1] - center[1], p[2] - center[2]];
            (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
        })
        .collect();
    dists.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((dists.len() as f64 * 0.9) as usize).min(dists.len() - 1);
    let radius = dists[idx];

    let surface = icosphere(BEM_ICO, center, radius);
    write_surface(&surface, &subjects_dir.inner_skull(subject))?;
    Ok((surface, "watershed"))
}

fn write_bem_report(bem_dir: &Path, subject: &str, surface: &Surface, model: &BemModel) -> Result<()> {
    let fig = "bem_inner_skull.png";
    plot_axial_projection(surface, model, &bem_dir.join(fig))?;
    let mut report = Report::new(format!("conductor model: {subject}"));
    report.add_section(
        "Inner skull",
        format!(
            "{} vertices / {} faces from {}; fitted sphere radius {:.1} mm",
            model.n_vertices, model.n_faces, model.surface_source, model.sphere_radius_mm
        ),
    );
    report.add_image(fig);
    report.save(&bem_dir.join("BEM_report.html"))
}

/// Axial (x, y) scatter of the surface vertices with the fitted sphere
/// equator overlaid.
fn plot_axial_projection(surface: &Surface, model: &BemModel, path: &Path) -> Result<()> {
    let root = BitMapBackend::new(path, (600, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| anyhow::anyhow!("{e}"))?;
    let c = model.sphere_center_mm;
    let r = model.sphere_radius_mm * 1.2;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(c[0] - r..c[0] + r, c[1] - r..c[1] + r)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    chart
        .configure_mesh()
        .x_desc("x (mm)")
        .y_desc("y (mm)")
        .draw()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    chart
        .draw_series(surface.coords.iter().map(|p| Circle::new((p[0], p[1]), 1, BLUE.filled())))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    chart
        .draw_series(LineSeries::new(
            (0..=360).map(|deg| {
                let a = deg as f64 * std::f64::consts::PI / 180.0;
                (
                    c[0] + model.sphere_radius_mm * a.cos(),
                    c[1] + model.sphere_radius_mm * a.sin(),
                )
            }),
            RED.stroke_width(2),
        ))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    root.present().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}
