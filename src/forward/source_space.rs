//! Source spaces: decimated cortical surfaces, optionally extended with
//! volumetric grids inside subcortical structures.
//!
//! Patch order is fixed: left hemisphere, right hemisphere, then the
//! subcortical structures in the order they were requested. Every consumer
//! of a source space relies on that ordering.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anatomy::{aseg_code, read_mgz, read_surface, write_nifti, Hemi, SubjectsDir};
use crate::config::Spacing;
use crate::error::PipelineError;

/// One patch of sources: a decimated hemisphere or a volume grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePatch {
    /// `lh`, `rh`, or the subcortical structure name.
    pub name: String,
    pub is_surface: bool,
    /// Source locations in surface-RAS millimetres.
    pub points_mm: Vec<[f64; 3]>,
    /// Per-source orientation; outward normals for surfaces, +z for volumes.
    pub normals: Vec<[f64; 3]>,
    /// For surface patches, the original vertex index of each source.
    pub vertex_ids: Vec<usize>,
}

impl SourcePatch {
    pub fn n_sources(&self) -> usize {
        self.points_mm.len()
    }
}

/// Ordered collection of source patches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpace {
    pub subject: String,
    pub spacing: String,
    pub patches: Vec<SourcePatch>,
}

impl SourceSpace {
    pub fn n_sources(&self) -> usize {
        self.patches.iter().map(|p| p.n_sources()).sum()
    }

    pub fn is_mixed(&self) -> bool {
        self.patches.iter().any(|p| !p.is_surface)
    }

    /// All source points in patch order.
    pub fn all_points(&self) -> Vec<[f64; 3]> {
        self.patches.iter().flat_map(|p| p.points_mm.iter().copied()).collect()
    }

    pub fn all_normals(&self) -> Vec<[f64; 3]> {
        self.patches.iter().flat_map(|p| p.normals.iter().copied()).collect()
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn to_json_file(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string(self)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Path of the serialized source space.
pub fn src_file(subjects_dir: &SubjectsDir, subject: &str, spacing: Spacing, mixed: bool) -> PathBuf {
    let tag = if mixed { "-aseg" } else { "" };
    subjects_dir
        .bem_dir(subject)
        .join(format!("{subject}-{}{tag}-src.json", spacing.as_str()))
}

/// Build (or reuse) a cortical source space at the given spacing.
pub fn setup_source_space(
    subjects_dir: &SubjectsDir,
    subject: &str,
    spacing: Spacing,
) -> Result<SourceSpace> {
    let out = src_file(subjects_dir, subject, spacing, false);
    if out.is_file() {
        info!(subject, spacing = spacing.as_str(), "source space already computed, reusing");
        return SourceSpace::from_json_file(&out);
    }
    std::fs::create_dir_all(subjects_dir.bem_dir(subject))?;

    let patches = vec![
        surface_patch(subjects_dir, subject, Hemi::Left, spacing)?,
        surface_patch(subjects_dir, subject, Hemi::Right, spacing)?,
    ];
    let space = SourceSpace {
        subject: subject.to_string(),
        spacing: spacing.as_str().to_string(),
        patches,
    };
    space.to_json_file(&out)?;
    info!(subject, n_sources = space.n_sources(), "source space written");
    Ok(space)
}

/// Build (or reuse) a mixed source space: cortex plus a volume grid inside
/// each named subcortical structure. Also exports the grid occupancy as a
/// NIfTI volume for visual inspection.
pub fn setup_mixed_source_space(
    subjects_dir: &SubjectsDir,
    subject: &str,
    spacing: Spacing,
    structures: &[String],
) -> Result<SourceSpace> {
    if structures.is_empty() {
        return Err(PipelineError::config(
            "mixed source space requested with no subcortical structures".to_string(),
        ));
    }
    let out = src_file(subjects_dir, subject, spacing, true);
    if out.is_file() {
        info!(subject, spacing = spacing.as_str(), "mixed source space already computed, reusing");
        return SourceSpace::from_json_file(&out);
    }
    std::fs::create_dir_all(subjects_dir.bem_dir(subject))?;

    let mut patches = vec![
        surface_patch(subjects_dir, subject, Hemi::Left, spacing)?,
        surface_patch(subjects_dir, subject, Hemi::Right, spacing)?,
    ];

    let aseg = read_mgz(&subjects_dir.aseg(subject))?;
    let grid_mm = spacing.volume_grid_mm();
    for name in structures {
        let code = aseg_code(name)?;
        let voxels = aseg.voxels_with_value(code);
        if voxels.is_empty() {
            return Err(PipelineError::config(format!(
                "structure `{name}` has no voxels in {}",
                subjects_dir.aseg(subject).display()
            )));
        }
        // Quantize voxel centres onto the grid and keep one point per cell.
        let mut cells = BTreeSet::new();
        let mut points = Vec::new();
        for [i, j, k] in voxels {
            let p = aseg.vox2ras(i, j, k);
            let cell = (
                (p[0] / grid_mm).round() as i64,
                (p[1] / grid_mm).round() as i64,
                (p[2] / grid_mm).round() as i64,
            );
            if cells.insert(cell) {
                points.push([
                    cell.0 as f64 * grid_mm,
                    cell.1 as f64 * grid_mm,
                    cell.2 as f64 * grid_mm,
                ]);
            }
        }
        let n = points.len();
        patches.push(SourcePatch {
            name: name.clone(),
            is_surface: false,
            points_mm: points,
            normals: vec![[0.0, 0.0, 1.0]; n],
            vertex_ids: vec![],
        });
    }

    let space = SourceSpace {
        subject: subject.to_string(),
        spacing: spacing.as_str().to_string(),
        patches,
    };
    space.to_json_file(&out)?;
    export_nifti(&space, grid_mm, &out.with_extension("nii"))?;
    info!(subject, n_sources = space.n_sources(), "mixed source space written");
    Ok(space)
}

fn surface_patch(
    subjects_dir: &SubjectsDir,
    subject: &str,
    hemi: Hemi,
    spacing: Spacing,
) -> Result<SourcePatch> {
    let path = subjects_dir.surf(subject, hemi, "white");
    let surf = read_surface(&path)?;
    let normals = surf.vertex_normals();
    let target = spacing.vertices_per_hemi().min(surf.n_vertices());
    if target == 0 {
        return Err(PipelineError::shape(format!("{}: empty surface", path.display())));
    }
    // Even-stride decimation keeps the vertex order and spreads sources over
    // the whole sheet.
    let stride = surf.n_vertices() as f64 / target as f64;
    let mut vertex_ids = Vec::with_capacity(target);
    let mut points = Vec::with_capacity(target);
    let mut nrm = Vec::with_capacity(target);
    for i in 0..target {
        let v = ((i as f64 * stride) as usize).min(surf.n_vertices() - 1);
        vertex_ids.push(v);
        points.push(surf.coords[v]);
        nrm.push(normals[v]);
    }
    Ok(SourcePatch {
        name: hemi.fs_name().to_string(),
        is_surface: true,
        points_mm: points,
        normals: nrm,
        vertex_ids,
    })
}

/// Rasterize the source points into a small occupancy volume.
fn export_nifti(space: &SourceSpace, grid_mm: f64, path: &Path) -> Result<()> {
    let points = space.all_points();
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for p in &points {
        for c in 0..3 {
            lo[c] = lo[c].min(p[c]);
            hi[c] = hi[c].max(p[c]);
        }
    }
    let dims: Vec<usize> = (0..3)
        .map(|c| ((hi[c] - lo[c]) / grid_mm).round() as usize + 1)
        .collect();
    let dims = [dims[0], dims[1], dims[2]];
    let mut data = vec![0.0f32; dims[0] * dims[1] * dims[2]];
    for p in &points {
        let i = ((p[0] - lo[0]) / grid_mm).round() as usize;
        let j = ((p[1] - lo[1]) / grid_mm).round() as usize;
        let k = ((p[2] - lo[2]) / grid_mm).round() as usize;
        data[i + dims[0] * (j + dims[1] * k)] = 1.0;
    }
    write_nifti(dims, [grid_mm; 3], &data, path)
}
