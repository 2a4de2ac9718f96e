//! Regions of interest over a source space: cortical parcellation labels
//! plus one region per subcortical patch, with MNI bookkeeping files and
//! time-series extraction.
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anatomy::{read_annot, Hemi, SubjectsDir};
use crate::config::RoiAggregation;
use crate::error::PipelineError;
use crate::forward::SourceSpace;

/// One region: member sources (indices into the flattened source space),
/// their MNI coordinates and the sign flips used by flipped averaging.
#[derive(Debug, Clone)]
pub struct Roi {
    pub name: String,
    pub color: [u8; 4],
    pub sources: Vec<usize>,
    pub coords_mni: Vec<[f64; 3]>,
    pub flips: Vec<f64>,
}

/// Regions in hemisphere-then-subcortical order.
#[derive(Debug, Clone)]
pub struct RoiSet {
    pub rois: Vec<Roi>,
}

#[derive(Serialize, Deserialize)]
struct RoiJson {
    #[serde(rename = "ROI_names")]
    names: Vec<String>,
    #[serde(rename = "ROI_colors")]
    colors: Vec<[u8; 4]>,
    #[serde(rename = "ROI_coords")]
    coords: Vec<Vec<[f64; 3]>>,
}

impl RoiSet {
    pub fn names(&self) -> Vec<String> {
        self.rois.iter().map(|r| r.name.clone()).collect()
    }

    pub fn n_rois(&self) -> usize {
        self.rois.len()
    }

    /// Write `ROI.json`, `label_names.txt`, `label_coords.txt` and
    /// `label_centroid.txt` into `out_dir`.
    pub fn write_label_files(&self, out_dir: &Path) -> Result<()> {
        let json = RoiJson {
            names: self.names(),
            colors: self.rois.iter().map(|r| r.color).collect(),
            coords: self.rois.iter().map(|r| r.coords_mni.clone()).collect(),
        };
        let path = out_dir.join("ROI.json");
        std::fs::write(&path, serde_json::to_string(&json)?)
            .with_context(|| format!("writing {}", path.display()))?;

        let names = self.names().join("\n") + "\n";
        std::fs::write(out_dir.join("label_names.txt"), names)?;

        let mut coords = String::new();
        let mut centroids = String::new();
        for roi in &self.rois {
            let mut c = [0.0f64; 3];
            for p in &roi.coords_mni {
                coords.push_str(&format!("{} {} {}\n", p[0], p[1], p[2]));
                for k in 0..3 {
                    c[k] += p[k];
                }
            }
            let n = roi.coords_mni.len().max(1) as f64;
            centroids.push_str(&format!("{} {} {}\n", c[0] / n, c[1] / n, c[2] / n));
        }
        std::fs::write(out_dir.join("label_coords.txt"), coords)?;
        std::fs::write(out_dir.join("label_centroid.txt"), centroids)?;
        Ok(())
    }

    /// Aggregate a source estimate [S, T] into region time series [R, T].
    ///
    /// `MeanFlip` aligns each member with the dominant normal direction of
    /// its region before averaging, so antiparallel sources do not cancel.
    pub fn extract_time_series(
        &self,
        stc: &Array2<f64>,
        aggregation: RoiAggregation,
    ) -> Result<Array2<f64>> {
        let n_t = stc.ncols();
        let mut out = Array2::<f64>::zeros((self.rois.len(), n_t));
        for (r, roi) in self.rois.iter().enumerate() {
            if roi.sources.is_empty() {
                continue;
            }
            for (m, &s) in roi.sources.iter().enumerate() {
                if s >= stc.nrows() {
                    return Err(PipelineError::shape(format!(
                        "region `{}` references source {s} of {}",
                        roi.name,
                        stc.nrows()
                    )));
                }
                let flip = match aggregation {
                    RoiAggregation::Mean => 1.0,
                    RoiAggregation::MeanFlip => roi.flips[m],
                };
                for t in 0..n_t {
                    out[[r, t]] += flip * stc[[s, t]];
                }
            }
            let n = roi.sources.len() as f64;
            out.row_mut(r).mapv_inplace(|v| v / n);
        }
        Ok(out)
    }
}

/// Build regions for a source space: one per parcellation label that owns
/// at least one source, then one per subcortical patch.
pub fn build_rois(
    src: &SourceSpace,
    subjects_dir: &SubjectsDir,
    subject: &str,
    parc: &str,
) -> Result<RoiSet> {
    let mni = subjects_dir.mni_transform(subject);
    let all_normals = src.all_normals();
    let mut rois = Vec::new();
    let mut offset = 0usize;

    for patch in &src.patches {
        if patch.is_surface {
            let hemi = match patch.name.as_str() {
                "lh" => Hemi::Left,
                "rh" => Hemi::Right,
                other => {
                    return Err(PipelineError::config(format!(
                        "surface patch with unexpected name `{other}`"
                    )))
                }
            };
            let annot = read_annot(&subjects_dir.annot(subject, hemi, parc))?;
            for label in &annot.labels {
                if label.name == "unknown" {
                    continue;
                }
                let mut sources = Vec::new();
                let mut coords = Vec::new();
                for (i, &v) in patch.vertex_ids.iter().enumerate() {
                    if label.vertices.binary_search(&v).is_ok() {
                        sources.push(offset + i);
                        coords.push(mni.apply(patch.points_mm[i]));
                    }
                }
                if sources.is_empty() {
                    continue;
                }
                let flips = sign_flips(&sources, &all_normals);
                rois.push(Roi {
                    name: format!("{}-{}", label.name, patch.name),
                    color: label.color,
                    sources,
                    coords_mni: coords,
                    flips,
                });
            }
        } else {
            let sources: Vec<usize> = (0..patch.n_sources()).map(|i| offset + i).collect();
            let coords: Vec<[f64; 3]> =
                patch.points_mm.iter().map(|&p| mni.apply(p)).collect();
            let flips = vec![1.0; sources.len()];
            rois.push(Roi {
                name: patch.name.clone(),
                color: [120, 120, 120, 0],
                sources,
                coords_mni: coords,
                flips,
            });
        }
        offset += patch.n_sources();
    }
    info!(n_rois = rois.len(), subject, parc, "regions built");
    Ok(RoiSet { rois })
}

fn sign_flips(sources: &[usize], normals: &[[f64; 3]]) -> Vec<f64> {
    let mut mean = [0.0f64; 3];
    for &s in sources {
        for k in 0..3 {
            mean[k] += normals[s][k];
        }
    }
    sources
        .iter()
        .map(|&s| {
            let d: f64 = (0..3).map(|k| normals[s][k] * mean[k]).sum();
            if d < 0.0 {
                -1.0
            } else {
                1.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anatomy::{write_annot, write_surface, AnnotLabel};
    use crate::config::Spacing;
    use crate::forward::setup_source_space;

    fn toy_anatomy(root: &Path, subject: &str) -> SubjectsDir {
        let sd = SubjectsDir::new(root);
        std::fs::create_dir_all(sd.subject_dir(subject).join("surf")).unwrap();
        std::fs::create_dir_all(sd.subject_dir(subject).join("label")).unwrap();
        let lh = crate::anatomy::icosphere(3, [-30.0, 0.0, 40.0], 45.0);
        let rh = crate::anatomy::icosphere(3, [30.0, 0.0, 40.0], 45.0);
        let n_vert = lh.n_vertices();
        write_surface(&lh, &sd.surf(subject, Hemi::Left, "white")).unwrap();
        write_surface(&rh, &sd.surf(subject, Hemi::Right, "white")).unwrap();

        // Two labels per hemisphere: front half / back half of the sphere.
        for hemi in [Hemi::Left, Hemi::Right] {
            let surf = if hemi == Hemi::Left { &lh } else { &rh };
            let mut front = Vec::new();
            let mut back = Vec::new();
            for (v, p) in surf.coords.iter().enumerate() {
                if p[1] >= surf.centroid()[1] {
                    front.push(v);
                } else {
                    back.push(v);
                }
            }
            let labels = vec![
                AnnotLabel { name: "front".into(), color: [60, 20, 220, 0], vertices: front },
                AnnotLabel { name: "back".into(), color: [220, 60, 20, 0], vertices: back },
            ];
            write_annot(&sd.annot(subject, hemi, "aparc"), n_vert, &labels).unwrap();
        }
        sd
    }

    #[test]
    fn labels_cover_both_hemispheres() {
        let dir = tempfile::tempdir().unwrap();
        let sd = toy_anatomy(dir.path(), "sub-01");
        let src = setup_source_space(&sd, "sub-01", Spacing::Oct6).unwrap();
        let rois = build_rois(&src, &sd, "sub-01", "aparc").unwrap();
        let names = rois.names();
        assert_eq!(names, vec!["front-lh", "back-lh", "front-rh", "back-rh"]);
        // Every source belongs to exactly one region.
        let total: usize = rois.rois.iter().map(|r| r.sources.len()).sum();
        assert_eq!(total, src.n_sources());
    }

    #[test]
    fn label_files_written() {
        let dir = tempfile::tempdir().unwrap();
        let sd = toy_anatomy(dir.path(), "sub-01");
        let src = setup_source_space(&sd, "sub-01", Spacing::Oct6).unwrap();
        let rois = build_rois(&src, &sd, "sub-01", "aparc").unwrap();
        rois.write_label_files(dir.path()).unwrap();

        let names = std::fs::read_to_string(dir.path().join("label_names.txt")).unwrap();
        assert_eq!(names.trim().lines().count(), 4);
        let centroids = std::fs::read_to_string(dir.path().join("label_centroid.txt")).unwrap();
        assert_eq!(centroids.trim().lines().count(), 4);
        let coords = std::fs::read_to_string(dir.path().join("label_coords.txt")).unwrap();
        assert_eq!(coords.trim().lines().count(), src.n_sources());
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("ROI.json")).unwrap())
                .unwrap();
        assert_eq!(json["ROI_names"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn mean_and_flipped_mean() {
        let rois = RoiSet {
            rois: vec![Roi {
                name: "toy".into(),
                color: [0; 4],
                sources: vec![0, 1],
                coords_mni: vec![[0.0; 3]; 2],
                flips: vec![1.0, -1.0],
            }],
        };
        let stc = ndarray::array![[1.0, 2.0], [1.0, 2.0], [9.0, 9.0]];
        let mean = rois.extract_time_series(&stc, RoiAggregation::Mean).unwrap();
        approx::assert_abs_diff_eq!(mean[[0, 0]], 1.0);
        let flipped = rois.extract_time_series(&stc, RoiAggregation::MeanFlip).unwrap();
        // Antiparallel members cancel under the flip.
        approx::assert_abs_diff_eq!(flipped[[0, 0]], 0.0);
        approx::assert_abs_diff_eq!(flipped[[0, 1]], 0.0);
    }

    #[test]
    fn out_of_range_source_is_shape_error() {
        let rois = RoiSet {
            rois: vec![Roi {
                name: "toy".into(),
                color: [0; 4],
                sources: vec![5],
                coords_mni: vec![[0.0; 3]],
                flips: vec![1.0],
            }],
        };
        let stc = Array2::<f64>::zeros((2, 4));
        assert!(rois.extract_time_series(&stc, RoiAggregation::Mean).is_err());
    }
}
