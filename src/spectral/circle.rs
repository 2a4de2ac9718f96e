//! Circular connectivity figure.
//!
//! Nodes are laid out on a circle grouped by hemisphere, left labels in
//! reverse order, then `Brain-Stem` when present, then right labels, so
//! homologous regions face each other across the vertical axis.
use std::path::{Path, PathBuf};

use anyhow::Result;
use ndarray::Array2;
use plotters::prelude::*;
use tracing::info;

use crate::error::PipelineError;

pub const DEFAULT_N_LINES: usize = 20;

fn is_left(name: &str) -> bool {
    name.ends_with("-lh") || name.starts_with("Left-")
}

fn is_right(name: &str) -> bool {
    name.ends_with("-rh") || name.starts_with("Right-")
}

/// Canonical angular order: reversed left, Brain-Stem, right, then the rest.
pub fn node_order(labels: &[String]) -> Vec<usize> {
    let mut left: Vec<usize> = (0..labels.len()).filter(|&i| is_left(&labels[i])).collect();
    left.reverse();
    let stem: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == "Brain-Stem").collect();
    let right: Vec<usize> = (0..labels.len()).filter(|&i| is_right(&labels[i])).collect();
    let rest: Vec<usize> = (0..labels.len())
        .filter(|&i| !is_left(&labels[i]) && !is_right(&labels[i]) && labels[i] != "Brain-Stem")
        .collect();
    left.into_iter().chain(stem).chain(right).chain(rest).collect()
}

fn symmetrize(conmat: &Array2<f64>) -> Array2<f64> {
    let n = conmat.nrows();
    Array2::from_shape_fn((n, n), |(i, j)| conmat[[i, j]].max(conmat[[j, i]]))
}

/// Render the `n_lines` strongest connections to `circle_<tag>.png`.
pub fn circle_plot(
    conmat: &Array2<f64>,
    labels: &[String],
    tag: &str,
    out_dir: &Path,
    n_lines: usize,
) -> Result<PathBuf> {
    let n = labels.len();
    if conmat.nrows() != n || conmat.ncols() != n {
        return Err(PipelineError::shape(format!(
            "connectivity is {}x{} but {n} labels were given",
            conmat.nrows(),
            conmat.ncols()
        )));
    }
    let sym = symmetrize(conmat);
    let order = node_order(labels);
    // position on the circle of each original node index
    let mut slot = vec![0usize; n];
    for (s, &i) in order.iter().enumerate() {
        slot[i] = s;
    }
    let angle = |i: usize| {
        std::f64::consts::PI / 2.0 + 2.0 * std::f64::consts::PI * slot[i] as f64 / n as f64
    };
    let pos = |i: usize, r: f64| (r * angle(i).cos(), r * angle(i).sin());

    let mut edges: Vec<(usize, usize, f64)> = Vec::new();
    for i in 1..n {
        for j in 0..i {
            if sym[[i, j]] > 0.0 {
                edges.push((i, j, sym[[i, j]]));
            }
        }
    }
    edges.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    edges.truncate(n_lines);
    let top = edges.first().map(|e| e.2).unwrap_or(1.0).max(f64::MIN_POSITIVE);

    let path = out_dir.join(format!("circle_{tag}.png"));
    {
        let root = BitMapBackend::new(&path, (800, 800)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| anyhow::anyhow!("{e}"))?;
        let chart = ChartBuilder::on(&root)
            .margin(10)
            .build_cartesian_2d(-1.4f64..1.4, -1.4f64..1.4)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let area = chart.plotting_area();

        for &(i, j, w) in &edges {
            let a = pos(i, 1.0);
            let b = pos(j, 1.0);
            let strength = (w / top).clamp(0.0, 1.0);
            let color = RGBColor(
                (255.0 * strength) as u8,
                40,
                (255.0 * (1.0 - strength)) as u8,
            );
            // chord through a midpoint pulled toward the center
            let mid = ((a.0 + b.0) / 4.0, (a.1 + b.1) / 4.0);
            area.draw(&PathElement::new(vec![a, mid, b], color.stroke_width(2)))
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        for i in 0..n {
            let p = pos(i, 1.0);
            area.draw(&Circle::new(p, 4, BLACK.filled()))
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            let t = pos(i, 1.12);
            area.draw(&Text::new(labels[i].clone(), t, ("sans-serif", 13)))
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        root.present().map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    info!(file = %path.display(), n_edges = edges.len(), "circle figure written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn order_reverses_left_and_puts_stem_at_the_boundary() {
        let labels = names(&[
            "precentral-lh",
            "precentral-rh",
            "postcentral-lh",
            "Brain-Stem",
            "postcentral-rh",
            "Left-Amygdala",
        ]);
        let order = node_order(&labels);
        let ordered: Vec<&str> = order.iter().map(|&i| labels[i].as_str()).collect();
        assert_eq!(
            ordered,
            vec![
                "Left-Amygdala",
                "postcentral-lh",
                "precentral-lh",
                "Brain-Stem",
                "precentral-rh",
                "postcentral-rh",
            ]
        );
    }

    #[test]
    fn plot_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let labels = names(&["a-lh", "b-lh", "a-rh", "b-rh"]);
        let conmat = Array2::from_shape_fn((4, 4), |(i, j)| if i > j { (i + j) as f64 } else { 0.0 });
        let path = circle_plot(&conmat, &labels, "alpha", dir.path(), 10).unwrap();
        assert!(path.ends_with("circle_alpha.png"));
        assert!(path.exists());
    }

    #[test]
    fn label_count_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let conmat = Array2::<f64>::zeros((3, 3));
        assert!(circle_plot(&conmat, &names(&["a", "b"]), "x", dir.path(), 5).is_err());
    }
}
