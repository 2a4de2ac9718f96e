//! HTML reports with embedded figures.
//!
//! Reports are plain single-file HTML: each section is a heading, optional
//! body text and optional `<img>` references to PNG figures written next to
//! the report.
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array2;
use plotters::prelude::*;

/// Accumulates report sections, then renders one HTML file.
#[derive(Debug, Default)]
pub struct Report {
    title: String,
    sections: Vec<Section>,
}

#[derive(Debug)]
struct Section {
    heading: String,
    body: String,
    images: Vec<String>,
}

impl Report {
    pub fn new(title: impl Into<String>) -> Self {
        Report { title: title.into(), sections: Vec::new() }
    }

    pub fn add_section(&mut self, heading: impl Into<String>, body: impl Into<String>) {
        self.sections.push(Section { heading: heading.into(), body: body.into(), images: vec![] });
    }

    /// Attach an image (by file name relative to the report) to the last
    /// section, creating an untitled section when none exists.
    pub fn add_image(&mut self, file_name: impl Into<String>) {
        if self.sections.is_empty() {
            self.add_section("", "");
        }
        if let Some(last) = self.sections.last_mut() {
            last.images.push(file_name.into());
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
        html.push_str(&format!("<title>{}</title>", escape(&self.title)));
        html.push_str(
            "<style>body{font-family:sans-serif;margin:2em}img{max-width:48em;display:block}</style>",
        );
        html.push_str("</head><body>\n");
        html.push_str(&format!("<h1>{}</h1>\n", escape(&self.title)));
        for s in &self.sections {
            if !s.heading.is_empty() {
                html.push_str(&format!("<h2>{}</h2>\n", escape(&s.heading)));
            }
            if !s.body.is_empty() {
                html.push_str(&format!("<p>{}</p>\n", escape(&s.body)));
            }
            for img in &s.images {
                html.push_str(&format!("<img src=\"{}\" alt=\"{}\">\n", img, img));
            }
        }
        html.push_str("</body></html>\n");
        std::fs::write(path, html).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Bar chart of per-component artifact scores with the rejection threshold
/// drawn as a horizontal line.
pub fn plot_component_scores(
    scores: &[f64],
    threshold: f64,
    title: &str,
    path: &Path,
) -> Result<()> {
    let root = BitMapBackend::new(path, (800, 400)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| anyhow::anyhow!("{e}"))?;
    let y_max = scores.iter().fold(threshold, |m, &v| m.max(v)) * 1.1 + 1e-12;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 22))
        .margin(10)
        .x_label_area_size(35)
        .y_label_area_size(45)
        .build_cartesian_2d(-0.5f64..scores.len() as f64 - 0.5, 0f64..y_max)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    chart
        .configure_mesh()
        .x_desc("component")
        .y_desc("score")
        .draw()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    chart
        .draw_series(scores.iter().enumerate().map(|(i, &v)| {
            Rectangle::new([(i as f64 - 0.35, 0.0), (i as f64 + 0.35, v)], BLUE.filled())
        }))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    chart
        .draw_series(LineSeries::new(
            vec![(-0.5, threshold), (scores.len() as f64 - 0.5, threshold)],
            RED.stroke_width(2),
        ))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    root.present().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Stacked traces of the first seconds of each component time series.
pub fn plot_source_traces(
    sources: &Array2<f64>,
    sfreq: f64,
    max_seconds: f64,
    path: &Path,
) -> Result<()> {
    let n_comp = sources.nrows();
    let n_show = sources.ncols().min((max_seconds * sfreq) as usize).max(2);
    let root = BitMapBackend::new(path, (900, 120 * n_comp.max(1) as u32)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| anyhow::anyhow!("{e}"))?;
    let panels = root.split_evenly((n_comp, 1));
    for (c, panel) in panels.iter().enumerate() {
        let row = sources.row(c);
        let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
        for &v in row.iter().take(n_show) {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        if hi <= lo {
            hi = lo + 1.0;
        }
        let mut chart = ChartBuilder::on(panel)
            .margin(4)
            .y_label_area_size(50)
            .build_cartesian_2d(0f64..n_show as f64 / sfreq, lo..hi)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        chart
            .configure_mesh()
            .disable_x_mesh()
            .y_labels(2)
            .y_desc(format!("IC{c}"))
            .draw()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        chart
            .draw_series(LineSeries::new(
                (0..n_show).map(|t| (t as f64 / sfreq, row[t])),
                &BLACK,
            ))
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }
    root.present().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_renders_sections_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec-report.html");
        let mut report = Report::new("preprocessing: sub-01");
        report.add_section("Rejected components", "components [1, 3] from ECG scoring");
        report.add_image("scores.png");
        report.save(&path).unwrap();
        let html = std::fs::read_to_string(&path).unwrap();
        assert!(html.contains("<h2>Rejected components</h2>"));
        assert!(html.contains("src=\"scores.png\""));
        assert!(html.contains("sub-01"));
    }

    #[test]
    fn score_plot_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.png");
        plot_component_scores(&[0.1, 0.6, 0.05], 0.25, "cardiac scores", &path).unwrap();
        assert!(path.is_file());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn trace_plot_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.png");
        let sources = Array2::from_shape_fn((3, 500), |(c, t)| ((c + 1) as f64 * t as f64 * 0.05).sin());
        plot_source_traces(&sources, 100.0, 4.0, &path).unwrap();
        assert!(path.is_file());
    }
}
