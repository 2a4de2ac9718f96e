//! FreeSurfer `.annot` parcellation files (colortable version 2).
//!
//! Big-endian layout:
//! ```text
//! 4  n_vertices  i32
//! —  n_vertices × (vertex i32, annot_value i32)
//! 4  colortable tag (1 = present)
//! 4  -2 (negated version)
//! 4  max structure count i32
//! 4+ original table filename (length-prefixed)
//! 4  n_entries i32
//! —  per entry: structure index i32, length-prefixed name,
//!    r i32, g i32, b i32, flag i32
//! ```
//! The annot value of a vertex is `r + g·256 + b·65536` of its entry.
use std::path::Path;

use anyhow::{bail, Context, Result};

/// One parcellation label: name, color, member vertices (sorted).
#[derive(Debug, Clone)]
pub struct AnnotLabel {
    pub name: String,
    pub color: [u8; 4],
    pub vertices: Vec<usize>,
}

/// Labels of one hemisphere's annotation, in colortable order, restricted
/// to entries with at least one vertex.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub labels: Vec<AnnotLabel>,
}

fn read_i32(bytes: &[u8], off: &mut usize) -> Result<i32> {
    if *off + 4 > bytes.len() {
        bail!("truncated annotation file at offset {}", *off);
    }
    let v = i32::from_be_bytes(bytes[*off..*off + 4].try_into().unwrap());
    *off += 4;
    Ok(v)
}

fn read_prefixed_str(bytes: &[u8], off: &mut usize) -> Result<String> {
    let len = read_i32(bytes, off)? as usize;
    if *off + len > bytes.len() {
        bail!("truncated string at offset {}", *off);
    }
    let raw = &bytes[*off..*off + len];
    *off += len;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(raw[..end].iter().map(|&b| b as char).collect())
}

/// Read a `.annot` file.
pub fn read_annot(path: &Path) -> Result<Annotation> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut off = 0usize;
    let n_vert = read_i32(&bytes, &mut off)? as usize;

    let mut vertex_annot = Vec::with_capacity(n_vert);
    for _ in 0..n_vert {
        let vertex = read_i32(&bytes, &mut off)? as usize;
        let annot = read_i32(&bytes, &mut off)?;
        vertex_annot.push((vertex, annot));
    }

    let tag = read_i32(&bytes, &mut off)?;
    if tag != 1 {
        bail!("{}: no colortable present", path.display());
    }
    let neg_version = read_i32(&bytes, &mut off)?;
    if neg_version != -2 {
        bail!("{}: unsupported colortable version {}", path.display(), -neg_version);
    }
    let _max_structures = read_i32(&bytes, &mut off)?;
    let _orig_tab = read_prefixed_str(&bytes, &mut off)?;
    let n_entries = read_i32(&bytes, &mut off)? as usize;

    let mut labels = Vec::with_capacity(n_entries);
    let mut annot_of_label = Vec::with_capacity(n_entries);
    for _ in 0..n_entries {
        let _structure = read_i32(&bytes, &mut off)?;
        let name = read_prefixed_str(&bytes, &mut off)?;
        let r = read_i32(&bytes, &mut off)? as u8;
        let g = read_i32(&bytes, &mut off)? as u8;
        let b = read_i32(&bytes, &mut off)? as u8;
        let flag = read_i32(&bytes, &mut off)? as u8;
        annot_of_label.push(r as i32 + ((g as i32) << 8) + ((b as i32) << 16));
        labels.push(AnnotLabel { name, color: [r, g, b, flag], vertices: Vec::new() });
    }

    for (vertex, annot) in vertex_annot {
        if let Some(i) = annot_of_label.iter().position(|&a| a == annot) {
            labels[i].vertices.push(vertex);
        }
    }
    for l in &mut labels {
        l.vertices.sort_unstable();
    }
    labels.retain(|l| !l.vertices.is_empty());
    Ok(Annotation { labels })
}

/// Write a `.annot` file (colortable version 2).
pub fn write_annot(path: &Path, n_vertices: usize, labels: &[AnnotLabel]) -> Result<()> {
    let mut annot_of_vertex = vec![0i32; n_vertices];
    for l in labels {
        let annot =
            l.color[0] as i32 + ((l.color[1] as i32) << 8) + ((l.color[2] as i32) << 16);
        for &v in &l.vertices {
            if v >= n_vertices {
                bail!("label `{}` references vertex {} of {}", l.name, v, n_vertices);
            }
            annot_of_vertex[v] = annot;
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&(n_vertices as i32).to_be_bytes());
    for (v, &annot) in annot_of_vertex.iter().enumerate() {
        out.extend_from_slice(&(v as i32).to_be_bytes());
        out.extend_from_slice(&annot.to_be_bytes());
    }
    out.extend_from_slice(&1_i32.to_be_bytes());
    out.extend_from_slice(&(-2_i32).to_be_bytes());
    out.extend_from_slice(&(labels.len() as i32).to_be_bytes());
    let orig = b"meegflow.ctab\0";
    out.extend_from_slice(&(orig.len() as i32).to_be_bytes());
    out.extend_from_slice(orig);
    out.extend_from_slice(&(labels.len() as i32).to_be_bytes());
    for (i, l) in labels.iter().enumerate() {
        out.extend_from_slice(&(i as i32).to_be_bytes());
        let name: Vec<u8> = l.name.bytes().chain(std::iter::once(0)).collect();
        out.extend_from_slice(&(name.len() as i32).to_be_bytes());
        out.extend_from_slice(&name);
        for c in 0..4 {
            out.extend_from_slice(&(l.color[c] as i32).to_be_bytes());
        }
    }
    std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lh.aparc.annot");
        let labels = vec![
            AnnotLabel { name: "precentral".into(), color: [60, 20, 220, 0], vertices: vec![0, 2, 5] },
            AnnotLabel { name: "postcentral".into(), color: [220, 20, 20, 0], vertices: vec![1, 3] },
        ];
        write_annot(&path, 6, &labels).unwrap();

        let back = read_annot(&path).unwrap();
        assert_eq!(back.labels.len(), 2);
        assert_eq!(back.labels[0].name, "precentral");
        assert_eq!(back.labels[0].vertices, vec![0, 2, 5]);
        assert_eq!(back.labels[1].vertices, vec![1, 3]);
        assert_eq!(back.labels[1].color[0], 220);
    }

    #[test]
    fn empty_entries_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lh.aparc.annot");
        let labels = vec![
            AnnotLabel { name: "used".into(), color: [1, 2, 3, 0], vertices: vec![0, 1] },
            AnnotLabel { name: "unused".into(), color: [4, 5, 6, 0], vertices: vec![] },
        ];
        write_annot(&path, 2, &labels).unwrap();
        let back = read_annot(&path).unwrap();
        assert_eq!(back.labels.len(), 1);
        assert_eq!(back.labels[0].name, "used");
    }
}
