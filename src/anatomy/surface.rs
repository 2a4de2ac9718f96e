//! FreeSurfer binary triangle surfaces.
//!
//! On-disk layout (big-endian):
//! ```text
//! 3   magic 0xFF 0xFF 0xFE (triangle file)
//! —   comment line terminated by "\n\n"
//! 4   n_vertices  i32
//! 4   n_faces     i32
//! —   n_vertices × 3 × f32 coordinates (mm, surface RAS)
//! —   n_faces × 3 × i32 vertex indices
//! ```
use std::path::Path;

use anyhow::{bail, Context, Result};

const TRIANGLE_MAGIC: [u8; 3] = [0xff, 0xff, 0xfe];

/// Triangulated surface in surface-RAS millimetres.
#[derive(Debug, Clone)]
pub struct Surface {
    pub coords: Vec<[f64; 3]>,
    pub faces: Vec<[usize; 3]>,
}

impl Surface {
    pub fn n_vertices(&self) -> usize {
        self.coords.len()
    }

    pub fn centroid(&self) -> [f64; 3] {
        let mut c = [0.0; 3];
        for v in &self.coords {
            for i in 0..3 {
                c[i] += v[i];
            }
        }
        let n = self.coords.len().max(1) as f64;
        [c[0] / n, c[1] / n, c[2] / n]
    }

    /// Least-squares-ish sphere fit: centre at the centroid, radius the mean
    /// vertex distance from it.
    pub fn fit_sphere(&self) -> ([f64; 3], f64) {
        let c = self.centroid();
        let mut r = 0.0;
        for v in &self.coords {
            let d = [(v[0] - c[0]), (v[1] - c[1]), (v[2] - c[2])];
            r += (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
        }
        (c, r / self.coords.len().max(1) as f64)
    }

    /// Area-weighted vertex normals, normalized to unit length.
    pub fn vertex_normals(&self) -> Vec<[f64; 3]> {
        let mut normals = vec![[0.0f64; 3]; self.coords.len()];
        for f in &self.faces {
            let a = self.coords[f[0]];
            let b = self.coords[f[1]];
            let c = self.coords[f[2]];
            let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
            let n = [
                u[1] * v[2] - u[2] * v[1],
                u[2] * v[0] - u[0] * v[2],
                u[0] * v[1] - u[1] * v[0],
            ];
            for &vi in f {
                for i in 0..3 {
                    normals[vi][i] += n[i];
                }
            }
        }
        for n in &mut normals {
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            if len > 0.0 {
                for v in n.iter_mut() {
                    *v /= len;
                }
            }
        }
        normals
    }
}

/// Read a binary triangle surface.
pub fn read_surface(path: &Path) -> Result<Surface> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() < 3 || bytes[0..3] != TRIANGLE_MAGIC {
        bail!("{}: not a triangle surface file", path.display());
    }
    // Comment line ends with "\n\n".
    let mut off = 3;
    while off + 1 < bytes.len() && !(bytes[off] == b'\n' && bytes[off + 1] == b'\n') {
        off += 1;
    }
    off += 2;
    if off + 8 > bytes.len() {
        bail!("{}: truncated surface header", path.display());
    }
    let n_vert = i32::from_be_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
    let n_face = i32::from_be_bytes(bytes[off + 4..off + 8].try_into().unwrap()) as usize;
    off += 8;
    let need = off + n_vert * 12 + n_face * 12;
    if bytes.len() < need {
        bail!("{}: expected {} bytes, found {}", path.display(), need, bytes.len());
    }

    let mut coords = Vec::with_capacity(n_vert);
    for v in 0..n_vert {
        let base = off + v * 12;
        let mut p = [0f64; 3];
        for i in 0..3 {
            p[i] = f32::from_be_bytes(bytes[base + i * 4..base + i * 4 + 4].try_into().unwrap())
                as f64;
        }
        coords.push(p);
    }
    off += n_vert * 12;

    let mut faces = Vec::with_capacity(n_face);
    for f in 0..n_face {
        let base = off + f * 12;
        let mut idx = [0usize; 3];
        for i in 0..3 {
            let v = i32::from_be_bytes(bytes[base + i * 4..base + i * 4 + 4].try_into().unwrap());
            if v < 0 || v as usize >= n_vert {
                bail!("{}: face {} references vertex {}", path.display(), f, v);
            }
            idx[i] = v as usize;
        }
        faces.push(idx);
    }
    Ok(Surface { coords, faces })
}

/// Write a binary triangle surface.
pub fn write_surface(surf: &Surface, path: &Path) -> Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(&TRIANGLE_MAGIC);
    out.extend_from_slice(b"created by meegflow\n\n");
    out.extend_from_slice(&(surf.coords.len() as i32).to_be_bytes());
    out.extend_from_slice(&(surf.faces.len() as i32).to_be_bytes());
    for v in &surf.coords {
        for &c in v {
            out.extend_from_slice(&(c as f32).to_be_bytes());
        }
    }
    for f in &surf.faces {
        for &i in f {
            out.extend_from_slice(&(i as i32).to_be_bytes());
        }
    }
    std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Icosahedron subdivided `order` times and scaled onto a sphere.
///
/// Vertex counts follow the usual 12, 42, 162, 642, ... progression.
pub fn icosphere(order: usize, center: [f64; 3], radius: f64) -> Surface {
    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let mut coords: Vec<[f64; 3]> = vec![
        [-1.0, phi, 0.0], [1.0, phi, 0.0], [-1.0, -phi, 0.0], [1.0, -phi, 0.0],
        [0.0, -1.0, phi], [0.0, 1.0, phi], [0.0, -1.0, -phi], [0.0, 1.0, -phi],
        [phi, 0.0, -1.0], [phi, 0.0, 1.0], [-phi, 0.0, -1.0], [-phi, 0.0, 1.0],
    ];
    let mut faces: Vec<[usize; 3]> = vec![
        [0, 11, 5], [0, 5, 1], [0, 1, 7], [0, 7, 10], [0, 10, 11],
        [1, 5, 9], [5, 11, 4], [11, 10, 2], [10, 7, 6], [7, 1, 8],
        [3, 9, 4], [3, 4, 2], [3, 2, 6], [3, 6, 8], [3, 8, 9],
        [4, 9, 5], [2, 4, 11], [6, 2, 10], [8, 6, 7], [9, 8, 1],
    ];

    for _ in 0..order {
        let mut midpoint = std::collections::HashMap::<(usize, usize), usize>::new();
        let mut new_faces = Vec::with_capacity(faces.len() * 4);
        for f in &faces {
            let mut mid = [0usize; 3];
            for i in 0..3 {
                let (a, b) = (f[i], f[(i + 1) % 3]);
                let key = (a.min(b), a.max(b));
                mid[i] = *midpoint.entry(key).or_insert_with(|| {
                    let pa = coords[a];
                    let pb = coords[b];
                    coords.push([
                        (pa[0] + pb[0]) / 2.0,
                        (pa[1] + pb[1]) / 2.0,
                        (pa[2] + pb[2]) / 2.0,
                    ]);
                    coords.len() - 1
                });
            }
            new_faces.push([f[0], mid[0], mid[2]]);
            new_faces.push([f[1], mid[1], mid[0]]);
            new_faces.push([f[2], mid[2], mid[1]]);
            new_faces.push([mid[0], mid[1], mid[2]]);
        }
        faces = new_faces;
    }

    for v in &mut coords {
        let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        for i in 0..3 {
            v[i] = center[i] + v[i] / len * radius;
        }
    }
    Surface { coords, faces }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lh.white");
        let surf = icosphere(1, [0.0, 0.0, 40.0], 50.0);
        write_surface(&surf, &path).unwrap();
        let back = read_surface(&path).unwrap();
        assert_eq!(back.n_vertices(), surf.n_vertices());
        assert_eq!(back.faces.len(), surf.faces.len());
        for (a, b) in surf.coords.iter().zip(&back.coords) {
            for i in 0..3 {
                approx::assert_abs_diff_eq!(a[i], b[i], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn icosphere_counts() {
        assert_eq!(icosphere(0, [0.0; 3], 1.0).n_vertices(), 12);
        assert_eq!(icosphere(1, [0.0; 3], 1.0).n_vertices(), 42);
        assert_eq!(icosphere(2, [0.0; 3], 1.0).n_vertices(), 162);
    }

    #[test]
    fn sphere_fit_recovers_radius() {
        let surf = icosphere(2, [5.0, -3.0, 10.0], 60.0);
        let (c, r) = surf.fit_sphere();
        approx::assert_abs_diff_eq!(c[0], 5.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(c[2], 10.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(r, 60.0, epsilon = 1e-6);
    }

    #[test]
    fn normals_point_outward_on_sphere() {
        let surf = icosphere(1, [0.0; 3], 30.0);
        let normals = surf.vertex_normals();
        for (v, n) in surf.coords.iter().zip(&normals) {
            let dot = v[0] * n[0] + v[1] * n[1] + v[2] * n[2];
            assert!(dot.abs() > 25.0, "normal not radial: dot={dot}");
        }
    }
}
