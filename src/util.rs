//! Small shared helpers: filename handling and `*`-glob matching.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

// ── Filename handling ─────────────────────────────────────────────────────

/// Split a path into `(parent_dir, stem, extension-with-dot)`.
///
/// Composite extensions are not special-cased; `a/b_raw.safetensors` gives
/// `("a", "b_raw", ".safetensors")`.
pub fn split_filename(path: &Path) -> (PathBuf, String, String) {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    match name.rfind('.') {
        Some(i) if i > 0 => (dir, name[..i].to_string(), name[i..].to_string()),
        _ => (dir, name.to_string(), String::new()),
    }
}

// ── Wildcard matching ─────────────────────────────────────────────────────

/// Match `name` against `pattern`, where `*` matches any run of characters
/// (including empty). No other metacharacters.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    // Iterative greedy match with one backtrack point per star.
    let (mut pi, mut ni) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while ni < n.len() {
        if pi < p.len() && (p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// List files in `dir` whose names match `pattern`, sorted by name.
pub fn find_matches(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("listing directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if wildcard_match(pattern, name) {
                out.push(entry.path());
            }
        }
    }
    out.sort();
    Ok(out)
}
