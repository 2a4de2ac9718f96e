//! Per-node result cache.
//!
//! Each node gets `<base>/<workflow>/<node>/` as its working directory.
//! The engine records the input sockets and the produced outputs as JSON;
//! a later run with byte-identical inputs whose output files still exist
//! returns the recorded outputs without executing the node.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::engine::node::{Payload, Sockets};

const INPUTS_FILE: &str = "inputs.json";
const OUTPUTS_FILE: &str = "outputs.json";

pub struct NodeCache {
    dir: PathBuf,
}

impl NodeCache {
    pub fn new(base: &Path, workflow: &str, node: &str) -> Result<Self> {
        let dir = base.join(workflow).join(node);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating workdir {}", dir.display()))?;
        Ok(NodeCache { dir })
    }

    pub fn workdir(&self) -> &Path {
        &self.dir
    }

    /// Recorded outputs for these exact inputs, provided every output file
    /// still exists on disk.
    pub fn lookup(&self, inputs: &Sockets) -> Result<Option<Sockets>> {
        let inputs_path = self.dir.join(INPUTS_FILE);
        let outputs_path = self.dir.join(OUTPUTS_FILE);
        if !inputs_path.exists() || !outputs_path.exists() {
            return Ok(None);
        }
        let recorded = std::fs::read_to_string(&inputs_path)?;
        if recorded != serde_json::to_string(inputs)? {
            return Ok(None);
        }
        let outputs: Sockets = serde_json::from_str(&std::fs::read_to_string(&outputs_path)?)
            .with_context(|| format!("parsing {}", outputs_path.display()))?;
        if !outputs_present(&outputs) {
            debug!(dir = %self.dir.display(), "cached outputs vanished, re-running");
            return Ok(None);
        }
        Ok(Some(outputs))
    }

    pub fn store(&self, inputs: &Sockets, outputs: &Sockets) -> Result<()> {
        std::fs::write(self.dir.join(INPUTS_FILE), serde_json::to_string(inputs)?)?;
        std::fs::write(self.dir.join(OUTPUTS_FILE), serde_json::to_string(outputs)?)?;
        Ok(())
    }
}

fn outputs_present(outputs: &Sockets) -> bool {
    outputs.values().all(|p| match p {
        Payload::Path(path) => path.exists(),
        Payload::Paths(paths) => paths.iter().all(|p| p.exists()),
        _ => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sockets(pairs: &[(&str, Payload)]) -> Sockets {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn hit_only_on_identical_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NodeCache::new(dir.path(), "wf", "node").unwrap();
        let inputs = sockets(&[("sfreq", Payload::Number(600.0))]);
        let outputs = sockets(&[("label", Payload::Text("done".into()))]);
        cache.store(&inputs, &outputs).unwrap();

        assert_eq!(cache.lookup(&inputs).unwrap(), Some(outputs));
        let other = sockets(&[("sfreq", Payload::Number(300.0))]);
        assert_eq!(cache.lookup(&other).unwrap(), None);
    }

    #[test]
    fn vanished_output_file_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = NodeCache::new(dir.path(), "wf", "node").unwrap();
        let artifact = cache.workdir().join("result.safetensors");
        std::fs::write(&artifact, b"x").unwrap();

        let inputs = sockets(&[("n", Payload::Number(1.0))]);
        let outputs = sockets(&[("file", Payload::Path(artifact.clone()))]);
        cache.store(&inputs, &outputs).unwrap();
        assert!(cache.lookup(&inputs).unwrap().is_some());

        std::fs::remove_file(&artifact).unwrap();
        assert_eq!(cache.lookup(&inputs).unwrap(), None);
    }
}
