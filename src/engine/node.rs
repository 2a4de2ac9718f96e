//! Processing node contract.
//!
//! A node is a blocking function from named input payloads to named output
//! payloads, executed inside a private working directory owned by the
//! engine. Payloads are small serializable values; bulk data always moves
//! through files referenced by `Payload::Path`.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Value carried along a workflow edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Payload {
    Path(PathBuf),
    Paths(Vec<PathBuf>),
    Text(String),
    Number(f64),
    Band([f64; 2]),
}

impl Payload {
    pub fn as_path(&self) -> Result<&Path> {
        match self {
            Payload::Path(p) => Ok(p),
            other => Err(PipelineError::config(format!("expected a path, got {other:?}"))),
        }
    }

    pub fn as_paths(&self) -> Result<&[PathBuf]> {
        match self {
            Payload::Paths(p) => Ok(p),
            other => Err(PipelineError::config(format!("expected a path list, got {other:?}"))),
        }
    }

    pub fn as_text(&self) -> Result<&str> {
        match self {
            Payload::Text(s) => Ok(s),
            other => Err(PipelineError::config(format!("expected text, got {other:?}"))),
        }
    }

    pub fn as_number(&self) -> Result<f64> {
        match self {
            Payload::Number(v) => Ok(*v),
            other => Err(PipelineError::config(format!("expected a number, got {other:?}"))),
        }
    }

    pub fn as_band(&self) -> Result<[f64; 2]> {
        match self {
            Payload::Band(b) => Ok(*b),
            other => Err(PipelineError::config(format!("expected a band, got {other:?}"))),
        }
    }
}

/// Named sockets of a node, on either side.
pub type Sockets = BTreeMap<String, Payload>;

/// Fetch a required socket.
pub fn socket<'a>(sockets: &'a Sockets, name: &str) -> Result<&'a Payload> {
    sockets.get(name).ok_or_else(|| {
        PipelineError::missing_cache(format!("socket `{name}` was never produced"))
    })
}

pub trait Node: Send + Sync {
    /// Stable name, unique within a workflow; doubles as the working
    /// directory name.
    fn name(&self) -> &str;

    /// Execute with all inputs present. `workdir` exists and is private to
    /// this node within the current run.
    fn run(&self, inputs: &Sockets, workdir: &Path) -> Result<Sockets>;
}
