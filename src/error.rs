//! Error taxonomy for pipeline nodes.
//!
//! Nodes propagate everything through `anyhow::Result`; the variants here are
//! attached as the error source so callers can classify failures with
//! `err.downcast_ref::<PipelineError>()`.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad parameters or a required input file that does not exist: unknown
    /// connectivity metric, spacing with no grid mapping, missing events file.
    /// Raised before any computation starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// The coregistration glob matched zero or more than one candidate.
    #[error("coregistration lookup `{pattern}` matched {found} files, need exactly 1")]
    CoregAmbiguity { pattern: String, found: usize },

    /// Array dimensions incompatible with the requested computation, e.g. a
    /// phase metric on untrialed data or a window slice outside the record.
    #[error("data shape violation: {0}")]
    Shape(String),

    /// A downstream node found its upstream artifact absent: the DAG was
    /// malformed or a working directory was cleared mid-run.
    #[error("missing cached artifact: {0}")]
    MissingCache(String),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(PipelineError::Config(msg.into()))
    }

    pub fn shape(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(PipelineError::Shape(msg.into()))
    }

    pub fn missing_cache(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(PipelineError::MissingCache(msg.into()))
    }
}
