//! Typed workflow nodes wrapping the processing stages.
pub mod preproc;
pub mod source;
pub mod spectral;

pub use preproc::{ApplyIcaNode, ConvertDsNode, FilterNode, IcaNode};
pub use source::{EventsFile, InverseNode, LeadFieldNode, NoiseCovNode};
pub use spectral::{
    read_label_names, CirclePlotNode, ConnectivityNode, MeanBandNode, SensorPsdNode,
    SourcePsdNode, WindowNode,
};
