//! Forward problem: conductor model, source spaces, coregistration and
//! lead fields.
pub mod bem;
pub mod coreg;
pub mod leadfield;
pub mod source_space;

pub use bem::{bem_solution_file, make_bem, BemModel, BEM_ICO, CONDUCTIVITY};
pub use coreg::{find_trans_file, trans_pattern, CoordTransform};
pub use leadfield::{compute_forward, forward_file, ForwardInfo, ForwardSolution, MIN_DIST_MM};
pub use source_space::{
    setup_mixed_source_space, setup_source_space, src_file, SourcePatch, SourceSpace,
};
