//! I/O adapters: the tensor container, raw/epoch/evoked bundles, and the
//! external formats (CTF `.ds`, MATLAB `.mat`, ASCII, BrainVision).
pub mod ascii;
pub mod ctf;
pub mod mat;
pub mod raw;
pub mod tensor;

pub use ascii::{read_brainvision, split_txt};
pub use ctf::{convert_ds_to_raw, read_ds, write_ds};
pub use mat::{import_mat_to_ts, import_tsmat_to_ts, read_mat, write_mat, MatVar};
pub use raw::{
    concat_ts, epochs_to_array, raw_to_array,
    ChannelKind, EpochsBundle, EvokedBundle, RawBundle, SensorChannel,
};
pub use tensor::{TensorFile, TensorWriter};
