//! FreeSurfer-style subject anatomy: directory layout, surfaces,
//! parcellations, segmentation volumes, MNI transforms.
pub mod annot;
pub mod surface;
pub mod volume;
pub mod xfm;

use std::path::{Path, PathBuf};

use anyhow::Result;

pub use annot::{read_annot, write_annot, AnnotLabel, Annotation};
pub use surface::{icosphere, read_surface, write_surface, Surface};
pub use volume::{read_mgz, write_mgh, write_nifti, Volume};
pub use xfm::{read_xfm, write_xfm, MniTransform};

use crate::error::PipelineError;

/// Cortical hemisphere, FreeSurfer naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hemi {
    Left,
    Right,
}

impl Hemi {
    pub fn fs_name(self) -> &'static str {
        match self {
            Hemi::Left => "lh",
            Hemi::Right => "rh",
        }
    }
}

/// Segmentation code of a named subcortical structure in the FreeSurfer
/// lookup table. Unknown names are a configuration error.
pub fn aseg_code(label: &str) -> Result<f32> {
    let code = match label {
        "Left-Cerebellum-Cortex" => 8,
        "Left-Thalamus-Proper" => 10,
        "Left-Caudate" => 11,
        "Left-Putamen" => 12,
        "Left-Pallidum" => 13,
        "Brain-Stem" => 16,
        "Left-Hippocampus" => 17,
        "Left-Amygdala" => 18,
        "Left-Accumbens-area" => 26,
        "Right-Cerebellum-Cortex" => 47,
        "Right-Thalamus-Proper" => 49,
        "Right-Caudate" => 50,
        "Right-Putamen" => 51,
        "Right-Pallidum" => 52,
        "Right-Hippocampus" => 53,
        "Right-Amygdala" => 54,
        "Right-Accumbens-area" => 58,
        other => {
            return Err(PipelineError::config(format!(
                "unknown subcortical structure `{other}`"
            )))
        }
    };
    Ok(code as f32)
}

/// Paths inside a FreeSurfer-style subjects directory.
#[derive(Debug, Clone)]
pub struct SubjectsDir {
    pub root: PathBuf,
}

impl SubjectsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SubjectsDir { root: root.into() }
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(subject)
    }

    pub fn bem_dir(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("bem")
    }

    pub fn surf(&self, subject: &str, hemi: Hemi, name: &str) -> PathBuf {
        self.subject_dir(subject)
            .join("surf")
            .join(format!("{}.{}", hemi.fs_name(), name))
    }

    pub fn annot(&self, subject: &str, hemi: Hemi, parc: &str) -> PathBuf {
        self.subject_dir(subject)
            .join("label")
            .join(format!("{}.{}.annot", hemi.fs_name(), parc))
    }

    pub fn aseg(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("mri").join("aseg.mgz")
    }

    pub fn brainmask(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject).join("mri").join("brainmask.mgz")
    }

    pub fn talairach_xfm(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject)
            .join("mri")
            .join("transforms")
            .join("talairach.xfm")
    }

    /// RAS→MNI transform; identity when the subject has none.
    pub fn mni_transform(&self, subject: &str) -> MniTransform {
        let path = self.talairach_xfm(subject);
        if path.is_file() {
            read_xfm(&path).unwrap_or_else(|_| MniTransform::identity())
        } else {
            MniTransform::identity()
        }
    }

    pub fn inner_skull(&self, subject: &str) -> PathBuf {
        self.bem_dir(subject).join("inner_skull.surf")
    }

    /// Some subjects keep the surface under `<subject>-inner_skull.surf`.
    pub fn inner_skull_alt(&self, subject: &str) -> PathBuf {
        self.bem_dir(subject).join(format!("{subject}-inner_skull.surf"))
    }

    pub fn exists(&self, subject: &str) -> bool {
        self.subject_dir(subject).is_dir()
    }
}

impl AsRef<Path> for SubjectsDir {
    fn as_ref(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let sd = SubjectsDir::new("/anat");
        assert_eq!(sd.surf("sample", Hemi::Left, "white"), Path::new("/anat/sample/surf/lh.white"));
        assert_eq!(
            sd.annot("sample", Hemi::Right, "aparc"),
            Path::new("/anat/sample/label/rh.aparc.annot")
        );
        assert_eq!(sd.aseg("sample"), Path::new("/anat/sample/mri/aseg.mgz"));
    }

    #[test]
    fn aseg_codes() {
        assert_eq!(aseg_code("Left-Amygdala").unwrap(), 18.0);
        assert_eq!(aseg_code("Brain-Stem").unwrap(), 16.0);
        assert!(aseg_code("Left-Nonexistent").is_err());
    }
}
