//! Shared fixtures: a synthetic FreeSurfer-style subject and helmet
//! recordings small enough to run every stage in a temp directory.
#![allow(dead_code)]

use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3};

use meegflow::anatomy::{
    icosphere, write_annot, write_mgh, write_surface, AnnotLabel, Hemi, SubjectsDir, Volume,
};
use meegflow::forward::CoordTransform;
use meegflow::io::raw::{ChannelKind, RawBundle, SensorChannel};
use meegflow::io::tensor::TensorWriter;

pub const SUBJECT: &str = "sample";

/// Build a minimal subject under `root`: icosphere hemispheres with a
/// two-label `aparc` parcellation, an inner-skull surface, and an `aseg`
/// volume holding a Left-Amygdala blob for mixed source spaces.
pub fn toy_subjects_dir(root: &Path) -> SubjectsDir {
    let sd = SubjectsDir::new(root);
    std::fs::create_dir_all(sd.subject_dir(SUBJECT).join("mri")).unwrap();
    std::fs::create_dir_all(sd.subject_dir(SUBJECT).join("surf")).unwrap();
    std::fs::create_dir_all(sd.subject_dir(SUBJECT).join("label")).unwrap();
    std::fs::create_dir_all(sd.bem_dir(SUBJECT)).unwrap();

    for (hemi, cx) in [(Hemi::Left, -30.0), (Hemi::Right, 30.0)] {
        let surf = icosphere(2, [cx, 0.0, 40.0], 25.0);
        let n = surf.n_vertices();
        write_surface(&surf, &sd.surf(SUBJECT, hemi, "white")).unwrap();
        let labels = vec![
            AnnotLabel {
                name: "front".into(),
                color: [220, 20, 20, 0],
                vertices: (0..n / 2).collect(),
            },
            AnnotLabel {
                name: "back".into(),
                color: [20, 220, 20, 0],
                vertices: (n / 2..n).collect(),
            },
        ];
        write_annot(&sd.annot(SUBJECT, hemi, "aparc"), n, &labels).unwrap();
    }

    write_surface(&icosphere(2, [0.0, 0.0, 40.0], 70.0), &sd.inner_skull(SUBJECT)).unwrap();

    // Left-Amygdala (code 18) block around surface-RAS (-16, 0, 28) mm in a
    // 48³ volume with 2 mm voxels.
    let dims = [48usize, 48, 48];
    let mut data = vec![0.0f32; 48 * 48 * 48];
    for k in 36..41usize {
        for j in 22..27usize {
            for i in 14..19usize {
                data[i + 48 * (j + 48 * k)] = 18.0;
            }
        }
    }
    let vol = Volume {
        dims,
        voxel_size: [2.0; 3],
        mdc: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        c_ras: [0.0; 3],
        data,
    };
    write_mgh(&vol, &sd.aseg(SUBJECT)).unwrap();
    sd
}

/// Six magnetometers on a helmet above the toy head plus one EOG channel.
/// Magnetometer `c` carries a tone at `8 + 2c` Hz within rejection limits.
pub fn helmet_raw(sfreq: f64, seconds: f64) -> RawBundle {
    let positions = [
        [0.09, 0.0, 0.13],
        [-0.09, 0.0, 0.13],
        [0.0, 0.09, 0.13],
        [0.0, -0.09, 0.13],
        [0.06, 0.06, 0.14],
        [-0.06, -0.06, 0.14],
    ];
    let mut channels: Vec<SensorChannel> = positions
        .iter()
        .enumerate()
        .map(|(i, &pos)| SensorChannel {
            name: format!("MEG {:03}", i + 1),
            kind: ChannelKind::Magnetometer,
            pos,
        })
        .collect();
    channels.push(SensorChannel { name: "EOG 061".into(), kind: ChannelKind::Eog, pos: [0.0; 3] });

    let n_t = (sfreq * seconds).round() as usize;
    let data = Array2::from_shape_fn((channels.len(), n_t), |(c, t)| {
        let x = t as f64 / sfreq;
        if c == 6 {
            2e-5 * (2.0 * PI * 0.3 * x).sin()
        } else {
            2e-13 * (2.0 * PI * (8.0 + 2.0 * c as f64) * x + 0.3 * c as f64).sin()
                + 5e-14 * (2.0 * PI * 31.0 * x + 1.7 * c as f64).sin()
        }
    });
    RawBundle { channels, data, sfreq, bads: vec![] }
}

/// Serialize `raw` as `<stem>.safetensors` and drop the matching identity
/// head↔MRI transform next to it.
pub fn save_with_trans(raw: &RawBundle, dir: &Path, stem: &str) -> PathBuf {
    let raw_file = dir.join(format!("{stem}.safetensors"));
    raw.save(&raw_file).unwrap();
    CoordTransform::identity("head", "mri")
        .to_json_file(&dir.join(format!("{stem}-trans.json")))
        .unwrap();
    raw_file
}

pub fn write_ts2(path: &Path, key: &str, ts: &Array2<f64>) {
    let mut w = TensorWriter::new();
    w.add_arr2_f64(key, ts);
    w.write(path).unwrap();
}

pub fn write_ts3(path: &Path, key: &str, ts: &Array3<f64>) {
    let mut w = TensorWriter::new();
    w.add_arr3_f64(key, ts);
    w.write(path).unwrap();
}

pub fn write_label_names(path: &Path, names: &[&str]) {
    std::fs::write(path, names.join("\n")).unwrap();
}
