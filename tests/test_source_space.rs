mod common;

use meegflow::config::{OrientationPolicy, RoiAggregation, Spacing};
use meegflow::forward::{
    compute_forward, make_bem, setup_mixed_source_space, setup_source_space, src_file,
    CoordTransform, ForwardInfo, ForwardSolution,
};

#[test]
fn surface_space_keeps_hemisphere_order() {
    let dir = tempfile::tempdir().unwrap();
    let sd = common::toy_subjects_dir(dir.path());

    let src = setup_source_space(&sd, common::SUBJECT, Spacing::Oct5).unwrap();
    assert_eq!(src.patches.len(), 2);
    assert_eq!(src.patches[0].name, "lh");
    assert_eq!(src.patches[1].name, "rh");
    assert!(src.patches.iter().all(|p| p.is_surface));
    // Both toy hemispheres have fewer vertices than the oct-5 target, so
    // every vertex becomes a source.
    assert_eq!(src.n_sources(), 324);
    assert!(!src.is_mixed());
    assert!(src_file(&sd, common::SUBJECT, Spacing::Oct5, false).is_file());
}

#[test]
fn mixed_space_appends_subcortical_sources() {
    let dir = tempfile::tempdir().unwrap();
    let sd = common::toy_subjects_dir(dir.path());

    let src = setup_mixed_source_space(
        &sd,
        common::SUBJECT,
        Spacing::Oct5,
        &["Left-Amygdala".to_string()],
    )
    .unwrap();
    assert!(src.is_mixed());
    assert_eq!(src.patches.len(), 3);
    assert_eq!(src.patches[2].name, "Left-Amygdala");
    assert!(!src.patches[2].is_surface);
    assert!(src.patches[2].n_sources() >= 8);
    assert_eq!(src.n_sources(), 324 + src.patches[2].n_sources());

    let out = src_file(&sd, common::SUBJECT, Spacing::Oct5, true);
    assert!(out.to_str().unwrap().contains("-aseg"));
    assert!(out.with_extension("nii").is_file());
}

#[test]
fn unknown_structure_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let sd = common::toy_subjects_dir(dir.path());
    let err = setup_mixed_source_space(
        &sd,
        common::SUBJECT,
        Spacing::Oct5,
        &["Left-Nonexistent".to_string()],
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<meegflow::PipelineError>(),
        Some(meegflow::PipelineError::Config(_))
    ));
}

#[test]
fn gain_covers_every_source_of_the_toy_head() {
    let dir = tempfile::tempdir().unwrap();
    let sd = common::toy_subjects_dir(dir.path());
    let bem = make_bem(&sd, common::SUBJECT).unwrap();
    let src = setup_source_space(&sd, common::SUBJECT, Spacing::Oct5).unwrap();
    let raw = common::helmet_raw(100.0, 1.0);
    let trans = CoordTransform::identity("head", "mri");

    let fwd = compute_forward(&raw, &src, &bem, &trans).unwrap();
    assert_eq!(fwd.n_channels(), 6);
    assert_eq!(fwd.n_sources(), 324);
    // All toy sources sit well below the inner-skull shell.
    assert_eq!(fwd.n_excluded, 0);
    assert!(fwd.free_gain().iter().any(|&g| g != 0.0));

    let out = dir.path().join("rec-oct-5-fwd.safetensors");
    let info = ForwardInfo {
        subject: common::SUBJECT.into(),
        spacing: "oct-5".into(),
        mixed: false,
        n_channels: fwd.n_channels(),
        n_sources: fwd.n_sources(),
        n_excluded: fwd.n_excluded,
        mindist_mm: meegflow::forward::MIN_DIST_MM,
        patches: src.patches.iter().map(|p| (p.name.clone(), p.n_sources())).collect(),
    };
    fwd.save(&out, &info).unwrap();
    let (back, back_info) = ForwardSolution::load(&out).unwrap();
    assert_eq!(back.n_sources(), fwd.n_sources());
    assert_eq!(back_info.patches, info.patches);
}

#[test]
fn orientation_policy_table_is_total() {
    let fixed = OrientationPolicy::select(true, false);
    assert_eq!(fixed.loose, 0.0);
    assert_eq!(fixed.depth, None);
    assert!(!fixed.pick_normal);
    assert_eq!(fixed.aggregation, RoiAggregation::MeanFlip);
    // Fixed orientation wins over the source-space kind.
    assert_eq!(OrientationPolicy::select(true, true), fixed);

    let mixed = OrientationPolicy::select(false, true);
    assert_eq!(mixed.loose, 1.0);
    assert_eq!(mixed.depth, None);
    assert!(!mixed.pick_normal);
    assert_eq!(mixed.aggregation, RoiAggregation::Mean);

    let surface = OrientationPolicy::select(false, false);
    assert_eq!(surface.loose, 0.2);
    assert_eq!(surface.depth, Some(0.8));
    assert!(surface.pick_normal);
    assert_eq!(surface.aggregation, RoiAggregation::Mean);
}
