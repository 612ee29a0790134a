//! End-to-end overlap scenarios through the report grid, plus seeded
//! property checks of the Dice and coverage primitives.

use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use roistat::nifti::{NiftiImage, VoxelSemantic};
use roistat::overlap::{coverage, default_thresholds, dice, round3, Metric};
use roistat::report::{GridBuilder, HemisphereMasks, OverlapRow, RoiMasks, StatVolumes};
use roistat::transforms::{
    hemisphere_mask, masked_count, total_count, Hemisphere, HemisphereSplit, Polarity, Space,
};

const DIMS: [usize; 3] = [20, 25, 10];

const AFFINE: [[f64; 4]; 4] = [
    [2.0, 0.0, 0.0, -20.0],
    [0.0, 2.0, 0.0, -25.0],
    [0.0, 0.0, 2.0, -10.0],
    [0.0, 0.0, 0.0, 1.0],
];

fn volume(f: impl Fn(usize, usize, usize) -> f32) -> NiftiImage {
    let data = ArrayD::from_shape_fn(IxDyn(&DIMS).f(), |ix| f(ix[0], ix[1], ix[2]));
    NiftiImage::from_array(data, AFFINE)
}

fn label(f: impl Fn(usize, usize, usize) -> bool) -> NiftiImage {
    volume(|x, y, z| if f(x, y, z) { 1.0 } else { 0.0 }).with_semantic(VoxelSemantic::Label)
}

fn roi(name: &str, f: impl Fn(usize, usize, usize) -> bool + Copy) -> RoiMasks {
    let split = HemisphereSplit::default();
    let whole = label(f);
    let (lo, hi) = split.bounds(DIMS[split.axis]).unwrap();
    RoiMasks {
        label: name.to_string(),
        left: label(|x, y, z| f(x, y, z) && lo.contains(&x)),
        right: label(|x, y, z| f(x, y, z) && hi.contains(&x)),
        whole,
    }
}

fn halves(reference: &NiftiImage) -> HemisphereMasks {
    let split = HemisphereSplit::default();
    HemisphereMasks {
        left: hemisphere_mask(reference, &split, Hemisphere::Left).unwrap(),
        right: hemisphere_mask(reference, &split, Hemisphere::Right).unwrap(),
    }
}

fn build(maps: &StatVolumes, rois: &[RoiMasks]) -> Vec<OverlapRow> {
    let builder = GridBuilder::new("sub-01", "motor_hand", default_thresholds(), "Z=3.1").unwrap();
    builder
        .build_space(Space::Template, maps, rois, &halves(&maps.zstat))
        .unwrap()
}

fn find<'a>(rows: &'a [OverlapRow], roi: &str, threshold: &str) -> &'a OverlapRow {
    rows.iter()
        .find(|r| r.roi == roi && r.threshold == threshold)
        .unwrap_or_else(|| panic!("no row for {roi} at {threshold}"))
}

/// Whole grid is brain; the first four x-slabs (1000 voxels) exceed 3.1.
fn glm_maps() -> StatVolumes {
    let z = volume(|x, _, _| if x < 4 { 4.0 } else { 1.0 });
    let thresh = volume(|x, _, _| if x < 4 { 4.0 } else { 0.0 });
    StatVolumes {
        zstat: z.clone(),
        thresh_zstat: thresh.clone(),
        corrp: volume(|x, _, _| if x < 4 { 0.99 } else { 0.0 }),
        tstat: volume(|_, _, _| 1.5),
        ica: z,
        ica_thresh: thresh,
    }
}

#[test]
fn test_contained_roi_ratio_scenario() {
    let maps = glm_maps();
    assert_eq!(total_count(&maps.zstat).unwrap(), 5000);

    let rows = build(&maps, &[roi("PMC", |x, y, _| x < 4 && y < 5)]);
    let row = find(&rows, "PMC", "Z=3.1");
    assert_eq!(row.active_whole, 1000);
    assert_eq!(row.whole_count, 5000);
    assert_eq!(row.roi_count, 200);
    assert_eq!(row.active_roi, 200);
    assert_eq!(row.pct_whole.to_string(), "20.000");
    assert_eq!(row.pct_roi.to_string(), "100.000");
    assert_eq!(row.ratio.to_string(), "5.000");
    assert_eq!(row.pct_roi_in_whole.to_string(), "20.000");
    assert_eq!(row.dice, Metric::NotApplicable);
    assert_eq!(row.stat_type, "GLM");
}

#[test]
fn test_identical_tfce_and_reference_scenario() {
    // 300 voxels: x in [0, 3), y in [0, 10), z all.
    let active = |x: usize, y: usize| x < 3 && y < 10;
    let z = volume(|x, y, _| if active(x, y) { 5.0 } else { 0.5 });
    let maps = StatVolumes {
        zstat: z.clone(),
        thresh_zstat: volume(|x, y, _| if active(x, y) { 5.0 } else { 0.0 }),
        corrp: volume(|x, y, _| if active(x, y) { 1.0 } else { 0.0 }),
        tstat: volume(|_, _, _| 2.0),
        ica: z.clone(),
        ica_thresh: z,
    };
    let rows = build(&maps, &[roi("STG", |x, y, _| x < 6 && y < 10)]);

    let row = find(&rows, "STG", "TFCE");
    assert_eq!(row.stat_type, "TFCE");
    assert_eq!(row.active_whole, 300);
    assert_eq!(row.dice.to_string(), "1.000");
    assert_eq!(row.coverage_t.to_string(), "100.000");
    assert_eq!(row.coverage_z.to_string(), "100.000");
    assert_eq!(row.coverage_t_roi.to_string(), "100.000");
    assert_eq!(row.coverage_z_roi.to_string(), "100.000");
}

#[test]
fn test_empty_roi_reports_zero_without_aborting() {
    let maps = glm_maps();
    let rows = build(
        &maps,
        &[
            roi("EMPTY", |_, _, _| false),
            roi("PMC", |x, y, _| x < 4 && y < 5),
        ],
    );
    assert_eq!(rows.len(), 2 * 3 * default_thresholds().len());

    for row in rows.iter().filter(|r| r.roi.starts_with("EMPTY")) {
        assert_eq!(row.roi_count, 0);
        assert_eq!(row.active_roi, 0);
        assert_eq!(row.pct_roi.to_string(), "0.0");
        assert_eq!(row.ratio.to_string(), "0.0");
        if row.stat_type != "GLM" {
            assert_eq!(row.coverage_t_roi.to_string(), "0.0", "{}", row.threshold);
            assert_eq!(row.coverage_z_roi.to_string(), "0.0", "{}", row.threshold);
        }
    }
    let tfce = find(&rows, "EMPTY", "TFCE");
    assert_eq!(tfce.coverage_t_roi, Metric::Degenerate);
    assert_eq!(tfce.coverage_z_roi, Metric::Degenerate);
    // Rows after the empty ROI are still computed.
    assert_eq!(find(&rows, "PMC", "Z=3.1").pct_roi.to_string(), "100.000");
}

#[test]
fn test_hemisphere_rows_partition_whole() {
    let maps = glm_maps();
    // Straddles the default midline at x = 10 and avoids the excluded x = 0.
    let rows = build(&maps, &[roi("HG", |x, y, _| (1..16).contains(&x) && y < 4)]);
    let whole = find(&rows, "HG", "Z=2.35");
    let left = find(&rows, "HG_L", "Z=2.35");
    let right = find(&rows, "HG_R", "Z=2.35");
    assert_eq!(left.roi_count + right.roi_count, whole.roi_count);
    assert_eq!(left.active_roi + right.active_roi, whole.active_roi);
    // Only x = 1..4 is active and all of it is left of the midline.
    assert_eq!(right.active_roi, 0);
    assert_eq!(right.pct_roi.to_string(), "0.000");
}

fn random_mask(rng: &mut ChaCha8Rng, density: f64) -> NiftiImage {
    let values: Vec<bool> = (0..DIMS.iter().product::<usize>())
        .map(|_| rng.gen_bool(density))
        .collect();
    let data = ArrayD::from_shape_vec(
        IxDyn(&DIMS).f(),
        values.into_iter().map(|b| if b { 1.0 } else { 0.0 }).collect(),
    )
    .unwrap();
    NiftiImage::from_array(data, AFFINE).with_semantic(VoxelSemantic::Label)
}

#[test]
fn test_dice_and_coverage_properties() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    for _ in 0..16 {
        let density_a = rng.gen_range(0.05..0.6);
        let density_b = rng.gen_range(0.05..0.6);
        let a = random_mask(&mut rng, density_a);
        let b = random_mask(&mut rng, density_b);

        let d = dice(&a, &b).unwrap();
        assert!((0.0..=1.0).contains(&d));
        assert_eq!(d, dice(&b, &a).unwrap());
        assert_eq!(dice(&a, &a).unwrap(), 1.0);

        let shared = masked_count(&a, &b, Polarity::NonZero).unwrap() as f64;
        let (cov_a, cov_b) = coverage(&a, &b).unwrap();
        let total_a = total_count(&a).unwrap() as f64;
        let total_b = total_count(&b).unwrap() as f64;
        assert_eq!(cov_a, round3(100.0 * shared / total_a));
        assert_eq!(cov_b, round3(100.0 * shared / total_b));
        assert!(cov_a <= 100.0 && cov_b <= 100.0);
    }
}
