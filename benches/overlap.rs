//! Criterion benchmarks for the per-task hot paths.
//!
//! Run with: cargo bench --bench overlap
//!
//! - masked_count() over MNI-sized grids
//! - resample_to_grid() for 2 mm → 1 mm ROI resampling
//! - load() of a compressed statistical map

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use roistat::nifti::{self, NiftiImage, VoxelSemantic};
use roistat::transforms::{masked_count, resample_to_grid, Interpolation, Polarity};
use tempfile::tempdir;

fn scaled_affine(mm: f64) -> [[f64; 4]; 4] {
    [
        [mm, 0.0, 0.0, -90.0],
        [0.0, mm, 0.0, -126.0],
        [0.0, 0.0, mm, -72.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

/// Create a test volume with a smooth gradient of values.
fn create_test_image(shape: [usize; 3], mm: f64) -> NiftiImage {
    let data = ArrayD::from_shape_fn(IxDyn(&shape).f(), |ix| {
        ((ix[0] + 2 * ix[1] + 3 * ix[2]) % 17) as f32 - 4.0
    });
    NiftiImage::from_array(data, scaled_affine(mm))
}

fn create_test_mask(shape: [usize; 3], mm: f64) -> NiftiImage {
    let data = ArrayD::from_shape_fn(IxDyn(&shape).f(), |ix| {
        if ix[0] > shape[0] / 4 && ix[0] < shape[0] / 2 && ix[1] % 3 == 0 {
            1.0
        } else {
            0.0
        }
    });
    NiftiImage::from_array(data, scaled_affine(mm)).with_semantic(VoxelSemantic::Label)
}

fn bench_masked_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("masked_count");
    for &shape in &[[91, 109, 91], [182, 218, 182]] {
        let map = create_test_image(shape, 2.0);
        let mask = create_test_mask(shape, 2.0);
        let label = format!("{}x{}x{}", shape[0], shape[1], shape[2]);
        group.throughput(Throughput::Elements(shape.iter().product::<usize>() as u64));
        group.bench_with_input(BenchmarkId::new("positive", &label), &shape, |b, _| {
            b.iter(|| black_box(masked_count(&map, &mask, Polarity::Positive).unwrap()))
        });
    }
    group.finish();
}

fn bench_resample(c: &mut Criterion) {
    let mut group = c.benchmark_group("resample_to_grid");
    group.sample_size(20);
    let roi = create_test_mask([91, 109, 91], 2.0);
    let stat = create_test_image([91, 109, 91], 2.0);
    let reference = create_test_image([182, 218, 182], 1.0);

    group.bench_function("nearest_2mm_to_1mm", |b| {
        b.iter(|| {
            black_box(resample_to_grid(&roi, &reference, None, Interpolation::Nearest).unwrap())
        })
    });
    group.bench_function("trilinear_2mm_to_1mm", |b| {
        b.iter(|| {
            black_box(resample_to_grid(&stat, &reference, None, Interpolation::Trilinear).unwrap())
        })
    });
    group.finish();
}

fn bench_load_gzipped(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_gzipped");
    let dir = tempdir().unwrap();
    let path = dir.path().join("zstat1.nii.gz");
    nifti::save(&create_test_image([91, 109, 91], 2.0), &path).unwrap();

    group.throughput(Throughput::Bytes((91 * 109 * 91 * 4) as u64));
    group.bench_function("mni_2mm", |b| b.iter(|| black_box(nifti::load(&path).unwrap())));
    group.finish();
}

criterion_group!(benches, bench_masked_count, bench_resample, bench_load_gzipped);
criterion_main!(benches);
