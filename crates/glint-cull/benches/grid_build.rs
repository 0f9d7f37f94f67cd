use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::Vec3;
use glint_core::CameraId;
use glint_cull::{
    ClusterGridConfig, ForwardClustered, GpuLightRecord, PackingView, VisibleObjects,
};
use glint_scene::{Camera, Light};

/// Deterministic pseudo-random light field in front of the camera.
fn synthetic_lights(count: usize) -> Vec<Light> {
    let mut lights = Vec::with_capacity(count);
    let mut state = 0x9E37_79B9_u32;
    let mut next = || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (state >> 8) as f32 / (1 << 24) as f32
    };
    for _ in 0..count {
        let x = (next() - 0.5) * 100.0;
        let y = (next() - 0.5) * 20.0;
        let z = -next() * 200.0;
        lights.push(Light {
            position: Vec3::new(x, y, z),
            attenuation_range: 2.0 + next() * 10.0,
            ..Light::default()
        });
    }
    lights
}

fn bench_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_clustered_collect");
    for &count in &[128_usize, 1024, 4096] {
        let lights = synthetic_lights(count);
        let camera = Camera::new(
            CameraId(1),
            Vec3::new(0.0, 5.0, 0.0),
            Vec3::new(0.0, 0.0, -50.0),
            Vec3::Y,
        );
        let mut forward = ForwardClustered::new(ClusterGridConfig::default()).unwrap();
        let mut frame = 0u32;

        group.bench_with_input(BenchmarkId::from_parameter(count), &lights, |b, lights| {
            b.iter(|| {
                // A fresh frame number forces a full gather/bin/serialize
                // instead of a cache hit.
                frame += 1;
                let objects = VisibleObjects {
                    lights,
                    ..VisibleObjects::default()
                };
                black_box(forward.collect(&camera, objects, false, None, frame));
            });
        });
    }
    group.finish();
}

fn bench_pack_light_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_light_records");
    for &count in &[1024_usize, 4096] {
        let lights = synthetic_lights(count);
        let camera = Camera::new(
            CameraId(2),
            Vec3::new(0.0, 5.0, 0.0),
            Vec3::new(0.0, 0.0, -50.0),
            Vec3::Y,
        );
        let packing = PackingView::new(camera.view_matrix());

        group.bench_with_input(BenchmarkId::from_parameter(count), &lights, |b, lights| {
            b.iter(|| {
                let mut records = Vec::with_capacity(lights.len());
                for light in lights {
                    records.push(GpuLightRecord::from_light(
                        light,
                        &packing.view,
                        &packing.view3,
                        1.0 / 128.0,
                    ));
                }
                black_box(records)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_collect, bench_pack_light_records);
criterion_main!(benches);
