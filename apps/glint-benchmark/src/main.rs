//! CPU smoke run for the clustered culling pipeline.
//!
//! Builds a synthetic scene and times full-grid binning without touching
//! the GPU, so a regression shows up from a plain `cargo run`. The
//! statistically rigorous numbers come from the bench suite:
//!
//! ```bash
//! cargo bench -p glint-cull
//! ```

use std::time::Instant;

use glam::{Mat4, Vec3};
use glint_core::math::Aabb;
use glint_cull::{
    compute_slice_regions, BinBounds, ClusterGridConfig, SliceBins, SliceDistribution,
};
use glint_scene::camera::Camera;
use tracing::info;

const NUM_LIGHTS: usize = 512;
const NUM_DECALS: usize = 128;
const NUM_PROBES: usize = 64;
const ITERATIONS: u32 = 100;

/// Deterministic pseudo-random scatter in front of the camera.
fn scatter(count: usize, seed: u32, half_size: f32) -> Vec<Aabb> {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (state >> 8) as f32 / (1 << 24) as f32
    };
    (0..count)
        .map(|_| {
            let center = Vec3::new(
                (next() - 0.5) * 80.0,
                (next() - 0.5) * 40.0,
                -5.0 - next() * 180.0,
            );
            Aabb::new(center, Vec3::splat(half_size))
        })
        .collect()
}

fn bin_bounds(aabbs: &[Aabb], view: &Mat4, distribution: &SliceDistribution) -> Vec<BinBounds> {
    aabbs
        .iter()
        .enumerate()
        .filter_map(|(index, aabb)| {
            BinBounds::from_world_aabb(index as u16, aabb, view, distribution)
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Glint clustered-culling smoke benchmark");

    let config = ClusterGridConfig::default();
    config.validate()?;
    let camera = Camera::default();
    let distribution =
        SliceDistribution::new(config.min_distance, config.max_distance, config.num_slices);
    let regions = compute_slice_regions(&camera, &distribution, config.num_slices);
    let view = camera.view_matrix();

    let lights = bin_bounds(&scatter(NUM_LIGHTS, 1, 3.0), &view, &distribution);
    let decals = bin_bounds(&scatter(NUM_DECALS, 2, 1.5), &view, &distribution);
    let probes = bin_bounds(&scatter(NUM_PROBES, 3, 8.0), &view, &distribution);
    info!(
        lights = lights.len(),
        decals = decals.len(),
        probes = probes.len(),
        cells = config.num_cells(),
        "scene ready"
    );

    let mut bins = SliceBins::new(&config);
    let mut total_entries: u64 = 0;
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        total_entries = 0;
        for (slice, region) in regions.iter().enumerate() {
            bins.clear();
            bins.bin(slice as u32, region, &config, &lights, &decals, &probes);
            for cell in 0..config.cells_per_slice() {
                let (cell_lights, cell_decals, cell_probes) = bins.counts(cell);
                total_entries +=
                    u64::from(cell_lights) + u64::from(cell_decals) + u64::from(cell_probes);
            }
        }
    }
    let elapsed = start.elapsed();

    info!(
        entries = total_entries,
        dropped = bins.dropped,
        avg_us = elapsed.as_micros() as u64 / u64::from(ITERATIONS),
        "binning complete"
    );
    info!("Full suite: cargo bench -p glint-cull");
    Ok(())
}
