//! Probe selection and blend weighting for manually managed probes.
//!
//! Each frame the renderer picks the probes whose areas contain the
//! tracked camera position and blends their cubemaps with Lagarde's
//! weighting ("Local Image-based Lighting With Parallax-corrected
//! Cubemap", SIGGRAPH 2012): weights reach 1 at a probe's inner region
//! and 0 at its boundary regardless of how many probes overlap.

use glam::{Mat4, Vec3};
use glint_core::types::VisibilityMask;

use crate::probe::CubemapProbe;

/// At most this many probes blend at once; further overlaps evict the
/// entry with the highest NDF.
pub const MAX_BLEND_PROBES: usize = 4;

/// Result of one frame's probe collection, in blend order. Index 0 is the
/// dominant probe after [`collect_blend_probes`] finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlendSelection {
    /// Indices into the probe slice passed to the collection.
    pub probes: Vec<usize>,
    pub ndfs: Vec<f32>,
    pub weights: Vec<f32>,
}

impl BlendSelection {
    fn clear(&mut self) {
        self.probes.clear();
        self.ndfs.clear();
        self.weights.clear();
    }

    fn set_single(&mut self, index: usize, ndf: f32) {
        self.clear();
        self.probes.push(index);
        self.ndfs.push(ndf);
    }

    /// Whether the blended cubemap must re-render compared to the previous
    /// frame's selection. Stable only when at most one probe was and is
    /// selected and it is the same one.
    pub fn requires_blend_update(&self, previous: &Self) -> bool {
        !(previous.probes.len() <= 1
            && self.probes.len() <= 1
            && previous.probes.len() == self.probes.len()
            && previous.probes.first() == self.probes.first())
    }
}

/// Pick the probes influencing `tracked_position` and compute their blend
/// weights.
///
/// Probes whose area contains the position contribute by NDF: a probe
/// whose inner region contains the position wins outright (its weight is
/// 1 and nothing else is collected); otherwise the `MAX_BLEND_PROBES`
/// lowest NDFs are kept. When no area contains the position the probe
/// with the largest projected screen coverage is used alone. The dominant
/// (highest-weight) probe is swapped to index 0.
pub fn collect_blend_probes(
    probes: &[CubemapProbe],
    tracked_position: Vec3,
    tracked_view_proj: &Mat4,
    system_mask: VisibilityMask,
    selection: &mut BlendSelection,
) {
    selection.clear();

    for (index, probe) in probes.iter().enumerate() {
        if !probe.is_enabled() || probe.visibility_mask() & system_mask == 0 {
            continue;
        }
        let pos_ls = *probe.inv_orientation() * (tracked_position - probe.area().center);
        if !probe.area_ls().contains_point(pos_ls) {
            continue;
        }

        let ndf = probe.ndf(pos_ls);
        if ndf <= 0.0 {
            // Inside the inner region: this probe applies at full strength
            // and no blending is wanted.
            selection.set_single(index, ndf);
            break;
        }

        if selection.probes.len() < MAX_BLEND_PROBES {
            selection.probes.push(index);
            selection.ndfs.push(ndf);
        } else {
            // Evict the highest NDF the new probe beats, if any.
            let mut highest = -1.0_f32;
            let mut evict = None;
            for (i, &existing) in selection.ndfs.iter().enumerate() {
                if ndf < existing && existing >= highest {
                    highest = existing;
                    evict = Some(i);
                }
            }
            if let Some(i) = evict {
                selection.probes[i] = index;
                selection.ndfs[i] = ndf;
            }
        }
    }

    if selection.probes.is_empty() {
        if let Some((index, coverage)) = closest_probe(probes, tracked_view_proj, system_mask) {
            selection.set_single(index, coverage);
        }
    }

    lagarde_weights(&selection.ndfs, &mut selection.weights);

    // Promote the dominant probe so index 0 always holds the one the
    // non-blended paths should sample.
    if let Some(highest) = (1..selection.weights.len())
        .max_by(|&a, &b| selection.weights[a].total_cmp(&selection.weights[b]))
        .filter(|&i| selection.weights[i] > selection.weights[0])
    {
        selection.probes.swap(0, highest);
        selection.ndfs.swap(0, highest);
        selection.weights.swap(0, highest);
    }
}

/// Lagarde's dual-constraint weighting, renormalized.
///
/// `w_i = (1 − ndf_i/Σndf) · ((1 − ndf_i)/Σ(1 − ndf))`: the first factor
/// forces 0 at a probe's boundary, the second forces full weight at its
/// center, and the product is renormalized so the weights sum to 1.
pub fn lagarde_weights(ndfs: &[f32], weights: &mut Vec<f32>) {
    weights.clear();
    if ndfs.is_empty() {
        return;
    }
    if ndfs.len() == 1 {
        weights.push(1.0);
        return;
    }

    let sum_ndf: f32 = ndfs.iter().sum();
    let inv_sum_ndf = 1.0 / sum_ndf;
    let reverse_sum = ndfs.len() as f32 - sum_ndf;
    let inv_reverse_sum = 1.0 / reverse_sum;

    let mut total = 0.0;
    for &ndf in ndfs {
        let weight = (1.0 - ndf * inv_sum_ndf) * ((1.0 - ndf) * inv_reverse_sum);
        weights.push(weight);
        total += weight;
    }

    if total <= 0.0 {
        total = 1.0;
    }
    let inv_total = 1.0 / total;
    for weight in weights.iter_mut() {
        *weight *= inv_total;
    }
}

/// When the camera is outside every probe area, pick the one occupying the
/// most projected screen volume: area corners are pushed through the
/// tracked view-projection, clamped to the unit cube, and the resulting
/// NDC box volume (with depth remapped and squared to tame perspective Z)
/// is the score. Probes entirely behind the camera never win.
pub fn closest_probe(
    probes: &[CubemapProbe],
    view_proj: &Mat4,
    system_mask: VisibilityMask,
) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;

    for (index, probe) in probes.iter().enumerate() {
        if !probe.is_enabled() || probe.visibility_mask() & system_mask == 0 {
            continue;
        }

        let min = probe.area().min();
        let max = probe.area().max();
        let mut ps_min = Vec3::ONE;
        let mut ps_max = -Vec3::ONE;

        for corner in 0..8 {
            let world = Vec3::new(
                if corner & 1 == 0 { min.x } else { max.x },
                if corner & 2 == 0 { min.y } else { max.y },
                if corner & 4 == 0 { min.z } else { max.z },
            );
            let rotated = *probe.orientation() * world;
            let clip = *view_proj * rotated.extend(1.0);
            let w = clip.w.max(1e-6);
            let ndc = (clip.truncate() / w).clamp(Vec3::splat(-1.0), Vec3::ONE);
            ps_min = ps_min.min(ndc);
            ps_max = ps_max.max(ndc);
        }

        if ps_max.z <= -1.0 {
            continue;
        }

        let near = (ps_min.z * 0.5 + 0.5).powi(2);
        let far = (ps_max.z * 0.5 + 0.5).powi(2);
        let coverage = (ps_max.x - ps_min.x) * (ps_max.y - ps_min.y) * (far - near);
        if coverage > 0.0 && best.map_or(true, |(_, best_coverage)| coverage > best_coverage) {
            best = Some((index, coverage));
        }
    }

    best
}
