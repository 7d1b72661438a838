//! Perceptual change detection between two rasterisations of a page.
//!
//! ## Clusters, not pixel counts
//!
//! Two renders of an unchanged page are rarely byte-identical: anti-aliasing
//! and compression jitter flip isolated pixels. A handwritten edit, on the
//! other hand, is a connected stroke. The detector thresholds the per-pixel
//! difference, labels connected regions, drops specks, and coalesces nearby
//! regions into circles. The caller then decides on the *number* of edit
//! regions (see [`ChangeVerdict`]).
//!
//! Connectivity is 8-neighbour: diagonal pen strokes form one component.

use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use thiserror::Error;

/// Default per-channel difference below which a pixel counts as unchanged.
pub const DEFAULT_THRESHOLD: u8 = 30;
/// Default minimum number of pixels for a component to survive.
pub const DEFAULT_MIN_CLUSTER_SIZE: usize = 10;
/// Default padding factor applied to a component's bounding circle.
pub const DEFAULT_PADDING: f64 = 1.2;
/// Default cluster count above which a page counts as changed.
pub const DEFAULT_CHANGE_CLUSTER_THRESHOLD: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    /// The two images differ in width, height or channel count.
    ///
    /// This indicates a rasterisation setting changed (e.g. DPI), not content.
    #[error("image shapes differ: old {old:?} vs new {new:?} (width, height, channels)")]
    ShapeMismatch {
        old: (u32, u32, u8),
        new: (u32, u32, u8),
    },
}

/// A circular region of change, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cluster {
    pub center_x: f64,
    pub center_y: f64,
    pub radius: f64,
}

impl Cluster {
    fn overlaps(&self, other: &Cluster) -> bool {
        let dx = self.center_x - other.center_x;
        let dy = self.center_y - other.center_y;
        (dx * dx + dy * dy).sqrt() < self.radius + other.radius
    }
}

/// Policy decision derived from a cluster count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVerdict {
    Unchanged,
    /// Some clusters, but no more than the change threshold: treated as noise.
    Minor { clusters: usize },
    Changed { clusters: usize },
}

impl ChangeVerdict {
    /// `count > change_threshold` ⇒ changed; `0 < count <= threshold` ⇒ minor.
    pub fn from_clusters(count: usize, change_threshold: usize) -> Self {
        match count {
            0 => ChangeVerdict::Unchanged,
            n if n > change_threshold => ChangeVerdict::Changed { clusters: n },
            n => ChangeVerdict::Minor { clusters: n },
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, ChangeVerdict::Changed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    pub threshold: u8,
    pub min_cluster_size: usize,
    pub padding: f64,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
            padding: DEFAULT_PADDING,
        }
    }
}

impl ChangeDetector {
    pub fn new(threshold: u8, min_cluster_size: usize) -> Self {
        Self {
            threshold,
            min_cluster_size,
            ..Self::default()
        }
    }

    /// Return the merged change clusters between `old` and `new`.
    pub fn compare(
        &self,
        old: &DynamicImage,
        new: &DynamicImage,
    ) -> Result<Vec<Cluster>, DiffError> {
        let old_shape = shape(old);
        let new_shape = shape(new);
        if old_shape != new_shape {
            return Err(DiffError::ShapeMismatch {
                old: old_shape,
                new: new_shape,
            });
        }

        let mask = self.difference_mask(old, new);
        let clusters = self.component_circles(&mask);
        Ok(merge_clusters(clusters))
    }

    /// Compare and apply the cluster-count policy in one step.
    pub fn verdict(
        &self,
        old: &DynamicImage,
        new: &DynamicImage,
        change_threshold: usize,
    ) -> Result<ChangeVerdict, DiffError> {
        let clusters = self.compare(old, new)?;
        Ok(ChangeVerdict::from_clusters(clusters.len(), change_threshold))
    }

    // ── Step 1-3: absolute difference, hard threshold, binarise ──────────
    fn difference_mask(&self, old: &DynamicImage, new: &DynamicImage) -> GrayImage {
        let (width, height) = old.dimensions();
        let old = old.to_rgba8();
        let new = new.to_rgba8();
        let mut mask = GrayImage::new(width, height);
        for (x, y, px) in mask.enumerate_pixels_mut() {
            let a = old.get_pixel(x, y).0;
            let b = new.get_pixel(x, y).0;
            let differs = a
                .iter()
                .zip(b.iter())
                .any(|(&p, &q)| p.abs_diff(q) >= self.threshold.max(1));
            if differs {
                *px = Luma([255]);
            }
        }
        mask
    }

    // ── Step 4-6: label components, drop specks, bounding circles ────────
    fn component_circles(&self, mask: &GrayImage) -> Vec<Cluster> {
        let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));

        // label -> (pixel count, min_x, min_y, max_x, max_y)
        let mut boxes: std::collections::BTreeMap<u32, (usize, u32, u32, u32, u32)> =
            std::collections::BTreeMap::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label.0[0];
            if label == 0 {
                continue;
            }
            let b = boxes.entry(label).or_insert((0, x, y, x, y));
            b.0 += 1;
            b.1 = b.1.min(x);
            b.2 = b.2.min(y);
            b.3 = b.3.max(x);
            b.4 = b.4.max(y);
        }

        boxes
            .into_values()
            .filter(|&(count, ..)| count >= self.min_cluster_size)
            .map(|(_, min_x, min_y, max_x, max_y)| {
                let center_x = (min_x as f64 + max_x as f64) / 2.0;
                let center_y = (min_y as f64 + max_y as f64) / 2.0;
                let half_w = max_x as f64 - center_x;
                let half_h = max_y as f64 - center_y;
                Cluster {
                    center_x,
                    center_y,
                    radius: (half_w * half_w + half_h * half_h).sqrt() * self.padding,
                }
            })
            .collect()
    }
}

fn shape(img: &DynamicImage) -> (u32, u32, u8) {
    let (w, h) = img.dimensions();
    (w, h, img.color().channel_count())
}

// ── Step 7: merge overlapping circles until nothing overlaps ─────────────

/// Merge overlapping clusters transitively.
///
/// A merged cluster is centred on the r²-weighted mean of its members and its
/// radius encloses every member circle. Passes repeat until no two clusters
/// overlap, so a merged circle that grew into a neighbour absorbs it too.
pub fn merge_clusters(mut clusters: Vec<Cluster>) -> Vec<Cluster> {
    loop {
        let before = clusters.len();
        clusters = merge_pass(&clusters);
        if clusters.len() == before {
            return clusters;
        }
    }
}

fn merge_pass(clusters: &[Cluster]) -> Vec<Cluster> {
    let mut used = vec![false; clusters.len()];
    let mut merged = Vec::with_capacity(clusters.len());

    for i in 0..clusters.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut group = vec![clusters[i]];

        let mut grew = true;
        while grew {
            grew = false;
            for j in 0..clusters.len() {
                if used[j] {
                    continue;
                }
                if group.iter().any(|g| g.overlaps(&clusters[j])) {
                    group.push(clusters[j]);
                    used[j] = true;
                    grew = true;
                }
            }
        }

        merged.push(enclose(&group));
    }
    merged
}

fn enclose(group: &[Cluster]) -> Cluster {
    if let [single] = group {
        return *single;
    }
    let weight: f64 = group.iter().map(|c| c.radius * c.radius).sum();
    let (center_x, center_y) = if weight > 0.0 {
        (
            group.iter().map(|c| c.center_x * c.radius * c.radius).sum::<f64>() / weight,
            group.iter().map(|c| c.center_y * c.radius * c.radius).sum::<f64>() / weight,
        )
    } else {
        let n = group.len() as f64;
        (
            group.iter().map(|c| c.center_x).sum::<f64>() / n,
            group.iter().map(|c| c.center_y).sum::<f64>() / n,
        )
    };
    let radius = group
        .iter()
        .map(|c| {
            let dx = c.center_x - center_x;
            let dy = c.center_y - center_y;
            (dx * dx + dy * dy).sqrt() + c.radius
        })
        .fold(0.0, f64::max);
    Cluster {
        center_x,
        center_y,
        radius,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn blank(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))
    }

    fn ink(img: &mut RgbImage, x0: u32, y0: u32, size: u32) {
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                img.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
    }

    fn dyn_rgb(img: RgbImage) -> DynamicImage {
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn identical_images_have_no_clusters() {
        let mut page = blank(120, 120);
        ink(&mut page, 10, 10, 8);
        let det = ChangeDetector::default();
        let clusters = det
            .compare(&dyn_rgb(page.clone()), &dyn_rgb(page))
            .unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let det = ChangeDetector::default();
        let err = det
            .compare(&dyn_rgb(blank(10, 10)), &dyn_rgb(blank(10, 12)))
            .unwrap_err();
        assert_eq!(
            err,
            DiffError::ShapeMismatch {
                old: (10, 10, 3),
                new: (10, 12, 3)
            }
        );

        let gray = DynamicImage::ImageLuma8(GrayImage::new(10, 10));
        assert!(det.compare(&gray, &dyn_rgb(blank(10, 10))).is_err());
    }

    #[test]
    fn differences_below_threshold_are_noise() {
        let old = blank(50, 50);
        let mut new = blank(50, 50);
        for y in 10..30 {
            for x in 10..30 {
                new.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        let det = ChangeDetector::default();
        assert!(det.compare(&dyn_rgb(old), &dyn_rgb(new)).unwrap().is_empty());
    }

    #[test]
    fn small_specks_are_discarded() {
        let old = blank(60, 60);
        let mut new = blank(60, 60);
        // 3x3 = 9 pixels, one short of the default minimum.
        ink(&mut new, 5, 5, 3);
        ink(&mut new, 40, 40, 3);
        let det = ChangeDetector::default();
        assert!(det.compare(&dyn_rgb(old), &dyn_rgb(new)).unwrap().is_empty());
    }

    #[test]
    fn single_stroke_is_one_cluster() {
        let old = blank(100, 100);
        let mut new = blank(100, 100);
        ink(&mut new, 20, 30, 11);
        let det = ChangeDetector::default();
        let clusters = det.compare(&dyn_rgb(old), &dyn_rgb(new)).unwrap();
        assert_eq!(clusters.len(), 1);
        let c = clusters[0];
        assert_eq!((c.center_x, c.center_y), (25.0, 35.0));
        let expected = (50.0f64).sqrt() * 1.2;
        assert!((c.radius - expected).abs() < 1e-9);
    }

    #[test]
    fn any_blob_above_minimum_is_one_covering_cluster() {
        // (width, height): square strokes and elongated ones.
        for (w, h) in [(4, 4), (5, 2), (7, 7), (11, 11), (30, 3), (25, 25), (60, 40)] {
            let old = blank(100, 100);
            let mut new = blank(100, 100);
            let (x0, y0) = (20u32, 30u32);
            for y in y0..y0 + h {
                for x in x0..x0 + w {
                    new.put_pixel(x, y, Rgb([0, 0, 0]));
                }
            }
            let det = ChangeDetector::default();
            assert!((w * h) as usize >= det.min_cluster_size);
            let clusters = det.compare(&dyn_rgb(old), &dyn_rgb(new)).unwrap();
            assert_eq!(clusters.len(), 1, "{w}x{h} blob");

            let c = clusters[0];
            for (x, y) in [(x0, y0), (x0 + w - 1, y0), (x0, y0 + h - 1), (x0 + w - 1, y0 + h - 1)] {
                let d = ((x as f64 - c.center_x).powi(2) + (y as f64 - c.center_y).powi(2)).sqrt();
                assert!(d <= c.radius + 1e-9, "{w}x{h}: corner ({x},{y}) outside circle");
            }
        }
    }

    #[test]
    fn diagonal_pixels_form_one_component() {
        let old = blank(40, 40);
        let mut new = blank(40, 40);
        for i in 0..12 {
            new.put_pixel(5 + i, 5 + i, Rgb([0, 0, 0]));
        }
        let det = ChangeDetector::default();
        assert_eq!(det.compare(&dyn_rgb(old), &dyn_rgb(new)).unwrap().len(), 1);
    }

    #[test]
    fn distant_edits_stay_separate_and_trigger_change() {
        let old = blank(400, 400);
        let mut new = blank(400, 400);
        for (x, y) in [(10, 10), (200, 10), (10, 200), (300, 300)] {
            ink(&mut new, x, y, 5);
        }
        let det = ChangeDetector::default();
        let clusters = det.compare(&dyn_rgb(old.clone()), &dyn_rgb(new.clone())).unwrap();
        assert_eq!(clusters.len(), 4);
        assert!(det
            .verdict(&dyn_rgb(old), &dyn_rgb(new), DEFAULT_CHANGE_CLUSTER_THRESHOLD)
            .unwrap()
            .is_changed());
    }

    #[test]
    fn verdict_policy_is_strictly_greater_than_threshold() {
        assert_eq!(ChangeVerdict::from_clusters(0, 2), ChangeVerdict::Unchanged);
        assert_eq!(
            ChangeVerdict::from_clusters(1, 2),
            ChangeVerdict::Minor { clusters: 1 }
        );
        assert_eq!(
            ChangeVerdict::from_clusters(2, 2),
            ChangeVerdict::Minor { clusters: 2 }
        );
        assert_eq!(
            ChangeVerdict::from_clusters(3, 2),
            ChangeVerdict::Changed { clusters: 3 }
        );
    }

    #[test]
    fn merge_cascades_transitively() {
        // a overlaps b, b overlaps c, a does not overlap c.
        let a = Cluster { center_x: 0.0, center_y: 0.0, radius: 3.0 };
        let b = Cluster { center_x: 5.0, center_y: 0.0, radius: 3.0 };
        let c = Cluster { center_x: 10.0, center_y: 0.0, radius: 3.0 };
        let merged = merge_clusters(vec![a, c, b]);
        assert_eq!(merged.len(), 1);
        let m = merged[0];
        assert!((m.center_x - 5.0).abs() < 1e-9);
        for member in [a, b, c] {
            let d = (member.center_x - m.center_x).abs();
            assert!(d + member.radius <= m.radius + 1e-9);
        }
    }

    #[test]
    fn merge_repeats_until_no_overlap_remains() {
        // a+b merge into a circle large enough to reach d, which neither touched.
        let a = Cluster { center_x: 0.0, center_y: 0.0, radius: 4.0 };
        let b = Cluster { center_x: 6.0, center_y: 0.0, radius: 4.0 };
        let d = Cluster { center_x: 3.0, center_y: 10.0, radius: 3.5 };
        assert!(!a.overlaps(&d) && !b.overlaps(&d));
        let merged = merge_clusters(vec![a, b, d]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merged_center_is_area_weighted() {
        let big = Cluster { center_x: 0.0, center_y: 0.0, radius: 4.0 };
        let small = Cluster { center_x: 4.0, center_y: 0.0, radius: 2.0 };
        let m = merge_clusters(vec![big, small])[0];
        // (0*16 + 4*4) / 20
        assert!((m.center_x - 0.8).abs() < 1e-9);
        assert!((m.radius - 5.2).abs() < 1e-9);
    }
}
