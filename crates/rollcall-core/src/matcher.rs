//! LBPH nearest-template matcher.
//!
//! Each enrolled template is summarized as a grid of local-binary-pattern
//! histograms; a probe patch is compared against every enrolled entry with the
//! chi-square distance and the minimum-distance identity is the candidate.
//! Scores are distances: lower is a better match, and the calling layer
//! decides what is confident enough.

use crate::types::{EnrolledFace, FaceTemplate, Identity, TEMPLATE_SIZE};

const LBP_BINS: usize = 256;
const GRID_CELLS: usize = 8;

/// Best enrolled identity for a probe, with its distance score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub identity: Identity,
    pub distance: f32,
}

/// Recognition seam consulted by the frame loop on sampled frames.
pub trait RecognizeFace {
    /// Nearest enrolled identity, or `None` when the gallery is empty.
    fn nearest(&self, probe: &FaceTemplate) -> Option<Candidate>;
}

/// Session-scoped matching model built from the full enrollment gallery.
///
/// Rebuilt from scratch at every session start; never updated incrementally,
/// so the per-frame path reads it without any locking.
pub struct MatchModel {
    entries: Vec<(Identity, Vec<f32>)>,
}

impl MatchModel {
    /// Build the model from the enrolled gallery. An empty gallery yields a
    /// model that always answers "no match" (detection-only sessions).
    pub fn train(gallery: &[EnrolledFace]) -> Self {
        let entries = gallery
            .iter()
            .map(|face| (face.identity.clone(), lbp_histograms(&face.template)))
            .collect::<Vec<_>>();
        tracing::debug!(enrolled = entries.len(), "match model trained");
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl RecognizeFace for MatchModel {
    fn nearest(&self, probe: &FaceTemplate) -> Option<Candidate> {
        let probe_hist = lbp_histograms(probe);

        let mut best: Option<(usize, f32)> = None;
        for (i, (_, hist)) in self.entries.iter().enumerate() {
            let dist = chi_square(&probe_hist, hist);
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((i, dist)),
            }
        }

        best.map(|(i, distance)| Candidate {
            identity: self.entries[i].0.clone(),
            distance,
        })
    }
}

/// Spatial LBP descriptor: an 8-neighbor LBP code per pixel, histogrammed
/// over an 8x8 cell grid, each cell normalized by its pixel count.
fn lbp_histograms(template: &FaceTemplate) -> Vec<f32> {
    let pixels = template.as_bytes();
    let n = TEMPLATE_SIZE;

    // LBP codes with clamped borders.
    let at = |x: i32, y: i32| -> u8 {
        let cx = x.clamp(0, n as i32 - 1) as usize;
        let cy = y.clamp(0, n as i32 - 1) as usize;
        pixels[cy * n + cx]
    };

    let mut codes = vec![0u8; n * n];
    for y in 0..n as i32 {
        for x in 0..n as i32 {
            let center = at(x, y);
            // Clockwise from the top-left neighbor.
            let neighbors = [
                at(x - 1, y - 1),
                at(x, y - 1),
                at(x + 1, y - 1),
                at(x + 1, y),
                at(x + 1, y + 1),
                at(x, y + 1),
                at(x - 1, y + 1),
                at(x - 1, y),
            ];
            let mut code = 0u8;
            for (bit, &nb) in neighbors.iter().enumerate() {
                if nb >= center {
                    code |= 1 << bit;
                }
            }
            codes[y as usize * n + x as usize] = code;
        }
    }

    // Per-cell normalized histograms, concatenated.
    let cell = n / GRID_CELLS;
    let cell_pixels = (cell * cell) as f32;
    let mut descriptor = vec![0.0f32; GRID_CELLS * GRID_CELLS * LBP_BINS];

    for gy in 0..GRID_CELLS {
        for gx in 0..GRID_CELLS {
            let base = (gy * GRID_CELLS + gx) * LBP_BINS;
            for y in gy * cell..(gy + 1) * cell {
                for x in gx * cell..(gx + 1) * cell {
                    descriptor[base + codes[y * n + x] as usize] += 1.0;
                }
            }
            for bin in &mut descriptor[base..base + LBP_BINS] {
                *bin /= cell_pixels;
            }
        }
    }

    descriptor
}

/// Chi-square histogram distance. Zero for identical histograms, grows with
/// divergence; empty bins on both sides contribute nothing.
fn chi_square(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let denom = x + y;
            if denom > 0.0 {
                (x - y) * (x - y) / denom
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TEMPLATE_SIZE;

    fn identity(id: &str) -> Identity {
        Identity {
            student_id: id.into(),
            display_name: format!("Student {id}"),
            department: "CSE".into(),
            year: "3".into(),
            section: "A".into(),
        }
    }

    fn textured_template(seed: u8) -> FaceTemplate {
        // Deterministic texture so different seeds give different LBP codes.
        let pixels: Vec<u8> = (0..TEMPLATE_SIZE * TEMPLATE_SIZE)
            .map(|i| ((i as u32 * (seed as u32 + 7) + i as u32 / 31) % 251) as u8)
            .collect();
        FaceTemplate::from_pixels(pixels).unwrap()
    }

    fn enrolled(id: &str, seed: u8) -> EnrolledFace {
        EnrolledFace {
            identity: identity(id),
            template: textured_template(seed),
        }
    }

    #[test]
    fn test_chi_square_identical_is_zero() {
        let h = vec![0.25, 0.5, 0.25];
        assert_eq!(chi_square(&h, &h), 0.0);
    }

    #[test]
    fn test_chi_square_divergence_positive() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(chi_square(&a, &b) > 0.0);
    }

    #[test]
    fn test_chi_square_ignores_mutually_empty_bins() {
        let a = vec![0.0, 1.0];
        let b = vec![0.0, 1.0];
        assert_eq!(chi_square(&a, &b), 0.0);
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        let model = MatchModel::train(&[]);
        assert!(model.is_empty());
        assert!(model.nearest(&textured_template(1)).is_none());
    }

    #[test]
    fn test_identical_probe_has_zero_distance() {
        let model = MatchModel::train(&[enrolled("S001", 3)]);
        let candidate = model.nearest(&textured_template(3)).unwrap();
        assert_eq!(candidate.identity.student_id, "S001");
        assert!(candidate.distance < 1e-6, "distance={}", candidate.distance);
    }

    #[test]
    fn test_nearest_picks_closest_entry() {
        let model = MatchModel::train(&[
            enrolled("S001", 3),
            enrolled("S002", 90),
            enrolled("S003", 170),
        ]);
        assert_eq!(model.len(), 3);

        let candidate = model.nearest(&textured_template(90)).unwrap();
        assert_eq!(candidate.identity.student_id, "S002");
        assert!(candidate.distance < 1e-6);
    }

    #[test]
    fn test_distinct_textures_have_positive_distance() {
        let model = MatchModel::train(&[enrolled("S001", 3)]);
        let candidate = model.nearest(&textured_template(200)).unwrap();
        assert!(candidate.distance > 0.0);
    }

    #[test]
    fn test_descriptor_cells_are_normalized() {
        let descriptor = lbp_histograms(&textured_template(5));
        assert_eq!(descriptor.len(), GRID_CELLS * GRID_CELLS * LBP_BINS);
        // Each cell histogram sums to ~1.0 after normalization.
        for cell in descriptor.chunks(LBP_BINS) {
            let total: f32 = cell.iter().sum();
            assert!((total - 1.0).abs() < 1e-3, "cell sums to {total}");
        }
    }
}
