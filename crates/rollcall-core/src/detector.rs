//! Sliding-window cascade face detector.
//!
//! Classical boosted-cascade detection over integral images: each window is
//! variance-normalized, run through the cascade stages, and surviving windows
//! are merged by neighbor grouping. Stage data is loaded from a JSON cascade
//! model file at startup.

use crate::types::{DetectFaces, FaceBox};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// --- Detection calibration (fixed, matching the deployed cascade) ---
const SCALE_FACTOR: f32 = 1.3;
const MIN_NEIGHBORS: usize = 5;
const GROUP_EPS: f32 = 0.2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0} (place the cascade JSON in the model directory)")]
    ModelNotFound(String),
    #[error("cascade read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cascade parse failed: {0}")]
    ModelParse(#[from] serde_json::Error),
    #[error("cascade invalid: {0}")]
    ModelInvalid(String),
}

/// One weighted rectangle of a Haar-like feature, in base-window coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// A decision stump over one Haar-like feature.
#[derive(Debug, Clone, Deserialize)]
pub struct WeakClassifier {
    pub rects: Vec<WeightedRect>,
    /// Compared against the variance-normalized feature response.
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

/// One boosted stage: the window is rejected as soon as the summed stump
/// responses fall below the stage threshold.
#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Cascade model as stored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct CascadeModel {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
}

/// Cascade-based face detector.
pub struct FaceDetector {
    model: CascadeModel,
}

impl FaceDetector {
    /// Load a cascade model from a JSON file.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let raw = std::fs::read_to_string(model_path)?;
        let model: CascadeModel = serde_json::from_str(&raw)?;
        let detector = Self::from_model(model)?;

        tracing::info!(
            path = model_path,
            stages = detector.model.stages.len(),
            window_width = detector.model.window_width,
            window_height = detector.model.window_height,
            "loaded cascade model"
        );

        Ok(detector)
    }

    /// Build a detector from an in-memory model, validating its geometry.
    pub fn from_model(model: CascadeModel) -> Result<Self, DetectorError> {
        if model.window_width == 0 || model.window_height == 0 {
            return Err(DetectorError::ModelInvalid("zero base window".into()));
        }
        if model.stages.is_empty() {
            return Err(DetectorError::ModelInvalid("no stages".into()));
        }
        for (si, stage) in model.stages.iter().enumerate() {
            for wc in &stage.classifiers {
                if wc.rects.is_empty() {
                    return Err(DetectorError::ModelInvalid(format!(
                        "stage {si}: classifier with no feature rects"
                    )));
                }
                for r in &wc.rects {
                    let fits = r
                        .x
                        .checked_add(r.width)
                        .is_some_and(|xe| xe <= model.window_width)
                        && r.y
                            .checked_add(r.height)
                            .is_some_and(|ye| ye <= model.window_height);
                    if !fits {
                        return Err(DetectorError::ModelInvalid(format!(
                            "stage {si}: feature rect outside base window"
                        )));
                    }
                }
            }
        }
        Ok(Self { model })
    }

    /// Run the multiscale sliding-window scan.
    ///
    /// The window grows by `SCALE_FACTOR` per pass until it no longer fits;
    /// raw hits are merged by neighbor grouping so that only regions backed by
    /// at least `MIN_NEIGHBORS` overlapping windows survive.
    pub fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox> {
        let w = width as usize;
        let h = height as usize;
        if w == 0 || h == 0 || gray.len() < w * h {
            return Vec::new();
        }

        let integral = IntegralImage::build(gray, w, h);

        let mut raw_hits = Vec::new();
        let mut scale = 1.0f32;
        loop {
            let win_w = (self.model.window_width as f32 * scale).round() as usize;
            let win_h = (self.model.window_height as f32 * scale).round() as usize;
            if win_w > w || win_h > h {
                break;
            }

            let step = ((scale * 2.0).round() as usize).max(2);
            let mut y = 0usize;
            while y + win_h <= h {
                let mut x = 0usize;
                while x + win_w <= w {
                    if self.window_passes(&integral, x, y, scale, win_w, win_h) {
                        raw_hits.push(FaceBox {
                            x: x as u32,
                            y: y as u32,
                            width: win_w as u32,
                            height: win_h as u32,
                        });
                    }
                    x += step;
                }
                y += step;
            }

            scale *= SCALE_FACTOR;
        }

        group_rectangles(raw_hits, MIN_NEIGHBORS)
    }

    /// Evaluate all cascade stages for one window position.
    fn window_passes(
        &self,
        integral: &IntegralImage,
        x: usize,
        y: usize,
        scale: f32,
        win_w: usize,
        win_h: usize,
    ) -> bool {
        let area = (win_w * win_h) as f32;
        let inv_area = 1.0 / area;

        // Variance normalization: cascades are trained on contrast-normalized
        // windows, so the stump thresholds scale with the window's stddev.
        let sum = integral.sum(x, y, win_w, win_h) as f32;
        let sq_sum = integral.sq_sum(x, y, win_w, win_h) as f32;
        let mean = sum * inv_area;
        let variance = (sq_sum * inv_area - mean * mean).max(1.0);
        let norm = variance.sqrt();

        for stage in &self.model.stages {
            let mut stage_sum = 0.0f32;
            for wc in &stage.classifiers {
                let mut feature = 0.0f32;
                for r in &wc.rects {
                    // Offset and size are rounded independently, so a rect
                    // touching the base-window edge can overshoot the scaled
                    // window by a pixel; clamp it back inside.
                    let rx = x + ((r.x as f32 * scale).round() as usize).min(win_w - 1);
                    let ry = y + ((r.y as f32 * scale).round() as usize).min(win_h - 1);
                    let rw = ((r.width as f32 * scale).round() as usize)
                        .max(1)
                        .min(x + win_w - rx);
                    let rh = ((r.height as f32 * scale).round() as usize)
                        .max(1)
                        .min(y + win_h - ry);
                    feature += r.weight * integral.sum(rx, ry, rw, rh) as f32;
                }
                let response = feature * inv_area;
                stage_sum += if response < wc.threshold * norm {
                    wc.left
                } else {
                    wc.right
                };
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }
}

impl DetectFaces for FaceDetector {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox> {
        FaceDetector::detect(self, gray, width, height)
    }
}

/// Summed-area tables for plain and squared pixel values.
struct IntegralImage {
    width: usize,
    sums: Vec<u64>,
    sq_sums: Vec<u64>,
}

impl IntegralImage {
    fn build(gray: &[u8], w: usize, h: usize) -> Self {
        // (w+1) x (h+1) with a zero border row/column.
        let stride = w + 1;
        let mut sums = vec![0u64; stride * (h + 1)];
        let mut sq_sums = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0u64;
            let mut sq_row = 0u64;
            for x in 0..w {
                let p = gray[y * w + x] as u64;
                row += p;
                sq_row += p * p;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
                sq_sums[(y + 1) * stride + x + 1] = sq_sums[y * stride + x + 1] + sq_row;
            }
        }

        Self {
            width: stride,
            sums,
            sq_sums,
        }
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        rect_sum(&self.sums, self.width, x, y, w, h)
    }

    fn sq_sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        rect_sum(&self.sq_sums, self.width, x, y, w, h)
    }
}

fn rect_sum(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
    let a = table[y * stride + x];
    let b = table[y * stride + x + w];
    let c = table[(y + h) * stride + x];
    let d = table[(y + h) * stride + x + w];
    d + a - b - c
}

/// Merge overlapping raw hits into averaged detections.
///
/// Hits are clustered by positional similarity; clusters backed by fewer than
/// `min_neighbors` windows are discarded as noise.
fn group_rectangles(hits: Vec<FaceBox>, min_neighbors: usize) -> Vec<FaceBox> {
    if hits.is_empty() {
        return hits;
    }

    // Union-find over pairwise-similar rectangles.
    let mut parent: Vec<usize> = (0..hits.len()).collect();

    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        let mut root = i;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cur = i;
        while parent[cur] != root {
            let next = parent[cur];
            parent[cur] = root;
            cur = next;
        }
        root
    }

    for i in 0..hits.len() {
        for j in (i + 1)..hits.len() {
            if similar(&hits[i], &hits[j]) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    // Accumulate per-cluster sums.
    let mut clusters: std::collections::HashMap<usize, (u64, u64, u64, u64, usize)> =
        std::collections::HashMap::new();
    for i in 0..hits.len() {
        let root = find(&mut parent, i);
        let entry = clusters.entry(root).or_insert((0, 0, 0, 0, 0));
        entry.0 += hits[i].x as u64;
        entry.1 += hits[i].y as u64;
        entry.2 += hits[i].width as u64;
        entry.3 += hits[i].height as u64;
        entry.4 += 1;
    }

    let mut grouped: Vec<FaceBox> = clusters
        .values()
        .filter(|&&(_, _, _, _, n)| n >= min_neighbors)
        .map(|&(sx, sy, sw, sh, n)| {
            let n = n as u64;
            FaceBox {
                x: (sx / n) as u32,
                y: (sy / n) as u32,
                width: (sw / n) as u32,
                height: (sh / n) as u32,
            }
        })
        .collect();

    grouped.sort_by_key(|b| (b.x, b.y));
    grouped
}

/// Two hits are similar when their corners lie within a tolerance scaled by
/// the mean window width.
fn similar(a: &FaceBox, b: &FaceBox) -> bool {
    let delta = GROUP_EPS * 0.5 * (a.width + b.width) as f32;
    let dx = (a.x as f32 - b.x as f32).abs();
    let dy = (a.y as f32 - b.y as f32).abs();
    let dr = ((a.x + a.width) as f32 - (b.x + b.width) as f32).abs();
    let db = ((a.y + a.height) as f32 - (b.y + b.height) as f32).abs();
    dx <= delta && dy <= delta && dr <= delta && db <= delta
}
