use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Side length of the square grayscale patch used as the unit of comparison.
pub const TEMPLATE_SIZE: usize = 100;

/// An enrolled person. Created once at enrollment; the `student_id` is the
/// unique key everywhere (gallery, ledger, dedup set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub student_id: String,
    pub display_name: String,
    pub department: String,
    pub year: String,
    pub section: String,
}

/// Axis-aligned face region in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("face region {x},{y} {width}x{height} exceeds frame bounds {frame_width}x{frame_height}")]
    RegionOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        frame_width: u32,
        frame_height: u32,
    },
    #[error("template has {actual} bytes, expected {expected}")]
    BadLength { expected: usize, actual: usize },
}

/// Normalized fixed-size grayscale face patch.
///
/// One template per identity; derived from a single enrollment photo or from
/// a detected region of a live frame (the probe side of a match).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceTemplate {
    pixels: Vec<u8>,
}

impl FaceTemplate {
    /// Wrap raw pixel data, validating the expected patch size.
    pub fn from_pixels(pixels: Vec<u8>) -> Result<Self, TemplateError> {
        let expected = TEMPLATE_SIZE * TEMPLATE_SIZE;
        if pixels.len() != expected {
            return Err(TemplateError::BadLength {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { pixels })
    }

    /// Crop a face region out of a grayscale frame and resize it to the
    /// canonical patch size with bilinear interpolation.
    pub fn from_region(
        gray: &[u8],
        frame_width: u32,
        frame_height: u32,
        region: &FaceBox,
    ) -> Result<Self, TemplateError> {
        let out_of_bounds = region.width == 0
            || region.height == 0
            || region.x.saturating_add(region.width) > frame_width
            || region.y.saturating_add(region.height) > frame_height
            || gray.len() < (frame_width * frame_height) as usize;
        if out_of_bounds {
            return Err(TemplateError::RegionOutOfBounds {
                x: region.x,
                y: region.y,
                width: region.width,
                height: region.height,
                frame_width,
                frame_height,
            });
        }

        let fw = frame_width as usize;
        let rx = region.x as usize;
        let ry = region.y as usize;
        let rw = region.width as usize;
        let rh = region.height as usize;

        let scale_x = rw as f32 / TEMPLATE_SIZE as f32;
        let scale_y = rh as f32 / TEMPLATE_SIZE as f32;

        let mut pixels = vec![0u8; TEMPLATE_SIZE * TEMPLATE_SIZE];
        for y in 0..TEMPLATE_SIZE {
            let src_y = (y as f32 + 0.5) * scale_y - 0.5;
            let y0 = (src_y.floor() as i32).clamp(0, rh as i32 - 1) as usize;
            let y1 = (y0 + 1).min(rh - 1);
            let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

            for x in 0..TEMPLATE_SIZE {
                let src_x = (x as f32 + 0.5) * scale_x - 0.5;
                let x0 = (src_x.floor() as i32).clamp(0, rw as i32 - 1) as usize;
                let x1 = (x0 + 1).min(rw - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

                let tl = gray[(ry + y0) * fw + rx + x0] as f32;
                let tr = gray[(ry + y0) * fw + rx + x1] as f32;
                let bl = gray[(ry + y1) * fw + rx + x0] as f32;
                let br = gray[(ry + y1) * fw + rx + x1] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                pixels[y * TEMPLATE_SIZE + x] = val.round().clamp(0.0, 255.0) as u8;
            }
        }

        Ok(Self { pixels })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }
}

/// One entry of the enrollment gallery.
#[derive(Debug, Clone)]
pub struct EnrolledFace {
    pub identity: Identity,
    pub template: FaceTemplate,
}

/// Outcome of an attendance write. `AlreadyExists` is a normal result, not
/// an error: the ledger enforces at most one row per (student_id, date).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Created,
    AlreadyExists,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance storage unavailable: {0}")]
    Unavailable(String),
}

/// Attendance ledger as seen by the frame loop.
///
/// `mark_present` must be safe under concurrent calls for the same
/// (student_id, date): the storage layer, not the caller, enforces
/// uniqueness and reports the duplicate as `AlreadyExists`.
pub trait PresenceLedger {
    fn mark_present(
        &self,
        student_id: &str,
        display_name: &str,
        department: &str,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<MarkOutcome, LedgerError>;

    /// Student ids already recorded present on the given date. Used once per
    /// session start (and again on day rollover) to seed the dedup set.
    fn marked_on(&self, date: NaiveDate) -> Result<HashSet<String>, LedgerError>;
}

/// Face detection seam. Runs on every frame; a malformed frame yields no
/// detections rather than an error.
pub trait DetectFaces {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pixels_validates_length() {
        assert!(FaceTemplate::from_pixels(vec![0u8; TEMPLATE_SIZE * TEMPLATE_SIZE]).is_ok());
        let err = FaceTemplate::from_pixels(vec![0u8; 10]).unwrap_err();
        assert!(matches!(err, TemplateError::BadLength { actual: 10, .. }));
    }

    #[test]
    fn test_from_region_uniform_stays_uniform() {
        let frame = vec![90u8; 320 * 240];
        let region = FaceBox { x: 10, y: 20, width: 50, height: 60 };
        let template = FaceTemplate::from_region(&frame, 320, 240, &region).unwrap();
        assert_eq!(template.as_bytes().len(), TEMPLATE_SIZE * TEMPLATE_SIZE);
        assert!(template.as_bytes().iter().all(|&p| p == 90));
    }

    #[test]
    fn test_from_region_identity_size() {
        // A region already at the template size copies pixels through.
        let w = 200u32;
        let h = 200u32;
        let frame: Vec<u8> = (0..(w * h)).map(|i| (i % 251) as u8).collect();
        let region = FaceBox { x: 40, y: 30, width: 100, height: 100 };
        let template = FaceTemplate::from_region(&frame, w, h, &region).unwrap();
        // Spot-check a couple of pixels against the source.
        assert_eq!(
            template.as_bytes()[0],
            frame[30 * w as usize + 40]
        );
        assert_eq!(
            template.as_bytes()[99],
            frame[30 * w as usize + 40 + 99]
        );
    }

    #[test]
    fn test_from_region_rejects_out_of_bounds() {
        let frame = vec![0u8; 100 * 100];
        let region = FaceBox { x: 60, y: 0, width: 50, height: 50 };
        assert!(FaceTemplate::from_region(&frame, 100, 100, &region).is_err());

        let empty = FaceBox { x: 0, y: 0, width: 0, height: 10 };
        assert!(FaceTemplate::from_region(&frame, 100, 100, &empty).is_err());
    }

    #[test]
    fn test_from_region_rejects_short_frame() {
        let frame = vec![0u8; 10];
        let region = FaceBox { x: 0, y: 0, width: 50, height: 50 };
        assert!(FaceTemplate::from_region(&frame, 100, 100, &region).is_err());
    }
}
