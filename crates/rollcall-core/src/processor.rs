//! Per-frame attendance loop: detect, sample, match, mark, annotate.
//!
//! Detection runs on every frame; recognition only on every Nth frame to
//! bound CPU cost. A confident, not-yet-marked match becomes one idempotent
//! ledger write; the in-memory dedup set is a fast-path cache in front of the
//! ledger's uniqueness constraint, never the source of truth.

use crate::matcher::RecognizeFace;
use crate::types::{
    DetectFaces, FaceBox, FaceTemplate, LedgerError, MarkOutcome, PresenceLedger,
};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use std::sync::Arc;

/// LBPH chi-square distance below which a candidate counts as a match.
/// A probe at exactly the threshold is classified unknown.
pub const MATCH_DISTANCE_THRESHOLD: f32 = 100.0;

/// Recognition runs on every Nth frame; the frames in between only detect
/// and annotate so the feed stays smooth.
pub const RECOGNITION_INTERVAL: u64 = 3;

pub(crate) fn is_confident(distance: f32) -> bool {
    distance < MATCH_DISTANCE_THRESHOLD
}

/// Marker drawn for one detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkKind {
    /// Face present; no recognition claim (no gallery, skipped frame, or an
    /// isolated per-face failure).
    Detected,
    /// Best candidate was not confident enough.
    Unknown,
    /// Recognized, but already recorded present today.
    AlreadyMarked,
    /// Recognized and recorded present just now.
    Recognized,
}

/// One annotated face region of a processed frame.
#[derive(Debug, Clone)]
pub struct FaceAnnotation {
    pub region: FaceBox,
    pub kind: MarkKind,
    pub display_name: Option<String>,
}

/// Per-session cache of student ids already marked present for one date.
///
/// Purely a performance cache: the ledger's uniqueness constraint is the
/// actual correctness guarantee.
pub struct DailyDedupSet {
    date: NaiveDate,
    marked: HashSet<String>,
}

impl DailyDedupSet {
    /// Seed from the ledger's persisted records for `date`.
    pub fn seed(ledger: &dyn PresenceLedger, date: NaiveDate) -> Result<Self, LedgerError> {
        let marked = ledger.marked_on(date)?;
        tracing::info!(%date, already_marked = marked.len(), "dedup set seeded");
        Ok(Self { date, marked })
    }

    /// Empty set for `date`; writes remain safe via the ledger constraint.
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            marked: HashSet::new(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn contains(&self, student_id: &str) -> bool {
        self.marked.contains(student_id)
    }

    pub fn insert(&mut self, student_id: String) {
        self.marked.insert(student_id);
    }
}

/// The per-session frame loop state.
pub struct FrameProcessor {
    detector: Arc<dyn DetectFaces + Send + Sync>,
    recognizer: Box<dyn RecognizeFace + Send>,
    ledger: Arc<dyn PresenceLedger + Send + Sync>,
    dedup: DailyDedupSet,
    /// Set when a day rollover happened but the dedup re-seed failed; blocks
    /// ledger writes until a later re-seed succeeds.
    dedup_stale: bool,
    frame_index: u64,
}

impl FrameProcessor {
    pub fn new(
        detector: Arc<dyn DetectFaces + Send + Sync>,
        recognizer: Box<dyn RecognizeFace + Send>,
        ledger: Arc<dyn PresenceLedger + Send + Sync>,
        dedup: DailyDedupSet,
    ) -> Self {
        Self {
            detector,
            recognizer,
            ledger,
            dedup,
            dedup_stale: false,
            frame_index: 0,
        }
    }

    /// Process one grayscale frame, returning the face markers to draw.
    ///
    /// Never fails: per-face problems are logged and isolated to that face,
    /// and the loop moves on to the next frame.
    pub fn advance(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        now: NaiveDateTime,
    ) -> Vec<FaceAnnotation> {
        self.frame_index += 1;
        let today = now.date();
        let writes_allowed = self.ensure_today(today);

        let faces = self.detector.detect(gray, width, height);
        let sampled = self.frame_index % RECOGNITION_INTERVAL == 0;

        if !sampled || !writes_allowed {
            return faces
                .into_iter()
                .map(|region| FaceAnnotation {
                    region,
                    kind: MarkKind::Detected,
                    display_name: None,
                })
                .collect();
        }

        // Faces are handled sequentially so ledger writes within one frame
        // never race each other.
        faces
            .into_iter()
            .map(|region| self.classify_face(region, gray, width, height, now))
            .collect()
    }

    /// Re-seed the dedup set when the session crosses midnight. Returns
    /// whether ledger writes are currently allowed.
    fn ensure_today(&mut self, today: NaiveDate) -> bool {
        if self.dedup.date() == today && !self.dedup_stale {
            return true;
        }

        match DailyDedupSet::seed(self.ledger.as_ref(), today) {
            Ok(fresh) => {
                tracing::info!(%today, "dedup set re-seeded after day rollover");
                self.dedup = fresh;
                self.dedup_stale = false;
                true
            }
            Err(err) => {
                tracing::warn!(%today, error = %err, "dedup re-seed failed; holding ledger writes");
                self.dedup_stale = true;
                false
            }
        }
    }

    fn classify_face(
        &mut self,
        region: FaceBox,
        gray: &[u8],
        width: u32,
        height: u32,
        now: NaiveDateTime,
    ) -> FaceAnnotation {
        let neutral = |region| FaceAnnotation {
            region,
            kind: MarkKind::Detected,
            display_name: None,
        };

        let probe = match FaceTemplate::from_region(gray, width, height, &region) {
            Ok(probe) => probe,
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed face region");
                return neutral(region);
            }
        };

        let Some(candidate) = self.recognizer.nearest(&probe) else {
            // Empty gallery: detection-only, no recognition claim.
            return neutral(region);
        };

        if !is_confident(candidate.distance) {
            tracing::trace!(distance = candidate.distance, "below confidence threshold");
            return FaceAnnotation {
                region,
                kind: MarkKind::Unknown,
                display_name: None,
            };
        }

        let identity = candidate.identity;
        if self.dedup.contains(&identity.student_id) {
            return FaceAnnotation {
                region,
                kind: MarkKind::AlreadyMarked,
                display_name: Some(identity.display_name),
            };
        }

        match self.ledger.mark_present(
            &identity.student_id,
            &identity.display_name,
            &identity.department,
            now.date(),
            now.time(),
        ) {
            Ok(outcome) => {
                // Either way this id is settled for today; later frames in
                // this session never re-attempt the write.
                self.dedup.insert(identity.student_id.clone());
                let kind = match outcome {
                    MarkOutcome::Created => {
                        tracing::info!(
                            student_id = %identity.student_id,
                            name = %identity.display_name,
                            distance = candidate.distance,
                            "attendance marked"
                        );
                        MarkKind::Recognized
                    }
                    MarkOutcome::AlreadyExists => MarkKind::AlreadyMarked,
                };
                FaceAnnotation {
                    region,
                    kind,
                    display_name: Some(identity.display_name),
                }
            }
            Err(err) => {
                // Not cached in the dedup set, so a later frame retries.
                tracing::warn!(
                    student_id = %identity.student_id,
                    error = %err,
                    "ledger write failed; will retry on a later frame"
                );
                neutral(region)
            }
        }
    }
}
