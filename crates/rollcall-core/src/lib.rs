//! rollcall-core — Face detection and attendance marking engine.
//!
//! Detects faces with a sliding-window cascade, matches them against a small
//! enrolled gallery with an LBPH nearest-template classifier, and converts
//! confident matches into idempotent "present today" ledger writes.

pub mod annotate;
pub mod detector;
pub mod matcher;
pub mod processor;
pub mod types;

pub use detector::{DetectorError, FaceDetector};
pub use matcher::{Candidate, MatchModel, RecognizeFace};
pub use processor::{DailyDedupSet, FaceAnnotation, FrameProcessor, MarkKind};
pub use types::{
    DetectFaces, EnrolledFace, FaceBox, FaceTemplate, Identity, LedgerError, MarkOutcome,
    PresenceLedger, TEMPLATE_SIZE,
};
