//! Camera session lifecycle.
//!
//! One mutex-guarded Idle/Running state, a capture thread that owns the
//! device for the duration of a session, and a broadcast channel carrying
//! annotated JPEG frames to however many feed viewers are attached. Start
//! and stop are idempotent; the only fatal start error is an unavailable
//! device.

use chrono::Local;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use rollcall_core::{
    annotate, DailyDedupSet, DetectFaces, FrameProcessor, MatchModel, PresenceLedger,
};
use rollcall_hw::{Camera, CameraError, FrameSource};
use rollcall_store::AttendanceStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::broadcast;

/// JPEG quality for live feed frames.
const FEED_JPEG_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(#[from] CameraError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    WasIdle,
}

/// Opens the frame source for a new session. A seam so the controller can be
/// driven by synthetic sources in tests.
pub trait OpenFrameSource: Send + Sync + 'static {
    type Source: FrameSource + 'static;

    fn open(&self) -> Result<Self::Source, CameraError>;
}

/// Production opener for the configured V4L2 device.
pub struct CameraOpener {
    pub device: String,
}

impl OpenFrameSource for CameraOpener {
    type Source = Camera;

    fn open(&self) -> Result<Camera, CameraError> {
        Camera::open(&self.device)
    }
}

struct Session {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Single owner of the camera session state.
pub struct SessionController<O: OpenFrameSource> {
    opener: O,
    detector: Arc<dyn DetectFaces + Send + Sync>,
    store: Arc<AttendanceStore>,
    session: Mutex<Option<Session>>,
    frames: broadcast::Sender<Arc<Vec<u8>>>,
}

impl<O: OpenFrameSource> SessionController<O> {
    pub fn new(
        opener: O,
        detector: Arc<dyn DetectFaces + Send + Sync>,
        store: Arc<AttendanceStore>,
        feed_buffer_frames: usize,
    ) -> Self {
        let (frames, _) = broadcast::channel(feed_buffer_frames.max(1));
        Self {
            opener,
            detector,
            store,
            session: Mutex::new(None),
            frames,
        }
    }

    fn session_lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a capture session. Returns `AlreadyRunning` without touching the
    /// device when one is active.
    ///
    /// The device is the only fatal resource: a failed gallery load or dedup
    /// seed degrades the session rather than refusing it.
    pub fn start(&self) -> Result<StartOutcome, ControllerError> {
        let mut session = self.session_lock();
        if let Some(current) = session.as_ref() {
            if !current.handle.is_finished() {
                tracing::info!("start requested while session already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        // Reap a session whose capture thread already ended on its own
        // (device failure or drained source).
        if let Some(ended) = session.take() {
            let _ = ended.handle.join();
        }

        let source = self.opener.open()?;

        let recognizer = match self.store.load_gallery() {
            Ok(gallery) => {
                tracing::info!(enrolled = gallery.len(), "enrollment gallery loaded");
                MatchModel::train(&gallery)
            }
            Err(err) => {
                tracing::warn!(error = %err, "gallery load failed; running detection-only");
                MatchModel::train(&[])
            }
        };

        let ledger: Arc<dyn PresenceLedger + Send + Sync> = self.store.clone();
        let today = Local::now().date_naive();
        let dedup = match DailyDedupSet::seed(ledger.as_ref(), today) {
            Ok(dedup) => dedup,
            Err(err) => {
                tracing::warn!(error = %err, "dedup seed failed; the ledger constraint still holds");
                DailyDedupSet::empty(today)
            }
        };

        let processor =
            FrameProcessor::new(self.detector.clone(), Box::new(recognizer), ledger, dedup);
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = spawn_capture_thread(source, processor, cancel.clone(), self.frames.clone());
        *session = Some(Session { cancel, handle });
        tracing::info!("camera session started");
        Ok(StartOutcome::Started)
    }

    /// Stop the current session, joining the capture thread before returning
    /// so the device is released when the caller gets the ack. Idle stop is a
    /// no-op.
    pub fn stop(&self) -> StopOutcome {
        let mut session = self.session_lock();
        match session.take() {
            Some(current) => {
                current.cancel.store(true, Ordering::SeqCst);
                // The lock is held through the join, so a concurrent start
                // cannot reopen the device while the old capture thread still
                // holds it. The thread checks the flag between device reads,
                // so the join is bounded by one frame time.
                let _ = current.handle.join();
                tracing::info!("camera session stopped");
                StopOutcome::Stopped
            }
            None => {
                tracing::debug!("stop requested while idle");
                StopOutcome::WasIdle
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.session_lock()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Attach a live feed viewer. Receivers that fall behind skip to the
    /// newest frames.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.frames.subscribe()
    }
}

fn spawn_capture_thread<S: FrameSource + 'static>(
    mut source: S,
    mut processor: FrameProcessor,
    cancel: Arc<AtomicBool>,
    frames: broadcast::Sender<Arc<Vec<u8>>>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("rollcall-capture".into())
        .spawn(move || {
            tracing::info!("capture thread started");
            loop {
                if cancel.load(Ordering::SeqCst) {
                    break;
                }
                let frame = match source.next_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        tracing::info!("frame source drained; session ending");
                        break;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "device read failed; session ending");
                        break;
                    }
                };

                let now = Local::now().naive_local();
                let annotations = processor.advance(&frame.gray, frame.width, frame.height, now);

                let Some(mut image) = RgbImage::from_raw(frame.width, frame.height, frame.rgb)
                else {
                    tracing::warn!(
                        width = frame.width,
                        height = frame.height,
                        "frame buffer size mismatch; dropping frame"
                    );
                    continue;
                };
                annotate::render(&mut image, &annotations, now.date());

                match encode_jpeg(&image) {
                    // A send error only means no viewer is attached.
                    Ok(jpeg) => {
                        let _ = frames.send(Arc::new(jpeg));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "jpeg encode failed; dropping frame");
                    }
                }
            }
            tracing::info!("capture thread exiting");
        })
        .expect("failed to spawn capture thread")
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, FEED_JPEG_QUALITY);
    image.write_with_encoder(encoder)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::FaceBox;
    use rollcall_hw::Frame;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct NoFaces;

    impl DetectFaces for NoFaces {
        fn detect(&self, _gray: &[u8], _width: u32, _height: u32) -> Vec<FaceBox> {
            Vec::new()
        }
    }

    /// Yields `remaining` synthetic frames, then a clean end of stream.
    /// Releases its slot in the opener's live-source count on drop, like a
    /// real device handle.
    struct ScriptedSource {
        remaining: usize,
        sequence: u32,
        frame_delay: Duration,
        live: Arc<AtomicU32>,
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            // Keeps the capture loop from spinning hot in tests.
            std::thread::sleep(self.frame_delay);
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            self.sequence += 1;
            Ok(Some(Frame {
                gray: vec![128; 64 * 64],
                rgb: vec![128; 64 * 64 * 3],
                width: 64,
                height: 64,
                sequence: self.sequence,
            }))
        }
    }

    struct ScriptedOpener {
        frames_per_session: usize,
        frame_delay: Duration,
        fail_open: Arc<AtomicBool>,
        opened: Arc<AtomicU32>,
        live: Arc<AtomicU32>,
        overlap: Arc<AtomicBool>,
    }

    impl OpenFrameSource for ScriptedOpener {
        type Source = ScriptedSource;

        fn open(&self) -> Result<ScriptedSource, CameraError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(CameraError::DeviceNotFound("/dev/video9".into()));
            }
            // A real device is exclusive: opening while the previous source
            // is still alive is the failure the overlap flag records.
            if self.live.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap.store(true, Ordering::SeqCst);
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedSource {
                remaining: self.frames_per_session,
                sequence: 0,
                frame_delay: self.frame_delay,
                live: self.live.clone(),
            })
        }
    }

    struct OpenerHandles {
        opened: Arc<AtomicU32>,
        fail_open: Arc<AtomicBool>,
        overlap: Arc<AtomicBool>,
    }

    fn controller_with(
        frames_per_session: usize,
        frame_delay: Duration,
    ) -> (SessionController<ScriptedOpener>, OpenerHandles) {
        let handles = OpenerHandles {
            opened: Arc::new(AtomicU32::new(0)),
            fail_open: Arc::new(AtomicBool::new(false)),
            overlap: Arc::new(AtomicBool::new(false)),
        };
        let opener = ScriptedOpener {
            frames_per_session,
            frame_delay,
            fail_open: handles.fail_open.clone(),
            opened: handles.opened.clone(),
            live: Arc::new(AtomicU32::new(0)),
            overlap: handles.overlap.clone(),
        };
        let store = Arc::new(AttendanceStore::open_in_memory().unwrap());
        let ctl = SessionController::new(opener, Arc::new(NoFaces), store, 8);
        (ctl, handles)
    }

    fn controller(
        frames_per_session: usize,
    ) -> (SessionController<ScriptedOpener>, OpenerHandles) {
        controller_with(frames_per_session, Duration::from_millis(1))
    }

    fn wait_until_idle(ctl: &SessionController<ScriptedOpener>) {
        for _ in 0..500 {
            if !ctl.is_running() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("session did not end");
    }

    #[test]
    fn test_start_is_idempotent() {
        let (ctl, handles) = controller(usize::MAX);
        assert_eq!(ctl.start().unwrap(), StartOutcome::Started);
        assert_eq!(ctl.start().unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(handles.opened.load(Ordering::SeqCst), 1);
        ctl.stop();
    }

    #[test]
    fn test_stop_halts_session_and_is_idempotent() {
        let (ctl, _) = controller(usize::MAX);
        ctl.start().unwrap();
        assert!(ctl.is_running());

        assert_eq!(ctl.stop(), StopOutcome::Stopped);
        assert!(!ctl.is_running());
        assert_eq!(ctl.stop(), StopOutcome::WasIdle);
    }

    #[test]
    fn test_no_frames_after_stop_ack() {
        use tokio::sync::broadcast::error::TryRecvError;

        let (ctl, _) = controller(usize::MAX);
        let mut rx = ctl.subscribe();
        ctl.start().unwrap();
        rx.blocking_recv().unwrap();

        assert_eq!(ctl.stop(), StopOutcome::Stopped);

        // Frames emitted before the ack may still sit in the channel; after
        // draining them nothing new may ever arrive.
        loop {
            match rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_start_during_stop_waits_for_device_release() {
        // Slow frames widen stop's cancel+join window so the concurrent
        // start lands inside it.
        let (ctl, handles) = controller_with(usize::MAX, Duration::from_millis(30));
        let ctl = Arc::new(ctl);
        ctl.start().unwrap();

        let stopper = std::thread::spawn({
            let ctl = ctl.clone();
            move || ctl.stop()
        });
        std::thread::sleep(Duration::from_millis(5));
        // Must block until stop has released the device, never open a second
        // source alongside the old one.
        let _ = ctl.start().unwrap();

        assert_eq!(stopper.join().unwrap(), StopOutcome::Stopped);
        assert!(
            !handles.overlap.load(Ordering::SeqCst),
            "two sources were open at once"
        );
        ctl.stop();
    }

    #[test]
    fn test_feed_frames_are_jpeg() {
        let (ctl, _) = controller(usize::MAX);
        let mut rx = ctl.subscribe();
        ctl.start().unwrap();

        let frame = rx.blocking_recv().unwrap();
        // JPEG start-of-image marker.
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        ctl.stop();
    }

    #[test]
    fn test_device_failure_refuses_start() {
        let (ctl, handles) = controller(usize::MAX);
        handles.fail_open.store(true, Ordering::SeqCst);

        let err = ctl.start().unwrap_err();
        assert!(matches!(err, ControllerError::DeviceUnavailable(_)));
        assert!(!ctl.is_running());
        assert_eq!(handles.opened.load(Ordering::SeqCst), 0);

        // Device comes back; the controller recovers without restart.
        handles.fail_open.store(false, Ordering::SeqCst);
        assert_eq!(ctl.start().unwrap(), StartOutcome::Started);
        ctl.stop();
    }

    #[test]
    fn test_drained_source_can_be_restarted() {
        let (ctl, handles) = controller(3);
        ctl.start().unwrap();
        wait_until_idle(&ctl);

        // The ended session is reaped and a fresh one starts.
        assert_eq!(ctl.start().unwrap(), StartOutcome::Started);
        assert_eq!(handles.opened.load(Ordering::SeqCst), 2);
        ctl.stop();
    }
}
