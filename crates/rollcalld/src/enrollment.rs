//! Enrollment sessions: countdown, sample capture, retrain.
//!
//! A session runs on its own thread with its own detector, reading the
//! latest frame from the hand-off slot. Only one session runs at a time.

use crate::handoff::FrameSlot;
use crate::observer::{Notification, NotificationKind, Observer};
use crate::pipeline::AnnotatedFrame;
use rollcall_core::{raster, Detector, Identity, IdentityStore, ModelSnapshot, SharedModel, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

// --- Named constants ---

const TICK_MESSAGE_DURATION: Duration = Duration::from_secs(1);
const CAPTURE_MESSAGE_DURATION: Duration = Duration::from_millis(500);
const DONE_MESSAGE_DURATION: Duration = Duration::from_secs(3);
/// Wait between polls of an empty hand-off slot.
const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Wait after a frame without a usable face.
const NO_FACE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("an enrollment session is already running")]
    Busy,
    #[error("enrollment aborted")]
    Aborted,
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to spawn enrollment thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentKind {
    Register,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    Idle,
    Countdown,
    Capturing,
    Retraining,
    Done,
}

impl EnrollmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Countdown => "countdown",
            Self::Capturing => "capturing",
            Self::Retraining => "retraining",
            Self::Done => "done",
        }
    }

    fn is_active(self) -> bool {
        matches!(self, Self::Countdown | Self::Capturing | Self::Retraining)
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub identity: Identity,
    pub target: usize,
    pub kind: EnrollmentKind,
}

/// An enroller reserved by [`Enroller::claim`].
pub struct EnrollmentClaim<'a> {
    enroller: &'a Enroller,
    launched: bool,
}

impl Drop for EnrollmentClaim<'_> {
    fn drop(&mut self) {
        if !self.launched {
            self.enroller.set_state(EnrollmentState::Idle);
        }
    }
}

/// What a finished session wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentSummary {
    pub identity: Identity,
    pub first_sequence: u32,
    pub captured: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EnrollmentSettings {
    pub countdown_ticks: u32,
    pub tick_interval: Duration,
    pub capture_interval: Duration,
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            countdown_ticks: 3,
            tick_interval: Duration::from_secs(1),
            capture_interval: Duration::from_millis(200),
        }
    }
}

/// Retrain over every sample in `store` and publish the result. Returns the
/// number of samples trained on.
pub fn retrain(store: &IdentityStore, model: &SharedModel) -> Result<usize, StoreError> {
    let samples = store.samples()?;
    let snapshot = ModelSnapshot::train(&samples);
    let count = snapshot.sample_count();
    model.install(snapshot);
    Ok(count)
}

pub struct Enroller {
    store: Arc<IdentityStore>,
    model: Arc<SharedModel>,
    slot: Arc<FrameSlot<AnnotatedFrame>>,
    detector: Mutex<Box<dyn Detector>>,
    observer: Arc<dyn Observer>,
    stop: Arc<AtomicBool>,
    settings: EnrollmentSettings,
    state: Mutex<EnrollmentState>,
}

impl Enroller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<IdentityStore>,
        model: Arc<SharedModel>,
        slot: Arc<FrameSlot<AnnotatedFrame>>,
        detector: Box<dyn Detector>,
        observer: Arc<dyn Observer>,
        stop: Arc<AtomicBool>,
        settings: EnrollmentSettings,
    ) -> Self {
        Self {
            store,
            model,
            slot,
            detector: Mutex::new(detector),
            observer,
            stop,
            settings,
            state: Mutex::new(EnrollmentState::Idle),
        }
    }

    pub fn state(&self) -> EnrollmentState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the enroller and run `request` on a new thread.
    pub fn start(
        self: &Arc<Self>,
        request: EnrollmentRequest,
    ) -> Result<JoinHandle<Result<EnrollmentSummary, EnrollmentError>>, EnrollmentError> {
        let claim = self.claim()?;
        self.launch(claim, request)
    }

    /// Reserve the enroller for one session. Dropping the claim without
    /// launching releases it again.
    pub fn claim(&self) -> Result<EnrollmentClaim<'_>, EnrollmentError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_active() {
            return Err(EnrollmentError::Busy);
        }
        *state = EnrollmentState::Countdown;
        Ok(EnrollmentClaim {
            enroller: self,
            launched: false,
        })
    }

    /// Run `request` on a new thread under a claim taken from this enroller.
    pub fn launch(
        self: &Arc<Self>,
        mut claim: EnrollmentClaim<'_>,
        request: EnrollmentRequest,
    ) -> Result<JoinHandle<Result<EnrollmentSummary, EnrollmentError>>, EnrollmentError> {
        claim.launched = true;
        drop(claim);

        tracing::info!(
            employee_id = %request.identity.employee_id,
            target = request.target,
            kind = ?request.kind,
            "starting enrollment"
        );

        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("rollcall-enroll".into())
            .spawn(move || this.run(request))
            .map_err(|e| {
                self.set_state(EnrollmentState::Idle);
                EnrollmentError::Spawn(e)
            })
    }

    fn run(&self, request: EnrollmentRequest) -> Result<EnrollmentSummary, EnrollmentError> {
        let result = self.session(&request);
        match &result {
            Ok(summary) => {
                self.set_state(EnrollmentState::Done);
                tracing::info!(
                    employee_id = %summary.identity.employee_id,
                    first_sequence = summary.first_sequence,
                    captured = summary.captured,
                    "enrollment finished"
                );
                let message = match request.kind {
                    EnrollmentKind::Register => "Registration completed!",
                    EnrollmentKind::Update => "Face updated!",
                };
                self.notify(NotificationKind::EnrollmentDone, message, DONE_MESSAGE_DURATION);
            }
            Err(EnrollmentError::Aborted) => {
                tracing::info!(employee_id = %request.identity.employee_id, "enrollment aborted");
            }
            Err(e) => {
                self.notify(
                    NotificationKind::Error,
                    format!("Enrollment failed: {e}"),
                    DONE_MESSAGE_DURATION,
                );
            }
        }
        self.set_state(EnrollmentState::Idle);
        result
    }

    fn session(&self, request: &EnrollmentRequest) -> Result<EnrollmentSummary, EnrollmentError> {
        let identity = &request.identity;
        let first_sequence = self.store.next_sequence(&identity.employee_id)?;

        for tick in (1..=self.settings.countdown_ticks).rev() {
            self.check_stop()?;
            self.notify(
                NotificationKind::EnrollmentProgress,
                format!("Capturing in {tick}..."),
                TICK_MESSAGE_DURATION,
            );
            std::thread::sleep(self.settings.tick_interval);
        }
        self.notify(
            NotificationKind::EnrollmentProgress,
            "Capturing now!",
            TICK_MESSAGE_DURATION,
        );
        std::thread::sleep(self.settings.tick_interval / 2);

        self.set_state(EnrollmentState::Capturing);
        // Drop anything published before capture started.
        self.slot.take();
        let mut captured = 0usize;
        while captured < request.target {
            self.check_stop()?;
            let Some(frame) = self.slot.take() else {
                std::thread::sleep(FRAME_POLL_INTERVAL);
                continue;
            };

            let gray = raster::to_gray(&frame.image);
            let face = self
                .detect_first(&gray)
                .and_then(|region| raster::crop_face(&gray, &region));
            let Some(face) = face else {
                self.notify(
                    NotificationKind::EnrollmentProgress,
                    "No face detected. Please position yourself.",
                    CAPTURE_MESSAGE_DURATION,
                );
                std::thread::sleep(NO_FACE_BACKOFF);
                continue;
            };

            let sequence = first_sequence + captured as u32;
            let path = self.store.write_sample(identity, sequence, &face)?;
            captured += 1;
            tracing::info!(
                employee_id = %identity.employee_id,
                sample = %path.display(),
                captured,
                target = request.target,
                "captured sample"
            );
            self.notify(
                NotificationKind::EnrollmentProgress,
                format!("Captured {captured}/{} photos...", request.target),
                CAPTURE_MESSAGE_DURATION,
            );
            std::thread::sleep(self.settings.capture_interval);
        }

        self.set_state(EnrollmentState::Retraining);
        let trained = retrain(&self.store, &self.model)?;
        tracing::info!(samples = trained, "recognizer retrained");

        Ok(EnrollmentSummary {
            identity: identity.clone(),
            first_sequence,
            captured,
        })
    }

    fn detect_first(&self, gray: &image::GrayImage) -> Option<rollcall_core::FaceRegion> {
        let mut detector = self.detector.lock().unwrap_or_else(|e| e.into_inner());
        match detector.detect(gray) {
            Ok(regions) => regions.into_iter().next(),
            Err(e) => {
                tracing::warn!(error = %e, "detection failed during capture");
                None
            }
        }
    }

    fn check_stop(&self) -> Result<(), EnrollmentError> {
        if self.stop.load(Ordering::SeqCst) {
            Err(EnrollmentError::Aborted)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, next: EnrollmentState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn notify(&self, kind: NotificationKind, message: impl Into<String>, duration: Duration) {
        self.observer.notify(Notification::new(kind, message, duration));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use rollcall_core::store::parse_sample_file_name;
    use std::time::Instant;
    use tempfile::TempDir;

    fn fast_settings() -> EnrollmentSettings {
        EnrollmentSettings {
            countdown_ticks: 3,
            tick_interval: Duration::from_millis(5),
            capture_interval: Duration::from_millis(1),
        }
    }

    struct Rig {
        _tmp: TempDir,
        store: Arc<IdentityStore>,
        model: Arc<SharedModel>,
        slot: Arc<FrameSlot<AnnotatedFrame>>,
        observer: Arc<RecordingObserver>,
        stop: Arc<AtomicBool>,
        enroller: Arc<Enroller>,
    }

    fn rig(detector: ScriptedDetector) -> Rig {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(IdentityStore::open(tmp.path()).unwrap());
        let model = Arc::new(SharedModel::default());
        let slot = Arc::new(FrameSlot::new());
        let observer = Arc::new(RecordingObserver::default());
        let stop = Arc::new(AtomicBool::new(false));
        let enroller = Arc::new(Enroller::new(
            Arc::clone(&store),
            Arc::clone(&model),
            Arc::clone(&slot),
            Box::new(detector),
            observer.clone(),
            Arc::clone(&stop),
            fast_settings(),
        ));
        Rig {
            _tmp: tmp,
            store,
            model,
            slot,
            observer,
            stop,
            enroller,
        }
    }

    /// Keeps the slot topped up with `image` until `done` is raised.
    fn feed(slot: &Arc<FrameSlot<AnnotatedFrame>>, image: image::RgbImage) -> Arc<AtomicBool> {
        let done = Arc::new(AtomicBool::new(false));
        let slot = Arc::clone(slot);
        let flag = Arc::clone(&done);
        std::thread::spawn(move || {
            let mut sequence = 0;
            while !flag.load(Ordering::SeqCst) {
                sequence += 1;
                slot.publish(AnnotatedFrame {
                    image: image.clone(),
                    faces: Vec::new(),
                    sequence,
                });
                std::thread::sleep(Duration::from_millis(2));
            }
        });
        done
    }

    fn request(name: &str, id: &str, target: usize, kind: EnrollmentKind) -> EnrollmentRequest {
        EnrollmentRequest {
            identity: Identity::new(name, id),
            target,
            kind,
        }
    }

    fn sequences(store: &IdentityStore, employee_id: &str) -> Vec<u32> {
        let mut seqs: Vec<u32> = std::fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| parse_sample_file_name(e.unwrap().file_name().to_str()?))
            .filter(|(identity, _)| identity.employee_id == employee_id)
            .map(|(_, seq)| seq)
            .collect();
        seqs.sort_unstable();
        seqs
    }

    #[test]
    fn test_register_then_update_sequences() {
        let rig = rig(ScriptedDetector::always(vec![face_region()]));
        let done = feed(&rig.slot, frame_with_face(&synthetic_face(1)));

        let summary = rig
            .enroller
            .start(request("alice", "E001", 10, EnrollmentKind::Register))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(summary.first_sequence, 0);
        assert_eq!(summary.captured, 10);
        assert_eq!(sequences(&rig.store, "E001"), (0..10).collect::<Vec<_>>());
        assert_eq!(
            rig.observer.messages(NotificationKind::EnrollmentDone),
            vec!["Registration completed!".to_string()]
        );

        let summary = rig
            .enroller
            .start(request("alice", "E001", 5, EnrollmentKind::Update))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        done.store(true, Ordering::SeqCst);
        assert_eq!(summary.first_sequence, 10);
        assert_eq!(sequences(&rig.store, "E001"), (0..15).collect::<Vec<_>>());
        assert!(rig
            .observer
            .messages(NotificationKind::EnrollmentDone)
            .contains(&"Face updated!".to_string()));
        assert_eq!(rig.enroller.state(), EnrollmentState::Idle);
    }

    #[test]
    fn test_retrain_installs_new_snapshot() {
        let rig = rig(ScriptedDetector::always(vec![face_region()]));
        let done = feed(&rig.slot, frame_with_face(&synthetic_face(1)));
        let before = rig.model.load();
        assert!(before.labels().is_empty());

        rig.enroller
            .start(request("alice", "E001", 3, EnrollmentKind::Register))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        done.store(true, Ordering::SeqCst);

        let after = rig.model.load();
        assert_eq!(after.sample_count(), 3);
        let p = after.predict(&brighter(&synthetic_face(1), 10));
        assert_eq!(p.recognized(60.0), Some(&Identity::new("alice", "E001")));
        // Readers holding the old snapshot still see the old state.
        assert!(before.labels().is_empty());
    }

    #[test]
    fn test_countdown_and_progress_messages() {
        let rig = rig(ScriptedDetector::always(vec![face_region()]));
        let done = feed(&rig.slot, frame_with_face(&synthetic_face(1)));
        rig.enroller
            .start(request("alice", "E001", 2, EnrollmentKind::Register))
            .unwrap()
            .join()
            .unwrap()
            .unwrap();
        done.store(true, Ordering::SeqCst);

        let progress = rig.observer.messages(NotificationKind::EnrollmentProgress);
        assert_eq!(
            &progress[..4],
            &[
                "Capturing in 3...".to_string(),
                "Capturing in 2...".to_string(),
                "Capturing in 1...".to_string(),
                "Capturing now!".to_string(),
            ]
        );
        assert!(progress.contains(&"Captured 2/2 photos...".to_string()));
    }

    #[test]
    fn test_second_session_is_busy() {
        let rig = rig(ScriptedDetector::always(vec![face_region()]));
        // No frames are fed, so the first session waits in capture.
        let first = rig
            .enroller
            .start(request("alice", "E001", 1, EnrollmentKind::Register))
            .unwrap();
        let err = rig
            .enroller
            .start(request("bob", "E002", 1, EnrollmentKind::Register))
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Busy));

        rig.stop.store(true, Ordering::SeqCst);
        assert!(matches!(first.join().unwrap(), Err(EnrollmentError::Aborted)));
        assert_eq!(rig.enroller.state(), EnrollmentState::Idle);
    }

    #[test]
    fn test_unused_claim_releases_enroller() {
        let rig = rig(ScriptedDetector::always(vec![face_region()]));
        let claim = rig.enroller.claim().unwrap();
        assert_eq!(rig.enroller.state(), EnrollmentState::Countdown);
        assert!(matches!(rig.enroller.claim(), Err(EnrollmentError::Busy)));
        assert!(matches!(
            rig.enroller
                .start(request("bob", "E002", 1, EnrollmentKind::Register)),
            Err(EnrollmentError::Busy)
        ));

        drop(claim);
        assert_eq!(rig.enroller.state(), EnrollmentState::Idle);
        assert!(rig.enroller.claim().is_ok());
        assert_eq!(rig.enroller.state(), EnrollmentState::Idle);
    }

    #[test]
    fn test_no_face_keeps_capturing_until_stopped() {
        let rig = rig(ScriptedDetector::always(Vec::new()));
        let done = feed(&rig.slot, frame_with_face(&synthetic_face(1)));
        let before = rig.model.load();
        let handle = rig
            .enroller
            .start(request("alice", "E001", 3, EnrollmentKind::Register))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !rig
            .observer
            .messages(NotificationKind::EnrollmentProgress)
            .contains(&"No face detected. Please position yourself.".to_string())
        {
            assert!(Instant::now() < deadline, "no hint shown");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(rig.enroller.state(), EnrollmentState::Capturing);

        rig.stop.store(true, Ordering::SeqCst);
        assert!(matches!(handle.join().unwrap(), Err(EnrollmentError::Aborted)));
        done.store(true, Ordering::SeqCst);
        assert!(sequences(&rig.store, "E001").is_empty());
        // Aborted sessions do not retrain.
        assert!(Arc::ptr_eq(&before, &rig.model.load()));
        assert_eq!(rig.observer.count(NotificationKind::EnrollmentDone), 0);
    }

    #[test]
    fn test_retrain_helper_counts_samples() {
        let tmp = TempDir::new().unwrap();
        let store = IdentityStore::open(tmp.path()).unwrap();
        let model = SharedModel::default();
        assert_eq!(retrain(&store, &model).unwrap(), 0);
        store
            .write_sample(&Identity::new("bob", "E002"), 0, &synthetic_face(7))
            .unwrap();
        assert_eq!(retrain(&store, &model).unwrap(), 1);
        assert_eq!(model.load().labels().label_of("E002"), Some(0));
    }
}
