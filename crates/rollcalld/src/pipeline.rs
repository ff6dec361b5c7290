//! Frame pipeline: capture, detect, recognize, dedup, publish.
//!
//! Runs on a dedicated OS thread until the stop flag is raised. Every frame
//! is classified against one model snapshot, and the annotated result
//! replaces whatever is waiting in the hand-off slot.

use crate::attendance::Attendance;
use crate::handoff::FrameSlot;
use ab_glyph::{FontRef, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rollcall_core::{raster, Detector, FaceRegion, Identity, SharedModel};
use rollcall_hw::{Frame, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// --- Named constants ---

/// Back-off when the source has nothing to offer.
const IDLE_BACKOFF: Duration = Duration::from_millis(10);
const RECOGNIZED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 16.0;
/// Gap between a label's baseline area and the top of its box.
const LABEL_GAP: u32 = 4;
const UNKNOWN_LABEL: &str = "Unknown";
static LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// One face found in a frame and what the recognizer made of it.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAnnotation {
    pub region: FaceRegion,
    /// Set only when the match beat the recognition threshold.
    pub identity: Option<Identity>,
    pub confidence: f64,
}

/// A full-resolution frame plus the pipeline's findings. The image itself is
/// left clean so enrollment can crop samples from it.
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub image: RgbImage,
    pub faces: Vec<FaceAnnotation>,
    pub sequence: u32,
}

impl AnnotatedFrame {
    /// Copy of the frame with a box around every face, green when
    /// recognized and red otherwise, labelled "Name (ID)" or "Unknown".
    pub fn render(&self) -> RgbImage {
        let mut out = self.image.clone();
        let font = label_font();
        for face in &self.faces {
            let color = if face.identity.is_some() {
                RECOGNIZED_COLOR
            } else {
                UNKNOWN_COLOR
            };
            let r = face.region;
            for inset in 0..BOX_THICKNESS {
                let (w, h) = (
                    r.width.saturating_sub(2 * inset),
                    r.height.saturating_sub(2 * inset),
                );
                if w == 0 || h == 0 {
                    break;
                }
                let rect = Rect::at((r.x + inset) as i32, (r.y + inset) as i32).of_size(w, h);
                draw_hollow_rect_mut(&mut out, rect, color);
            }

            if let Some(font) = &font {
                let label = face
                    .identity
                    .as_ref()
                    .map_or_else(|| UNKNOWN_LABEL.to_string(), Identity::to_string);
                let scale = PxScale::from(LABEL_SCALE);
                let (_, text_h) = text_size(scale, font, &label);
                let y = r.y.saturating_sub(text_h + LABEL_GAP);
                draw_text_mut(&mut out, color, r.x as i32, y as i32, scale, font, &label);
            }
        }
        out
    }
}

fn label_font() -> Option<FontRef<'static>> {
    match FontRef::try_from_slice(LABEL_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            tracing::warn!(error = %e, "label font unusable, drawing boxes only");
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub recognition_threshold: f64,
    pub reduce_factor: f32,
}

impl PipelineSettings {
    pub fn new(recognition_threshold: f64, reduce_factor: f32) -> Self {
        let reduce_factor = if reduce_factor > 0.0 && reduce_factor <= 1.0 {
            reduce_factor
        } else {
            tracing::warn!(reduce_factor, "frame reduce factor out of range, detecting at full size");
            1.0
        };
        Self {
            recognition_threshold,
            reduce_factor,
        }
    }
}

pub struct FramePipeline {
    detector: Box<dyn Detector>,
    model: Arc<SharedModel>,
    attendance: Arc<Attendance>,
    slot: Arc<FrameSlot<AnnotatedFrame>>,
    settings: PipelineSettings,
}

impl FramePipeline {
    pub fn new(
        detector: Box<dyn Detector>,
        model: Arc<SharedModel>,
        attendance: Arc<Attendance>,
        slot: Arc<FrameSlot<AnnotatedFrame>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            detector,
            model,
            attendance,
            slot,
            settings,
        }
    }

    /// Detect and classify every face in `frame`, feeding confident matches
    /// to attendance.
    pub fn process(&mut self, frame: Frame) -> AnnotatedFrame {
        let gray = raster::to_gray(&frame.image);
        let (width, height) = gray.dimensions();
        let factor = self.settings.reduce_factor;
        let small = raster::downscale(&gray, factor);

        let regions = match self.detector.detect(&small) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "detection failed");
                Vec::new()
            }
        };

        let snapshot = self.model.load();
        let now = Instant::now();
        let mut faces = Vec::with_capacity(regions.len());
        for region in regions {
            let Some(region) = region.upscaled(factor).clamped(width, height) else {
                continue;
            };
            let Some(crop) = raster::crop_face(&gray, &region) else {
                continue;
            };
            let prediction = snapshot.predict(&crop);
            let identity = prediction
                .recognized(self.settings.recognition_threshold)
                .cloned();
            if let Some(identity) = &identity {
                tracing::debug!(
                    employee_id = %identity.employee_id,
                    confidence = prediction.confidence,
                    "face recognized"
                );
                self.attendance.on_recognized(identity, now);
            }
            faces.push(FaceAnnotation {
                region,
                identity,
                confidence: prediction.confidence,
            });
        }

        AnnotatedFrame {
            image: frame.image,
            faces,
            sequence: frame.sequence,
        }
    }

    fn run(mut self, mut source: Box<dyn FrameSource>, stop: Arc<AtomicBool>) {
        tracing::info!("frame pipeline started");
        while !stop.load(Ordering::SeqCst) {
            let Some(frame) = source.next_frame() else {
                std::thread::sleep(IDLE_BACKOFF);
                continue;
            };
            let annotated = self.process(frame);
            self.slot.publish(annotated);
        }
        tracing::info!("frame pipeline stopped");
    }

    /// Move the pipeline onto its own thread. The frame source is dropped
    /// when the thread exits.
    pub fn spawn(
        self,
        source: Box<dyn FrameSource>,
        stop: Arc<AtomicBool>,
    ) -> std::io::Result<PipelineHandle> {
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("rollcall-pipeline".into())
            .spawn(move || self.run(source, thread_stop))?;
        Ok(PipelineHandle { thread, stop })
    }
}

pub struct PipelineHandle {
    thread: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

impl PipelineHandle {
    /// Raise the stop flag and wait up to `timeout` for the thread to exit.
    /// Returns `false` if it had to be left behind.
    pub fn shutdown(self, timeout: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        while !self.thread.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(?timeout, "pipeline thread did not stop in time, detaching");
                return false;
            }
            std::thread::sleep(IDLE_BACKOFF);
        }
        if self.thread.join().is_err() {
            tracing::error!("pipeline thread panicked");
        }
        true
    }
}
