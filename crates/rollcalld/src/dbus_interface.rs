use crate::handoff::FrameSlot;
use crate::kiosk::{Kiosk, KioskError};
use crate::pipeline::AnnotatedFrame;
use std::io::Cursor;
use std::sync::Arc;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Kiosk1";
pub const OBJECT_PATH: &str = "/org/rollcall/Kiosk1";

/// D-Bus interface for the Rollcall attendance kiosk.
///
/// Bus name: org.rollcall.Kiosk1
/// Object path: /org/rollcall/Kiosk1
pub struct KioskService {
    kiosk: Arc<Kiosk>,
    slot: Arc<FrameSlot<AnnotatedFrame>>,
    camera_device: String,
}

impl KioskService {
    pub fn new(
        kiosk: Arc<Kiosk>,
        slot: Arc<FrameSlot<AnnotatedFrame>>,
        camera_device: String,
    ) -> Self {
        Self {
            kiosk,
            slot,
            camera_device,
        }
    }
}

#[interface(name = "org.rollcall.Kiosk1")]
impl KioskService {
    /// Register a new employee and start capturing their reference photos.
    async fn register(&self, name: &str, employee_id: &str, email: &str) -> fdo::Result<()> {
        tracing::info!(employee_id, "register requested");
        self.kiosk
            .register(name, employee_id, email)
            .map(drop)
            .map_err(to_fdo)
    }

    /// Begin a photo update. Returns "otp-sent" or "email-required".
    async fn request_update(&self, employee_id: &str) -> fdo::Result<String> {
        tracing::info!(employee_id, "update requested");
        self.kiosk
            .request_update(employee_id)
            .map(|step| step.as_str().to_string())
            .map_err(to_fdo)
    }

    /// Store an email address and send an OTP to it.
    async fn submit_email(&self, employee_id: &str, email: &str) -> fdo::Result<()> {
        self.kiosk.submit_email(employee_id, email).map_err(to_fdo)
    }

    /// Check an OTP. `true` means the photo update has started.
    async fn verify_otp(&self, employee_id: &str, code: &str) -> fdo::Result<bool> {
        match self.kiosk.verify_otp(employee_id, code) {
            Ok(_) => Ok(true),
            Err(KioskError::IncorrectCode) => Ok(false),
            Err(e) => Err(to_fdo(e)),
        }
    }

    async fn resend_otp(&self, employee_id: &str) -> fdo::Result<()> {
        self.kiosk.resend_otp(employee_id).map_err(to_fdo)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let (identities, samples) = self
            .kiosk
            .store()
            .counts()
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "identities": identities,
            "samples": samples,
            "enrollment": self.kiosk.enroller().state().as_str(),
        })
        .to_string())
    }

    /// PNG of the latest annotated frame. Consumes it from the hand-off slot.
    async fn snapshot(&self) -> fdo::Result<Vec<u8>> {
        let frame = self
            .slot
            .take()
            .ok_or_else(|| fdo::Error::Failed("no new frame available".into()))?;
        let best = frame
            .faces
            .iter()
            .map(|f| f.confidence)
            .fold(f64::MAX, f64::min);
        tracing::debug!(sequence = frame.sequence, faces = frame.faces.len(), best, "snapshot");
        encode_png(&frame)
    }

    #[zbus(signal)]
    pub async fn notification(
        emitter: &SignalEmitter<'_>,
        kind: &str,
        message: &str,
        duration_ms: u64,
    ) -> zbus::Result<()>;
}

fn encode_png(frame: &AnnotatedFrame) -> fdo::Result<Vec<u8>> {
    let mut png = Vec::new();
    frame
        .render()
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| fdo::Error::Failed(format!("PNG encode failed: {e}")))?;
    Ok(png)
}

fn to_fdo(e: KioskError) -> fdo::Error {
    if e.is_user_error() {
        fdo::Error::InvalidArgs(e.to_string())
    } else {
        tracing::error!(error = %e, "kiosk request failed");
        fdo::Error::Failed(e.to_string())
    }
}
