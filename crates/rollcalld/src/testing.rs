//! Test doubles shared by the daemon's unit tests.

use crate::config::FormConfig;
use crate::mailer::{MailError, OtpMailer};
use crate::observer::{Notification, NotificationKind, Observer};
use image::{GrayImage, Luma, Rgb, RgbImage};
use rollcall_core::raster::FACE_SIZE;
use rollcall_core::{Detector, DetectorError, FaceRegion};
use rollcall_hw::{Frame, FrameSource};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const FRAME_WIDTH: u32 = 640;
pub const FRAME_HEIGHT: u32 = 480;
/// Where synthetic faces are pasted into frames.
pub const FACE_AT: (u32, u32) = (200, 120);

pub fn face_region() -> FaceRegion {
    FaceRegion::new(FACE_AT.0, FACE_AT.1, FACE_SIZE, FACE_SIZE)
}

/// Structured texture that LBPH tells apart per seed. Values stay in 40..=160.
pub fn synthetic_face(seed: u32) -> GrayImage {
    GrayImage::from_fn(FACE_SIZE, FACE_SIZE, |x, y| {
        let v = ((x * (seed + 3) / 7 + y * (seed + 5) / 11) % 13) * 10 + 40;
        Luma([v as u8])
    })
}

pub fn brighter(face: &GrayImage, delta: u8) -> GrayImage {
    GrayImage::from_fn(face.width(), face.height(), |x, y| {
        Luma([face.get_pixel(x, y).0[0].saturating_add(delta)])
    })
}

/// A flat frame with `face` pasted at [`FACE_AT`].
pub fn frame_with_face(face: &GrayImage) -> RgbImage {
    let mut frame = RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([20, 20, 20]));
    for (x, y, p) in face.enumerate_pixels() {
        let v = p.0[0];
        frame.put_pixel(FACE_AT.0 + x, FACE_AT.1 + y, Rgb([v, v, v]));
    }
    frame
}

pub fn frame(image: RgbImage, sequence: u32) -> Frame {
    Frame {
        image,
        timestamp: Instant::now(),
        sequence,
    }
}

/// Yields the same image forever, numbering frames as it goes.
pub struct RepeatingSource {
    image: RgbImage,
    sequence: u32,
    delay: Duration,
}

impl RepeatingSource {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            sequence: 0,
            delay: Duration::from_millis(5),
        }
    }
}

impl FrameSource for RepeatingSource {
    fn next_frame(&mut self) -> Option<Frame> {
        std::thread::sleep(self.delay);
        self.sequence += 1;
        Some(frame(self.image.clone(), self.sequence))
    }
}

/// Detector that answers every call the same way, scaled to the input.
///
/// Regions are given in full-frame coordinates; when the pipeline hands in a
/// downscaled image they are scaled down to match.
pub struct ScriptedDetector {
    regions: Option<Vec<FaceRegion>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    pub fn always(regions: Vec<FaceRegion>) -> Self {
        Self {
            regions: Some(regions),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            regions: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(regions) = &self.regions else {
            return Err(DetectorError::InferenceFailed("scripted failure".into()));
        };
        let scale = image.width() as f32 / FRAME_WIDTH as f32;
        Ok(regions
            .iter()
            .map(|r| {
                let s = |v: u32| (v as f32 * scale).round() as u32;
                FaceRegion::new(s(r.x), s(r.y), s(r.width), s(r.height))
            })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingObserver {
    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn messages(&self, kind: NotificationKind) -> Vec<String> {
        self.all()
            .into_iter()
            .filter(|n| n.kind == kind)
            .map(|n| n.message)
            .collect()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.messages(kind).len()
    }

    pub async fn wait_for(&self, kind: NotificationKind, timeout: Duration) {
        self.wait_for_count(kind, 1, timeout).await;
    }

    pub async fn wait_for_count(&self, kind: NotificationKind, n: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.count(kind) < n {
            assert!(Instant::now() < deadline, "timed out waiting for {kind:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Observer for RecordingObserver {
    fn notify(&self, notification: Notification) {
        self.seen.lock().unwrap().push(notification);
    }
}

/// Captures OTP mails instead of sending them.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingMailer {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_code(&self) -> Option<String> {
        self.sent().last().map(|(_, code)| code.clone())
    }

    pub async fn wait_for_mails(&self, n: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while self.sent().len() < n {
            assert!(Instant::now() < deadline, "timed out waiting for {n} mails");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl OtpMailer for RecordingMailer {
    fn send_otp(&self, to: &str, code: &str) -> impl Future<Output = Result<(), MailError>> + Send {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), code.to_string()));
        let fail = self.fail;
        async move {
            if fail {
                Err(MailError::InvalidAddress("scripted failure".into()))
            } else {
                Ok(())
            }
        }
    }
}

pub fn form_config(url: &str) -> FormConfig {
    FormConfig {
        post_url: url.to_string(),
        referer: url.to_string(),
        user_agent: "rollcall-test".to_string(),
        field_name: "name".to_string(),
        field_employee_id: "emp_id".to_string(),
        field_date: "date".to_string(),
        field_time: "time".to_string(),
        timeout: Duration::from_secs(2),
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub head: String,
    pub body: String,
}

/// Throwaway HTTP server answering every request with one status.
pub struct MockEndpoint {
    pub url: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockEndpoint {
    pub async fn spawn(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/formResponse", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut socket).await else {
                        return;
                    };
                    log.lock().unwrap().push(request);
                    let response = format!(
                        "HTTP/1.1 {status} Mock\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { url, requests }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();
    Some(CapturedRequest { head, body })
}
