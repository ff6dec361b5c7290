//! V4L2 capture for the kiosk camera.
//!
//! The device is opened once and kept streaming for the life of the
//! daemon; every dequeued buffer is converted to RGB before it leaves
//! this module.

use crate::frame::{self, Frame, FrameError, FrameSource};
use std::io;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

// --- Named constants ---

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const MMAP_BUFFERS: u32 = 4;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("{path}: no such device")]
    Missing { path: String },
    #[error("{path} is in use by another process")]
    Busy { path: String },
    #[error("{path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("{path} ({card}) cannot capture video")]
    NotCapture { path: String, card: String },
    #[error("camera offered {0}, expected YUYV or GREY")]
    UnsupportedFormat(String),
    #[error("stream error: {0}")]
    Stream(#[source] io::Error),
    #[error(transparent)]
    Convert(#[from] FrameError),
}

/// A V4L2 node that can capture video, as shown by `rollcall devices`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, converted to RGB.
    Yuyv,
    /// Single channel, replicated into RGB.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Result<Self, CameraError> {
        match &fourcc.repr {
            b"YUYV" => Ok(Self::Yuyv),
            b"GREY" => Ok(Self::Grey),
            _ => Err(CameraError::UnsupportedFormat(fourcc.to_string())),
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<image::RgbImage, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
        }
    }
}

/// The kiosk camera, streaming since [`Camera::open`].
pub struct Camera {
    stream: MmapStream<'static>,
    path: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Camera {
    pub fn open(path: &str) -> Result<Self, CameraError> {
        if !Path::new(path).exists() {
            return Err(CameraError::Missing { path: path.into() });
        }
        let device = Device::with_path(path).map_err(|source| open_error(path, source))?;
        let caps = device
            .query_caps()
            .map_err(|source| open_error(path, source))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCapture {
                path: path.into(),
                card: caps.card,
            });
        }

        // Drivers may substitute their own format; GREY is the usual
        // answer from monochrome sensors.
        let wanted = Format::new(CAPTURE_WIDTH, CAPTURE_HEIGHT, FourCC::new(b"YUYV"));
        let actual = device.set_format(&wanted).map_err(CameraError::Stream)?;
        let format = PixelFormat::from_fourcc(actual.fourcc)?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(CameraError::Stream)?;

        tracing::info!(
            device = path,
            card = %caps.card,
            width = actual.width,
            height = actual.height,
            ?format,
            "camera streaming"
        );

        Ok(Self {
            stream,
            path: path.into(),
            width: actual.width,
            height: actual.height,
            format,
        })
    }

    /// Block until the driver hands over the next buffer.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(CameraError::Stream)?;
        let sequence = meta.sequence;
        let image = self.format.to_rgb(buf, self.width, self.height)?;
        Ok(Frame {
            image,
            timestamp: Instant::now(),
            sequence,
        })
    }

    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut paths: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("video"))
            .map(|name| format!("/dev/{name}"))
            .collect();
        paths.sort_by_key(|p| video_index(p));

        paths
            .into_iter()
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Option<Frame> {
        match self.capture() {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(device = %self.path, error = %e, "no frame");
                None
            }
        }
    }
}

fn open_error(path: &str, source: io::Error) -> CameraError {
    if source.raw_os_error() == Some(EBUSY) {
        CameraError::Busy { path: path.into() }
    } else {
        CameraError::Open {
            path: path.into(),
            source,
        }
    }
}

/// Numeric suffix of `/dev/videoN`, so video10 sorts after video2.
fn video_index(path: &str) -> u32 {
    path.trim_start_matches("/dev/video").parse().unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(
            PixelFormat::from_fourcc(FourCC::new(b"YUYV")).unwrap(),
            PixelFormat::Yuyv
        );
        assert_eq!(
            PixelFormat::from_fourcc(FourCC::new(b"GREY")).unwrap(),
            PixelFormat::Grey
        );
        assert!(matches!(
            PixelFormat::from_fourcc(FourCC::new(b"MJPG")),
            Err(CameraError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_video_index_ordering() {
        let mut paths = vec!["/dev/video10", "/dev/video2", "/dev/video-odd", "/dev/video0"];
        paths.sort_by_key(|p| video_index(p));
        assert_eq!(
            paths,
            ["/dev/video0", "/dev/video2", "/dev/video10", "/dev/video-odd"]
        );
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/rollcall-no-such-camera").err().unwrap();
        assert!(matches!(err, CameraError::Missing { .. }));
    }

    #[test]
    fn test_busy_errno_maps_to_busy() {
        let err = open_error("/dev/video0", io::Error::from_raw_os_error(EBUSY));
        assert!(matches!(err, CameraError::Busy { .. }));
        let err = open_error("/dev/video0", io::Error::from_raw_os_error(13));
        assert!(matches!(err, CameraError::Open { .. }));
    }
}
