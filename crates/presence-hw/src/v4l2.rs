//! V4L2 camera backend via the `v4l` crate.

use crate::camera::{
    CameraBackend, CameraError, Constraints, FallbackLevel, StreamInfo, StreamRequest, VideoSource,
};
use crate::frame::{self, Frame};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use std::sync::Arc;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const EBUSY: i32 = 16;
const MAX_VIDEO_NODES: usize = 16;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

fn map_open_error(device_path: &str, e: io::Error) -> CameraError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.to_string()),
        io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_path.to_string()),
        _ if e.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy(device_path.to_string()),
        _ => CameraError::CaptureFailed(format!("{device_path}: {e}")),
    }
}

/// An opened V4L2 device with a negotiated format.
struct Camera {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path` and request `width`x`height`.
    ///
    /// With `exact` set, a driver that negotiates a different size is treated
    /// as rejecting the constraints.
    fn open(device_path: &str, width: u32, height: u32, exact: bool) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| map_open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceNotFound(format!("{device_path}: not a capture device")));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::ConstraintsUnsatisfiable(format!("{device_path}: {e}")))?;

        if exact && (negotiated.width != width || negotiated.height != height) {
            return Err(CameraError::ConstraintsUnsatisfiable(format!(
                "{device_path}: requested {width}x{height}, driver offered {}x{}",
                negotiated.width, negotiated.height
            )));
        }

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::ConstraintsUnsatisfiable(format!(
                "{device_path}: unsupported pixel format {fourcc:?}"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "opened camera"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    /// Capture one frame and convert it to luma. Blocking.
    fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let pixels = (self.width * self.height) as usize;
        let luma = match self.pixel_format {
            PixelFormat::Grey if buf.len() >= pixels => Ok(buf[..pixels].to_vec()),
            PixelFormat::Grey => Err(frame::FrameError::InvalidLength {
                expected: pixels,
                actual: buf.len(),
            }),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
        }
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

        Ok(Frame::from_luma(luma, self.width, self.height, meta.sequence))
    }
}

/// Live V4L2 stream. Frames are grabbed on the blocking pool.
///
/// A capture already running on the blocking pool holds its own handle; the
/// device closes when that dequeue returns.
pub struct V4lStream {
    camera: Mutex<Option<Arc<Camera>>>,
    info: StreamInfo,
}

#[async_trait]
impl VideoSource for V4lStream {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    async fn next_frame(&self) -> Result<Frame, CameraError> {
        let camera = self.camera.lock().clone().ok_or(CameraError::Released)?;
        tokio::task::spawn_blocking(move || camera.capture_frame())
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("capture task failed: {e}")))?
    }

    fn stop(&self) {
        if self.camera.lock().take().is_some() {
            tracing::info!(device = %self.info.device, "camera released");
        }
    }
}

impl Drop for V4lStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Camera backend for Linux video4linux devices.
pub struct V4lBackend {
    default_device: String,
}

impl V4lBackend {
    pub fn new(default_device: impl Into<String>) -> Self {
        Self {
            default_device: default_device.into(),
        }
    }

    fn open_stream(
        &self,
        device: &str,
        width: u32,
        height: u32,
        exact: bool,
        level: FallbackLevel,
    ) -> Result<Box<dyn VideoSource>, CameraError> {
        let camera = Camera::open(device, width, height, exact)?;
        let info = StreamInfo {
            device: device.to_string(),
            width: camera.width,
            height: camera.height,
            level,
        };
        Ok(Box::new(V4lStream {
            camera: Mutex::new(Some(Arc::new(camera))),
            info,
        }))
    }

    fn open_ideal(&self, c: &Constraints) -> Result<Box<dyn VideoSource>, CameraError> {
        if let Some(facing) = c.facing {
            tracing::debug!(?facing, "V4L2 has no facing mode; ignoring");
        }
        let device = c.device.as_deref().unwrap_or(&self.default_device);
        self.open_stream(device, c.width, c.height, true, FallbackLevel::Ideal)
    }
}

impl CameraBackend for V4lBackend {
    fn check_environment(&self) -> Result<(), CameraError> {
        if Path::new("/sys/class/video4linux").exists()
            || Path::new(&self.default_device).exists()
        {
            Ok(())
        } else {
            Err(CameraError::Unsupported(
                "video4linux is not available (no /sys/class/video4linux)".into(),
            ))
        }
    }

    fn open(&self, request: &StreamRequest) -> Result<Box<dyn VideoSource>, CameraError> {
        let defaults = Constraints::default();
        match request {
            StreamRequest::Ideal(c) => self.open_ideal(c),
            StreamRequest::Relaxed { device } => {
                let device = device.as_deref().unwrap_or(&self.default_device);
                self.open_stream(
                    device,
                    defaults.width,
                    defaults.height,
                    false,
                    FallbackLevel::Relaxed,
                )
            }
            StreamRequest::AnyDevice => {
                let mut last_err = CameraError::DeviceNotFound("no video capture devices".into());
                for dev in list_devices() {
                    let opened = self.open_stream(
                        &dev.path,
                        defaults.width,
                        defaults.height,
                        false,
                        FallbackLevel::AnyDevice,
                    );
                    match opened {
                        Ok(stream) => return Ok(stream),
                        Err(e) => {
                            tracing::debug!(device = %dev.path, error = %e, "skipping device");
                            last_err = e;
                        }
                    }
                }
                Err(last_err)
            }
        }
    }
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..MAX_VIDEO_NODES {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
        });
    }

    devices
}
