//! Frame type and pixel conversion: YUYV/Y16 to 8-bit luma, dark detection.

use std::time::Instant;
use thiserror::Error;

/// Share of pixels in the darkest bucket above which a frame counts as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A captured 8-bit luma frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Luma pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    pub fn from_luma(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

/// Extract the Y channel from packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per two pixels).
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian luma to 8 bits by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: y16.len(),
        });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True if more than `threshold_pct` of the pixels fall in the darkest bucket (0–31).
///
/// A lens cap, a covered camera or a sensor still warming up all look like this;
/// there is no point running the extractor on such frames.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale_4x2() {
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let err = yuyv_to_grayscale(&[0u8; 6], 2, 2).unwrap_err();
        assert_eq!(err, FrameError::InvalidLength { expected: 8, actual: 6 });
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        let y16 = [0x34, 0x12, 0xff, 0x80];
        assert_eq!(y16_to_grayscale(&y16, 2, 1).unwrap(), vec![0x12, 0x80]);
        assert!(y16_to_grayscale(&y16, 2, 2).is_err());
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(is_dark_frame(&[0u8; 100], DARK_FRAME_THRESHOLD));
        assert!(is_dark_frame(&[], DARK_FRAME_THRESHOLD));
        assert!(!is_dark_frame(&[128u8; 100], DARK_FRAME_THRESHOLD));

        let mut mostly_dark = vec![0u8; 100];
        mostly_dark[..4].fill(200);
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_THRESHOLD));
        mostly_dark[..10].fill(200);
        assert!(!is_dark_frame(&mostly_dark, DARK_FRAME_THRESHOLD));
    }

    #[test]
    fn test_from_luma_flags_dark_frames() {
        let frame = Frame::from_luma(vec![0u8; 16], 4, 4, 7);
        assert!(frame.is_dark);
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.avg_brightness(), 0.0);

        let frame = Frame::from_luma(vec![100u8; 16], 4, 4, 8);
        assert!(!frame.is_dark);
        assert_eq!(frame.avg_brightness(), 100.0);
    }
}
