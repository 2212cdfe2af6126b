use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Text reply sent by the runtime when no frame is available yet.
pub const NOT_READY: &str = "not_ready";

/// Size of the fixed header at the start of every frame payload.
pub const FRAME_HEADER_LEN: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame payload is {len} bytes, shorter than the {FRAME_HEADER_LEN} byte header")]
    TooShort { len: usize },
    #[error("header total size {total_size} is outside of the {len} byte payload")]
    HeaderSizeOutOfRange { total_size: u32, len: usize },
    #[error("pixel data truncated: expected {expected} bytes, got {actual}")]
    PixelDataTruncated { expected: usize, actual: usize },
    #[error("capture mode {0:?} is not supported by this client")]
    UnsupportedMode(CaptureMode),
    #[error("unknown capture mode {0}")]
    UnknownMode(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CaptureMode {
    Unknown,
    StreamedUncompressed,
    #[default]
    StreamedCompressed,
    StreamedCompressedLz4,
    ElementaryStream,
}

impl From<CaptureMode> for u8 {
    fn from(value: CaptureMode) -> Self {
        match value {
            CaptureMode::Unknown => 0,
            CaptureMode::StreamedUncompressed => 1,
            CaptureMode::StreamedCompressed => 2,
            CaptureMode::StreamedCompressedLz4 => 3,
            CaptureMode::ElementaryStream => 4,
        }
    }
}

impl TryFrom<u8> for CaptureMode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::StreamedUncompressed),
            2 => Ok(Self::StreamedCompressed),
            3 => Ok(Self::StreamedCompressedLz4),
            4 => Ok(Self::ElementaryStream),
            other => Err(FrameError::UnknownMode(other)),
        }
    }
}

impl CaptureMode {
    /// Whether pixels travel as a JPEG image after the header.
    pub fn is_jpeg(self) -> bool {
        matches!(self, Self::StreamedCompressed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DctMethod {
    Slow,
    #[default]
    Fast,
    Float,
}

impl From<DctMethod> for u8 {
    fn from(value: DctMethod) -> Self {
        match value {
            DctMethod::Slow => 0,
            DctMethod::Fast => 1,
            DctMethod::Float => 2,
        }
    }
}

impl TryFrom<u8> for DctMethod {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Slow),
            1 => Ok(Self::Fast),
            2 => Ok(Self::Float),
            other => Err(format!("unknown dct method {other}")),
        }
    }
}

/// Encoder options attached to every frame request. Only JPEG capture
/// carries any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dct_method: Option<DctMethod>,
}

impl CaptureOptions {
    pub fn jpeg(quality: u8, dct_method: DctMethod) -> Self {
        Self {
            quality: Some(quality),
            dct_method: Some(dct_method),
        }
    }

    pub fn defaults_for(mode: CaptureMode) -> Self {
        if mode.is_jpeg() {
            Self::jpeg(90, DctMethod::Fast)
        } else {
            Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub mode: CaptureMode,
    pub handle: u32,
    pub options: CaptureOptions,
}

/// Text control frames sharing the viewport socket with frame traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamControl {
    Resize {
        width: u32,
        height: u32,
    },
    Options {
        mode: CaptureMode,
        options: CaptureOptions,
    },
}

/// Fixed little-endian header preceding pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub total_size: u32,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub color_buffer_size: u32,
    pub compressed_color_buffer_size: u32,
    pub depth_buffer_size: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(FrameError::TooShort { len: bytes.len() });
        }
        let word = |index: usize| {
            let start = index * 4;
            u32::from_le_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ])
        };
        Ok(Self {
            total_size: word(0),
            width: word(1),
            height: word(2),
            bits_per_pixel: word(3),
            color_buffer_size: word(4),
            compressed_color_buffer_size: word(5),
            depth_buffer_size: word(6),
        })
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        let words = [
            self.total_size,
            self.width,
            self.height,
            self.bits_per_pixel,
            self.color_buffer_size,
            self.compressed_color_buffer_size,
            self.depth_buffer_size,
        ];
        for (chunk, value) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    fn pixel_len(&self, mode: CaptureMode) -> u32 {
        if mode.is_jpeg() {
            self.compressed_color_buffer_size
        } else {
            self.color_buffer_size
        }
    }
}

/// A parsed frame payload borrowing its pixel bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub pixels: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Splits a binary payload into header and pixels for the given mode.
    ///
    /// Pixels start at `total_size`. A zero length field in the header means
    /// the pixels run to the end of the payload.
    pub fn parse(payload: &'a [u8], mode: CaptureMode) -> Result<Self, FrameError> {
        match mode {
            CaptureMode::StreamedUncompressed | CaptureMode::StreamedCompressed => {}
            other => return Err(FrameError::UnsupportedMode(other)),
        }
        let header = FrameHeader::parse(payload)?;
        let start = header.total_size as usize;
        if start < FRAME_HEADER_LEN || start > payload.len() {
            return Err(FrameError::HeaderSizeOutOfRange {
                total_size: header.total_size,
                len: payload.len(),
            });
        }
        let rest = &payload[start..];
        let expected = header.pixel_len(mode) as usize;
        let pixels = if expected == 0 {
            rest
        } else if expected > rest.len() {
            return Err(FrameError::PixelDataTruncated {
                expected,
                actual: rest.len(),
            });
        } else {
            &rest[..expected]
        };
        Ok(Self { header, pixels })
    }

    /// Builds a payload from a header and pixel bytes, fixing up the size
    /// fields to match.
    pub fn encode(mut header: FrameHeader, mode: CaptureMode, pixels: &[u8]) -> Vec<u8> {
        header.total_size = FRAME_HEADER_LEN as u32;
        let len = pixels.len() as u32;
        if mode.is_jpeg() {
            header.compressed_color_buffer_size = len;
        } else {
            header.color_buffer_size = len;
        }
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + pixels.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(pixels);
        out
    }
}
