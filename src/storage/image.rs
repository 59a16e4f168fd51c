//! Tagged images and raw pixel buffers.

use bytes::Bytes;
use serde_json::Value;

use crate::hardware::CapturedFrame;

// =============================================================================
// PixelBuffer
// =============================================================================

/// A raw, row-major pixel buffer.
///
/// Samples are 1 or 2 bytes wide (little-endian for 2-byte samples) and may
/// be RGB triplets. Buffers are immutable and cheap to clone.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    data: Bytes,
    width: u32,
    height: u32,
    byte_depth: u8,
    rgb: bool,
}

impl PixelBuffer {
    /// Wrap raw bytes. The byte length must match the geometry.
    pub fn new(data: Bytes, width: u32, height: u32, byte_depth: u8, rgb: bool) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize
                * height as usize
                * byte_depth as usize
                * if rgb { 3 } else { 1 }
        );
        Self {
            data,
            width,
            height,
            byte_depth,
            rgb,
        }
    }

    /// A buffer filled with a constant sample value.
    pub fn filled(value: u16, width: u32, height: u32, byte_depth: u8, rgb: bool) -> Self {
        let samples = width as usize * height as usize * if rgb { 3 } else { 1 };
        let mut data = Vec::with_capacity(samples * byte_depth as usize);
        for _ in 0..samples {
            if byte_depth == 1 {
                data.push(value as u8);
            } else {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        Self::new(Bytes::from(data), width, height, byte_depth, rgb)
    }

    pub fn from_frame(frame: CapturedFrame) -> Self {
        Self::new(
            frame.pix,
            frame.width,
            frame.height,
            frame.byte_depth,
            frame.rgb,
        )
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn byte_depth(&self) -> u8 {
        self.byte_depth
    }

    pub fn is_rgb(&self) -> bool {
        self.rgb
    }

    /// Samples per pixel (3 for RGB, otherwise 1).
    pub fn components(&self) -> u32 {
        if self.rgb {
            3
        } else {
            1
        }
    }

    /// Bits per sample.
    pub fn bits_per_sample(&self) -> u16 {
        self.byte_depth as u16 * 8
    }

    /// Read one sample. `component` selects within an RGB triplet.
    pub fn sample(&self, x: u32, y: u32, component: u32) -> u16 {
        let index = ((y * self.width + x) * self.components() + component) as usize;
        match self.byte_depth {
            1 => self.data[index] as u16,
            _ => {
                let byte = index * 2;
                u16::from_le_bytes([self.data[byte], self.data[byte + 1]])
            }
        }
    }
}

/// Write one sample into a raw byte slice laid out like a [`PixelBuffer`].
pub fn write_sample(data: &mut [u8], sample_index: usize, byte_depth: u8, value: u16) {
    if byte_depth == 1 {
        data[sample_index] = value.min(u8::MAX as u16) as u8;
    } else {
        data[sample_index * 2..sample_index * 2 + 2].copy_from_slice(&value.to_le_bytes());
    }
}

// =============================================================================
// TaggedImage
// =============================================================================

/// Pixels plus their metadata document.
///
/// Produced by the execution engine and moved into storage; the document
/// carries the channel/slice/frame/position label and acquisition context.
#[derive(Debug, Clone)]
pub struct TaggedImage {
    pub pix: PixelBuffer,
    pub tags: Value,
}

impl TaggedImage {
    pub fn new(pix: PixelBuffer, tags: Value) -> Self {
        Self { pix, tags }
    }
}

// =============================================================================
// Tests
// =============================================================================
