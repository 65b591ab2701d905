use serde::{Deserialize, Serialize};

/// Bytes per pixel of every image crossing the control plane (8-bit RGB).
pub const BYTES_PER_PIXEL: usize = 3;

/// A rendered frame: 8-bit RGB, row-major, no row padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raw pixel data, `width * height * 3` bytes.
    pub pixels: Vec<u8>,
}

impl RenderedImage {
    /// Create a black image.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; Self::byte_len(width, height)],
        }
    }

    /// Create an image filled with a single color.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(Self::byte_len(width, height));
        for _ in 0..(width as usize) * (height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Build from tightly packed RGBA8 rows, dropping alpha.
    pub fn from_rgba(width: u32, height: u32, rgba: &[u8]) -> Self {
        let mut pixels = Vec::with_capacity(Self::byte_len(width, height));
        for px in rgba.chunks_exact(4) {
            pixels.extend_from_slice(&px[..3]);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Byte size of an RGB8 image of the given dimensions.
    pub fn byte_len(width: u32, height: u32) -> usize {
        (width as usize) * (height as usize) * BYTES_PER_PIXEL
    }

    /// Total number of pixels.
    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Get the RGB value at a pixel coordinate. Returns None if out of bounds.
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + (x as usize)) * BYTES_PER_PIXEL;
        Some([
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ])
    }

    /// True when the pixel buffer matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.pixels.len() == Self::byte_len(self.width, self.height)
    }
}
