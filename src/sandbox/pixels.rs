//! RGBA pixel buffer shared by the graphics module and the output
//! capture, plus PNG encoding for callers turning outcomes into attachments.

use std::fmt;
use std::io::Cursor;

/// Largest surface a snippet may allocate (2048 x 2048).
pub const MAX_SURFACE_PIXELS: u64 = 2048 * 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const BLACK: Rgba = Rgba::new(0, 0, 0, 255);
    pub const TRANSPARENT: Rgba = Rgba::new(0, 0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Source-over compositing of `self` onto `dst`.
    fn over(self, dst: Rgba) -> Rgba {
        match self.a {
            255 => self,
            0 => dst,
            alpha => {
                let a = u32::from(alpha);
                let inv = 255 - a;
                let mix = |s: u8, d: u8| ((u32::from(s) * a + u32::from(d) * inv) / 255) as u8;
                Rgba {
                    r: mix(self.r, dst.r),
                    g: mix(self.g, dst.g),
                    b: mix(self.b, dst.b),
                    a: (a + u32::from(dst.a) * inv / 255).min(255) as u8,
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PixelError {
    #[error("invalid surface size {width}x{height} (each side must be 1..=2048 pixels)")]
    InvalidSize { width: i64, height: i64 },

    #[error("pixel data does not match {width}x{height}")]
    Dimensions { width: u32, height: u32 },

    #[error(transparent)]
    Encode(#[from] image::ImageError),
}

/// Row-major RGBA8 image.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl PixelBuffer {
    pub fn new(width: i64, height: i64, fill: Rgba) -> Result<Self, PixelError> {
        let valid = (1..=2048).contains(&width) && (1..=2048).contains(&height);
        if !valid || (width * height) as u64 > MAX_SURFACE_PIXELS {
            return Err(PixelError::InvalidSize { width, height });
        }
        let (width, height) = (width as u32, height as u32);
        let mut data = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&[fill.r, fill.g, fill.b, fill.a]);
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes held by the pixel data.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_rgba_bytes(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * 4)
    }

    pub fn get(&self, x: i64, y: i64) -> Option<Rgba> {
        let at = self.offset(x, y)?;
        let px = &self.data[at..at + 4];
        Some(Rgba::new(px[0], px[1], px[2], px[3]))
    }

    /// Writes one pixel. Out-of-bounds writes are clipped silently.
    pub fn set(&mut self, x: i64, y: i64, color: Rgba) {
        if let Some(at) = self.offset(x, y) {
            self.data[at..at + 4].copy_from_slice(&[color.r, color.g, color.b, color.a]);
        }
    }

    pub fn fill(&mut self, color: Rgba) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&[color.r, color.g, color.b, color.a]);
        }
    }

    /// Fills the intersection of the rectangle with the buffer.
    pub fn fill_rect(&mut self, x: i64, y: i64, w: i64, h: i64, color: Rgba) {
        let x0 = x.max(0);
        let y0 = y.max(0);
        let x1 = x.saturating_add(w).min(i64::from(self.width));
        let y1 = y.saturating_add(h).min(i64::from(self.height));
        for py in y0..y1 {
            for px in x0..x1 {
                self.set(px, py, color);
            }
        }
    }

    /// Composites `src` onto `self` with its top-left corner at (x, y).
    pub fn blit(&mut self, src: &PixelBuffer, x: i64, y: i64) {
        for sy in 0..i64::from(src.height) {
            for sx in 0..i64::from(src.width) {
                let (dx, dy) = (x.saturating_add(sx), y.saturating_add(sy));
                let (Some(color), Some(dst)) = (src.get(sx, sy), self.get(dx, dy)) else {
                    continue;
                };
                self.set(dx, dy, color.over(dst));
            }
        }
    }

    pub(crate) fn to_image(&self) -> Result<image::RgbaImage, PixelError> {
        image::RgbaImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            PixelError::Dimensions {
                width: self.width,
                height: self.height,
            },
        )
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, PixelError> {
        let mut bytes = Vec::new();
        self.to_image()?
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
        Ok(bytes)
    }
}
