use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, SessionError};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an [`ImageBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Buffers are shared between the timeline, the preview slot, the worker and
/// the view cache without copying pixels.
pub type SharedImage = Arc<ImageBuffer>;

/// An immutable, interleaved 8-bit pixel grid.
///
/// Every transform produces a fresh buffer with a fresh identity; there is no
/// way to mutate pixels after construction.
#[derive(PartialEq, Eq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    channels: u8,
    pixels: Box<[u8]>,
    id: BufferId,
}

impl ImageBuffer {
    pub fn new(width: u32, height: u32, channels: u8, pixels: Vec<u8>) -> Result<Self> {
        if !matches!(channels, 1 | 3 | 4) {
            return Err(SessionError::InvalidBuffer(format!(
                "unsupported channel count {channels}"
            )));
        }
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected {
            return Err(SessionError::InvalidBuffer(format!(
                "expected {expected} bytes for {width}x{height}x{channels}, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            pixels: pixels.into_boxed_slice(),
            id: BufferId::next(),
        })
    }

    /// A buffer with every byte set to `value`.
    pub fn filled(width: u32, height: u32, channels: u8, value: u8) -> Result<Self> {
        let len = width as usize * height as usize * channels as usize;
        Self::new(width, height, channels, vec![value; len])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Pixel at `(x, y)` as a channel slice.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let stride = self.channels as usize;
        let start = (y as usize * self.width as usize + x as usize) * stride;
        self.pixels.get(start..start + stride)
    }

    /// Compares dimensions and pixels, ignoring identity.
    pub fn same_content(&self, other: &ImageBuffer) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.channels == other.channels
            && self.pixels == other.pixels
    }

    pub fn into_shared(self) -> SharedImage {
        Arc::new(self)
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ImageBuffer;

    #[test]
    fn rejects_mismatched_pixel_block() {
        assert!(ImageBuffer::new(2, 2, 3, vec![0; 11]).is_err());
        assert!(ImageBuffer::new(2, 2, 2, vec![0; 8]).is_err());
        assert!(ImageBuffer::new(2, 2, 4, vec![0; 16]).is_ok());
    }

    #[test]
    fn identities_are_unique_but_content_can_match() {
        let a = ImageBuffer::filled(3, 1, 1, 9).expect("a");
        let b = ImageBuffer::filled(3, 1, 1, 9).expect("b");
        assert_ne!(a.id(), b.id());
        assert!(a.same_content(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn pixel_lookup_respects_bounds() {
        let img = ImageBuffer::new(2, 1, 3, vec![1, 2, 3, 4, 5, 6]).expect("img");
        assert_eq!(img.pixel(1, 0), Some(&[4, 5, 6][..]));
        assert_eq!(img.pixel(2, 0), None);
    }
}
