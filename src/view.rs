//! Display-side renditions of the working image.
//!
//! Scaled and cropped views are derived from a source buffer and memoized in
//! an [`LruCache`] that the memory monitor can shrink under pressure.

use image::imageops::FilterType;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::codec;
use crate::common::lru::LruCache;
use crate::error::{Result, SessionError};
use crate::session::{BufferId, SharedImage};
use crate::settings::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersect with a `width`×`height` image, or `None` if nothing is left.
    pub fn clamp_to(self, width: u32, height: u32) -> Option<Rect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        (w > 0 && h > 0).then(|| Rect::new(self.x, self.y, w, h))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Scale factor in thousandths.
    Scale(u32),
    Region(Rect),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub source: BufferId,
    pub kind: ArtifactKind,
}

pub type ArtifactCache = Mutex<LruCache<ArtifactKey, SharedImage>>;

/// Renders and caches views; the last requested key stays pinned.
///
/// Renditions larger than `max_dimensions` are refused.
pub struct ViewRenderer {
    cache: Arc<ArtifactCache>,
    max_dimensions: (u32, u32),
}

impl ViewRenderer {
    pub fn new(capacity: usize, max_dimensions: (u32, u32)) -> Self {
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
            max_dimensions,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.view_cache_capacity, config.max_image_dimensions)
    }

    /// Handle for registering the cache with the memory monitor.
    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn cached_len(&self) -> usize {
        self.lock().len()
    }

    pub fn scaled(&self, source: &SharedImage, scale: f32) -> Result<SharedImage> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(SessionError::InvalidBuffer(format!(
                "scale {scale} must be positive"
            )));
        }
        let permille = (f64::from(scale) * 1000.0).round().max(1.0);
        if permille > f64::from(u32::MAX) {
            return Err(SessionError::InvalidBuffer(format!("scale {scale} is too large")));
        }
        let permille = permille as u32;
        let width = scaled_dimension(source.width(), permille);
        let height = scaled_dimension(source.height(), permille);
        let (max_width, max_height) = self.max_dimensions;
        if width > u64::from(max_width) || height > u64::from(max_height) {
            return Err(SessionError::InvalidBuffer(format!(
                "scaled view {width}x{height} exceeds the {max_width}x{max_height} limit"
            )));
        }
        let (width, height) = (width as u32, height as u32);

        let key = ArtifactKey {
            source: source.id(),
            kind: ArtifactKind::Scale(permille),
        };
        self.render(key, || {
            if permille == 1000 {
                return Ok(source.clone());
            }
            let dynamic = codec::to_dynamic(source)?;
            let resized = dynamic.resize_exact(width, height, FilterType::Triangle);
            Ok(codec::from_dynamic(resized)?.into_shared())
        })
    }

    /// Crop `rect` out of `source`; the rectangle is clamped to the image.
    pub fn region(&self, source: &SharedImage, rect: Rect) -> Result<SharedImage> {
        let Some(clamped) = rect.clamp_to(source.width(), source.height()) else {
            return Err(SessionError::InvalidBuffer(format!(
                "region {rect:?} lies outside the {}x{} image",
                source.width(),
                source.height()
            )));
        };
        let key = ArtifactKey {
            source: source.id(),
            kind: ArtifactKind::Region(clamped),
        };
        self.render(key, || {
            let dynamic = codec::to_dynamic(source)?;
            let cropped = dynamic.crop_imm(clamped.x, clamped.y, clamped.width, clamped.height);
            Ok(codec::from_dynamic(cropped)?.into_shared())
        })
    }

    fn render<F>(&self, key: ArtifactKey, build: F) -> Result<SharedImage>
    where
        F: FnOnce() -> Result<SharedImage>,
    {
        {
            let mut cache = self.lock();
            if let Some(hit) = cache.get(&key) {
                cache.pin(key);
                return Ok(hit);
            }
        }
        let rendered = build()?;
        let mut cache = self.lock();
        cache.put(key, rendered.clone());
        cache.pin(key);
        tracing::debug!(?key, cached = cache.len(), "rendered view");
        Ok(rendered)
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<ArtifactKey, SharedImage>> {
        self.cache.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("view cache lock poisoned; continuing with inner state");
            poisoned.into_inner()
        })
    }
}

fn scaled_dimension(size: u32, permille: u32) -> u64 {
    ((u64::from(size) * u64::from(permille) + 500) / 1000).max(1)
}
