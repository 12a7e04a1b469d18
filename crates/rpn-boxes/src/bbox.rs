//! Bounding box types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ImageSize;

/// How the four coordinates of a box are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoxMode {
    /// `[x1, y1, x2, y2]`: top-left and bottom-right corner.
    Xyxy,
    /// `[x, y, w, h]`: top-left corner and size.
    Xywh,
}

impl BoxMode {
    /// Converts raw coordinates from mode `self` to mode `to`.
    #[inline]
    pub fn convert(self, coords: [f32; 4], to: BoxMode) -> [f32; 4] {
        let [a, b, c, d] = coords;
        match (self, to) {
            (BoxMode::Xyxy, BoxMode::Xywh) => [a, b, c - a, d - b],
            (BoxMode::Xywh, BoxMode::Xyxy) => [a, b, a + c, b + d],
            _ => coords,
        }
    }
}

impl fmt::Display for BoxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoxMode::Xyxy => "xyxy",
            BoxMode::Xywh => "xywh",
        })
    }
}

/// An axis-aligned box with an explicit [`BoxMode`].
///
/// Boxes may have zero width and/or height. Such boxes have an area of 0 and an IoU of 0 with
/// every other box.
#[derive(Clone, Copy, PartialEq)]
pub struct BBox {
    coords: [f32; 4],
    mode: BoxMode,
}

impl BBox {
    #[inline]
    pub fn new(coords: [f32; 4], mode: BoxMode) -> Self {
        Self { coords, mode }
    }

    #[inline]
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new([x1, y1, x2, y2], BoxMode::Xyxy)
    }

    #[inline]
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self::new([x, y, w, h], BoxMode::Xywh)
    }

    /// Returns the raw coordinates, interpreted according to [`BBox::mode`].
    #[inline]
    pub fn coords(&self) -> [f32; 4] {
        self.coords
    }

    #[inline]
    pub fn mode(&self) -> BoxMode {
        self.mode
    }

    /// Returns the same box, represented in `mode`.
    #[must_use]
    pub fn convert(&self, mode: BoxMode) -> Self {
        Self::new(self.mode.convert(self.coords, mode), mode)
    }

    /// Returns the `[x1, y1, x2, y2]` corner coordinates of this box.
    #[inline]
    pub fn xyxy(&self) -> [f32; 4] {
        self.mode.convert(self.coords, BoxMode::Xyxy)
    }

    #[inline]
    pub fn width(&self) -> f32 {
        match self.mode {
            BoxMode::Xyxy => self.coords[2] - self.coords[0],
            BoxMode::Xywh => self.coords[2],
        }
    }

    #[inline]
    pub fn height(&self) -> f32 {
        match self.mode {
            BoxMode::Xyxy => self.coords[3] - self.coords[1],
            BoxMode::Xywh => self.coords[3],
        }
    }

    #[inline]
    pub fn area(&self) -> f32 {
        area(&self.xyxy())
    }

    /// Computes the Intersection over Union (IOU) of `self` and `other`.
    pub fn iou(&self, other: &Self) -> f32 {
        iou(&self.xyxy(), &other.xyxy())
    }

    /// Clamps all coordinates of this box into the area covered by an image of size `size`.
    ///
    /// Boxes lying completely outside of the image end up with zero width or height.
    #[must_use]
    pub fn clip(&self, size: ImageSize) -> Self {
        Self::new(clip(self.xyxy(), size), BoxMode::Xyxy).convert(self.mode)
    }
}

impl fmt::Debug for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.coords;
        write!(f, "BBox[{}] ({a},{b},{c},{d})", self.mode)
    }
}

/// Area of a corner-corner box. Inverted boxes count as empty.
#[inline]
pub fn area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

/// Area of the intersection of two corner-corner boxes.
#[inline]
pub fn intersection_area(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let w = a[2].min(b[2]) - a[0].max(b[0]);
    let h = a[3].min(b[3]) - a[1].max(b[1]);
    w.max(0.0) * h.max(0.0)
}

/// Intersection over Union of two corner-corner boxes.
///
/// Returns 0.0 if either box has zero area.
#[inline]
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    iou_with_areas(a, area(a), b, area(b))
}

/// Like [`iou`], but with precomputed box areas.
#[inline]
pub fn iou_with_areas(a: &[f32; 4], area_a: f32, b: &[f32; 4], area_b: f32) -> f32 {
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }
    let inter = intersection_area(a, b);
    inter / (area_a + area_b - inter)
}

/// Clamps corner-corner coordinates into `[0, width] x [0, height]`.
#[inline]
pub fn clip(b: [f32; 4], size: ImageSize) -> [f32; 4] {
    let w = size.width() as f32;
    let h = size.height() as f32;
    [
        b[0].clamp(0.0, w),
        b[1].clamp(0.0, h),
        b[2].clamp(0.0, w),
        b[3].clamp(0.0, h),
    ]
}
