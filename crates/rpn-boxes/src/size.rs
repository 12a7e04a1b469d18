use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of an image, in pixels.
///
/// Boxes clipped to an image of this size lie within `[0, width] x [0, height]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    height: u32,
    width: u32,
}

impl ImageSize {
    #[inline]
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }
}

impl fmt::Debug for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
