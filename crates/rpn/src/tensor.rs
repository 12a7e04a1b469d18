//! Dense network outputs and the device they live on.
//!
//! The pipeline consumes raw network outputs as 4-dimensional `f32` arrays in `NCHW` layout. Each
//! array is tagged with the [`Device`] that produced it, so that mixing up outputs of different
//! devices is caught before any computation happens instead of producing garbage proposals.

use std::fmt;

use ndarray::{Array2, Array3, Array4, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::Error;

/// A compute device that owns tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    /// An accelerator, identified by its ordinal.
    Accelerator(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(i) => write!(f, "accel:{i}"),
        }
    }
}

/// One `[N, C, H, W]` output of a network head for a single pyramid level.
#[derive(Debug, Clone)]
pub struct FeatureMap {
    data: Array4<f32>,
    device: Device,
}

impl FeatureMap {
    /// Wraps a CPU-resident array.
    pub fn new(data: Array4<f32>) -> Self {
        Self::on(data, Device::Cpu)
    }

    pub fn on(data: Array4<f32>, device: Device) -> Self {
        Self { data, device }
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    #[inline]
    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    /// Returns the `(N, C, H, W)` dimensions of this map.
    #[inline]
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }
}

/// Flattens a `[N, A * C, H, W]` head output into `[N, H * W * A, C]`.
///
/// Row `(h * W + w) * A + a` of image `n` holds the `C` values predicted for anchor `a` at feature
/// map location `(h, w)`, which is the order anchors are generated in.
pub fn permute_and_flatten(layer: ArrayView4<'_, f32>, channels: usize) -> Result<Array3<f32>, Error> {
    let (n, ac, h, w) = layer.dim();
    if channels == 0 || ac % channels != 0 {
        return Err(Error::ChannelLayout { channels: ac, per_anchor: channels });
    }
    let a = ac / channels;

    Ok(Array3::from_shape_fn((n, h * w * a, channels), |(img, row, c)| {
        let (loc, anchor) = (row / a, row % a);
        layer[[img, anchor * channels + c, loc / w, loc % w]]
    }))
}

/// Flattens a `[N, A, H, W]` objectness output into per-image score rows of shape `[N, H * W * A]`.
pub fn flatten_scores(layer: ArrayView4<'_, f32>) -> Array2<f32> {
    let (n, a, h, w) = layer.dim();
    Array2::from_shape_fn((n, h * w * a), |(img, row)| {
        let (loc, anchor) = (row / a, row % a);
        layer[[img, anchor, loc / w, loc % w]]
    })
}
