//! Bounding box geometry for region proposal pipelines.
//!
//! # Overview
//!
//! A [`BBox`] is four numbers describing an axis-aligned rectangle, tagged with the [`BoxMode`]
//! that says how to interpret them:
//!
//! * [`BoxMode::Xyxy`]: `[x1, y1, x2, y2]`, the top-left and bottom-right corners.
//! * [`BoxMode::Xywh`]: `[x, y, w, h]`, the top-left corner and the box size.
//!
//! Coordinates are continuous. A box spanning `x1..x2` has width `x2 - x1`, and an image of size
//! `W x H` covers the coordinate range `[0, W] x [0, H]`.
//!
//! The free functions in [`bbox`] operate on raw `[f32; 4]` corner-corner coordinates and are used
//! by the hot loops of the proposal pipeline, which store boxes as rows of a dense array.

pub mod bbox;
pub mod num;

mod size;

pub use bbox::{BBox, BoxMode};
pub use size::ImageSize;
