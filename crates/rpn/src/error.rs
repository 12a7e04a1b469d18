use rpn_boxes::{BoxMode, ImageSize};

use crate::boxlist::Field;
use crate::tensor::Device;

/// Precondition violations detected by the proposal pipeline.
///
/// All of these are configuration or wiring errors: they are detected up front, before any
/// per-image work is done, and abort processing of the whole batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("head output has {channels} channels, which is not a multiple of {per_anchor}")]
    ChannelLayout { channels: usize, per_anchor: usize },

    #[error("box regression predicts {regression} anchors per location, objectness predicts {objectness}")]
    AnchorsPerLocation { objectness: usize, regression: usize },

    #[error("{what} covers {got} images, expected {expected}")]
    BatchSize {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("box regression is {regression:?} (HxW), objectness is {objectness:?}")]
    SpatialSize {
        objectness: (usize, usize),
        regression: (usize, usize),
    },

    #[error("image {image} has {got} anchors on level {level}, expected {expected}")]
    AnchorCount {
        image: usize,
        level: usize,
        expected: usize,
        got: usize,
    },

    #[error("no pyramid levels were given")]
    NoLevels,

    #[error("{what} expects {expected} pyramid levels, got {got}")]
    LevelCount {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{what} is on device {found}, expected {expected}")]
    DeviceMismatch {
        what: &'static str,
        expected: Device,
        found: Device,
    },

    #[error("box array must have 4 columns, got {0}")]
    BoxColumns(usize),

    #[error("box list has no field `{0}`")]
    MissingField(Field),

    #[error("field `{field}` has the wrong element type")]
    FieldType { field: Field },

    #[error("field `{field}` has {got} entries, box list has {expected}")]
    FieldLength {
        field: Field,
        expected: usize,
        got: usize,
    },

    #[error("cannot concatenate box lists: field sets differ ({expected:?} vs {got:?})")]
    FieldSet { expected: Vec<Field>, got: Vec<Field> },

    #[error("cannot concatenate box lists of image sizes {expected:?} and {got:?}")]
    SizeMismatch { expected: ImageSize, got: ImageSize },

    #[error("cannot concatenate box lists in modes {expected} and {got}")]
    ModeMismatch { expected: BoxMode, got: BoxMode },

    #[error("cannot concatenate an empty sequence of box lists")]
    EmptyConcat,
}
