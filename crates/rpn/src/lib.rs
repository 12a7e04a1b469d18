//! Region proposal post-processing for two-stage object detectors.
//!
//! A Region Proposal Network (RPN) scores a dense grid of anchor boxes on every level of a feature
//! pyramid and predicts a refinement for each of them. This crate turns those raw outputs into a
//! few hundred or thousand ranked, deduplicated proposals per image, which are then handed to the
//! detection head. The entry point is [`proposal::RpnPostProcessor`].
//!
//! # Layout of network outputs
//!
//! Head outputs are `[N, C, H, W]` arrays ([`tensor::FeatureMap`]). For `A` anchors per location,
//! objectness has `C = A` channels and box regression has `C = A * 4`, where channel `a * 4 + c`
//! holds coordinate `c` of anchor `a`. Anchors of a level must be listed location-major: the
//! anchor at index `(h * W + w) * A + a` belongs to location `(h, w)`.
//!
//! # Environment Variables
//!
//! * `RUST_LOG`: overrides the log levels set by [`init_logger!`].

pub mod box_coder;
pub mod boxlist;
pub mod checkpoint;
pub mod config;
pub mod dump;
pub mod gather;
pub mod iter;
pub mod nms;
pub mod proposal;
pub mod results;
pub mod tensor;
pub mod timer;
pub mod topk;

mod error;

use log::LevelFilter;

pub use error::Error;
pub use rpn_boxes::{BBox, BoxMode, ImageSize};

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_CRATE_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and this crate will log at *trace*
/// level. Otherwise, they will log at *debug* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
