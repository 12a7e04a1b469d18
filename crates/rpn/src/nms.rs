//! Non-Maximum Suppression.
//!
//! Region proposal networks produce many overlapping proposals for every object. Non-Maximum
//! Suppression (NMS) removes the duplicates: candidates are visited in order of descending score,
//! and a candidate is accepted unless it overlaps an already accepted one by more than the IoU
//! threshold.
//!
//! The result is fully determined by the input: equal scores are visited in order of their index.

use ndarray::ArrayView2;
use rpn_boxes::{bbox, num::cmp_desc};

use crate::boxlist::{BoxList, Field};
use crate::Error;

/// Greedy IoU-based non-maximum suppression.
#[derive(Debug, Clone, Copy)]
pub struct NonMaxSuppression {
    iou_thresh: f32,
    max_keep: Option<usize>,
}

impl NonMaxSuppression {
    /// The default intersection-over-union threshold above which proposals are suppressed.
    pub const DEFAULT_IOU_THRESH: f32 = 0.7;

    /// Creates a suppressor using [`Self::DEFAULT_IOU_THRESH`] and no limit on kept boxes.
    pub fn new() -> Self {
        Self {
            iou_thresh: Self::DEFAULT_IOU_THRESH,
            max_keep: None,
        }
    }

    /// Sets the intersection-over-union threshold above which a box counts as a duplicate.
    pub fn set_iou_thresh(&mut self, iou_thresh: f32) {
        self.iou_thresh = iou_thresh;
    }

    /// Stops after `max_keep` boxes have been accepted. `None` keeps every surviving box.
    pub fn set_max_keep(&mut self, max_keep: Option<usize>) {
        self.max_keep = max_keep;
    }

    pub fn iou_thresh(&self) -> f32 {
        self.iou_thresh
    }

    pub fn max_keep(&self) -> Option<usize> {
        self.max_keep
    }

    /// Performs non-maximum suppression on `boxes`, ranked by the `f32` column `field`.
    pub fn process(&self, boxes: &BoxList, field: Field) -> Result<Suppression, Error> {
        let scores = boxes.f32_field(field)?;
        let xyxy = boxes.xyxy();
        Ok(self.process_raw(xyxy.view(), scores))
    }

    /// Performs non-maximum suppression on raw `[N, 4]` corner-corner boxes.
    ///
    /// # Panics
    ///
    /// Panics if `scores` does not have one entry per box.
    pub fn process_raw(&self, boxes: ArrayView2<'_, f32>, scores: &[f32]) -> Suppression {
        assert_eq!(boxes.nrows(), scores.len(), "need exactly one score per box");

        let coords: Vec<[f32; 4]> = boxes
            .outer_iter()
            .map(|r| [r[0], r[1], r[2], r[3]])
            .collect();
        let areas: Vec<f32> = coords.iter().map(bbox::area).collect();

        // Sort worst-first so that the best remaining candidate can be popped off the back.
        let mut candidates: Vec<usize> = (0..scores.len()).collect();
        candidates.sort_unstable_by(|&a, &b| cmp_desc(scores, b, a));

        let mut out = Suppression::default();
        while let Some(seed) = candidates.pop() {
            if self.max_keep.map_or(false, |max| out.kept.len() >= max) {
                candidates.push(seed);
                candidates.reverse();
                out.truncated = candidates;
                break;
            }

            candidates.retain(|&other| {
                let iou =
                    bbox::iou_with_areas(&coords[seed], areas[seed], &coords[other], areas[other]);
                if iou > self.iou_thresh {
                    out.suppressed.push(other);
                    false
                } else {
                    true
                }
            });
            out.kept.push(seed);
        }

        out
    }
}

impl Default for NonMaxSuppression {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a [`NonMaxSuppression`] run, as indices into the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Suppression {
    /// Accepted boxes, highest score first.
    pub kept: Vec<usize>,
    /// Boxes rejected because they overlap an accepted box.
    pub suppressed: Vec<usize>,
    /// Boxes never visited because the keep limit was reached, highest score first.
    pub truncated: Vec<usize>,
}

impl Suppression {
    /// Iterates over every rejected box, whether suppressed or truncated.
    pub fn rejected(&self) -> impl Iterator<Item = usize> + '_ {
        self.suppressed.iter().chain(&self.truncated).copied()
    }
}

/// Runs NMS on `boxes` and returns the accepted boxes, best first, in the input's mode.
///
/// `on_keep` is invoked with the accepted indices before they are applied.
pub fn boxlist_nms(
    boxes: &BoxList,
    nms: &NonMaxSuppression,
    field: Field,
    on_keep: impl FnOnce(&[usize]),
) -> Result<BoxList, Error> {
    let suppression = nms.process(boxes, field)?;
    on_keep(&suppression.kept);
    Ok(boxes.select(&suppression.kept))
}
